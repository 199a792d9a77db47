use log::{info, warn};
use rapl_probes::{CounterSource, SamplingError};

use crate::{
    config::{Config, DomainSelection, ProbeType},
    output::ResultSink,
    session::{MeasurementResult, Session},
};

/// The process-wide measurement context: an opened counter source, the session
/// state machine, and the last results.
///
/// The FFI layer owns exactly one of these. Everything it needs is allocated
/// when it is created, so that `begin_session` and `end_session` do not allocate
/// around the measured workload. Writing the results somewhere is up to the caller.
pub struct SamplingCore {
    source: Box<dyn CounterSource>,
    session: Session,
    last_results: Vec<MeasurementResult>,
    last_error: Option<SamplingError>,
}

/// Opens the counter source and the output described by `config`.
pub fn open(config: &Config) -> Result<(SamplingCore, ResultSink), SamplingError> {
    let source = open_source(config.probe, &config.domains)?;
    let sink = ResultSink::open(config.output, &config.csv_path).map_err(|e| {
        SamplingError::from_io(&e, format!("{:?} output {}", config.output, config.csv_path.display()))
    })?;
    info!(
        "Measuring {} with the {} probe, output: {:?}",
        mkstring(source.domains(), ", "),
        config.probe,
        config.output
    );
    Ok((SamplingCore::new(source), sink))
}

impl SamplingCore {
    pub fn new(source: Box<dyn CounterSource>) -> SamplingCore {
        let session = Session::new(&*source);
        let n_domains = session.domains().len();
        SamplingCore {
            source,
            session,
            last_results: Vec::with_capacity(n_domains),
            last_error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    /// Results of the last call to [`SamplingCore::end_session`]. Empty if it failed.
    pub fn last_results(&self) -> &[MeasurementResult] {
        &self.last_results
    }

    /// Error of the last call to `begin_session` or `end_session`, `None` if it succeeded.
    pub fn last_error(&self) -> Option<&SamplingError> {
        self.last_error.as_ref()
    }

    pub fn begin_session(&mut self) -> Result<(), SamplingError> {
        let res = self.session.begin(&mut *self.source);
        self.record(res)
    }

    pub fn end_session(&mut self) -> Result<&[MeasurementResult], SamplingError> {
        self.last_results.clear();
        let res = match self.session.end(&mut *self.source) {
            Ok(results) => {
                self.last_results.extend_from_slice(results);
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.record(res)?;
        Ok(&self.last_results)
    }

    fn record(&mut self, res: Result<(), SamplingError>) -> Result<(), SamplingError> {
        match res {
            Ok(()) => {
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                warn!("{e}");
                self.last_error = Some(e.clone());
                Err(e)
            }
        }
    }
}

/// Discovers the RAPL interface of `probe` and opens the counters of the selected domains.
#[cfg(target_os = "linux")]
pub fn open_source(probe: ProbeType, domains: &DomainSelection) -> Result<Box<dyn CounterSource>, SamplingError> {
    use rapl_probes::{msr, perf_event, powercap, RaplDomainType};

    fn check_found(domains: &DomainSelection, found: &[RaplDomainType], probe: ProbeType) -> Result<(), SamplingError> {
        if let DomainSelection::Only(wanted) = domains {
            if let Some(missing) = wanted.iter().find(|d| !found.contains(*d)) {
                return Err(SamplingError::Unsupported(format!(
                    "RAPL domain {missing} is not available with the {probe} probe (available: {})",
                    mkstring(found, ", ")
                )));
            }
        }
        Ok(())
    }

    let source: Box<dyn CounterSource> = match probe {
        ProbeType::PowercapSysfs => {
            let zones = powercap::all_power_zones().map_err(SamplingError::from_discovery)?;
            let available: Vec<RaplDomainType> = zones.flat.iter().map(|z| z.domain).collect();
            check_found(domains, &available, probe)?;

            let selected: Vec<&powercap::PowerZone> =
                zones.flat.iter().filter(|z| domains.contains(z.domain)).collect();
            Box::new(powercap::PowercapSource::new(&selected)?)
        }
        ProbeType::PerfEvent => {
            let socket_cpus = rapl_probes::cpus_to_monitor().map_err(SamplingError::from_discovery)?;
            let events = perf_event::all_power_events().map_err(SamplingError::from_discovery)?;
            let available: Vec<RaplDomainType> = events.iter().map(|e| e.domain).collect();
            check_found(domains, &available, probe)?;

            let selected: Vec<&perf_event::PowerEvent> = events.iter().filter(|e| domains.contains(e.domain)).collect();
            Box::new(perf_event::PerfEventSource::new(&socket_cpus, &selected)?)
        }
        ProbeType::Msr => {
            let socket_cpus = rapl_probes::cpus_to_monitor().map_err(SamplingError::from_discovery)?;
            let vendor = msr::cpu_vendor().map_err(SamplingError::from_discovery)?;
            let available = msr::all_domains(vendor);
            check_found(domains, &available, probe)?;

            let selected: Vec<RaplDomainType> = available.into_iter().filter(|d| domains.contains(*d)).collect();
            // registers of the vendor table may be missing on this model
            match domains {
                DomainSelection::All => Box::new(msr::MsrSource::available(&socket_cpus, &selected)?),
                DomainSelection::Only(_) => Box::new(msr::MsrSource::new(&socket_cpus, &selected)?),
            }
        }
    };
    Ok(source)
}

#[cfg(not(target_os = "linux"))]
pub fn open_source(probe: ProbeType, _domains: &DomainSelection) -> Result<Box<dyn CounterSource>, SamplingError> {
    Err(SamplingError::Unsupported(format!(
        "the {probe} probe is only available on Linux"
    )))
}

/// Takes a slice of elements that can be converted to strings, converts them and joins them all.
fn mkstring<A: ToString>(elems: &[A], sep: &str) -> String {
    elems.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(sep)
}
