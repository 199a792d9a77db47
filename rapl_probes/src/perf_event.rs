use anyhow::{Context, Result};
use log::debug;
use perf_event_open_sys as sys;
use std::{
    fs::{self, File},
    io::{self, Read},
    os::fd::FromRawFd,
    path::Path,
    time::Instant,
};

use crate::{CounterReading, CounterSource, CpuId, DomainId, RaplDomainType, SamplingError};

// See https://github.com/torvalds/linux/commit/4788e5b4b2338f85fa42a712a182d8afd65d7c58
// for an explaination of the RAPL PMU driver.

pub(crate) const PERF_MAX_ENERGY: u64 = u64::MAX;

#[derive(Debug)]
pub struct PowerEvent {
    /// The name of the power event, as reported by the sysfs. This corresponds to a RAPL **domain name**, like "pkg".
    pub name: String,
    /// The RAPL domain type, as an enum.
    pub domain: RaplDomainType,
    /// The event code to use as a "config" field for perf_event_open
    pub code: u8,
    /// should be "Joules"
    pub unit: String,
    /// The scale to apply in order to get joules (`energy_j = count * scale`).
    /// Should be "0x1.0p-32" (thus, f32 is fine)
    pub scale: f32,
}

impl PowerEvent {
    /// Make a system call to [perf_event_open](https://www.man7.org/linux/man-pages/man2/perf_event_open.2.html)
    /// with `attr.config = self.code` and `attr.type = pmu_type`.
    ///
    /// # Arguments
    /// * `pmu_type` - The type of the RAPL PMU, given by [`pmu_type()`].
    /// * `cpu_id` - Defines which CPU (core) to monitor, given by [`super::cpus_to_monitor()`]
    ///
    pub fn perf_event_open(&self, pmu_type: u32, cpu_id: u32) -> std::io::Result<i32> {
        // Only some combination of (pid, cpu) are valid.
        // For RAPL PMU events, we use (-1, cpu) which means "all processes, one cpu".
        let pid = -1; // all processes
        let cpu = cpu_id as i32;

        let mut attr = sys::bindings::perf_event_attr::default();
        attr.config = self.code.into();
        attr.type_ = pmu_type;
        attr.size = core::mem::size_of_val(&attr) as u32;
        debug!("{attr:?}");

        let result = unsafe { sys::perf_event_open(&mut attr, pid, cpu, -1, 0) };
        if result == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(result)
        }
    }
}

/// Retrieves the type of the RAPL PMU (Power Monitoring Unit) in the Linux kernel.
pub fn pmu_type() -> Result<u32> {
    let path = Path::new("/sys/devices/power/type");
    let read = fs::read_to_string(path).with_context(|| format!("Failed to read {path:?}"))?;
    let typ = read
        .trim_end()
        .parse()
        .with_context(|| format!("Failed to parse {path:?}: '{read}'"))?;
    Ok(typ)
}

/// Retrieves all RAPL power events exposed in sysfs.
/// There can be more than just `cores`, `pkg` and `dram`.
/// For instance, there can be `gpu` and
/// [`psys`](https://patchwork.kernel.org/project/linux-pm/patch/1458253409-13318-1-git-send-email-srinivas.pandruvada@linux.intel.com/).
pub fn all_power_events() -> Result<Vec<PowerEvent>> {
    all_power_events_at(Path::new("/sys/devices/power/events"))
}

/// Same as [`all_power_events`], in a directory with the layout of `/sys/devices/power/events`.
pub fn all_power_events_at(dir: &Path) -> Result<Vec<PowerEvent>> {
    let mut events: Vec<PowerEvent> = Vec::new();

    fn read_event_code(path: &Path) -> Result<u8> {
        let read = fs::read_to_string(path)?;
        let code_str = read
            .trim_end()
            .strip_prefix("event=0x")
            .with_context(|| format!("Failed to strip {path:?}: '{read}'"))?;
        let code = u8::from_str_radix(code_str, 16).with_context(|| format!("Failed to parse {path:?}: '{read}'"))?; // hexadecimal
        Ok(code)
    }

    fn read_event_unit(main: &Path) -> Result<String> {
        let mut path = main.to_path_buf();
        path.set_extension("unit");
        let unit_str = fs::read_to_string(path)?.trim_end().to_string();
        Ok(unit_str)
    }

    fn read_event_scale(main: &Path) -> Result<f32> {
        let mut path = main.to_path_buf();
        path.set_extension("scale");
        let read = fs::read_to_string(&path)?;
        let scale = read
            .trim_end()
            .parse()
            .with_context(|| format!("Failed to parse {path:?}: '{read}'"))?;
        Ok(scale)
    }

    fn parse_event_name(name: &str) -> Option<RaplDomainType> {
        match name {
            "cores" => Some(RaplDomainType::PP0),
            "gpu" => Some(RaplDomainType::PP1),
            "psys" => Some(RaplDomainType::Platform),
            "pkg" => Some(RaplDomainType::Package),
            "ram" => Some(RaplDomainType::Dram),
            _ => None,
        }
    }

    // Find all the events
    for e in fs::read_dir(dir).with_context(|| format!("Failed to list {dir:?}"))? {
        let entry = e?;
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().to_string();
        // only list the main file, not *.unit nor *.scale
        if path.is_file() && !file_name.contains('.') {
            // The files are named "energy-pkg", "energy-dram", ...
            if let Some(event_name) = file_name.strip_prefix("energy-") {
                let Some(domain) = parse_event_name(event_name) else {
                    log::warn!("Ignoring unknown RAPL perf event {event_name}");
                    continue;
                };
                // We have the name of the event, we can read all the info
                let name = event_name.to_owned();
                let code = read_event_code(&path)?;
                let unit = read_event_unit(&path)?;
                let scale = read_event_scale(&path)?;
                events.push(PowerEvent {
                    name,
                    domain,
                    code,
                    unit,
                    scale,
                })
            }
        }
    }
    events.sort_by_key(|e| e.domain as u8);
    Ok(events)
}

/// Energy source based on perf_event for intel RAPL.
pub struct PerfEventSource {
    /// Ready-to-use power events with additional metadata
    events: Vec<OpenedPowerEvent>,

    /// Same order as `events`
    domains: Vec<DomainId>,
}

struct OpenedPowerEvent {
    fd: File,
    /// Multiplier from the raw count to microJoules
    uj_per_unit: f64,
}

impl PerfEventSource {
    pub fn new(socket_cpus: &[CpuId], events: &[&PowerEvent]) -> Result<PerfEventSource, SamplingError> {
        crate::check_socket_cpus(socket_cpus).map_err(SamplingError::from_discovery)?;
        if events.is_empty() {
            return Err(SamplingError::Unsupported(
                "at least one power event is required for the perf_event source".to_owned(),
            ));
        }
        let pmu_type = pmu_type().map_err(SamplingError::from_discovery)?;

        let mut opened = Vec::with_capacity(socket_cpus.len() * events.len());
        let mut domains = Vec::with_capacity(opened.capacity());
        for CpuId { cpu, socket } in socket_cpus {
            for event in events {
                let raw_fd = event
                    .perf_event_open(pmu_type, *cpu)
                    .map_err(|e| SamplingError::from_io(&e, format!("perf_event_open energy-{} on cpu {cpu}", event.name)))?;
                let fd = unsafe { File::from_raw_fd(raw_fd) };
                opened.push(OpenedPowerEvent {
                    fd,
                    uj_per_unit: event.scale as f64 * 1e6,
                });
                domains.push(DomainId::new(*socket, event.domain));
            }
        }
        Ok(PerfEventSource { events: opened, domains })
    }

    fn read_event(&mut self, index: usize) -> Result<CounterReading, SamplingError> {
        let evt = &mut self.events[index];
        let raw = read_perf_event(&mut evt.fd).map_err(|e| {
            SamplingError::from_io(&e, format!("failed to read perf_event for domain {}", self.domains[index]))
        })?;
        Ok(CounterReading {
            raw,
            max_raw: PERF_MAX_ENERGY,
            uj_per_unit: evt.uj_per_unit,
            at: Instant::now(),
        })
    }
}

impl CounterSource for PerfEventSource {
    fn domains(&self) -> &[DomainId] {
        &self.domains
    }

    fn read_counter(&mut self, domain: DomainId) -> Result<CounterReading, SamplingError> {
        let i = self
            .domains
            .iter()
            .position(|d| *d == domain)
            .ok_or_else(|| SamplingError::Unsupported(format!("perf event {domain} has not been opened")))?;
        self.read_event(i)
    }

    fn read_all(&mut self, out: &mut [CounterReading]) -> Result<(), SamplingError> {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.read_event(i)?;
        }
        Ok(())
    }
}

fn read_perf_event(fd: &mut File) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    // rewind() is INVALID for perf events, we must read "at the cursor" every time
    fd.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::all_power_events_at;
    use crate::RaplDomainType;

    #[test]
    fn test_parse_power_events() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let events = dir.path();
        for (name, code) in [("pkg", "0x02"), ("cores", "0x01"), ("ram", "0x03"), ("fancy", "0x09")] {
            fs::write(events.join(format!("energy-{name}")), format!("event={code}\n"))?;
            fs::write(events.join(format!("energy-{name}.unit")), "Joules\n")?;
            fs::write(events.join(format!("energy-{name}.scale")), "2.3283064365386962890625e-10\n")?;
        }

        let parsed = all_power_events_at(events)?;
        let domains: Vec<RaplDomainType> = parsed.iter().map(|e| e.domain).collect();
        assert_eq!(domains, vec![RaplDomainType::Package, RaplDomainType::PP0, RaplDomainType::Dram]);

        let pkg = &parsed[0];
        assert_eq!(pkg.name, "pkg");
        assert_eq!(pkg.code, 2);
        assert_eq!(pkg.unit, "Joules");
        assert_eq!(pkg.scale, 0.5_f32.powi(32));
        Ok(())
    }
}
