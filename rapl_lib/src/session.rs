use std::time::{Duration, Instant};

use rapl_probes::{CounterReading, CounterSource, DomainId, SamplingError};

/// The energy consumed by one domain during one session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementResult {
    pub domain: DomainId,
    /// Energy consumed between the two readings, in microJoules.
    pub energy_uj: u64,
    /// Time elapsed between the two readings.
    pub duration: Duration,
    /// `true` if the counter has wrapped around during the session (and has been corrected).
    pub wrapped: bool,
}

impl MeasurementResult {
    pub fn duration_us(&self) -> u64 {
        self.duration.as_micros() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
}

/// The measurement bracket: `Idle -> begin -> Active -> end -> Idle`.
///
/// All the buffers are allocated once, in [`Session::new`]: beginning or ending
/// a session never allocates.
pub struct Session {
    domains: Vec<DomainId>,
    state: SessionState,
    /// Only meaningful when `state` is `Active`
    start: Vec<CounterReading>,
    end: Vec<CounterReading>,
    results: Vec<MeasurementResult>,
}

impl Session {
    /// Creates an idle session for the counters of `source`.
    pub fn new<S: CounterSource + ?Sized>(source: &S) -> Session {
        let domains = source.domains().to_vec();
        let placeholder = CounterReading {
            raw: 0,
            max_raw: 0,
            uj_per_unit: 0.0,
            at: Instant::now(),
        };
        Session {
            start: vec![placeholder; domains.len()],
            end: vec![placeholder; domains.len()],
            results: Vec::with_capacity(domains.len()),
            state: SessionState::Idle,
            domains,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn domains(&self) -> &[DomainId] {
        &self.domains
    }

    /// The readings taken by [`Session::begin`], if the session is active.
    pub fn start_snapshot(&self) -> Option<&[CounterReading]> {
        match self.state {
            SessionState::Active => Some(&self.start),
            SessionState::Idle => None,
        }
    }

    /// Starts the bracket by reading all the counters.
    ///
    /// Fails with [`SamplingError::AlreadyActive`] if a session is already running, in which
    /// case the running session is left untouched. If a counter cannot be read the session stays idle.
    pub fn begin<S: CounterSource + ?Sized>(&mut self, source: &mut S) -> Result<(), SamplingError> {
        if self.state == SessionState::Active {
            return Err(SamplingError::AlreadyActive);
        }
        self.check_source(source)?;
        source.read_all(&mut self.start)?;
        self.state = SessionState::Active;
        Ok(())
    }

    /// Ends the bracket and computes the energy consumed by each domain since [`Session::begin`].
    ///
    /// The session is idle after this call, even on failure: a failed bracket is discarded.
    /// Fails with [`SamplingError::NotActive`] if no session is running.
    pub fn end<S: CounterSource + ?Sized>(&mut self, source: &mut S) -> Result<&[MeasurementResult], SamplingError> {
        if self.state == SessionState::Idle {
            return Err(SamplingError::NotActive);
        }
        let read = source.read_all(&mut self.end);
        self.state = SessionState::Idle;
        self.results.clear();
        read?;

        for ((domain, start), end) in self.domains.iter().zip(&self.start).zip(&self.end) {
            match end.energy_since(start, *domain) {
                Ok(energy_uj) => self.results.push(MeasurementResult {
                    domain: *domain,
                    energy_uj,
                    duration: end.at.saturating_duration_since(start.at),
                    wrapped: end.wrapped_since(start),
                }),
                Err(e) => {
                    self.results.clear();
                    return Err(e);
                }
            }
        }
        Ok(&self.results)
    }

    fn check_source<S: CounterSource + ?Sized>(&self, source: &S) -> Result<(), SamplingError> {
        if source.domains() != self.domains.as_slice() {
            return Err(SamplingError::Config(format!(
                "the session was created for {:?}, not for {:?}",
                self.domains,
                source.domains()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rapl_probes::{synthetic::SyntheticSource, DomainId, RaplDomainType, SamplingError};

    use super::{Session, SessionState};

    #[test]
    fn test_cycle() -> Result<(), SamplingError> {
        let domains = [DomainId::package(0), DomainId::new(0, RaplDomainType::Dram)];
        let mut src = SyntheticSource::new(&domains, 0, 10, u32::MAX as u64);
        let mut session = Session::new(&src);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.start_snapshot().is_none());

        session.begin(&mut src)?;
        assert!(session.is_active());
        assert_eq!(session.start_snapshot().map(|s| s.len()), Some(2));

        let results = session.end(&mut src)?;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].domain, domains[0]);
        assert_eq!(results[0].energy_uj, 10);
        assert_eq!(results[1].domain, domains[1]);
        assert!(!results[1].wrapped);
        assert!(!session.is_active());
        Ok(())
    }

    #[test]
    fn test_misuse() -> Result<(), SamplingError> {
        let pkg = DomainId::package(0);
        let mut src = SyntheticSource::new(&[pkg], 100, 1, u32::MAX as u64);
        let mut session = Session::new(&src);

        assert_eq!(session.end(&mut src).err(), Some(SamplingError::NotActive));
        assert_eq!(src.reads(), 0);

        session.begin(&mut src)?;
        let before = session.start_snapshot().map(|s| s.to_vec());
        assert_eq!(session.begin(&mut src), Err(SamplingError::AlreadyActive));
        assert_eq!(session.start_snapshot().map(|s| s.to_vec()), before);
        assert_eq!(src.reads(), 1);
        Ok(())
    }

    #[test]
    fn test_failed_read_discards_bracket() -> Result<(), SamplingError> {
        let pkg = DomainId::package(0);
        let mut src = SyntheticSource::new(&[pkg], 0, 1, u32::MAX as u64);
        let mut session = Session::new(&src);

        src.fail_next(pkg, SamplingError::Unavailable("busy".into()));
        assert!(matches!(session.begin(&mut src), Err(SamplingError::Unavailable(_))));
        assert!(!session.is_active());

        session.begin(&mut src)?;
        src.fail_next(pkg, SamplingError::Unavailable("busy".into()));
        assert!(matches!(session.end(&mut src), Err(SamplingError::Unavailable(_))));
        assert!(!session.is_active());
        assert_eq!(session.end(&mut src).err(), Some(SamplingError::NotActive));
        Ok(())
    }

    #[test]
    fn test_anomaly_discards_bracket() -> Result<(), SamplingError> {
        let pkg = DomainId::package(0);
        let mut src = SyntheticSource::new(&[pkg], 0, 1, u32::MAX as u64);
        let mut session = Session::new(&src);
        src.script(pkg, [5_000, 4_000]);

        session.begin(&mut src)?;
        let res = session.end(&mut src);
        assert_eq!(
            res.err(),
            Some(SamplingError::CounterAnomaly {
                domain: pkg,
                start: 5_000,
                end: 4_000
            })
        );
        assert!(!session.is_active());
        Ok(())
    }

    #[test]
    fn test_source_mismatch() {
        let src = SyntheticSource::new(&[DomainId::package(0)], 0, 1, 100);
        let mut other = SyntheticSource::new(&[DomainId::package(1)], 0, 1, 100);
        let mut session = Session::new(&src);
        assert!(matches!(session.begin(&mut other), Err(SamplingError::Config(_))));
    }
}
