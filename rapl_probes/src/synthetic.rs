//! Deterministic energy counters, for tests and benchmarks on machines without RAPL.

use std::collections::VecDeque;

use crate::{CounterReading, CounterSource, DomainId, SamplingError};

/// A fake energy counter per domain, advancing by a fixed step at every read
/// and wrapping around like a hardware counter.
pub struct SyntheticSource {
    domains: Vec<DomainId>,
    counters: Vec<SyntheticCounter>,
    uj_per_unit: f64,
    reads: u64,
}

struct SyntheticCounter {
    value: u64,
    step: u64,
    max_raw: u64,
    /// Values returned by the next reads, before going back to stepping
    scripted: VecDeque<u64>,
    /// Error returned by the next read, if any
    failure: Option<SamplingError>,
}

impl SyntheticCounter {
    fn advance(&mut self) {
        let room = self.max_raw - self.value;
        self.value = if self.step > room {
            self.step - room - 1
        } else {
            self.value + self.step
        };
    }
}

impl SyntheticSource {
    /// Creates a source whose counters all start at `start` and grow by `step`
    /// raw units per read, wrapping after `max_raw`. The unit is 1 uJ.
    pub fn new(domains: &[DomainId], start: u64, step: u64, max_raw: u64) -> SyntheticSource {
        assert!(start <= max_raw, "start value {start} above the counter range {max_raw}");
        let counters = domains
            .iter()
            .map(|_| SyntheticCounter {
                value: start,
                step,
                max_raw,
                scripted: VecDeque::new(),
                failure: None,
            })
            .collect();
        SyntheticSource {
            domains: domains.to_vec(),
            counters,
            uj_per_unit: 1.0,
            reads: 0,
        }
    }

    pub fn with_unit(mut self, uj_per_unit: f64) -> SyntheticSource {
        self.uj_per_unit = uj_per_unit;
        self
    }

    /// The next reads of `domain` will return `values`, in order.
    pub fn script(&mut self, domain: DomainId, values: impl IntoIterator<Item = u64>) {
        if let Some(c) = self.counter_mut(domain) {
            c.scripted.extend(values);
        }
    }

    /// The next read of `domain` will fail with `err`.
    pub fn fail_next(&mut self, domain: DomainId, err: SamplingError) {
        if let Some(c) = self.counter_mut(domain) {
            c.failure = Some(err);
        }
    }

    /// Total number of counter reads performed so far.
    pub fn reads(&self) -> u64 {
        self.reads
    }

    fn counter_mut(&mut self, domain: DomainId) -> Option<&mut SyntheticCounter> {
        let i = self.domains.iter().position(|d| *d == domain)?;
        Some(&mut self.counters[i])
    }
}

impl CounterSource for SyntheticSource {
    fn domains(&self) -> &[DomainId] {
        &self.domains
    }

    fn read_counter(&mut self, domain: DomainId) -> Result<CounterReading, SamplingError> {
        let unit = self.uj_per_unit;
        let c = self
            .counter_mut(domain)
            .ok_or_else(|| SamplingError::Unsupported(format!("no synthetic counter for {domain}")))?;
        if let Some(err) = c.failure.take() {
            return Err(err);
        }
        let raw = match c.scripted.pop_front() {
            Some(v) => v,
            None => {
                let v = c.value;
                c.advance();
                v
            }
        };
        let max_raw = c.max_raw;
        self.reads += 1;
        Ok(CounterReading::new(raw, max_raw, unit))
    }
}
