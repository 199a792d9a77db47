use std::{fmt, fs, num::ParseIntError, time::Instant};

use clap::ValueEnum;
use enum_map::Enum;

mod error;
pub mod synthetic;

#[cfg(target_os = "linux")]
pub mod msr;
#[cfg(target_os = "linux")]
pub mod perf_event;
#[cfg(target_os = "linux")]
pub mod powercap;

pub use error::SamplingError;

#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum)]
pub enum RaplDomainType {
    /// entire socket
    Package,
    /// power plane 0: core
    PP0,
    /// power plane 1: uncore
    PP1,
    ///  DRAM
    Dram,
    /// psys
    Platform,
}

impl RaplDomainType {
    pub fn name(self) -> &'static str {
        match self {
            RaplDomainType::Package => "package",
            RaplDomainType::PP0 => "pp0",
            RaplDomainType::PP1 => "pp1",
            RaplDomainType::Dram => "dram",
            RaplDomainType::Platform => "platform",
        }
    }
}

impl fmt::Display for RaplDomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One independent energy counter: a RAPL domain on a given socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DomainId {
    pub socket: u32,
    pub domain: RaplDomainType,
}

impl DomainId {
    pub fn new(socket: u32, domain: RaplDomainType) -> DomainId {
        DomainId { socket, domain }
    }

    pub fn package(socket: u32) -> DomainId {
        DomainId::new(socket, RaplDomainType::Package)
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.domain, self.socket)
    }
}

/// A point-in-time value of an energy counter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CounterReading {
    /// The raw value of the counter. The energy unit has not been applied yet.
    pub raw: u64,

    /// The largest raw value the counter can hold before wrapping to zero.
    pub max_raw: u64,

    // NOTE: the unit is a power of two for MSR and perf_event, so multiplying
    // by it does not lose precision in a f64.
    /// Multiplier that converts raw counter units to micro-Joules.
    pub uj_per_unit: f64,

    /// When the counter was read.
    pub at: Instant,
}

impl CounterReading {
    pub fn new(raw: u64, max_raw: u64, uj_per_unit: f64) -> CounterReading {
        CounterReading {
            raw,
            max_raw,
            uj_per_unit,
            at: Instant::now(),
        }
    }

    /// Returns `true` if the counter has wrapped around between `start` and `self`.
    pub fn wrapped_since(&self, start: &CounterReading) -> bool {
        self.raw < start.raw
    }

    /// Computes the energy consumed between `start` and `self`, in micro-Joules.
    ///
    /// ## Overflows
    ///
    /// At most one overflow can be corrected: we cannot know how many occured.
    /// A decreasing counter is accepted as a wrap-around only if it went back by
    /// more than half of its range, which is what happens when a counter close to
    /// its maximum restarts from zero. Smaller backward steps are reported as
    /// [`SamplingError::CounterAnomaly`].
    pub fn energy_since(&self, start: &CounterReading, domain: DomainId) -> Result<u64, SamplingError> {
        let anomaly = || SamplingError::CounterAnomaly {
            domain,
            start: start.raw,
            end: self.raw,
        };
        if start.raw > start.max_raw || self.raw > self.max_raw {
            return Err(anomaly());
        }

        let diff = if self.raw >= start.raw {
            self.raw - start.raw
        } else if start.raw - self.raw > self.max_raw / 2 {
            // cannot overflow: self.raw < start.raw <= max_raw
            (self.max_raw - start.raw) + self.raw + 1
        } else {
            return Err(anomaly());
        };
        Ok((diff as f64 * self.uj_per_unit).round() as u64)
    }
}

/// A set of energy counters that can be read on demand.
pub trait CounterSource: Send {
    /// The counters this source has been opened on, in reading order.
    fn domains(&self) -> &[DomainId];

    /// Reads the current value of one counter.
    ///
    /// This must be fast and must never block: no retry is attempted on failure.
    fn read_counter(&mut self, domain: DomainId) -> Result<CounterReading, SamplingError>;

    /// Reads every counter, in the order of [`CounterSource::domains`], into `out`.
    ///
    /// `out` must have exactly one slot per domain. Nothing is allocated.
    fn read_all(&mut self, out: &mut [CounterReading]) -> Result<(), SamplingError> {
        debug_assert_eq!(out.len(), self.domains().len());
        for (i, slot) in out.iter_mut().enumerate() {
            let domain = self.domains()[i];
            *slot = self.read_counter(domain)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuId {
    pub cpu: u32,
    pub socket: u32,
}

/// Retrieves the CPUs to monitor (one per socket) in order
/// to get RAPL perf counters.
pub fn cpus_to_monitor() -> anyhow::Result<Vec<CpuId>> {
    let mask = fs::read_to_string("/sys/devices/power/cpumask")?;
    let cpus_and_sockets = parse_cpu_and_socket_list(&mask)?;
    Ok(cpus_and_sockets)
}

/// Checks that the list contains one cpu per socket, and at least one cpu.
pub fn check_socket_cpus(cpus: &[CpuId]) -> anyhow::Result<()> {
    if cpus.is_empty() {
        return Err(anyhow::anyhow!("at least one cpu is required to read the RAPL counters"));
    }
    for (i, c) in cpus.iter().enumerate() {
        if cpus[..i].iter().any(|other| other.socket == c.socket) {
            return Err(anyhow::anyhow!("more than one cpu for socket {}: {cpus:?}", c.socket));
        }
    }
    Ok(())
}

fn parse_cpu_and_socket_list(cpulist: &str) -> anyhow::Result<Vec<CpuId>> {
    let cpus = parse_cpu_list(cpulist);

    // here we assume that /sys/devices/power/cpumask returns one cpu per socket
    let cpus_and_sockets = cpus?
        .into_iter()
        .enumerate()
        .map(|(i, cpu)| CpuId { cpu, socket: i as u32 })
        .collect();

    Ok(cpus_and_sockets)
}

fn parse_cpu_list(cpulist: &str) -> anyhow::Result<Vec<u32>> {
    // handles "n" or "start-end"
    fn parse_cpulist_item(item: &str) -> anyhow::Result<Vec<u32>> {
        let bounds: Vec<u32> = item
            .split('-')
            .map(str::parse)
            .collect::<Result<Vec<u32>, ParseIntError>>()?;

        match bounds.as_slice() {
            &[start, end] => Ok((start..=end).collect()),
            &[n] => Ok(vec![n]),
            _ => Err(anyhow::anyhow!("invalid cpulist: {}", item)),
        }
    }

    // this can be "0,64" or "0-1" or maybe "0-1,64-66"
    let cpus: Vec<u32> = cpulist
        .trim_end()
        .split(',')
        .map(parse_cpulist_item)
        .collect::<anyhow::Result<Vec<Vec<u32>>>>()?
        .into_iter() // not the same as iter() !
        .flatten()
        .collect();

    Ok(cpus)
}
