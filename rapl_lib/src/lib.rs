//! Energy measurement library for cross-language micro-benchmarks.
//!
//! A harness calls [`ffi::start_rapl`] before running its workload and [`ffi::stop_rapl`] after it.
//! The library reads the RAPL energy counters at both points and computes, for each monitored
//! domain, the energy consumed and the time elapsed in between.
//!
//! The library is configured through environment variables, see [`config`].

pub mod config;
pub mod ffi;
pub mod output;
pub mod sampling;
pub mod session;

pub use rapl_probes::{CounterReading, CounterSource, DomainId, RaplDomainType, SamplingError};
pub use sampling::SamplingCore;
pub use session::{MeasurementResult, Session, SessionState};
