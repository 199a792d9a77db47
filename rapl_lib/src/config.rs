//! Configuration of the sampling core, read from the environment of the host process.
//!
//! The library is loaded by harnesses written in other languages, which cannot pass
//! arguments to it: every setting comes from a `RAPL_LIB_*` variable.

use std::{fmt::Display, path::PathBuf, str::FromStr};

use clap::ValueEnum;
use rapl_probes::{RaplDomainType, SamplingError};

pub const ENV_PROBE: &str = "RAPL_LIB_PROBE";
pub const ENV_DOMAINS: &str = "RAPL_LIB_DOMAINS";
pub const ENV_OUTPUT: &str = "RAPL_LIB_OUTPUT";
pub const ENV_CSV_PATH: &str = "RAPL_LIB_CSV_PATH";
/// Filter of the logger, in the `env_logger` syntax.
pub const ENV_LOG: &str = "RAPL_LOG";

const DEFAULT_CSV_PATH: &str = "rapl_measurements.csv";

/// How to access RAPL counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeType {
    PowercapSysfs,
    PerfEvent,
    Msr,
}

impl Display for ProbeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            ProbeType::PowercapSysfs => "powercap-sysfs",
            ProbeType::PerfEvent => "perf-event",
            ProbeType::Msr => "msr",
        };
        f.write_str(str)
    }
}

impl FromStr for ProbeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "powercap" | "powercap-sysfs" => Ok(ProbeType::PowercapSysfs),
            "perf" | "perf-event" => Ok(ProbeType::PerfEvent),
            "msr" => Ok(ProbeType::Msr),
            _ => Err(s.to_owned()),
        }
    }
}

/// Where to write the measurements, in addition to the last-result slot.
#[derive(Clone, ValueEnum, Debug, PartialEq, Eq, Copy)]
pub enum OutputType {
    None,
    Stdout,
    Csv,
}

/// The RAPL domains to measure, on every socket where they exist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DomainSelection {
    /// Every domain the probe can find
    All,
    Only(Vec<RaplDomainType>),
}

impl DomainSelection {
    pub fn contains(&self, domain: RaplDomainType) -> bool {
        match self {
            DomainSelection::All => true,
            DomainSelection::Only(list) => list.contains(&domain),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub probe: ProbeType,
    pub domains: DomainSelection,
    pub output: OutputType,
    pub csv_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            probe: ProbeType::PowercapSysfs,
            domains: DomainSelection::Only(vec![RaplDomainType::Package]),
            output: OutputType::Csv,
            csv_path: PathBuf::from(DEFAULT_CSV_PATH),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config, SamplingError> {
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key-value lookup. Missing or empty keys keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, SamplingError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());
        let mut config = Config::default();

        if let Some(probe) = get(ENV_PROBE) {
            config.probe = probe
                .to_ascii_lowercase()
                .parse()
                .map_err(|p| SamplingError::Config(format!("{ENV_PROBE}: unknown probe '{p}'")))?;
        }
        if let Some(domains) = get(ENV_DOMAINS) {
            config.domains = parse_domains(&domains)?;
        }
        if let Some(output) = get(ENV_OUTPUT) {
            config.output = OutputType::from_str(&output, true)
                .map_err(|e| SamplingError::Config(format!("{ENV_OUTPUT}: {e}")))?;
        }
        if let Some(path) = get(ENV_CSV_PATH) {
            config.csv_path = PathBuf::from(path);
        }
        Ok(config)
    }
}

fn parse_domains(list: &str) -> Result<DomainSelection, SamplingError> {
    if list.eq_ignore_ascii_case("all") {
        return Ok(DomainSelection::All);
    }
    let mut domains = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let d = RaplDomainType::from_str(item, true)
            .map_err(|e| SamplingError::Config(format!("{ENV_DOMAINS}: {e}")))?;
        if !domains.contains(&d) {
            domains.push(d);
        }
    }
    if domains.is_empty() {
        return Err(SamplingError::Config(format!("{ENV_DOMAINS}: no domain in '{list}'")));
    }
    Ok(DomainSelection::Only(domains))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, path::PathBuf};

    use rapl_probes::{RaplDomainType, SamplingError};

    use super::{Config, DomainSelection, OutputType, ProbeType};

    fn config_of(vars: &[(&str, &str)]) -> Result<Config, SamplingError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_of(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.probe, ProbeType::PowercapSysfs);
        assert_eq!(config.domains, DomainSelection::Only(vec![RaplDomainType::Package]));
        assert_eq!(config.output, OutputType::Csv);

        // empty values are ignored
        assert_eq!(config_of(&[("RAPL_LIB_PROBE", " ")]).unwrap(), Config::default());
    }

    #[test]
    fn test_parse_all_keys() {
        let config = config_of(&[
            ("RAPL_LIB_PROBE", "perf"),
            ("RAPL_LIB_DOMAINS", "Package, dram,pp0,dram"),
            ("RAPL_LIB_OUTPUT", "STDOUT"),
            ("RAPL_LIB_CSV_PATH", "/tmp/out.csv"),
        ])
        .unwrap();
        assert_eq!(config.probe, ProbeType::PerfEvent);
        assert_eq!(
            config.domains,
            DomainSelection::Only(vec![RaplDomainType::Package, RaplDomainType::Dram, RaplDomainType::PP0])
        );
        assert_eq!(config.output, OutputType::Stdout);
        assert_eq!(config.csv_path, PathBuf::from("/tmp/out.csv"));

        let all = config_of(&[("RAPL_LIB_DOMAINS", "ALL"), ("RAPL_LIB_PROBE", "msr")]).unwrap();
        assert_eq!(all.domains, DomainSelection::All);
        assert!(all.domains.contains(RaplDomainType::Platform));
        assert_eq!(all.probe, ProbeType::Msr);
    }

    #[test]
    fn test_invalid_values() {
        for vars in [
            [("RAPL_LIB_PROBE", "ebpf")],
            [("RAPL_LIB_DOMAINS", "package,gpu")],
            [("RAPL_LIB_DOMAINS", ",,")],
            [("RAPL_LIB_OUTPUT", "file")],
        ] {
            let res = config_of(&vars);
            assert!(matches!(res, Err(SamplingError::Config(_))), "{vars:?} should be rejected");
        }
    }

    #[test]
    fn test_probe_display_roundtrip() {
        for p in [ProbeType::PowercapSysfs, ProbeType::PerfEvent, ProbeType::Msr] {
            assert_eq!(p.to_string().parse::<ProbeType>(), Ok(p));
        }
    }
}
