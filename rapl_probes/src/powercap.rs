// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.

use std::{
    fs::{self, File},
    os::unix::prelude::FileExt,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::Context;

use crate::{CounterReading, CounterSource, DomainId, RaplDomainType, SamplingError};

pub const POWERCAP_RAPL_PATH: &str = "/sys/devices/virtual/powercap/intel-rapl";
const POWER_ZONE_PREFIX: &str = "intel-rapl";
const POWERCAP_UJ_PER_UNIT: f64 = 1.0; // energy_uj is already in microJoules

/// Hierarchy of power zones
pub struct PowerZoneHierarchy {
    /// All the zones in the same Vec.
    pub flat: Vec<PowerZone>,
    /// The top zones. To access their children, use [PowerZone::children].
    pub top: Vec<PowerZone>,
}

/// A power zone.
#[derive(Debug, Clone)]
pub struct PowerZone {
    /// The name of the zone, as returned by powercap, for instance `package-0` or `core`.
    pub name: String,

    /// The RAPL domain type, as an enum
    pub domain: RaplDomainType,

    /// The path of the zone in sysfs, for instance
    /// `/sys/devices/virtual/powercap/intel-rapl/intel-rapl:0`.
    ///
    /// Note that in the above path, `intel-rapl` is the "control type"
    /// and "intel-rapl:0" is the power zone.
    pub path: PathBuf,

    /// The sub-zones (can be empty).
    pub children: Vec<PowerZone>,

    /// The id of the socket that "contains" this zone, if applicable (psys has no socket)
    pub socket_id: Option<u32>,
}

impl PowerZone {
    pub fn energy_path(&self) -> PathBuf {
        self.path.join("energy_uj")
    }

    pub fn max_energy_path(&self) -> PathBuf {
        self.path.join("max_energy_range_uj")
    }

    /// The counter identifier of this zone. psys is attributed to socket 0.
    pub fn domain_id(&self) -> DomainId {
        DomainId::new(self.socket_id.unwrap_or(0), self.domain)
    }
}

/// Discovers all the RAPL power zones in the powercap sysfs.
pub fn all_power_zones() -> anyhow::Result<PowerZoneHierarchy> {
    all_power_zones_at(Path::new(POWERCAP_RAPL_PATH))
}

/// Discovers the RAPL power zones below `root`, which has the layout of the powercap sysfs.
pub fn all_power_zones_at(root: &Path) -> anyhow::Result<PowerZoneHierarchy> {
    fn parse_zone_name(name: &str) -> Option<RaplDomainType> {
        match name {
            "psys" => Some(RaplDomainType::Platform),
            "core" => Some(RaplDomainType::PP0),
            "uncore" => Some(RaplDomainType::PP1),
            "dram" => Some(RaplDomainType::Dram),
            _ if name.starts_with("package-") => Some(RaplDomainType::Package),
            _ => None,
        }
    }

    /// Recursively explore a power zone
    fn explore_rec(dir: &Path, parent_socket: Option<u32>, flat: &mut Vec<PowerZone>) -> anyhow::Result<Vec<PowerZone>> {
        let mut zones = Vec::new();
        for e in fs::read_dir(dir).with_context(|| format!("read_dir {}", dir.display()))? {
            let entry = e?;
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().to_string();

            if path.is_dir() && file_name.starts_with(POWER_ZONE_PREFIX) {
                let name_path = path.join("name");
                let name = fs::read_to_string(&name_path)
                    .with_context(|| format!("read {}", name_path.display()))?
                    .trim()
                    .to_owned();
                let socket_id = {
                    if let Some(parent_id) = parent_socket {
                        Some(parent_id)
                    } else if let Some(id_str) = name.strip_prefix("package-") {
                        let id: u32 = id_str
                            .parse()
                            .with_context(|| format!("Failed to extract package id from '{name}'"))?;
                        Some(id)
                    } else {
                        None
                    }
                };
                let Some(domain) = parse_zone_name(&name) else {
                    log::warn!("Ignoring unknown RAPL powercap zone {name}");
                    continue;
                };
                let children = explore_rec(&path, socket_id, flat)?; // recursively explore
                let zone = PowerZone {
                    name,
                    domain,
                    path,
                    children,
                    socket_id,
                };
                zones.push(zone.clone());
                flat.push(zone);
            }
        }
        zones.sort_by_key(|z| z.path.to_string_lossy().to_string());
        Ok(zones)
    }
    let mut flat = Vec::new();
    let top = explore_rec(root, None, &mut flat)?;
    flat.sort_by_key(|z| z.path.to_string_lossy().to_string());
    Ok(PowerZoneHierarchy { flat, top })
}

/// Reads the RAPL counters through the powercap sysfs (`energy_uj` files).
pub struct PowercapSource {
    /// Ready-to-use powercap zones with additional metadata
    zones: Vec<OpenedZone>,

    /// Same order as `zones`
    domains: Vec<DomainId>,
}

/// The content of `energy_uj` never exceeds the size of `max_energy_range_uj`,
/// which is 16 bytes on all our test machines.
const ENERGY_BUF_SIZE: usize = 32;

struct OpenedZone {
    file: File,
    path: PathBuf,
    /// The maximum energy value for this zone, as reported by `max_energy_range_uj`
    max_energy_uj: u64,
}

impl PowercapSource {
    pub fn new(zones: &[&PowerZone]) -> Result<PowercapSource, SamplingError> {
        if zones.is_empty() {
            return Err(SamplingError::Unsupported(
                "at least one power zone is required for the powercap source".to_owned(),
            ));
        }

        let mut opened = Vec::with_capacity(zones.len());
        let mut domains = Vec::with_capacity(zones.len());

        for zone in zones {
            let path = zone.energy_path();
            let file = File::open(&path).map_err(|e| SamplingError::from_io(&e, path.display()))?;

            let max_path = zone.max_energy_path();
            let str_max_energy_uj =
                fs::read_to_string(&max_path).map_err(|e| SamplingError::from_io(&e, max_path.display()))?;
            let max_energy_uj = str_max_energy_uj
                .trim_end()
                .parse()
                .map_err(|e| SamplingError::Unsupported(format!("parse max_energy_range_uj '{str_max_energy_uj}': {e}")))?;

            let id = zone.domain_id();
            if domains.contains(&id) {
                return Err(SamplingError::Config(format!("power zone {id} selected twice")));
            }
            domains.push(id);
            opened.push(OpenedZone {
                file,
                path,
                max_energy_uj,
            });
        }

        Ok(PowercapSource {
            zones: opened,
            domains,
        })
    }

    fn read_zone(&self, index: usize) -> Result<CounterReading, SamplingError> {
        let zone = &self.zones[index];
        let mut buf = [0u8; ENERGY_BUF_SIZE];

        // one pread from the beginning of the file, sysfs returns the whole value at once
        let n = zone
            .file
            .read_at(&mut buf, 0)
            .map_err(|e| SamplingError::from_io(&e, zone.path.display()))?;
        let at = Instant::now();

        let content = std::str::from_utf8(&buf[..n])
            .map_err(|e| SamplingError::Unavailable(format!("{}: {e}", zone.path.display())))?;
        let raw: u64 = content
            .trim_end()
            .parse()
            .map_err(|e| SamplingError::Unavailable(format!("failed to parse {}: '{content}': {e}", zone.path.display())))?;

        log::debug!("read {} value {raw}", self.domains[index]);
        Ok(CounterReading {
            raw,
            max_raw: zone.max_energy_uj,
            uj_per_unit: POWERCAP_UJ_PER_UNIT,
            at,
        })
    }
}

impl CounterSource for PowercapSource {
    fn domains(&self) -> &[DomainId] {
        &self.domains
    }

    fn read_counter(&mut self, domain: DomainId) -> Result<CounterReading, SamplingError> {
        let i = self
            .domains
            .iter()
            .position(|d| *d == domain)
            .ok_or_else(|| SamplingError::Unsupported(format!("power zone {domain} has not been opened")))?;
        self.read_zone(i)
    }

    fn read_all(&mut self, out: &mut [CounterReading]) -> Result<(), SamplingError> {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.read_zone(i)?;
        }
        Ok(())
    }
}
