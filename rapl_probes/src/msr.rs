// According to Intel 64 and IA-32 architectures software developer's manual, volume 3B,
// MSR_PKG_ENERGY_STATUS reports the measured energy usage of the package.

use std::{
    fs::File,
    io,
    os::unix::prelude::FileExt,
    process::{Command, Stdio},
    sync::Arc,
    time::Instant,
};

use anyhow::{anyhow, Context};
use enum_map::EnumMap;
use regex::Regex;

use crate::{CounterReading, CounterSource, CpuId, DomainId, RaplDomainType, SamplingError};

type Addr = u64;

/// MSR registers' addresses for Intel RAPL domains
mod intel {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0x00000606;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0x00000611;
    pub const MSR_PP0_ENERGY_STATUS: Addr = 0x00000639;
    pub const MSR_PP1_ENERGY_STATUS: Addr = 0x00000641;
    pub const MSR_DRAM_ENERGY_STATUS: Addr = 0x00000619;
    pub const MSR_PLATFORM_ENERGY_STATUS: Addr = 0x0000064D;
}

/// MSR registers' addresses for AMD RAPL domains
mod amd {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0xc0010299;
    pub const MSR_CORE_ENERGY_STATUS: Addr = 0xc001029a;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0xc001029b;
}

/// Mask to apply when reading the energy values
const MSR_ENERGY_MASK: u64 = 0xffffffff;

/// Maximum value of the MSR counter.
/// Note that this technically depends on the exact hardware, but for our purposes it's good enough.
const MSR_MAX_ENERGY: u64 = u32::MAX as u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaplVendor {
    Intel,
    Amd,
}

/// Reads the RAPL MSR values (via /dev/cpu/<cpu_id>/msr for one CPU per socket).
pub struct MsrSource {
    /// One register to read per monitored domain
    registers: Vec<RaplMsrRegister>,

    /// Same order as `registers`
    domains: Vec<DomainId>,
}

struct RaplMsrRegister {
    /// File descriptor to the MSR device of one cpu (shared by all the domains of a socket)
    fd: Arc<File>,
    addr: Addr,
    /// RAPL energy unit, in microJoules
    uj_per_unit: f64,
}

impl MsrSource {
    /// Opens the energy registers of `domains` on every socket.
    /// Fails if one of them cannot be read.
    pub fn new(cpus: &[CpuId], domains: &[RaplDomainType]) -> Result<MsrSource, SamplingError> {
        MsrSource::open(cpus, domains, true)
    }

    /// Opens the energy registers of `domains` that this CPU implements, and skips the others.
    pub fn available(cpus: &[CpuId], domains: &[RaplDomainType]) -> Result<MsrSource, SamplingError> {
        MsrSource::open(cpus, domains, false)
    }

    fn open(cpus: &[CpuId], domains: &[RaplDomainType], all_required: bool) -> Result<MsrSource, SamplingError> {
        crate::check_socket_cpus(cpus).map_err(SamplingError::from_discovery)?;
        if domains.is_empty() {
            return Err(SamplingError::Unsupported(
                "at least one RAPL domain is required for the msr source".to_owned(),
            ));
        }
        let vendor = cpu_vendor().map_err(SamplingError::from_discovery)?;
        let addresses = domain_msr_addresses(vendor);
        if let Some(d) = domains.iter().find(|d| addresses[**d].is_none()) {
            return Err(SamplingError::Unsupported(format!(
                "RAPL domain {d} does not exist in {vendor:?} MSRs"
            )));
        }

        let mut registers = Vec::with_capacity(cpus.len() * domains.len());
        let mut ids = Vec::with_capacity(registers.capacity());
        for CpuId { socket, cpu } in cpus {
            let path = format!("/dev/cpu/{cpu}/msr");
            let fd = File::open(&path).map_err(|e| SamplingError::from_io(&e, &path))?;
            let energy_unit = read_energy_unit(&fd, vendor).map_err(|e| SamplingError::from_io(&e, &path))?;

            // some registers of the vendor table are missing on many models (PP1 and psys on servers)
            let readable = readable_domains(domains, &addresses, all_required, |addr| read_msr(&fd, addr))?;
            let fd = Arc::new(fd);
            for (d, addr) in readable {
                registers.push(RaplMsrRegister {
                    fd: fd.clone(),
                    addr,
                    uj_per_unit: energy_unit as f64 * 1e6,
                });
                ids.push(DomainId::new(*socket, d));
            }
        }
        if registers.is_empty() {
            return Err(SamplingError::Unsupported(
                "none of the requested RAPL domains can be read through MSRs".to_owned(),
            ));
        }

        Ok(MsrSource {
            registers,
            domains: ids,
        })
    }

    fn read_register(&self, index: usize) -> Result<CounterReading, SamplingError> {
        let RaplMsrRegister { fd, addr, uj_per_unit } = &self.registers[index];
        let msr_value = read_msr(fd, *addr).map_err(|e| {
            SamplingError::from_io(&e, format!("failed to read MSR {addr:#x} for domain {}", self.domains[index]))
        })?;
        Ok(CounterReading {
            raw: msr_value & MSR_ENERGY_MASK,
            max_raw: MSR_MAX_ENERGY,
            uj_per_unit: *uj_per_unit,
            at: Instant::now(),
        })
    }
}

impl CounterSource for MsrSource {
    fn domains(&self) -> &[DomainId] {
        &self.domains
    }

    fn read_counter(&mut self, domain: DomainId) -> Result<CounterReading, SamplingError> {
        let i = self
            .domains
            .iter()
            .position(|d| *d == domain)
            .ok_or_else(|| SamplingError::Unsupported(format!("MSR of {domain} has not been opened")))?;
        self.read_register(i)
    }

    fn read_all(&mut self, out: &mut [CounterReading]) -> Result<(), SamplingError> {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.read_register(i)?;
        }
        Ok(())
    }
}

fn read_msr(msr: &File, at: Addr) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    msr.read_exact_at(&mut buf, at)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Selects the `domains` whose energy register can be read with `read`, with their address.
///
/// An unreadable register is skipped, or is an error if `all_required` is set.
fn readable_domains(
    domains: &[RaplDomainType],
    addresses: &EnumMap<RaplDomainType, Option<Addr>>,
    all_required: bool,
    mut read: impl FnMut(Addr) -> io::Result<u64>,
) -> Result<Vec<(RaplDomainType, Addr)>, SamplingError> {
    let mut readable = Vec::with_capacity(domains.len());
    for d in domains {
        let Some(addr) = addresses[*d] else {
            return Err(SamplingError::Unsupported(format!("RAPL domain {d} has no MSR")));
        };
        match read(addr) {
            Ok(_) => readable.push((*d, addr)),
            Err(e) if all_required => {
                return Err(SamplingError::Unsupported(format!(
                    "MSR {addr:#x} of RAPL domain {d} cannot be read: {e}"
                )))
            }
            Err(e) => log::info!("Skipping RAPL domain {d}, its MSR {addr:#x} cannot be read: {e}"),
        }
    }
    Ok(readable)
}

/// Extract the energy unit from the Model Specific Register `msr`.
///
/// # Wrong values
///
/// Note that the returned energy unit may not apply for all measurements,
/// because some architectures use a different unit for some domains (e.g. DRAM).
/// This is platform-dependent, and I do not wish to implement all of them here.
///
/// See [Linux source code - rapl.c](https://github.com/torvalds/linux/blob/0036fb00a756a2f6e360d44e2e3d2200a8afbc9b/arch/x86/events/rapl.c#L612)
///
fn read_energy_unit(msr: &File, vendor: RaplVendor) -> io::Result<f32> {
    let offset = match vendor {
        RaplVendor::Intel => intel::MSR_RAPL_POWER_UNIT,
        RaplVendor::Amd => amd::MSR_RAPL_POWER_UNIT,
    };
    let msr_value = read_msr(msr, offset)?;
    Ok(energy_unit_from_power_unit(msr_value))
}

fn energy_unit_from_power_unit(msr_value: u64) -> f32 {
    // According to the Intel Software Developer manual, the value we're interested in is
    // "energy status unit" at bits 12:8 (mask 0x1F00)
    let esu = (msr_value & 0x1F00) >> 8;

    // The energy unit, aka "multiplier", is 1/(2^esu) = (1/2)^esu
    // This means that when we read an energy value from MSR, the actual value is
    // `msr_value * multiplier` Joules.
    0.5_f32.powi(esu as i32)
}

pub fn cpu_vendor() -> anyhow::Result<RaplVendor> {
    // run: LC_ALL=C lscpu
    let child = Command::new("lscpu")
        .env("LC_ALL", "C")
        .stdout(Stdio::piped())
        .spawn()
        .context("lscpu should be executable")?;
    let finished = child.wait_with_output()?;
    let stdout = std::str::from_utf8(&finished.stdout)?;
    parse_lscpu_vendor(stdout)
}

fn parse_lscpu_vendor(lscpu_output: &str) -> anyhow::Result<RaplVendor> {
    // find the Vendor ID
    let vendor_regex = Regex::new(r"Vendor ID:\s+(\w+)")?;
    let vendor = vendor_regex
        .captures(lscpu_output)
        .and_then(|c| c.get(1))
        .context("vendor id not found in lscpu output")?
        .as_str()
        .trim();

    // turn it into the right enum variant
    match vendor {
        "AuthenticAMD" | "HygonGenuine" => Ok(RaplVendor::Amd),
        "GenuineIntel" => Ok(RaplVendor::Intel),
        _ => Err(anyhow!("Unsupported CPU vendor {vendor}")),
    }
}

/// The MSR address of each RAPL domain, `None` if the vendor does not expose it.
pub fn domain_msr_addresses(vendor: RaplVendor) -> EnumMap<RaplDomainType, Option<Addr>> {
    match vendor {
        RaplVendor::Intel => enum_map::enum_map! {
            RaplDomainType::Package => Some(intel::MSR_PKG_ENERGY_STATUS),
            RaplDomainType::PP0 => Some(intel::MSR_PP0_ENERGY_STATUS),
            RaplDomainType::PP1 => Some(intel::MSR_PP1_ENERGY_STATUS),
            RaplDomainType::Dram => Some(intel::MSR_DRAM_ENERGY_STATUS),
            RaplDomainType::Platform => Some(intel::MSR_PLATFORM_ENERGY_STATUS),
        },
        RaplVendor::Amd => enum_map::enum_map! {
            RaplDomainType::Package => Some(amd::MSR_PKG_ENERGY_STATUS),
            RaplDomainType::PP0 => Some(amd::MSR_CORE_ENERGY_STATUS),
            RaplDomainType::PP1 => None,
            RaplDomainType::Dram => None,
            RaplDomainType::Platform => None,
        },
    }
}

pub fn all_domains(vendor: RaplVendor) -> Vec<RaplDomainType> {
    domain_msr_addresses(vendor)
        .iter()
        .filter_map(|(d, addr)| addr.is_some().then_some(d))
        .collect()
}
