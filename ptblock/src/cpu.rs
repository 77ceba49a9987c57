//! Working out which CPU a trace is decoded for.

use crate::{
    engine::{Cpu, CpuVendor},
    errors::PtBlockError,
};
use core::arch::x86_64::__cpuid;
use std::str::FromStr;

/// Which CPU to configure the decoder for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CpuSelection {
    /// Ask the engine for the CPU we are running on.
    Auto,
    /// Decode for a specific CPU.
    Fixed(Cpu),
}

impl FromStr for CpuSelection {
    type Err = PtBlockError;

    /// Parse `auto` or `<family>/<model>[/<stepping>]` (the syntax of `ptxed --cpu`). Numbers may
    /// be decimal or `0x`-prefixed hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "auto" {
            return Ok(Self::Auto);
        }
        let bad = |why: String| PtBlockError::Config(format!("Invalid CPU '{s}': {why}"));
        let parts = s.split('/').collect::<Vec<_>>();
        let (family, model, stepping) = match parts[..] {
            [f, m] => (f, m, "0"),
            [f, m, st] => (f, m, st),
            _ => {
                return Err(bad(
                    "must be `auto` or of the format `<family>/<model>[/<stepping>]`".into(),
                ))
            }
        };
        Ok(Self::Fixed(Cpu {
            vendor: CpuVendor::Intel,
            family: parse_num(family).map_err(bad)?,
            model: parse_num(model).map_err(bad)?,
            stepping: parse_num(stepping).map_err(bad)?,
        }))
    }
}

fn parse_num<T>(s: &str) -> Result<T, String>
where
    T: TryFrom<u64>,
{
    let v = match s.strip_prefix("0x") {
        Some(h) => u64::from_str_radix(h, 16),
        None => s.parse::<u64>(),
    }
    .map_err(|e| format!("'{s}': {e}"))?;
    T::try_from(v).map_err(|_| format!("'{s}' is out of range"))
}

/// Read the identity of the CPU we are running on.
// `__cpuid` is only `unsafe` on older compilers.
#[allow(unused_unsafe)]
pub fn read_cpu() -> Cpu {
    let leaf0 = unsafe { __cpuid(0) };
    let mut vendor_str = [0u8; 12];
    vendor_str[0..4].copy_from_slice(&leaf0.ebx.to_le_bytes());
    vendor_str[4..8].copy_from_slice(&leaf0.edx.to_le_bytes());
    vendor_str[8..12].copy_from_slice(&leaf0.ecx.to_le_bytes());
    let vendor = if &vendor_str == b"GenuineIntel" {
        CpuVendor::Intel
    } else {
        CpuVendor::Unknown
    };

    let leaf1 = unsafe { __cpuid(1) };
    identify(vendor, leaf1.eax)
}

/// Decode the family, model and stepping from the `eax` value of `cpuid` leaf 1.
fn identify(vendor: CpuVendor, eax: u32) -> Cpu {
    let stepping = (eax & 0xf) as u8;
    let mut model = ((eax >> 4) & 0xf) as u8;
    let mut family = ((eax >> 8) & 0xf) as u16;
    if family == 0xf {
        family += ((eax >> 20) & 0xff) as u16;
    }
    if family == 0x6 || family >= 0xf {
        model += (((eax >> 16) & 0xf) << 4) as u8;
    }
    Cpu {
        vendor,
        family,
        model,
        stepping,
    }
}
