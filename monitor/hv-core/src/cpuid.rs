//! Virtual CPUID
//!
//! Native CPUID values, filtered to hide the features that are not virtualized.

use vmx::bitmaps::Cr4Flags;

use crate::arch::CpuidResult;
use crate::error::HvError;
use crate::platform::Platform;
use crate::vcpu::Vcpu;

const CPUID_ECX_VMX: u32 = 1 << 5;
const CPUID_ECX_OSXSAVE: u32 = 1 << 27;
const CPUID_ECX_HYPERVISOR: u32 = 1 << 31;

const CPUID_EBX_MPX: u32 = 1 << 14;
const CPUID_ECX_PKU: u32 = 1 << 3;
const CPUID_ECX_OSPKE: u32 = 1 << 4;
const CPUID_ECX_WAITPKG: u32 = 1 << 5;

/// XSAVE state components 3 and 4 (MPX bound registers).
const XSAVE_MPX_STATE: u32 = (1 << 3) | (1 << 4);

/// Returns the CPUID values reported to the guest.
pub fn guest_cpuid<P: Platform>(
    vcpu: &mut Vcpu<'_, P>,
    leaf: u32,
    subleaf: u32,
) -> Result<CpuidResult, HvError> {
    let mut res = vcpu.platform().cpuid(leaf, subleaf);
    let vcpu_id = vcpu.id() as u32;

    match leaf {
        0x1 => {
            // Initial APIC ID in EBX[31:24]
            res.ebx = (res.ebx & 0x00ff_ffff) | (vcpu_id << 24);
            res.ecx &= !CPUID_ECX_VMX;
            res.ecx |= CPUID_ECX_HYPERVISOR;
            if vcpu.get_cr4()? & Cr4Flags::OSXSAVE.bits() != 0 {
                res.ecx |= CPUID_ECX_OSXSAVE;
            } else {
                res.ecx &= !CPUID_ECX_OSXSAVE;
            }
        }
        0x7 if subleaf == 0 => {
            res.ebx &= !CPUID_EBX_MPX;
            res.ecx &= !(CPUID_ECX_PKU | CPUID_ECX_OSPKE | CPUID_ECX_WAITPKG);
        }
        0xb | 0x1f => {
            // x2APIC ID
            res.edx = vcpu_id;
        }
        0xd if subleaf == 0 => {
            res.eax &= !XSAVE_MPX_STATE;
        }
        _ => {}
    }

    log::trace!(
        "vCPU {}: cpuid {:#x}.{:#x} -> {:x?}",
        vcpu.id(),
        leaf,
        subleaf,
        res
    );
    Ok(res)
}
