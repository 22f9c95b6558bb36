//! VMX support
//!
//! Field encodings, exit information and the [VmcsAccess] trait through which the hypervisor core
//! drives a VMCS, be it the hardware one ([ActiveVmcs]) or a [SoftVmcs].
#![cfg_attr(not(test), no_std)]

pub mod bitmaps;
pub mod ept;
pub mod errors;
pub mod fields;
pub mod interrupts;
pub mod msr;
pub mod raw;
mod soft;

use core::arch;
use core::arch::asm;

use bitmaps::exit_qualification::ControlRegisterAccesses;
use bitmaps::{Cr4Flags, EptCapability};
use fields::VmcsField;
pub use soft::SoftVmcs;
pub use utils::{Frame, GuestPhysAddr, HostPhysAddr, HostVirtAddr};

pub use crate::errors::{VmxError, VmxExitReason, VmxInstructionError};
use crate::fields::REGFILE_SIZE;
pub use crate::interrupts::{InterruptionInfo, InterruptionType, Trapnr};

/// CPUID.1:ECX.VMX
const CPUID_ECX_VMX_MASK: u32 = 1 << 5;

// ——————————————————————————————— VMCS Access —————————————————————————————— //

/// Field-level access to a VMCS, and the VM entry primitive.
///
/// The hypervisor core only manipulates a VMCS through this trait: the hardware implementation is
/// [ActiveVmcs], and [SoftVmcs] is a plain register file used when running without VMX.
pub trait VmcsAccess {
    /// Reads a field, fails on fields the implementation does not hold.
    fn get(&self, field: VmcsField) -> Result<usize, VmxError>;

    /// Writes a field. Exit information fields are read-only.
    fn set(&mut self, field: VmcsField, value: usize) -> Result<(), VmxError>;

    /// Whether the VMCS has been launched since its last clear.
    fn is_launched(&self) -> bool;

    /// Puts the VMCS back in the clear state, the next entry will be a launch.
    fn clear(&mut self) -> Result<(), VmxError>;

    /// Enters the guest, launching or resuming depending on the VMCS state, and returns on the
    /// next VM exit.
    ///
    /// SAFETY: the VMCS must be properly configured so that the host can resume execution in a
    /// sensible environment.
    unsafe fn enter(&mut self, regs: &mut [usize; REGFILE_SIZE]) -> Result<(), VmxError>;

    /// Returns the full exit reason, including the entry failure bit.
    fn raw_exit_reason(&self) -> Result<u32, VmxError> {
        Ok(self.get(VmcsField::VmExitReason)? as u32)
    }

    /// Basic exit reason, bits 15:0.
    fn exit_reason(&self) -> Result<VmxExitReason, VmxError> {
        let reason = self.raw_exit_reason()?;
        Ok(VmxExitReason::from_u16(reason as u16))
    }

    fn exit_qualification(&self) -> Result<VmxExitQualification, VmxError> {
        let raw = self.get(VmcsField::ExitQualification)?;
        Ok(VmxExitQualification { raw })
    }

    /// Faulting guest-physical address of EPT violations and misconfigurations.
    fn guest_phys_addr(&self) -> Result<GuestPhysAddr, VmxError> {
        Ok(GuestPhysAddr::new(self.get(VmcsField::GuestPhysicalAddress)?))
    }

    /// Returns the VM-exit interruption information, if valid.
    fn interrupt_info(&self) -> Result<Option<InterruptionInfo>, VmxError> {
        let info = InterruptionInfo::from_u32(self.get(VmcsField::VmExitIntrInfo)? as u32);
        Ok(if info.valid() { Some(info) } else { None })
    }
}

// ———————————————————————————— Hardware Bring-up ——————————————————————————— //

/// EPT and VPID features the hypervisor core relies on.
pub const REQUIRED_EPT_FEATURES: EptCapability = EptCapability::from_bits_truncate(
    EptCapability::PAGE_WALK_4.bits()
        | EptCapability::WRITE_BACK.bits()
        | EptCapability::SINGLE_CTX_INVEPT.bits()
        | EptCapability::SINGLE_CTX_INVVPID.bits(),
);

/// IA32_FEATURE_CONTROL: lock bit, and VMXON allowed inside or outside SMX.
fn feature_control_allows_vmx(feature_control: u64) -> bool {
    feature_control & 0b001 != 0 && feature_control & 0b110 != 0
}

/// VMCS revision identifier, bits 30:0 of IA32_VMX_BASIC.
pub fn vmcs_revision(vmx_basic: u64) -> u32 {
    (vmx_basic & 0x7fff_ffff) as u32
}

/// Checks that this core can run guests under EPT, setting CR4.VMXE on the way.
///
/// Returns the EPT and VPID capabilities of the core.
pub fn check_vmx_support() -> Result<EptCapability, VmxError> {
    // SAFETY: CPUID is available on every x86_64 core outside of SGX enclaves.
    let leaf_1 = unsafe { arch::x86_64::__cpuid(0x01) };
    if leaf_1.ecx & CPUID_ECX_VMX_MASK == 0 {
        return Err(VmxError::VmxNotSupported);
    }
    let cr4 = read_cr4();
    if cr4 & Cr4Flags::VMXE.bits() == 0 {
        // SAFETY: setting VMXE only enables VMXON.
        unsafe { write_cr4(cr4 | Cr4Flags::VMXE.bits()) };
    }

    // SAFETY: the VMX capability MSRs exist once CPUID reports VMX, the secondary controls and
    // EPT capability MSRs are only read when advertised by the previous one.
    unsafe {
        if !feature_control_allows_vmx(msr::FEATURE_CONTROL.read()) {
            return Err(VmxError::VmxNotSupported);
        }
        if msr::VMX_PROCBASED_CTLS.read() & (1 << 63) == 0 {
            return Err(VmxError::FeatureNotSupported);
        }
        // Allowed-1 bit of "enable EPT"
        if msr::VMX_PROCBASED_CTLS2.read() & (1 << 33) == 0 {
            return Err(VmxError::FeatureNotSupported);
        }
        let capabilities = EptCapability::from_bits_truncate(msr::VMX_EPT_VPID_CAP.read());
        if !capabilities.contains(REQUIRED_EPT_FEATURES) {
            log::error!("VMX: missing EPT features {:?}", REQUIRED_EPT_FEATURES - capabilities);
            return Err(VmxError::FeatureNotSupported);
        }
        log::info!("VMX: EPT and VPID capabilities {:?}", capabilities);
        Ok(capabilities)
    }
}

/// Zeroes a VMXON or VMCS region and stamps the revision identifier.
unsafe fn stamp_region(frame: &mut Frame) {
    let revision = vmcs_revision(msr::VMX_BASIC.read());
    frame.zero_out();
    frame.as_array_page()[0] = revision as u64;
}

/// Proof that the current core is in VMX root operation.
pub struct VmxRoot {
    vmxon_region: Frame,
}

impl VmxRoot {
    /// Executes VMXON with `frame` as the VMXON region.
    ///
    /// SAFETY: [check_vmx_support] succeeded on this core, the frame is exclusively owned.
    pub unsafe fn enable(mut frame: Frame) -> Result<Self, VmxError> {
        stamp_region(&mut frame);
        raw::vmxon(frame.phys_addr.as_u64())?;
        Ok(VmxRoot {
            vmxon_region: frame,
        })
    }

    /// Leaves VMX operation and gives the region back.
    ///
    /// SAFETY: no [ActiveVmcs] created from this root is used afterward.
    pub unsafe fn disable(self) -> Result<Frame, VmxError> {
        raw::vmxoff()?;
        Ok(self.vmxon_region)
    }

    /// Turns `frame` into a cleared VMCS and makes it current on this core.
    ///
    /// SAFETY: the frame is exclusively owned and stays alive as long as the returned VMCS.
    pub unsafe fn load_vmcs(&self, mut frame: Frame) -> Result<ActiveVmcs, VmxError> {
        stamp_region(&mut frame);
        let addr = frame.phys_addr.as_u64();
        raw::vmclear(addr)?;
        raw::vmptrld(addr)?;
        Ok(ActiveVmcs {
            launched: false,
            region: frame,
        })
    }
}

// —————————————————————————————————— VMCS —————————————————————————————————— //

/// The VMCS current on this core, accessed with VMREAD and VMWRITE.
///
/// A vCPU is pinned to a single core, so the VMCS is only ever current there.
pub struct ActiveVmcs {
    launched: bool,
    region: Frame,
}

impl ActiveVmcs {
    /// Flushes the VMCS to memory and returns its region.
    pub fn release(self) -> Result<Frame, VmxError> {
        // SAFETY: the region holds a VMCS loaded by [VmxRoot::load_vmcs].
        unsafe { raw::vmclear(self.region.phys_addr.as_u64())? };
        Ok(self.region)
    }
}

impl VmcsAccess for ActiveVmcs {
    fn get(&self, field: VmcsField) -> Result<usize, VmxError> {
        unsafe { field.vmread() }
    }

    fn set(&mut self, field: VmcsField, value: usize) -> Result<(), VmxError> {
        unsafe { field.vmwrite(value) }
    }

    fn is_launched(&self) -> bool {
        self.launched
    }

    fn clear(&mut self) -> Result<(), VmxError> {
        let addr = self.region.phys_addr.as_u64();
        // SAFETY: the region is a valid VMCS, it is made active again right after the clear.
        unsafe {
            raw::vmclear(addr)?;
            raw::vmptrld(addr)?;
        }
        self.launched = false;
        Ok(())
    }

    unsafe fn enter(&mut self, regs: &mut [usize; REGFILE_SIZE]) -> Result<(), VmxError> {
        if self.launched {
            raw::vmresume(regs)
        } else {
            self.launched = true;
            raw::vmlaunch(regs)
        }
    }
}

impl core::fmt::Debug for ActiveVmcs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        const DUMPED: [VmcsField; 8] = [
            VmcsField::GuestRip,
            VmcsField::GuestRsp,
            VmcsField::GuestRflags,
            VmcsField::GuestCr0,
            VmcsField::GuestCr3,
            VmcsField::GuestCr4,
            VmcsField::GuestIa32Efer,
            VmcsField::VmExitReason,
        ];
        writeln!(f, "VMCS {{")?;
        for field in DUMPED {
            match self.get(field) {
                Ok(value) => writeln!(f, "    {:?}: {:#x}", field, value)?,
                Err(err) => writeln!(f, "    {:?}: {:?}", field, err)?,
            }
        }
        write!(f, "}}")
    }
}

// —————————————————————————— Exit Qualifications ——————————————————————————— //

/// Raw exit qualification, decoded according to the exit reason.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VmxExitQualification {
    pub raw: usize,
}

impl VmxExitQualification {
    pub fn control_register_accesses(self) -> ControlRegisterAccesses {
        ControlRegisterAccesses::from_qualification(self.raw)
    }

    /// Selector of the target TSS, for task switch exits.
    pub fn task_switch_selector(self) -> u16 {
        self.raw as u16
    }
}

// ————————————————————————————————— Utils —————————————————————————————————— //

fn read_cr4() -> u64 {
    let value: u64;
    // SAFETY: reading CR4 has no side effect.
    unsafe { asm!("mov {}, cr4", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

unsafe fn write_cr4(value: u64) {
    asm!("mov cr4, {}", in(reg) value, options(nomem, nostack, preserves_flags));
}
