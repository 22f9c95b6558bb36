//! VM exit dispatch
//!
//! Exits are dispatched through a table indexed by the basic exit reason. Each entry tells
//! whether the exit qualification is read from the VMCS before the handler runs.

use core::marker::PhantomData;

use vmx::bitmaps::exit_qualification::{ControlRegister, ControlRegisterAccesses};
use vmx::bitmaps::{Cr0Flags, Cr4Flags, EferFlags, EptMemoryType, Xcr0Flags};
use vmx::fields::{GeneralPurposeField, GuestRegister, VmcsField};
use vmx::{msr, InterruptionInfo, InterruptionType, Trapnr, VmcsAccess};
use vmx::{VmxExitQualification, VmxExitReason};

use crate::config::NR_EXIT_REASONS;
use crate::cpuid::guest_cpuid;
use crate::error::HvError;
use crate::guest_mem::SmapGuard;
use crate::platform::{remap_core, Platform};
use crate::vcpu::{Requests, Vcpu};

const RAX: GuestRegister = GuestRegister::Gp(GeneralPurposeField::Rax);
const RBX: GuestRegister = GuestRegister::Gp(GeneralPurposeField::Rbx);
const RCX: GuestRegister = GuestRegister::Gp(GeneralPurposeField::Rcx);
const RDX: GuestRegister = GuestRegister::Gp(GeneralPurposeField::Rdx);

const MSR_IA32_PAT: u32 = msr::IA32_PAT.address();
const MSR_IA32_EFER: u32 = msr::IA32_EFER.address();

/// EFER bits a guest can write.
const EFER_WRITABLE: u64 = EferFlags::SCE.bits()
    | EferFlags::LME.bits()
    | EferFlags::LMA.bits()
    | EferFlags::NXE.bits();

/// XCR0 bit 8 and bits 10 and up are reserved.
const XCR0_RESERVED: u64 = (1 << 8) | !((1 << 10) - 1);

// ————————————————————————————— Dispatch Table ————————————————————————————— //

pub struct ExitHandler<P: Platform> {
    pub handler: fn(&mut Vcpu<'_, P>) -> Result<(), HvError>,
    /// Read the exit qualification before calling the handler.
    pub need_qualification: bool,
}

impl<P: Platform> ExitHandler<P> {
    const fn new(handler: fn(&mut Vcpu<'_, P>) -> Result<(), HvError>, need_qualification: bool) -> Self {
        Self {
            handler,
            need_qualification,
        }
    }
}

impl<P: Platform> Clone for ExitHandler<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Platform> Copy for ExitHandler<P> {}

pub struct ExitTable<P: Platform>(PhantomData<P>);

impl<P: Platform> ExitTable<P> {
    /// One entry per basic exit reason, unassigned reasons use the unexpected exit handler.
    pub const HANDLERS: [ExitHandler<P>; NR_EXIT_REASONS] = build_table::<P>();
}

const fn build_table<P: Platform>() -> [ExitHandler<P>; NR_EXIT_REASONS] {
    use VmxExitReason as R;

    let mut table = [ExitHandler::new(unexpected_exit::<P>, false); NR_EXIT_REASONS];
    table[R::Exception as usize] = ExitHandler::new(exception_exit::<P>, false);
    table[R::TripleFault as usize] = ExitHandler::new(triple_fault_exit::<P>, false);
    table[R::InitSignal as usize] = ExitHandler::new(init_signal_exit::<P>, false);
    table[R::NmiWindow as usize] = ExitHandler::new(nmi_window_exit::<P>, false);
    table[R::TaskSwitch as usize] = ExitHandler::new(task_switch_exit::<P>, true);
    table[R::Cpuid as usize] = ExitHandler::new(cpuid_exit::<P>, false);
    table[R::Hlt as usize] = ExitHandler::new(hlt_exit::<P>, false);
    table[R::ControlRegisterAccesses as usize] = ExitHandler::new(cr_access_exit::<P>, true);
    table[R::MovDR as usize] = ExitHandler::new(dr_access_exit::<P>, true);
    table[R::Rdmsr as usize] = ExitHandler::new(rdmsr_exit::<P>, false);
    table[R::Wrmsr as usize] = ExitHandler::new(wrmsr_exit::<P>, false);
    table[R::Pause as usize] = ExitHandler::new(pause_exit::<P>, false);
    table[R::EptViolation as usize] = ExitHandler::new(ept_violation_exit::<P>, true);
    table[R::Wbinvd as usize] = ExitHandler::new(wbinvd_exit::<P>, false);
    table[R::Xsetbv as usize] = ExitHandler::new(xsetbv_exit::<P>, false);

    #[rustfmt::skip]
    let undefined = [
        R::Invd, R::Rdpmc, R::Vmcall, R::Vmclear, R::Vmlaunch, R::Vmptrld, R::Vmptrst, R::Vmread,
        R::Vmresume, R::Vmwrite, R::Vmxoff, R::Vmxon, R::Mwait, R::Monitor, R::Invept, R::Invvpid,
    ];
    let mut idx = 0;
    while idx < undefined.len() {
        table[undefined[idx] as usize] = ExitHandler::new(undefined_exit::<P>, false);
        idx += 1;
    }
    table
}

// ———————————————————————————————— Dispatch ———————————————————————————————— //

/// Handles the VM exit recorded in `vcpu.arch.exit_reason`.
///
/// Errors are internal failures of the hypervisor, faults of the guest are injected.
pub fn dispatch_vmexit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    let expected = vcpu.pcpu_id();
    let actual = remap_core(vcpu.platform().current_pcpu());
    if expected != actual {
        log::error!(
            "vCPU {} bound to core {} runs on core {}",
            vcpu.id(),
            expected,
            actual
        );
        return Err(HvError::AffinityMismatch { expected, actual });
    }

    capture_idt_vectoring(vcpu)?;

    let basic = (vcpu.arch.exit_reason & 0xffff) as usize;
    if basic >= NR_EXIT_REASONS {
        log::error!("vCPU {}: invalid exit reason {:#x}", vcpu.id(), vcpu.arch.exit_reason);
        return Err(HvError::InvalidExitReason(vcpu.arch.exit_reason));
    }
    let entry = ExitTable::<P>::HANDLERS[basic];
    if entry.need_qualification {
        vcpu.arch.exit_qualification = vcpu.vmcs.get(VmcsField::ExitQualification)?;
    }
    log::trace!(
        "vCPU {}: exit {:?}",
        vcpu.id(),
        VmxExitReason::from_u16(basic as u16)
    );
    (entry.handler)(vcpu)
}

/// Records the event whose delivery was interrupted by the exit.
///
/// Hardware exceptions go through the exception queue and NMIs through the request bitmap. Other
/// events stay in `idt_vectoring_info` and are injected again as is.
fn capture_idt_vectoring<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    let raw = vcpu.vmcs.get(VmcsField::IdtVectoringInfoField)? as u32;
    vcpu.arch.idt_vectoring_info = raw;
    let info = InterruptionInfo::from_u32(raw);
    if !info.valid() {
        return Ok(());
    }
    match info.interruption_type() {
        InterruptionType::HardwareException => {
            let error_code = if info.error_code_valid() {
                vcpu.vmcs.get(VmcsField::IdtVectoringErrorCode)? as u32
            } else {
                0
            };
            vcpu.queue_exception(info.vector(), error_code)?;
            vcpu.arch.idt_vectoring_info = 0;
        }
        InterruptionType::NonMaskableInterrupt => {
            vcpu.make_request(Requests::NMI);
            vcpu.arch.idt_vectoring_info = 0;
        }
        _ => {}
    }
    Ok(())
}

// ———————————————————————————————— Handlers ———————————————————————————————— //

fn unexpected_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    let rip = vcpu.get_rip()?;
    let raw = vcpu.arch.exit_reason;
    vcpu.vm().fatal_error(format_args!(
        "vCPU {}: unexpected exit {:?} ({:#x}) at rip {:#x}",
        vcpu.id(),
        VmxExitReason::from_u16((raw & 0xffff) as u16),
        raw,
        rip
    ));
    Ok(())
}

fn exception_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    let Some(info) = vcpu.vmcs.interrupt_info()? else {
        return Ok(());
    };
    vcpu.retain_rip();
    if info.vector() == Trapnr::Debug.as_u8() {
        // Hardware debugging is not virtualized
        return vcpu.inject_gp(0);
    }
    let rip = vcpu.get_rip()?;
    vcpu.vm().fatal_error(format_args!(
        "vCPU {}: unhandled exception {} at rip {:#x}",
        vcpu.id(),
        info.vector(),
        rip
    ));
    Ok(())
}

fn triple_fault_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    vcpu.make_request(Requests::TRIPLE_FAULT);
    vcpu.retain_rip();
    Ok(())
}

fn init_signal_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    vcpu.retain_rip();
    Ok(())
}

fn nmi_window_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    vcpu.set_nmi_window_exiting(false)?;
    vcpu.retain_rip();
    Ok(())
}

fn task_switch_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    let qualification = VmxExitQualification {
        raw: vcpu.arch.exit_qualification,
    };
    vcpu.inject_gp(qualification.task_switch_selector() as u32)
}

fn cpuid_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    let leaf = vcpu.get_gpreg(RAX)? as u32;
    let subleaf = vcpu.get_gpreg(RCX)? as u32;
    let res = guest_cpuid(vcpu, leaf, subleaf)?;
    vcpu.set_gpreg(RAX, res.eax as u64)?;
    vcpu.set_gpreg(RBX, res.ebx as u64)?;
    vcpu.set_gpreg(RCX, res.ecx as u64)?;
    vcpu.set_gpreg(RDX, res.edx as u64)?;
    Ok(())
}

fn hlt_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    vcpu.platform().vcpu_halted(vcpu.vm().id(), vcpu.id());
    Ok(())
}

fn pause_exit<P: Platform>(_vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    Ok(())
}

fn undefined_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    log::debug!(
        "vCPU {}: #UD for exit reason {}",
        vcpu.id(),
        vcpu.arch.exit_reason & 0xffff
    );
    vcpu.inject_ud()
}

// ————————————————————————— Control & Debug Registers —————————————————————— //

fn cr_access_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    let qualification = VmxExitQualification {
        raw: vcpu.arch.exit_qualification,
    };
    match qualification.control_register_accesses() {
        ControlRegisterAccesses::MovToCr(ControlRegister::Cr0, reg) => {
            let value = vcpu.get_gpreg(reg)?;
            vcpu.set_cr0(value, false)
        }
        ControlRegisterAccesses::MovToCr(ControlRegister::Cr4, reg) => {
            let value = vcpu.get_gpreg(reg)?;
            vcpu.set_cr4(value, false)
        }
        ControlRegisterAccesses::LmswRegister(source)
        | ControlRegisterAccesses::LmswMemory(source) => {
            // LMSW loads PE, MP, EM and TS but never clears PE
            let cr0 = vcpu.get_cr0()?;
            vcpu.set_cr0((cr0 & !0xe) | (source as u64 & 0xf), false)
        }
        access => {
            log::error!("vCPU {}: unhandled CR access {:?}", vcpu.id(), access);
            Err(HvError::UnhandledCrAccess)
        }
    }
}

fn dr_access_exit<P: Platform>(_vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    // Injecting #GP here triple faults some guests, debug register accesses are ignored.
    Ok(())
}

// —————————————————————————————————— MSRs —————————————————————————————————— //

fn rdmsr_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    let msr = vcpu.get_gpreg(RCX)? as u32;
    let value = match msr {
        MSR_IA32_PAT => Some(vcpu.get_guest_pat()),
        MSR_IA32_EFER => Some(vcpu.get_efer()?),
        _ => vcpu
            .platform()
            .emulate_rdmsr(vcpu.vm().id(), vcpu.id(), msr),
    };
    match value {
        Some(value) => {
            vcpu.set_gpreg(RAX, value & 0xffff_ffff)?;
            vcpu.set_gpreg(RDX, value >> 32)?;
            Ok(())
        }
        None => {
            log::debug!("vCPU {}: rdmsr {:#x} not emulated", vcpu.id(), msr);
            vcpu.inject_gp(0)
        }
    }
}

fn wrmsr_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    let msr = vcpu.get_gpreg(RCX)? as u32;
    let value = (vcpu.get_gpreg(RDX)? << 32) | (vcpu.get_gpreg(RAX)? & 0xffff_ffff);
    match msr {
        MSR_IA32_PAT => {
            if !msr::is_valid_pat(value) {
                log::debug!("vCPU {}: invalid PAT {:#x}", vcpu.id(), value);
                return vcpu.inject_gp(0);
            }
            vcpu.set_guest_pat(value)
        }
        MSR_IA32_EFER => write_efer(vcpu, value),
        _ => {
            let platform = vcpu.platform();
            if platform
                .emulate_wrmsr(vcpu.vm().id(), vcpu.id(), msr, value)
                .is_err()
            {
                log::debug!("vCPU {}: wrmsr {:#x} not emulated", vcpu.id(), msr);
                return vcpu.inject_gp(0);
            }
            Ok(())
        }
    }
}

/// LMA is owned by the processor, LME can only change while paging is disabled.
fn write_efer<P: Platform>(vcpu: &mut Vcpu<'_, P>, value: u64) -> Result<(), HvError> {
    if value & !EFER_WRITABLE != 0 {
        log::debug!("vCPU {}: reserved EFER bits {:#x}", vcpu.id(), value);
        return vcpu.inject_gp(0);
    }
    let efer = vcpu.get_efer()?;
    let lme = EferFlags::LME.bits();
    if (efer ^ value) & lme != 0 && vcpu.get_cr0()? & Cr0Flags::PG.bits() != 0 {
        log::debug!("vCPU {}: EFER.LME changed with paging enabled", vcpu.id());
        return vcpu.inject_gp(0);
    }
    let lma = EferFlags::LMA.bits();
    vcpu.set_efer((value & !lma) | (efer & lma))
}

// ———————————————————————————————— Memory —————————————————————————————————— //

fn ept_violation_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    let gpa = vcpu.vmcs.guest_phys_addr()?;
    let rip = vcpu.get_rip()?;
    vcpu.vm().fatal_error(format_args!(
        "vCPU {}: EPT violation at gpa {:#x} (qualification {:#x}), rip {:#x}",
        vcpu.id(),
        gpa.as_usize(),
        vcpu.arch.exit_qualification,
        rip
    ));
    Ok(())
}

/// Writes back and invalidates the host cache lines of all cacheable guest memory.
fn wbinvd_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    let vm = vcpu.vm();
    let platform = vcpu.platform();
    let _smap = SmapGuard::new(platform);
    vm.walk_and_apply(|leaf| {
        if leaf.flags.memory_type() != EptMemoryType::Uncacheable {
            platform.flush_cache_range(vm.hpa2hva(leaf.hpa), leaf.size);
        }
    });
    Ok(())
}

// ————————————————————————————————— XSAVE —————————————————————————————————— //

fn xsetbv_exit<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    if vcpu.get_cr4()? & Cr4Flags::OSXSAVE.bits() == 0 {
        log::debug!("vCPU {}: xsetbv with CR4.OSXSAVE clear", vcpu.id());
        return vcpu.inject_gp(0);
    }
    if vcpu.get_gpreg(RCX)? as u32 != 0 {
        return vcpu.inject_gp(0);
    }
    let value = (vcpu.get_gpreg(RDX)? << 32) | (vcpu.get_gpreg(RAX)? & 0xffff_ffff);
    if !is_valid_xcr0(value) {
        log::debug!("vCPU {}: invalid XCR0 {:#x}", vcpu.id(), value);
        return vcpu.inject_gp(0);
    }
    vcpu.platform().write_xcr0(value);
    Ok(())
}

fn is_valid_xcr0(value: u64) -> bool {
    let xcr0 = Xcr0Flags::from_bits_truncate(value);
    if value & XCR0_RESERVED != 0 || !xcr0.contains(Xcr0Flags::X87) {
        return false;
    }
    if xcr0.contains(Xcr0Flags::AVX) && !xcr0.contains(Xcr0Flags::SSE) {
        return false;
    }
    // MPX is not exposed
    !xcr0.intersects(Xcr0Flags::BNDREGS | Xcr0Flags::BNDCSR)
}

// ————————————————————————————————— Tests —————————————————————————————————— //
