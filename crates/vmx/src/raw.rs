//! VMX instructions
//!
//! Thin wrappers turning the VMX status flags into a [VmxError]. Nothing is checked beforehand:
//! every function is unsafe and expects the processor state the instruction requires.

use core::arch::asm;

use crate::bitmaps::RFlags;
use crate::ept::InvalidationType;
use crate::errors::{VmxError, VmxInstructionError};
use crate::fields::{GeneralPurposeField as Gp, VmcsField, REGFILE_SIZE};

/// `addr` is a page aligned VMXON region stamped with the VMCS revision.
pub unsafe fn vmxon(addr: u64) -> Result<(), VmxError> {
    asm!("vmxon ({0})", in(reg) &addr, options(att_syntax));
    vmx_status()
}

pub unsafe fn vmxoff() -> Result<(), VmxError> {
    asm!("vmxoff");
    vmx_status()
}

/// Flushes the VMCS at `addr` to memory and marks it clear.
pub unsafe fn vmclear(addr: u64) -> Result<(), VmxError> {
    asm!("vmclear ({0})", in(reg) &addr, options(att_syntax));
    vmx_status()
}

/// Makes the VMCS at `addr` current, VMREAD and VMWRITE target it afterward.
pub unsafe fn vmptrld(addr: u64) -> Result<(), VmxError> {
    asm!("vmptrld ({0})", in(reg) &addr, options(att_syntax));
    vmx_status()
}

pub unsafe fn vmwrite(field: u64, value: u64) -> Result<(), VmxError> {
    asm!("vmwrite {1}, {0}", in(reg) field, in(reg) value, options(att_syntax));
    vmx_status()
}

pub unsafe fn vmread(field: u64) -> Result<u64, VmxError> {
    let value: u64;
    asm!("vmread {0}, {1}", in(reg) field, out(reg) value, options(att_syntax));
    vmx_status().map(|()| value)
}

/// Executes INVEPT for the given EPT pointer.
pub unsafe fn invept(tpe: InvalidationType, eptp: u64) -> Result<(), VmxError> {
    let descriptor: [u64; 2] = [eptp, 0];
    asm!("invept {0}, [{1}]", in(reg) tpe as u64, in(reg) &descriptor);
    vmx_status()
}

/// Executes INVVPID for the given virtual processor identifier.
pub unsafe fn invvpid(tpe: InvalidationType, vpid: u16) -> Result<(), VmxError> {
    let descriptor: [u64; 2] = [vpid as u64, 0];
    asm!("invvpid {0}, [{1}]", in(reg) tpe as u64, in(reg) &descriptor);
    vmx_status()
}

/// World switch: records the host RSP and resume address in the VMCS, loads the guest registers
/// from `regs`, runs `$instr` and stores the guest registers back once the guest exits.
///
/// Guest RSP and RIP live in the VMCS. The assembly addresses RAX, RBX, RCX, RDX and RBP by their
/// offset in the register file.
macro_rules! enter_guest {
    ($instr:literal, $regs:ident) => {{
        let rip_field = VmcsField::HostRip.raw() as u64;
        let rsp_field = VmcsField::HostRsp.raw() as u64;
        let vcpu_ptr = $regs.as_mut_ptr();
        asm!(
            // rbx and rbp cannot be asm operands
            "push rbx",
            "push rbp",
            "push rax",                   // register file

            "vmwrite rcx, rsp",           // HOST_RSP
            "lea rbp, [rip + 25]",        // the nop below
            "vmwrite rdx, rbp",           // HOST_RIP

            // Guest registers that are not operands
            "mov rbx, [rax + 8]",
            "mov rcx, [rax + 16]",
            "mov rdx, [rax + 24]",
            "mov rbp, [rax + 32]",
            "mov rax, [rax]",

            $instr,
            "nop",                        // VM exits resume here

            "push rbx",
            "mov rbx, [rsp + 8]",         // register file
            "mov [rbx + 32], rbp",
            "pop rbp",                    // guest rbx
            "mov [rbx + 8], rbp",

            "pop rbx",                    // register file, dropped
            "pop rbp",
            "pop rbx",

            inout("rax") vcpu_ptr => $regs[Gp::Rax.index()],
            inout("rcx") rsp_field => $regs[Gp::Rcx.index()],
            inout("rdx") rip_field => $regs[Gp::Rdx.index()],

            // Loaded and saved by the compiler
            inout("rsi") $regs[Gp::Rsi.index()] => $regs[Gp::Rsi.index()],
            inout("rdi") $regs[Gp::Rdi.index()] => $regs[Gp::Rdi.index()],
            inout("r8")  $regs[Gp::R8.index()]  => $regs[Gp::R8.index()],
            inout("r9")  $regs[Gp::R9.index()]  => $regs[Gp::R9.index()],
            inout("r10") $regs[Gp::R10.index()] => $regs[Gp::R10.index()],
            inout("r11") $regs[Gp::R11.index()] => $regs[Gp::R11.index()],
            inout("r12") $regs[Gp::R12.index()] => $regs[Gp::R12.index()],
            inout("r13") $regs[Gp::R13.index()] => $regs[Gp::R13.index()],
            inout("r14") $regs[Gp::R14.index()] => $regs[Gp::R14.index()],
            inout("r15") $regs[Gp::R15.index()] => $regs[Gp::R15.index()],
        );
        // Neither nop nor pop touch RFLAGS
        vmx_status()
    }};
}

/// SAFETY: the current VMCS is clear and holds a complete, isolated guest configuration.
pub unsafe fn vmlaunch(regs: &mut [usize; REGFILE_SIZE]) -> Result<(), VmxError> {
    enter_guest!("vmlaunch", regs)
}

/// SAFETY: same as [vmlaunch], with a launched VMCS.
pub unsafe fn vmresume(regs: &mut [usize; REGFILE_SIZE]) -> Result<(), VmxError> {
    enter_guest!("vmresume", regs)
}

/// Decodes the outcome of the last VMX instruction from RFLAGS (Intel SDM Vol. 3C, 31.2).
///
/// CF set: VMfailInvalid. ZF set: VMfailValid, the error number is in the current VMCS.
//  Always inlined: a call prologue between the instruction and PUSHFQ could clobber the flags.
#[inline(always)]
pub(crate) unsafe fn vmx_status() -> Result<(), VmxError> {
    let flags = rflags();
    if flags.contains(RFlags::CARRY_FLAG) {
        return Err(VmxError::VmFailInvalid);
    }
    if !flags.contains(RFlags::ZERO_FLAG) {
        return Ok(());
    }

    let field = VmcsField::VmInstructionError.raw() as u64;
    let number: u64;
    asm!("vmread {0}, {1}", in(reg) field, out(reg) number, options(att_syntax));
    let error = if rflags().intersects(RFlags::ZERO_FLAG | RFlags::CARRY_FLAG) {
        VmxInstructionError::Unknown
    } else {
        VmxInstructionError::from_u64(number)
    };
    Err(VmxError::VmFailValid(error))
}

#[inline(always)]
fn rflags() -> RFlags {
    let raw: u64;
    // SAFETY: only touches the stack slot it pops back.
    unsafe { asm!("pushfq; pop {}", out(reg) raw, options(nomem, preserves_flags)) };
    RFlags::from_bits_truncate(raw)
}
