mod common;

use std::sync::atomic::Ordering;

use common::*;
use hv_core::config::NR_EXIT_REASONS;
use hv_core::vcpu::PendingException;
use hv_core::vmexit::ExitTable;
use hv_core::{HvError, Requests, Severity, VcpuInitState, VcpuState, VmState};
use vmx::bitmaps::{Cr4Flags, EferFlags};
use vmx::fields::VmcsField;
use vmx::{SoftVmcs, VmxExitReason};

const UD: u8 = 6;
const GP: u8 = 13;

const MSR_IA32_PAT: u64 = 0x277;
const MSR_IA32_EFER: u64 = 0xc000_0080;

fn pending(vector: u8, error_code: u32) -> Option<PendingException> {
    Some(PendingException { vector, error_code })
}

fn cpuid(vcpu: &mut TestVcpu, leaf: u64, subleaf: u64) -> [u64; 4] {
    vcpu.set_gpreg(RAX, leaf).unwrap();
    vcpu.set_gpreg(RCX, subleaf).unwrap();
    exit(vcpu, VmxExitReason::Cpuid as u32, 0).unwrap();
    [RAX, RBX, RCX, RDX].map(|reg| vcpu.get_gpreg(reg).unwrap())
}

fn rdmsr(vcpu: &mut TestVcpu, msr: u64) -> u64 {
    vcpu.set_gpreg(RCX, msr).unwrap();
    exit(vcpu, VmxExitReason::Rdmsr as u32, 0).unwrap();
    (vcpu.get_gpreg(RDX).unwrap() << 32) | vcpu.get_gpreg(RAX).unwrap()
}

fn wrmsr(vcpu: &mut TestVcpu, msr: u64, value: u64) {
    vcpu.set_gpreg(RCX, msr).unwrap();
    vcpu.set_gpreg(RAX, value & 0xffff_ffff).unwrap();
    vcpu.set_gpreg(RDX, value >> 32).unwrap();
    exit(vcpu, VmxExitReason::Wrmsr as u32, 0).unwrap();
}

fn xsetbv(vcpu: &mut TestVcpu, xcr: u64, value: u64) {
    vcpu.set_gpreg(RCX, xcr).unwrap();
    vcpu.set_gpreg(RAX, value & 0xffff_ffff).unwrap();
    vcpu.set_gpreg(RDX, value >> 32).unwrap();
    exit(vcpu, VmxExitReason::Xsetbv as u32, 0).unwrap();
}

// ——————————————————————————————— Scenarios ———————————————————————————————— //

/// CPUID leaf 1 reports the vCPU's APIC ID, hides VMX and advertises the hypervisor.
#[test]
fn scenario_cpuid_leaf_1() {
    let (platform, _, mut vcpu) = standard_vcpu();
    let [eax, ebx, ecx, edx] = cpuid(&mut vcpu, 1, 0);

    assert_eq!(ebx >> 24, 0);
    assert_eq!(ebx & 0x00ff_ffff, 0x0010_0800);
    assert_eq!(ecx & (1 << 5), 0);
    assert_ne!(ecx & (1 << 31), 0);
    // CR4.OSXSAVE is clear
    assert_eq!(ecx & (1 << 27), 0);
    assert_eq!((eax, edx), (0x906ea, 0x1));
    assert_eq!(*platform.cpuid_calls.lock().unwrap(), vec![(1, 0)]);
    assert!(vcpu.arch.pending_exception().is_none());
}

/// Debug register accesses are ignored.
#[test]
fn scenario_mov_dr_is_ignored() {
    let (platform, vm, mut vcpu) = standard_vcpu();
    vcpu.arch.inst_len = 3;
    // mov dr3, rax
    exit(&mut vcpu, VmxExitReason::MovDR as u32, 0x3).unwrap();

    assert!(vcpu.arch.pending_exception().is_none());
    assert!(vcpu.requests().pending().is_empty());
    assert_eq!(vcpu.arch.inst_len, 3);
    assert_eq!(vm.state(), VmState::Created);
    assert!(platform.shutdowns().is_empty());
}

// ————————————————————————————————— Table —————————————————————————————————— //

#[test]
fn dispatch_table() {
    let table = ExitTable::<MockPlatform>::HANDLERS;
    assert_eq!(table.len(), NR_EXIT_REASONS);
    let with_qualification = [
        VmxExitReason::TaskSwitch,
        VmxExitReason::ControlRegisterAccesses,
        VmxExitReason::MovDR,
        VmxExitReason::EptViolation,
    ];
    for (reason, entry) in table.iter().enumerate() {
        let expected = with_qualification
            .iter()
            .any(|r| r.as_u16() as usize == reason);
        assert_eq!(entry.need_qualification, expected, "reason {}", reason);
    }
}

#[test]
fn exit_qualification_is_loaded_on_demand() {
    let (_, _, mut vcpu) = standard_vcpu();
    exit(&mut vcpu, VmxExitReason::Pause as u32, 0x1234).unwrap();
    assert_eq!(vcpu.arch.exit_qualification, 0);
    exit(&mut vcpu, VmxExitReason::MovDR as u32, 0x1234).unwrap();
    assert_eq!(vcpu.arch.exit_qualification, 0x1234);
}

#[test]
fn invalid_exit_reason() {
    let (platform, _, mut vcpu) = standard_vcpu();
    let reason = NR_EXIT_REASONS as u32;
    assert_eq!(
        exit(&mut vcpu, reason, 0),
        Err(HvError::InvalidExitReason(reason))
    );
    assert!(platform.shutdowns().is_empty());
}

#[test]
fn wrong_core() {
    let (platform, _, mut vcpu) = standard_vcpu();
    platform.pcpu.store(3, Ordering::SeqCst);
    assert_eq!(
        exit(&mut vcpu, VmxExitReason::Cpuid as u32, 0),
        Err(HvError::AffinityMismatch {
            expected: 0,
            actual: 3
        })
    );
    assert!(platform.cpuid_calls.lock().unwrap().is_empty());
}

// ————————————————————————————— Fatal Exits ———————————————————————————————— //

#[test]
fn unexpected_exit_tears_down_the_vm() {
    let (platform, vm, mut vcpu) = standard_vcpu();
    exit(&mut vcpu, VmxExitReason::Vmfunc as u32, 0).unwrap();

    assert_eq!(platform.shutdowns(), vec![0]);
    assert_eq!(vm.state(), VmState::PoweringOff);
    assert_eq!(vcpu.state(), VcpuState::Zombie);

    // Already powering off
    exit(&mut vcpu, VmxExitReason::Vmfunc as u32, 0).unwrap();
    assert_eq!(platform.shutdowns(), vec![0]);
}

#[test]
#[should_panic(expected = "platform halted")]
fn unexpected_exit_in_safety_vm() {
    let (_, vm) = new_vm(config(Severity::SafetyVm));
    let mut vcpu = running_vcpu(vm);
    let _ = exit(&mut vcpu, VmxExitReason::ExternalInterrupt as u32, 0);
}

#[test]
fn ept_violation_is_fatal() {
    let (platform, _, mut vcpu) = standard_vcpu();
    exit(&mut vcpu, VmxExitReason::EptViolation as u32, 0x181).unwrap();
    assert_eq!(platform.shutdowns(), vec![0]);
    assert_eq!(vcpu.state(), VcpuState::Zombie);
}

// —————————————————————————————— Exceptions ———————————————————————————————— //

#[test]
fn debug_exception_injects_gp() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.arch.inst_len = 2;
    vcpu.vmcs
        .set_exit_field(VmcsField::VmExitIntrInfo, 0x8000_0301)
        .unwrap();
    exit(&mut vcpu, VmxExitReason::Exception as u32, 0).unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(GP, 0));
    assert_eq!(vcpu.arch.inst_len, 0);
}

#[test]
fn other_exceptions_are_fatal() {
    let (platform, _, mut vcpu) = standard_vcpu();
    vcpu.vmcs
        .set_exit_field(VmcsField::VmExitIntrInfo, 0x8000_0306)
        .unwrap();
    exit(&mut vcpu, VmxExitReason::Exception as u32, 0).unwrap();
    assert_eq!(platform.shutdowns(), vec![0]);
}

#[test]
fn triple_fault_exit() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.arch.inst_len = 2;
    exit(&mut vcpu, VmxExitReason::TripleFault as u32, 0).unwrap();
    assert!(vcpu.requests().pending().contains(Requests::TRIPLE_FAULT));
    assert_eq!(vcpu.arch.inst_len, 0);
}

#[test]
fn task_switch_injects_gp() {
    let (_, _, mut vcpu) = standard_vcpu();
    exit(&mut vcpu, VmxExitReason::TaskSwitch as u32, 0x4000_0028).unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(GP, 0x28));
}

#[test]
fn vmx_instructions_are_undefined() {
    for reason in [
        VmxExitReason::Invd,
        VmxExitReason::Rdpmc,
        VmxExitReason::Vmcall,
        VmxExitReason::Vmclear,
        VmxExitReason::Vmlaunch,
        VmxExitReason::Vmptrld,
        VmxExitReason::Vmptrst,
        VmxExitReason::Vmread,
        VmxExitReason::Vmresume,
        VmxExitReason::Vmwrite,
        VmxExitReason::Vmxoff,
        VmxExitReason::Vmxon,
        VmxExitReason::Mwait,
        VmxExitReason::Monitor,
        VmxExitReason::Invept,
        VmxExitReason::Invvpid,
    ] {
        let (platform, _, mut vcpu) = standard_vcpu();
        exit(&mut vcpu, reason as u32, 0).unwrap();
        assert_eq!(vcpu.arch.pending_exception(), pending(UD, 0), "{:?}", reason);
        assert!(platform.shutdowns().is_empty());
    }
}

// ————————————————————————————— Instructions ——————————————————————————————— //

#[test]
fn cpuid_filtering() {
    let (_, _, mut vcpu) = standard_vcpu();
    let [_, ebx, ecx, _] = cpuid(&mut vcpu, 7, 0);
    assert_eq!(ebx, 0x1);
    assert_eq!(ecx, 0x5);

    let [eax, ..] = cpuid(&mut vcpu, 0xd, 0);
    assert_eq!(eax, 0x7);

    let [eax, ebx, ..] = cpuid(&mut vcpu, 0x8000_0001, 2);
    assert_eq!((eax, ebx), (0x8000_0001, 2));

    vcpu.set_cr4(Cr4Flags::OSXSAVE.bits(), false).unwrap();
    let [_, _, ecx, _] = cpuid(&mut vcpu, 1, 0);
    assert_ne!(ecx & (1 << 27), 0);
}

#[test]
fn cpuid_topology() {
    let mut vm_config = config(Severity::StandardVm);
    vm_config.nr_vcpus = 2;
    let (_, vm) = new_vm(vm_config);
    let _first = running_vcpu(vm);
    let mut second = vm.create_vcpu(1, SoftVmcs::new()).unwrap();
    second.handle_pending_requests().unwrap();
    second.start().unwrap();

    let [_, ebx, ..] = cpuid(&mut second, 1, 0);
    assert_eq!(ebx >> 24, 1);
    let [.., edx] = cpuid(&mut second, 0xb, 1);
    assert_eq!(edx, 1);
    let [.., edx] = cpuid(&mut second, 0x1f, 0);
    assert_eq!(edx, 1);
}

#[test]
fn hlt_notifies_the_platform() {
    let (platform, _, mut vcpu) = standard_vcpu();
    exit(&mut vcpu, VmxExitReason::Hlt as u32, 0).unwrap();
    exit(&mut vcpu, VmxExitReason::Hlt as u32, 0).unwrap();
    assert_eq!(platform.halts.load(Ordering::SeqCst), 2);
}

#[test]
fn xsetbv_exit() {
    let (platform, _, mut vcpu) = standard_vcpu();
    xsetbv(&mut vcpu, 0, 0x7);
    assert_eq!(vcpu.arch.pending_exception(), pending(GP, 0));
    vcpu.handle_pending_requests().unwrap();

    vcpu.set_cr4(Cr4Flags::OSXSAVE.bits(), false).unwrap();
    xsetbv(&mut vcpu, 0, 0x7);
    assert!(vcpu.arch.pending_exception().is_none());
    assert_eq!(*platform.xcr0_writes.lock().unwrap(), vec![0x7]);

    for (xcr, value) in [(1, 0x7), (0, 0x5), (0, 0x1f), (0, 1 << 40 | 0x3)] {
        xsetbv(&mut vcpu, xcr, value);
        assert_eq!(vcpu.arch.pending_exception(), pending(GP, 0));
        vcpu.handle_pending_requests().unwrap();
    }
    assert_eq!(platform.xcr0_writes.lock().unwrap().len(), 1);
}

// —————————————————————————————————— MSRs —————————————————————————————————— //

#[test]
fn pat_msr() {
    let (_, _, mut vcpu) = standard_vcpu();
    assert_eq!(rdmsr(&mut vcpu, MSR_IA32_PAT), VcpuInitState::PAT);

    wrmsr(&mut vcpu, MSR_IA32_PAT, 0x0007_0406_0007_0206);
    assert_eq!(vcpu.arch.pending_exception(), pending(GP, 0));
    vcpu.handle_pending_requests().unwrap();
    assert_eq!(vcpu.get_guest_pat(), VcpuInitState::PAT);

    wrmsr(&mut vcpu, MSR_IA32_PAT, 0x0606_0606_0606_0606);
    assert!(vcpu.arch.pending_exception().is_none());
    assert_eq!(rdmsr(&mut vcpu, MSR_IA32_PAT), 0x0606_0606_0606_0606);
}

#[test]
fn efer_msr() {
    let (_, _, mut vcpu) = standard_vcpu();
    let lme = EferFlags::LME.bits();
    let lma = EferFlags::LMA.bits();
    let sce = EferFlags::SCE.bits();

    // LMA is ignored
    wrmsr(&mut vcpu, MSR_IA32_EFER, lme | lma | sce);
    assert!(vcpu.arch.pending_exception().is_none());
    assert_eq!(rdmsr(&mut vcpu, MSR_IA32_EFER), lme | sce);

    // Reserved bit
    wrmsr(&mut vcpu, MSR_IA32_EFER, lme | 0x2);
    assert_eq!(vcpu.arch.pending_exception(), pending(GP, 0));
    vcpu.handle_pending_requests().unwrap();
    assert_eq!(vcpu.get_efer().unwrap(), lme | sce);
}

#[test]
fn efer_lme_is_locked_while_paging() {
    let (_, _, mut vcpu) = standard_vcpu();
    enable_paging(&mut vcpu, true);
    let efer = vcpu.get_efer().unwrap();

    wrmsr(&mut vcpu, MSR_IA32_EFER, EferFlags::NXE.bits());
    assert_eq!(vcpu.arch.pending_exception(), pending(GP, 0));
    assert_eq!(vcpu.get_efer().unwrap(), efer);

    // Other bits can change, LMA stays set
    vcpu.handle_pending_requests().unwrap();
    let lme = EferFlags::LME.bits();
    wrmsr(&mut vcpu, MSR_IA32_EFER, lme | EferFlags::NXE.bits());
    assert!(vcpu.arch.pending_exception().is_none());
    assert_eq!(
        vcpu.get_efer().unwrap(),
        lme | EferFlags::LMA.bits() | EferFlags::NXE.bits()
    );
}

#[test]
fn platform_msrs() {
    let (platform, _, mut vcpu) = standard_vcpu();
    platform.msrs.lock().unwrap().push((0x1b, 0xfee0_0900));

    assert_eq!(rdmsr(&mut vcpu, 0x1b), 0xfee0_0900);
    wrmsr(&mut vcpu, 0x1b, 0xfee0_0d00);
    assert!(vcpu.arch.pending_exception().is_none());
    assert_eq!(*platform.msrs.lock().unwrap(), vec![(0x1b, 0xfee0_0d00)]);

    rdmsr(&mut vcpu, 0x3a);
    assert_eq!(vcpu.arch.pending_exception(), pending(GP, 0));
    vcpu.handle_pending_requests().unwrap();
    wrmsr(&mut vcpu, 0x3a, 1);
    assert_eq!(vcpu.arch.pending_exception(), pending(GP, 0));
}
