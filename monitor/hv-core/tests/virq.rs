mod common;

use std::sync::atomic::Ordering;

use common::*;
use hv_core::vcpu::PendingException;
use hv_core::{HvError, Requests};
use vmx::bitmaps::{InterruptibilityState, PrimaryControls, RFlags};
use vmx::fields::VmcsField;
use vmx::{VmcsAccess, VmxExitReason};

const DE: u8 = 0;
const BP: u8 = 3;
const UD: u8 = 6;
const DF: u8 = 8;
const NP: u8 = 11;
const SS: u8 = 12;
const GP: u8 = 13;
const PF: u8 = 14;
const AC: u8 = 17;

/// Valid hardware exception with an error code.
const GP_INFO: usize = 0x8000_0b0d;
const NMI_INFO: usize = 0x8000_0202;

fn pending(vector: u8, error_code: u32) -> Option<PendingException> {
    Some(PendingException { vector, error_code })
}

fn vmcs(vcpu: &TestVcpu, field: VmcsField) -> usize {
    vcpu.vmcs.get(field).unwrap()
}

fn nmi_window_exiting(vcpu: &TestVcpu) -> bool {
    let controls =
        PrimaryControls::from_bits_truncate(vmcs(vcpu, VmcsField::CpuBasedVmExecControl) as u32);
    controls.contains(PrimaryControls::NMI_WINDOW_EXITING)
}

// ——————————————————————————————— Scenarios ———————————————————————————————— //

/// A contributory exception raised while a contributory one is pending becomes #DF(0).
#[test]
fn scenario_contributory_escalation() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.inject_gp(5).unwrap();
    vcpu.queue_exception(DE, 0).unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(DF, 0));

    vcpu.handle_pending_requests().unwrap();
    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryIntrInfoField), 0x8000_0b08);
    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryExceptionErrorCode), 0);
}

// ———————————————————————————————— Queuing ————————————————————————————————— //

#[test]
fn page_fault_escalation() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.inject_pf(0x7000, 2).unwrap();
    vcpu.queue_exception(NP, 0x18).unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(DF, 0));

    // Two page faults also escalate
    vcpu.handle_pending_requests().unwrap();
    vcpu.inject_pf(0x7000, 2).unwrap();
    vcpu.inject_pf(0x8000, 0).unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(DF, 0));
}

#[test]
fn benign_exceptions_replace() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.inject_pf(0x7000, 2).unwrap();
    vcpu.inject_ud().unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(UD, 0));

    vcpu.inject_ud().unwrap();
    vcpu.inject_gp(0).unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(GP, 0));

    // Contributory after a page fault is not the reverse case
    vcpu.handle_pending_requests().unwrap();
    vcpu.inject_gp(0).unwrap();
    vcpu.inject_pf(0x1000, 0).unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(PF, 0));
}

#[test]
fn fault_during_double_fault() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.queue_exception(DF, 0).unwrap();
    vcpu.inject_gp(0).unwrap();

    assert!(vcpu.requests().pending().contains(Requests::TRIPLE_FAULT));
    assert_eq!(vcpu.arch.pending_exception(), pending(DF, 0));
    assert_eq!(vcpu.handle_pending_requests(), Err(HvError::TripleFault));
}

#[test]
fn invalid_vector() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.inject_ud().unwrap();
    assert_eq!(
        vcpu.queue_exception(32, 0),
        Err(HvError::InvalidVector(32))
    );
    assert_eq!(vcpu.arch.pending_exception(), pending(UD, 0));
}

#[test]
fn error_codes() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.queue_exception(UD, 0x55).unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(UD, 0));

    vcpu.handle_pending_requests().unwrap();
    vcpu.queue_exception(NP, 0x55).unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(NP, 0x55));
}

#[test]
fn page_fault_address() {
    let (platform, _, mut vcpu) = standard_vcpu();
    vcpu.inject_pf(0xdead_b000, 2).unwrap();
    assert_eq!(vcpu.arch.cr2, 0xdead_b000);
    assert_eq!(platform.cr2.load(Ordering::SeqCst), 0);
}

// ——————————————————————————————— Injection ———————————————————————————————— //

#[test]
fn faults_restart_the_instruction() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.arch.inst_len = 3;
    vcpu.inject_gp(0x10).unwrap();
    vcpu.handle_pending_requests().unwrap();

    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryIntrInfoField), GP_INFO);
    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryExceptionErrorCode), 0x10);
    assert_eq!(vcpu.arch.inst_len, 0);
    let rflags = vcpu.get_rflags().unwrap();
    assert_ne!(rflags & RFlags::RESUME_FLAG.bits(), 0);
    assert!(vcpu.arch.pending_exception().is_none());
    assert!(!vcpu.requests().pending().contains(Requests::EXCEPTION));
}

#[test]
fn alignment_and_stack_faults() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.arch.inst_len = 4;
    vcpu.inject_ac().unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(AC, 0));
    vcpu.handle_pending_requests().unwrap();
    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryIntrInfoField), 0x8000_0b11);
    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryExceptionErrorCode), 0);
    assert_eq!(vcpu.arch.inst_len, 0);

    vcpu.inject_gp(0x10).unwrap();
    vcpu.handle_pending_requests().unwrap();
    vcpu.inject_ss().unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(SS, 0));
    vcpu.handle_pending_requests().unwrap();
    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryIntrInfoField), 0x8000_0b0c);
    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryExceptionErrorCode), 0);

    // #SS is contributory, #AC is benign
    vcpu.inject_gp(0).unwrap();
    vcpu.inject_ss().unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(DF, 0));
    vcpu.handle_pending_requests().unwrap();
    vcpu.inject_gp(0).unwrap();
    vcpu.inject_ac().unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(AC, 0));
}

#[test]
fn traps_complete_the_instruction() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.arch.inst_len = 1;
    vcpu.queue_exception(BP, 0).unwrap();
    vcpu.handle_pending_requests().unwrap();

    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryIntrInfoField), 0x8000_0303);
    assert_eq!(vcpu.arch.inst_len, 1);
    assert_eq!(vcpu.get_rflags().unwrap() & RFlags::RESUME_FLAG.bits(), 0);
}

#[test]
fn nmi_injection() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.inject_nmi();
    vcpu.handle_pending_requests().unwrap();
    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryIntrInfoField), NMI_INFO);
    assert!(!vcpu.requests().pending().contains(Requests::NMI));
}

#[test]
fn blocked_nmi_waits_for_window() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.vmcs
        .set(
            VmcsField::GuestInterruptibilityInfo,
            InterruptibilityState::BLOCKING_BY_NMI.bits() as usize,
        )
        .unwrap();
    vcpu.inject_nmi();
    vcpu.handle_pending_requests().unwrap();

    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryIntrInfoField), 0);
    assert!(vcpu.requests().pending().contains(Requests::NMI));
    assert!(nmi_window_exiting(&vcpu));

    // The guest executes IRET, the window opens
    vcpu.vmcs
        .set(VmcsField::GuestInterruptibilityInfo, 0)
        .unwrap();
    exit(&mut vcpu, VmxExitReason::NmiWindow as u32, 0).unwrap();
    assert!(!nmi_window_exiting(&vcpu));
    vcpu.handle_pending_requests().unwrap();
    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryIntrInfoField), NMI_INFO);
}

#[test]
fn mov_ss_blocks_nmi() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.vmcs
        .set(
            VmcsField::GuestInterruptibilityInfo,
            InterruptibilityState::BLOCKING_BY_MOV_SS.bits() as usize,
        )
        .unwrap();
    vcpu.inject_nmi();
    vcpu.handle_pending_requests().unwrap();
    assert!(vcpu.requests().pending().contains(Requests::NMI));
    assert!(nmi_window_exiting(&vcpu));
}

#[test]
fn exceptions_before_nmi() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.inject_nmi();
    vcpu.inject_gp(0).unwrap();
    vcpu.handle_pending_requests().unwrap();

    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryIntrInfoField), GP_INFO);
    assert!(vcpu.requests().pending().contains(Requests::NMI));
    vcpu.handle_pending_requests().unwrap();
    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryIntrInfoField), NMI_INFO);
}

// —————————————————————————————— IDT Vectoring ————————————————————————————— //

fn exit_during_delivery(vcpu: &mut TestVcpu, info: usize, error_code: usize) {
    vcpu.vmcs
        .set_exit_field(VmcsField::IdtVectoringInfoField, info)
        .unwrap();
    vcpu.vmcs
        .set_exit_field(VmcsField::IdtVectoringErrorCode, error_code)
        .unwrap();
    exit(vcpu, VmxExitReason::Cpuid as u32, 0).unwrap();
}

#[test]
fn interrupted_exception_is_queued() {
    let (_, _, mut vcpu) = standard_vcpu();
    exit_during_delivery(&mut vcpu, 0x8000_0b0e, 0x4);
    assert_eq!(vcpu.arch.pending_exception(), pending(PF, 0x4));
    assert_eq!(vcpu.arch.idt_vectoring_info, 0);
}

#[test]
fn fault_while_delivering_page_fault() {
    let (_, _, mut vcpu) = standard_vcpu();
    vcpu.vmcs
        .set_exit_field(VmcsField::IdtVectoringInfoField, 0x8000_0b0e)
        .unwrap();
    // Task switch through the IDT to selector 0x28
    exit(&mut vcpu, VmxExitReason::TaskSwitch as u32, 0x28).unwrap();
    assert_eq!(vcpu.arch.pending_exception(), pending(DF, 0));
}

#[test]
fn interrupted_nmi_is_requested() {
    let (_, _, mut vcpu) = standard_vcpu();
    exit_during_delivery(&mut vcpu, NMI_INFO, 0);
    assert!(vcpu.requests().pending().contains(Requests::NMI));
    assert!(vcpu.arch.pending_exception().is_none());
}

#[test]
fn interrupted_event_is_reinjected() {
    let (_, _, mut vcpu) = standard_vcpu();
    // External interrupt, vector 0x20
    exit_during_delivery(&mut vcpu, 0x8000_0020, 0);
    assert_eq!(vcpu.arch.idt_vectoring_info, 0x8000_0020);

    vcpu.handle_pending_requests().unwrap();
    assert_eq!(vmcs(&vcpu, VmcsField::VmEntryIntrInfoField), 0x8000_0020);
    assert_eq!(vcpu.arch.idt_vectoring_info, 0);
}

// ———————————————————————————————— Requests ———————————————————————————————— //

#[test]
fn flush_requests() {
    let (platform, _, mut vcpu) = standard_vcpu();
    let invepts = platform.invepts.load(Ordering::SeqCst);
    vcpu.make_request(Requests::EPT_FLUSH | Requests::VPID_FLUSH | Requests::LAPIC_RESET);
    vcpu.handle_pending_requests().unwrap();

    assert_eq!(platform.invepts.load(Ordering::SeqCst), invepts + 1);
    assert_eq!(platform.invvpids.load(Ordering::SeqCst), 1);
    assert_eq!(platform.lapic_resets.load(Ordering::SeqCst), 1);
    assert!(vcpu.requests().pending().is_empty());
}

#[test]
fn triple_fault_stops_request_handling() {
    let (platform, _, mut vcpu) = standard_vcpu();
    exit(&mut vcpu, VmxExitReason::TripleFault as u32, 0).unwrap();
    vcpu.make_request(Requests::LAPIC_RESET);

    assert_eq!(vcpu.handle_pending_requests(), Err(HvError::TripleFault));
    assert_eq!(platform.lapic_resets.load(Ordering::SeqCst), 0);
    assert!(vcpu.requests().pending().contains(Requests::LAPIC_RESET));
}
