//! Virtual exceptions and event injection
//!
//! Exceptions raised while emulating the guest are queued and injected on the next VM entry. At
//! most one exception is pending per vCPU: queuing a second one either replaces the first or
//! escalates to a double fault, following the rules of Intel SDM Vol. 3A Table 6-5.

use vmx::bitmaps::{InterruptibilityState, PrimaryControls, RFlags};
use vmx::fields::VmcsField;
use vmx::{InterruptionInfo, InterruptionType, Trapnr, VmcsAccess};

use crate::error::HvError;
use crate::platform::Platform;
use crate::vcpu::{PendingException, Requests, Vcpu};

/// Number of architecturally defined exception vectors.
pub const NR_EXCEPTIONS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionKind {
    Fault,
    Trap,
    Abort,
    Interrupt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionInfo {
    /// The exception pushes an error code.
    pub error_code: bool,
    pub class: ExceptionClass,
    pub kind: ExceptionKind,
}

const fn exc(error_code: bool, class: ExceptionClass, kind: ExceptionKind) -> ExceptionInfo {
    ExceptionInfo {
        error_code,
        class,
        kind,
    }
}

use ExceptionClass::{Benign, Contributory, PageFault};
use ExceptionKind::{Abort, Fault, Interrupt, Trap};

#[rustfmt::skip]
const EXCEPTIONS: [ExceptionInfo; NR_EXCEPTIONS] = [
    exc(false, Contributory, Fault),     // #DE
    exc(false, Benign,       Trap),      // #DB
    exc(false, Benign,       Interrupt), // NMI
    exc(false, Benign,       Trap),      // #BP
    exc(false, Benign,       Trap),      // #OF
    exc(false, Benign,       Fault),     // #BR
    exc(false, Benign,       Fault),     // #UD
    exc(false, Benign,       Fault),     // #NM
    exc(true,  Benign,       Abort),     // #DF
    exc(false, Benign,       Fault),     // Coprocessor segment overrun
    exc(true,  Contributory, Fault),     // #TS
    exc(true,  Contributory, Fault),     // #NP
    exc(true,  Contributory, Fault),     // #SS
    exc(true,  Contributory, Fault),     // #GP
    exc(true,  PageFault,    Fault),     // #PF
    exc(false, Benign,       Fault),     // Reserved
    exc(false, Benign,       Fault),     // #MF
    exc(true,  Benign,       Fault),     // #AC
    exc(false, Benign,       Abort),     // #MC
    exc(false, Benign,       Fault),     // #XM
    exc(false, PageFault,    Fault),     // #VE
    exc(true,  Benign,       Fault),     // #CP
    exc(false, Benign,       Fault),     // Reserved
    exc(false, Benign,       Fault),
    exc(false, Benign,       Fault),
    exc(false, Benign,       Fault),
    exc(false, Benign,       Fault),
    exc(false, Benign,       Fault),
    exc(false, Benign,       Fault),
    exc(false, Benign,       Fault),
    exc(false, Benign,       Fault),
    exc(false, Benign,       Fault),
];

/// Returns the classification of an exception vector, `None` above 31.
pub fn exception_info(vector: u8) -> Option<ExceptionInfo> {
    EXCEPTIONS.get(vector as usize).copied()
}

const DOUBLE_FAULT: u8 = Trapnr::DoubleFault as u8;

impl<'vm, P: Platform> Vcpu<'vm, P> {
    // ——————————————————————————————— Queuing ——————————————————————————————— //

    /// Queues an exception for injection on the next VM entry.
    ///
    /// The error code is dropped for vectors that do not push one.
    pub fn queue_exception(&mut self, vector: u8, error_code: u32) -> Result<(), HvError> {
        let Some(new) = exception_info(vector) else {
            log::error!("vCPU {}: invalid exception vector {}", self.id(), vector);
            return Err(HvError::InvalidVector(vector));
        };

        let (vector, error_code) = match self.arch.exception {
            Some(prev) if prev.vector == DOUBLE_FAULT && new.class != Benign => {
                log::warn!("vCPU {}: triple fault (vector {} after #DF)", self.id(), vector);
                self.make_request(Requests::TRIPLE_FAULT);
                return Ok(());
            }
            Some(prev) => {
                let prev_class = EXCEPTIONS[prev.vector as usize].class;
                let escalate = (prev_class == Contributory && new.class == Contributory)
                    || (prev_class == PageFault && new.class != Benign);
                if escalate {
                    log::debug!(
                        "vCPU {}: vector {} while delivering {}, double fault",
                        self.id(),
                        vector,
                        prev.vector
                    );
                    (DOUBLE_FAULT, 0)
                } else {
                    (vector, error_code)
                }
            }
            None => (vector, error_code),
        };

        let error_code = if EXCEPTIONS[vector as usize].error_code {
            error_code
        } else {
            0
        };
        self.arch.exception = Some(PendingException { vector, error_code });
        self.make_request(Requests::EXCEPTION);
        Ok(())
    }

    pub fn inject_gp(&mut self, error_code: u32) -> Result<(), HvError> {
        self.queue_exception(Trapnr::GeneralProtectionFault.as_u8(), error_code)
    }

    /// CR2 is loaded with the faulting address before the next entry.
    pub fn inject_pf(&mut self, addr: u64, error_code: u32) -> Result<(), HvError> {
        self.arch.cr2 = addr;
        self.queue_exception(Trapnr::PageFault.as_u8(), error_code)
    }

    pub fn inject_ud(&mut self) -> Result<(), HvError> {
        self.queue_exception(Trapnr::InvalidOpcode.as_u8(), 0)
    }

    pub fn inject_ac(&mut self) -> Result<(), HvError> {
        self.queue_exception(Trapnr::AlignmentCheck.as_u8(), 0)
    }

    pub fn inject_ss(&mut self) -> Result<(), HvError> {
        self.queue_exception(Trapnr::StackSegmentFault.as_u8(), 0)
    }

    pub fn inject_nmi(&self) {
        self.make_request(Requests::NMI);
    }

    // ——————————————————————————————— Injection —————————————————————————————— //

    /// Moves the pending exception to the VM-entry interruption fields.
    ///
    /// Faults are delivered with RIP pointing to the faulting instruction.
    fn inject_pending_exception(&mut self) -> Result<bool, HvError> {
        let Some(exception) = self.arch.exception.take() else {
            return Ok(false);
        };
        let info = EXCEPTIONS[exception.vector as usize];
        if info.error_code {
            self.vmcs.set(
                VmcsField::VmEntryExceptionErrorCode,
                exception.error_code as usize,
            )?;
        }
        let intr = InterruptionInfo::new(
            exception.vector,
            InterruptionType::HardwareException,
            info.error_code,
        );
        self.vmcs
            .set(VmcsField::VmEntryIntrInfoField, intr.as_u32() as usize)?;

        if info.kind == Fault {
            self.retain_rip();
            let rflags = self.get_rflags()?;
            self.set_rflags(rflags | RFlags::RESUME_FLAG.bits())?;
        }
        log::trace!(
            "vCPU {}: inject vector {} (error code {:#x})",
            self.id(),
            exception.vector,
            exception.error_code
        );
        Ok(true)
    }

    /// Injects an NMI, or waits for an NMI window if NMIs are blocked.
    fn inject_pending_nmi(&mut self) -> Result<bool, HvError> {
        let state = InterruptibilityState::from_bits_truncate(
            self.vmcs.get(VmcsField::GuestInterruptibilityInfo)? as u32,
        );
        if state
            .intersects(InterruptibilityState::BLOCKING_BY_MOV_SS | InterruptibilityState::BLOCKING_BY_NMI)
        {
            self.make_request(Requests::NMI);
            self.set_nmi_window_exiting(true)?;
            return Ok(false);
        }
        let intr = InterruptionInfo::new(
            Trapnr::NMI.as_u8(),
            InterruptionType::NonMaskableInterrupt,
            false,
        );
        self.vmcs
            .set(VmcsField::VmEntryIntrInfoField, intr.as_u32() as usize)?;
        Ok(true)
    }

    pub(crate) fn set_nmi_window_exiting(&mut self, enabled: bool) -> Result<(), HvError> {
        let mut controls = PrimaryControls::from_bits_truncate(
            self.vmcs.get(VmcsField::CpuBasedVmExecControl)? as u32,
        );
        controls.set(PrimaryControls::NMI_WINDOW_EXITING, enabled);
        self.vmcs
            .set(VmcsField::CpuBasedVmExecControl, controls.bits() as usize)?;
        Ok(())
    }

    // ———————————————————————————— Pending Requests —————————————————————————— //

    /// Services the pending requests before a VM entry.
    ///
    /// A triple fault is returned as an error and left to the escalation policy.
    pub fn handle_pending_requests(&mut self) -> Result<(), HvError> {
        let requests = self.requests();

        if requests.test_and_clear(Requests::INIT_VMCS) {
            self.init_vmcs()?;
        }
        if requests.test_and_clear(Requests::TRIPLE_FAULT) {
            log::error!("vCPU {}: triple fault", self.id());
            return Err(HvError::TripleFault);
        }
        if requests.test_and_clear(Requests::LAPIC_RESET) {
            self.platform().reset_lapic(self.vm().id(), self.id());
        }
        if requests.test_and_clear(Requests::EPT_FLUSH) {
            self.platform().invept(self.vm().eptp())?;
        }
        if requests.test_and_clear(Requests::VPID_FLUSH) {
            self.platform().invvpid(self.vpid())?;
        }

        let mut injected = false;
        if requests.test_and_clear(Requests::EXCEPTION) {
            injected = self.inject_pending_exception()?;
        }
        if !injected {
            if requests.test_and_clear(Requests::NMI) {
                self.inject_pending_nmi()?;
            } else if self.arch.idt_vectoring_info & InterruptionInfo::VALID != 0 {
                // Re-deliver the event interrupted by the exit
                let info = self.arch.idt_vectoring_info;
                self.vmcs.set(VmcsField::VmEntryIntrInfoField, info as usize)?;
                self.arch.idt_vectoring_info = 0;
            }
        }
        Ok(())
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
