use mmu::EptError;
use vmx::VmxError;

use crate::vcpu::VcpuState;
use crate::vm::VmState;

/// Errors of the hypervisor core.
///
/// Conditions caused by the guest are not errors: they are reported to the guest by injecting the
/// corresponding exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvError {
    Vmx(VmxError),
    /// Misaligned or out of range address, or an unknown vCPU.
    InvalidArgument,
    /// No frame available for a page table page.
    OutOfMemory,
    /// Basic exit reason outside of the dispatch table.
    InvalidExitReason(u32),
    /// The vCPU is executing on a core it is not bound to.
    AffinityMismatch { expected: usize, actual: usize },
    UnhandledCrAccess,
    TripleFault,
    /// VM entry failed, carries the full exit reason.
    EntryFailure(u32),
    /// Not an exception vector.
    InvalidVector(u8),
    InvalidStateTransition { from: VcpuState, to: VcpuState },
    InvalidVmTransition { from: VmState, to: VmState },
    /// A guest physical address in the range is not mapped.
    NotMapped,
    /// The CR masks are used before `init_cr0_cr4_host_mask`.
    Uninitialized,
}

impl From<VmxError> for HvError {
    fn from(err: VmxError) -> Self {
        HvError::Vmx(err)
    }
}

impl From<EptError> for HvError {
    fn from(err: EptError) -> Self {
        match err {
            EptError::OutOfMemory => HvError::OutOfMemory,
            EptError::Misaligned | EptError::OutOfRange => HvError::InvalidArgument,
        }
    }
}
