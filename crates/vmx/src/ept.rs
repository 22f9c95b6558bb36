//! Extended Page Table

use crate::bitmaps::EptMemoryType;
use crate::HostPhysAddr;

pub const GIANT_PAGE_SIZE: usize = 1 << 30;
pub const HUGE_PAGE_SIZE: usize = 1 << 21;
pub const PAGE_SIZE: usize = 1 << 12;

/// Bits 12 to 50 of an entry hold the physical frame.
pub const ADDRESS_MASK: u64 = 0x7_ffff_ffff_f000;

/// Page-walk length minus one, stored in bits 3:5 of the EPT pointer.
const EPTP_WALK_LENGTH_4: u64 = 3 << 3;

/// Builds an EPT pointer for a 4-level table rooted at `root` and accessed with write-back
/// memory type.
pub fn eptp(root: HostPhysAddr) -> u64 {
    (root.as_u64() & ADDRESS_MASK) | EPTP_WALK_LENGTH_4 | EptMemoryType::WriteBack.bits()
}

/// INVEPT and INVVPID invalidation types.
///
/// See Intel SDM volume 3C section 30.3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum InvalidationType {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContext = 2,
    SingleContextRetainingGlobals = 3,
}
