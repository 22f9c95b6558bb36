//! The trait for the FrameAllocator used by the page table mappers.

use utils::{Frame, HostPhysAddr, HostVirtAddr};

/// SAFETY: returned frames must be valid, exclusively owned, and reachable at
/// `phys_addr + get_physical_offset()`.
pub unsafe trait FrameAllocator {
    /// Allocates a frame.
    fn allocate_frame(&self) -> Option<Frame>;

    /// Frees a frame.
    fn free_frame(&self, _frame: HostPhysAddr) -> Result<(), ()> {
        // Default implementation: leak all the pages
        Ok(())
    }

    /// Returns the offset between physical and virtual addresses.
    fn get_physical_offset(&self) -> HostVirtAddr;
}
