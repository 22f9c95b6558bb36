//! Guest physical address space of a VM

use mmu::{EptLeaf, FrameAllocator};
use utils::{GuestPhysAddr, HostPhysAddr, HostVirtAddr};
use vmx::bitmaps::EptEntryFlags;

use crate::error::HvError;
use crate::platform::Platform;
use crate::vm::Vm;

impl<P: Platform> Vm<P> {
    /// Maps `[gpa, gpa + size)` to `[hpa, hpa + size)`.
    ///
    /// All online vCPUs flush their EPT derived caches before their next entry.
    pub fn add_mapping(
        &self,
        hpa: HostPhysAddr,
        gpa: GuestPhysAddr,
        size: usize,
        prot: EptEntryFlags,
    ) -> Result<(), HvError> {
        log::trace!(
            "VM {}: map gpa {:#x} -> hpa {:#x}, size {:#x}, {:?}",
            self.id(),
            gpa.as_usize(),
            hpa.as_usize(),
            size,
            prot
        );
        let _guard = self.ept_lock.lock();
        let result = self
            .ept
            .map_range(self.platform().allocator(), gpa, hpa, size, prot);
        self.flush_ept_all();
        Ok(result?)
    }

    /// Sets and clears flags of the leaves covering `[gpa, gpa + size)`, the frames are kept.
    pub fn modify_mapping(
        &self,
        gpa: GuestPhysAddr,
        size: usize,
        set: EptEntryFlags,
        clear: EptEntryFlags,
    ) -> Result<(), HvError> {
        let _guard = self.ept_lock.lock();
        let result = self
            .ept
            .modify_range(self.platform().allocator(), gpa, size, set, clear);
        self.flush_ept_all();
        Ok(result?)
    }

    /// Removes the mapping of `[gpa, gpa + size)`, deleting an unmapped range is a no-op.
    pub fn delete_mapping(&self, gpa: GuestPhysAddr, size: usize) -> Result<(), HvError> {
        let _guard = self.ept_lock.lock();
        let result = self
            .ept
            .unmap_range(self.platform().allocator(), gpa, size);
        self.flush_ept_all();
        Ok(result?)
    }

    /// Returns the host physical address of `gpa` and the size of the page containing it.
    pub fn translate(&self, gpa: GuestPhysAddr) -> Option<(HostPhysAddr, usize)> {
        self.ept.translate(gpa)
    }

    /// Host virtual address of a host physical address, through the direct map.
    pub fn hpa2hva(&self, hpa: HostPhysAddr) -> HostVirtAddr {
        let offset = self.platform().allocator().get_physical_offset();
        HostVirtAddr::new(hpa.as_usize() + offset.as_usize())
    }

    pub fn gpa2hva(&self, gpa: GuestPhysAddr) -> Option<HostVirtAddr> {
        self.translate(gpa).map(|(hpa, _)| self.hpa2hva(hpa))
    }

    /// Calls `callback` on every present leaf of the guest physical address space.
    pub fn walk_and_apply<F>(&self, mut callback: F)
    where
        F: FnMut(&EptLeaf),
    {
        self.ept.for_each_leaf(&mut |leaf| callback(&leaf));
    }
}
