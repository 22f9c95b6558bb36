//! Types shared by the hypervisor crates

#![cfg_attr(not(test), no_std)]

mod address;

pub use address::{GuestPhysAddr, HostPhysAddr, HostVirtAddr};

pub const PAGE_SIZE: usize = 0x1000;

/// A page of host memory, known by its machine address and the address it is mapped at.
#[derive(Clone, Copy, Debug)]
pub struct Frame {
    pub phys_addr: HostPhysAddr,
    pub virt_addr: HostVirtAddr,
}

impl Frame {
    /// SAFETY: `virt_addr` maps `phys_addr` for as long as the frame is used.
    pub unsafe fn new(phys_addr: HostPhysAddr, virt_addr: HostVirtAddr) -> Self {
        Frame {
            phys_addr,
            virt_addr,
        }
    }

    /// The page as 512 quadwords, the layout of VMX regions and page tables.
    pub fn as_array_page(&mut self) -> &mut [u64] {
        // SAFETY: the frame owns a mapped page.
        unsafe { core::slice::from_raw_parts_mut(self.virt_addr.as_usize() as *mut u64, 512) }
    }

    pub fn zero_out(&mut self) {
        self.as_array_page().fill(0);
    }

    pub fn zeroed(mut self) -> Self {
        self.zero_out();
        self
    }
}
