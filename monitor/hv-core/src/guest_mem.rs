//! Copies between host buffers and guest physical memory

use utils::GuestPhysAddr;

use crate::error::HvError;
use crate::platform::Platform;
use crate::vm::Vm;

/// Allows supervisor accesses to user pages while alive.
pub struct SmapGuard<'a, P: Platform> {
    platform: &'a P,
}

impl<'a, P: Platform> SmapGuard<'a, P> {
    pub fn new(platform: &'a P) -> Self {
        platform.stac();
        Self { platform }
    }
}

impl<P: Platform> Drop for SmapGuard<'_, P> {
    fn drop(&mut self) {
        self.platform.clac();
    }
}

/// Copies `buf` to guest physical memory starting at `gpa`.
///
/// Stops at the first unmapped page, the preceding pages have been written.
pub fn copy_to_guest<P: Platform>(
    vm: &Vm<P>,
    gpa: GuestPhysAddr,
    buf: &[u8],
) -> Result<(), HvError> {
    copy_gpa(vm, gpa, buf.len(), |offset, hva, len| {
        // SAFETY: `hva` maps `len` bytes of guest memory, guest memory never overlaps the
        // hypervisor's buffers.
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr().add(offset), hva as *mut u8, len);
        }
    })
}

/// Fills `buf` from guest physical memory starting at `gpa`.
pub fn copy_from_guest<P: Platform>(
    vm: &Vm<P>,
    gpa: GuestPhysAddr,
    buf: &mut [u8],
) -> Result<(), HvError> {
    let size = buf.len();
    let dst = buf.as_mut_ptr();
    copy_gpa(vm, gpa, size, |offset, hva, len| {
        // SAFETY: see `copy_to_guest`.
        unsafe {
            core::ptr::copy_nonoverlapping(hva as *const u8, dst.add(offset), len);
        }
    })
}

/// Splits `[gpa, gpa + size)` at page boundaries and calls `copy(offset, hva, len)` on each
/// chunk.
fn copy_gpa<P, F>(vm: &Vm<P>, gpa: GuestPhysAddr, size: usize, mut copy: F) -> Result<(), HvError>
where
    P: Platform,
    F: FnMut(usize, usize, usize),
{
    let _smap = SmapGuard::new(vm.platform());
    let mut offset = 0;
    while offset < size {
        let current = gpa.checked_add(offset).ok_or(HvError::NotMapped)?;
        let (hpa, page_size) = match vm.translate(current) {
            Some(translation) => translation,
            None => {
                log::debug!("VM {}: copy to unmapped gpa {:#x}", vm.id(), current.as_usize());
                return Err(HvError::NotMapped);
            }
        };
        let to_boundary = page_size - (current.as_usize() & (page_size - 1));
        let len = usize::min(size - offset, to_boundary);
        copy(offset, vm.hpa2hva(hpa).as_usize(), len);
        offset += len;
    }
    Ok(())
}
