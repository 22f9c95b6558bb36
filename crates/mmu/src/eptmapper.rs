//! EPT mapper implementation

use utils::{Frame, GuestPhysAddr, HostPhysAddr, HostVirtAddr};
use vmx::bitmaps::{EptEntryFlags, EptMemoryType};
use vmx::ept::{self, GIANT_PAGE_SIZE, HUGE_PAGE_SIZE, PAGE_SIZE};

use crate::frame_allocator::FrameAllocator;
use crate::walker::{Level, WalkNext, Walker, ADDRESS_MASK, ADDRESS_SPACE_END};

/// Any of the access bits makes an entry present.
pub const EPT_PRESENT: EptEntryFlags = EptEntryFlags::RWX;

/// Which leaf sizes the mapper may use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EptPolicy {
    /// Allow 1 GiB leaves.
    pub giant_pages: bool,
    /// Allow 2 MiB leaves.
    pub huge_pages: bool,
    /// Executable mappings use 4 KiB leaves only, as a mitigation for the machine check on page
    /// size change erratum.
    pub force_4k_exec: bool,
}

impl Default for EptPolicy {
    fn default() -> Self {
        Self {
            giant_pages: true,
            huge_pages: true,
            force_4k_exec: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EptError {
    /// No frame available for a page table page.
    OutOfMemory,
    /// Address or size is not page aligned.
    Misaligned,
    /// The range does not fit in the translated address space.
    OutOfRange,
}

/// A present leaf of the extended page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EptLeaf {
    pub gpa: GuestPhysAddr,
    pub hpa: HostPhysAddr,
    pub size: usize,
    pub flags: EptEntryFlags,
}

#[derive(Clone, Copy, Debug)]
pub struct EptMapper {
    host_offset: usize,
    root: HostPhysAddr,
    policy: EptPolicy,
}

unsafe impl Walker for EptMapper {
    type PhysAddr = HostPhysAddr;
    type VirtAddr = GuestPhysAddr;

    fn translate(&self, phys_addr: Self::PhysAddr) -> HostVirtAddr {
        HostVirtAddr::new(phys_addr.as_usize() + self.host_offset)
    }

    fn root(&self) -> (Self::PhysAddr, Level) {
        (self.root, Level::L4)
    }
}

fn is_present(entry: u64) -> bool {
    entry & EPT_PRESENT.bits() != 0
}

fn is_leaf(entry: u64, level: Level) -> bool {
    level == Level::L1 || entry & EptEntryFlags::PAGE.bits() != 0
}

fn entry_flags(entry: u64) -> EptEntryFlags {
    EptEntryFlags::from_bits_truncate(entry & !ADDRESS_MASK)
}

/// Leaf flags, with snoop control added on cacheable memory. A snoop bit set by the caller is
/// kept as is.
fn leaf_flags(prot: EptEntryFlags) -> EptEntryFlags {
    if prot.memory_type() == EptMemoryType::Uncacheable {
        prot
    } else {
        prot | EptEntryFlags::SNOOP
    }
}

/// Returns the end of `[start, start + size)`, which must lie below `limit`.
fn range_end(start: u64, size: usize, limit: u64) -> Result<u64, EptError> {
    match start.checked_add(size as u64) {
        Some(end) if start < limit && end <= limit => Ok(end),
        _ => Err(EptError::OutOfRange),
    }
}

/// Host physical addresses an entry can hold.
const HOST_ADDRESS_END: u64 = ADDRESS_MASK + PAGE_SIZE as u64;

impl EptMapper {
    pub fn new(host_offset: usize, root: HostPhysAddr, policy: EptPolicy) -> Self {
        Self {
            host_offset,
            root,
            policy,
        }
    }

    /// Allocates an empty root and returns a mapper for it.
    pub fn with_allocator(
        allocator: &impl FrameAllocator,
        policy: EptPolicy,
    ) -> Result<Self, EptError> {
        let root = allocator
            .allocate_frame()
            .ok_or(EptError::OutOfMemory)?
            .zeroed();
        let offset = allocator.get_physical_offset().as_usize();
        Ok(Self::new(offset, root.phys_addr, policy))
    }

    pub fn policy(&self) -> EptPolicy {
        self.policy
    }

    /// Returns the EPT pointer (root with write-back memory type and a 4-level walk).
    pub fn eptp(&self) -> u64 {
        ept::eptp(self.root)
    }

    /// Maps `[gpa, gpa + size)` to `[hpa, hpa + size)` with the largest leaves allowed.
    ///
    /// Ranges that are already mapped are left untouched.
    pub fn map_range(
        &self,
        allocator: &impl FrameAllocator,
        gpa: GuestPhysAddr,
        hpa: HostPhysAddr,
        size: usize,
        prot: EptEntryFlags,
    ) -> Result<(), EptError> {
        if !gpa.is_aligned(PAGE_SIZE) || !hpa.is_aligned(PAGE_SIZE) || size % PAGE_SIZE != 0 {
            return Err(EptError::Misaligned);
        }
        let end = range_end(gpa.as_u64(), size, ADDRESS_SPACE_END)? as usize;
        range_end(hpa.as_u64(), size, HOST_ADDRESS_END)?;
        let flags = leaf_flags(prot);
        let small_only = self.policy.force_4k_exec && prot.is_executable();
        let allow_giant = self.policy.giant_pages && !small_only;
        let allow_huge = self.policy.huge_pages && !small_only;
        let mut error = None;
        let mut already_mapped = 0;

        let result = unsafe {
            self.walk_range(gpa, GuestPhysAddr::new(end), &mut |addr, entry, level| {
                if is_present(*entry) {
                    if is_leaf(*entry, level) {
                        already_mapped += 1;
                        return WalkNext::Leaf;
                    }
                    return WalkNext::Continue;
                }

                let hphys = hpa.as_usize() + (addr.as_usize() - gpa.as_usize());
                let fits = |page_size: usize| {
                    addr.is_aligned(page_size)
                        && hphys % page_size == 0
                        && addr.as_usize() + page_size <= end
                };
                let leaf = match level {
                    Level::L3 => allow_giant && fits(GIANT_PAGE_SIZE),
                    Level::L2 => allow_huge && fits(HUGE_PAGE_SIZE),
                    Level::L1 => true,
                    Level::L4 => false,
                };
                if leaf {
                    let page = if level == Level::L1 {
                        EptEntryFlags::empty()
                    } else {
                        EptEntryFlags::PAGE
                    };
                    *entry = hphys as u64 | (flags | page).bits();
                    return WalkNext::Leaf;
                }

                match allocator.allocate_frame() {
                    Some(frame) => {
                        let frame = frame.zeroed();
                        *entry = frame.phys_addr.as_u64() | EptEntryFlags::RWX.bits();
                        WalkNext::Continue
                    }
                    None => {
                        error = Some(EptError::OutOfMemory);
                        WalkNext::Abort
                    }
                }
            })
        };

        if already_mapped != 0 {
            log::warn!(
                "EPT: {} leaves already mapped in [{:#x}, {:#x})",
                already_mapped,
                gpa.as_usize(),
                end
            );
        }
        result.map_err(|_| error.unwrap_or(EptError::OutOfMemory))
    }

    /// Updates the flags of the leaves covering `[gpa, gpa + size)`, keeping their frames.
    ///
    /// Leaves that are partially covered are split first.
    pub fn modify_range(
        &self,
        allocator: &impl FrameAllocator,
        gpa: GuestPhysAddr,
        size: usize,
        set: EptEntryFlags,
        clear: EptEntryFlags,
    ) -> Result<(), EptError> {
        let force_4k = self.policy.force_4k_exec;
        self.update_leaves(allocator, gpa, size, &mut |entry, level| {
            let flags = (entry_flags(entry) - clear) | set;
            if force_4k && level != Level::L1 && flags.is_executable() {
                return None;
            }
            let flags = leaf_flags(flags);
            Some((entry & ADDRESS_MASK) | flags.bits())
        })
    }

    /// Removes the leaves covering `[gpa, gpa + size)`.
    ///
    /// Leaves that are partially covered are split first, unmapped ranges are skipped.
    pub fn unmap_range(
        &self,
        allocator: &impl FrameAllocator,
        gpa: GuestPhysAddr,
        size: usize,
    ) -> Result<(), EptError> {
        self.update_leaves(allocator, gpa, size, &mut |_, _| Some(0))
    }

    /// Applies `update` on every leaf entirely contained in the range.
    ///
    /// `update` returns the new entry, or `None` if the leaf must be split before being updated.
    fn update_leaves<F>(
        &self,
        allocator: &impl FrameAllocator,
        gpa: GuestPhysAddr,
        size: usize,
        update: &mut F,
    ) -> Result<(), EptError>
    where
        F: FnMut(u64, Level) -> Option<u64>,
    {
        if !gpa.is_aligned(PAGE_SIZE) || size % PAGE_SIZE != 0 {
            return Err(EptError::Misaligned);
        }
        let start = gpa.as_u64();
        let end = range_end(start, size, ADDRESS_SPACE_END)?;
        let mut error = None;
        let mut not_mapped = 0;

        let result = unsafe {
            self.walk_range(gpa, GuestPhysAddr::new(end as usize), &mut |addr, entry, level| {
                if !is_present(*entry) {
                    not_mapped += 1;
                    return WalkNext::Leaf;
                }
                if !is_leaf(*entry, level) {
                    return WalkNext::Continue;
                }

                let leaf_start = addr.as_u64() & level.mask();
                let covered = leaf_start >= start && leaf_start + level.area_size() <= end;
                if covered {
                    if let Some(new_entry) = update(*entry, level) {
                        *entry = new_entry;
                        return WalkNext::Leaf;
                    }
                }

                match self.split(allocator, entry, level) {
                    Ok(()) => WalkNext::Continue,
                    Err(err) => {
                        error = Some(err);
                        WalkNext::Abort
                    }
                }
            })
        };

        if not_mapped != 0 {
            log::warn!(
                "EPT: {} entries not mapped in [{:#x}, {:#x})",
                not_mapped,
                start,
                end
            );
        }
        result.map_err(|_| error.unwrap_or(EptError::OutOfMemory))
    }

    /// Replaces a large leaf with a table of next-level leaves mapping the same frames with the
    /// same flags.
    fn split(
        &self,
        allocator: &impl FrameAllocator,
        entry: &mut u64,
        level: Level,
    ) -> Result<(), EptError> {
        let next = level.next().ok_or(EptError::Misaligned)?;
        let mut frame: Frame = allocator
            .allocate_frame()
            .ok_or(EptError::OutOfMemory)?
            .zeroed();
        let base = *entry & ADDRESS_MASK;
        let mut flags = entry_flags(*entry);
        if next == Level::L1 {
            flags -= EptEntryFlags::PAGE;
        }
        for (idx, child) in frame.as_array_page().iter_mut().enumerate() {
            *child = (base + idx as u64 * next.area_size()) | flags.bits();
        }
        *entry = frame.phys_addr.as_u64() | EptEntryFlags::RWX.bits();
        Ok(())
    }

    /// Returns the host physical address backing `gpa` and the size of the leaf mapping it.
    pub fn translate(&self, gpa: GuestPhysAddr) -> Option<(HostPhysAddr, usize)> {
        if gpa.as_u64() >= ADDRESS_SPACE_END {
            return None;
        }
        let mut found = None;
        let result = unsafe {
            self.walk(gpa, &mut |entry, level| {
                if !is_present(*entry) {
                    return WalkNext::Abort;
                }
                if !is_leaf(*entry, level) {
                    return WalkNext::Continue;
                }
                let size = level.area_size();
                let hpa = (*entry & ADDRESS_MASK) + (gpa.as_u64() & (size - 1));
                found = Some((HostPhysAddr::new(hpa as usize), size as usize));
                WalkNext::Leaf
            })
        };
        result.ok().and(found)
    }

    /// Calls `callback` on every present leaf, in increasing guest physical address order.
    pub fn for_each_leaf<F>(&self, callback: &mut F)
    where
        F: FnMut(EptLeaf),
    {
        // The walk is never aborted.
        let _ = unsafe {
            self.walk_range(
                GuestPhysAddr::zero(),
                GuestPhysAddr::new(ADDRESS_SPACE_END as usize),
                &mut |addr, entry, level| {
                    if !is_present(*entry) {
                        return WalkNext::Leaf;
                    }
                    if !is_leaf(*entry, level) {
                        return WalkNext::Continue;
                    }
                    callback(EptLeaf {
                        gpa: GuestPhysAddr::new((addr.as_u64() & level.mask()) as usize),
                        hpa: HostPhysAddr::new((*entry & ADDRESS_MASK) as usize),
                        size: level.area_size() as usize,
                        flags: entry_flags(*entry),
                    });
                    WalkNext::Leaf
                },
            )
        };
    }

    /// Frees all the page table pages and clears the root.
    pub fn destroy(&mut self, allocator: &impl FrameAllocator) {
        let mut leaked = 0;
        let _ = unsafe {
            self.cleanup_range(
                GuestPhysAddr::zero(),
                GuestPhysAddr::new(ADDRESS_SPACE_END as usize),
                &mut |_, entry, level| {
                    if is_present(*entry) && !is_leaf(*entry, level) {
                        WalkNext::Continue
                    } else {
                        WalkNext::Leaf
                    }
                },
                &mut |page| {
                    if allocator.free_frame(page).is_err() {
                        leaked += 1;
                    }
                },
            )
        };
        if leaked != 0 {
            log::warn!("EPT: failed to free {} page table pages", leaked);
        }
        let root = self.translate_root();
        unsafe { core::ptr::write_bytes(root.as_usize() as *mut u8, 0, PAGE_SIZE) };
    }

    fn translate_root(&self) -> HostVirtAddr {
        Walker::translate(self, self.root)
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
