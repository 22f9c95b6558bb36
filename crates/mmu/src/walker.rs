//! Four-level table walks
//!
//! Shared by the EPT mapper: a walk visits the entries that control the mapping of an address, or
//! of every address in a range, and hands each of them to a callback that decides whether to go
//! one level down.

use core::slice;

use utils::{GuestPhysAddr, HostPhysAddr, HostVirtAddr};

const ENTRIES_PER_TABLE: usize = 512;
const INDEX_BITS: u32 = 9;
const PAGE_SHIFT: u32 = 12;

/// Bits 51:12 of an entry, the physical address of the next table or of the mapped page.
pub const ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

/// First address beyond what a 4-level table translates.
pub const ADDRESS_SPACE_END: u64 = 1 << 48;

// —————————————————————————————— Page Levels ——————————————————————————————— //

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    L4,
    L3,
    L2,
    L1,
}

impl Level {
    /// The level of the tables referenced by entries of this level.
    pub fn next(self) -> Option<Self> {
        match self {
            Level::L4 => Some(Level::L3),
            Level::L3 => Some(Level::L2),
            Level::L2 => Some(Level::L1),
            Level::L1 => None,
        }
    }

    /// Position of the lowest address bit selecting an entry at this level.
    fn shift(self) -> u32 {
        let depth = match self {
            Level::L1 => 0,
            Level::L2 => 1,
            Level::L3 => 2,
            Level::L4 => 3,
        };
        PAGE_SHIFT + depth * INDEX_BITS
    }

    /// Bytes translated by a single entry.
    pub fn area_size(self) -> u64 {
        1 << self.shift()
    }

    /// Clears the offset within an entry's area.
    pub fn mask(self) -> u64 {
        !(self.area_size() - 1)
    }

    fn index_of(self, addr: u64) -> usize {
        (addr >> self.shift()) as usize & (ENTRIES_PER_TABLE - 1)
    }
}

// ——————————————————————————————— Addresses ———————————————————————————————— //

/// Address types a walk can be expressed in.
pub trait Address: Sized + Copy + Ord {
    fn from_u64(addr: u64) -> Self;
    fn as_u64(self) -> u64;
}

macro_rules! impl_address {
    ($($ty:ty),*) => {
        $(impl Address for $ty {
            #[inline]
            fn from_u64(addr: u64) -> Self {
                Self::new(addr as usize)
            }

            #[inline]
            fn as_u64(self) -> u64 {
                <$ty>::as_u64(self)
            }
        })*
    };
}

impl_address!(GuestPhysAddr, HostPhysAddr);

// ————————————————————————————————— Walker ————————————————————————————————— //

/// What the walk does after visiting an entry.
pub enum WalkNext {
    /// Descend into the table referenced by the entry.
    Continue,
    /// The entry maps memory, do not descend.
    Leaf,
    /// Stop the walk with an error.
    Abort,
}

/// A 4-level table that can be walked.
///
/// Entries are handed out as `&mut u64` from a shared reference, callers serialize concurrent
/// modifications of the same table.
///
/// SAFETY: `translate` returns a valid, writable mapping of every table page reachable from
/// `root`.
pub unsafe trait Walker {
    type PhysAddr: Address;
    type VirtAddr: Address;

    /// Host virtual address at which a table page can be accessed.
    fn translate(&self, phys_addr: Self::PhysAddr) -> HostVirtAddr;

    /// The top table and its level.
    fn root(&self) -> (Self::PhysAddr, Level);

    /// Visits the entries translating `addr`, from the root down.
    unsafe fn walk<F>(&self, addr: Self::VirtAddr, callback: &mut F) -> Result<(), ()>
    where
        F: FnMut(&mut u64, Level) -> WalkNext,
    {
        let (mut table, mut level) = self.root();
        loop {
            let entry = &mut table_at(self.translate(table))[level.index_of(addr.as_u64())];
            match callback(entry, level) {
                WalkNext::Continue => {}
                WalkNext::Leaf => return Ok(()),
                WalkNext::Abort => return Err(()),
            }
            match level.next() {
                Some(next) => level = next,
                None => return Ok(()),
            }
            table = Self::PhysAddr::from_u64(*entry & ADDRESS_MASK);
        }
    }

    /// Visits every entry translating part of `[start, end)`. The callback receives the first
    /// address of the range that the entry translates.
    unsafe fn walk_range<F>(
        &self,
        start: Self::VirtAddr,
        end: Self::VirtAddr,
        callback: &mut F,
    ) -> Result<(), ()>
    where
        F: FnMut(Self::VirtAddr, &mut u64, Level) -> WalkNext,
    {
        self.cleanup_range(start, end, callback, &mut |_| {})
    }

    /// Same as `walk_range`, then hands `cleanup` every table below the root whose whole area
    /// lies within `[start, end)`, once its entries have been visited.
    unsafe fn cleanup_range<F, C>(
        &self,
        start: Self::VirtAddr,
        end: Self::VirtAddr,
        callback: &mut F,
        cleanup: &mut C,
    ) -> Result<(), ()>
    where
        F: FnMut(Self::VirtAddr, &mut u64, Level) -> WalkNext,
        C: FnMut(Self::PhysAddr),
    {
        let (root, level) = self.root();
        let mut walk = RangeWalk {
            walker: self,
            end,
            callback,
            cleanup,
        };
        walk.table(root, level, start)
    }
}

struct RangeWalk<'a, W: ?Sized + Walker, F, C> {
    walker: &'a W,
    end: W::VirtAddr,
    callback: &'a mut F,
    cleanup: &'a mut C,
}

impl<W, F, C> RangeWalk<'_, W, F, C>
where
    W: ?Sized + Walker,
    F: FnMut(W::VirtAddr, &mut u64, Level) -> WalkNext,
    C: FnMut(W::PhysAddr),
{
    unsafe fn table(
        &mut self,
        phys: W::PhysAddr,
        level: Level,
        from: W::VirtAddr,
    ) -> Result<(), ()> {
        let table = table_at(self.walker.translate(phys));
        let end = self.end.as_u64();
        let mut addr = from.as_u64();

        for entry in table[level.index_of(addr)..].iter_mut() {
            if addr >= end {
                break;
            }
            match (*self.callback)(W::VirtAddr::from_u64(addr), entry, level) {
                WalkNext::Abort => return Err(()),
                WalkNext::Leaf => {}
                WalkNext::Continue => {
                    if let Some(next) = level.next() {
                        let child = W::PhysAddr::from_u64(*entry & ADDRESS_MASK);
                        self.table(child, next, W::VirtAddr::from_u64(addr))?;
                        let aligned = addr & !level.mask() == 0;
                        if aligned && end - addr >= level.area_size() {
                            (*self.cleanup)(child);
                        }
                    }
                }
            }
            // The first entry visited may start mid-area
            addr = match (addr & level.mask()).checked_add(level.area_size()) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(())
    }
}

unsafe fn table_at<'a>(addr: HostVirtAddr) -> &'a mut [u64] {
    slice::from_raw_parts_mut(addr.as_usize() as *mut u64, ENTRIES_PER_TABLE)
}
