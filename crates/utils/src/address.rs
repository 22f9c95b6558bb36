//! Typed addresses
//!
//! Host and guest addresses are distinct types so that a guest-physical address cannot reach the
//! host without going through a translation.

use core::fmt;
use core::ops::{Add, Sub};

macro_rules! address_type {
    ($($(#[$doc:meta])* $name:ident;)*) => {$(
        $(#[$doc])*
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn new(addr: usize) -> Self {
                $name(addr)
            }

            #[inline]
            pub const fn zero() -> Self {
                $name(0)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// `align` must be a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                self.0 & (align - 1) == 0
            }

            /// `None` if the result overflows.
            #[inline]
            pub const fn checked_add(self, offset: usize) -> Option<Self> {
                match self.0.checked_add(offset) {
                    Some(addr) => Some($name(addr)),
                    None => None,
                }
            }
        }

        impl Add<usize> for $name {
            type Output = $name;

            fn add(self, offset: usize) -> $name {
                $name(self.0 + offset)
            }
        }

        /// Distance in bytes between two addresses.
        impl Sub for $name {
            type Output = usize;

            fn sub(self, base: $name) -> usize {
                self.0 - base.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    )*};
}

address_type! {
    /// An address in the guest-physical space, translated by the EPT.
    GuestPhysAddr;
    /// A machine address.
    HostPhysAddr;
    /// An address in the hypervisor's own address space.
    HostVirtAddr;
}
