//! Memory Management Unit

#![cfg_attr(not(test), no_std)]
pub mod eptmapper;
pub mod frame_allocator;
pub mod walker;

pub use eptmapper::{EptError, EptLeaf, EptMapper, EptPolicy};
pub use frame_allocator::FrameAllocator;
