//! Hypervisor core
//!
//! VM exit handling and virtual CPU state machine of an x86-64 VMX hypervisor. The layers, from
//! the leaves up:
//!
//! - [ept] and [guest_mem]: guest physical memory, backed by extended page tables.
//! - [vcr]: emulation of the guest CR0 and CR4.
//! - [virq]: exception queuing, double fault escalation and event injection.
//! - [vmexit]: the VM exit dispatch table and its handlers.
//! - [run_loop]: the per-vCPU loop tying everything together.
//!
//! Everything outside of this core (scheduler, interrupt controller, device models, VM lifecycle
//! orchestration) is reached through the [Platform] trait.
#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod cpuid;
pub mod ept;
pub mod error;
pub mod guest_mem;
pub mod platform;
pub mod run_loop;
pub mod vcpu;
pub mod vcr;
pub mod virq;
pub mod vm;
pub mod vmexit;

pub use config::{Severity, VcpuInitState, VmConfig};
pub use error::HvError;
pub use platform::Platform;
pub use vcpu::{Requests, Vcpu, VcpuState};
pub use vm::{Vm, VmState};

/// Installs the serial logger.
pub fn init_logging(level: log::LevelFilter) {
    logger::init(level);
    log::info!("hv-core logging at level {}", level);
}
