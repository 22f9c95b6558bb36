//! Collaborators of the hypervisor core
//!
//! The core does not own the scheduler, the interrupt controller nor the device models. It reaches
//! them through [Platform], whose hardware hooks default to the native instructions.

use core::fmt;

use mmu::FrameAllocator;
use utils::HostVirtAddr;
use vmx::ept::InvalidationType;
use vmx::{msr, VmcsAccess, VmxError};

use crate::arch::{self, CpuidResult};
use crate::vcr::CrFixedBits;

pub trait Platform: Sync + 'static {
    type Vmcs: VmcsAccess;
    type Allocator: FrameAllocator;

    /// Allocator for page table pages, also defines the host direct map.
    fn allocator(&self) -> &Self::Allocator;

    // ——————————————————————————— Scheduling ———————————————————————————— //

    /// Raw identifier of the executing physical core.
    fn current_pcpu(&self) -> usize;

    /// Sends an inter-processor kick, forcing a VM exit on the target core.
    fn kick(&self, pcpu: usize);

    fn need_reschedule(&self, pcpu: usize) -> bool;

    /// Yields to the scheduler, returns when this vCPU is picked again.
    fn schedule(&self, pcpu: usize);

    // ———————————————————————— Virtual devices ———————————————————————— //

    fn reset_lapic(&self, vm_id: usize, vcpu_id: usize);

    fn vcpu_halted(&self, vm_id: usize, vcpu_id: usize);

    /// Returns `None` if the MSR is not emulated.
    fn emulate_rdmsr(&self, vm_id: usize, vcpu_id: usize, msr: u32) -> Option<u64>;

    fn emulate_wrmsr(&self, vm_id: usize, vcpu_id: usize, msr: u32, value: u64) -> Result<(), ()>;

    // —————————————————————————— Fatal paths ——————————————————————————— //

    /// Tears down a VM whose vCPUs are all being stopped.
    fn shutdown_vm(&self, vm_id: usize);

    fn fatal(&self, args: fmt::Arguments) -> !;

    // ———————————————————————— Hardware hooks ————————————————————————— //

    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        arch::cpuid(leaf, subleaf)
    }

    fn max_phys_addr_bits(&self) -> u8 {
        arch::max_phys_addr_bits()
    }

    fn cr_fixed_bits(&self) -> CrFixedBits {
        // SAFETY: the fixed bits MSRs exist on VMX capable CPUs.
        unsafe {
            CrFixedBits {
                cr0_fixed0: msr::VMX_CR0_FIXED0.read(),
                cr0_fixed1: msr::VMX_CR0_FIXED1.read(),
                cr4_fixed0: msr::VMX_CR4_FIXED0.read(),
                cr4_fixed1: msr::VMX_CR4_FIXED1.read(),
            }
        }
    }

    fn write_xcr0(&self, value: u64) {
        // SAFETY: the value has been validated against the supported features.
        unsafe { arch::xsetbv(0, value) }
    }

    fn flush_cache_range(&self, hva: HostVirtAddr, size: usize) {
        arch::flush_cache_range(hva, size)
    }

    fn stac(&self) {
        unsafe { arch::stac() }
    }

    fn clac(&self) {
        unsafe { arch::clac() }
    }

    fn read_cr2(&self) -> u64 {
        arch::read_cr2()
    }

    fn write_cr2(&self, cr2: u64) {
        unsafe { arch::write_cr2(cr2) }
    }

    fn invept(&self, eptp: u64) -> Result<(), VmxError> {
        unsafe { vmx::raw::invept(InvalidationType::SingleContext, eptp) }
    }

    fn invvpid(&self, vpid: u16) -> Result<(), VmxError> {
        unsafe { vmx::raw::invvpid(InvalidationType::SingleContext, vpid) }
    }
}

#[cfg(not(feature = "bare_metal"))]
pub fn remap_core(core: usize) -> usize {
    core
}

#[cfg(feature = "bare_metal")]
pub fn remap_core(core: usize) -> usize {
    // Our hardware has hyper-threads, and renames all co-located threads
    if core < 8 {
        core * 2
    } else {
        (core - 8) * 2 + 1
    }
}
