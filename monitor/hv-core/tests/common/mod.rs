//! Host-side harness: a recording platform, a heap frame allocator and the software VMCS.
#![allow(dead_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use hv_core::arch::CpuidResult;
use hv_core::vcr::CrFixedBits;
use hv_core::vmexit::dispatch_vmexit;
use hv_core::{HvError, Platform, Severity, Vcpu, Vm, VmConfig, VmState};
use mmu::FrameAllocator;
use utils::{Frame, HostPhysAddr, HostVirtAddr};
use vmx::fields::{GeneralPurposeField, GuestRegister, VmcsField};
use vmx::{SoftVmcs, VmxError};

pub const PAGE_SIZE: usize = 0x1000;

pub const RAX: GuestRegister = GuestRegister::Gp(GeneralPurposeField::Rax);
pub const RBX: GuestRegister = GuestRegister::Gp(GeneralPurposeField::Rbx);
pub const RCX: GuestRegister = GuestRegister::Gp(GeneralPurposeField::Rcx);
pub const RDX: GuestRegister = GuestRegister::Gp(GeneralPurposeField::Rdx);

#[rustfmt::skip]
pub const FIXED_BITS: CrFixedBits = CrFixedBits {
    cr0_fixed0: 0x8000_0021,
    cr0_fixed1: 0xFFFF_FFFF,
    cr4_fixed0: 0x0000_2000,
    cr4_fixed1: 0x0037_27FF,
};

// ———————————————————————————————— Allocator ——————————————————————————————— //

fn page_layout(count: usize) -> Layout {
    Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap()
}

/// Frames are page-aligned heap allocations, physical and virtual addresses are equal.
#[derive(Default)]
pub struct HeapAllocator {
    live: AtomicUsize,
}

impl HeapAllocator {
    /// Number of frames currently allocated.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

unsafe impl FrameAllocator for HeapAllocator {
    fn allocate_frame(&self) -> Option<Frame> {
        let ptr = unsafe { alloc_zeroed(page_layout(1)) } as usize;
        self.live.fetch_add(1, Ordering::SeqCst);
        Some(unsafe { Frame::new(HostPhysAddr::new(ptr), HostVirtAddr::new(ptr)) })
    }

    fn free_frame(&self, frame: HostPhysAddr) -> Result<(), ()> {
        unsafe { dealloc(frame.as_usize() as *mut u8, page_layout(1)) };
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_physical_offset(&self) -> HostVirtAddr {
        HostVirtAddr::new(0)
    }
}

/// Zeroed host memory used as guest RAM, never freed.
pub fn host_pages(count: usize) -> HostPhysAddr {
    HostPhysAddr::new(unsafe { alloc_zeroed(page_layout(count)) } as usize)
}

// ————————————————————————————————— Platform ——————————————————————————————— //

#[derive(Default)]
pub struct MockPlatform {
    pub allocator: HeapAllocator,
    pub pcpu: AtomicUsize,
    pub reschedules: AtomicUsize,
    /// Number of times a run loop yielded.
    pub yields: AtomicUsize,
    /// Work done by the other cores while a run loop yields.
    pub on_yield: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    pub kicks: Mutex<Vec<usize>>,
    pub shutdowns: Mutex<Vec<usize>>,
    /// `(hva, size)` of each cache flush.
    pub flushes: Mutex<Vec<(usize, usize)>>,
    pub cpuid_calls: Mutex<Vec<(u32, u32)>>,
    pub xcr0_writes: Mutex<Vec<u64>>,
    /// MSRs emulated by the platform.
    pub msrs: Mutex<Vec<(u32, u64)>>,
    pub halts: AtomicUsize,
    pub lapic_resets: AtomicUsize,
    pub invepts: AtomicUsize,
    pub invvpids: AtomicUsize,
    pub cr2: AtomicU64,
}

impl MockPlatform {
    pub fn flushes(&self) -> Vec<(usize, usize)> {
        self.flushes.lock().unwrap().clone()
    }

    pub fn shutdowns(&self) -> Vec<usize> {
        self.shutdowns.lock().unwrap().clone()
    }

    pub fn kicks(&self) -> Vec<usize> {
        self.kicks.lock().unwrap().clone()
    }

    pub fn yields(&self) -> usize {
        self.yields.load(Ordering::SeqCst)
    }

    pub fn set_on_yield(&self, work: impl Fn() + Send + Sync + 'static) {
        *self.on_yield.lock().unwrap() = Some(Box::new(work));
    }
}

impl Platform for MockPlatform {
    type Vmcs = SoftVmcs;
    type Allocator = HeapAllocator;

    fn allocator(&self) -> &HeapAllocator {
        &self.allocator
    }

    fn current_pcpu(&self) -> usize {
        self.pcpu.load(Ordering::SeqCst)
    }

    fn kick(&self, pcpu: usize) {
        self.kicks.lock().unwrap().push(pcpu);
    }

    fn need_reschedule(&self, _pcpu: usize) -> bool {
        self.reschedules.load(Ordering::SeqCst) > 0
    }

    fn schedule(&self, _pcpu: usize) {
        let _ = self
            .reschedules
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let yields = self.yields.fetch_add(1, Ordering::SeqCst);
        assert!(yields < 1000, "run loop never goes offline");
        if let Some(work) = self.on_yield.lock().unwrap().as_ref() {
            work();
        }
    }

    fn reset_lapic(&self, _vm_id: usize, _vcpu_id: usize) {
        self.lapic_resets.fetch_add(1, Ordering::SeqCst);
    }

    fn vcpu_halted(&self, _vm_id: usize, _vcpu_id: usize) {
        self.halts.fetch_add(1, Ordering::SeqCst);
    }

    fn emulate_rdmsr(&self, _vm_id: usize, _vcpu_id: usize, msr: u32) -> Option<u64> {
        self.msrs
            .lock()
            .unwrap()
            .iter()
            .find(|(addr, _)| *addr == msr)
            .map(|(_, value)| *value)
    }

    fn emulate_wrmsr(&self, _vm_id: usize, _vcpu_id: usize, msr: u32, value: u64) -> Result<(), ()> {
        let mut msrs = self.msrs.lock().unwrap();
        let slot = msrs.iter_mut().find(|(addr, _)| *addr == msr).ok_or(())?;
        slot.1 = value;
        Ok(())
    }

    fn shutdown_vm(&self, vm_id: usize) {
        self.shutdowns.lock().unwrap().push(vm_id);
    }

    fn fatal(&self, args: fmt::Arguments) -> ! {
        panic!("platform halted: {}", args)
    }

    #[rustfmt::skip]
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.cpuid_calls.lock().unwrap().push((leaf, subleaf));
        match (leaf, subleaf) {
            // VMX, OSXSAVE and SSE3 set, initial APIC ID 3
            (0x1, _) => CpuidResult { eax: 0x906ea, ebx: 0x0310_0800, ecx: 0x0800_0021, edx: 0x1 },
            // MPX, and PKU, OSPKE and WAITPKG set
            (0x7, 0) => CpuidResult { eax: 0, ebx: 0x4001, ecx: 0x3d, edx: 0 },
            (0xb, _) => CpuidResult { eax: 1, ebx: 2, ecx: 0x100, edx: 7 },
            (0xd, 0) => CpuidResult { eax: 0x1f, ebx: 0x440, ecx: 0x440, edx: 0 },
            _ => CpuidResult { eax: leaf, ebx: subleaf, ecx: 0, edx: 0 },
        }
    }

    fn max_phys_addr_bits(&self) -> u8 {
        39
    }

    fn cr_fixed_bits(&self) -> CrFixedBits {
        FIXED_BITS
    }

    fn write_xcr0(&self, value: u64) {
        self.xcr0_writes.lock().unwrap().push(value);
    }

    fn flush_cache_range(&self, hva: HostVirtAddr, size: usize) {
        self.flushes.lock().unwrap().push((hva.as_usize(), size));
    }

    fn stac(&self) {}

    fn clac(&self) {}

    fn read_cr2(&self) -> u64 {
        self.cr2.load(Ordering::SeqCst)
    }

    fn write_cr2(&self, cr2: u64) {
        self.cr2.store(cr2, Ordering::SeqCst);
    }

    fn invept(&self, _eptp: u64) -> Result<(), VmxError> {
        self.invepts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn invvpid(&self, _vpid: u16) -> Result<(), VmxError> {
        self.invvpids.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ————————————————————————————————— Helpers ———————————————————————————————— //

pub type TestVm = Vm<MockPlatform>;
pub type TestVcpu = Vcpu<'static, MockPlatform>;

pub fn config(severity: Severity) -> VmConfig {
    VmConfig::new("test", severity)
}

/// The VM is powered off as soon as a run loop yields after its shutdown.
pub fn new_vm(config: VmConfig) -> (&'static MockPlatform, &'static TestVm) {
    let platform: &'static MockPlatform = Box::leak(Box::new(MockPlatform::default()));
    let vm: &'static TestVm = Box::leak(Box::new(Vm::new(0, config, platform).unwrap()));
    platform.set_on_yield(move || power_off_if_stopped(vm));
    (platform, vm)
}

pub fn power_off_if_stopped(vm: &TestVm) {
    if vm.state() == VmState::PoweringOff {
        vm.power_off().unwrap();
    }
}

/// A running vCPU whose VMCS holds the power-on state.
pub fn running_vcpu(vm: &'static TestVm) -> TestVcpu {
    let mut vcpu = vm.create_vcpu(0, SoftVmcs::new()).unwrap();
    vcpu.handle_pending_requests().unwrap();
    vcpu.start().unwrap();
    vcpu
}

pub fn standard_vcpu() -> (&'static MockPlatform, &'static TestVm, TestVcpu) {
    let (platform, vm) = new_vm(config(Severity::StandardVm));
    let vcpu = running_vcpu(vm);
    (platform, vm, vcpu)
}

/// Simulates a VM exit and dispatches it.
pub fn exit(vcpu: &mut TestVcpu, reason: u32, qualification: usize) -> Result<(), HvError> {
    vcpu.vmcs
        .set_exit_field(VmcsField::ExitQualification, qualification)
        .unwrap();
    vcpu.arch.exit_reason = reason;
    dispatch_vmexit(vcpu)
}

/// Puts the guest in protected mode with paging, and long mode if `long_mode` is set.
pub fn enable_paging(vcpu: &mut TestVcpu, long_mode: bool) {
    use vmx::bitmaps::{Cr0Flags, Cr4Flags, EferFlags};

    vcpu.set_cr0(Cr0Flags::PE.bits() | Cr0Flags::ET.bits(), false).unwrap();
    if long_mode {
        vcpu.set_cr4(Cr4Flags::PAE.bits(), false).unwrap();
        vcpu.set_efer(EferFlags::LME.bits()).unwrap();
    }
    let cr0 = vcpu.get_cr0().unwrap();
    vcpu.set_cr0(cr0 | Cr0Flags::PG.bits(), false).unwrap();
    assert!(vcpu.arch.pending_exception().is_none());
}
