//! Virtual CPUs
//!
//! A vCPU is split in two halves. The [VcpuShared] half lives in the VM and is reachable from any
//! core: it holds the execution state and the pending requests bitmap. The [Vcpu] half is owned by
//! the run loop of the bound physical core and holds the VMCS and the register context.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;
use vmx::bitmaps::{EferFlags, EntryControls};
use vmx::fields::{GuestRegister, VmcsField, REGFILE_SIZE};
use vmx::{VmcsAccess, VmxExitReason};

use crate::config::NR_EXIT_REASONS;
use crate::error::HvError;
use crate::platform::Platform;
use crate::vcr;
use crate::vm::Vm;

// ——————————————————————————————— vCPU State ——————————————————————————————— //

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuState {
    Init,
    Running,
    Paused,
    Zombie,
    Offline,
}

impl VcpuState {
    pub fn can_transition_to(self, to: VcpuState) -> bool {
        use VcpuState::*;
        matches!(
            (self, to),
            (Init, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Init | Running | Paused, Zombie)
                | (Zombie, Offline)
                | (Zombie | Paused, Init)
        )
    }
}

// ————————————————————————————— Pending Requests ——————————————————————————— //

bitflags! {
    /// Asynchronous requests, handled before the next VM entry.
    pub struct Requests: u64 {
        const EXCEPTION    = 1 << 0;
        const EPT_FLUSH    = 1 << 1;
        const NMI          = 1 << 2;
        const LAPIC_RESET  = 1 << 3;
        const INIT_VMCS    = 1 << 4;
        const TRIPLE_FAULT = 1 << 5;
        const VPID_FLUSH   = 1 << 6;
    }
}

/// Lock-free request bitmap, any core can post requests.
pub struct PendingRequests(AtomicU64);

impl PendingRequests {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn make(&self, requests: Requests) {
        self.0.fetch_or(requests.bits(), Ordering::SeqCst);
    }

    /// Clears the requests, returns true if any of them was pending.
    pub fn test_and_clear(&self, requests: Requests) -> bool {
        let previous = self.0.fetch_and(!requests.bits(), Ordering::SeqCst);
        previous & requests.bits() != 0
    }

    pub fn pending(&self) -> Requests {
        Requests::from_bits_truncate(self.0.load(Ordering::SeqCst))
    }

    pub fn clear_all(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

/// The part of a vCPU shared with other cores.
pub struct VcpuShared {
    pcpu_id: usize,
    created: AtomicBool,
    state: Mutex<VcpuState>,
    requests: PendingRequests,
}

impl VcpuShared {
    pub(crate) fn new(pcpu_id: usize) -> Self {
        Self {
            pcpu_id,
            created: AtomicBool::new(false),
            state: Mutex::new(VcpuState::Init),
            requests: PendingRequests::new(),
        }
    }

    pub fn pcpu_id(&self) -> usize {
        self.pcpu_id
    }

    pub fn state(&self) -> VcpuState {
        *self.state.lock()
    }

    pub fn requests(&self) -> &PendingRequests {
        &self.requests
    }

    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    /// Marks the slot as used, fails if it already was.
    pub(crate) fn claim(&self) -> bool {
        !self.created.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn transition(&self, to: VcpuState) -> Result<(), HvError> {
        let mut state = self.state.lock();
        if !state.can_transition_to(to) {
            return Err(HvError::InvalidStateTransition { from: *state, to });
        }
        *state = to;
        Ok(())
    }
}

// ———————————————————————————— Register Context ———————————————————————————— //

bitflags! {
    /// Registers whose value in [ArchContext] is up to date with the VMCS.
    pub struct CachedRegs: u32 {
        const CR0    = 1 << 0;
        const CR4    = 1 << 1;
        const EFER   = 1 << 2;
        const RIP    = 1 << 3;
        const RFLAGS = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingException {
    pub vector: u8,
    pub error_code: u32,
}

pub struct ArchContext {
    /// General purpose registers, restored on VM entry and saved on VM exit.
    pub regs: [usize; REGFILE_SIZE],
    pub(crate) rip: u64,
    pub(crate) rflags: u64,
    pub(crate) cr0: u64,
    pub(crate) cr4: u64,
    pub(crate) efer: u64,
    pub(crate) cached: CachedRegs,
    /// CR2 is not part of the VMCS, it is loaded by hand around VM entries.
    pub cr2: u64,
    /// PAT as seen by the guest, the hardware PAT is all-UC while CR0.CD is set.
    pub(crate) guest_pat: u64,
    /// Length of the instruction to skip on the next VM entry, 0 retains RIP.
    pub inst_len: usize,
    pub exit_reason: u32,
    pub exit_qualification: usize,
    /// Raw IDT-vectoring information of the last exit, cleared once handled.
    pub idt_vectoring_info: u32,
    pub(crate) exception: Option<PendingException>,
}

impl ArchContext {
    pub const fn new() -> Self {
        Self {
            regs: [0; REGFILE_SIZE],
            rip: 0,
            rflags: 0,
            cr0: 0,
            cr4: 0,
            efer: 0,
            cached: CachedRegs::empty(),
            cr2: 0,
            guest_pat: 0,
            inst_len: 0,
            exit_reason: 0,
            exit_qualification: 0,
            idt_vectoring_info: 0,
            exception: None,
        }
    }

    pub fn pending_exception(&self) -> Option<PendingException> {
        self.exception
    }
}

impl Default for ArchContext {
    fn default() -> Self {
        Self::new()
    }
}

// —————————————————————————————————— vCPU —————————————————————————————————— //

pub struct Vcpu<'vm, P: Platform + 'static> {
    vm: &'vm Vm<P>,
    shared: &'vm VcpuShared,
    id: usize,
    vpid: u16,
    pub vmcs: P::Vmcs,
    pub arch: ArchContext,
    nr_exits: u64,
    exit_counts: [u64; NR_EXIT_REASONS],
}

impl<'vm, P: Platform> Vcpu<'vm, P> {
    pub(crate) fn new(
        vm: &'vm Vm<P>,
        shared: &'vm VcpuShared,
        id: usize,
        vpid: u16,
        vmcs: P::Vmcs,
    ) -> Self {
        Self {
            vm,
            shared,
            id,
            vpid,
            vmcs,
            arch: ArchContext::new(),
            nr_exits: 0,
            exit_counts: [0; NR_EXIT_REASONS],
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn vm(&self) -> &'vm Vm<P> {
        self.vm
    }

    pub fn platform(&self) -> &'static P {
        self.vm.platform()
    }

    fn shared(&self) -> &'vm VcpuShared {
        self.shared
    }

    pub fn pcpu_id(&self) -> usize {
        self.shared().pcpu_id()
    }

    pub fn vpid(&self) -> u16 {
        self.vpid
    }

    pub fn state(&self) -> VcpuState {
        self.shared().state()
    }

    pub fn requests(&self) -> &'vm PendingRequests {
        self.shared().requests()
    }

    /// Posts a request from the vCPU's own core.
    pub fn make_request(&self, requests: Requests) {
        self.requests().make(requests);
    }

    // ————————————————————————————— Transitions ————————————————————————————— //

    pub fn start(&self) -> Result<(), HvError> {
        self.shared().transition(VcpuState::Running)
    }

    pub fn pause(&self) -> Result<(), HvError> {
        self.shared().transition(VcpuState::Paused)
    }

    pub fn resume(&self) -> Result<(), HvError> {
        self.shared().transition(VcpuState::Running)
    }

    pub fn zombie(&self) -> Result<(), HvError> {
        self.shared().transition(VcpuState::Zombie)
    }

    pub fn offline(&self) -> Result<(), HvError> {
        self.shared().transition(VcpuState::Offline)
    }

    /// Puts the vCPU back in its power-on state, the VMCS is initialized again before the next
    /// entry.
    pub fn reset(&mut self) -> Result<(), HvError> {
        self.shared().transition(VcpuState::Init)?;
        self.requests().clear_all();
        self.arch = ArchContext::new();
        self.vmcs.clear()?;
        self.make_request(Requests::INIT_VMCS);
        Ok(())
    }

    // —————————————————————————————— Statistics ————————————————————————————— //

    pub fn nr_exits(&self) -> u64 {
        self.nr_exits
    }

    pub fn exit_count(&self, reason: VmxExitReason) -> u64 {
        self.exit_counts
            .get(reason.as_u16() as usize)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn record_exit(&mut self, basic_reason: usize) {
        self.nr_exits += 1;
        if let Some(count) = self.exit_counts.get_mut(basic_reason) {
            *count += 1;
        }
    }

    // ——————————————————————————————— Registers ————————————————————————————— //

    pub fn get_gpreg(&self, reg: GuestRegister) -> Result<u64, HvError> {
        match reg {
            GuestRegister::Gp(gp) => Ok(self.arch.regs[gp.index()] as u64),
            GuestRegister::Rsp => Ok(self.vmcs.get(VmcsField::GuestRsp)? as u64),
        }
    }

    pub fn set_gpreg(&mut self, reg: GuestRegister, value: u64) -> Result<(), HvError> {
        match reg {
            GuestRegister::Gp(gp) => self.arch.regs[gp.index()] = value as usize,
            GuestRegister::Rsp => self.vmcs.set(VmcsField::GuestRsp, value as usize)?,
        }
        Ok(())
    }

    fn cached_read(&mut self, reg: CachedRegs, field: VmcsField) -> Result<u64, HvError> {
        if !self.arch.cached.contains(reg) {
            let value = self.vmcs.get(field)? as u64;
            *self.cached_slot(reg) = value;
            self.arch.cached.insert(reg);
        }
        Ok(*self.cached_slot(reg))
    }

    fn cached_write(&mut self, reg: CachedRegs, field: VmcsField, value: u64) -> Result<(), HvError> {
        self.vmcs.set(field, value as usize)?;
        *self.cached_slot(reg) = value;
        self.arch.cached.insert(reg);
        Ok(())
    }

    fn cached_slot(&mut self, reg: CachedRegs) -> &mut u64 {
        if reg == CachedRegs::RIP {
            &mut self.arch.rip
        } else if reg == CachedRegs::RFLAGS {
            &mut self.arch.rflags
        } else if reg == CachedRegs::EFER {
            &mut self.arch.efer
        } else if reg == CachedRegs::CR4 {
            &mut self.arch.cr4
        } else {
            &mut self.arch.cr0
        }
    }

    pub fn get_rip(&mut self) -> Result<u64, HvError> {
        self.cached_read(CachedRegs::RIP, VmcsField::GuestRip)
    }

    pub fn set_rip(&mut self, rip: u64) -> Result<(), HvError> {
        self.cached_write(CachedRegs::RIP, VmcsField::GuestRip, rip)
    }

    pub fn get_rflags(&mut self) -> Result<u64, HvError> {
        self.cached_read(CachedRegs::RFLAGS, VmcsField::GuestRflags)
    }

    pub fn set_rflags(&mut self, rflags: u64) -> Result<(), HvError> {
        self.cached_write(CachedRegs::RFLAGS, VmcsField::GuestRflags, rflags)
    }

    pub fn get_efer(&mut self) -> Result<u64, HvError> {
        self.cached_read(CachedRegs::EFER, VmcsField::GuestIa32Efer)
    }

    pub fn set_efer(&mut self, efer: u64) -> Result<(), HvError> {
        self.cached_write(CachedRegs::EFER, VmcsField::GuestIa32Efer, efer)
    }

    /// Re-executes the current instruction on the next entry.
    pub fn retain_rip(&mut self) {
        self.arch.inst_len = 0;
    }

    /// Drops all cached registers, the guest may have modified them.
    pub(crate) fn invalidate_cache(&mut self) {
        self.arch.cached = CachedRegs::empty();
    }

    /// Forgets the cached value of a control register after it was written.
    pub(crate) fn uncache(&mut self, reg: CachedRegs) {
        self.arch.cached.remove(reg);
    }

    // ———————————————————————————— Initialization ——————————————————————————— //

    /// Loads the power-on state of the VM configuration into the VMCS.
    pub(crate) fn init_vmcs(&mut self) -> Result<(), HvError> {
        let init = self.vm.config().init;
        vcr::init_cr0_cr4_host_mask(self)?;

        let mut entry = EntryControls::from_bits_truncate(
            self.vmcs.get(VmcsField::VmEntryControls)? as u32,
        );
        entry.set(
            EntryControls::IA32E_MODE_GUEST,
            init.efer & EferFlags::LMA.bits() != 0,
        );
        self.vmcs
            .set(VmcsField::VmEntryControls, entry.bits() as usize)?;
        self.set_efer(init.efer)?;

        self.arch.guest_pat = init.pat;
        self.set_cr0(init.cr0, true)?;
        self.set_cr4(init.cr4, true)?;
        self.set_guest_pat(init.pat)?;
        self.set_rip(init.rip)?;
        self.set_rflags(init.rflags)?;

        self.vmcs.set(VmcsField::VmEntryIntrInfoField, 0)?;
        self.vmcs.set(VmcsField::VmEntryExceptionErrorCode, 0)?;
        self.vmcs
            .set(VmcsField::EptPointer, self.vm.eptp() as usize)?;
        self.vmcs
            .set(VmcsField::VirtualProcessorId, self.vpid() as usize)?;
        log::debug!(
            "VM {}: vCPU {} initialized, rip {:#x}",
            self.vm.id(),
            self.id,
            init.rip
        );
        Ok(())
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
