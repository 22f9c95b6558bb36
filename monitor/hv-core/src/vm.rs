//! Virtual machines

use core::fmt;

use mmu::EptMapper;
use spin::Mutex;

use crate::config::{VmConfig, MAX_VCPUS_PER_VM};
use crate::error::HvError;
use crate::platform::{remap_core, Platform};
use crate::vcpu::{Requests, Vcpu, VcpuShared, VcpuState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmState {
    Created,
    Running,
    PoweringOff,
    Paused,
    PoweredOff,
}

pub struct Vm<P: Platform + 'static> {
    id: usize,
    config: VmConfig,
    platform: &'static P,
    state: Mutex<VmState>,
    /// Structural modifications of the EPT are serialized, walks are lock-free.
    pub(crate) ept: EptMapper,
    pub(crate) ept_lock: Mutex<()>,
    vcpus: [VcpuShared; MAX_VCPUS_PER_VM],
}

impl<P: Platform> Vm<P> {
    /// Creates a VM with an empty guest physical address space.
    pub fn new(id: usize, config: VmConfig, platform: &'static P) -> Result<Self, HvError> {
        if config.nr_vcpus == 0 || config.nr_vcpus > MAX_VCPUS_PER_VM {
            log::error!("VM {}: invalid number of vCPUs {}", id, config.nr_vcpus);
            return Err(HvError::InvalidArgument);
        }
        let ept = EptMapper::with_allocator(platform.allocator(), config.ept)?;
        log::info!("VM {} ({}): EPT root at {:#x}", id, config.name, ept.eptp() & !0xfff);
        Ok(Self {
            id,
            config,
            platform,
            state: Mutex::new(VmState::Created),
            ept,
            ept_lock: Mutex::new(()),
            vcpus: core::array::from_fn(|idx| VcpuShared::new(config.pcpus[idx])),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn platform(&self) -> &'static P {
        self.platform
    }

    pub fn state(&self) -> VmState {
        *self.state.lock()
    }

    pub fn eptp(&self) -> u64 {
        self.ept.eptp()
    }

    pub fn vcpu_shared(&self, vcpu_id: usize) -> Result<&VcpuShared, HvError> {
        self.vcpus[..self.config.nr_vcpus]
            .get(vcpu_id)
            .ok_or(HvError::InvalidArgument)
    }

    /// VPID 0 is used by the host, each VM owns `MAX_VCPUS_PER_VM` consecutive VPIDs.
    fn vpid_of(&self, vcpu_id: usize) -> Result<u16, HvError> {
        self.id
            .checked_mul(MAX_VCPUS_PER_VM)
            .and_then(|base| base.checked_add(vcpu_id + 1))
            .and_then(|vpid| u16::try_from(vpid).ok())
            .ok_or(HvError::InvalidArgument)
    }

    /// Returns the vCPU half owned by the run loop of its physical core.
    ///
    /// The VMCS is initialized before the first entry.
    pub fn create_vcpu(&self, vcpu_id: usize, vmcs: P::Vmcs) -> Result<Vcpu<'_, P>, HvError> {
        let shared = self.vcpu_shared(vcpu_id)?;
        let vpid = self.vpid_of(vcpu_id).map_err(|err| {
            log::error!("VM {}: no VPID left for vCPU {}", self.id, vcpu_id);
            err
        })?;
        if !shared.claim() {
            return Err(HvError::InvalidArgument);
        }
        let vcpu = Vcpu::new(self, shared, vcpu_id, vpid, vmcs);
        vcpu.make_request(Requests::INIT_VMCS);
        Ok(vcpu)
    }

    fn online_vcpus(&self) -> impl Iterator<Item = (usize, &VcpuShared)> {
        self.vcpus
            .iter()
            .enumerate()
            .take(self.config.nr_vcpus)
            .filter(|(_, vcpu)| vcpu.is_created() && vcpu.state() != VcpuState::Offline)
    }

    // —————————————————————————————— Requests ——————————————————————————————— //

    /// Posts a request to a vCPU, kicking its core if it is not the current one.
    pub fn notify_vcpu(&self, vcpu_id: usize, requests: Requests) -> Result<(), HvError> {
        let vcpu = self.vcpu_shared(vcpu_id)?;
        vcpu.requests().make(requests);
        self.kick_remote(vcpu);
        Ok(())
    }

    /// Forces a VM exit on the vCPU's core, unless it is the current one.
    fn kick_remote(&self, vcpu: &VcpuShared) {
        let current = remap_core(self.platform.current_pcpu());
        if vcpu.pcpu_id() != current {
            self.platform.kick(vcpu.pcpu_id());
        }
    }

    /// Requests an EPT flush on all online vCPUs.
    pub(crate) fn flush_ept_all(&self) {
        for (_, vcpu) in self.online_vcpus() {
            vcpu.requests().make(Requests::EPT_FLUSH);
            self.kick_remote(vcpu);
        }
    }

    // ————————————————————————————— Transitions ————————————————————————————— //

    fn transition(&self, allowed: &[VmState], to: VmState) -> Result<(), HvError> {
        let mut state = self.state.lock();
        if !allowed.contains(&state) {
            return Err(HvError::InvalidVmTransition { from: *state, to });
        }
        *state = to;
        Ok(())
    }

    /// Paused vCPUs run again. vCPUs that were never started stay in their init state.
    pub fn start(&self) -> Result<(), HvError> {
        self.transition(&[VmState::Created, VmState::Paused], VmState::Running)?;
        for (vcpu_id, vcpu) in self.online_vcpus() {
            if vcpu.state() == VcpuState::Paused {
                vcpu.transition(VcpuState::Running)?;
                log::debug!("VM {}: vCPU {} resumed", self.id, vcpu_id);
            }
        }
        Ok(())
    }

    /// Running vCPUs are paused, their cores are kicked out of the guest.
    ///
    /// Real-time VMs can also be paused while created or powering off.
    pub fn pause(&self) -> Result<(), HvError> {
        if self.config.real_time {
            self.transition(
                &[VmState::Running, VmState::PoweringOff, VmState::Created],
                VmState::Paused,
            )?;
        } else {
            self.transition(&[VmState::Running], VmState::Paused)?;
        }
        for (vcpu_id, vcpu) in self.online_vcpus() {
            if vcpu.state() == VcpuState::Running {
                vcpu.transition(VcpuState::Paused)?;
                self.kick_remote(vcpu);
                log::debug!("VM {}: vCPU {} paused", self.id, vcpu_id);
            }
        }
        Ok(())
    }

    /// Stops all vCPUs, their run loops wait for `power_off` and exit.
    pub fn shutdown(&self) -> Result<(), HvError> {
        self.transition(
            &[VmState::Created, VmState::Running, VmState::Paused],
            VmState::PoweringOff,
        )?;
        for (vcpu_id, vcpu) in self.online_vcpus() {
            if vcpu.transition(VcpuState::Zombie).is_ok() {
                self.kick_remote(vcpu);
                log::debug!("VM {}: vCPU {} stopped", self.id, vcpu_id);
            }
        }
        self.platform.shutdown_vm(self.id);
        Ok(())
    }

    /// Releases the vCPUs and the guest physical address space.
    pub fn power_off(&self) -> Result<(), HvError> {
        for (_, vcpu) in self.online_vcpus() {
            vcpu.transition(VcpuState::Offline)?;
        }
        self.transition(&[VmState::PoweringOff], VmState::PoweredOff)?;
        let _guard = self.ept_lock.lock();
        let mut ept = self.ept;
        ept.destroy(self.platform.allocator());
        Ok(())
    }

    /// Applies the escalation policy for an unrecoverable error: the platform is halted for the
    /// highest severity class, otherwise only this VM is torn down.
    pub fn fatal_error(&self, args: fmt::Arguments) {
        log::error!("VM {} ({}): {}", self.id, self.config.name, args);
        if self.config.severity.is_highest() {
            self.platform.fatal(args);
        }
        if let Err(err) = self.shutdown() {
            log::warn!("VM {}: shutdown already in progress ({:?})", self.id, err);
        }
    }
}
