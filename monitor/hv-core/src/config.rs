//! Static resources and per-VM configuration

use log::LevelFilter;
use mmu::EptPolicy;

// ————————————————————— Static Resources Configuration ————————————————————— //

pub const NB_CORES: usize = 32;
pub const MAX_VCPUS_PER_VM: usize = 8;
/// Number of basic exit reasons, see Intel SDM Vol. 3D Appendix C.
pub const NR_EXIT_REASONS: usize = 70;
pub const CACHE_LINE_SIZE: usize = 64;
pub const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;

// ——————————————————————————— VM Configuration ————————————————————————————— //

/// How critical a VM is.
///
/// Unrecoverable errors in the highest class halt the platform, in the other classes they only
/// tear down the faulty VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    StandardVm,
    ServiceVm,
    RtVm,
    SafetyVm,
}

impl Severity {
    pub fn is_highest(self) -> bool {
        self == Severity::SafetyVm
    }
}

/// Architectural register values of a vCPU after power-on or INIT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VcpuInitState {
    pub cr0: u64,
    pub cr4: u64,
    pub efer: u64,
    pub pat: u64,
    pub rflags: u64,
    pub rip: u64,
}

impl VcpuInitState {
    /// CD, NW and ET set, see Intel SDM Vol. 3A Table 10-1.
    pub const CR0: u64 = 0x6000_0010;
    pub const PAT: u64 = 0x0007_0406_0007_0406;
    pub const RFLAGS: u64 = 0x2;

    pub const fn new(rip: u64) -> Self {
        Self {
            cr0: Self::CR0,
            cr4: 0,
            efer: 0,
            pat: Self::PAT,
            rflags: Self::RFLAGS,
            rip,
        }
    }
}

impl Default for VcpuInitState {
    fn default() -> Self {
        Self::new(0)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct VmConfig {
    pub name: &'static str,
    pub severity: Severity,
    /// Real-time VMs can be paused while created or powering off.
    pub real_time: bool,
    pub nr_vcpus: usize,
    /// Physical core of each vCPU.
    pub pcpus: [usize; MAX_VCPUS_PER_VM],
    pub ept: EptPolicy,
    pub init: VcpuInitState,
}

impl VmConfig {
    pub fn new(name: &'static str, severity: Severity) -> Self {
        Self {
            name,
            severity,
            real_time: severity == Severity::RtVm,
            nr_vcpus: 1,
            pcpus: [0; MAX_VCPUS_PER_VM],
            ept: EptPolicy::default(),
            init: VcpuInitState::default(),
        }
    }
}
