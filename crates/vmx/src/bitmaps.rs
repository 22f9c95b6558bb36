//! VMX bitmaps.
//!
//! Wrappers for simple and type safe manipulation of bitmaps used throughout VMX operations, as
//! well as the guest-visible control registers the monitor emulates.

use bitflags::bitflags;

bitflags! {
    /// Primary processor-based VM-execution controls.
    ///
    /// See Intel SDM, Volume 3C, Section 24.6.2, Table 24-6.
    pub struct PrimaryControls: u32 {
        /// Interrupt-window exiting.
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        /// Use TSC offsetting.
        const USE_TSC_OFFSETTING       = 1 << 3;
        /// HLT exiting.
        const HLT_EXITING              = 1 << 7;
        /// MWAIT exiting.
        const MWAIT_EXITING            = 1 << 10;
        /// RDPMC exiting.
        const RDPMC_EXITING            = 1 << 11;
        /// NMI-window exiting.
        const NMI_WINDOW_EXITING       = 1 << 22;
        /// MOV-DR exiting
        const MOV_DR_EXITING           = 1 << 23;
        /// Use MSR bitmaps.
        const USE_MSR_BITMAPS          = 1 << 28;
        /// Activate secondary controls.
        const SECONDARY_CONTROLS       = 1 << 31;
    }

    /// VM-entry controls.
    ///
    /// See Intel SDM, Volume 3C, Section 24.8.
    pub struct EntryControls: u32 {
        /// Load debug controls.
        const LOAD_DEBUG_CONTROLS        = 1 << 2;
        /// IA-32e mode guest.
        const IA32E_MODE_GUEST           = 1 << 9;
        /// Load IA32_PAT.
        const LOAD_IA32_PAT              = 1 << 14;
        /// Load IA32_EFER.
        const LOAD_IA32_EFER             = 1 << 15;
    }

    /// EPT and VPID capabilities.
    ///
    /// See Intel manual volume 3 annex A.10 for details.
    pub struct EptCapability: u64 {
        /// Support page walk of lenght 4.
        const PAGE_WALK_4              = 1 << 6;
        /// Support write-back entries.
        const WRITE_BACK               = 1 << 14;
        /// Support 2Mb pages.
        const PAGE_2MB                 = 1 << 16;
        /// Support 1Gb pages.
        const PAGE_1GB                 = 1 << 17;
        /// Support single-context INVEPT.
        const SINGLE_CTX_INVEPT        = 1 << 25;
        /// Support single-context INVVPID.
        const SINGLE_CTX_INVVPID       = 1 << 41;
    }

    /// Guest interruptibility state.
    ///
    /// See Intel SDM, Volume 3C, Section 24.4.2, Table 24-3.
    pub struct InterruptibilityState: u32 {
        const BLOCKING_BY_STI    = 1 << 0;
        const BLOCKING_BY_MOV_SS = 1 << 1;
        const BLOCKING_BY_SMI    = 1 << 2;
        const BLOCKING_BY_NMI    = 1 << 3;
    }

    /// The RFLAGS register.
    pub struct RFlags: u64 {
        const CARRY_FLAG     = 1 << 0;
        /// Bit 1 always reads as one.
        const RESERVED_1     = 1 << 1;
        const ZERO_FLAG      = 1 << 6;
        const INTERRUPT_FLAG = 1 << 9;
        /// Resume flag, suppresses instruction breakpoints for the next instruction.
        const RESUME_FLAG    = 1 << 16;
    }

    /// The CR0 register.
    pub struct Cr0Flags: u64 {
        /// Protection enable.
        const PE = 1 << 0;
        /// Monitor coprocessor.
        const MP = 1 << 1;
        /// Emulation.
        const EM = 1 << 2;
        /// Task switched.
        const TS = 1 << 3;
        /// Extension type.
        const ET = 1 << 4;
        /// Numeric error.
        const NE = 1 << 5;
        /// Write protect.
        const WP = 1 << 16;
        /// Alignment mask.
        const AM = 1 << 18;
        /// Not write-through.
        const NW = 1 << 29;
        /// Cache disable.
        const CD = 1 << 30;
        /// Paging.
        const PG = 1 << 31;
    }

    /// The CR4 register.
    pub struct Cr4Flags: u64 {
        const VME        = 1 << 0;
        const PVI        = 1 << 1;
        const TSD        = 1 << 2;
        const DE         = 1 << 3;
        const PSE        = 1 << 4;
        const PAE        = 1 << 5;
        const MCE        = 1 << 6;
        const PGE        = 1 << 7;
        const PCE        = 1 << 8;
        const OSFXSR     = 1 << 9;
        const OSXMMEXCPT = 1 << 10;
        const UMIP       = 1 << 11;
        const LA57       = 1 << 12;
        const VMXE       = 1 << 13;
        const SMXE       = 1 << 14;
        const FSGSBASE   = 1 << 16;
        const PCIDE      = 1 << 17;
        const OSXSAVE    = 1 << 18;
        const KL         = 1 << 19;
        const SMEP       = 1 << 20;
        const SMAP       = 1 << 21;
        const PKE        = 1 << 22;
        const CET        = 1 << 23;
        const PKS        = 1 << 24;
    }

    /// The IA32_EFER MSR.
    pub struct EferFlags: u64 {
        /// System call extensions.
        const SCE = 1 << 0;
        /// Long mode enable.
        const LME = 1 << 8;
        /// Long mode active, owned by the processor.
        const LMA = 1 << 10;
        /// No-execute enable.
        const NXE = 1 << 11;
    }

    /// The XCR0 register, see Intel SDM volume 1 section 13.3.
    pub struct Xcr0Flags: u64 {
        const X87       = 1 << 0;
        const SSE       = 1 << 1;
        const AVX       = 1 << 2;
        const BNDREGS   = 1 << 3;
        const BNDCSR    = 1 << 4;
        const OPMASK    = 1 << 5;
        const ZMM_HI256 = 1 << 6;
        const HI16_ZMM  = 1 << 7;
        const PKRU      = 1 << 9;
    }

    /// Extended page table entry.
    pub struct EptEntryFlags: u64 {
        /// Enable read accesses.
        const READ = 1 << 0;
        /// Enable write accesses.
        const WRITE = 1 << 1;
        /// Enable supervisor-mode execution. If mode-based execute control bit is 0, also control
        /// user-mode execution.
        const SUPERVISOR_EXECUTE = 1 << 2;
        /// Memory type of a leaf, see `EptMemoryType`.
        const MEMORY_TYPE = 0b111 << 3;
        /// Ignore the guest PAT for this leaf.
        const IGNORE_PAT = 1 << 6;
        /// If 1, points to a data page instead of a page table.
        const PAGE = 1 << 7;
        /// If bit 6 of EPTP is 1, accessed bit flag.
        const ACCESSED = 1 << 8;
        /// If bit 6 of EPTP is 1, dirty bit flag.
        const DIRTY = 1 << 9;
        /// Enable user-mode execution.
        const USER_EXECUTE = 1 << 10;
        /// Snoop control, the access is coherent with DMA from passthrough devices.
        const SNOOP = 1 << 11;
        /// Suppress EPT-violation faults (#VE).
        const SUPPRESS_VE = 1 << 63;
    }
}

impl Cr0Flags {
    /// Bits that are architecturally reserved.
    pub fn reserved() -> u64 {
        !Self::all().bits()
    }
}

impl Cr4Flags {
    /// Bits that are architecturally reserved.
    pub fn reserved() -> u64 {
        !Self::all().bits()
    }
}

impl EptEntryFlags {
    /// Read, write and execute permissions.
    pub const RWX: EptEntryFlags = EptEntryFlags::from_bits_truncate(
        EptEntryFlags::READ.bits()
            | EptEntryFlags::WRITE.bits()
            | EptEntryFlags::SUPERVISOR_EXECUTE.bits(),
    );

    pub fn memory_type(self) -> EptMemoryType {
        EptMemoryType::from_bits((self & EptEntryFlags::MEMORY_TYPE).bits() >> 3)
    }

    pub fn with_memory_type(self, tpe: EptMemoryType) -> Self {
        (self - EptEntryFlags::MEMORY_TYPE) | tpe.as_flags()
    }

    pub fn is_executable(self) -> bool {
        self.intersects(EptEntryFlags::SUPERVISOR_EXECUTE | EptEntryFlags::USER_EXECUTE)
    }
}

/// Memory types of EPT leaves and of the PAT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EptMemoryType {
    Uncacheable,
    WriteCombining,
    WriteThrough,
    WriteProtected,
    WriteBack,
    /// Encodings 2, 3 and 7 are reserved.
    Reserved(u8),
}

impl EptMemoryType {
    pub fn from_bits(bits: u64) -> Self {
        match bits & 0b111 {
            0 => Self::Uncacheable,
            1 => Self::WriteCombining,
            4 => Self::WriteThrough,
            5 => Self::WriteProtected,
            6 => Self::WriteBack,
            other => Self::Reserved(other as u8),
        }
    }

    pub fn bits(self) -> u64 {
        match self {
            Self::Uncacheable => 0,
            Self::WriteCombining => 1,
            Self::WriteThrough => 4,
            Self::WriteProtected => 5,
            Self::WriteBack => 6,
            Self::Reserved(other) => other as u64 & 0b111,
        }
    }

    pub fn as_flags(self) -> EptEntryFlags {
        EptEntryFlags::from_bits_truncate(self.bits() << 3)
    }
}

// —————————————————————————— Exit Qualifications ——————————————————————————— //

pub mod exit_qualification {
    use crate::fields::GuestRegister;

    /// A control register, as encoded in bits 3:0 of the qualification.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ControlRegister {
        Cr0,
        Cr3,
        Cr4,
        Cr8,
        Other(u8),
    }

    impl ControlRegister {
        fn from_raw(raw: u8) -> Self {
            match raw {
                0 => ControlRegister::Cr0,
                3 => ControlRegister::Cr3,
                4 => ControlRegister::Cr4,
                8 => ControlRegister::Cr8,
                other => ControlRegister::Other(other),
            }
        }
    }

    /// Control Register Accesses qualification.
    ///
    /// See table 27.3.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ControlRegisterAccesses {
        MovToCr(ControlRegister, GuestRegister),
        MovFromCr(ControlRegister, GuestRegister),
        Clts,
        LmswRegister(u16),
        LmswMemory(u16),
    }

    impl ControlRegisterAccesses {
        pub fn from_qualification(qualification: usize) -> Self {
            let cr = ControlRegister::from_raw((qualification & 0xf) as u8);
            let register = GuestRegister::from_arch_encoding(((qualification >> 8) & 0xf) as u8);
            let lmsw_source = (qualification >> 16) as u16;
            match (qualification >> 4) & 0b11 {
                0 => ControlRegisterAccesses::MovToCr(cr, register),
                1 => ControlRegisterAccesses::MovFromCr(cr, register),
                2 => ControlRegisterAccesses::Clts,
                _ => {
                    if qualification & (1 << 6) == 0 {
                        ControlRegisterAccesses::LmswRegister(lmsw_source)
                    } else {
                        ControlRegisterAccesses::LmswMemory(lmsw_source)
                    }
                }
            }
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::exit_qualification::{ControlRegister, ControlRegisterAccesses};
    use super::*;
    use crate::fields::{GeneralPurposeField, GuestRegister};

    #[test]
    fn ept_memory_type() {
        let flags = EptEntryFlags::RWX.with_memory_type(EptMemoryType::WriteBack);
        assert_eq!(flags.bits(), 0b110_111);
        assert_eq!(flags.memory_type(), EptMemoryType::WriteBack);
        let flags = flags.with_memory_type(EptMemoryType::Uncacheable);
        assert_eq!(flags.bits(), 0b111);
        assert!(flags.is_executable());
        assert!(!EptEntryFlags::READ.is_executable());
        assert_eq!(EptMemoryType::from_bits(2), EptMemoryType::Reserved(2));
    }

    #[test]
    fn reserved_control_bits() {
        assert_eq!(Cr0Flags::reserved() & Cr0Flags::PG.bits(), 0);
        assert_ne!(Cr0Flags::reserved() & (1 << 6), 0);
        assert_ne!(Cr4Flags::reserved() & (1 << 15), 0);
        assert_eq!(Cr4Flags::reserved() & Cr4Flags::PCIDE.bits(), 0);
    }

    #[rustfmt::skip]
    #[test]
    fn cr_access_qualification() {
        // mov cr0, rbx
        assert_eq!(
            ControlRegisterAccesses::from_qualification(0x0000_0300),
            ControlRegisterAccesses::MovToCr(ControlRegister::Cr0, GuestRegister::Gp(GeneralPurposeField::Rbx))
        );
        // mov rsp, cr4
        assert_eq!(
            ControlRegisterAccesses::from_qualification(0x0000_0414),
            ControlRegisterAccesses::MovFromCr(ControlRegister::Cr4, GuestRegister::Rsp)
        );
        assert_eq!(ControlRegisterAccesses::from_qualification(0x20), ControlRegisterAccesses::Clts);
        // lmsw ax with ax = 0x11
        assert_eq!(
            ControlRegisterAccesses::from_qualification(0x0011_0030),
            ControlRegisterAccesses::LmswRegister(0x11)
        );
        assert_eq!(
            ControlRegisterAccesses::from_qualification(0x0001_0070),
            ControlRegisterAccesses::LmswMemory(0x1)
        );
    }
}
