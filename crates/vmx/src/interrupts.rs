//! Event injection and interruption information
//!
//! See Intel SDM volume 3, sections 25.8.3 (VM-entry event injection) and 28.2.2 (information for
//! VM exits due to vectored events). The VM-entry interruption-information field, the VM-exit
//! interruption-information field and the IDT-vectoring information field share one layout:
//!
//! - bits 0:7   vector
//! - bits 8:10  interruption type
//! - bit 11     error code valid
//! - bit 12     NMI unblocking due to IRET (exit fields only)
//! - bit 31     valid

/// Interruption type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionType {
    ExternalInterrupt,
    Reserved,
    NonMaskableInterrupt,
    HardwareException,
    SoftwareInterrupt,
    PrivilegedSoftwareException,
    SoftwareException,
    Other,
}

impl InterruptionType {
    /// Return the interrupt type from a raw interruption-information field.
    pub fn from_raw(info: u32) -> Self {
        let id = (info >> 8) & 0b111;
        match id {
            0 => Self::ExternalInterrupt,
            1 => Self::Reserved,
            2 => Self::NonMaskableInterrupt,
            3 => Self::HardwareException,
            4 => Self::SoftwareInterrupt,
            5 => Self::PrivilegedSoftwareException,
            6 => Self::SoftwareException,
            _ => Self::Other,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::ExternalInterrupt => 0,
            Self::Reserved => 1,
            Self::NonMaskableInterrupt => 2,
            Self::HardwareException => 3,
            Self::SoftwareInterrupt => 4,
            Self::PrivilegedSoftwareException => 5,
            Self::SoftwareException => 6,
            Self::Other => 7,
        }
    }
}

/// A raw interruption-information field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct InterruptionInfo(u32);

impl InterruptionInfo {
    pub const VALID: u32 = 1 << 31;
    pub const ERROR_CODE_VALID: u32 = 1 << 11;
    pub const NMI_UNBLOCKING: u32 = 1 << 12;
    const TYPE_MASK: u32 = 0b111 << 8;
    const VECTOR_MASK: u32 = 0xff;

    pub const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    /// Builds a valid interruption-information value.
    pub fn new(vector: u8, tpe: InterruptionType, error_code_valid: bool) -> Self {
        let mut raw = Self::VALID | (tpe.as_u32() << 8) | vector as u32;
        if error_code_valid {
            raw |= Self::ERROR_CODE_VALID;
        }
        Self(raw)
    }

    /// Returns vector of interrupt or exception: bits 0:7.
    pub fn vector(self) -> u8 {
        (self.0 & Self::VECTOR_MASK) as u8
    }

    /// Returns Interruption type: bits 8:10
    pub fn interruption_type(self) -> InterruptionType {
        InterruptionType::from_raw(self.0 & Self::TYPE_MASK)
    }

    /// Returns the error code valid field: 11.
    pub fn error_code_valid(self) -> bool {
        self.0 & Self::ERROR_CODE_VALID != 0
    }

    /// Returns the NMI unblocking due to iret: 12
    pub fn nmi_unblocking(self) -> bool {
        self.0 & Self::NMI_UNBLOCKING != 0
    }

    /// Returns the valid bit: 31
    pub fn valid(self) -> bool {
        self.0 & Self::VALID != 0
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Trap numbers for interrupt exit vector values.
#[rustfmt::skip]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum Trapnr {
    /// Divide Error #DE.
    DivideError             = 0,
    /// Debug #DB.
    Debug                   = 1,
    /// NMI Interrupt.
    NMI                     = 2,
    /// Breakpoint #BP.
    Breakpoint              = 3,
    /// Overflow #OF.
    Overflow                = 4,
    /// Bound Range Exceeded #BR.
    BoundRangeExceeded      = 5,
    /// Invalid Opcode #UD.
    InvalidOpcode           = 6,
    /// Device Not Available #NM.
    DeviceNotAvailable      = 7,
    /// Double Fault #DF.
    DoubleFault             = 8,
    /// Coprocessor segment overrun, reserved since the 486.
    CoprocessorSegmentOverrun = 9,
    /// Invalid TSS #TS.
    InvalidTSS              = 10,
    /// Segment Not present #NP.
    SegmentNotPresentFault  = 11,
    /// Stack-Segment #SS.
    StackSegmentFault       = 12,
    /// General Protection #GP.
    GeneralProtectionFault  = 13,
    /// Page fault #PF.
    PageFault               = 14,
    /// x87 FPU fp error #MF.
    FPUError                = 16,
    /// Alignment Check #AC.
    AlignmentCheck          = 17,
    /// Machine Check #MC.
    MachineCheck            = 18,
    /// SIMD fp exception #XM.
    SIMDException           = 19,
    /// Virtualization exception #VE.
    VirtualizationException = 20,
    /// Control protection exception #CP.
    ControlProtection       = 21,
}

impl Trapnr {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(vector: u8) -> Option<Self> {
        let trap = match vector {
            0 => Trapnr::DivideError,
            1 => Trapnr::Debug,
            2 => Trapnr::NMI,
            3 => Trapnr::Breakpoint,
            4 => Trapnr::Overflow,
            5 => Trapnr::BoundRangeExceeded,
            6 => Trapnr::InvalidOpcode,
            7 => Trapnr::DeviceNotAvailable,
            8 => Trapnr::DoubleFault,
            9 => Trapnr::CoprocessorSegmentOverrun,
            10 => Trapnr::InvalidTSS,
            11 => Trapnr::SegmentNotPresentFault,
            12 => Trapnr::StackSegmentFault,
            13 => Trapnr::GeneralProtectionFault,
            14 => Trapnr::PageFault,
            16 => Trapnr::FPUError,
            17 => Trapnr::AlignmentCheck,
            18 => Trapnr::MachineCheck,
            19 => Trapnr::SIMDException,
            20 => Trapnr::VirtualizationException,
            21 => Trapnr::ControlProtection,
            _ => return None,
        };
        Some(trap)
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
