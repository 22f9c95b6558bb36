//! VMCS fields
//!
//! Field encodings follow Intel SDM Vol. 3D Appendix B. Only the fields consumed by the exit
//! handling core are listed here.

use crate::errors::VmxError;
use crate::raw;

/// Architectural VMCS field encodings.
#[rustfmt::skip]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VmcsField {
    // 16 bits
    VirtualProcessorId          = 0x00000000,
    GuestCsSelector             = 0x00000802,
    GuestTrSelector             = 0x0000080e,
    // 64 bits
    MsrBitmap                   = 0x00002004,
    EptPointer                  = 0x0000201a,
    GuestPhysicalAddress        = 0x00002400,
    GuestIa32Pat                = 0x00002804,
    GuestIa32Efer               = 0x00002806,
    GuestPdptr0                 = 0x0000280a,
    GuestPdptr1                 = 0x0000280c,
    GuestPdptr2                 = 0x0000280e,
    GuestPdptr3                 = 0x00002810,
    // 32 bits
    PinBasedVmExecControl       = 0x00004000,
    CpuBasedVmExecControl       = 0x00004002,
    ExceptionBitmap             = 0x00004004,
    VmExitControls              = 0x0000400c,
    VmEntryControls             = 0x00004012,
    VmEntryIntrInfoField        = 0x00004016,
    VmEntryExceptionErrorCode   = 0x00004018,
    VmEntryInstructionLen       = 0x0000401a,
    SecondaryVmExecControl      = 0x0000401e,
    VmInstructionError          = 0x00004400,
    VmExitReason                = 0x00004402,
    VmExitIntrInfo              = 0x00004404,
    VmExitIntrErrorCode         = 0x00004406,
    IdtVectoringInfoField       = 0x00004408,
    IdtVectoringErrorCode       = 0x0000440a,
    VmExitInstructionLen        = 0x0000440c,
    VmxInstructionInfo          = 0x0000440e,
    GuestCsLimit                = 0x00004802,
    GuestCsArBytes              = 0x00004816,
    GuestTrArBytes              = 0x00004822,
    GuestInterruptibilityInfo   = 0x00004824,
    GuestActivityState          = 0x00004826,
    // Natural width
    Cr0GuestHostMask            = 0x00006000,
    Cr4GuestHostMask            = 0x00006002,
    Cr0ReadShadow               = 0x00006004,
    Cr4ReadShadow               = 0x00006006,
    ExitQualification           = 0x00006400,
    GuestLinearAddress          = 0x0000640a,
    GuestCr0                    = 0x00006800,
    GuestCr3                    = 0x00006802,
    GuestCr4                    = 0x00006804,
    GuestCsBase                 = 0x00006808,
    GuestRsp                    = 0x0000681c,
    GuestRip                    = 0x0000681e,
    GuestRflags                 = 0x00006820,
    HostCr0                     = 0x00006c00,
    HostCr3                     = 0x00006c02,
    HostCr4                     = 0x00006c04,
    HostRsp                     = 0x00006c14,
    HostRip                     = 0x00006c16,
}

/// Valid VmcsFieldWidth as encoded in a VMCS.
/// See chapter 25.11.2 and table 25-21 in the Intel manual.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsFieldWidth {
    Width16 = 0,
    Width64 = 1,
    Width32 = 2,
    WidthNat = 3,
}

impl VmcsFieldWidth {
    pub fn from_raw(v: u8) -> VmcsFieldWidth {
        match v & 0b11 {
            0 => VmcsFieldWidth::Width16,
            1 => VmcsFieldWidth::Width64,
            2 => VmcsFieldWidth::Width32,
            _ => VmcsFieldWidth::WidthNat,
        }
    }

    /// Mask of the bits that can be stored in a field of this width.
    pub fn mask(self) -> usize {
        match self {
            VmcsFieldWidth::Width16 => 0xffff,
            VmcsFieldWidth::Width32 => 0xffff_ffff,
            VmcsFieldWidth::Width64 | VmcsFieldWidth::WidthNat => usize::MAX,
        }
    }
}

/// Valid VmcsFieldType as encoded in a VMCS.
/// See chapter 25.11.2 and table 25-21 in the Intel manual.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsFieldType {
    Control = 0,
    VmExitInformation = 1,
    GuestState = 2,
    HostState = 3,
}

impl VmcsFieldType {
    pub fn from_raw(v: u8) -> VmcsFieldType {
        match v & 0b11 {
            0 => VmcsFieldType::Control,
            1 => VmcsFieldType::VmExitInformation,
            2 => VmcsFieldType::GuestState,
            _ => VmcsFieldType::HostState,
        }
    }

    /// VM-exit information fields are read-only for software.
    pub fn is_vmwritable(&self) -> bool {
        *self != VmcsFieldType::VmExitInformation
    }
}

impl VmcsField {
    pub fn raw(&self) -> u32 {
        *self as u32
    }

    pub fn width(&self) -> VmcsFieldWidth {
        VmcsFieldWidth::from_raw(((self.raw() >> 13) & 0b11) as u8)
    }

    pub fn tpe(&self) -> VmcsFieldType {
        VmcsFieldType::from_raw(((self.raw() >> 10) & 0b11) as u8)
    }

    pub fn is_guest_cr(&self) -> bool {
        matches!(
            self,
            VmcsField::GuestCr0 | VmcsField::GuestCr3 | VmcsField::GuestCr4
        )
    }

    /// Reads the field from the VMCS currently loaded on this core.
    ///
    /// SAFETY: a VMCS must be active on the current core.
    pub unsafe fn vmread(self) -> Result<usize, VmxError> {
        raw::vmread(self.raw() as u64).map(|value| value as usize)
    }

    /// Writes the field of the VMCS currently loaded on this core.
    ///
    /// SAFETY: a VMCS must be active on the current core, and the value must not break the
    /// invariants the host relies on (e.g. host state fields).
    pub unsafe fn vmwrite(self, value: usize) -> Result<(), VmxError> {
        raw::vmwrite(self.raw() as u64, value as u64)
    }
}

// ———————————————————————— General Purpose Registers ——————————————————————— //

/// Number of general purpose registers saved and restored around VM entries.
pub const REGFILE_SIZE: usize = 15;

/// Represents general purpose registers not stored in a Vmcs.
///
/// The discriminant is the index in the register file handed to `vmlaunch`/`vmresume`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GeneralPurposeField {
    Rax = 0,
    Rbx = 1,
    Rcx = 2,
    Rdx = 3,
    Rbp = 4,
    Rsi = 5,
    Rdi = 6,
    R8 = 7,
    R9 = 8,
    R10 = 9,
    R11 = 10,
    R12 = 11,
    R13 = 12,
    R14 = 13,
    R15 = 14,
}

impl GeneralPurposeField {
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// A guest register as encoded in exit qualifications and instruction information fields.
///
/// RSP lives in the VMCS rather than in the register file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestRegister {
    Gp(GeneralPurposeField),
    Rsp,
}

impl GuestRegister {
    /// Decodes the architectural register number (0 = RAX, 1 = RCX, ..., 15 = R15).
    pub fn from_arch_encoding(encoding: u8) -> Self {
        use GeneralPurposeField::*;
        match encoding & 0xf {
            0 => GuestRegister::Gp(Rax),
            1 => GuestRegister::Gp(Rcx),
            2 => GuestRegister::Gp(Rdx),
            3 => GuestRegister::Gp(Rbx),
            4 => GuestRegister::Rsp,
            5 => GuestRegister::Gp(Rbp),
            6 => GuestRegister::Gp(Rsi),
            7 => GuestRegister::Gp(Rdi),
            8 => GuestRegister::Gp(R8),
            9 => GuestRegister::Gp(R9),
            10 => GuestRegister::Gp(R10),
            11 => GuestRegister::Gp(R11),
            12 => GuestRegister::Gp(R12),
            13 => GuestRegister::Gp(R13),
            14 => GuestRegister::Gp(R14),
            _ => GuestRegister::Gp(R15),
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
