//! Model specific registers
//!
//! The VMX capability registers read during bring-up, and the MSRs the hypervisor core
//! virtualizes itself.

use core::arch::asm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Msr(u32);

pub const FEATURE_CONTROL: Msr = Msr(0x3a);
pub const IA32_PAT: Msr = Msr(0x277);
pub const VMX_BASIC: Msr = Msr(0x480);
pub const VMX_PROCBASED_CTLS: Msr = Msr(0x482);
pub const VMX_CR0_FIXED0: Msr = Msr(0x486);
pub const VMX_CR0_FIXED1: Msr = Msr(0x487);
pub const VMX_CR4_FIXED0: Msr = Msr(0x488);
pub const VMX_CR4_FIXED1: Msr = Msr(0x489);
pub const VMX_PROCBASED_CTLS2: Msr = Msr(0x48b);
pub const VMX_EPT_VPID_CAP: Msr = Msr(0x48c);
pub const IA32_EFER: Msr = Msr(0xc000_0080);

impl Msr {
    pub const fn new(index: u32) -> Self {
        Msr(index)
    }

    /// The index passed in ECX to RDMSR and WRMSR.
    pub const fn address(self) -> u32 {
        self.0
    }

    /// SAFETY: the MSR exists on this core, RDMSR raises #GP otherwise.
    #[inline]
    pub unsafe fn read(self) -> u64 {
        let (lo, hi): (u32, u32);
        asm!("rdmsr", in("ecx") self.0, out("eax") lo, out("edx") hi,
             options(nomem, nostack, preserves_flags));
        ((hi as u64) << 32) | lo as u64
    }
}

/// Returns true if every entry of a PAT value encodes a valid memory type.
///
/// Valid encodings are UC (0), WC (1), WT (4), WP (5), WB (6) and UC- (7), and the upper five
/// bits of each byte are reserved.
pub fn is_valid_pat(pat: u64) -> bool {
    pat.to_le_bytes()
        .iter()
        .all(|&entry| matches!(entry, 0 | 1 | 4 | 5 | 6 | 7))
}

/// A PAT value where every entry is uncacheable.
pub const PAT_ALL_UC: u64 = 0;

// ————————————————————————————————— Tests —————————————————————————————————— //
