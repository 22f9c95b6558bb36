//! x86_64 instructions used by the default platform hooks.

use core::arch::asm;

use utils::HostVirtAddr;

use crate::config::CACHE_LINE_SIZE;

/// Output of the CPUID instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

pub fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    // SAFETY: CPUID is available on every x86_64 core outside of SGX enclaves.
    let result = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
    CpuidResult {
        eax: result.eax,
        ebx: result.ebx,
        ecx: result.ecx,
        edx: result.edx,
    }
}

/// Physical address width reported by CPUID leaf 0x8000_0008.
pub fn max_phys_addr_bits() -> u8 {
    if cpuid(0x8000_0000, 0).eax < 0x8000_0008 {
        return 36;
    }
    (cpuid(0x8000_0008, 0).eax & 0xff) as u8
}

/// Writes back and invalidates the cache lines covering `[hva, hva + size)`.
pub fn flush_cache_range(hva: HostVirtAddr, size: usize) {
    let start = hva.as_usize() & !(CACHE_LINE_SIZE - 1);
    let end = hva.as_usize() + size;
    for line in (start..end).step_by(CACHE_LINE_SIZE) {
        unsafe { asm!("clflush [{}]", in(reg) line, options(nostack, preserves_flags)) };
    }
    unsafe { asm!("mfence", options(nostack, preserves_flags)) };
}

/// Loads an extended control register.
///
/// SAFETY: the value must be valid for the current CPU, otherwise XSETBV raises #GP.
pub unsafe fn xsetbv(xcr: u32, value: u64) {
    asm!(
        "xsetbv",
        in("ecx") xcr,
        in("eax") value as u32,
        in("edx") (value >> 32) as u32,
        options(nomem, nostack, preserves_flags),
    );
}

/// Allows supervisor accesses to user pages.
///
/// SAFETY: must be executed in ring 0 with SMAP support.
pub unsafe fn stac() {
    asm!("stac", options(nomem, nostack));
}

/// SAFETY: must be executed in ring 0 with SMAP support.
pub unsafe fn clac() {
    asm!("clac", options(nomem, nostack));
}

pub fn read_cr2() -> u64 {
    let cr2: u64;
    unsafe { asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags)) };
    cr2
}

/// SAFETY: must be executed in ring 0.
pub unsafe fn write_cr2(cr2: u64) {
    asm!("mov cr2, {}", in(reg) cr2, options(nomem, nostack, preserves_flags));
}
