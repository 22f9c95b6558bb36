//! Virtual control registers
//!
//! The guest owns the CR0 and CR4 bits that the hardware lets it change freely. The other bits are
//! host-owned: writes to them trap, are validated here, and the guest reads them back from the
//! read shadows. See Intel SDM Vol. 3C section 25.6.6.

use spin::Once;
use utils::GuestPhysAddr;
use vmx::bitmaps::{Cr0Flags, Cr4Flags, EferFlags, EntryControls};
use vmx::fields::VmcsField;
use vmx::msr::PAT_ALL_UC;
use vmx::VmcsAccess;

use crate::error::HvError;
use crate::guest_mem::copy_from_guest;
use crate::platform::Platform;
use crate::vcpu::{CachedRegs, Requests, Vcpu};

/// CR0 bits whose writes are always observed.
const CR0_TRAP_MASK: u64 = Cr0Flags::PE.bits()
    | Cr0Flags::PG.bits()
    | Cr0Flags::WP.bits()
    | Cr0Flags::CD.bits()
    | Cr0Flags::NW.bits();

/// CR4 bits whose writes are always observed.
const CR4_TRAP_MASK: u64 = Cr4Flags::PSE.bits()
    | Cr4Flags::PAE.bits()
    | Cr4Flags::VMXE.bits()
    | Cr4Flags::PCIDE.bits()
    | Cr4Flags::SMEP.bits()
    | Cr4Flags::SMAP.bits()
    | Cr4Flags::PKE.bits()
    | Cr4Flags::SMXE.bits()
    | Cr4Flags::DE.bits()
    | Cr4Flags::MCE.bits()
    | Cr4Flags::PCE.bits()
    | Cr4Flags::VME.bits()
    | Cr4Flags::PVI.bits();

/// CR4 features the guest is not allowed to enable.
const CR4_DENIED: u64 = Cr4Flags::VMXE.bits()
    | Cr4Flags::SMXE.bits()
    | Cr4Flags::PKE.bits()
    | Cr4Flags::PCE.bits()
    | Cr4Flags::DE.bits()
    | Cr4Flags::VME.bits()
    | Cr4Flags::PVI.bits();

/// A change to these CR4 bits invalidates the paging structure caches.
const CR4_PAGING_BITS: u64 = Cr4Flags::PGE.bits()
    | Cr4Flags::PSE.bits()
    | Cr4Flags::PAE.bits()
    | Cr4Flags::SMEP.bits()
    | Cr4Flags::SMAP.bits();

/// L bit of the CS access rights: the guest executes 64-bit code.
const CS_AR_LONG: u64 = 1 << 13;
/// TR type of a busy 16-bit TSS.
const TR_TYPE_BUSY_TSS16: u64 = 3;

const PDPTE_PRESENT: u64 = 1 << 0;
/// Bits 1:2 and 5:8 are reserved in PAE page-directory-pointer-table entries.
const PDPTE_RESERVED: u64 = 0x1E6;
const PDPT_ADDR_MASK: u64 = 0xFFFF_FFE0;

// ——————————————————————————————— Host Masks ——————————————————————————————— //

/// Content of the VMX fixed bits MSRs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrFixedBits {
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrMasks {
    pub cr0_always_on: u64,
    pub cr0_always_off: u64,
    pub cr4_always_on: u64,
    pub cr4_always_off: u64,
    /// Bits whose guest value lives in the read shadow.
    pub cr0_host_owned: u64,
    pub cr4_host_owned: u64,
}

impl CrMasks {
    pub fn from_fixed_bits(fixed: CrFixedBits) -> Self {
        // Unrestricted guests may run with paging or protection disabled.
        let unrestricted = Cr0Flags::PE.bits() | Cr0Flags::PG.bits();
        let cr0_always_on = fixed.cr0_fixed0 & fixed.cr0_fixed1 & !unrestricted;
        let cr4_always_on = fixed.cr4_fixed0 & fixed.cr4_fixed1;
        Self {
            cr0_always_on,
            cr0_always_off: !(fixed.cr0_fixed0 | fixed.cr0_fixed1),
            cr4_always_on,
            cr4_always_off: !(fixed.cr4_fixed0 | fixed.cr4_fixed1),
            cr0_host_owned: (!(fixed.cr0_fixed0 ^ fixed.cr0_fixed1) | CR0_TRAP_MASK)
                & !Cr0Flags::reserved(),
            cr4_host_owned: (!(fixed.cr4_fixed0 ^ fixed.cr4_fixed1) | CR4_TRAP_MASK)
                & !Cr4Flags::reserved(),
        }
    }
}

static CR_MASKS: Once<CrMasks> = Once::new();

pub fn cr_masks() -> Result<&'static CrMasks, HvError> {
    CR_MASKS.get().ok_or(HvError::Uninitialized)
}

/// Computes the host masks on first use and installs them in the vCPU's VMCS.
pub fn init_cr0_cr4_host_mask<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<(), HvError> {
    let platform = vcpu.platform();
    let masks = CR_MASKS.call_once(|| {
        let masks = CrMasks::from_fixed_bits(platform.cr_fixed_bits());
        log::debug!(
            "CR0 host mask {:#x}, CR4 host mask {:#x}",
            masks.cr0_host_owned,
            masks.cr4_host_owned
        );
        masks
    });
    vcpu.vmcs
        .set(VmcsField::Cr0GuestHostMask, masks.cr0_host_owned as usize)?;
    vcpu.vmcs
        .set(VmcsField::Cr4GuestHostMask, masks.cr4_host_owned as usize)?;
    Ok(())
}

// ————————————————————————————— Register Access ———————————————————————————— //

impl<'vm, P: Platform> Vcpu<'vm, P> {
    /// CR0 as seen by the guest.
    pub fn get_cr0(&mut self) -> Result<u64, HvError> {
        if !self.arch.cached.contains(CachedRegs::CR0) {
            let mask = cr_masks()?.cr0_host_owned;
            let shadow = self.vmcs.get(VmcsField::Cr0ReadShadow)? as u64;
            let hardware = self.vmcs.get(VmcsField::GuestCr0)? as u64;
            self.arch.cr0 = (shadow & mask) | (hardware & !mask);
            self.arch.cached.insert(CachedRegs::CR0);
        }
        Ok(self.arch.cr0)
    }

    /// CR4 as seen by the guest.
    pub fn get_cr4(&mut self) -> Result<u64, HvError> {
        if !self.arch.cached.contains(CachedRegs::CR4) {
            let mask = cr_masks()?.cr4_host_owned;
            let shadow = self.vmcs.get(VmcsField::Cr4ReadShadow)? as u64;
            let hardware = self.vmcs.get(VmcsField::GuestCr4)? as u64;
            self.arch.cr4 = (shadow & mask) | (hardware & !mask);
            self.arch.cached.insert(CachedRegs::CR4);
        }
        Ok(self.arch.cr4)
    }

    fn is_long_mode(&mut self) -> Result<bool, HvError> {
        Ok(self.get_efer()? & EferFlags::LMA.bits() != 0)
    }

    fn cs_is_long(&self) -> Result<bool, HvError> {
        Ok(self.vmcs.get(VmcsField::GuestCsArBytes)? as u64 & CS_AR_LONG != 0)
    }

    fn set_ia32e_mode(&mut self, enabled: bool) -> Result<(), HvError> {
        let mut controls =
            EntryControls::from_bits_truncate(self.vmcs.get(VmcsField::VmEntryControls)? as u32);
        controls.set(EntryControls::IA32E_MODE_GUEST, enabled);
        self.vmcs
            .set(VmcsField::VmEntryControls, controls.bits() as usize)?;
        let efer = self.get_efer()?;
        let lma = EferFlags::LMA.bits();
        self.set_efer(if enabled { efer | lma } else { efer & !lma })
    }

    // ——————————————————————————————— CR0 ———————————————————————————————— //

    fn is_cr0_write_valid(&mut self, old: u64, cr0: u64) -> Result<bool, HvError> {
        let masks = cr_masks()?;
        let pe = Cr0Flags::PE.bits();
        let pg = Cr0Flags::PG.bits();

        if cr0 & masks.cr0_always_off != 0 {
            return Ok(false);
        }
        if old & pe != 0 && cr0 & pe == 0 {
            return Ok(false);
        }
        if cr0 & pg != 0 {
            let pae = self.get_cr4()? & Cr4Flags::PAE.bits() != 0;
            let lme = self.get_efer()? & EferFlags::LME.bits() != 0;
            if lme && !pae {
                return Ok(false);
            }
            if cr0 & pe == 0 {
                return Ok(false);
            }
        } else if self.get_cr4()? & Cr4Flags::PCIDE.bits() != 0 {
            return Ok(false);
        }
        if cr0 & Cr0Flags::NW.bits() != 0 && cr0 & Cr0Flags::CD.bits() == 0 {
            return Ok(false);
        }
        Ok(true)
    }

    /// Emulates a write to CR0.
    ///
    /// Invalid writes inject #GP(0) and leave CR0 unchanged. `initialization` skips the
    /// validation, for the power-on value.
    pub fn set_cr0(&mut self, value: u64, initialization: bool) -> Result<(), HvError> {
        let masks = cr_masks()?;
        let old = self.get_cr0()?;
        let cr0 = value & !Cr0Flags::reserved();
        let pg = Cr0Flags::PG.bits();

        if !initialization && !self.is_cr0_write_valid(old, cr0)? {
            log::debug!("vCPU {}: invalid CR0 write {:#x}", self.id(), value);
            return self.inject_gp(0);
        }

        let changed = old ^ cr0;
        if changed & pg != 0 && cr0 & pg != 0 {
            // Paging turned on
            let efer = self.get_efer()?;
            if efer & EferFlags::LME.bits() != 0 {
                let tr_type = self.vmcs.get(VmcsField::GuestTrArBytes)? as u64 & 0xf;
                if self.cs_is_long()? || tr_type == TR_TYPE_BUSY_TSS16 {
                    log::debug!("vCPU {}: invalid long mode activation", self.id());
                    return self.inject_gp(0);
                }
                self.set_ia32e_mode(true)?;
            } else if self.get_cr4()? & Cr4Flags::PAE.bits() != 0 && !self.load_pdptrs()? {
                return self.inject_gp(0);
            }
        } else if changed & pg != 0 && self.is_long_mode()? {
            // Paging turned off, only allowed from compatibility mode
            if self.cs_is_long()? {
                log::debug!("vCPU {}: disabling paging in 64-bit mode", self.id());
                return self.inject_gp(0);
            }
            self.set_ia32e_mode(false)?;
        }

        let cd = Cr0Flags::CD.bits();
        if changed & cd != 0 {
            // Cache disable is emulated through the PAT
            let pat = if cr0 & cd != 0 {
                PAT_ALL_UC
            } else {
                self.arch.guest_pat
            };
            self.vmcs.set(VmcsField::GuestIa32Pat, pat as usize)?;
        }

        if changed & (pg | Cr0Flags::WP.bits() | cd) != 0 {
            self.make_request(Requests::EPT_FLUSH);
        }

        let hardware = (masks.cr0_always_on | cr0) & !(cd | Cr0Flags::NW.bits());
        self.vmcs.set(VmcsField::GuestCr0, hardware as usize)?;
        self.vmcs
            .set(VmcsField::Cr0ReadShadow, (cr0 | Cr0Flags::NE.bits()) as usize)?;
        self.uncache(CachedRegs::CR0);
        log::trace!("vCPU {}: CR0 {:#x} (hardware {:#x})", self.id(), cr0, hardware);
        Ok(())
    }

    // ——————————————————————————————— CR4 ———————————————————————————————— //

    fn is_cr4_write_valid(&mut self, cr4: u64) -> Result<bool, HvError> {
        let masks = cr_masks()?;
        if cr4 & masks.cr4_always_off != 0 || cr4 & CR4_DENIED != 0 {
            return Ok(false);
        }
        if cr4 & Cr4Flags::MCE.bits() != 0 && !self.vm().config().severity.is_highest() {
            return Ok(false);
        }
        if cr4 & Cr4Flags::PCIDE.bits() != 0 {
            return Ok(false);
        }
        if self.is_long_mode()? && cr4 & Cr4Flags::PAE.bits() == 0 {
            return Ok(false);
        }
        Ok(true)
    }

    /// Emulates a write to CR4, see [Vcpu::set_cr0].
    pub fn set_cr4(&mut self, value: u64, initialization: bool) -> Result<(), HvError> {
        let masks = cr_masks()?;
        let old = self.get_cr4()?;
        let cr4 = value & !Cr4Flags::reserved();

        if !initialization && !self.is_cr4_write_valid(cr4)? {
            log::debug!("vCPU {}: invalid CR4 write {:#x}", self.id(), value);
            return self.inject_gp(0);
        }

        let changed = old ^ cr4;
        if changed & CR4_PAGING_BITS != 0 {
            let pae = Cr4Flags::PAE.bits();
            let paging = self.get_cr0()? & Cr0Flags::PG.bits() != 0;
            if changed & pae != 0
                && cr4 & pae != 0
                && paging
                && !self.is_long_mode()?
                && !self.load_pdptrs()?
            {
                return self.inject_gp(0);
            }
            self.make_request(Requests::EPT_FLUSH);
        }

        self.vmcs
            .set(VmcsField::GuestCr4, (masks.cr4_always_on | cr4) as usize)?;
        self.vmcs.set(VmcsField::Cr4ReadShadow, cr4 as usize)?;
        self.uncache(CachedRegs::CR4);
        log::trace!("vCPU {}: CR4 {:#x}", self.id(), cr4);
        Ok(())
    }

    // ——————————————————————————————— PAT ———————————————————————————————— //

    pub fn get_guest_pat(&self) -> u64 {
        self.arch.guest_pat
    }

    /// While CR0.CD is set only the shadow is updated, the hardware PAT stays all-UC.
    pub fn set_guest_pat(&mut self, pat: u64) -> Result<(), HvError> {
        self.arch.guest_pat = pat;
        if self.get_cr0()? & Cr0Flags::CD.bits() == 0 {
            self.vmcs.set(VmcsField::GuestIa32Pat, pat as usize)?;
        }
        Ok(())
    }

    // —————————————————————————————— PDPTEs —————————————————————————————— //

    /// Loads the four PAE page-directory-pointer-table entries pointed to by CR3.
    ///
    /// Returns false, leaving the VMCS unchanged, if the table is not mapped or a present entry
    /// has reserved bits set.
    pub fn load_pdptrs(&mut self) -> Result<bool, HvError> {
        let cr3 = self.vmcs.get(VmcsField::GuestCr3)? as u64;
        let mut raw = [0u8; 32];
        let table = GuestPhysAddr::new((cr3 & PDPT_ADDR_MASK) as usize);
        if copy_from_guest(self.vm(), table, &mut raw).is_err() {
            log::debug!("vCPU {}: PDPT at {:#x} is not mapped", self.id(), table.as_usize());
            return Ok(false);
        }

        let phys_bits = self.platform().max_phys_addr_bits() as u32;
        let reserved = (!0u64).checked_shl(phys_bits).unwrap_or(0) | PDPTE_RESERVED;
        let mut entries = [0u64; 4];
        for (entry, chunk) in entries.iter_mut().zip(raw.chunks_exact(8)) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            *entry = u64::from_le_bytes(bytes);
        }
        if entries
            .iter()
            .any(|entry| entry & PDPTE_PRESENT != 0 && entry & reserved != 0)
        {
            log::debug!("vCPU {}: invalid PDPTEs {:x?}", self.id(), entries);
            return Ok(false);
        }

        let fields = [
            VmcsField::GuestPdptr0,
            VmcsField::GuestPdptr1,
            VmcsField::GuestPdptr2,
            VmcsField::GuestPdptr3,
        ];
        for (field, entry) in fields.into_iter().zip(entries) {
            self.vmcs.set(field, entry as usize)?;
        }
        Ok(true)
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
