//! Software VMCS
//!
//! A register file addressed by VMCS field encodings. It follows the access rules of the hardware
//! (field width truncation, read-only exit information fields) and lets the caller script what a
//! VM entry does, which makes the exit handling logic usable without VMX operations.

use crate::errors::{VmxError, VmxInstructionError};
use crate::fields::{VmcsField, REGFILE_SIZE};
use crate::VmcsAccess;

/// Maximum number of distinct fields stored in a [SoftVmcs].
const SOFT_VMCS_SLOTS: usize = 96;

/// Emulates a VM entry followed by a VM exit.
///
/// The hook is expected to update the exit information fields through
/// [SoftVmcs::set_exit_field] and may modify the guest registers.
pub type EntryHook = fn(&mut SoftVmcs, &mut [usize; REGFILE_SIZE]) -> Result<(), VmxError>;

pub struct SoftVmcs {
    slots: [Option<(VmcsField, usize)>; SOFT_VMCS_SLOTS],
    launched: bool,
    entries: usize,
    on_entry: Option<EntryHook>,
}

impl SoftVmcs {
    pub const fn new() -> Self {
        Self {
            slots: [None; SOFT_VMCS_SLOTS],
            launched: false,
            entries: 0,
            on_entry: None,
        }
    }

    /// Installs the hook executed on each VM entry.
    pub fn set_entry_hook(&mut self, hook: EntryHook) {
        self.on_entry = Some(hook);
    }

    /// Number of VM entries performed so far.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Writes any field, including the ones that are read-only for software.
    ///
    /// This is how the processor updates the exit information on VM exits.
    pub fn set_exit_field(&mut self, field: VmcsField, value: usize) -> Result<(), VmxError> {
        let value = value & field.width().mask();
        let mut free = None;
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some((stored, old)) if *stored == field => {
                    *old = value;
                    return Ok(());
                }
                None if free.is_none() => free = Some(idx),
                _ => {}
            }
        }
        match free {
            Some(idx) => {
                self.slots[idx] = Some((field, value));
                Ok(())
            }
            None => Err(VmxError::FieldStoreFull(field.raw())),
        }
    }
}

impl Default for SoftVmcs {
    fn default() -> Self {
        Self::new()
    }
}

impl VmcsAccess for SoftVmcs {
    /// Fields that were never written read as zero.
    fn get(&self, field: VmcsField) -> Result<usize, VmxError> {
        let value = self
            .slots
            .iter()
            .flatten()
            .find(|(stored, _)| *stored == field)
            .map(|(_, value)| *value)
            .unwrap_or(0);
        Ok(value)
    }

    fn set(&mut self, field: VmcsField, value: usize) -> Result<(), VmxError> {
        if !field.tpe().is_vmwritable() {
            return Err(VmxError::VmFailValid(
                VmxInstructionError::VmWriteToReadOnly,
            ));
        }
        self.set_exit_field(field, value)
    }

    fn is_launched(&self) -> bool {
        self.launched
    }

    fn clear(&mut self) -> Result<(), VmxError> {
        self.launched = false;
        Ok(())
    }

    unsafe fn enter(&mut self, regs: &mut [usize; REGFILE_SIZE]) -> Result<(), VmxError> {
        self.launched = true;
        self.entries += 1;
        match self.on_entry {
            Some(hook) => hook(self, regs),
            None => Ok(()),
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
