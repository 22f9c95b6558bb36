//! VMX errors and exit reasons

/// Failure of a VMX operation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VmxError {
    /// The current VMCS is valid, the VM-instruction error field tells what went wrong.
    VmFailValid(VmxInstructionError),
    /// No current VMCS.
    VmFailInvalid,
    VmxNotSupported,
    FeatureNotSupported,
    /// The register file backing a software VMCS has no room left for this field.
    FieldStoreFull(u32),
}

/// Declares a fieldless enum whose variants map to architectural numbers, and its decoder.
///
/// Numbers without a variant decode to the fallback variant.
macro_rules! numbered {
    (
        $(#[$attr:meta])*
        pub enum $name:ident: $raw:ty, fallback $fallback:ident {
            $($(#[$doc:meta])* $variant:ident = $value:literal,)*
        }
        decode with $decode:ident;
    ) => {
        $(#[$attr])*
        pub enum $name {
            $($(#[$doc])* $variant = $value,)*
            $fallback,
        }

        impl $name {
            pub fn $decode(raw: $raw) -> Self {
                match raw {
                    $($value => Self::$variant,)*
                    _ => Self::$fallback,
                }
            }
        }
    };
}

numbered! {
    /// Content of the VM-instruction error field, see Intel SDM Vol. 3C section 31.4.
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub enum VmxInstructionError: u64, fallback Unknown {
        VmCallRoot                   = 1,
        VmClearInvalid               = 2,
        VmClearVmxon                 = 3,
        VmLaunchNonClear             = 4,
        VmResumeNonLaunched          = 5,
        VmResumeAfterVmxoff          = 6,
        VmEntryInvalidCtrlFields     = 7,
        VmEntryInvalidHostState      = 8,
        VmPtrldInvalidPhysAddr       = 9,
        VmPtrldVmxon                 = 10,
        VmPtrldInvalidRevId          = 11,
        VmAccessUnsupportedField     = 12,
        VmWriteToReadOnly            = 13,
        VmxonDuringVmxRoot           = 15,
        VmEntryInvalidVmcs           = 16,
        VmEntryNonLaunched           = 17,
        VmEntryVmcsNotVmxon          = 18,
        VmCallNonClearVmcs           = 19,
        VmCallInvalidExitCtrlFields  = 20,
        VmCallInvalidRevId           = 22,
        VmxoffDualMonitor            = 23,
        VmCallInvalidSmmFeatures     = 24,
        VmEntryInvalidExecCtrlFields = 25,
        /// Events blocked by MOV SS.
        VmEntryBlockedMovSS          = 26,
        /// Invalid operand to INVEPT or INVVPID.
        InvalidInvEptInvPid          = 28,
    }
    decode with from_u64;
}

numbered! {
    /// Basic exit reason, bits 15:0 of the exit reason field.
    ///
    /// See Intel SDM Vol. 3D Appendix C. Reasons 35, 38 and 42 are not assigned.
    #[rustfmt::skip]
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    #[repr(u16)]
    pub enum VmxExitReason: u16, fallback Unknown {
        /// Exception or NMI selected by the exception bitmap.
        Exception                       = 0,
        ExternalInterrupt               = 1,
        TripleFault                     = 2,
        InitSignal                      = 3,
        StartUpIpi                      = 4,
        IoSystemManagementInterrupt     = 5,
        OtherSmi                        = 6,
        InterruptWindow                 = 7,
        NmiWindow                       = 8,
        TaskSwitch                      = 9,
        Cpuid                           = 10,
        Getsec                          = 11,
        Hlt                             = 12,
        Invd                            = 13,
        Invlpg                          = 14,
        Rdpmc                           = 15,
        Rdtsc                           = 16,
        Rsm                             = 17,
        // VMX instructions executed by the guest
        Vmcall                          = 18,
        Vmclear                         = 19,
        Vmlaunch                        = 20,
        Vmptrld                         = 21,
        Vmptrst                         = 22,
        Vmread                          = 23,
        Vmresume                        = 24,
        Vmwrite                         = 25,
        Vmxoff                          = 26,
        Vmxon                           = 27,
        /// MOV to or from CR0, CR3, CR4 or CR8, CLTS and LMSW.
        ControlRegisterAccesses         = 28,
        MovDR                           = 29,
        IoInstruction                   = 30,
        Rdmsr                           = 31,
        Wrmsr                           = 32,
        VmEntryFailureInvalidGuestState = 33,
        VmEntryFailureMsrLoading        = 34,
        Mwait                           = 36,
        MonitorTrapFlag                 = 37,
        Monitor                         = 39,
        Pause                           = 40,
        VmEntryFailureMachineCheck      = 41,
        TprBelowThreshold               = 43,
        ApicAccess                      = 44,
        VirtualizedEoi                  = 45,
        /// LGDT, LIDT, SGDT or SIDT.
        AccessToGdtrOrIdtr              = 46,
        /// LLDT, LTR, SLDT or STR.
        AccessToLdtrOrTr                = 47,
        EptViolation                    = 48,
        EptMisconfiguration             = 49,
        Invept                          = 50,
        Rdtscp                          = 51,
        VmxPreemptionTimerExpired       = 52,
        Invvpid                         = 53,
        Wbinvd                          = 54,
        Xsetbv                          = 55,
        ApicWrite                       = 56,
        Rdrand                          = 57,
        Invpcid                         = 58,
        Vmfunc                          = 59,
        Encls                           = 60,
        Rdseed                          = 61,
        PageModificationLogFull         = 62,
        Xsaves                          = 63,
        Xrstors                         = 64,
        Enclv                           = 65,
        SppEvent                        = 66,
        Umwait                          = 67,
        Tpause                          = 68,
        Loadiwkey                       = 69,
    }
    decode with from_u16;
}

impl VmxExitReason {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Bit 31 of the full exit reason: the exit was caused by a failed VM entry.
    pub fn is_entry_failure(full_reason: u32) -> bool {
        full_reason & (1 << 31) != 0
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
