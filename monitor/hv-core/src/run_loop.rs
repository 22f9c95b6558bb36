//! vCPU run loop

use vmx::fields::VmcsField;
use vmx::{VmcsAccess, VmxExitReason};

use crate::error::HvError;
use crate::platform::Platform;
use crate::vcpu::{Vcpu, VcpuState};
use crate::vmexit::dispatch_vmexit;

/// Runs the vCPU on the current core until it goes offline.
///
/// A vCPU that is not running yields to the scheduler until it is resumed or torn down.
/// Unrecoverable errors go through the VM escalation policy, which stops the vCPU or halts the
/// platform. Failed exit handlers only fault the guest.
pub fn vcpu_run_loop<P: Platform>(vcpu: &mut Vcpu<'_, P>) {
    let platform = vcpu.platform();
    let pcpu = vcpu.pcpu_id();
    log::info!("VM {}: vCPU {} enters run loop on core {}", vcpu.vm().id(), vcpu.id(), pcpu);

    loop {
        if platform.need_reschedule(pcpu) {
            platform.schedule(pcpu);
        }
        match vcpu.state() {
            VcpuState::Running => {}
            VcpuState::Offline => break,
            VcpuState::Init | VcpuState::Paused | VcpuState::Zombie => {
                platform.schedule(pcpu);
                continue;
            }
        }

        if let Err(err) = vcpu.handle_pending_requests() {
            vcpu.vm().fatal_error(format_args!(
                "vCPU {}: pending requests failed: {:?}",
                vcpu.id(),
                err
            ));
            continue;
        }

        let basic_reason = match enter_guest(vcpu) {
            Ok(reason) => reason,
            Err(err) => {
                vcpu.vm()
                    .fatal_error(format_args!("vCPU {}: VM entry failed: {:?}", vcpu.id(), err));
                continue;
            }
        };
        vcpu.record_exit(basic_reason);

        if let Err(err) = dispatch_vmexit(vcpu) {
            log::error!(
                "vCPU {}: exit {:#x} failed: {:?}",
                vcpu.id(),
                vcpu.arch.exit_reason,
                err
            );
            if let Err(err) = vcpu.inject_gp(0) {
                vcpu.vm()
                    .fatal_error(format_args!("vCPU {}: cannot inject #GP: {:?}", vcpu.id(), err));
            }
        }
    }

    log::info!(
        "VM {}: vCPU {} leaves run loop ({:?}, {} exits)",
        vcpu.vm().id(),
        vcpu.id(),
        vcpu.state(),
        vcpu.nr_exits()
    );
}

/// Enters the guest and returns the basic reason of the next exit.
fn enter_guest<P: Platform>(vcpu: &mut Vcpu<'_, P>) -> Result<usize, HvError> {
    // Retire the instruction that caused the previous exit
    if vcpu.vmcs.is_launched() && vcpu.arch.inst_len != 0 {
        let rip = vcpu.get_rip()?;
        vcpu.set_rip(rip + vcpu.arch.inst_len as u64)?;
    }
    vcpu.arch.inst_len = 0;

    let platform = vcpu.platform();
    platform.write_cr2(vcpu.arch.cr2);
    // SAFETY: the VMCS is initialized by the INIT_VMCS request, served before the first entry.
    unsafe { vcpu.vmcs.enter(&mut vcpu.arch.regs)? };
    vcpu.invalidate_cache();

    let reason = vcpu.vmcs.raw_exit_reason()?;
    vcpu.arch.exit_reason = reason;
    if VmxExitReason::is_entry_failure(reason) {
        log::error!("vCPU {}: VM entry failure, reason {:#x}", vcpu.id(), reason);
        return Err(HvError::EntryFailure(reason));
    }
    vcpu.arch.cr2 = platform.read_cr2();
    vcpu.arch.inst_len = vcpu.vmcs.get(VmcsField::VmExitInstructionLen)?;
    Ok((reason & 0xffff) as usize)
}
