//! VM lifecycle worker (VLW): one short-lived process per VM-state
//! transition (spec.md §4.2, §5). Each function here is the entire body
//! of one `vm-worker <action> <vm>` invocation; the CLI binary is a thin
//! argument-parsing shell around them.

use std::thread;
use std::time::Duration;

use crate::agent::AgentDialer;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::VmStatus;
use crate::reporter::{Event, Reporter};
use crate::store::RecordStore;
use crate::vmdriver::{PowerState, VmDriver};

/// `revert`: power off -> revert-to-snapshot -> (settle) -> ping the
/// agent within `WaitForToolsInVM` -> `idle`. Any failed sub-step moves
/// the VM to `offline` (spec.md §4.2 "Revert sequence").
pub fn revert(
    config: &Config,
    store: &dyn RecordStore,
    driver: &dyn VmDriver,
    dialer: &dyn AgentDialer,
    vm_name: &str,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let vm = store
        .get_vm(vm_name)?
        .ok_or_else(|| Error::NotFound { kind: "vm", key: vm_name.to_string() })?;
    if vm.status != VmStatus::Reverting {
        return Err(Error::PreflightFailed {
            message: format!("revert invoked for `{vm_name}` which is not in `reverting` (found {:?})", vm.status),
        });
    }

    let outcome = (|| -> Result<()> {
        driver.power_off(vm_name, true)?;
        driver.revert_to_snapshot(vm_name, &vm.idle_snapshot)?;
        thread::sleep(Duration::from_secs(config.settle_pause_secs));

        let budget = Duration::from_secs(config.wait_for_tools_in_vm_secs);
        let deadline = std::time::Instant::now() + budget;
        loop {
            match dialer.dial(vm_name).and_then(|mut channel| {
                let result = channel.ping();
                let _ = channel.disconnect();
                result
            }) {
                Ok(()) => break,
                Err(_) if std::time::Instant::now() < deadline => {
                    thread::sleep(Duration::from_secs(1));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    })();

    match outcome {
        Ok(()) => {
            if !store.cas_vm_status(vm_name, VmStatus::Reverting, VmStatus::Sleeping)? {
                return Err(Error::CasConflict {
                    kind: "vm",
                    field: "status",
                    key: vm_name.to_string(),
                    expected: "reverting".to_string(),
                    actual: "unknown".to_string(),
                });
            }
            reporter.report(Event::VmTransition { vm: vm_name.to_string(), from: "reverting", to: "sleeping" });
            thread::sleep(Duration::from_secs(config.settle_pause_secs));
            store.cas_vm_status(vm_name, VmStatus::Sleeping, VmStatus::Idle)?;
            reporter.report(Event::VmTransition { vm: vm_name.to_string(), from: "sleeping", to: "idle" });
            log::info!("vm={vm_name} revert succeeded, now idle");
            Ok(())
        }
        Err(err) => {
            store.cas_vm_status(vm_name, VmStatus::Reverting, VmStatus::Offline)?;
            store.record_vm_error(vm_name)?;
            reporter.report(Event::VmTransition { vm: vm_name.to_string(), from: "reverting", to: "offline" });
            log::error!("vm={vm_name} revert failed, marked offline: {err}");
            Err(err)
        }
    }
}

/// `poweroff`: force the VM off regardless of its current state. Used by
/// the engine when evicting a child past its deadline.
pub fn poweroff(store: &dyn RecordStore, driver: &dyn VmDriver, vm_name: &str) -> Result<()> {
    driver.power_off(vm_name, true)?;
    let vm = store.get_vm(vm_name)?.ok_or_else(|| Error::NotFound { kind: "vm", key: vm_name.to_string() })?;
    let _ = store.cas_vm_status(vm_name, vm.status, VmStatus::Off);
    Ok(())
}

/// `checkidle`: a `dirty` VM becomes `idle` once it is powered off and its
/// current snapshot matches `IdleSnapshot`.
pub fn checkidle(store: &dyn RecordStore, driver: &dyn VmDriver, vm_name: &str) -> Result<bool> {
    let vm = store.get_vm(vm_name)?.ok_or_else(|| Error::NotFound { kind: "vm", key: vm_name.to_string() })?;
    if vm.status != VmStatus::Dirty {
        return Ok(false);
    }
    let powered_on = matches!(driver.is_powered_on(vm_name)?, PowerState::On);
    if powered_on {
        return Ok(false);
    }
    let snapshot = driver.current_snapshot_name(vm_name)?;
    if snapshot.as_deref() == Some(vm.idle_snapshot.as_str()) {
        Ok(store.cas_vm_status(vm_name, VmStatus::Dirty, VmStatus::Idle)?)
    } else {
        Ok(false)
    }
}

/// `checkoff`: a `dirty` VM is forced off so the next `revert` has a known
/// starting point.
pub fn checkoff(store: &dyn RecordStore, driver: &dyn VmDriver, vm_name: &str) -> Result<bool> {
    let vm = store.get_vm(vm_name)?.ok_or_else(|| Error::NotFound { kind: "vm", key: vm_name.to_string() })?;
    if vm.status != VmStatus::Dirty {
        return Ok(false);
    }
    driver.power_off(vm_name, true)?;
    Ok(store.cas_vm_status(vm_name, VmStatus::Dirty, VmStatus::Off)?)
}

/// `monitor`: polls an `offline` VM for reachability; on success it moves
/// back to `off` and a "recovered" notification is queued by the caller.
pub fn monitor(store: &dyn RecordStore, driver: &dyn VmDriver, vm_name: &str) -> Result<bool> {
    let vm = store.get_vm(vm_name)?.ok_or_else(|| Error::NotFound { kind: "vm", key: vm_name.to_string() })?;
    if vm.status != VmStatus::Offline {
        return Ok(false);
    }
    match driver.is_powered_on(vm_name) {
        Ok(PowerState::Unknown) => Ok(false),
        Ok(_) => {
            let recovered = store.cas_vm_status(vm_name, VmStatus::Offline, VmStatus::Off)?;
            if recovered {
                store.reset_vm_errors(vm_name)?;
                log::info!("vm={vm_name} recovered from offline");
            }
            Ok(recovered)
        }
        Err(err) => {
            log::warn!("vm={vm_name} still unreachable: {err}");
            Ok(false)
        }
    }
}
