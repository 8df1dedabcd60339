use std::process::Command;

use super::{PowerState, VmDriver};
use crate::error::{Error, Result};

/// Thin wrapper over the `virsh` command-line client. Every method shells
/// out to a single `virsh` subcommand and translates its exit status into
/// the driver's error taxonomy; no libvirt API bindings are linked in.
pub struct LibvirtDriver {
    virsh_path: String,
    connect_uri: Option<String>,
}

impl LibvirtDriver {
    pub fn new(virsh_path: impl Into<String>, connect_uri: Option<String>) -> Self {
        LibvirtDriver {
            virsh_path: virsh_path.into(),
            connect_uri,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.virsh_path);
        if let Some(uri) = &self.connect_uri {
            cmd.arg("--connect").arg(uri);
        }
        cmd
    }

    fn run(&self, vm: &str, operation: &'static str, args: &[&str]) -> Result<String> {
        let output = self
            .command()
            .args(args)
            .output()
            .map_err(|err| Error::VmDriver {
                vm: vm.to_string(),
                operation,
                message: format!("failed to spawn virsh: {err}"),
            })?;
        if !output.status.success() {
            return Err(Error::VmDriver {
                vm: vm.to_string(),
                operation,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl VmDriver for LibvirtDriver {
    fn is_powered_on(&self, vm: &str) -> Result<PowerState> {
        match self.run(vm, "domstate", &["domstate", vm]) {
            Ok(stdout) => {
                if stdout.contains("running") {
                    Ok(PowerState::On)
                } else {
                    Ok(PowerState::Off)
                }
            }
            Err(_) => Ok(PowerState::Unknown),
        }
    }

    fn power_off(&self, vm: &str, force: bool) -> Result<()> {
        let args: &[&str] = if force {
            &["destroy", vm]
        } else {
            &["shutdown", vm]
        };
        self.run(vm, "power_off", args).map(|_| ())
    }

    fn revert_to_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        self.run(
            vm,
            "revert_to_snapshot",
            &["snapshot-revert", vm, snapshot, "--running"],
        )
        .map(|_| ())
    }

    fn current_snapshot_name(&self, vm: &str) -> Result<Option<String>> {
        let name = self.run(vm, "current_snapshot_name", &["snapshot-current", vm, "--name"])?;
        if name.is_empty() {
            Ok(None)
        } else {
            Ok(Some(name))
        }
    }

    fn capture_screen_image(&self, vm: &str) -> Result<Vec<u8>> {
        let tmp = std::env::temp_dir().join(format!("winci-{vm}-screenshot.ppm"));
        self.run(
            vm,
            "capture_screen_image",
            &["screenshot", vm, tmp.to_str().unwrap_or_default()],
        )?;
        std::fs::read(&tmp).map_err(|err| Error::VmDriver {
            vm: vm.to_string(),
            operation: "capture_screen_image",
            message: format!("failed to read captured screenshot: {err}"),
        })
    }
}
