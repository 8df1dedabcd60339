//! VM driver (VD): a thin abstraction over the hypervisor (spec.md §6).
//! Operations must be idempotent under retry.

mod libvirt;

pub use libvirt::LibvirtDriver;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    /// The hypervisor could not be reached to answer the question at all
    /// (spec.md §7, "VM lost").
    Unknown,
}

/// Abstraction over `virsh`-style hypervisor operations. Hides libvirt
/// specifics from every other module.
pub trait VmDriver: Send + Sync {
    fn is_powered_on(&self, vm: &str) -> Result<PowerState>;
    fn power_off(&self, vm: &str, force: bool) -> Result<()>;
    fn revert_to_snapshot(&self, vm: &str, snapshot: &str) -> Result<()>;
    fn current_snapshot_name(&self, vm: &str) -> Result<Option<String>>;
    fn capture_screen_image(&self, vm: &str) -> Result<Vec<u8>>;
}
