//! Agent channel (AC): a request/response channel to the small program
//! running inside the guest (spec.md §6). Operations are synchronous;
//! failures propagate as typed errors distinguishing transport failures
//! from in-guest errors.

mod tcp;

pub use tcp::{TcpAgentChannel, TcpAgentDialer};

use std::path::Path;
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunFlags {
    pub wait: bool,
}

/// Outcome of [`AgentChannel::wait`]: the exit code, or `None` if the
/// timeout elapsed before the child process exited.
pub type WaitOutcome = Option<i32>;

/// Produces a connected [`AgentChannel`] for a named VM. Concrete VM ->
/// address resolution (port-forward tables, DHCP leases, ...) lives
/// outside the core and is injected through this trait so the engine and
/// task worker never hardcode a transport.
pub trait AgentDialer: Send + Sync {
    fn dial(&self, vm: &str) -> Result<Box<dyn AgentChannel>>;
}

pub trait AgentChannel: Send {
    fn set_time(&mut self, unix_secs: u64) -> Result<()>;
    fn send_file(&mut self, local_path: &Path, remote_path: &str, mode: u32) -> Result<()>;
    fn send_file_from_string(&mut self, contents: &str, remote_path: &str, mode: u32) -> Result<()>;
    fn get_file(&mut self, remote_path: &str, local_path: &Path) -> Result<()>;
    fn run(&mut self, argv: &[String]) -> Result<u32>;
    fn wait(&mut self, pid: u32, timeout: Duration, keepalive: Duration) -> Result<WaitOutcome>;
    fn ping(&mut self) -> Result<()>;
    fn set_connect_timeout(&mut self, secs: u64);
    fn disconnect(self: Box<Self>) -> Result<()>;
}
