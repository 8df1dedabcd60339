//! Wire types shared between the scheduler core and the in-guest agent.
//!
//! The agent channel is a synchronous request/response protocol carried
//! over newline-delimited JSON frames. This crate defines the message
//! shapes and the protocol version gate so a future agent revision can be
//! rejected cleanly instead of producing garbled frames.

use std::sync::OnceLock;

use semver::Version;
use serde::{Deserialize, Serialize};

/// Minimum supported agent protocol version (inclusive).
pub const AGENT_PROTOCOL_MIN: &str = "1.0.0";
/// Maximum supported agent protocol version (exclusive).
pub const AGENT_PROTOCOL_MAX: &str = "2.0.0";
/// Human-readable description of the supported protocol range.
pub const AGENT_PROTOCOL_RANGE: &str = ">=1.0.0, <2.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolCompatibility {
    Supported,
    BelowMinimum,
    AboveMaximum,
}

/// Evaluate whether an agent's advertised protocol version is supported.
pub fn check_protocol_version(version: &str) -> Result<ProtocolCompatibility, semver::Error> {
    let parsed = Version::parse(version)?;
    let min = min_version();
    let max = max_version();
    if parsed < *min {
        Ok(ProtocolCompatibility::BelowMinimum)
    } else if parsed >= *max {
        Ok(ProtocolCompatibility::AboveMaximum)
    } else {
        Ok(ProtocolCompatibility::Supported)
    }
}

/// Return the supported protocol range as a human-readable string.
pub fn supported_protocol_range() -> &'static str {
    AGENT_PROTOCOL_RANGE
}

fn min_version() -> &'static Version {
    static MIN: OnceLock<Version> = OnceLock::new();
    MIN.get_or_init(|| Version::parse(AGENT_PROTOCOL_MIN).expect("valid AGENT_PROTOCOL_MIN semver"))
}

fn max_version() -> &'static Version {
    static MAX: OnceLock<Version> = OnceLock::new();
    MAX.get_or_init(|| Version::parse(AGENT_PROTOCOL_MAX).expect("valid AGENT_PROTOCOL_MAX semver"))
}

/// File mode bits forwarded to the guest when staging a file.
pub type FileMode = u32;

/// A request sent from the host to the in-guest agent. One frame, one
/// request; the agent always replies with exactly one [`Response`] frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello { protocol_version: String },
    SetTime { unix_secs: u64 },
    SendFile { remote_path: String, mode: FileMode, size: u64 },
    SendFileAsString { remote_path: String, mode: FileMode, contents: String },
    GetFile { remote_path: String },
    Run { argv: Vec<String>, cwd: Option<String>, env: Vec<(String, String)> },
    Wait { pid: u32, timeout_secs: u64, keepalive_secs: u64 },
    Ping,
    Disconnect,
}

/// The agent's reply to a [`Request`]. `Err` distinguishes an in-guest
/// failure (the command ran but failed) from a transport failure, which
/// never produces a `Response` at all and is surfaced by the caller as an
/// I/O error instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Hello { protocol_version: String },
    Ok,
    Pid { pid: u32 },
    ExitCode { code: Option<i32> },
    FileBytes { base64: String },
    Err { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_versions_within_range() {
        assert_eq!(
            check_protocol_version("1.2.0").unwrap(),
            ProtocolCompatibility::Supported
        );
    }

    #[test]
    fn rejects_versions_outside_range() {
        assert_eq!(
            check_protocol_version("0.9.0").unwrap(),
            ProtocolCompatibility::BelowMinimum
        );
        assert_eq!(
            check_protocol_version("2.0.0").unwrap(),
            ProtocolCompatibility::AboveMaximum
        );
    }

    #[test]
    fn request_round_trips_through_json() {
        let req = Request::Run {
            argv: vec!["cmd.exe".into(), "/c".into(), "dir".into()],
            cwd: None,
            env: vec![],
        };
        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        match decoded {
            Request::Run { argv, .. } => assert_eq!(argv[0], "cmd.exe"),
            other => panic!("unexpected request: {other:?}"),
        }
    }
}
