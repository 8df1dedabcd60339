use std::path::PathBuf;

use thiserror::Error;

/// Convenient result alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Library error type. Each variant names the failing operation and
/// carries the ids/paths needed to log it with job/step/task context.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read configuration file at {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Configuration at {path} could not be parsed: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Configuration validation failed for {path}: {message}")]
    InvalidConfig { path: PathBuf, message: String },
    #[error("The configuration path {path} does not exist or is not readable.")]
    ExplicitConfigMissing { path: PathBuf },

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Record store error: {message}")]
    Store { message: String },
    #[error("Compare-and-set on {kind}.{field} for `{key}` failed: expected {expected}, found {actual}")]
    CasConflict {
        kind: &'static str,
        field: &'static str,
        key: String,
        expected: String,
        actual: String,
    },
    #[error("No {kind} found for key `{key}`")]
    NotFound { kind: &'static str, key: String },

    #[error("VM driver operation `{operation}` failed for VM `{vm}`: {message}")]
    VmDriver {
        vm: String,
        operation: &'static str,
        message: String,
    },

    #[error("Agent channel transport error talking to VM `{vm}`: {message}")]
    AgentTransport { vm: String, message: String },
    #[error("Agent channel reported an in-guest error on VM `{vm}`: {message}")]
    AgentGuest { vm: String, message: String },
    #[error("Timed out waiting for the child process on VM `{vm}` after {timeout_secs}s")]
    AgentWaitTimeout { vm: String, timeout_secs: u64 },

    #[error("Job {job} Step {step} Task {task}: {message}")]
    TaskFailed {
        job: i64,
        step: i64,
        task: i64,
        message: String,
    },
    #[error("Preflight failed: {message}")]
    PreflightFailed { message: String },
    #[error("Failed to classify task log for job {job} step {step} task {task}: {message}")]
    ClassificationFailed {
        job: i64,
        step: i64,
        task: i64,
        message: String,
    },

    #[error("Notifier failed to send mail to {to}: {message}")]
    NotifyFailed { to: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Maps to the process exit codes mandated by the CLI surface contract:
    /// 0 success, 1 internal failure, 2 usage error, 3 fatal environment error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::ReadConfig { .. }
            | Error::ParseConfig { .. }
            | Error::InvalidConfig { .. }
            | Error::ExplicitConfigMissing { .. } => 2,
            Error::CreateDir { .. } | Error::Store { .. } | Error::Io(_) => 3,
            Error::VmDriver { .. } | Error::AgentTransport { .. } | Error::PreflightFailed { .. } => 3,
            Error::CasConflict { .. }
            | Error::NotFound { .. }
            | Error::AgentGuest { .. }
            | Error::AgentWaitTimeout { .. }
            | Error::TaskFailed { .. }
            | Error::ClassificationFailed { .. }
            | Error::NotifyFailed { .. } => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_cli_contract() {
        assert_eq!(
            Error::ExplicitConfigMissing {
                path: "x".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            Error::CasConflict {
                kind: "vm",
                field: "status",
                key: "vm1".into(),
                expected: "idle".into(),
                actual: "running".into(),
            }
            .exit_code(),
            1
        );
        assert_eq!(
            Error::PreflightFailed {
                message: "no qemu".into()
            }
            .exit_code(),
            3
        );
    }
}
