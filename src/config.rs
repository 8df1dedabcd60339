use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_max_task_tries() -> u32 {
    3
}
fn default_revert_budget_secs() -> u64 {
    120
}
fn default_wait_for_tools_secs() -> u64 {
    180
}
fn default_settle_pause_secs() -> u64 {
    5
}
fn default_job_purge_days() -> u32 {
    30
}
fn default_job_archive_days() -> u32 {
    7
}
fn default_report_file_size_limit() -> u64 {
    10 * 1024 * 1024
}
fn default_max_task_timeout_slack_secs() -> u64 {
    60
}
fn default_smtp_port() -> u16 {
    25
}
fn default_agent_port() -> u16 {
    4444
}
fn default_task_timeout_secs() -> u64 {
    3600
}

/// Top-level configuration, loaded once per process and passed by
/// reference into every constructor. There is no process-wide singleton
/// beyond this immutable value.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub file_path: Option<PathBuf>,

    /// Root of the persisted layout: `jobs/`, `staging/`, `latest/`, `patches/`.
    pub data_dir: PathBuf,

    /// Path to the record-store database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_max_task_tries")]
    pub max_task_tries: u32,

    #[serde(default = "default_revert_budget_secs")]
    pub revert_budget_secs: u64,

    #[serde(default = "default_wait_for_tools_secs")]
    pub wait_for_tools_in_vm_secs: u64,

    #[serde(default = "default_settle_pause_secs")]
    pub settle_pause_secs: u64,

    #[serde(default = "default_job_purge_days")]
    pub job_purge_days: u32,

    #[serde(default = "default_job_archive_days")]
    pub job_archive_days: u32,

    /// Max size (bytes) a `*.report` file may reach before the dissector
    /// treats it as truncated ("file-limit" marker). Configurable per the
    /// Open Question in spec.md §9 rather than an implicit constant.
    #[serde(default = "default_report_file_size_limit")]
    pub report_file_size_limit: u64,

    /// Extra slack added on top of a Task's own `Timeout` when computing
    /// the task worker's `ChildDeadline`.
    #[serde(default = "default_max_task_timeout_slack_secs")]
    pub task_deadline_slack_secs: u64,

    /// `Task.Timeout` for the reconfig/suite Tasks the periodic trigger
    /// composes (spec.md §4.5); the web UI sets this explicitly per Task
    /// for user-submitted Jobs (out of scope, spec.md §1).
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,

    #[serde(default)]
    pub winetest_update_url: Option<String>,

    /// TCP port the in-guest agent listens on. Each VM's hostname is
    /// assumed to resolve (libvirt's built-in DNS, or `/etc/hosts`) to its
    /// current address, so no per-VM address table is kept in RS.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    #[serde(default)]
    pub virsh_path: Option<String>,
    #[serde(default)]
    pub libvirt_connect_uri: Option<String>,

    /// Small pre-built test-launcher stub matching a single-test Step's
    /// word size (spec.md §4.3 step 3), uploaded alongside the test binary.
    #[serde(default)]
    pub single_test_launcher_32: Option<PathBuf>,
    #[serde(default)]
    pub single_test_launcher_64: Option<PathBuf>,

    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Base URL the notifier links to when pointing a patch author at
    /// their Job's results (out-of-scope web UI, spec.md §1). Falls back
    /// to a bare relative path when unset.
    #[serde(default)]
    pub web_ui_base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub from_address: Option<String>,
    #[serde(default)]
    pub operator_address: Option<String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("winci.sqlite3")
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents).map_err(|source| Error::ParseConfig {
            path: path.to_path_buf(),
            source,
        })?;
        config.file_path = Some(path.to_path_buf());
        if !config.db_path.is_absolute() {
            config.db_path = config.data_dir.join(&config.db_path);
        }
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig {
                path: path.to_path_buf(),
                message: "data_dir must not be empty".to_string(),
            });
        }
        if self.max_task_tries == 0 {
            return Err(Error::InvalidConfig {
                path: path.to_path_buf(),
                message: "max_task_tries must be at least 1".to_string(),
            });
        }
        if self.report_file_size_limit == 0 {
            return Err(Error::InvalidConfig {
                path: path.to_path_buf(),
                message: "report_file_size_limit must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }
    pub fn latest_dir(&self) -> PathBuf {
        self.data_dir.join("latest")
    }
    pub fn patches_dir(&self) -> PathBuf {
        self.data_dir.join("patches")
    }
    pub fn task_dir(&self, job: i64, step: i64, task: i64) -> PathBuf {
        self.jobs_dir()
            .join(job.to_string())
            .join(step.to_string())
            .join(task.to_string())
    }

    /// Link to a Job's results, for the per-patch author notification
    /// (spec.md §6 "Notification format", `X-Patch-URL`).
    pub fn job_url(&self, job_id: i64) -> String {
        match &self.web_ui_base_url {
            Some(base) => format!("{}/jobs/{job_id}", base.trim_end_matches('/')),
            None => format!("jobs/{job_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "data_dir = \"/tmp/winci-data\"").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.max_task_tries, 3);
        assert_eq!(config.job_purge_days, 30);
        assert_eq!(config.db_path, PathBuf::from("/tmp/winci-data/winci.sqlite3"));
    }

    #[test]
    fn rejects_zero_max_task_tries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "data_dir = \"/tmp/winci-data\"\nmax_task_tries = 0").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn missing_file_surfaces_read_error() {
        let err = Config::load(Path::new("/nonexistent/winci.toml")).unwrap_err();
        assert!(matches!(err, Error::ReadConfig { .. }));
    }
}
