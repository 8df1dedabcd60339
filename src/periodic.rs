//! Periodic trigger (PT): the winetest-update poll and the Job family it
//! composes (spec.md §4.5). The actual cron-like cadence lives outside the
//! core (an external scheduler invokes `check-for-winetest-update`); this
//! module is the logic that single invocation runs.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{FileType, StepKind, VmRole, VmState, VmType};
use crate::store::{NewJob, NewStep, NewTask, RecordStore};

const RECONFIG_PRIORITY: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    NotModified,
    Updated { downloaded_path: PathBuf, job_id: i64 },
}

/// Abstracts the conditional-GET so the composition logic is testable
/// without a network fetch; [`crate::periodic::ureq_source`] is the
/// production implementation.
pub trait UpdateSource {
    fn fetch(&self, url: &str, if_modified_since: Option<&str>) -> Result<FetchResult>;
}

pub enum FetchResult {
    NotModified,
    Modified { bytes: Vec<u8>, last_modified: Option<String> },
}

/// Run one winetest-update check. On a fresh payload, stage it atomically
/// into `latest/`, then compose and enqueue a reconfig+suite Job family.
pub fn check_for_winetest_update(
    config: &Config,
    store: &dyn RecordStore,
    source: &dyn UpdateSource,
    cache_path: &Path,
    now: i64,
) -> Result<UpdateOutcome> {
    let url = config
        .winetest_update_url
        .as_deref()
        .ok_or_else(|| Error::InvalidConfig {
            path: config.file_path.clone().unwrap_or_default(),
            message: "winetest_update_url is not configured".to_string(),
        })?;
    let cached_mtime = fs::read_to_string(cache_path).ok();

    match source.fetch(url, cached_mtime.as_deref())? {
        FetchResult::NotModified => Ok(UpdateOutcome::NotModified),
        FetchResult::Modified { bytes, last_modified } => {
            let final_path = stage_and_rename(config, &bytes)?;
            if let Some(last_modified) = last_modified {
                fs::write(cache_path, last_modified)?;
            }
            let vms = store.list_vms()?;
            let job_id = compose_update_job(config, store, &vms, &final_path, now)?;
            Ok(UpdateOutcome::Updated { downloaded_path: final_path, job_id })
        }
    }
}

fn stage_and_rename(config: &Config, bytes: &[u8]) -> Result<PathBuf> {
    let staging = config.staging_dir();
    fs::create_dir_all(&staging).map_err(|source| Error::CreateDir { path: staging.clone(), source })?;
    fs::create_dir_all(config.latest_dir()).map_err(|source| Error::CreateDir {
        path: config.latest_dir(),
        source,
    })?;
    let staging_path = staging.join("winetest-latest.download");
    fs::write(&staging_path, bytes)?;
    let final_path = config.latest_dir().join("winetest-latest.exe");
    fs::rename(&staging_path, &final_path)?;
    Ok(final_path)
}

/// Build a Job containing one `reconfig` Step (with its own Task on the
/// build VM) and one `suite` Step per eligible Windows VM (each with its
/// own Task pinned to that VM), the suite Steps depending on the reconfig
/// Step via `PreviousNo` (spec.md §4.5). Every Step gets at least one Task
/// so `list_ready_tasks` actually has something to schedule.
pub fn compose_update_job(config: &Config, store: &dyn RecordStore, vms: &[VmState], file_path: &Path, now: i64) -> Result<i64> {
    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("winetest-latest.exe")
        .to_string();

    let job_id = store.insert_job(NewJob {
        priority: RECONFIG_PRIORITY,
        remarks: "automatic winetest update".to_string(),
        user: "wine-ci".to_string(),
        patch_id: None,
        submitted: now,
    })?;

    store.insert_step(
        job_id,
        NewStep {
            no: 0,
            previous_no: None,
            kind: StepKind::Reconfig,
            file_type: FileType::None,
            file_name: Some(file_name),
            in_staging: false,
            debug_level: 0,
            report_successful_tests: false,
        },
    )?;
    store.insert_task(
        job_id,
        0,
        NewTask { no: 0, vm: None, cmd_line_arg: None, timeout_secs: config.default_task_timeout_secs },
    )?;

    let mut suite_no = 1;
    for vm in vms {
        if !eligible_for_suite(vm) {
            continue;
        }
        store.insert_step(
            job_id,
            NewStep {
                no: suite_no,
                previous_no: Some(0),
                kind: StepKind::Suite,
                file_type: FileType::None,
                file_name: None,
                in_staging: false,
                debug_level: 0,
                report_successful_tests: vm.role == VmRole::Base,
            },
        )?;
        let cmd_line_arg = (vm.vm_type == VmType::Win64).then(|| "64".to_string());
        store.insert_task(
            job_id,
            suite_no,
            NewTask { no: 0, vm: Some(vm.name.clone()), cmd_line_arg, timeout_secs: config.default_task_timeout_secs },
        )?;
        suite_no += 1;
    }

    Ok(job_id)
}

fn eligible_for_suite(vm: &VmState) -> bool {
    matches!(vm.vm_type, VmType::Win32 | VmType::Win64) && matches!(vm.role, VmRole::Base | VmRole::Winetest)
}

pub mod ureq_source {
    use std::io::Read;

    use super::{FetchResult, UpdateSource};
    use crate::error::{Error, Result};

    pub struct UreqUpdateSource;

    impl UpdateSource for UreqUpdateSource {
        fn fetch(&self, url: &str, if_modified_since: Option<&str>) -> Result<FetchResult> {
            let mut request = ureq::get(url);
            if let Some(ims) = if_modified_since {
                request = request.set("If-Modified-Since", ims);
            }
            match request.call() {
                Ok(response) => {
                    let last_modified = response.header("Last-Modified").map(|s| s.to_string());
                    let mut bytes = Vec::new();
                    response
                        .into_reader()
                        .read_to_end(&mut bytes)
                        .map_err(|err| Error::Io(err))?;
                    Ok(FetchResult::Modified { bytes, last_modified })
                }
                Err(ureq::Error::Status(304, _)) => Ok(FetchResult::NotModified),
                Err(err) => Err(Error::InvalidConfig {
                    path: Default::default(),
                    message: format!("winetest update fetch failed: {err}"),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VmStatus;
    use crate::store::SqliteStore;

    fn vm(name: &str, vm_type: VmType, role: VmRole) -> VmState {
        VmState {
            name: name.into(),
            vm_type,
            role,
            sort_order: 0,
            idle_snapshot: "idle".into(),
            status: VmStatus::Idle,
            child_pid: None,
            child_deadline: None,
            errors: 0,
            description: String::new(),
            details: String::new(),
        }
    }

    struct FixedSource {
        result: std::cell::RefCell<Option<FetchResult>>,
    }

    impl UpdateSource for FixedSource {
        fn fetch(&self, _url: &str, _if_modified_since: Option<&str>) -> Result<FetchResult> {
            Ok(self.result.borrow_mut().take().unwrap_or(FetchResult::NotModified))
        }
    }

    #[test]
    fn not_modified_creates_no_job() {
        let store = SqliteStore::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load(&{
            let cfg_path = dir.path().join("winci.toml");
            std::fs::write(&cfg_path, format!("data_dir = \"{}\"\nwinetest_update_url = \"http://example.test/w\"\n", dir.path().display())).unwrap();
            cfg_path
        })
        .unwrap();
        config.data_dir = dir.path().to_path_buf();
        let source = FixedSource { result: std::cell::RefCell::new(Some(FetchResult::NotModified)) };
        let cache_path = dir.path().join("cache");
        let outcome = check_for_winetest_update(&config, &store, &source, &cache_path, 0).unwrap();
        assert_eq!(outcome, UpdateOutcome::NotModified);
        assert!(store.list_jobs().unwrap().is_empty());
    }

    #[test]
    fn modified_payload_composes_reconfig_and_suite_steps() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_vm(vm("build1", VmType::Build, VmRole::Base)).unwrap();
        store.insert_vm(vm("win32-1", VmType::Win32, VmRole::Base)).unwrap();
        store.insert_vm(vm("win32-2", VmType::Win32, VmRole::Winetest)).unwrap();
        store.insert_vm(vm("retired-1", VmType::Win32, VmRole::Retired)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("winci.toml");
        std::fs::write(&cfg_path, format!("data_dir = \"{}\"\nwinetest_update_url = \"http://example.test/w\"\n", dir.path().display())).unwrap();
        let config = Config::load(&cfg_path).unwrap();

        let source = FixedSource {
            result: std::cell::RefCell::new(Some(FetchResult::Modified {
                bytes: b"binary payload".to_vec(),
                last_modified: Some("Thu, 01 Jan 2026 00:00:00 GMT".to_string()),
            })),
        };
        let cache_path = dir.path().join("cache");
        let outcome = check_for_winetest_update(&config, &store, &source, &cache_path, 1000).unwrap();
        let job_id = match outcome {
            UpdateOutcome::Updated { job_id, downloaded_path } => {
                assert!(downloaded_path.exists());
                job_id
            }
            UpdateOutcome::NotModified => panic!("expected an update"),
        };
        let steps = store.list_steps(job_id).unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().any(|s| s.kind == StepKind::Reconfig && s.previous_no.is_none()));
        assert_eq!(steps.iter().filter(|s| s.kind == StepKind::Suite && s.previous_no == Some(0)).count(), 2);
        assert_eq!(fs::read_to_string(&cache_path).unwrap(), "Thu, 01 Jan 2026 00:00:00 GMT");

        // Every Step carries at least one Task, or list_ready_tasks()
        // would never see this Job family at all.
        for step in &steps {
            let tasks = store.list_tasks_for_step(job_id, step.no).unwrap();
            assert_eq!(tasks.len(), 1, "step {} has no Task", step.no);
        }
        let ready = store.list_ready_tasks().unwrap();
        assert_eq!(ready.len(), 1, "only the reconfig Task should be ready until it completes");
        assert_eq!(ready[0].step.kind, StepKind::Reconfig);
    }
}
