//! Janitor (JAN): periodic GC of expired jobs, orphaned staging files,
//! pending incomplete patch series, and deleted users/VMs (spec.md §4.6).
//!
//! Every operation here is independently idempotent: running the janitor
//! twice in a row with the same `now` leaves the record store and
//! filesystem in the same state as running it once (spec.md §8,
//! "Running JAN twice in a row yields the same RS state as once").

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::error::Result;
use crate::store::RecordStore;

const SECS_PER_DAY: i64 = 86_400;
const STAGING_ABANDON_AGE_DAYS: i64 = 1;
const STAGING_PURGE_EXTRA_DAYS: i64 = 7;

/// Tallies from one janitor pass, logged by the `janitor` binary and
/// useful for the operator-facing digest / tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub jobs_deleted: u64,
    pub pending_patch_sets_discarded: u64,
    pub patches_deleted: u64,
    pub jobs_archived: u64,
    pub vms_purged: u64,
    pub staging_files_removed: u64,
    pub staging_files_unknown: u64,
    pub record_groups_deleted: u64,
}

/// Run all seven janitor operations once. Each step is independent: a
/// failure partway through still leaves the earlier steps' effects
/// committed, since every step is its own RS statement/transaction.
pub fn run(config: &Config, store: &dyn RecordStore, now: i64) -> Result<JanitorReport> {
    let mut report = JanitorReport::default();

    let purge_cutoff = now - config.job_purge_days as i64 * SECS_PER_DAY;
    let archive_cutoff = now - config.job_archive_days as i64 * SECS_PER_DAY;

    // 1. Delete Jobs whose Ended predates the purge horizon: remove the
    // on-disk tree first, then the row (and its Steps/Tasks, by cascade).
    let expired_job_ids = store.delete_jobs_ended_before(purge_cutoff)?;
    for job_id in &expired_job_ids {
        let job_dir = config.jobs_dir().join(job_id.to_string());
        remove_dir_if_present(&job_dir)?;
    }
    report.jobs_deleted = expired_job_ids.len() as u64;

    // 2. Pending patch series with no new part in over a day are stale.
    let discard_cutoff = now - SECS_PER_DAY;
    report.pending_patch_sets_discarded = store.discard_stale_pending_patch_sets(discard_cutoff)?;

    // 3. Patches older than the purge horizon, not referenced by any Job.
    report.patches_deleted = store.delete_unreferenced_patches_older_than(purge_cutoff)?;

    // 4. Archive Jobs older than the archive horizon: drop large per-Step
    // artifacts (the build/test binaries, screenshots) but keep the row
    // and its log/report text for the record.
    let archived_job_ids = store.archive_jobs_ended_before(archive_cutoff)?;
    for job_id in &archived_job_ids {
        archive_job_artifacts(config, *job_id)?;
    }
    report.jobs_archived = archived_job_ids.len() as u64;

    // 5. Purge deleted VMs no Task still references.
    let purged_vms = store.delete_deleted_vms_without_task_refs()?;
    report.vms_purged = purged_vms.len() as u64;

    // 6. Sweep the staging directory.
    let (removed, unknown) = sweep_staging(config, now)?;
    report.staging_files_removed = removed;
    report.staging_files_unknown = unknown;

    // 7. Delete RecordGroups older than the purge horizon.
    report.record_groups_deleted = store.delete_record_groups_older_than(purge_cutoff)?;

    Ok(report)
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(crate::error::Error::Io(source)),
    }
}

/// Drop every large artifact (`*.report`, `screenshot.png`, any uploaded
/// build) under a Job's directory while keeping `log`/`err` text files,
/// so the archived Job's row still has something to show in a listing.
fn archive_job_artifacts(config: &Config, job_id: i64) -> Result<()> {
    let job_dir = config.jobs_dir().join(job_id.to_string());
    if !job_dir.exists() {
        return Ok(());
    }
    for step_entry in walk_dir(&job_dir)? {
        if !step_entry.is_dir() {
            continue;
        }
        for task_entry in walk_dir(&step_entry)? {
            if !task_entry.is_dir() {
                continue;
            }
            for file_entry in walk_dir(&task_entry)? {
                let keep = file_entry
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|name| name == "log" || name == "err")
                    .unwrap_or(false);
                if !keep && file_entry.is_file() {
                    let _ = fs::remove_file(&file_entry);
                }
            }
        }
    }
    Ok(())
}

fn walk_dir(path: &Path) -> Result<Vec<std::path::PathBuf>> {
    match fs::read_dir(path) {
        Ok(entries) => entries
            .map(|entry| entry.map(|e| e.path()).map_err(crate::error::Error::Io))
            .collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(crate::error::Error::Io(source)),
    }
}

/// Remove abandoned websubmit files (`{sessionhex}_websubmit_*`) older
/// than a day, warn on any filename that does not match the pattern (so
/// an operator notices an unexpected staging artifact), and delete
/// anything still present past `JobPurgeDays + 7` days regardless of
/// name (spec.md §4.6.6).
fn sweep_staging(config: &Config, now: i64) -> Result<(u64, u64)> {
    let staging = config.staging_dir();
    let mut removed = 0u64;
    let mut unknown = 0u64;
    let entries = match fs::read_dir(&staging) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(source) => return Err(crate::error::Error::Io(source)),
    };

    let hard_cutoff_days = config.job_purge_days as i64 + STAGING_PURGE_EXTRA_DAYS;

    for entry in entries {
        let entry = entry.map_err(crate::error::Error::Io)?;
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        let age_days = file_age_days(&metadata, now);
        let name = entry.file_name().to_string_lossy().into_owned();
        let looks_like_websubmit = is_websubmit_name(&name);

        if !looks_like_websubmit {
            unknown += 1;
            log::warn!("janitor: unexpected staging file `{name}`");
        }

        let should_remove = if looks_like_websubmit {
            age_days >= STAGING_ABANDON_AGE_DAYS
        } else {
            age_days >= hard_cutoff_days
        };

        if should_remove {
            if metadata.is_dir() {
                let _ = fs::remove_dir_all(&path);
            } else {
                let _ = fs::remove_file(&path);
            }
            removed += 1;
        }
    }
    Ok((removed, unknown))
}

fn is_websubmit_name(name: &str) -> bool {
    name.contains("_websubmit_")
}

fn file_age_days(metadata: &fs::Metadata, now: i64) -> i64 {
    let modified = metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(now);
    (now - modified).max(0) / SECS_PER_DAY
}

#[allow(dead_code)]
fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewJob, SqliteStore};

    fn test_config() -> (Config, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("winci.toml");
        fs::write(
            &cfg_path,
            format!(
                "data_dir = \"{}\"\njob_purge_days = 30\njob_archive_days = 7\n",
                dir.path().display()
            ),
        )
        .unwrap();
        (Config::load(&cfg_path).unwrap(), dir)
    }

    #[test]
    fn deletes_expired_jobs_and_their_directory() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (config, _dir) = test_config();
        let job_id = store
            .insert_job(NewJob {
                priority: 5,
                remarks: String::new(),
                user: "alice".into(),
                patch_id: None,
                submitted: 0,
            })
            .unwrap();
        store
            .set_job_status(job_id, crate::model::JobStatus::Completed, Some(0))
            .unwrap();
        let job_dir = config.jobs_dir().join(job_id.to_string());
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(job_dir.join("marker"), b"x").unwrap();

        let now = 40 * SECS_PER_DAY;
        let report = run(&config, &store, now).unwrap();
        assert_eq!(report.jobs_deleted, 1);
        assert!(!job_dir.exists());
        assert!(store.get_job(job_id).unwrap().is_none());
    }

    #[test]
    fn running_twice_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (config, _dir) = test_config();
        let job_id = store
            .insert_job(NewJob {
                priority: 5,
                remarks: String::new(),
                user: "alice".into(),
                patch_id: None,
                submitted: 0,
            })
            .unwrap();
        store
            .set_job_status(job_id, crate::model::JobStatus::Completed, Some(0))
            .unwrap();
        let now = 40 * SECS_PER_DAY;
        let first = run(&config, &store, now).unwrap();
        let second = run(&config, &store, now).unwrap();
        assert_eq!(first.jobs_deleted, 1);
        assert_eq!(second.jobs_deleted, 0);
    }

    #[test]
    fn sweep_staging_warns_on_unknown_filenames() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (config, _dir) = test_config();
        fs::create_dir_all(config.staging_dir()).unwrap();
        fs::write(config.staging_dir().join("deadbeef_websubmit_1"), b"x").unwrap();
        fs::write(config.staging_dir().join("mystery.tmp"), b"x").unwrap();
        let report = run(&config, &store, 0).unwrap();
        assert_eq!(report.staging_files_unknown, 1);
    }
}
