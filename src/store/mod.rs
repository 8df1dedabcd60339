//! Record store (RS): durable transactional storage for the scheduler's
//! entities, with single-row optimistic ("if current value equals X")
//! updates and foreign-key cascades (spec.md §3, §6).

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::model::{
    FileType, Job, JobStatus, Patch, RecordGroup, RecordKind, Step, StepKind, Task, TaskStatus,
    VmState, VmStatus,
};

/// Fields required to enqueue a new Job; `id` is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub priority: u8,
    pub remarks: String,
    pub user: String,
    pub patch_id: Option<i64>,
    pub submitted: i64,
}

#[derive(Debug, Clone)]
pub struct NewStep {
    pub no: i64,
    pub previous_no: Option<i64>,
    pub kind: StepKind,
    pub file_type: FileType,
    pub file_name: Option<String>,
    pub in_staging: bool,
    pub debug_level: u8,
    pub report_successful_tests: bool,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub no: i64,
    pub vm: Option<String>,
    pub cmd_line_arg: Option<String>,
    pub timeout_secs: u64,
}

/// A Task joined with its owning Step and Job, as produced by
/// [`RecordStore::list_ready_tasks`].
#[derive(Debug, Clone)]
pub struct ReadyTask {
    pub job: Job,
    pub step: Step,
    pub task: Task,
}

/// The scheduler's durable storage contract. A single implementation
/// (`SqliteStore`) backs both production processes (opening the same file)
/// and tests (opening `:memory:`), which is enough to exercise the CAS and
/// cascade semantics without a second, divergent backend.
pub trait RecordStore: Send + Sync {
    // --- VM ---
    fn insert_vm(&self, vm: VmState) -> Result<()>;
    fn get_vm(&self, name: &str) -> Result<Option<VmState>>;
    fn list_vms(&self) -> Result<Vec<VmState>>;
    fn delete_vm(&self, name: &str) -> Result<bool>;
    /// Compare-and-set `VM.Status`; returns whether the CAS succeeded.
    fn cas_vm_status(&self, name: &str, expected: VmStatus, new: VmStatus) -> Result<bool>;
    fn set_vm_child(&self, name: &str, pid: Option<i32>, deadline: Option<i64>) -> Result<()>;
    fn record_vm_error(&self, name: &str) -> Result<u32>;
    fn reset_vm_errors(&self, name: &str) -> Result<()>;

    // --- Job / Step / Task ---
    fn insert_job(&self, job: NewJob) -> Result<i64>;
    fn get_job(&self, id: i64) -> Result<Option<Job>>;
    fn list_jobs(&self) -> Result<Vec<Job>>;
    fn set_job_status(&self, id: i64, status: JobStatus, ended: Option<i64>) -> Result<()>;
    fn delete_job(&self, id: i64) -> Result<()>;

    fn insert_step(&self, job_id: i64, step: NewStep) -> Result<()>;
    fn get_step(&self, job_id: i64, no: i64) -> Result<Option<Step>>;
    fn list_steps(&self, job_id: i64) -> Result<Vec<Step>>;

    fn insert_task(&self, job_id: i64, step_no: i64, task: NewTask) -> Result<i64>;
    fn get_task(&self, id: i64) -> Result<Option<Task>>;
    fn list_tasks_for_step(&self, job_id: i64, step_no: i64) -> Result<Vec<Task>>;
    fn list_tasks_for_job(&self, job_id: i64) -> Result<Vec<Task>>;
    fn cas_task_status(&self, id: i64, expected: TaskStatus, new: TaskStatus) -> Result<bool>;
    fn set_task_status(&self, id: i64, new: TaskStatus) -> Result<()>;
    fn set_task_vm(&self, id: i64, vm: Option<&str>) -> Result<()>;
    fn record_task_failure(&self, id: i64) -> Result<u32>;
    fn set_task_test_failures(&self, id: i64, count: u32) -> Result<()>;
    fn set_task_times(&self, id: i64, started: Option<i64>, ended: Option<i64>) -> Result<()>;

    /// Ready tasks sorted by (Job.Priority asc, Job.Id asc, Step.No asc,
    /// Task.No asc); dependent Steps whose predecessor did not complete
    /// are not included (they are expected to already have been marked
    /// `canceled` by [`RecordStore::cancel_orphaned_dependents`]).
    fn list_ready_tasks(&self) -> Result<Vec<ReadyTask>>;

    /// Mark terminal (non-`completed`) every Task belonging to a Step whose
    /// `PreviousNo` predecessor reached a terminal status other than
    /// `completed`. Returns the ids marked.
    fn cancel_orphaned_dependents(&self) -> Result<Vec<i64>>;

    /// Derive Job status from its Tasks (spec.md §3 "status derived from
    /// its Steps; terminal when all Steps terminal"): a `queued` Job with
    /// any Task that has left `queued` is promoted to `running`; a
    /// `queued`/`running` Job all of whose Tasks have reached a terminal
    /// status becomes terminal itself — `boterror` if any Task ended
    /// `boterror`, `completed` otherwise (a dependency-canceled or
    /// bad-patch Task still means the Job itself ran to completion, per
    /// spec.md §8 E2). Returns the Jobs that just became terminal, so
    /// callers can fire a one-time per-patch notification.
    fn roll_up_job_statuses(&self, now_unix: i64) -> Result<Vec<Job>>;

    // --- Patches ---
    fn get_patch(&self, id: i64) -> Result<Option<Patch>>;

    // --- Records ---
    fn append_record_group(&self, group: RecordGroup) -> Result<i64>;
    fn delete_record_groups_older_than(&self, cutoff_unix: i64) -> Result<u64>;

    // --- Patches / janitor support ---
    fn discard_stale_pending_patch_sets(&self, cutoff_unix: i64) -> Result<u64>;
    fn delete_unreferenced_patches_older_than(&self, cutoff_unix: i64) -> Result<u64>;
    fn delete_jobs_ended_before(&self, cutoff_unix: i64) -> Result<Vec<i64>>;
    fn archive_jobs_ended_before(&self, cutoff_unix: i64) -> Result<Vec<i64>>;
    fn delete_deleted_vms_without_task_refs(&self) -> Result<Vec<String>>;

    #[allow(dead_code)]
    fn record_kind_roundtrips(&self, kind: RecordKind) -> bool {
        RecordKind::parse(kind.as_str()) == Some(kind)
    }
}
