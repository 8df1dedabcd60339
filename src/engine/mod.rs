//! Engine dispatcher (ED): the long-running process that reaps finished
//! child workers, retires stuck VMs, keeps dirty VMs cycling back to a
//! usable state, and matches ready tasks to compatible VMs (spec.md §4.1).
//!
//! Every VM action and every task execution happens in its own child
//! process (`vm-worker` / `task-worker`) rather than running everything
//! inline on one thread, so the engine can supervise by pid.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{Job, Record, RecordGroup, RecordKind, StepKind, VmState, VmStatus, VmType};
use crate::notify::{self, NullSmtp, Smtp};
use crate::reporter::{Event, Reporter};
use crate::store::RecordStore;

/// Paths to the worker binaries this process spawns. Resolved once at
/// startup, typically sitting next to the engine binary itself.
#[derive(Debug, Clone)]
pub struct BinaryPaths {
    pub vm_worker: PathBuf,
    pub task_worker: PathBuf,
}

#[derive(Debug, Clone)]
enum ChildKind {
    VmAction { vm: String },
    Task { job: i64, step: i64, task: i64, vm: String },
}

struct ChildHandle {
    child: Child,
    kind: ChildKind,
}

/// A ready Task claimed against a VM that still needs a fresh revert
/// before it can run. Recorded when ED CAS's `idle -> reverting` and
/// spawns VLW(revert); resolved once that revert lands the VM back on
/// `idle` (promote to `running`, spawn the task worker) or `offline`
/// (drop the assignment; the Task is still `queued` and will be retried
/// against a different VM) (spec.md §4.1 steps 6-7).
#[derive(Debug, Clone)]
struct PendingAssignment {
    job: i64,
    step: i64,
    task: i64,
}

/// How the engine handles an ownerless `dirty` VM: try the cheap
/// snapshot-identity check a few times before giving up and forcing it off.
const DIRTY_CHECKIDLE_ATTEMPTS: u32 = 3;

pub struct Engine<'a> {
    config: &'a Config,
    store: &'a dyn RecordStore,
    paths: BinaryPaths,
    smtp: &'a dyn Smtp,
    children: HashMap<u32, ChildHandle>,
    dirty_attempts: HashMap<String, u32>,
    pending_assignments: HashMap<String, PendingAssignment>,
}

impl<'a> Engine<'a> {
    pub fn new(config: &'a Config, store: &'a dyn RecordStore, paths: BinaryPaths) -> Self {
        Engine::with_smtp(config, store, paths, &NullSmtp)
    }

    /// Like [`Engine::new`], but with an explicit notifier instead of the
    /// no-op default (spec.md §2.9: per-patch author emails on Job status
    /// changes).
    pub fn with_smtp(config: &'a Config, store: &'a dyn RecordStore, paths: BinaryPaths, smtp: &'a dyn Smtp) -> Self {
        Engine {
            config,
            store,
            paths,
            smtp,
            children: HashMap::new(),
            dirty_attempts: HashMap::new(),
            pending_assignments: HashMap::new(),
        }
    }

    /// Run one scheduling pass. Callers loop this with a short sleep
    /// between iterations; the loop itself lives in `src/bin/engine.rs`.
    pub fn tick(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        self.reap_children(reporter)?;
        self.evict_overdue_children(reporter)?;
        self.service_dirty_vms(reporter)?;
        self.service_pending_reverts(reporter)?;
        self.schedule_ready_tasks(reporter)?;
        self.roll_up_jobs(reporter)?;
        self.record_vm_status_snapshot()?;
        Ok(())
    }

    /// Derive Job status from its Tasks (spec.md §3) and notify the patch
    /// author of any Job that just became terminal.
    fn roll_up_jobs(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        let finalized = self.store.roll_up_job_statuses(now_unix())?;
        for job in finalized {
            reporter.report(Event::Message {
                severity: crate::reporter::Severity::Info,
                text: format!("job={} status={}", job.id, job.status.as_str()),
            });
            self.notify_patch_status(&job);
        }
        Ok(())
    }

    fn notify_patch_status(&self, job: &Job) {
        let Some(patch_id) = job.patch_id else { return };
        let patch = match self.store.get_patch(patch_id) {
            Ok(Some(patch)) => patch,
            Ok(None) => {
                log::warn!("job={} references missing patch_id={patch_id}", job.id);
                return;
            }
            Err(err) => {
                log::warn!("job={} failed to load patch_id={patch_id}: {err}", job.id);
                return;
            }
        };
        let job_url = self.config.job_url(job.id);
        match notify::patch_status_notification(&self.config.smtp, &job.user, &patch.msgid, job.status.as_str(), &job_url) {
            Ok(notification) => {
                if let Err(err) = self.smtp.send(&notification) {
                    log::warn!("job={} failed to send patch status notification: {err}", job.id);
                }
            }
            Err(err) => log::warn!("job={} could not compose patch status notification: {err}", job.id),
        }
    }

    /// Append one `RecordGroup` of kind `vmstatus` per tick, one `Record`
    /// per VM (spec.md §3 "Appended by ED and workers"). `janitor` purges
    /// groups past the retention horizon.
    fn record_vm_status_snapshot(&self) -> Result<()> {
        let records = self
            .store
            .list_vms()?
            .into_iter()
            .map(|vm| Record {
                kind: RecordKind::VmStatus,
                name: vm.name,
                value: vm.status.as_str().to_string(),
            })
            .collect::<Vec<_>>();
        if records.is_empty() {
            return Ok(());
        }
        self.store.append_record_group(RecordGroup {
            id: 0,
            timestamp: now_unix(),
            records,
        })?;
        Ok(())
    }

    fn reap_children(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        let mut finished = Vec::new();
        for (pid, handle) in self.children.iter_mut() {
            match handle.child.try_wait() {
                Ok(Some(_status)) => finished.push(*pid),
                Ok(None) => {}
                Err(err) => {
                    log::warn!("failed to poll child pid={pid}: {err}");
                }
            }
        }
        for pid in finished {
            if let Some(handle) = self.children.remove(&pid) {
                self.on_child_finished(handle, reporter)?;
            }
        }
        Ok(())
    }

    fn on_child_finished(&mut self, handle: ChildHandle, reporter: &mut dyn Reporter) -> Result<()> {
        match handle.kind {
            ChildKind::VmAction { vm } => {
                self.store.set_vm_child(&vm, None, None)?;
            }
            ChildKind::Task { job, step, task, vm } => {
                self.store.set_vm_child(&vm, None, None)?;
                if let Some(vm_state) = self.store.get_vm(&vm)? {
                    if vm_state.status == VmStatus::Running {
                        self.store.cas_vm_status(&vm, VmStatus::Running, VmStatus::Dirty)?;
                        reporter.report(Event::VmTransition { vm: vm.clone(), from: "running", to: "dirty" });
                    }
                }
                log::info!("job={job} step={step} task={task} vm={vm} task-worker exited");
            }
        }
        Ok(())
    }

    /// Kill and fail any child that has run past its `ChildDeadline`
    /// (spec.md §4.1 step 2, §7 "host down" handling).
    fn evict_overdue_children(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        let now = now_unix();
        let mut overdue = Vec::new();
        for (pid, handle) in self.children.iter() {
            let vm_name = match &handle.kind {
                ChildKind::VmAction { vm } | ChildKind::Task { vm, .. } => vm.clone(),
            };
            if let Some(vm) = self.store.get_vm(&vm_name)? {
                if vm.child_deadline.map(|d| now >= d).unwrap_or(false) {
                    overdue.push(*pid);
                }
            }
        }
        for pid in overdue {
            if let Some(mut handle) = self.children.remove(&pid) {
                let _ = handle.child.kill();
                let _ = handle.child.wait();
                let vm_name = match &handle.kind {
                    ChildKind::VmAction { vm } | ChildKind::Task { vm, .. } => vm.clone(),
                };
                if let Some(vm) = self.store.get_vm(&vm_name)? {
                    let _ = self.store.cas_vm_status(&vm_name, vm.status, VmStatus::Offline);
                }
                self.store.record_vm_error(&vm_name)?;
                self.store.set_vm_child(&vm_name, None, None)?;
                reporter.report(Event::Message {
                    severity: crate::reporter::Severity::Error,
                    text: format!("vm={vm_name} evicted: child pid={pid} exceeded its deadline"),
                });
                if let ChildKind::Task { job, step, task, .. } = handle.kind {
                    self.store.cas_task_status(task, crate::model::TaskStatus::Running, crate::model::TaskStatus::BotError)?;
                    log::error!("job={job} step={step} task={task} failed: host unreachable past deadline");
                }
            }
        }
        Ok(())
    }

    /// Spawn `vm-worker checkidle`/`checkoff` for every `dirty` VM with no
    /// child currently assigned to it (spec.md §4.2).
    fn service_dirty_vms(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        for vm in self.store.list_vms()? {
            if vm.status != VmStatus::Dirty || vm.child_pid.is_some() {
                continue;
            }
            let attempts = self.dirty_attempts.entry(vm.name.clone()).or_insert(0);
            let action = if *attempts < DIRTY_CHECKIDLE_ATTEMPTS { "checkidle" } else { "checkoff" };
            *attempts += 1;
            self.spawn_vm_action(&vm.name, action, reporter)?;
        }
        Ok(())
    }

    /// Match ready tasks to compatible, available VMs and claim them
    /// (spec.md §4.1 steps 3-6). A build VM has no snapshot to protect and
    /// goes straight from `off` to `running`; every other VM type must be
    /// freshly reverted first, so it is claimed `idle -> reverting` and a
    /// VLW(revert) is spawned instead of the task worker. The task worker
    /// itself is only spawned once that revert lands the VM on `idle`
    /// again, in [`Engine::service_pending_reverts`].
    fn schedule_ready_tasks(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        self.store.cancel_orphaned_dependents()?;
        let ready = self.store.list_ready_tasks()?;
        let mut vms = self.store.list_vms()?;

        for ready_task in ready {
            let is_64bit = ready_task
                .task
                .cmd_line_arg
                .as_deref()
                .map(|arg| arg.contains("64"))
                .unwrap_or(false);
            let explicit_vm = ready_task.task.vm.clone();

            let slot = vms.iter_mut().position(|vm| {
                if vm.child_pid.is_some() {
                    return false;
                }
                if self.pending_assignments.contains_key(&vm.name) {
                    return false;
                }
                let acceptable_status = if needs_snapshot_fidelity(vm) {
                    vm.status == VmStatus::Idle
                } else {
                    vm.status == VmStatus::Off
                };
                if !acceptable_status {
                    return false;
                }
                if let Some(explicit) = &explicit_vm {
                    return &vm.name == explicit;
                }
                vm.compatible_with(ready_task.step.kind, is_64bit)
            });

            let Some(idx) = slot else { continue };
            let vm_name = vms[idx].name.clone();

            if needs_snapshot_fidelity(&vms[idx]) {
                if !self.store.cas_vm_status(&vm_name, VmStatus::Idle, VmStatus::Reverting)? {
                    continue;
                }
                reporter.report(Event::VmTransition { vm: vm_name.clone(), from: "idle", to: "reverting" });
                self.store.set_task_vm(ready_task.task.id, Some(&vm_name))?;
                self.pending_assignments.insert(
                    vm_name.clone(),
                    PendingAssignment {
                        job: ready_task.job.id,
                        step: ready_task.step.no,
                        task: ready_task.task.id,
                    },
                );
                self.spawn_vm_action(&vm_name, "revert", reporter)?;
            } else {
                if !self.store.cas_vm_status(&vm_name, VmStatus::Off, VmStatus::Running)? {
                    continue;
                }
                reporter.report(Event::VmTransition { vm: vm_name.clone(), from: "off", to: "running" });
                self.claim_and_spawn(&ready_task, &vm_name)?;
            }

            vms.remove(idx);
        }
        Ok(())
    }

    /// Promote every VM whose outstanding revert (spawned by
    /// [`Engine::schedule_ready_tasks`]) has finished: a VM back on `idle`
    /// is claimed `idle -> running` and the task worker starts; a VM that
    /// landed on `offline` had its revert fail, so the assignment is
    /// dropped and the Task (still `queued`) is left for the next tick to
    /// try against a different VM (spec.md §4.1 step 7, §4.2 "revert
    /// sequence").
    fn service_pending_reverts(&mut self, reporter: &mut dyn Reporter) -> Result<()> {
        let mut resolved = Vec::new();
        for (vm_name, assignment) in self.pending_assignments.iter() {
            let Some(vm) = self.store.get_vm(vm_name)? else {
                resolved.push(vm_name.clone());
                continue;
            };
            match vm.status {
                VmStatus::Idle => {
                    resolved.push(vm_name.clone());
                    if self.store.cas_vm_status(vm_name, VmStatus::Idle, VmStatus::Running)? {
                        reporter.report(Event::VmTransition { vm: vm_name.clone(), from: "idle", to: "running" });
                        let ready_task = crate::store::ReadyTask {
                            job: self
                                .store
                                .get_job(assignment.job)?
                                .ok_or_else(|| Error::NotFound { kind: "job", key: assignment.job.to_string() })?,
                            step: self
                                .store
                                .get_step(assignment.job, assignment.step)?
                                .ok_or_else(|| Error::NotFound { kind: "step", key: format!("{}/{}", assignment.job, assignment.step) })?,
                            task: self
                                .store
                                .get_task(assignment.task)?
                                .ok_or_else(|| Error::NotFound { kind: "task", key: assignment.task.to_string() })?,
                        };
                        self.claim_and_spawn(&ready_task, vm_name)?;
                    }
                }
                VmStatus::Offline => {
                    resolved.push(vm_name.clone());
                    log::warn!(
                        "job={} step={} task={} vm={vm_name} revert failed; task remains queued for reassignment",
                        assignment.job,
                        assignment.step,
                        assignment.task
                    );
                }
                _ => {}
            }
        }
        for vm_name in resolved {
            self.pending_assignments.remove(&vm_name);
        }
        Ok(())
    }

    /// Mark a Task `running` against the VM it was just handed, and spawn
    /// its task worker with a deadline of `Timeout + slack`.
    fn claim_and_spawn(&mut self, ready_task: &crate::store::ReadyTask, vm_name: &str) -> Result<()> {
        self.store.cas_task_status(ready_task.task.id, crate::model::TaskStatus::Queued, crate::model::TaskStatus::Running)?;
        self.store.set_task_vm(ready_task.task.id, Some(vm_name))?;
        self.store.set_task_times(ready_task.task.id, Some(now_unix()), None)?;

        let deadline = now_unix()
            + ready_task.task.timeout_secs as i64
            + self.config.task_deadline_slack_secs as i64;
        self.spawn_task_worker(ready_task, vm_name, deadline)
    }

    fn spawn_vm_action(&mut self, vm: &str, action: &str, reporter: &mut dyn Reporter) -> Result<()> {
        let child = Command::new(&self.paths.vm_worker)
            .arg(action)
            .arg(vm)
            .spawn()
            .map_err(|err| Error::VmDriver {
                vm: vm.to_string(),
                operation: "spawn",
                message: err.to_string(),
            })?;
        let pid = child.id();
        let deadline = now_unix() + self.config.revert_budget_secs as i64;
        self.store.set_vm_child(vm, Some(pid as i32), Some(deadline))?;
        self.children.insert(pid, ChildHandle { child, kind: ChildKind::VmAction { vm: vm.to_string() } });
        reporter.report(Event::Message {
            severity: crate::reporter::Severity::Info,
            text: format!("vm={vm} spawned vm-worker {action} pid={pid}"),
        });
        Ok(())
    }

    fn spawn_task_worker(&mut self, ready_task: &crate::store::ReadyTask, vm: &str, deadline: i64) -> Result<()> {
        let child = Command::new(&self.paths.task_worker)
            .arg(ready_task.job.id.to_string())
            .arg(ready_task.step.no.to_string())
            .arg(ready_task.task.id.to_string())
            .spawn()
            .map_err(|err| Error::TaskFailed {
                job: ready_task.job.id,
                step: ready_task.step.no,
                task: ready_task.task.id,
                message: format!("failed to spawn task-worker: {err}"),
            })?;
        let pid = child.id();
        self.store.set_vm_child(vm, Some(pid as i32), Some(deadline))?;
        self.children.insert(
            pid,
            ChildHandle {
                child,
                kind: ChildKind::Task {
                    job: ready_task.job.id,
                    step: ready_task.step.no,
                    task: ready_task.task.id,
                    vm: vm.to_string(),
                },
            },
        );
        Ok(())
    }
}

/// A build VM never goes through a snapshot revert; it cycles directly
/// between `off` and `running` (spec.md §4.1 "matching rule").
pub fn needs_snapshot_fidelity(vm: &VmState) -> bool {
    vm.vm_type != VmType::Build
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::store::{NewJob, NewStep, NewTask};
    use crate::model::{FileType, JobStatus, VmRole};

    fn sample_vm(name: &str, status: VmStatus, vm_type: VmType) -> VmState {
        VmState {
            name: name.into(),
            vm_type,
            role: VmRole::Base,
            sort_order: 0,
            idle_snapshot: "idle".into(),
            status,
            child_pid: None,
            child_deadline: None,
            errors: 0,
            description: String::new(),
            details: String::new(),
        }
    }

    #[test]
    fn service_dirty_vms_escalates_to_checkoff_after_repeated_attempts() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_vm(sample_vm("vm1", VmStatus::Dirty, VmType::Win32)).unwrap();
        let config_path = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(config_path.path(), "data_dir = \"/tmp/winci\"\n").unwrap();
        let config = Config::load(config_path.path()).unwrap();
        let paths = BinaryPaths { vm_worker: "/bin/true".into(), task_worker: "/bin/true".into() };
        let mut engine = Engine::new(&config, &store, paths);
        let mut reporter = ();

        for _ in 0..DIRTY_CHECKIDLE_ATTEMPTS {
            engine.service_dirty_vms(&mut reporter).unwrap();
            // the spawned /bin/true exits almost immediately; clear its
            // child slot the way reap_children would so the next dirty
            // sweep is not skipped for "already has a child" reasons.
            store.set_vm_child("vm1", None, None).unwrap();
            engine.children.clear();
        }
        assert_eq!(*engine.dirty_attempts.get("vm1").unwrap(), DIRTY_CHECKIDLE_ATTEMPTS);
    }

    #[test]
    fn schedule_ready_tasks_matches_compatible_idle_vm() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_vm(sample_vm("build1", VmStatus::Off, VmType::Build)).unwrap();
        let job_id = store
            .insert_job(NewJob { priority: 5, remarks: String::new(), user: "alice".into(), patch_id: None, submitted: 0 })
            .unwrap();
        store.set_job_status(job_id, JobStatus::Running, None).unwrap();
        store
            .insert_step(
                job_id,
                NewStep {
                    no: 0,
                    previous_no: None,
                    kind: StepKind::Build,
                    file_type: FileType::Patch,
                    file_name: Some("a.patch".into()),
                    in_staging: false,
                    debug_level: 0,
                    report_successful_tests: false,
                },
            )
            .unwrap();
        let task_id = store
            .insert_task(job_id, 0, NewTask { no: 0, vm: None, cmd_line_arg: None, timeout_secs: 600 })
            .unwrap();

        let config_path = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(config_path.path(), "data_dir = \"/tmp/winci\"\n").unwrap();
        let config = Config::load(config_path.path()).unwrap();
        let paths = BinaryPaths { vm_worker: "/bin/true".into(), task_worker: "/bin/true".into() };
        let mut engine = Engine::new(&config, &store, paths);
        let mut reporter = ();

        engine.schedule_ready_tasks(&mut reporter).unwrap();

        let vm = store.get_vm("build1").unwrap().unwrap();
        assert_eq!(vm.status, VmStatus::Running);
        let task = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, crate::model::TaskStatus::Running);
        assert_eq!(task.vm.as_deref(), Some("build1"));
    }

    #[test]
    fn schedule_ready_tasks_reverts_a_non_build_vm_before_running() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_vm(sample_vm("win32-1", VmStatus::Idle, VmType::Win32)).unwrap();
        let job_id = store
            .insert_job(NewJob { priority: 5, remarks: String::new(), user: "alice".into(), patch_id: None, submitted: 0 })
            .unwrap();
        store.set_job_status(job_id, JobStatus::Running, None).unwrap();
        store
            .insert_step(
                job_id,
                NewStep {
                    no: 0,
                    previous_no: None,
                    kind: StepKind::Suite,
                    file_type: FileType::Exe32,
                    file_name: Some("t.exe".into()),
                    in_staging: false,
                    debug_level: 0,
                    report_successful_tests: false,
                },
            )
            .unwrap();
        let task_id = store
            .insert_task(job_id, 0, NewTask { no: 0, vm: None, cmd_line_arg: None, timeout_secs: 60 })
            .unwrap();

        let config_path = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(config_path.path(), "data_dir = \"/tmp/winci\"\n").unwrap();
        let config = Config::load(config_path.path()).unwrap();
        let paths = BinaryPaths { vm_worker: "/bin/true".into(), task_worker: "/bin/true".into() };
        let mut engine = Engine::new(&config, &store, paths);
        let mut reporter = ();

        engine.schedule_ready_tasks(&mut reporter).unwrap();

        // Not running yet: a fresh revert is required first.
        let vm = store.get_vm("win32-1").unwrap().unwrap();
        assert_eq!(vm.status, VmStatus::Reverting);
        let task = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, crate::model::TaskStatus::Queued);
        assert!(engine.pending_assignments.contains_key("win32-1"));

        // Simulate the VLW(revert) child landing the VM back on idle.
        store.cas_vm_status("win32-1", VmStatus::Reverting, VmStatus::Idle).unwrap();
        engine.children.clear();
        engine.service_pending_reverts(&mut reporter).unwrap();

        let vm = store.get_vm("win32-1").unwrap().unwrap();
        assert_eq!(vm.status, VmStatus::Running);
        let task = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, crate::model::TaskStatus::Running);
        assert!(!engine.pending_assignments.contains_key("win32-1"));
    }
}
