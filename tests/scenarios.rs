//! End-to-end scenario coverage (spec.md §8 E1-E6), driving the VM
//! lifecycle worker, task worker and record store together the way a
//! real job runs, without spawning real child processes or touching
//! libvirt/the guest agent.

use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use winci::agent::{AgentChannel, AgentDialer, WaitOutcome};
use winci::config::Config;
use winci::error::{Error, Result};
use winci::model::{FileType, JobStatus, StepKind, TaskStatus, VmRole, VmState, VmStatus, VmType};
use winci::store::{NewJob, NewStep, NewTask, RecordStore, SqliteStore};
use winci::task_worker;
use winci::vlw;
use winci::vmdriver::{PowerState, VmDriver};

struct FakeChannel {
    log: String,
    wait_outcome: WaitOutcome,
}

impl AgentChannel for FakeChannel {
    fn set_time(&mut self, _unix_secs: u64) -> Result<()> {
        Ok(())
    }
    fn send_file(&mut self, _local_path: &Path, _remote_path: &str, _mode: u32) -> Result<()> {
        Ok(())
    }
    fn send_file_from_string(&mut self, _contents: &str, _remote_path: &str, _mode: u32) -> Result<()> {
        Ok(())
    }
    fn get_file(&mut self, remote_path: &str, local_path: &Path) -> Result<()> {
        if remote_path.ends_with("task.log") {
            fs::write(local_path, &self.log)?;
            Ok(())
        } else {
            Err(Error::AgentGuest { vm: "vm1".into(), message: "no such file".into() })
        }
    }
    fn run(&mut self, _argv: &[String]) -> Result<u32> {
        Ok(100)
    }
    fn wait(&mut self, _pid: u32, _timeout: Duration, _keepalive: Duration) -> Result<WaitOutcome> {
        Ok(self.wait_outcome)
    }
    fn ping(&mut self) -> Result<()> {
        Ok(())
    }
    fn set_connect_timeout(&mut self, _secs: u64) {}
    fn disconnect(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct FakeDialer {
    channel: Mutex<Option<FakeChannel>>,
}

impl AgentDialer for FakeDialer {
    fn dial(&self, _vm: &str) -> Result<Box<dyn AgentChannel>> {
        let channel = self.channel.lock().unwrap().take().expect("channel already consumed");
        Ok(Box::new(channel))
    }
}

/// Every dial attempt fails outright, the way a dropped connection or an
/// unreachable agent port would.
struct FailingDialer;

impl AgentDialer for FailingDialer {
    fn dial(&self, vm: &str) -> Result<Box<dyn AgentChannel>> {
        Err(Error::AgentTransport { vm: vm.to_string(), message: "connection refused".into() })
    }
}

/// Always reachable; used for Tasks where the VM side is not under test.
struct FakeDriver;

impl VmDriver for FakeDriver {
    fn is_powered_on(&self, _vm: &str) -> Result<PowerState> {
        Ok(PowerState::On)
    }
    fn power_off(&self, _vm: &str, _force: bool) -> Result<()> {
        Ok(())
    }
    fn revert_to_snapshot(&self, _vm: &str, _snapshot: &str) -> Result<()> {
        Ok(())
    }
    fn current_snapshot_name(&self, _vm: &str) -> Result<Option<String>> {
        Ok(None)
    }
    fn capture_screen_image(&self, _vm: &str) -> Result<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }
}

/// Dials fine but the guest never answers `wait`: the test shut its own
/// host down mid-run, the way a misbehaving test binary would.
struct CrashingChannel;

impl AgentChannel for CrashingChannel {
    fn set_time(&mut self, _unix_secs: u64) -> Result<()> {
        Ok(())
    }
    fn send_file(&mut self, _local_path: &Path, _remote_path: &str, _mode: u32) -> Result<()> {
        Ok(())
    }
    fn send_file_from_string(&mut self, _contents: &str, _remote_path: &str, _mode: u32) -> Result<()> {
        Ok(())
    }
    fn get_file(&mut self, _remote_path: &str, _local_path: &Path) -> Result<()> {
        Err(Error::AgentTransport { vm: "win32-1".into(), message: "connection reset".into() })
    }
    fn run(&mut self, _argv: &[String]) -> Result<u32> {
        Ok(1)
    }
    fn wait(&mut self, _pid: u32, _timeout: Duration, _keepalive: Duration) -> Result<WaitOutcome> {
        Err(Error::AgentTransport { vm: "win32-1".into(), message: "connection reset by peer".into() })
    }
    fn ping(&mut self) -> Result<()> {
        Err(Error::AgentTransport { vm: "win32-1".into(), message: "connection reset".into() })
    }
    fn set_connect_timeout(&mut self, _secs: u64) {}
    fn disconnect(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct CrashingDialer;

impl AgentDialer for CrashingDialer {
    fn dial(&self, _vm: &str) -> Result<Box<dyn AgentChannel>> {
        Ok(Box::new(CrashingChannel))
    }
}

/// Reports the VM as powered off, as the hypervisor would once the guest
/// has actually shut itself (or been shut) down.
struct PoweredOffDriver;

impl VmDriver for PoweredOffDriver {
    fn is_powered_on(&self, _vm: &str) -> Result<PowerState> {
        Ok(PowerState::Off)
    }
    fn power_off(&self, _vm: &str, _force: bool) -> Result<()> {
        Ok(())
    }
    fn revert_to_snapshot(&self, _vm: &str, _snapshot: &str) -> Result<()> {
        Ok(())
    }
    fn current_snapshot_name(&self, _vm: &str) -> Result<Option<String>> {
        Ok(None)
    }
    fn capture_screen_image(&self, _vm: &str) -> Result<Vec<u8>> {
        Ok(vec![])
    }
}

/// Host-down: every driver call reports `Unknown`, as libvirt does when it
/// cannot reach the hypervisor at all.
struct UnreachableDriver;

impl VmDriver for UnreachableDriver {
    fn is_powered_on(&self, _vm: &str) -> Result<PowerState> {
        Ok(PowerState::Unknown)
    }
    fn power_off(&self, vm: &str, _force: bool) -> Result<()> {
        Err(Error::VmDriver { vm: vm.to_string(), operation: "power_off", message: "host unreachable".into() })
    }
    fn revert_to_snapshot(&self, vm: &str, _snapshot: &str) -> Result<()> {
        Err(Error::VmDriver { vm: vm.to_string(), operation: "revert_to_snapshot", message: "host unreachable".into() })
    }
    fn current_snapshot_name(&self, _vm: &str) -> Result<Option<String>> {
        Ok(None)
    }
    fn capture_screen_image(&self, _vm: &str) -> Result<Vec<u8>> {
        Ok(vec![])
    }
}

fn test_config() -> Config {
    let file = tempfile::NamedTempFile::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    fs::write(file.path(), format!("data_dir = \"{}\"\n", dir.path().display())).unwrap();
    let mut config = Config::load(file.path()).unwrap();
    std::mem::forget(dir);
    config.wait_for_tools_in_vm_secs = 1;
    config
}

fn sample_vm(name: &str, vm_type: VmType, status: VmStatus) -> VmState {
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

/// E1 Good patch: a `Build` Step feeds a dependent `Suite` Step via
/// `PreviousNo`. The build Task completes cleanly, which unblocks the
/// test Task; both land `completed` and the Job carries zero failures.
#[test]
fn e1_good_patch_runs_build_then_dependent_suite() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.insert_vm(sample_vm("build1", VmType::Build, VmStatus::Running)).unwrap();
    store.insert_vm(sample_vm("win32-1", VmType::Win32, VmStatus::Running)).unwrap();

    let job_id = store
        .insert_job(NewJob { priority: 3, remarks: String::new(), user: "alice".into(), patch_id: None, submitted: 0 })
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
                file_name: None,
                in_staging: false,
                debug_level: 0,
                report_successful_tests: false,
            },
        )
        .unwrap();
    store
        .insert_step(
            job_id,
            NewStep {
                no: 1,
                previous_no: Some(0),
                kind: StepKind::Suite,
                file_type: FileType::Exe32,
                file_name: None,
                in_staging: false,
                debug_level: 0,
                report_successful_tests: false,
            },
        )
        .unwrap();
    let build_task = store
        .insert_task(job_id, 0, NewTask { no: 0, vm: Some("build1".into()), cmd_line_arg: None, timeout_secs: 60 })
        .unwrap();
    let suite_task = store
        .insert_task(job_id, 1, NewTask { no: 0, vm: Some("win32-1".into()), cmd_line_arg: None, timeout_secs: 60 })
        .unwrap();

    let config = test_config();
    let mut reporter = ();

    let build_dialer = FakeDialer {
        channel: Mutex::new(Some(FakeChannel { log: "building...\nok\n".into(), wait_outcome: Some(0) })),
    };
    task_worker::run(&config, &store, &build_dialer, &FakeDriver, job_id, 0, build_task, &mut reporter).unwrap();
    assert_eq!(store.get_task(build_task).unwrap().unwrap().status, TaskStatus::Completed);

    // The dependent Step's Task only becomes eligible once its
    // predecessor is terminal; cancel_orphaned_dependents() is a no-op
    // here precisely because the build Step succeeded.
    let canceled = store.cancel_orphaned_dependents().unwrap();
    assert!(canceled.is_empty());

    let suite_dialer = FakeDialer {
        channel: Mutex::new(Some(FakeChannel { log: "running...\nok\n".into(), wait_outcome: Some(0) })),
    };
    task_worker::run(&config, &store, &suite_dialer, &FakeDriver, job_id, 1, suite_task, &mut reporter).unwrap();

    let suite = store.get_task(suite_task).unwrap().unwrap();
    assert_eq!(suite.status, TaskStatus::Completed);
    assert_eq!(suite.test_failures, 0);
}

/// E2 Patch does not apply: the build Task's log ends `badpatch`, so the
/// build is marked `badpatch` and its dependent Step's Task is canceled
/// rather than ever dispatched.
#[test]
fn e2_bad_patch_cancels_dependent_step() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.insert_vm(sample_vm("build1", VmType::Build, VmStatus::Running)).unwrap();

    let job_id = store
        .insert_job(NewJob { priority: 3, remarks: String::new(), user: "alice".into(), patch_id: None, submitted: 0 })
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
                file_name: None,
                in_staging: false,
                debug_level: 0,
                report_successful_tests: false,
            },
        )
        .unwrap();
    store
        .insert_step(
            job_id,
            NewStep {
                no: 1,
                previous_no: Some(0),
                kind: StepKind::Suite,
                file_type: FileType::Exe32,
                file_name: None,
                in_staging: false,
                debug_level: 0,
                report_successful_tests: false,
            },
        )
        .unwrap();
    let build_task = store
        .insert_task(job_id, 0, NewTask { no: 0, vm: Some("build1".into()), cmd_line_arg: None, timeout_secs: 60 })
        .unwrap();
    let suite_task = store
        .insert_task(job_id, 1, NewTask { no: 0, vm: None, cmd_line_arg: None, timeout_secs: 60 })
        .unwrap();

    let config = test_config();
    let mut reporter = ();
    let dialer = FakeDialer {
        channel: Mutex::new(Some(FakeChannel { log: "applying...\nbadpatch\n".into(), wait_outcome: Some(1) })),
    };
    task_worker::run(&config, &store, &dialer, &FakeDriver, job_id, 0, build_task, &mut reporter).unwrap();
    assert_eq!(store.get_task(build_task).unwrap().unwrap().status, TaskStatus::BadPatch);

    let canceled = store.cancel_orphaned_dependents().unwrap();
    assert_eq!(canceled, vec![suite_task]);
    assert_eq!(store.get_task(suite_task).unwrap().unwrap().status, TaskStatus::Canceled);
}

/// E3 Timeout: the test binary never exits within `Task.Timeout`. The
/// Task still completes with one failure charged and a screenshot on
/// disk, rather than being requeued.
#[test]
fn e3_suite_timeout_completes_with_one_failure_and_a_screenshot() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.insert_vm(sample_vm("win32-1", VmType::Win32, VmStatus::Running)).unwrap();
    let job_id = store
        .insert_job(NewJob { priority: 3, remarks: String::new(), user: "alice".into(), patch_id: None, submitted: 0 })
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
                file_name: None,
                in_staging: false,
                debug_level: 0,
                report_successful_tests: false,
            },
        )
        .unwrap();
    let task_id = store
        .insert_task(job_id, 0, NewTask { no: 0, vm: Some("win32-1".into()), cmd_line_arg: None, timeout_secs: 60 })
        .unwrap();

    let config = test_config();
    let mut reporter = ();
    let dialer = FakeDialer {
        channel: Mutex::new(Some(FakeChannel { log: String::new(), wait_outcome: None })),
    };
    task_worker::run(&config, &store, &dialer, &FakeDriver, job_id, 0, task_id, &mut reporter).unwrap();

    let task = store.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.test_failures, 1);
    let screenshot = config.task_dir(job_id, 0, task_id).join("screenshot.png");
    assert!(screenshot.exists());
}

/// E5 Host down: `revert` cannot even power the VM off because the
/// hypervisor itself is unreachable. The VM lands `offline` (never
/// `dirty`/`idle`) rather than being silently retried in place, so a
/// separate `monitor` poll is required before it is usable again.
#[test]
fn e5_host_down_during_revert_marks_vm_offline() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.insert_vm(sample_vm("win32-1", VmType::Win32, VmStatus::Reverting)).unwrap();
    let config = test_config();
    let mut reporter = ();
    let dialer = FakeDialer { channel: Mutex::new(None) };

    let err = vlw::revert(&config, &store, &UnreachableDriver, &dialer, "win32-1", &mut reporter).unwrap_err();
    assert!(matches!(err, Error::VmDriver { .. }));
    let vm = store.get_vm("win32-1").unwrap().unwrap();
    assert_eq!(vm.status, VmStatus::Offline);
    assert_eq!(vm.errors, 1);

    // The host recovers; monitor() finds it reachable again and returns
    // the VM to `off` rather than jumping straight back into rotation.
    assert!(vlw::monitor(&store, &FakeDriver, "win32-1").unwrap());
    assert_eq!(store.get_vm("win32-1").unwrap().unwrap().status, VmStatus::Off);
}

/// E6 Retry ladder: two `BotError` classifications (simulated here via
/// transport failures that never reach a log) are requeued without ever
/// touching `TestFailures`; a third, successful attempt completes.
#[test]
fn e6_retry_ladder_requeues_transient_failures_then_completes() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.insert_vm(sample_vm("win32-1", VmType::Win32, VmStatus::Running)).unwrap();
    let job_id = store
        .insert_job(NewJob { priority: 3, remarks: String::new(), user: "alice".into(), patch_id: None, submitted: 0 })
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
                file_name: None,
                in_staging: false,
                debug_level: 0,
                report_successful_tests: false,
            },
        )
        .unwrap();
    let task_id = store
        .insert_task(job_id, 0, NewTask { no: 0, vm: Some("win32-1".into()), cmd_line_arg: None, timeout_secs: 60 })
        .unwrap();

    let config = test_config();
    assert!(config.max_task_tries >= 3);
    let mut reporter = ();

    // Two attempts where dialing the agent itself fails outright: no
    // log is ever produced, so the worker reports a bot error rather
    // than any log-derived classification.
    for attempt in 0..2 {
        let vm = store.get_vm("win32-1").unwrap().unwrap();
        assert_eq!(vm.status, VmStatus::Running, "attempt {attempt}");
        task_worker::run(&config, &store, &FailingDialer, &FakeDriver, job_id, 0, task_id, &mut reporter).unwrap();
        let task = store.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued, "attempt {attempt}");
        assert!(task.vm.is_none(), "attempt {attempt}: requeue clears the VM claim");
        // The engine would normally re-claim the Task against a VM and
        // flip it back to `running`; do that by hand here since the
        // scheduler itself is out of scope for this test.
        store.set_task_vm(task_id, Some("win32-1")).unwrap();
        store.cas_task_status(task_id, TaskStatus::Queued, TaskStatus::Running).unwrap();
    }

    let dialer = FakeDialer {
        channel: Mutex::new(Some(FakeChannel { log: "running...\nok\n".into(), wait_outcome: Some(0) })),
    };
    task_worker::run(&config, &store, &dialer, &FakeDriver, job_id, 0, task_id, &mut reporter).unwrap();
    let task = store.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.test_failures, 0);
}

/// E4 VM crash mid-test: the agent connection drops mid-run and the
/// hypervisor subsequently reports the VM powered off. The outcome is
/// attributed to the test, not the bot: one failure charged, `completed`,
/// no retry consumed.
#[test]
fn e4_vm_crash_mid_test_completes_with_one_failure_and_no_retry() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.insert_vm(sample_vm("win32-1", VmType::Win32, VmStatus::Running)).unwrap();
    let job_id = store
        .insert_job(NewJob { priority: 3, remarks: String::new(), user: "alice".into(), patch_id: None, submitted: 0 })
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
                file_name: None,
                in_staging: false,
                debug_level: 0,
                report_successful_tests: false,
            },
        )
        .unwrap();
    let task_id = store
        .insert_task(job_id, 0, NewTask { no: 0, vm: Some("win32-1".into()), cmd_line_arg: None, timeout_secs: 60 })
        .unwrap();

    let config = test_config();
    let mut reporter = ();
    task_worker::run(&config, &store, &CrashingDialer, &PoweredOffDriver, job_id, 0, task_id, &mut reporter).unwrap();

    let task = store.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.test_failures, 1);
    // The VM itself is left for the engine to cycle back to `dirty`; no
    // retry attempt was consumed classifying this outcome.
    assert_eq!(store.get_vm("win32-1").unwrap().unwrap().errors, 0);
}
