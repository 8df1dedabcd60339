//! Task worker (TW): the entire lifetime of one VM-side task invocation
//! (spec.md §4.3). One process per task; the Step's `Kind` decides which
//! guest-side command line to run, but the surrounding upload / run / wait
//! / download / classify skeleton is shared, replacing the original
//! system's string-switch with the tagged `StepKind` dispatch already used
//! by the record store and VM matching rule (spec.md §9).

use std::fs;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::agent::AgentDialer;
use crate::classify::{self, LogOutcome};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{FileType, Job, Step, StepKind, Task, TaskStatus, VmStatus};
use crate::reporter::{Event, Reporter, Severity};
use crate::store::RecordStore;
use crate::vmdriver::VmDriver;

const REMOTE_WORK_DIR: &str = "C:\\winci";
const GUEST_LOG_PATH: &str = "C:\\winci\\task.log";
const GUEST_ERR_PATH: &str = "C:\\winci\\task.err";
const GUEST_REPORT_PATH: &str = "C:\\winci\\task.report";
const GUEST_DRIVER_PATH: &str = "C:\\winci\\driver.cmd";
const GUEST_LAUNCHER_PATH: &str = "C:\\winci\\launcher.exe";

/// Run the task identified by `(job_id, step_no, task_id)` to completion,
/// updating its status in the record store. Never panics on a VM-side
/// failure: every guest/transport error is classified and folded into a
/// `Task.Status` update rather than propagated to the caller, so the
/// calling binary's exit code reflects only bot-internal failures.
pub fn run(
    config: &Config,
    store: &dyn RecordStore,
    dialer: &dyn AgentDialer,
    driver: &dyn VmDriver,
    job_id: i64,
    step_no: i64,
    task_id: i64,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let task = store
        .get_task(task_id)?
        .ok_or_else(|| Error::NotFound { kind: "task", key: task_id.to_string() })?;
    let step = store
        .get_step(job_id, step_no)?
        .ok_or_else(|| Error::NotFound { kind: "step", key: format!("{job_id}/{step_no}") })?;
    let job = store
        .get_job(job_id)?
        .ok_or_else(|| Error::NotFound { kind: "job", key: job_id.to_string() })?;
    let vm_name = task.vm.clone().ok_or_else(|| Error::PreflightFailed {
        message: format!("task {task_id} has no VM assigned"),
    })?;
    let vm = store
        .get_vm(&vm_name)?
        .ok_or_else(|| Error::NotFound { kind: "vm", key: vm_name.clone() })?;
    // A VM that is not `running` (or the driver reports it powered off)
    // means the scheduler handed us stale state, not that anything about
    // this task failed: requeue without charging a retry attempt
    // (spec.md §4.3 step 1, §7 "VM lost").
    let powered_on = matches!(driver.is_powered_on(&vm_name), Ok(crate::vmdriver::PowerState::On));
    if vm.status != VmStatus::Running || !powered_on {
        log::warn!(
            "job={job_id} step={step_no} task={task_id} vm={vm_name}: not running (status={:?}, powered_on={powered_on}); requeuing without charging a retry",
            vm.status
        );
        store.set_task_status(task_id, TaskStatus::Queued)?;
        store.set_task_vm(task_id, None)?;
        reporter.report(Event::Message {
            severity: Severity::Warning,
            text: format!("job={job_id} step={step_no} task={task_id} vm={vm_name}: requeued, VM not ready"),
        });
        return Ok(());
    }

    let task_dir = config.task_dir(job_id, step_no, task_id);
    fs::create_dir_all(&task_dir).map_err(|source| Error::CreateDir { path: task_dir.clone(), source })?;

    let outcome = execute(config, dialer, driver, &vm_name, &job, &step, &task, &task_dir);
    let failure_message = outcome.as_ref().err().map(|err| err.to_string());

    // An `Err` from `execute` covers three distinct causes spec.md §7 tells
    // apart by re-checking the hypervisor's own view of the VM after the
    // fact: the agent/hypervisor is unreachable at all ("VM lost" — requeue
    // without charging a retry, quarantine the VM); the VM answers but
    // reports itself powered off ("test-caused VM shutdown" — the workload
    // took the guest down, so it counts as one test failure, not a bot
    // error); or the VM is still up and reachable, meaning the failure was
    // in the transport/agent layer itself (retry-eligible `boterror`).
    enum Classification {
        Classified(TaskStatus, u32),
        TransientRetryable,
        VmLost,
        TestCausedShutdown,
        NonRetryableBotError,
    }

    let timed_out = matches!(outcome, Ok(ExecutionOutcome::TimedOut));
    let classification = match &outcome {
        Ok(ExecutionOutcome::Classified { log_outcome, test_failures }) => {
            Classification::Classified(status_for_log_outcome(*log_outcome, step.kind), *test_failures)
        }
        Ok(ExecutionOutcome::TimedOut) => {
            // Deadline exceeded (spec.md §4.3 "retry policy", §7 "deadline
            // exceeded"): a build never produces a usable binary past its
            // own timeout, so it is non-retryable `badbuild`; any other
            // Step is charged one failure and left `completed` since the
            // fleet still produced a result, just a timed-out one.
            reporter.report(Event::Message {
                severity: Severity::Warning,
                text: format!("job={job_id} step={step_no} task={task_id} vm={vm_name}: timed out waiting for the workload to exit"),
            });
            if step.kind.has_build_result_line() {
                Classification::Classified(TaskStatus::BadBuild, 0)
            } else {
                Classification::Classified(TaskStatus::Completed, 1)
            }
        }
        Err(err) => {
            log::error!("job={job_id} step={step_no} task={task_id} vm={vm_name} error: {err}");
            match driver.is_powered_on(&vm_name) {
                Ok(crate::vmdriver::PowerState::On) => Classification::TransientRetryable,
                // Only a test workload can crash its own host; a build or
                // reconfig Step runs no guest test, so the VM being
                // powered off there is a bot-side error, not a test
                // result (spec.md §4.3/§7: "if the step had a chance to
                // crash the host ... otherwise boterror non-retryable").
                Ok(crate::vmdriver::PowerState::Off) => {
                    if matches!(step.kind, StepKind::Suite | StepKind::Single) {
                        Classification::TestCausedShutdown
                    } else {
                        Classification::NonRetryableBotError
                    }
                }
                Ok(crate::vmdriver::PowerState::Unknown) | Err(_) => Classification::VmLost,
            }
        }
    };

    // `nolog:` (spec.md §4.4) is its own retry-eligible `boterror`, same
    // ladder as a transient transport failure.
    let retry_boterror = |store: &dyn RecordStore, reporter: &mut dyn Reporter| -> Result<()> {
        let retries = store.record_task_failure(task_id)?;
        if retries < config.max_task_tries {
            store.set_task_status(task_id, TaskStatus::Queued)?;
            store.set_task_vm(task_id, None)?;
            reporter.report(Event::TaskRequeued { job: job_id, step: step_no, task: task_id, attempt: retries });
        } else {
            store.set_task_status(task_id, TaskStatus::BotError)?;
            reporter.report(Event::TaskClassified { job: job_id, step: step_no, task: task_id, status: "boterror" });
        }
        Ok(())
    };

    match classification {
        Classification::Classified(TaskStatus::BotError, _) | Classification::TransientRetryable => {
            retry_boterror(store, reporter)?;
        }
        Classification::Classified(new_status, test_failures) => {
            store.set_task_status(task_id, new_status)?;
            store.set_task_test_failures(task_id, test_failures)?;
            reporter.report(Event::TaskClassified { job: job_id, step: step_no, task: task_id, status: new_status.as_str() });
            if !timed_out && new_status == TaskStatus::Completed && step.kind == StepKind::Suite {
                if let Err(err) = link_latest_artifacts(config, &vm_name, job_id, &task_dir) {
                    log::warn!("job={job_id} step={step_no} task={task_id} vm={vm_name}: failed to link latest artifacts: {err}");
                }
            }
        }
        Classification::TestCausedShutdown => {
            // spec.md §7 "test-caused VM shutdown": charge one test
            // failure and mark completed; no retry attempt consumed.
            store.set_task_status(task_id, TaskStatus::Completed)?;
            store.set_task_test_failures(task_id, 1)?;
            reporter.report(Event::TaskClassified { job: job_id, step: step_no, task: task_id, status: "completed" });
        }
        Classification::NonRetryableBotError => {
            // spec.md §7: the VM went dark on a build/reconfig Step,
            // which has no test workload that could have caused it; not
            // retry-eligible.
            store.set_task_status(task_id, TaskStatus::BotError)?;
            reporter.report(Event::TaskClassified { job: job_id, step: step_no, task: task_id, status: "boterror" });
        }
        Classification::VmLost => {
            // spec.md §7 "VM lost": requeue without charging a retry and
            // quarantine the VM; the bin entry point sends the operator
            // notification once it observes the VM landed on `offline`.
            store.set_task_status(task_id, TaskStatus::Queued)?;
            store.set_task_vm(task_id, None)?;
            let _ = store.cas_vm_status(&vm_name, VmStatus::Running, VmStatus::Offline);
            store.record_vm_error(&vm_name)?;
            reporter.report(Event::Message {
                severity: Severity::Error,
                text: format!("job={job_id} step={step_no} task={task_id} vm={vm_name}: host unreachable, task requeued without charging a retry"),
            });
        }
    }
    store.set_task_times(task_id, None, Some(now_unix()))?;

    if let Some(message) = failure_message {
        reporter.report(Event::Message {
            severity: Severity::Warning,
            text: format!("job={job_id} step={step_no} task={task_id}: {message}"),
        });
    }
    Ok(())
}

/// What running one task on the guest produced: either a log/report pair
/// ready for classification, or a bare "the workload never exited within
/// its Timeout" signal (spec.md §4.3, §7 "deadline exceeded" — handled
/// distinctly from `nolog:` in `Task.log`, which means the log itself was
/// lost, not that the wait timed out).
enum ExecutionOutcome {
    Classified { log_outcome: LogOutcome, test_failures: u32 },
    TimedOut,
}

fn execute(
    config: &Config,
    dialer: &dyn AgentDialer,
    driver: &dyn VmDriver,
    vm_name: &str,
    job: &Job,
    step: &Step,
    task: &Task,
    task_dir: &std::path::Path,
) -> Result<ExecutionOutcome> {
    let mut channel = dialer.dial(vm_name)?;
    channel.set_connect_timeout(config.wait_for_tools_in_vm_secs);
    channel.set_time(now_unix() as u64)?;

    if let Some(file_name) = &step.file_name {
        let local_path = input_file_path(config, job, step, file_name);
        let remote_path = format!("{REMOTE_WORK_DIR}\\{file_name}");
        channel.send_file(&local_path, &remote_path, 0o644)?;
    }

    if step.kind == StepKind::Single {
        let launcher = match step.file_type {
            FileType::Exe64 => config.single_test_launcher_64.as_ref(),
            _ => config.single_test_launcher_32.as_ref(),
        };
        if let Some(launcher_path) = launcher {
            channel.send_file(launcher_path, GUEST_LAUNCHER_PATH, 0o755)?;
        }
    }

    let driver_script = build_driver_script(step, task);
    channel.send_file_from_string(&driver_script, GUEST_DRIVER_PATH, 0o755)?;

    let argv = build_argv(step, task);
    let pid = channel.run(&argv)?;
    let wait_result = channel.wait(
        pid,
        Duration::from_secs(task.timeout_secs),
        Duration::from_secs(30),
    )?;

    let log_contents = match channel.get_file(GUEST_LOG_PATH, &task_dir.join("log")) {
        Ok(()) => fs::read_to_string(task_dir.join("log")).unwrap_or_default(),
        Err(_) => String::new(),
    };

    let _ = channel.get_file(GUEST_ERR_PATH, &task_dir.join("err"));

    let report_path = task_dir.join(format!("{}.report", job.id));
    let report_contents = if step.report_successful_tests || matches!(step.kind, StepKind::Suite | StepKind::Single) {
        match channel.get_file(GUEST_REPORT_PATH, &report_path) {
            Ok(()) => fs::read_to_string(&report_path).ok(),
            Err(_) => None,
        }
    } else {
        None
    };

    // Captured unconditionally, timeout or not, before the channel tears
    // down (spec.md §4.3 step 6).
    capture_screenshot(driver, vm_name, task_dir);

    if wait_result.is_none() {
        let _ = channel.disconnect();
        return Ok(ExecutionOutcome::TimedOut);
    }

    let log_outcome = if log_contents.is_empty() {
        LogOutcome::NoLog
    } else {
        classify::classify_task_log(step.kind, &log_contents)
    };

    let test_failures = report_contents
        .map(|contents| {
            let size = contents.len() as u64;
            classify::parse_report(&contents, size, config.report_file_size_limit).total_failures()
        })
        .unwrap_or(0);

    let _ = channel.disconnect();
    Ok(ExecutionOutcome::Classified { log_outcome, test_failures })
}

fn capture_screenshot(driver: &dyn VmDriver, vm_name: &str, task_dir: &std::path::Path) {
    match driver.capture_screen_image(vm_name) {
        Ok(bytes) => {
            if let Err(err) = fs::write(task_dir.join("screenshot.png"), bytes) {
                log::warn!("vm={vm_name} failed to persist captured screenshot: {err}");
            }
        }
        Err(err) => log::warn!("vm={vm_name} failed to capture screenshot: {err}"),
    }
}

/// Link a completed suite Step's `*.report`/`err` into the per-VM "latest"
/// directory for the notifier, removing any prior links for this VM first
/// (spec.md §4.3 "Artifact rules").
fn link_latest_artifacts(config: &Config, vm_name: &str, job_id: i64, task_dir: &std::path::Path) -> Result<()> {
    let latest = config.latest_dir();
    fs::create_dir_all(&latest).map_err(|source| Error::CreateDir { path: latest.clone(), source })?;

    for existing in fs::read_dir(&latest).into_iter().flatten().flatten() {
        let name = existing.file_name().to_string_lossy().into_owned();
        if name.starts_with(&format!("{vm_name}_")) {
            let _ = fs::remove_file(existing.path());
        }
    }

    let report_src = task_dir.join(format!("{job_id}.report"));
    if let Ok(metadata) = fs::metadata(&report_src) {
        if metadata.len() > 0 {
            let dest = latest.join(format!("{vm_name}_{job_id}.report"));
            link_or_copy(&report_src, &dest);
        }
    }
    let err_src = task_dir.join("err");
    if err_src.exists() {
        let dest = latest.join(format!("{vm_name}_{job_id}.err"));
        link_or_copy(&err_src, &dest);
    }
    Ok(())
}

fn link_or_copy(src: &std::path::Path, dest: &std::path::Path) {
    if fs::hard_link(src, dest).is_err() {
        let _ = fs::copy(src, dest);
    }
}

fn input_file_path(config: &Config, job: &Job, step: &Step, file_name: &str) -> std::path::PathBuf {
    if step.in_staging {
        config.staging_dir().join(file_name)
    } else {
        config
            .jobs_dir()
            .join(job.id.to_string())
            .join(step.no.to_string())
            .join(file_name)
    }
}

/// Generate the per-task driver script (spec.md §4.3 step 3). It sets up
/// the working directory and invokes the uploaded file (or, for a
/// single-test Step, the uploaded launcher stub) with redirected log,
/// report and error paths, replacing the in-guest `runtask.exe` dispatch
/// the original system relied on with a script built fresh per task.
fn build_driver_script(step: &Step, task: &Task) -> String {
    let mut lines = vec![
        "@echo off".to_string(),
        format!("cd /d {REMOTE_WORK_DIR}"),
    ];
    if matches!(step.kind, StepKind::Suite | StepKind::Single) {
        lines.push(format!("set WINETEST_REPORT={GUEST_REPORT_PATH}"));
    }
    let command = match step.kind {
        StepKind::Single => GUEST_LAUNCHER_PATH.to_string(),
        _ => step
            .file_name
            .as_ref()
            .map(|name| format!("{REMOTE_WORK_DIR}\\{name}"))
            .unwrap_or_default(),
    };
    let mut invocation = format!("\"{command}\"");
    if step.kind == StepKind::Single {
        if let Some(file_name) = &step.file_name {
            invocation.push_str(&format!(" \"{REMOTE_WORK_DIR}\\{file_name}\""));
        }
    }
    if let Some(arg) = &task.cmd_line_arg {
        invocation.push_str(&format!(" {arg}"));
    }
    invocation.push_str(&format!(" > \"{GUEST_LOG_PATH}\" 2> \"{GUEST_ERR_PATH}\""));
    lines.push(invocation);
    lines.push(String::new());
    lines.join("\r\n")
}

fn build_argv(_step: &Step, _task: &Task) -> Vec<String> {
    vec!["cmd.exe".to_string(), "/c".to_string(), GUEST_DRIVER_PATH.to_string()]
}

fn status_for_log_outcome(outcome: LogOutcome, kind: StepKind) -> TaskStatus {
    match outcome {
        LogOutcome::Completed => TaskStatus::Completed,
        LogOutcome::BadPatch => TaskStatus::BadPatch,
        LogOutcome::BadBuild => TaskStatus::BadBuild,
        LogOutcome::NoLog => TaskStatus::BotError,
        LogOutcome::LeavePrior => {
            if kind.has_build_result_line() {
                TaskStatus::BadBuild
            } else {
                TaskStatus::Completed
            }
        }
    }
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}
