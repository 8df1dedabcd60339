//! Structured progress events, mirroring the upstream `Reporter`/`Event`
//! split: callers that want machine-readable progress implement
//! [`Reporter`], while every binary also logs through the `log` facade for
//! the human-readable, grep-able trail spec.md §7 requires.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub enum Event {
    Message { severity: Severity, text: String },
    VmTransition { vm: String, from: &'static str, to: &'static str },
    TaskClassified { job: i64, step: i64, task: i64, status: &'static str },
    TaskRequeued { job: i64, step: i64, task: i64, attempt: u32 },
}

pub trait Reporter {
    fn report(&mut self, event: Event);
}

impl Reporter for () {
    fn report(&mut self, _event: Event) {}
}

/// Reporter that forwards every event to the `log` facade, used by the
/// CLI binaries that have no other UI to drive.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&mut self, event: Event) {
        match event {
            Event::Message { severity, text } => match severity {
                Severity::Info => log::info!("{text}"),
                Severity::Warning => log::warn!("{text}"),
                Severity::Error => log::error!("{text}"),
            },
            Event::VmTransition { vm, from, to } => {
                log::info!("vm={vm} transition {from} -> {to}");
            }
            Event::TaskClassified { job, step, task, status } => {
                log::info!("job={job} step={step} task={task} classified {status}");
            }
            Event::TaskRequeued { job, step, task, attempt } => {
                log::warn!("job={job} step={step} task={task} requeued attempt={attempt}");
            }
        }
    }
}
