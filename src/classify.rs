//! Task-log classification and report dissection (spec.md §4.4).

use crate::model::StepKind;

/// Result of parsing a `Task.log`'s final status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    Completed,
    BadPatch,
    /// `nolog:<msg>`: the log was lost, retryable.
    NoLog,
    BadBuild,
    /// No final line, and the Step has no build-style result line (a
    /// suite): the caller should leave whatever classification a prior
    /// transport error produced in place.
    LeavePrior,
}

/// Parse the final status line of a `Task.log`.
pub fn classify_task_log(kind: StepKind, log: &str) -> LogOutcome {
    let last_line = log.lines().rev().find(|line| !line.trim().is_empty());
    match last_line {
        Some(line) if line.trim() == "ok" => LogOutcome::Completed,
        Some(line) if line.trim() == "badpatch" => LogOutcome::BadPatch,
        Some(line) if line.trim().starts_with("nolog:") => LogOutcome::NoLog,
        _ => {
            if kind.has_build_result_line() {
                LogOutcome::BadBuild
            } else {
                LogOutcome::LeavePrior
            }
        }
    }
}

/// Outcome of one `<unit>:<test> start` ... `done (<rc>)` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestBlock {
    pub unit: String,
    pub test: String,
    pub failures: u32,
    pub todos: u32,
    pub skipped: u32,
    pub total: u32,
    pub crashed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportSummary {
    pub blocks: Vec<TestBlock>,
    pub timed_out: bool,
    pub truncated: bool,
}

impl ReportSummary {
    pub fn total_failures(&self) -> u32 {
        self.blocks.iter().map(|b| b.failures).sum::<u32>()
            + self.blocks.iter().filter(|b| b.crashed).count() as u32
            + if self.timed_out { 1 } else { 0 }
            + if self.truncated { 1 } else { 0 }
    }
}

const START_MARKER: &str = " start";
const DONE_PREFIX: &str = " done (";
const TIMEOUT_MARKER: &str = "Timeout!";

/// Parse a `*.report` file. Crashes without a matching `done` line are
/// recorded as `failed crash`; a report whose size reached
/// `report_file_size_limit` is flagged `failed filelimit` without being
/// parsed further (the trailing block is necessarily incomplete).
pub fn parse_report(contents: &str, file_size: u64, file_size_limit: u64) -> ReportSummary {
    let mut summary = ReportSummary::default();
    if file_size >= file_size_limit {
        summary.truncated = true;
    }
    if contents.contains(TIMEOUT_MARKER) {
        summary.timed_out = true;
    }

    let mut open_block: Option<(String, String)> = None;
    let mut failures = 0u32;
    let mut todos = 0u32;
    let mut skipped = 0u32;
    let mut total = 0u32;

    for line in contents.lines() {
        if let Some(idx) = line.find(START_MARKER) {
            if let Some((unit, test)) = open_block.take() {
                summary.blocks.push(TestBlock {
                    unit,
                    test,
                    failures,
                    todos,
                    skipped,
                    total,
                    crashed: true,
                });
            }
            let header = &line[..idx];
            if let Some((unit, test)) = header.split_once(':') {
                open_block = Some((unit.to_string(), test.to_string()));
            }
            failures = 0;
            todos = 0;
            skipped = 0;
            total = 0;
            continue;
        }

        if let Some(idx) = line.find(DONE_PREFIX) {
            let header = &line[..idx];
            let is_matching_block = open_block
                .as_ref()
                .map(|(unit, test)| header == format!("{unit}:{test}"))
                .unwrap_or(false);
            if is_matching_block {
                let (unit, test) = open_block.take().unwrap();
                summary.blocks.push(TestBlock {
                    unit,
                    test,
                    failures,
                    todos,
                    skipped,
                    total,
                    crashed: false,
                });
            }
            continue;
        }

        if open_block.is_some() {
            total += 1;
            if line.contains("Test failed") || line.contains(": Test failed") {
                failures += 1;
            } else if line.contains(": Test succeeded inside todo block") {
                todos += 1;
            } else if line.contains(": skipped") {
                skipped += 1;
            }
        }
    }

    if let Some((unit, test)) = open_block.take() {
        summary.blocks.push(TestBlock {
            unit,
            test,
            failures,
            todos,
            skipped,
            total,
            crashed: true,
        });
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_line_wins_over_everything_else() {
        assert_eq!(classify_task_log(StepKind::Build, "line1\nline2\nok\n"), LogOutcome::Completed);
    }

    #[test]
    fn badpatch_is_recognized() {
        assert_eq!(classify_task_log(StepKind::Build, "applying...\nbadpatch\n"), LogOutcome::BadPatch);
    }

    #[test]
    fn nolog_is_retryable() {
        assert_eq!(
            classify_task_log(StepKind::Build, "nolog:connection reset\n"),
            LogOutcome::NoLog
        );
    }

    #[test]
    fn missing_line_on_build_step_is_badbuild() {
        assert_eq!(classify_task_log(StepKind::Build, "partial output\n"), LogOutcome::BadBuild);
    }

    #[test]
    fn missing_line_on_suite_step_leaves_prior_classification() {
        assert_eq!(classify_task_log(StepKind::Suite, "partial output\n"), LogOutcome::LeavePrior);
    }

    #[test]
    fn report_counts_pass_fail_and_crash() {
        let report = "\
user32:edit start
ok\nTest failed: garbage
user32:edit done (0)
user32:button start
";
        let summary = parse_report(report, 100, 10_000_000);
        assert_eq!(summary.blocks.len(), 2);
        assert_eq!(summary.blocks[0].failures, 1);
        assert!(!summary.blocks[0].crashed);
        assert!(summary.blocks[1].crashed);
    }

    #[test]
    fn oversized_report_is_flagged_truncated() {
        let summary = parse_report("user32:edit start\n", 11_000_000, 10_000_000);
        assert!(summary.truncated);
        assert_eq!(summary.total_failures(), 1);
    }

    #[test]
    fn timeout_marker_is_detected() {
        let summary = parse_report("user32:edit start\nTimeout!\n", 10, 10_000_000);
        assert!(summary.timed_out);
    }
}
