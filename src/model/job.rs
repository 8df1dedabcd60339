#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: i64,
    pub priority: u8,
    pub remarks: String,
    pub user: String,
    pub patch_id: Option<i64>,
    pub submitted: i64,
    pub ended: Option<i64>,
    pub status: JobStatus,
    pub archived: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    BotError,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::BotError => "boterror",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<JobStatus> {
        Some(match value {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "boterror" => JobStatus::BotError,
            "canceled" => JobStatus::Canceled,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub job_id: i64,
    pub no: i64,
    pub previous_no: Option<i64>,
    pub kind: StepKind,
    pub file_type: FileType,
    pub file_name: Option<String>,
    pub in_staging: bool,
    pub debug_level: u8,
    pub report_successful_tests: bool,
}

/// Tagged-variant dispatch replacing the source's type-switch-by-string
/// (spec.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Build,
    Suite,
    Single,
    Reconfig,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Build => "build",
            StepKind::Suite => "suite",
            StepKind::Single => "single",
            StepKind::Reconfig => "reconfig",
        }
    }

    pub fn parse(value: &str) -> Option<StepKind> {
        Some(match value {
            "build" => StepKind::Build,
            "suite" => StepKind::Suite,
            "single" => StepKind::Single,
            "reconfig" => StepKind::Reconfig,
            _ => return None,
        })
    }

    /// A Step with no build-style final status line in its log (spec.md §4.4).
    pub fn has_build_result_line(self) -> bool {
        matches!(self, StepKind::Build | StepKind::Reconfig)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    None,
    Exe32,
    Exe64,
    Patch,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::None => "none",
            FileType::Exe32 => "exe32",
            FileType::Exe64 => "exe64",
            FileType::Patch => "patch",
        }
    }

    pub fn parse(value: &str) -> Option<FileType> {
        Some(match value {
            "none" => FileType::None,
            "exe32" => FileType::Exe32,
            "exe64" => FileType::Exe64,
            "patch" => FileType::Patch,
            _ => return None,
        })
    }
}
