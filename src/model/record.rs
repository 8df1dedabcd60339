#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Engine,
    Tasks,
    VmResult,
    VmStatus,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Engine => "engine",
            RecordKind::Tasks => "tasks",
            RecordKind::VmResult => "vmresult",
            RecordKind::VmStatus => "vmstatus",
        }
    }

    pub fn parse(value: &str) -> Option<RecordKind> {
        Some(match value {
            "engine" => RecordKind::Engine,
            "tasks" => RecordKind::Tasks,
            "vmresult" => RecordKind::VmResult,
            "vmstatus" => RecordKind::VmStatus,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: RecordKind,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordGroup {
    pub id: i64,
    pub timestamp: i64,
    pub records: Vec<Record>,
}
