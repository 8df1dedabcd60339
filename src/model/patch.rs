#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub id: i64,
    pub msgid: String,
    pub received: i64,
    pub disposition: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingPatchPart {
    pub index: u32,
    pub patch_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingPatchSet {
    pub msgid: String,
    pub received: i64,
    pub parts: Vec<PendingPatchPart>,
}

impl PendingPatchSet {
    pub fn most_recent_part_age_secs(&self, now: i64) -> i64 {
        now - self.received
    }
}
