use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmType {
    Build,
    Win32,
    Win64,
    Wine,
}

impl VmType {
    pub fn as_str(self) -> &'static str {
        match self {
            VmType::Build => "build",
            VmType::Win32 => "win32",
            VmType::Win64 => "win64",
            VmType::Wine => "wine",
        }
    }

    pub fn parse(value: &str) -> Option<VmType> {
        Some(match value {
            "build" => VmType::Build,
            "win32" => VmType::Win32,
            "win64" => VmType::Win64,
            "wine" => VmType::Wine,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmRole {
    Base,
    Winetest,
    Retired,
    Deleted,
    Extra,
}

impl VmRole {
    pub fn as_str(self) -> &'static str {
        match self {
            VmRole::Base => "base",
            VmRole::Winetest => "winetest",
            VmRole::Retired => "retired",
            VmRole::Deleted => "deleted",
            VmRole::Extra => "extra",
        }
    }

    pub fn parse(value: &str) -> Option<VmRole> {
        Some(match value {
            "base" => VmRole::Base,
            "winetest" => VmRole::Winetest,
            "retired" => VmRole::Retired,
            "deleted" => VmRole::Deleted,
            "extra" => VmRole::Extra,
            _ => return None,
        })
    }
}

/// VM lifecycle state (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmStatus {
    Dirty,
    Reverting,
    Sleeping,
    Idle,
    Running,
    Off,
    Offline,
    Maintenance,
}

impl VmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VmStatus::Dirty => "dirty",
            VmStatus::Reverting => "reverting",
            VmStatus::Sleeping => "sleeping",
            VmStatus::Idle => "idle",
            VmStatus::Running => "running",
            VmStatus::Off => "off",
            VmStatus::Offline => "offline",
            VmStatus::Maintenance => "maintenance",
        }
    }

    pub fn parse(value: &str) -> Option<VmStatus> {
        Some(match value {
            "dirty" => VmStatus::Dirty,
            "reverting" => VmStatus::Reverting,
            "sleeping" => VmStatus::Sleeping,
            "idle" => VmStatus::Idle,
            "running" => VmStatus::Running,
            "off" => VmStatus::Off,
            "offline" => VmStatus::Offline,
            "maintenance" => VmStatus::Maintenance,
            _ => return None,
        })
    }

    /// Is `to` a legal transition from `self` under the graph in spec.md
    /// §4.2? Admin overrides to/from `Maintenance` are legal from any state
    /// and are not gated here (the core never performs them itself).
    pub fn can_transition_to(self, to: VmStatus) -> bool {
        use VmStatus::*;
        if to == Maintenance {
            return true;
        }
        matches!(
            (self, to),
            (Dirty, Idle)
                | (Dirty, Off)
                | (Idle, Reverting)
                | (Reverting, Sleeping)
                | (Reverting, Offline)
                | (Sleeping, Idle)
                | (Idle, Running)
                | (Off, Running)
                | (Running, Dirty)
                | (Running, Offline)
                | (Off, Off)
                | (Offline, Off)
                | (Maintenance, Idle)
                | (Maintenance, Off)
                | (Maintenance, Dirty)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmState {
    pub name: String,
    pub vm_type: VmType,
    pub role: VmRole,
    pub sort_order: i64,
    pub idle_snapshot: String,
    pub status: VmStatus,
    pub child_pid: Option<i32>,
    pub child_deadline: Option<i64>,
    pub errors: u32,
    pub description: String,
    pub details: String,
}

impl VmState {
    /// Compatibility rule for matching a Step's VM requirement to a VM
    /// (spec.md §4.1 step 5).
    pub fn compatible_with(&self, kind: super::StepKind, is_64bit_suite: bool) -> bool {
        if self.role == VmRole::Retired || self.role == VmRole::Deleted {
            return false;
        }
        match kind {
            super::StepKind::Build | super::StepKind::Reconfig => {
                self.vm_type == VmType::Build && self.role == VmRole::Base
            }
            super::StepKind::Suite | super::StepKind::Single => {
                let type_ok = if is_64bit_suite {
                    self.vm_type == VmType::Win64
                } else {
                    matches!(self.vm_type, VmType::Win32 | VmType::Win64)
                };
                type_ok && matches!(self.role, VmRole::Base | VmRole::Winetest)
            }
        }
    }
}

/// A VM's static project-file definition (host capacity, snapshot name,
/// etc.), distinct from its mutable runtime `VmState` row.
#[derive(Debug, Clone, Deserialize)]
pub struct VmDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub vm_type: String,
    pub role: String,
    pub idle_snapshot: String,
    #[serde(default)]
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_success_path_is_legal() {
        assert!(VmStatus::Idle.can_transition_to(VmStatus::Reverting));
        assert!(VmStatus::Reverting.can_transition_to(VmStatus::Sleeping));
        assert!(VmStatus::Sleeping.can_transition_to(VmStatus::Idle));
    }

    #[test]
    fn illegal_jump_is_rejected() {
        assert!(VmStatus::Idle.can_transition_to(VmStatus::Running));
        assert!(!VmStatus::Dirty.can_transition_to(VmStatus::Running));
    }

    #[test]
    fn maintenance_reachable_from_anywhere() {
        for state in [
            VmStatus::Dirty,
            VmStatus::Reverting,
            VmStatus::Sleeping,
            VmStatus::Idle,
            VmStatus::Running,
            VmStatus::Off,
            VmStatus::Offline,
        ] {
            assert!(state.can_transition_to(VmStatus::Maintenance));
        }
    }
}
