use serde::{Deserialize, Serialize};
use std::fmt;

/// Where one VM migration attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MigrationPhase {
    #[default]
    Pending,
    Validating,
    AwaitingDataCopyStart,
    CopyingBlocks,
    CopyingChangedBlocks,
    ConvertingDisk,
    AwaitingCutoverStartTime,
    AwaitingAdminCutOver,
    Succeeded,
    Failed,
    Unknown,
}

impl MigrationPhase {
    pub const ALL: [MigrationPhase; 11] = [
        MigrationPhase::Pending,
        MigrationPhase::Validating,
        MigrationPhase::AwaitingDataCopyStart,
        MigrationPhase::CopyingBlocks,
        MigrationPhase::CopyingChangedBlocks,
        MigrationPhase::ConvertingDisk,
        MigrationPhase::AwaitingCutoverStartTime,
        MigrationPhase::AwaitingAdminCutOver,
        MigrationPhase::Succeeded,
        MigrationPhase::Failed,
        MigrationPhase::Unknown,
    ];

    /// Position along the happy path. `Failed` and `Unknown` sit outside it.
    fn rank(self) -> Option<u8> {
        match self {
            MigrationPhase::Pending => Some(0),
            MigrationPhase::Validating => Some(1),
            MigrationPhase::AwaitingDataCopyStart => Some(2),
            MigrationPhase::CopyingBlocks => Some(3),
            MigrationPhase::CopyingChangedBlocks => Some(4),
            MigrationPhase::ConvertingDisk => Some(5),
            MigrationPhase::AwaitingCutoverStartTime => Some(6),
            MigrationPhase::AwaitingAdminCutOver => Some(7),
            MigrationPhase::Succeeded => Some(8),
            MigrationPhase::Failed | MigrationPhase::Unknown => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationPhase::Succeeded | MigrationPhase::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Forward-only, except that `CopyingChangedBlocks` may repeat and any
    /// non-terminal phase may fail.
    pub fn can_transition_to(self, next: MigrationPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == MigrationPhase::Failed {
            return true;
        }
        if self == MigrationPhase::CopyingChangedBlocks && next == self {
            return true;
        }
        match (self.rank(), next.rank()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationPhase::Pending => "Pending",
            MigrationPhase::Validating => "Validating",
            MigrationPhase::AwaitingDataCopyStart => "AwaitingDataCopyStart",
            MigrationPhase::CopyingBlocks => "CopyingBlocks",
            MigrationPhase::CopyingChangedBlocks => "CopyingChangedBlocks",
            MigrationPhase::ConvertingDisk => "ConvertingDisk",
            MigrationPhase::AwaitingCutoverStartTime => "AwaitingCutoverStartTime",
            MigrationPhase::AwaitingAdminCutOver => "AwaitingAdminCutOver",
            MigrationPhase::Succeeded => "Succeeded",
            MigrationPhase::Failed => "Failed",
            MigrationPhase::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
