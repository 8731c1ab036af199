use serde::{Deserialize, Serialize};
use std::fmt;

/// Completion codes delivered by the platform installer for a committed session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum InstallStatus {
    Success,
    Failure,
    FailureAborted,
    FailureBlocked,
    FailureConflict,
    FailureIncompatible,
    FailureInvalid,
    FailureStorage,
    /// The platform needs the user to confirm before it resolves the session.
    PendingUserAction,
    Unknown(i32),
}

impl InstallStatus {
    pub const STATUS_PENDING_USER_ACTION: i32 = -1;
    pub const STATUS_SUCCESS: i32 = 0;
    pub const STATUS_FAILURE: i32 = 1;
    pub const STATUS_FAILURE_BLOCKED: i32 = 2;
    pub const STATUS_FAILURE_ABORTED: i32 = 3;
    pub const STATUS_FAILURE_INVALID: i32 = 4;
    pub const STATUS_FAILURE_CONFLICT: i32 = 5;
    pub const STATUS_FAILURE_STORAGE: i32 = 6;
    pub const STATUS_FAILURE_INCOMPATIBLE: i32 = 7;

    pub fn from_code(code: i32) -> Self {
        match code {
            Self::STATUS_PENDING_USER_ACTION => InstallStatus::PendingUserAction,
            Self::STATUS_SUCCESS => InstallStatus::Success,
            Self::STATUS_FAILURE => InstallStatus::Failure,
            Self::STATUS_FAILURE_BLOCKED => InstallStatus::FailureBlocked,
            Self::STATUS_FAILURE_ABORTED => InstallStatus::FailureAborted,
            Self::STATUS_FAILURE_INVALID => InstallStatus::FailureInvalid,
            Self::STATUS_FAILURE_CONFLICT => InstallStatus::FailureConflict,
            Self::STATUS_FAILURE_STORAGE => InstallStatus::FailureStorage,
            Self::STATUS_FAILURE_INCOMPATIBLE => InstallStatus::FailureIncompatible,
            other => InstallStatus::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            InstallStatus::PendingUserAction => Self::STATUS_PENDING_USER_ACTION,
            InstallStatus::Success => Self::STATUS_SUCCESS,
            InstallStatus::Failure => Self::STATUS_FAILURE,
            InstallStatus::FailureBlocked => Self::STATUS_FAILURE_BLOCKED,
            InstallStatus::FailureAborted => Self::STATUS_FAILURE_ABORTED,
            InstallStatus::FailureInvalid => Self::STATUS_FAILURE_INVALID,
            InstallStatus::FailureConflict => Self::STATUS_FAILURE_CONFLICT,
            InstallStatus::FailureStorage => Self::STATUS_FAILURE_STORAGE,
            InstallStatus::FailureIncompatible => Self::STATUS_FAILURE_INCOMPATIBLE,
            InstallStatus::Unknown(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InstallStatus::Success)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, InstallStatus::PendingUserAction)
    }

    /// User-facing text for this code.
    pub fn message(&self) -> &'static str {
        match self {
            InstallStatus::Success => "Installation completed successfully",
            InstallStatus::Failure => "Installation failed",
            InstallStatus::FailureAborted => "Installation aborted",
            InstallStatus::FailureBlocked => "Installation blocked by system",
            InstallStatus::FailureConflict => "Installation conflict",
            InstallStatus::FailureIncompatible => "Incompatible APK",
            InstallStatus::FailureInvalid => "Invalid APK file",
            InstallStatus::FailureStorage => "Insufficient storage",
            InstallStatus::PendingUserAction => "Waiting for user confirmation",
            InstallStatus::Unknown(_) => "Unknown installation status",
        }
    }
}

impl fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallStatus::Success => f.write_str("SUCCESS"),
            InstallStatus::Failure => f.write_str("FAILURE"),
            InstallStatus::FailureAborted => f.write_str("FAILURE_ABORTED"),
            InstallStatus::FailureBlocked => f.write_str("FAILURE_BLOCKED"),
            InstallStatus::FailureConflict => f.write_str("FAILURE_CONFLICT"),
            InstallStatus::FailureIncompatible => f.write_str("FAILURE_INCOMPATIBLE"),
            InstallStatus::FailureInvalid => f.write_str("FAILURE_INVALID"),
            InstallStatus::FailureStorage => f.write_str("FAILURE_STORAGE"),
            InstallStatus::PendingUserAction => f.write_str("PENDING_USER_ACTION"),
            InstallStatus::Unknown(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}
