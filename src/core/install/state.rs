use super::status::InstallStatus;
use crate::core::error::{ErrorCode, InstallError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const MSG_PREPARING: &str = "Preparing installation...";
pub const MSG_SIGNING: &str = "Signing APK...";
pub const MSG_INSTALLING: &str = "Installing APK...";
pub const MSG_FINALIZING: &str = "Finalizing installation...";
pub const MSG_CANCELLED: &str = "Installation cancelled";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallationState {
    NotStarted,
    Preparing,
    Signing,
    Installing,
    Installed,
    Failed,
    Cancelled,
}

impl InstallationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstallationState::Installed | InstallationState::Failed | InstallationState::Cancelled
        )
    }

    /// An attempt in one of these states owns the package and can still be cancelled.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InstallationState::Preparing | InstallationState::Signing | InstallationState::Installing
        )
    }

    pub fn can_transition_to(&self, next: InstallationState) -> bool {
        use InstallationState::*;
        match (self, next) {
            (NotStarted, Preparing) => true,
            (Preparing, Signing) => true,
            (Signing, Installing) => true,
            (Installing, Installed) => true,
            (from, Failed | Cancelled) => from.is_active(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallationState::NotStarted => "NOT_STARTED",
            InstallationState::Preparing => "PREPARING",
            InstallationState::Signing => "SIGNING",
            InstallationState::Installing => "INSTALLING",
            InstallationState::Installed => "INSTALLED",
            InstallationState::Failed => "FAILED",
            InstallationState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for InstallationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one package's installation, as published to observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallationProgress {
    pub package_id: String,
    pub attempt: u64,
    pub state: InstallationState,
    /// Percentage in `0..=100`.
    pub progress: u8,
    pub message: String,
    /// Technical detail, only set in `FAILED`.
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub timestamp: DateTime<Utc>,
}

/// Final outcome of one attempt. Exactly one is produced per attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallationResult {
    pub package_id: String,
    pub attempt: u64,
    pub success: bool,
    pub state: InstallationState,
    pub message: String,
    pub error_code: Option<ErrorCode>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cannot move from {from} to {to}")]
pub struct TransitionError {
    pub from: InstallationState,
    pub to: InstallationState,
}

/// What a platform completion did to the attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    Resolved(InstallationResult),
    /// `PENDING_USER_ACTION`: still `INSTALLING`, waiting for the next completion.
    AwaitingUser(InstallationProgress),
}

/// Enforces the legal state graph and the non-decreasing progress of a single package.
///
/// `begin` may be called again once the previous attempt is terminal; that starts a new attempt
/// with progress reset to 0.
#[derive(Clone, Debug)]
pub struct InstallationStateMachine {
    current: InstallationProgress,
    result: Option<InstallationResult>,
}

impl InstallationStateMachine {
    pub fn new(package_id: impl Into<String>) -> Self {
        Self {
            current: InstallationProgress {
                package_id: package_id.into(),
                attempt: 0,
                state: InstallationState::NotStarted,
                progress: 0,
                message: String::new(),
                error: None,
                error_code: None,
                timestamp: Utc::now(),
            },
            result: None,
        }
    }

    pub fn snapshot(&self) -> &InstallationProgress {
        &self.current
    }

    pub fn state(&self) -> InstallationState {
        self.current.state
    }

    pub fn attempt(&self) -> u64 {
        self.current.attempt
    }

    /// Result of the current attempt once it is terminal.
    pub fn result(&self) -> Option<&InstallationResult> {
        self.result.as_ref()
    }

    pub fn begin(&mut self) -> Result<InstallationProgress, TransitionError> {
        let from = self.current.state;
        if from != InstallationState::NotStarted && !from.is_terminal() {
            return Err(TransitionError {
                from,
                to: InstallationState::Preparing,
            });
        }
        self.current.attempt += 1;
        self.current.state = InstallationState::Preparing;
        self.current.progress = 0;
        self.current.message = MSG_PREPARING.to_string();
        self.current.error = None;
        self.current.error_code = None;
        self.current.timestamp = Utc::now();
        self.result = None;
        Ok(self.current.clone())
    }

    /// Move to the next non-terminal state. Progress never goes backwards.
    pub fn advance(
        &mut self,
        state: InstallationState,
        progress: u8,
        message: impl Into<String>,
    ) -> Result<InstallationProgress, TransitionError> {
        let from = self.current.state;
        if state.is_terminal() || !from.can_transition_to(state) {
            return Err(TransitionError { from, to: state });
        }
        self.current.state = state;
        self.bump(progress);
        self.current.message = message.into();
        self.current.timestamp = Utc::now();
        Ok(self.current.clone())
    }

    /// Progress within the current state. `None` when nothing changed.
    pub fn report(
        &mut self,
        progress: u8,
        message: Option<&str>,
    ) -> Result<Option<InstallationProgress>, TransitionError> {
        let state = self.current.state;
        if !state.is_active() {
            return Err(TransitionError {
                from: state,
                to: state,
            });
        }
        let before = self.current.progress;
        self.bump(progress);
        let message_changed = match message {
            Some(message) if message != self.current.message => {
                self.current.message = message.to_string();
                true
            }
            _ => false,
        };
        if self.current.progress == before && !message_changed {
            return Ok(None);
        }
        self.current.timestamp = Utc::now();
        Ok(Some(self.current.clone()))
    }

    pub fn complete(&mut self) -> Result<InstallationResult, TransitionError> {
        self.check(InstallationState::Installed)?;
        self.current.progress = 100;
        Ok(self.finish(
            InstallationState::Installed,
            InstallStatus::Success.message().to_string(),
            None,
            None,
        ))
    }

    /// Progress is left where the failure happened.
    pub fn fail(
        &mut self,
        error: &InstallError,
        detail: Option<&str>,
    ) -> Result<InstallationResult, TransitionError> {
        self.check(InstallationState::Failed)?;
        let error_text = match detail {
            Some(detail) => format!("{}: {}", error, detail),
            None => error.to_string(),
        };
        Ok(self.finish(
            InstallationState::Failed,
            error.user_message().to_string(),
            Some(error_text),
            Some(error.code()),
        ))
    }

    /// `Ok(None)` when already cancelled.
    pub fn cancel(&mut self) -> Result<Option<InstallationResult>, TransitionError> {
        if self.current.state == InstallationState::Cancelled {
            return Ok(None);
        }
        self.check(InstallationState::Cancelled)?;
        Ok(Some(self.finish(
            InstallationState::Cancelled,
            MSG_CANCELLED.to_string(),
            None,
            None,
        )))
    }

    /// Apply a completion code from the platform installer.
    pub fn apply(
        &mut self,
        status: InstallStatus,
        detail: Option<&str>,
    ) -> Result<Resolution, TransitionError> {
        match status {
            InstallStatus::Success => self.complete().map(Resolution::Resolved),
            InstallStatus::PendingUserAction => {
                let from = self.current.state;
                if from != InstallationState::Installing {
                    return Err(TransitionError { from, to: from });
                }
                self.current.message = status.message().to_string();
                self.current.timestamp = Utc::now();
                Ok(Resolution::AwaitingUser(self.current.clone()))
            }
            failure => self
                .fail(&InstallError::InstallerSubsystem(failure), detail)
                .map(Resolution::Resolved),
        }
    }

    fn check(&self, to: InstallationState) -> Result<(), TransitionError> {
        let from = self.current.state;
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(TransitionError { from, to })
        }
    }

    fn bump(&mut self, progress: u8) {
        self.current.progress = self.current.progress.max(progress.min(100));
    }

    fn finish(
        &mut self,
        state: InstallationState,
        message: String,
        error: Option<String>,
        error_code: Option<ErrorCode>,
    ) -> InstallationResult {
        let now = Utc::now();
        self.current.state = state;
        self.current.message = message.clone();
        self.current.error = error;
        self.current.error_code = error_code;
        self.current.timestamp = now;
        let result = InstallationResult {
            package_id: self.current.package_id.clone(),
            attempt: self.current.attempt,
            success: state == InstallationState::Installed,
            state,
            message,
            error_code,
            timestamp: now,
        };
        self.result = Some(result.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn installing() -> InstallationStateMachine {
        let mut machine = InstallationStateMachine::new("app.example");
        machine.begin().unwrap();
        machine
            .advance(InstallationState::Signing, 10, MSG_SIGNING)
            .unwrap();
        machine
            .advance(InstallationState::Installing, 50, MSG_INSTALLING)
            .unwrap();
        machine
    }

    #[test]
    fn should_follow_the_happy_path() {
        let mut machine = installing();
        machine.report(90, Some(MSG_FINALIZING)).unwrap();
        let result = machine.complete().unwrap();
        assert!(result.success);
        assert_eq!(result.message, "Installation completed successfully");
        assert_eq!(machine.snapshot().progress, 100);
        assert_eq!(machine.state(), InstallationState::Installed);
    }

    #[test]
    fn should_reject_skipping_states() {
        let mut machine = InstallationStateMachine::new("app.example");
        let err = machine
            .advance(InstallationState::Installing, 50, MSG_INSTALLING)
            .unwrap_err();
        assert_eq!(err.from, InstallationState::NotStarted);
        machine.begin().unwrap();
        assert!(machine.complete().is_err());
        assert!(machine
            .advance(InstallationState::Installing, 50, MSG_INSTALLING)
            .is_err());
    }

    #[test]
    fn should_never_decrease_progress() {
        let mut machine = installing();
        machine.report(70, None).unwrap();
        assert_eq!(machine.report(60, None).unwrap(), None);
        assert_eq!(machine.snapshot().progress, 70);
        assert_eq!(machine.report(200, None).unwrap().unwrap().progress, 100);
    }

    #[test]
    fn should_fail_without_forcing_progress() {
        let mut machine = installing();
        machine.report(90, Some(MSG_FINALIZING)).unwrap();
        let result = machine
            .apply(InstallStatus::FailureInvalid, Some("parse error"))
            .unwrap();
        let Resolution::Resolved(result) = result else {
            panic!("expected a terminal result");
        };
        assert!(!result.success);
        assert_eq!(result.message, "Invalid APK file");
        assert_eq!(result.error_code, Some(ErrorCode::InstallerError));
        let snapshot = machine.snapshot();
        assert_eq!(snapshot.state, InstallationState::Failed);
        assert_eq!(snapshot.progress, 90);
        assert_eq!(
            snapshot.error.as_deref(),
            Some("installer reported FAILURE_INVALID: parse error")
        );
    }

    #[test]
    fn should_stay_installing_while_waiting_for_the_user() {
        let mut machine = installing();
        let resolution = machine
            .apply(InstallStatus::PendingUserAction, None)
            .unwrap();
        assert!(matches!(resolution, Resolution::AwaitingUser(_)));
        assert_eq!(machine.state(), InstallationState::Installing);
        assert!(machine.result().is_none());
        assert!(machine.apply(InstallStatus::Success, None).is_ok());
    }

    #[test]
    fn should_cancel_once() {
        let mut machine = installing();
        let result = machine.cancel().unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.state, InstallationState::Cancelled);
        assert_eq!(machine.cancel().unwrap(), None);
        assert!(machine.complete().is_err());
        assert!(machine
            .fail(&InstallError::Timeout(Duration::from_secs(1)), None)
            .is_err());
    }

    #[test]
    fn should_not_cancel_finished_attempts() {
        let mut machine = installing();
        machine.complete().unwrap();
        assert!(machine.cancel().is_err());
        assert!(InstallationStateMachine::new("app.example").cancel().is_err());
    }

    #[test]
    fn should_restart_from_terminal_states() {
        let mut machine = installing();
        machine
            .fail(&InstallError::Validation("bad".to_string()), None)
            .unwrap();
        let progress = machine.begin().unwrap();
        assert_eq!(progress.attempt, 2);
        assert_eq!(progress.progress, 0);
        assert_eq!(progress.state, InstallationState::Preparing);
        assert!(progress.error.is_none());
        assert!(machine.result().is_none());
        assert!(machine.begin().is_err());
    }
}
