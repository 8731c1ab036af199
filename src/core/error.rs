use crate::core::install::status::InstallStatus;
use serde::{Deserialize, Serialize};
use std::{fmt, io, time::Duration};
use thiserror::Error;

/// Failures raised while reading, rewriting, signing or verifying an archive.
#[derive(Debug, Error)]
pub enum SigningError {
    /// Reading or writing a file failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The container could not be opened, is empty, or holds malformed entries
    #[error("invalid archive: {0}")]
    ArchiveFormat(String),

    /// Key generation, key persistence, digesting or signing failed
    #[error("cryptographic failure: {0}")]
    Crypto(String),

    /// A signed archive does not match its own manifest or signature
    #[error("verification failed: {0}")]
    Verification(String),

    /// The caller asked the operation to stop
    #[error("operation cancelled")]
    Cancelled,
}

impl From<zip::result::ZipError> for SigningError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(err) => SigningError::Io(err),
            other => SigningError::ArchiveFormat(other.to_string()),
        }
    }
}

impl From<rsa::errors::Error> for SigningError {
    fn from(err: rsa::errors::Error) -> Self {
        SigningError::Crypto(err.to_string())
    }
}

/// Failures that end an installation attempt in `FAILED`, or reject it before it starts.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid archive: {0}")]
    ArchiveFormat(String),

    #[error("cryptographic failure: {0}")]
    Crypto(String),

    /// Identity mismatch, unreadable input, or a payload that cannot be installed
    #[error("validation failed: {0}")]
    Validation(String),

    /// The platform installer resolved the session with a failure code
    #[error("installer reported {0}")]
    InstallerSubsystem(InstallStatus),

    /// Another attempt for the same package is still in flight
    #[error("an installation of `{0}` is already in progress")]
    Conflict(String),

    /// The platform installer never reported completion
    #[error("installer did not report completion within {0:?}")]
    Timeout(Duration),
}

impl From<SigningError> for InstallError {
    fn from(err: SigningError) -> Self {
        match err {
            SigningError::Io(err) => InstallError::Io(err),
            SigningError::ArchiveFormat(reason) => InstallError::ArchiveFormat(reason),
            SigningError::Crypto(reason) => InstallError::Crypto(reason),
            SigningError::Verification(reason) => InstallError::Validation(reason),
            // Callers check for cancellation before converting; this arm only keeps the match total.
            SigningError::Cancelled => InstallError::Validation("operation cancelled".to_string()),
        }
    }
}

/// Stable, machine-readable error codes carried by a `FAILED` progress update.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    IoError,
    ArchiveFormatError,
    CryptoError,
    ValidationError,
    InstallerError,
    ConflictError,
    TimeoutError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::ArchiveFormatError => "ARCHIVE_FORMAT_ERROR",
            ErrorCode::CryptoError => "CRYPTO_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::InstallerError => "INSTALLER_ERROR",
            ErrorCode::ConflictError => "CONFLICT_ERROR",
            ErrorCode::TimeoutError => "TIMEOUT_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl InstallError {
    pub fn code(&self) -> ErrorCode {
        match self {
            InstallError::Io(_) => ErrorCode::IoError,
            InstallError::ArchiveFormat(_) => ErrorCode::ArchiveFormatError,
            InstallError::Crypto(_) => ErrorCode::CryptoError,
            InstallError::Validation(_) => ErrorCode::ValidationError,
            InstallError::InstallerSubsystem(_) => ErrorCode::InstallerError,
            InstallError::Conflict(_) => ErrorCode::ConflictError,
            InstallError::Timeout(_) => ErrorCode::TimeoutError,
        }
    }

    /// Text that is safe to show to a user. Never includes paths or lower-level error detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            InstallError::Io(_) => "Could not read or write the package file",
            InstallError::ArchiveFormat(_) => "The package file is damaged or not a valid APK",
            InstallError::Crypto(_) => "Failed to sign the package",
            InstallError::Validation(_) => "Package validation failed",
            InstallError::InstallerSubsystem(status) => status.message(),
            InstallError::Conflict(_) => "An installation of this package is already in progress",
            InstallError::Timeout(_) => "Installation timed out",
        }
    }
}
