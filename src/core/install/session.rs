use super::status::InstallStatus;
use crate::core::{cancel::CancellationToken, error::InstallError, logging::LogOnError};
use serde::Serialize;
use std::{
    fmt,
    fs::File,
    io::{self, Read},
    path::Path,
    sync::{mpsc, Arc},
};

/// Opaque handle the platform installer assigns to a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionParams {
    pub package_id: String,
    pub total_bytes: u64,
}

/// Asynchronous answer to a commit.
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    pub session: SessionId,
    pub status: InstallStatus,
    /// Platform-supplied detail, if any.
    pub message: Option<String>,
}

/// Receives completions for a committed session. May be invoked from any thread, and more than
/// once while the platform keeps answering `PENDING_USER_ACTION`.
pub struct CompletionCallback(Box<dyn Fn(Completion) + Send + Sync>);

impl CompletionCallback {
    pub fn new(callback: impl Fn(Completion) + Send + Sync + 'static) -> Self {
        Self(Box::new(callback))
    }

    /// Callback that forwards every completion into a channel.
    pub fn channel() -> (Self, mpsc::Receiver<Completion>) {
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let callback = Self::new(move |completion| {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send(completion);
            }
        });
        (callback, rx)
    }

    pub fn complete(&self, completion: Completion) {
        (self.0)(completion)
    }
}

impl fmt::Debug for CompletionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompletionCallback")
    }
}

pub trait SessionWriter: Send {
    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), InstallError>;
    fn fsync(&mut self) -> Result<(), InstallError>;
}

/// The platform's package installer. Implementations own session storage; this crate only
/// drives the create, write, commit or abandon protocol.
#[cfg_attr(test, mockall::automock)]
pub trait PlatformInstaller: Send + Sync {
    fn create_session(&self, params: &SessionParams) -> Result<SessionId, InstallError>;
    fn open_session(&self, session: SessionId) -> Result<Box<dyn SessionWriter>, InstallError>;
    fn commit(&self, session: SessionId, callback: CompletionCallback) -> Result<(), InstallError>;
    fn abandon(&self, session: SessionId) -> Result<(), InstallError>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Open,
    Committed,
    Closed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
}

/// One platform session for one signed archive.
///
/// An open session that is dropped without being committed is abandoned, so every exit path
/// releases platform resources exactly once.
pub struct InstallationSession {
    platform: Arc<dyn PlatformInstaller>,
    id: SessionId,
    package_id: String,
    bytes_written: u64,
    total_bytes: u64,
    phase: Phase,
}

impl InstallationSession {
    pub fn create(
        platform: Arc<dyn PlatformInstaller>,
        package_id: &str,
        total_bytes: u64,
    ) -> Result<Self, InstallError> {
        let params = SessionParams {
            package_id: package_id.to_string(),
            total_bytes,
        };
        let id = platform
            .create_session(&params)
            .log_on_error("Failed to create install session")?;
        log::info!("Created install session {} for {}", id, package_id);
        Ok(Self {
            platform,
            id,
            package_id: params.package_id,
            bytes_written: 0,
            total_bytes,
            phase: Phase::Open,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Copy `source` into the session in `chunk_size` pieces, then fsync.
    /// Cancellation is checked before every chunk.
    pub fn stream(
        &mut self,
        source: &mut dyn Read,
        chunk_size: usize,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<StreamOutcome, InstallError> {
        if self.phase != Phase::Open {
            return Err(InstallError::Validation(format!(
                "session {} is no longer open",
                self.id
            )));
        }
        let mut writer = self.platform.open_session(self.id)?;
        let mut buf = vec![0u8; chunk_size.max(1)];
        loop {
            if cancel.is_cancelled() {
                return Ok(StreamOutcome::Cancelled);
            }
            let n = fill(source, &mut buf)?;
            if n == 0 {
                break;
            }
            writer.write(self.bytes_written, &buf[..n])?;
            self.bytes_written += n as u64;
            log::debug!(
                "Session {}: {}/{} bytes",
                self.id,
                self.bytes_written,
                self.total_bytes
            );
            on_progress(self.bytes_written, self.total_bytes);
        }
        writer.fsync()?;
        Ok(StreamOutcome::Completed)
    }

    pub fn commit(&mut self, callback: CompletionCallback) -> Result<(), InstallError> {
        if self.phase != Phase::Open {
            return Err(InstallError::Validation(format!(
                "session {} is no longer open",
                self.id
            )));
        }
        self.platform.commit(self.id, callback)?;
        self.phase = Phase::Committed;
        log::info!("Committed install session {}", self.id);
        Ok(())
    }

    /// Stream a signed archive from disk and commit it. Completion arrives through `callback`.
    pub fn install(
        &mut self,
        archive: &Path,
        chunk_size: usize,
        cancel: &CancellationToken,
        on_progress: impl FnMut(u64, u64),
        callback: CompletionCallback,
    ) -> Result<StreamOutcome, InstallError> {
        let mut file = File::open(archive)?;
        if self.stream(&mut file, chunk_size, cancel, on_progress)? == StreamOutcome::Cancelled {
            return Ok(StreamOutcome::Cancelled);
        }
        self.commit(callback)?;
        Ok(StreamOutcome::Completed)
    }

    /// Release the session. Returns `false` if it was already released.
    pub fn abandon(&mut self) -> Result<bool, InstallError> {
        if self.phase == Phase::Closed {
            return Ok(false);
        }
        self.phase = Phase::Closed;
        self.platform.abandon(self.id)?;
        log::info!("Abandoned install session {}", self.id);
        Ok(true)
    }

    /// The platform resolved the session; nothing is left to release.
    pub fn finish(&mut self) {
        self.phase = Phase::Closed;
    }
}

impl Drop for InstallationSession {
    fn drop(&mut self) {
        if self.phase == Phase::Open {
            let _ = self.abandon().log_on_error("Failed to abandon install session");
        }
    }
}

impl fmt::Debug for InstallationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationSession")
            .field("id", &self.id)
            .field("package_id", &self.package_id)
            .field("bytes_written", &self.bytes_written)
            .field("total_bytes", &self.total_bytes)
            .field("phase", &self.phase)
            .finish()
    }
}

/// Read until `buf` is full or the source is exhausted.
fn fill(source: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
