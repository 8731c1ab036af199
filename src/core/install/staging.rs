use super::{
    session::{
        Completion, CompletionCallback, PlatformInstaller, SessionId, SessionParams, SessionWriter,
    },
    status::InstallStatus,
};
use crate::core::{error::InstallError, signing::verify};
use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    thread,
};

/// Installs into a local directory instead of a device.
///
/// Sessions are staged as `sessions/<id>.apk`. A commit verifies the staged archive on a
/// background thread and moves it to `installed/<package>.apk`.
#[derive(Debug)]
pub struct StagingInstaller {
    root: PathBuf,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, SessionParams>>,
}

impl StagingInstaller {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("sessions"))?;
        fs::create_dir_all(root.join("installed"))?;
        Ok(Self {
            root,
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn installed_path(&self, package_id: &str) -> PathBuf {
        self.root.join("installed").join(format!("{}.apk", package_id))
    }

    fn session_path(&self, session: SessionId) -> PathBuf {
        self.root.join("sessions").join(format!("{}.apk", session))
    }

    fn params(&self, session: SessionId) -> Result<SessionParams, InstallError> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session)
            .cloned()
            .ok_or_else(|| InstallError::Validation(format!("unknown session {}", session)))
    }
}

struct FileSessionWriter {
    file: File,
}

impl SessionWriter for FileSessionWriter {
    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<(), InstallError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    fn fsync(&mut self) -> Result<(), InstallError> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl PlatformInstaller for StagingInstaller {
    fn create_session(&self, params: &SessionParams) -> Result<SessionId, InstallError> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        File::create(self.session_path(id))?;
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, params.clone());
        Ok(id)
    }

    fn open_session(&self, session: SessionId) -> Result<Box<dyn SessionWriter>, InstallError> {
        self.params(session)?;
        let file = OpenOptions::new()
            .write(true)
            .open(self.session_path(session))?;
        Ok(Box::new(FileSessionWriter { file }))
    }

    fn commit(&self, session: SessionId, callback: CompletionCallback) -> Result<(), InstallError> {
        let params = self.params(session)?;
        let staged = self.session_path(session);
        let target = self.installed_path(&params.package_id);
        thread::Builder::new()
            .name(format!("staging-commit-{}", session))
            .spawn(move || {
                let (status, message) = match finalize(&staged, &target, params.total_bytes) {
                    Ok(()) => (InstallStatus::Success, None),
                    Err(failure) => failure,
                };
                callback.complete(Completion {
                    session,
                    status,
                    message,
                });
            })?;
        Ok(())
    }

    fn abandon(&self, session: SessionId) -> Result<(), InstallError> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session);
        match fs::remove_file(self.session_path(session)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn finalize(
    staged: &Path,
    target: &Path,
    expected_len: u64,
) -> Result<(), (InstallStatus, Option<String>)> {
    let len = fs::metadata(staged)
        .map_err(|err| (InstallStatus::FailureStorage, Some(err.to_string())))?
        .len();
    if len != expected_len {
        return Err((
            InstallStatus::FailureInvalid,
            Some(format!("staged {} bytes, expected {}", len, expected_len)),
        ));
    }
    if let Err(err) = verify(staged) {
        log::warn!("Rejecting {}: {}", staged.display(), err);
        return Err((InstallStatus::FailureInvalid, Some(err.to_string())));
    }
    fs::rename(staged, target)
        .map_err(|err| (InstallStatus::FailureStorage, Some(err.to_string())))?;
    log::info!("Installed {}", target.display());
    Ok(())
}
