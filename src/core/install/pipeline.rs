use super::{
    events::{EventBus, InstallationEvent, SubscriberId, Subscription},
    session::{Completion, CompletionCallback, InstallationSession, PlatformInstaller, StreamOutcome},
    state::{
        InstallationProgress, InstallationResult, InstallationState, InstallationStateMachine,
        Resolution, TransitionError, MSG_FINALIZING, MSG_INSTALLING, MSG_SIGNING,
    },
};
use crate::core::{
    archive::package::declared_package_id,
    cancel::CancellationToken,
    config::{InstallConfig, InstallerConfig},
    error::{InstallError, SigningError},
    logging::LogOnError,
    signing::ArchiveSigner,
};
use std::{
    collections::{HashMap, HashSet},
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

/// Signed copies in the work directory start with this.
pub const SIGNED_PREFIX: &str = "signed_";

const PREPARED: u8 = 5;
const SIGNING_START: u8 = 10;
const SIGNING_END: u8 = 50;
const STREAM_END: u8 = 90;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyCancelled,
    /// No attempt for the package, or it already finished.
    NotCancellable,
}

/// Waits for the result of one attempt.
#[derive(Debug)]
pub struct InstallationHandle {
    package_id: String,
    attempt: u64,
    outcome: Receiver<InstallationResult>,
}

impl InstallationHandle {
    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn wait(self) -> Option<InstallationResult> {
        self.outcome.recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<InstallationResult> {
        self.outcome.recv_timeout(timeout).ok()
    }
}

enum Signal {
    Completed(Completion),
    Cancelled,
}

struct Attempt {
    machine: InstallationStateMachine,
    cancel: CancellationToken,
    wake: Option<Sender<Signal>>,
    signed: Option<PathBuf>,
}

impl Attempt {
    fn new(package_id: &str) -> Self {
        Self {
            machine: InstallationStateMachine::new(package_id),
            cancel: CancellationToken::new(),
            wake: None,
            signed: None,
        }
    }
}

/// Worker-side view of one attempt.
struct Run {
    package_id: String,
    attempt: u64,
    archive: PathBuf,
    cancel: CancellationToken,
    wake: Sender<Signal>,
    signals: Receiver<Signal>,
}

enum Flow {
    Continue,
    Stop,
}

struct Inner {
    config: InstallConfig,
    signer: ArchiveSigner,
    platform: Arc<dyn PlatformInstaller>,
    attempts: Mutex<HashMap<String, Attempt>>,
    events: EventBus,
}

/// Drives `PREPARING -> SIGNING -> INSTALLING -> INSTALLED` for any number of packages, one
/// attempt per package at a time. Every attempt runs on its own worker thread.
pub struct Installer {
    inner: Arc<Inner>,
}

impl Installer {
    pub fn new(
        config: InstallConfig,
        signer: ArchiveSigner,
        platform: Arc<dyn PlatformInstaller>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                signer,
                platform,
                attempts: Mutex::new(HashMap::new()),
                events: EventBus::new(),
            }),
        }
    }

    pub fn from_config(config: &InstallerConfig, platform: Arc<dyn PlatformInstaller>) -> Self {
        Self::new(
            config.install.clone(),
            ArchiveSigner::from_config(&config.signing),
            platform,
        )
    }

    pub fn config(&self) -> &InstallConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Latest progress for `package_id`, if it was ever started.
    pub fn progress(&self, package_id: &str) -> Option<InstallationProgress> {
        self.inner
            .lock_attempts()
            .get(package_id)
            .map(|attempt| attempt.machine.snapshot().clone())
    }

    /// Start installing `archive` as `package_id`. Fails with [`InstallError::Conflict`] while
    /// another attempt for the same package is in flight; that attempt is left untouched.
    pub fn begin(
        &self,
        archive: impl AsRef<Path>,
        package_id: &str,
    ) -> Result<InstallationHandle, InstallError> {
        let (wake, signals) = mpsc::channel();
        let (outcome_tx, outcome) = mpsc::channel();
        let cancel = CancellationToken::new();

        let attempt = {
            let mut attempts = self.inner.lock_attempts();
            let entry = attempts
                .entry(package_id.to_string())
                .or_insert_with(|| Attempt::new(package_id));
            if entry.machine.state().is_active() {
                log::warn!("Refusing to start {}: already {}", package_id, entry.machine.state());
                return Err(InstallError::Conflict(package_id.to_string()));
            }
            let progress = entry
                .machine
                .begin()
                .map_err(|_| InstallError::Conflict(package_id.to_string()))?;
            entry.cancel = cancel.clone();
            entry.wake = Some(wake.clone());
            entry.signed = None;
            self.inner.events.publish(InstallationEvent::Progress(progress));
            entry.machine.attempt()
        };

        let run = Run {
            package_id: package_id.to_string(),
            attempt,
            archive: archive.as_ref().to_path_buf(),
            cancel,
            wake,
            signals,
        };
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("install-{}", package_id))
            .spawn(move || inner.run(run, outcome_tx));
        if let Err(err) = spawned {
            let err = InstallError::Io(err);
            self.inner.update(package_id, attempt, |machine| {
                let result = machine.fail(&err, None)?;
                Ok(terminal_events(machine, result))
            });
            return Err(err);
        }

        Ok(InstallationHandle {
            package_id: package_id.to_string(),
            attempt,
            outcome,
        })
    }

    pub fn cancel(&self, package_id: &str) -> CancelOutcome {
        let mut attempts = self.inner.lock_attempts();
        let Some(attempt) = attempts.get_mut(package_id) else {
            return CancelOutcome::NotCancellable;
        };
        match attempt.machine.cancel() {
            Ok(Some(result)) => {
                attempt.cancel.cancel();
                if let Some(wake) = &attempt.wake {
                    let _ = wake.send(Signal::Cancelled);
                }
                for event in terminal_events(&attempt.machine, result) {
                    self.inner.events.publish(event);
                }
                log::info!("Cancelled installation of {}", package_id);
                CancelOutcome::Cancelled
            }
            Ok(None) => CancelOutcome::AlreadyCancelled,
            Err(_) => CancelOutcome::NotCancellable,
        }
    }

    /// Delete signed copies left in the work directory by earlier runs. Copies that belong to
    /// an attempt in flight are kept.
    pub fn purge_stale_artifacts(&self) -> io::Result<usize> {
        let work_dir = &self.inner.config.work_dir;
        let entries = match fs::read_dir(work_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };
        let in_use: HashSet<PathBuf> = self
            .inner
            .lock_attempts()
            .values()
            .filter_map(|attempt| attempt.signed.clone())
            .collect();

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_artifact = entry
                .file_name()
                .to_str()
                .map_or(false, |name| name.starts_with(SIGNED_PREFIX));
            if !is_artifact || in_use.contains(&path) || !entry.file_type()?.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    log::debug!("Removed stale artifact {}", path.display());
                    removed += 1;
                }
                Err(err) => log::warn!("Failed to remove {}: {}", path.display(), err),
            }
        }
        Ok(removed)
    }
}

impl Inner {
    fn lock_attempts(&self) -> MutexGuard<'_, HashMap<String, Attempt>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `change` to the attempt's state machine and publish what it produced, all under the
    /// lock so observers see updates in the order they were made. Stale attempts are ignored.
    fn update(
        &self,
        package_id: &str,
        attempt: u64,
        change: impl FnOnce(&mut InstallationStateMachine) -> Result<Vec<InstallationEvent>, TransitionError>,
    ) -> Flow {
        let mut attempts = self.lock_attempts();
        let machine = match attempts.get_mut(package_id) {
            Some(entry) if entry.machine.attempt() == attempt => &mut entry.machine,
            _ => return Flow::Stop,
        };
        match change(&mut *machine) {
            Ok(events) => {
                for event in events {
                    self.events.publish(event);
                }
                if machine.state().is_terminal() {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
            Err(err) => {
                log::warn!("Ignoring update for {} attempt {}: {}", package_id, attempt, err);
                Flow::Stop
            }
        }
    }

    fn step(
        &self,
        run: &Run,
        change: impl FnOnce(&mut InstallationStateMachine) -> Result<Vec<InstallationEvent>, TransitionError>,
    ) -> Flow {
        self.update(&run.package_id, run.attempt, change)
    }

    fn report(&self, run: &Run, progress: u8) {
        self.step(run, |machine| {
            machine.report(progress, None).map(progress_events)
        });
    }

    fn track_signed(&self, run: &Run, path: Option<PathBuf>) {
        if let Some(entry) = self.lock_attempts().get_mut(&run.package_id) {
            if entry.machine.attempt() == run.attempt {
                entry.signed = path;
            }
        }
    }

    fn run(&self, run: Run, outcome: Sender<InstallationResult>) {
        log::info!(
            "Installing {} from {} (attempt {})",
            run.package_id,
            run.archive.display(),
            run.attempt
        );
        if let Err(err) = self.drive(&run) {
            log::error!("Installation of {} failed: {}", run.package_id, err);
            self.step(&run, |machine| {
                let result = machine.fail(&err, None)?;
                Ok(terminal_events(machine, result))
            });
        }

        let result = {
            let mut attempts = self.lock_attempts();
            match attempts.get_mut(&run.package_id) {
                Some(entry) if entry.machine.attempt() == run.attempt => {
                    entry.wake = None;
                    entry.signed = None;
                    entry.machine.result().cloned()
                }
                _ => None,
            }
        };
        match result {
            Some(result) => {
                log::info!("{} finished: {}", run.package_id, result.message);
                let _ = outcome.send(result);
            }
            None => log::warn!("{} attempt {} ended without a result", run.package_id, run.attempt),
        }
    }

    /// Runs the attempt until it is terminal. `Ok` means the state machine already holds the
    /// outcome; `Err` still has to be recorded as a failure.
    fn drive(&self, run: &Run) -> Result<(), InstallError> {
        self.prepare(run)?;
        if let Flow::Stop = self.step(run, |machine| {
            machine.report(PREPARED, None).map(progress_events)
        }) {
            return Ok(());
        }

        if let Flow::Stop = self.step(run, |machine| {
            machine
                .advance(InstallationState::Signing, SIGNING_START, MSG_SIGNING)
                .map(|progress| vec![InstallationEvent::Progress(progress)])
        }) {
            return Ok(());
        }
        log::info!("Signing {}", run.archive.display());
        fs::create_dir_all(&self.config.work_dir)
            .log_on_error("Failed to create work directory")?;
        // Removed when this function returns, whatever the outcome.
        let signed = tempfile::Builder::new()
            .prefix(SIGNED_PREFIX)
            .suffix(".apk")
            .tempfile_in(&self.config.work_dir)?
            .into_temp_path();
        self.track_signed(run, Some(signed.to_path_buf()));
        let signing = self
            .signer
            .sign_with(&run.archive, &signed, &run.cancel, |done, total| {
                self.report(run, scale(SIGNING_START, SIGNING_END, done as u64, total as u64))
            });
        match signing {
            Ok(_) => {}
            Err(SigningError::Cancelled) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        if run.cancel.is_cancelled() {
            return Ok(());
        }
        if let Flow::Stop = self.step(run, |machine| {
            machine
                .advance(InstallationState::Installing, SIGNING_END, MSG_INSTALLING)
                .map(|progress| vec![InstallationEvent::Progress(progress)])
        }) {
            return Ok(());
        }
        let total = fs::metadata(&signed)?.len();
        log::info!("Streaming {} signed bytes for {}", total, run.package_id);
        let mut session =
            InstallationSession::create(self.platform.clone(), &run.package_id, total)?;
        let wake = Mutex::new(run.wake.clone());
        let callback = CompletionCallback::new(move |completion| {
            if let Ok(wake) = wake.lock() {
                let _ = wake.send(Signal::Completed(completion));
            }
        });
        let streamed = session.install(
            &signed,
            self.config.chunk_size,
            &run.cancel,
            |written, total| self.report(run, scale(SIGNING_END, STREAM_END, written, total)),
            callback,
        )?;
        if streamed == StreamOutcome::Cancelled {
            session.abandon()?;
            return Ok(());
        }
        if let Flow::Stop = self.step(run, |machine| {
            machine
                .report(STREAM_END, Some(MSG_FINALIZING))
                .map(progress_events)
        }) {
            session.abandon()?;
            return Ok(());
        }

        self.await_completion(run, &mut session)
    }

    fn prepare(&self, run: &Run) -> Result<(), InstallError> {
        let metadata = fs::metadata(&run.archive).map_err(|err| {
            InstallError::Validation(format!("cannot access {}: {}", run.archive.display(), err))
        })?;
        if !metadata.is_file() {
            return Err(InstallError::Validation(format!(
                "{} is not a file",
                run.archive.display()
            )));
        }
        File::open(&run.archive).map_err(|err| {
            InstallError::Validation(format!("cannot read {}: {}", run.archive.display(), err))
        })?;

        if self.config.verify_package_identity {
            match declared_package_id(&run.archive)? {
                Some(declared) if declared == run.package_id => {}
                Some(declared) => {
                    return Err(InstallError::Validation(format!(
                        "archive declares `{}`, expected `{}`",
                        declared, run.package_id
                    )))
                }
                None => {
                    return Err(InstallError::Validation(
                        "archive declares no package identifier".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Wait for the platform to resolve the committed session. `PENDING_USER_ACTION` keeps the
    /// attempt waiting; the deadline is not extended.
    fn await_completion(
        &self,
        run: &Run,
        session: &mut InstallationSession,
    ) -> Result<(), InstallError> {
        let timeout = self.config.completion_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let signal = match run.signals.recv_timeout(remaining) {
                Ok(signal) => signal,
                Err(_) => {
                    log::warn!(
                        "Session {} did not complete within {:?}",
                        session.id(),
                        timeout
                    );
                    let _ = session
                        .abandon()
                        .log_on_error("Failed to abandon timed out session");
                    return Err(InstallError::Timeout(timeout));
                }
            };
            let completion = match signal {
                Signal::Cancelled => {
                    session.abandon()?;
                    return Ok(());
                }
                Signal::Completed(completion) if completion.session != session.id() => {
                    log::warn!("Ignoring completion for session {}", completion.session);
                    continue;
                }
                Signal::Completed(completion) => completion,
            };

            log::info!(
                "Session {} reported {}",
                completion.session,
                completion.status
            );
            let session_id = session.id();
            let flow = self.step(run, |machine| {
                match machine.apply(completion.status, completion.message.as_deref())? {
                    Resolution::Resolved(result) => Ok(terminal_events(machine, result)),
                    Resolution::AwaitingUser(progress) => Ok(vec![
                        InstallationEvent::Progress(progress),
                        InstallationEvent::UserActionRequired {
                            package_id: run.package_id.clone(),
                            session_id,
                        },
                    ]),
                }
            });
            if !completion.status.is_pending() {
                session.finish();
                return Ok(());
            }
            if let Flow::Stop = flow {
                session.abandon()?;
                return Ok(());
            }
        }
    }
}

fn progress_events(progress: Option<InstallationProgress>) -> Vec<InstallationEvent> {
    progress.into_iter().map(InstallationEvent::Progress).collect()
}

/// The terminal progress update, then the single result.
fn terminal_events(
    machine: &InstallationStateMachine,
    result: InstallationResult,
) -> Vec<InstallationEvent> {
    vec![
        InstallationEvent::Progress(machine.snapshot().clone()),
        InstallationEvent::Finished(result),
    ]
}

fn scale(start: u8, end: u8, done: u64, total: u64) -> u8 {
    if total == 0 {
        return end;
    }
    let span = u64::from(end - start);
    start + (span * done.min(total) / total) as u8
}
