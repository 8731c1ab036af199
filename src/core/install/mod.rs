pub mod events;
pub mod pipeline;
pub mod session;
pub mod staging;
pub mod state;
pub mod status;

pub use events::{EventBus, InstallationEvent, SubscriberId, Subscription};
pub use pipeline::{CancelOutcome, InstallationHandle, Installer};
pub use session::{
    Completion, CompletionCallback, InstallationSession, PlatformInstaller, SessionId,
    SessionParams, SessionWriter,
};
pub use staging::StagingInstaller;
pub use state::{InstallationProgress, InstallationResult, InstallationState};
pub use status::InstallStatus;
