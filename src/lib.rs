pub mod core;

pub use crate::core::{
    config::{InstallerConfig, CONFIG_FILE, VERSION},
    error::{ErrorCode, InstallError, SigningError},
    install::{Installer, InstallationHandle, InstallationProgress, InstallationResult},
    signing::{ArchiveSigner, SigningKeyProvider},
};
