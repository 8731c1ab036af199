pub mod block;
pub mod keys;
pub mod manifest;
pub mod signer;
pub mod verify;

pub use block::{SignatureBlock, SignatureBlockBuilder};
pub use keys::{SigningKeyMaterial, SigningKeyProvider};
pub use manifest::{DigestManifestBuilder, Manifest, ManifestEntry};
pub use signer::{ArchiveSigner, SignedArchive};
pub use verify::{verify, VerifiedArchive};
