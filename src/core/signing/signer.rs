use super::{
    block::SignatureBlockBuilder,
    keys::SigningKeyProvider,
    manifest::{DigestManifestBuilder, Manifest},
};
use crate::core::{
    archive::{
        is_signing_metadata, ArchiveReader, ArchiveWriter, MANIFEST_NAME, SIGNATURE_BLOCK_NAME,
        SIGNATURE_FILE_NAME,
    },
    cancel::CancellationToken,
    config::SigningConfig,
    error::SigningError,
    logging::LogOnError,
};
use sha2::{Digest as _, Sha256};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::NamedTempFile;

/// Outcome of a successful signing run.
#[derive(Debug)]
pub struct SignedArchive {
    pub path: PathBuf,
    pub manifest: Manifest,
    /// Old signing metadata that was dropped.
    pub stripped: Vec<String>,
    /// Entries in the output, including the three new metadata entries.
    pub entries: usize,
    pub fingerprint: String,
}

/// Strips old signing metadata, copies every other entry and appends a fresh signature.
#[derive(Clone, Debug)]
pub struct ArchiveSigner {
    keys: Arc<SigningKeyProvider>,
    created_by: String,
}

impl ArchiveSigner {
    pub fn new(keys: Arc<SigningKeyProvider>) -> Self {
        let created_by = keys.config().created_by.clone();
        Self { keys, created_by }
    }

    pub fn from_config(config: &SigningConfig) -> Self {
        Self::new(Arc::new(SigningKeyProvider::new(config.clone())))
    }

    pub fn keys(&self) -> &Arc<SigningKeyProvider> {
        &self.keys
    }

    pub fn sign(&self, input: &Path, output: &Path) -> Result<SignedArchive, SigningError> {
        self.sign_with(input, output, &CancellationToken::new(), |_, _| {})
    }

    /// Like [`ArchiveSigner::sign`], reporting `(entries done, entries total)` and stopping at
    /// the next entry once `cancel` fires. Nothing is left at `output` unless signing succeeds.
    pub fn sign_with(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<SignedArchive, SigningError> {
        if input == output {
            return Err(SigningError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "refusing to overwrite the input archive",
            )));
        }
        if cancel.is_cancelled() {
            return Err(SigningError::Cancelled);
        }
        // Without a key there is nothing to sign with, so fail before touching any archive.
        let key = self.keys.obtain_key()?;

        let mut reader = ArchiveReader::open(input)?;
        if reader.is_empty() {
            return Err(SigningError::ArchiveFormat(format!(
                "{} contains no entries",
                input.display()
            )));
        }
        let total = reader.len();
        let parent = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let temp = NamedTempFile::new_in(parent).log_on_error("Failed to create temp archive")?;
        let mut writer = ArchiveWriter::new(temp);
        let mut builder = DigestManifestBuilder::new(self.created_by.as_str());
        let mut done = 0;

        let stripped = reader.for_each_entry(
            |name| !is_signing_metadata(name),
            |meta, content| {
                if cancel.is_cancelled() {
                    return Err(SigningError::Cancelled);
                }
                if meta.is_dir {
                    writer.add_directory(meta)?;
                } else if DigestManifestBuilder::covers(&meta.name) {
                    let mut hasher = Sha256::new();
                    writer.copy_entry(meta, content, |chunk| hasher.update(chunk))?;
                    builder.add_digest(&meta.name, hasher.finalize().to_vec());
                } else {
                    writer.copy_entry(meta, content, |_| {})?;
                }
                done += 1;
                progress(done, total);
                Ok(())
            },
        )?;
        for name in &stripped {
            log::debug!("Dropped old signing metadata {}", name);
        }
        if cancel.is_cancelled() {
            return Err(SigningError::Cancelled);
        }

        let manifest = builder.build();
        let manifest_bytes = manifest.to_bytes();
        let block = SignatureBlockBuilder::new(&key, self.created_by.as_str()).build(&manifest_bytes)?;
        // Fixed timestamp keeps the output reproducible for identical input.
        let stamp = zip::DateTime::default();
        writer.add_file(MANIFEST_NAME, &manifest_bytes, stamp)?;
        writer.add_file(SIGNATURE_FILE_NAME, &block.signature_file, stamp)?;
        writer.add_file(SIGNATURE_BLOCK_NAME, &block.to_bytes(), stamp)?;

        let temp = writer.finish()?;
        temp.as_file().sync_all()?;
        temp.persist(output)
            .map_err(|err| SigningError::Io(err.error))
            .log_on_error("Failed to move signed archive into place")?;
        progress(total, total);
        log::info!(
            "Signed {} -> {} ({} entries digested, {} metadata entries dropped)",
            input.display(),
            output.display(),
            manifest.entries.len(),
            stripped.len()
        );

        Ok(SignedArchive {
            path: output.to_path_buf(),
            manifest,
            stripped,
            entries: done + 3,
            fingerprint: key.fingerprint(),
        })
    }
}
