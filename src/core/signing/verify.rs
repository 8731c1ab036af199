use super::{
    block::{SignatureBlock, SignatureFile},
    keys::{certificate_public_key, fingerprint, verify_signature},
    manifest::{DigestManifestBuilder, Manifest},
};
use crate::core::{
    archive::{ArchiveReader, MANIFEST_NAME, SIGNATURE_BLOCK_NAME, SIGNATURE_FILE_NAME},
    error::SigningError,
};
use rasn_pkix::Certificate;
use rsa::PublicKeyParts;
use sha2::{Digest as _, Sha256};
use std::{collections::HashMap, io, path::Path};

/// Signature lengths of the RSA key sizes we accept, most common first.
const SIGNATURE_LENGTHS: [usize; 4] = [256, 384, 512, 128];

#[derive(Debug)]
pub struct VerifiedArchive {
    pub certificate: Certificate,
    pub fingerprint: String,
    /// Entries whose digests were checked.
    pub entries: usize,
    pub created_by: String,
}

fn read_required(reader: &mut ArchiveReader, name: &str) -> Result<Vec<u8>, SigningError> {
    reader
        .read_entry(name)?
        .ok_or_else(|| SigningError::Verification(format!("{} is missing", name)))
}

/// Find where the signature ends and the certificate begins in `CERT.RSA`.
fn split_block(block: &[u8]) -> Result<(&[u8], Certificate, &[u8]), SigningError> {
    for len in SIGNATURE_LENGTHS {
        let (signature, cert_der) = match SignatureBlock::split(block, len) {
            Ok(parts) => parts,
            Err(_) => continue,
        };
        let cert = match rasn::der::decode::<Certificate>(cert_der) {
            Ok(cert) => cert,
            Err(_) => continue,
        };
        match certificate_public_key(&cert) {
            Ok(pubkey) if pubkey.size() == len => return Ok((signature, cert, cert_der)),
            _ => continue,
        }
    }
    Err(SigningError::Verification(format!(
        "{} holds no recognizable signature and certificate",
        SIGNATURE_BLOCK_NAME
    )))
}

/// Check that a re-signed archive is internally consistent: the signature covers the signature
/// file, the signature file covers the manifest and the manifest covers every payload entry.
pub fn verify(path: impl AsRef<Path>) -> Result<VerifiedArchive, SigningError> {
    let mut reader = ArchiveReader::open(path)?;
    let manifest_bytes = read_required(&mut reader, MANIFEST_NAME)?;
    let sf_bytes = read_required(&mut reader, SIGNATURE_FILE_NAME)?;
    let block = read_required(&mut reader, SIGNATURE_BLOCK_NAME)?;

    let (signature, certificate, cert_der) = split_block(&block)?;
    let pubkey = certificate_public_key(&certificate)?;
    verify_signature(&pubkey, &sf_bytes, signature)?;

    let sf = SignatureFile::parse(&sf_bytes)?;
    if sf.algorithm.digest(&manifest_bytes) != sf.manifest_digest {
        return Err(SigningError::Verification(
            "manifest does not match the signature file".to_string(),
        ));
    }

    let manifest = Manifest::parse(&manifest_bytes)?;
    let mut expected = HashMap::with_capacity(manifest.entries.len());
    for entry in &manifest.entries {
        if expected.insert(entry.name.as_str(), entry).is_some() {
            return Err(SigningError::Verification(format!(
                "{} is listed twice in the manifest",
                entry.name
            )));
        }
    }

    let mut checked = 0;
    reader.for_each_entry(DigestManifestBuilder::covers, |meta, content| {
        let entry = expected.remove(meta.name.as_str()).ok_or_else(|| {
            SigningError::Verification(format!("{} is not covered by the manifest", meta.name))
        })?;
        let mut hasher = Sha256::new();
        io::copy(content, &mut hasher)?;
        if hasher.finalize().as_slice() != entry.digest.as_slice() {
            return Err(SigningError::Verification(format!(
                "digest mismatch for {}",
                meta.name
            )));
        }
        checked += 1;
        Ok(())
    })?;
    if let Some(name) = expected.keys().next() {
        return Err(SigningError::Verification(format!(
            "{} is listed in the manifest but missing from the archive",
            name
        )));
    }

    Ok(VerifiedArchive {
        fingerprint: fingerprint(cert_der),
        certificate,
        entries: checked,
        created_by: manifest.created_by,
    })
}
