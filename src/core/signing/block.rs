use super::{
    keys::SigningKeyMaterial,
    manifest::{attribute, parse_sections, write_attribute, DigestAlgorithm},
};
use crate::core::error::SigningError;
use base64::{engine::general_purpose::STANDARD, Engine as _};

pub const SIGNATURE_VERSION: &str = "1.0";

/// The detached signature file (`CERT.SF`): a digest over the whole manifest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignatureFile {
    pub created_by: String,
    pub algorithm: DigestAlgorithm,
    pub manifest_digest: Vec<u8>,
}

impl SignatureFile {
    pub fn for_manifest(manifest: &[u8], created_by: impl Into<String>) -> Self {
        let algorithm = DigestAlgorithm::Sha256;
        Self {
            created_by: created_by.into(),
            algorithm,
            manifest_digest: algorithm.digest(manifest),
        }
    }

    fn digest_attribute(algorithm: DigestAlgorithm) -> String {
        format!("{}-Manifest", algorithm.attribute())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        write_attribute(&mut out, "Signature-Version", SIGNATURE_VERSION);
        write_attribute(&mut out, "Created-By", &self.created_by);
        write_attribute(
            &mut out,
            &Self::digest_attribute(self.algorithm),
            &STANDARD.encode(&self.manifest_digest),
        );
        out.push_str("\r\n");
        out.into_bytes()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, SigningError> {
        let sections = parse_sections(bytes)?;
        let main = sections.first().ok_or_else(|| {
            SigningError::Verification("signature file is empty".to_string())
        })?;
        if attribute(main, "Signature-Version").is_none() {
            return Err(SigningError::Verification(
                "signature file has no version".to_string(),
            ));
        }
        let algorithm = DigestAlgorithm::Sha256;
        let encoded = attribute(main, &Self::digest_attribute(algorithm)).ok_or_else(|| {
            SigningError::Verification("signature file has no manifest digest".to_string())
        })?;
        let manifest_digest = STANDARD.decode(encoded).map_err(|err| {
            SigningError::Verification(format!("bad manifest digest: {}", err))
        })?;
        Ok(Self {
            created_by: attribute(main, "Created-By")
                .unwrap_or_default()
                .to_string(),
            algorithm,
            manifest_digest,
        })
    }
}

/// Everything appended under `META-INF/` besides the manifest itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignatureBlock {
    /// Digest of the manifest, as embedded in the signature file.
    pub signature_file_digest: Vec<u8>,
    /// Serialized `CERT.SF`.
    pub signature_file: Vec<u8>,
    /// RSA signature over `signature_file`.
    pub signature: Vec<u8>,
    /// DER certificate of the signing key.
    pub certificate: Vec<u8>,
}

impl SignatureBlock {
    /// Contents of `CERT.RSA`: the bare signature followed by the certificate.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.signature.len() + self.certificate.len());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.certificate);
        out
    }

    /// Split `CERT.RSA` bytes back into signature and certificate.
    pub fn split(block: &[u8], signature_len: usize) -> Result<(&[u8], &[u8]), SigningError> {
        if signature_len == 0 || block.len() <= signature_len {
            return Err(SigningError::Verification(format!(
                "signature block of {} bytes cannot hold a {}-byte signature and a certificate",
                block.len(),
                signature_len
            )));
        }
        Ok(block.split_at(signature_len))
    }
}

pub struct SignatureBlockBuilder<'a> {
    key: &'a SigningKeyMaterial,
    created_by: String,
}

impl<'a> SignatureBlockBuilder<'a> {
    pub fn new(key: &'a SigningKeyMaterial, created_by: impl Into<String>) -> Self {
        Self {
            key,
            created_by: created_by.into(),
        }
    }

    /// Sign serialized manifest bytes.
    pub fn build(&self, manifest: &[u8]) -> Result<SignatureBlock, SigningError> {
        let signature_file = SignatureFile::for_manifest(manifest, self.created_by.as_str());
        let signature_file_bytes = signature_file.to_bytes();
        let signature = self.key.sign(&signature_file_bytes)?;
        Ok(SignatureBlock {
            signature_file_digest: signature_file.manifest_digest,
            signature_file: signature_file_bytes,
            signature,
            certificate: self.key.certificate_der().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        fixtures::DEBUG_PEM,
        signing::keys::{certificate_public_key, verify_signature},
    };
    use sha2::{Digest as _, Sha256};

    #[test]
    fn should_embed_the_manifest_digest() {
        let manifest = b"Manifest-Version: 1.0\r\n\r\n";
        let sf = SignatureFile::for_manifest(manifest, "test");
        let text = String::from_utf8(sf.to_bytes()).unwrap();
        assert!(text.starts_with("Signature-Version: 1.0\r\nCreated-By: test\r\n"));
        assert!(text.contains(&format!(
            "SHA-256-Digest-Manifest: {}\r\n",
            STANDARD.encode(Sha256::digest(manifest))
        )));
        assert_eq!(SignatureFile::parse(text.as_bytes()).unwrap(), sf);
    }

    #[test]
    fn should_sign_the_signature_file() {
        let key = SigningKeyMaterial::from_pem(DEBUG_PEM).unwrap();
        let block = SignatureBlockBuilder::new(&key, "test")
            .build(b"Manifest-Version: 1.0\r\n\r\n")
            .unwrap();

        let bytes = block.to_bytes();
        let (signature, certificate) = SignatureBlock::split(&bytes, key.signature_len()).unwrap();
        assert_eq!(signature, block.signature.as_slice());
        assert_eq!(certificate, key.certificate_der());

        let pubkey = certificate_public_key(key.certificate()).unwrap();
        assert!(verify_signature(&pubkey, &block.signature_file, signature).is_ok());
    }

    #[test]
    fn should_refuse_blocks_too_short_to_split() {
        assert!(SignatureBlock::split(&[0u8; 256], 256).is_err());
        assert!(SignatureBlock::split(&[0u8; 10], 0).is_err());
    }
}
