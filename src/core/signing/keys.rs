use crate::core::{config::SigningConfig, error::SigningError, logging::LogOnError};
use chrono::{DateTime, Datelike, Months, Timelike, Utc};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use rasn::types::{Any, BitString, Integer, ObjectIdentifier};
use rasn_pkix::{
    AlgorithmIdentifier, AttributeTypeAndValue, Certificate, Name, SubjectPublicKeyInfo,
    TbsCertificate, Time, Validity, Version,
};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{PaddingScheme, PublicKey, PublicKeyParts, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest as _, Sha256};
use std::{
    fs,
    io::Write,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};
use tempfile::NamedTempFile;

const SHA256_WITH_RSA: [u32; 7] = [1, 2, 840, 113549, 1, 1, 11];
const COMMON_NAME: [u32; 4] = [2, 5, 4, 3];
const ORGANIZATION: [u32; 4] = [2, 5, 4, 10];
const COUNTRY: [u32; 4] = [2, 5, 4, 6];
/// DER encoding of ASN.1 NULL, the parameters of sha256WithRSAEncryption.
const DER_NULL: [u8; 2] = [0x05, 0x00];

fn crypto(err: impl std::fmt::Display) -> SigningError {
    SigningError::Crypto(err.to_string())
}

/// The private key and the self-signed certificate that vouches for it.
///
/// The private key never leaves this type: callers hand over bytes and get a signature back.
#[derive(Clone)]
pub struct SigningKeyMaterial {
    key: RsaPrivateKey,
    pubkey: RsaPublicKey,
    cert: Certificate,
    cert_der: Vec<u8>,
}

impl SigningKeyMaterial {
    /// Parse a PEM bundle holding a PKCS#8 `PRIVATE KEY` and a `CERTIFICATE`.
    pub fn from_pem(pem: &str) -> Result<Self, SigningError> {
        let pem = pem::parse_many(pem).map_err(crypto)?;
        let key = if let Some(key) = pem.iter().find(|pem| pem.tag == "PRIVATE KEY") {
            RsaPrivateKey::from_pkcs8_der(&key.contents).map_err(crypto)?
        } else {
            return Err(SigningError::Crypto("no private key found".to_string()));
        };
        let cert_der = if let Some(cert) = pem.iter().find(|pem| pem.tag == "CERTIFICATE") {
            cert.contents.clone()
        } else {
            return Err(SigningError::Crypto("no certificate found".to_string()));
        };
        let cert = rasn::der::decode::<Certificate>(&cert_der).map_err(crypto)?;
        let pubkey = RsaPublicKey::from(&key);
        if certificate_public_key(&cert)? != pubkey {
            return Err(SigningError::Crypto(
                "certificate does not belong to the private key".to_string(),
            ));
        }
        Ok(Self {
            key,
            pubkey,
            cert,
            cert_der,
        })
    }

    /// Create a fresh RSA key and a self-signed certificate valid from now.
    ///
    /// With a configured seed the key is reproducible for that seed.
    pub fn generate(config: &SigningConfig) -> Result<Self, SigningError> {
        let mut rng = match &config.seed {
            Some(seed) => StdRng::from_seed(Sha256::digest(seed.as_bytes()).into()),
            None => StdRng::from_entropy(),
        };
        log::info!("Generating a {}-bit RSA signing key", config.key_bits);
        let key = RsaPrivateKey::new(&mut rng, config.key_bits)?;
        let pubkey = RsaPublicKey::from(&key);
        // Positive and non-zero.
        let serial = (rng.next_u64() >> 1).max(1);
        let cert = self_signed_certificate(&key, &pubkey, config, serial, Utc::now())?;
        let cert_der = rasn::der::encode(&cert).map_err(crypto)?;
        Ok(Self {
            key,
            pubkey,
            cert,
            cert_der,
        })
    }

    pub fn to_pem(&self) -> Result<String, SigningError> {
        let key_der = self.key.to_pkcs8_der().map_err(crypto)?;
        Ok(pem::encode_many(&[
            pem::Pem {
                tag: "CERTIFICATE".to_string(),
                contents: self.cert_der.clone(),
            },
            pem::Pem {
                tag: "PRIVATE KEY".to_string(),
                contents: key_der.as_bytes().to_vec(),
            },
        ]))
    }

    /// RSA PKCS#1 v1.5 signature over the SHA-256 digest of `bytes`.
    pub fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>, SigningError> {
        let digest = Sha256::digest(bytes);
        let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
        Ok(self.key.sign(padding, &digest)?)
    }

    /// Length in bytes of every signature this key produces.
    pub fn signature_len(&self) -> usize {
        self.pubkey.size()
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.pubkey
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.cert_der)
    }
}

impl std::fmt::Debug for SigningKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SigningKeyMaterial")
            .field("fingerprint", &self.fingerprint())
            .field("bits", &(self.pubkey.size() * 8))
            .finish_non_exhaustive()
    }
}

/// Colon separated upper-case hex SHA-256 of a DER certificate.
pub fn fingerprint(cert_der: &[u8]) -> String {
    Sha256::digest(cert_der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn certificate_public_key(cert: &Certificate) -> Result<RsaPublicKey, SigningError> {
    let spki = rasn::der::encode(&cert.tbs_certificate.subject_public_key_info).map_err(crypto)?;
    RsaPublicKey::from_public_key_der(&spki).map_err(crypto)
}

pub fn verify_signature(
    pubkey: &RsaPublicKey,
    bytes: &[u8],
    signature: &[u8],
) -> Result<(), SigningError> {
    let digest = Sha256::digest(bytes);
    let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
    pubkey
        .verify(padding, &digest, signature)
        .map_err(|err| SigningError::Verification(format!("bad signature: {}", err)))
}

fn oid(arcs: &[u32]) -> Result<ObjectIdentifier, SigningError> {
    ObjectIdentifier::new(arcs.to_vec())
        .ok_or_else(|| SigningError::Crypto(format!("invalid object identifier {:?}", arcs)))
}

fn name_attribute(arcs: &[u32], value: &str) -> Result<AttributeTypeAndValue, SigningError> {
    Ok(AttributeTypeAndValue {
        r#type: oid(arcs)?,
        value: Any::new(rasn::der::encode(&value.to_string()).map_err(crypto)?),
    })
}

fn distinguished_name(config: &SigningConfig) -> Result<Name, SigningError> {
    let mut rdns = vec![];
    for (arcs, value) in [
        (&COUNTRY[..], &config.country),
        (&ORGANIZATION[..], &config.organization),
        (&COMMON_NAME[..], &config.common_name),
    ] {
        if value.is_empty() {
            continue;
        }
        rdns.push(std::iter::once(name_attribute(arcs, value)?).collect());
    }
    Ok(Name::RdnSequence(rdns))
}

/// UTCTime only covers 1950..2049; later dates need GeneralizedTime.
fn asn1_time(at: DateTime<Utc>) -> Time {
    if at.year() < 2050 {
        Time::Utc(at)
    } else {
        Time::General(at.into())
    }
}

fn self_signed_certificate(
    key: &RsaPrivateKey,
    pubkey: &RsaPublicKey,
    config: &SigningConfig,
    serial: u64,
    now: DateTime<Utc>,
) -> Result<Certificate, SigningError> {
    let not_before = now.with_nanosecond(0).unwrap_or(now);
    let not_after = config
        .validity_years
        .checked_mul(12)
        .and_then(|months| not_before.checked_add_months(Months::new(months)))
        .ok_or_else(|| {
            crypto(format!(
                "a validity of {} years is out of range",
                config.validity_years
            ))
        })?;
    let algorithm = AlgorithmIdentifier {
        algorithm: oid(&SHA256_WITH_RSA)?,
        parameters: Some(Any::new(DER_NULL.to_vec())),
    };
    let spki_der = pubkey.to_public_key_der().map_err(crypto)?;
    let subject_public_key_info =
        rasn::der::decode::<SubjectPublicKeyInfo>(spki_der.as_ref()).map_err(crypto)?;
    let name = distinguished_name(config)?;

    let tbs_certificate = TbsCertificate {
        version: Version::V3,
        serial_number: Integer::from(serial),
        signature: algorithm.clone(),
        issuer: name.clone(),
        validity: Validity {
            not_before: asn1_time(not_before),
            not_after: asn1_time(not_after),
        },
        subject: name,
        subject_public_key_info,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: None,
    };
    let tbs_der = rasn::der::encode(&tbs_certificate).map_err(crypto)?;
    let padding = PaddingScheme::new_pkcs1v15_sign::<Sha256>();
    let signature = key.sign(padding, &Sha256::digest(&tbs_der))?;
    Ok(Certificate {
        tbs_certificate,
        signature_algorithm: algorithm,
        signature_value: BitString::from_vec(signature),
    })
}

/// Hands out the process-wide signing identity, loading or creating it on first use.
///
/// The material is read-only once created and shared between concurrent signing runs.
pub struct SigningKeyProvider {
    config: SigningConfig,
    material: Mutex<Option<Arc<SigningKeyMaterial>>>,
}

impl SigningKeyProvider {
    pub fn new(config: SigningConfig) -> Self {
        Self {
            config,
            material: Mutex::new(None),
        }
    }

    /// A provider that always hands out `material`.
    pub fn with_material(config: SigningConfig, material: SigningKeyMaterial) -> Self {
        Self {
            config,
            material: Mutex::new(Some(Arc::new(material))),
        }
    }

    pub fn config(&self) -> &SigningConfig {
        &self.config
    }

    pub fn obtain_key(&self) -> Result<Arc<SigningKeyMaterial>, SigningError> {
        let mut slot = self
            .material
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(material) = slot.as_ref() {
            return Ok(material.clone());
        }
        let material = Arc::new(self.load_or_generate()?);
        log::info!("Signing identity {}", material.fingerprint());
        *slot = Some(material.clone());
        Ok(material)
    }

    fn load_or_generate(&self) -> Result<SigningKeyMaterial, SigningError> {
        let path = match &self.config.keystore {
            Some(path) => path,
            None => return SigningKeyMaterial::generate(&self.config),
        };
        if path.exists() {
            let pem = fs::read_to_string(path).log_on_error("Failed to read keystore")?;
            return SigningKeyMaterial::from_pem(&pem).map_err(|err| {
                SigningError::Crypto(format!("keystore {} is unusable: {}", path.display(), err))
            });
        }
        // Check the store location up front; generating a key only to lose it is slow and pointless.
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                SigningError::Crypto(format!("cannot create {}: {}", parent.display(), err))
            })?;
        }
        let material = SigningKeyMaterial::generate(&self.config)?;
        persist_keystore(path, &material.to_pem()?).map_err(|err| {
            SigningError::Crypto(format!("cannot persist keystore {}: {}", path.display(), err))
        })?;
        log::info!("Stored new signing key at {}", path.display());
        Ok(material)
    }
}

impl std::fmt::Debug for SigningKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SigningKeyProvider")
            .field("keystore", &self.config.keystore)
            .finish_non_exhaustive()
    }
}

/// Write the PEM bundle next to its final location, restrict it to the owner, then rename it in place.
fn persist_keystore(path: &Path, pem: &str) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut file = NamedTempFile::new_in(parent)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(pem.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}
