use crate::core::{
    archive::{is_directory, is_metadata},
    error::SigningError,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest as _, Sha256};

pub const MANIFEST_VERSION: &str = "1.0";

/// Manifest lines are at most this many bytes; longer values continue on lines starting with a space.
const MAX_LINE_BYTES: usize = 72;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "SHA-256",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SHA-256" => Some(DigestAlgorithm::Sha256),
            _ => None,
        }
    }

    pub fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha256 => Sha256::digest(bytes).to_vec(),
        }
    }

    /// Attribute key carrying a digest, e.g. `SHA-256-Digest`.
    pub fn attribute(&self) -> String {
        format!("{}-Digest", self.name())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManifestEntry {
    pub name: String,
    pub algorithm: DigestAlgorithm,
    pub digest: Vec<u8>,
}

impl ManifestEntry {
    pub fn encoded_digest(&self) -> String {
        STANDARD.encode(&self.digest)
    }
}

/// Per-entry digests of an archive's payload. Always regenerated, never stored on its own.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Manifest {
    pub version: String,
    pub created_by: String,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn entry(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        write_attribute(&mut out, "Manifest-Version", &self.version);
        write_attribute(&mut out, "Created-By", &self.created_by);
        out.push_str("\r\n");
        for entry in &self.entries {
            write_attribute(&mut out, "Name", &entry.name);
            write_attribute(&mut out, &entry.algorithm.attribute(), &entry.encoded_digest());
            out.push_str("\r\n");
        }
        out.into_bytes()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, SigningError> {
        let mut sections = parse_sections(bytes)?.into_iter();
        let main = sections
            .next()
            .ok_or_else(|| SigningError::Verification("manifest is empty".to_string()))?;
        let version = attribute(&main, "Manifest-Version")
            .ok_or_else(|| SigningError::Verification("manifest has no version".to_string()))?
            .to_string();
        let created_by = attribute(&main, "Created-By").unwrap_or_default().to_string();

        let mut entries = vec![];
        for section in sections {
            let name = attribute(&section, "Name").ok_or_else(|| {
                SigningError::Verification("manifest section without a name".to_string())
            })?;
            let (algorithm, value) = section
                .iter()
                .find_map(|(key, value)| {
                    key.strip_suffix("-Digest")
                        .map(|algorithm| (algorithm, value))
                })
                .ok_or_else(|| {
                    SigningError::Verification(format!("no digest for `{}`", name))
                })?;
            let algorithm = DigestAlgorithm::from_name(algorithm).ok_or_else(|| {
                SigningError::Verification(format!("unsupported digest algorithm {}", algorithm))
            })?;
            let digest = STANDARD.decode(value).map_err(|err| {
                SigningError::Verification(format!("bad digest for `{}`: {}", name, err))
            })?;
            entries.push(ManifestEntry {
                name: name.to_string(),
                algorithm,
                digest,
            });
        }
        Ok(Self {
            version,
            created_by,
            entries,
        })
    }
}

/// Collects entry digests in the order entries are fed in.
#[derive(Debug)]
pub struct DigestManifestBuilder {
    algorithm: DigestAlgorithm,
    created_by: String,
    entries: Vec<ManifestEntry>,
}

impl DigestManifestBuilder {
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            algorithm: DigestAlgorithm::Sha256,
            created_by: created_by.into(),
            entries: vec![],
        }
    }

    /// Whether an entry's content belongs in the manifest.
    pub fn covers(name: &str) -> bool {
        !is_directory(name) && !is_metadata(name)
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Digest `content` and record it. Returns `false` for directories and metadata.
    pub fn add(&mut self, name: &str, content: &[u8]) -> bool {
        if !Self::covers(name) {
            return false;
        }
        let digest = self.algorithm.digest(content);
        self.add_digest(name, digest);
        true
    }

    /// Record a digest computed elsewhere, typically while the content was being streamed.
    pub fn add_digest(&mut self, name: &str, digest: Vec<u8>) {
        self.entries.push(ManifestEntry {
            name: name.to_string(),
            algorithm: self.algorithm,
            digest,
        });
    }

    pub fn build(self) -> Manifest {
        Manifest {
            version: MANIFEST_VERSION.to_string(),
            created_by: self.created_by,
            entries: self.entries,
        }
    }

    pub fn build_from<'a>(
        created_by: impl Into<String>,
        entries: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    ) -> Manifest {
        let mut builder = Self::new(created_by);
        for (name, content) in entries {
            builder.add(name, content);
        }
        builder.build()
    }
}

pub(crate) fn write_attribute(out: &mut String, key: &str, value: &str) {
    let line = format!("{}: {}", key, value);
    let mut rest = line.as_str();
    let mut limit = MAX_LINE_BYTES;
    loop {
        if rest.len() <= limit {
            out.push_str(rest);
            out.push_str("\r\n");
            return;
        }
        let mut cut = limit;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        out.push_str(&rest[..cut]);
        out.push_str("\r\n ");
        rest = &rest[cut..];
        // The leading space of a continuation line counts towards its length.
        limit = MAX_LINE_BYTES - 1;
    }
}

pub(crate) type Section = Vec<(String, String)>;

/// Split a manifest-style text into sections of `key: value` pairs, joining continuation lines.
pub(crate) fn parse_sections(bytes: &[u8]) -> Result<Vec<Section>, SigningError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|err| SigningError::Verification(format!("not UTF-8: {}", err)))?;
    let mut sections = vec![];
    let mut current: Vec<String> = vec![];
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if !current.is_empty() {
                sections.push(split_lines(std::mem::take(&mut current))?);
            }
            continue;
        }
        match (line.strip_prefix(' '), current.last_mut()) {
            (Some(continuation), Some(last)) => last.push_str(continuation),
            (Some(_), None) => {
                return Err(SigningError::Verification(
                    "continuation line without a preceding attribute".to_string(),
                ))
            }
            (None, _) => current.push(line.to_string()),
        }
    }
    if !current.is_empty() {
        sections.push(split_lines(current)?);
    }
    Ok(sections)
}

fn split_lines(lines: Vec<String>) -> Result<Section, SigningError> {
    lines
        .into_iter()
        .map(|line| {
            line.split_once(": ")
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| SigningError::Verification(format!("malformed line `{}`", line)))
        })
        .collect()
}

pub(crate) fn attribute<'a>(section: &'a Section, key: &str) -> Option<&'a str> {
    section
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_skip_directories_and_metadata() {
        let manifest = DigestManifestBuilder::build_from(
            "test",
            [
                ("AndroidManifest.xml", &b"<manifest/>"[..]),
                ("res/", &b""[..]),
                ("META-INF/services/x", &b"svc"[..]),
                ("classes.dex", &b"dex"[..]),
            ],
        );
        let names: Vec<_> = manifest.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["AndroidManifest.xml", "classes.dex"]);
        assert_eq!(manifest.version, "1.0");
    }

    #[test]
    fn should_digest_deterministically() {
        let a = DigestAlgorithm::Sha256.digest(b"same content");
        let b = DigestAlgorithm::Sha256.digest(b"same content");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, DigestAlgorithm::Sha256.digest(b"other content"));
    }

    #[test]
    fn should_serialize_header_and_stanzas() {
        let manifest = DigestManifestBuilder::build_from("apk-installer test", [("a.txt", &b"a"[..])]);
        let text = String::from_utf8(manifest.to_bytes()).unwrap();
        let expected_digest = STANDARD.encode(Sha256::digest(b"a"));
        assert_eq!(
            text,
            format!(
                "Manifest-Version: 1.0\r\nCreated-By: apk-installer test\r\n\r\nName: a.txt\r\nSHA-256-Digest: {}\r\n\r\n",
                expected_digest
            )
        );
    }

    #[test]
    fn should_wrap_long_names_and_read_them_back() {
        let long_name = format!("assets/{}/data.bin", "nested-directory".repeat(8));
        let manifest = DigestManifestBuilder::build_from("test", [(long_name.as_str(), &b"x"[..])]);
        let bytes = manifest.to_bytes();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.split("\r\n").all(|line| line.len() <= MAX_LINE_BYTES));
        assert!(text.contains("\r\n "));

        let parsed = Manifest::parse(&bytes).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn should_not_split_multibyte_characters() {
        let mut out = String::new();
        let value = "é".repeat(60);
        write_attribute(&mut out, "Name", &value);
        let joined: String = out
            .split("\r\n")
            .map(|line| line.strip_prefix(' ').unwrap_or(line))
            .collect();
        assert_eq!(joined, format!("Name: {}", value));
    }

    #[test]
    fn should_reject_unknown_algorithms() {
        let text = "Manifest-Version: 1.0\r\n\r\nName: a.txt\r\nSHA1-Digest: AAAA\r\n\r\n";
        assert!(matches!(
            Manifest::parse(text.as_bytes()),
            Err(SigningError::Verification(_))
        ));
    }
}
