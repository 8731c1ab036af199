use super::{
    binxml::{self, ManifestAttributes},
    ArchiveReader, ANDROID_MANIFEST,
};
use crate::core::error::SigningError;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use std::{fs::File, io, path::Path};

const ANDROID_NAMESPACE: &str = "http://schemas.android.com/apk/res/android";

/// Identity and basic facts about a package archive.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PackageInfo {
    pub package_id: String,
    pub version_code: Option<u32>,
    pub version_name: Option<String>,
    pub size: u64,
    /// Lowercase hex SHA-256 of the whole archive file.
    pub sha256: String,
}

/// Reads the package identifier the archive declares, if it declares one.
pub fn declared_package_id(path: impl AsRef<Path>) -> Result<Option<String>, SigningError> {
    let mut reader = ArchiveReader::open(path)?;
    Ok(manifest_attributes(&mut reader)?.and_then(|attributes| attributes.package))
}

pub fn read_package_info(path: impl AsRef<Path>) -> Result<PackageInfo, SigningError> {
    let path = path.as_ref();
    let mut reader = ArchiveReader::open(path)?;
    let attributes = manifest_attributes(&mut reader)?.ok_or_else(|| {
        SigningError::ArchiveFormat(format!("{} is missing", ANDROID_MANIFEST))
    })?;
    let package_id = attributes.package.ok_or_else(|| {
        SigningError::ArchiveFormat(format!("{} declares no package", ANDROID_MANIFEST))
    })?;

    let mut hasher = Sha256::new();
    let size = io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(PackageInfo {
        package_id,
        version_code: attributes.version_code,
        version_name: attributes.version_name,
        size,
        sha256: to_hex(&hasher.finalize()),
    })
}

fn manifest_attributes(
    reader: &mut ArchiveReader,
) -> Result<Option<ManifestAttributes>, SigningError> {
    let bytes = match reader.read_entry(ANDROID_MANIFEST)? {
        Some(bytes) => bytes,
        None => return Ok(None),
    };
    if binxml::is_binary_xml(&bytes) {
        binxml::read_manifest_attributes(&bytes).map(Some)
    } else {
        parse_text_manifest(&bytes).map(Some)
    }
}

fn parse_text_manifest(bytes: &[u8]) -> Result<ManifestAttributes, SigningError> {
    let text = std::str::from_utf8(bytes).map_err(|err| {
        SigningError::ArchiveFormat(format!("{} is not UTF-8: {}", ANDROID_MANIFEST, err))
    })?;
    let doc = roxmltree::Document::parse(text).map_err(|err| {
        SigningError::ArchiveFormat(format!("{} is not valid XML: {}", ANDROID_MANIFEST, err))
    })?;
    let root = doc.root_element();
    if root.tag_name().name() != "manifest" {
        return Err(SigningError::ArchiveFormat(format!(
            "{} root element is <{}>",
            ANDROID_MANIFEST,
            root.tag_name().name()
        )));
    }
    Ok(ManifestAttributes {
        package: root.attribute("package").map(str::to_string),
        version_code: root
            .attribute((ANDROID_NAMESPACE, "versionCode"))
            .and_then(|code| code.trim().parse().ok()),
        version_name: root
            .attribute((ANDROID_NAMESPACE, "versionName"))
            .map(str::to_string),
    })
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
