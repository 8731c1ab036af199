pub mod binxml;
pub mod package;

use crate::core::error::SigningError;
use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, Write},
    path::{Path, PathBuf},
};
use zip::{write::FileOptions, CompressionMethod, DateTime, ZipArchive, ZipWriter};

pub const META_INF: &str = "META-INF/";
pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";
pub const SIGNATURE_FILE_NAME: &str = "META-INF/CERT.SF";
pub const SIGNATURE_BLOCK_NAME: &str = "META-INF/CERT.RSA";
pub const ANDROID_MANIFEST: &str = "AndroidManifest.xml";

const COPY_BUFFER_SIZE: usize = 8192;

/// Anything under `META-INF/`. Never digested into the manifest.
pub fn is_metadata(name: &str) -> bool {
    name.starts_with(META_INF)
}

pub fn is_directory(name: &str) -> bool {
    name.ends_with('/')
}

/// Signing metadata left behind by a previous signer. Dropped when re-signing.
pub fn is_signing_metadata(name: &str) -> bool {
    if name == MANIFEST_NAME {
        return true;
    }
    is_metadata(name)
        && [".SF", ".RSA", ".DSA"]
            .iter()
            .any(|suffix| name.ends_with(suffix))
}

/// Everything needed to write an entry back out the way it was read.
#[derive(Clone, Debug)]
pub struct EntryMeta {
    pub name: String,
    pub is_dir: bool,
    pub compression: CompressionMethod,
    pub last_modified: DateTime,
    pub unix_mode: Option<u32>,
    pub size: u64,
}

impl EntryMeta {
    fn options(&self) -> FileOptions {
        // Only stored and deflated can be written back; anything else is recompressed.
        let method = match self.compression {
            CompressionMethod::Stored => CompressionMethod::Stored,
            _ => CompressionMethod::Deflated,
        };
        let options = FileOptions::default()
            .compression_method(method)
            .last_modified_time(self.last_modified)
            .large_file(self.size >= u32::MAX as u64);
        match self.unix_mode {
            Some(mode) => options.unix_permissions(mode),
            None => options,
        }
    }
}

pub struct ArchiveReader {
    path: PathBuf,
    archive: ZipArchive<BufReader<File>>,
}

impl ArchiveReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SigningError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let archive = ZipArchive::new(BufReader::new(file)).map_err(|err| match err {
            zip::result::ZipError::Io(err) if err.kind() != io::ErrorKind::UnexpectedEof => {
                SigningError::Io(err)
            }
            other => SigningError::ArchiveFormat(format!("{}: {}", path.display(), other)),
        })?;
        Ok(Self { path, archive })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.len() == 0
    }

    /// Entry names in central directory order.
    pub fn names(&mut self) -> Result<Vec<String>, SigningError> {
        let mut names = Vec::with_capacity(self.archive.len());
        for i in 0..self.archive.len() {
            names.push(self.archive.by_index_raw(i)?.name().to_string());
        }
        Ok(names)
    }

    pub fn read_entry(&mut self, name: &str) -> Result<Option<Vec<u8>>, SigningError> {
        let mut file = match self.archive.by_name(name) {
            Ok(file) => file,
            Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut contents = vec![];
        file.read_to_end(&mut contents)?;
        Ok(Some(contents))
    }

    /// Visit every entry in order. Entries rejected by `keep` are skipped and their names
    /// returned; the rest are handed to `visit` with a reader over their decompressed content.
    pub fn for_each_entry(
        &mut self,
        keep: impl Fn(&str) -> bool,
        mut visit: impl FnMut(&EntryMeta, &mut dyn Read) -> Result<(), SigningError>,
    ) -> Result<Vec<String>, SigningError> {
        let mut skipped = vec![];
        for i in 0..self.archive.len() {
            let mut file = self.archive.by_index(i)?;
            let meta = EntryMeta {
                name: file.name().to_string(),
                is_dir: file.is_dir(),
                compression: file.compression(),
                last_modified: file.last_modified(),
                unix_mode: file.unix_mode(),
                size: file.size(),
            };
            if !keep(&meta.name) {
                skipped.push(meta.name);
                continue;
            }
            visit(&meta, &mut file)?;
        }
        Ok(skipped)
    }
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("path", &self.path)
            .field("entries", &self.archive.len())
            .finish_non_exhaustive()
    }
}

pub struct ArchiveWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
}

impl<W: Write + Seek> ArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            zip: ZipWriter::new(inner),
        }
    }

    pub fn add_directory(&mut self, meta: &EntryMeta) -> Result<(), SigningError> {
        self.zip.add_directory(meta.name.as_str(), meta.options())?;
        Ok(())
    }

    /// Copy an entry's content through, showing every chunk to `observe` on the way.
    pub fn copy_entry(
        &mut self,
        meta: &EntryMeta,
        content: &mut dyn Read,
        mut observe: impl FnMut(&[u8]),
    ) -> Result<u64, SigningError> {
        self.zip.start_file(meta.name.as_str(), meta.options())?;
        let mut buf = [0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        loop {
            let n = content.read(&mut buf)?;
            if n == 0 {
                break;
            }
            observe(&buf[..n]);
            self.zip.write_all(&buf[..n])?;
            copied += n as u64;
        }
        Ok(copied)
    }

    /// Append a freshly generated deflated entry.
    pub fn add_file(
        &mut self,
        name: &str,
        contents: &[u8],
        last_modified: DateTime,
    ) -> Result<(), SigningError> {
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(last_modified);
        self.zip.start_file(name, options)?;
        self.zip.write_all(contents)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W, SigningError> {
        Ok(self.zip.finish()?)
    }
}
