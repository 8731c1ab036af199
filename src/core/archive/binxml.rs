//! Read-only access to the compiled XML format used for `AndroidManifest.xml` inside a package.
//!
//! Only what the identity check needs is decoded: the string pool and the attributes of the
//! `<manifest>` element. Every other chunk is skipped by its declared size.

use crate::core::error::SigningError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Cursor, Read};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ChunkType {
    StringPool = 0x0001,
    Xml = 0x0003,
    XmlStartNamespace = 0x0100,
    XmlEndNamespace = 0x0101,
    XmlStartElement = 0x0102,
    XmlEndElement = 0x0103,
    XmlResourceMap = 0x0180,
}

impl ChunkType {
    pub fn from_u16(ty: u16) -> Option<Self> {
        Some(match ty {
            0x0001 => ChunkType::StringPool,
            0x0003 => ChunkType::Xml,
            0x0100 => ChunkType::XmlStartNamespace,
            0x0101 => ChunkType::XmlEndNamespace,
            0x0102 => ChunkType::XmlStartElement,
            0x0103 => ChunkType::XmlEndElement,
            0x0180 => ChunkType::XmlResourceMap,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResChunkHeader {
    pub ty: u16,
    /// Size of the chunk header in bytes; the chunk's own fields start right after it.
    pub header_size: u16,
    /// Header plus data plus any child chunks.
    pub size: u32,
}

impl ResChunkHeader {
    pub const SIZE: u64 = 8;

    pub fn read(r: &mut impl Read) -> io::Result<Self> {
        let ty = r.read_u16::<LittleEndian>()?;
        let header_size = r.read_u16::<LittleEndian>()?;
        let size = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            ty,
            header_size,
            size,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResStringPoolHeader {
    pub string_count: u32,
    pub style_count: u32,
    pub flags: u32,
    pub strings_start: u32,
    pub styles_start: u32,
}

impl ResStringPoolHeader {
    pub const UTF8_FLAG: u32 = 1 << 8;

    pub fn read(r: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            string_count: r.read_u32::<LittleEndian>()?,
            style_count: r.read_u32::<LittleEndian>()?,
            flags: r.read_u32::<LittleEndian>()?,
            strings_start: r.read_u32::<LittleEndian>()?,
            styles_start: r.read_u32::<LittleEndian>()?,
        })
    }

    pub fn is_utf8(&self) -> bool {
        self.flags & Self::UTF8_FLAG > 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    /// `chunk` spans the whole string pool chunk, starting at its chunk header.
    /// Counts, offsets and lengths are checked against `chunk` before anything is read.
    fn parse(chunk: &[u8], header: ResChunkHeader) -> io::Result<Self> {
        let limit = chunk.len() as u64;
        let mut r = Cursor::new(chunk);
        r.set_position(ResChunkHeader::SIZE);
        let pool = ResStringPoolHeader::read(&mut r)?;
        let offsets_end = header.header_size as u64 + pool.string_count as u64 * 4;
        if offsets_end > limit {
            return Err(invalid("string pool overruns its chunk"));
        }
        r.set_position(header.header_size as u64);
        let mut offsets = Vec::with_capacity(pool.string_count as usize);
        for _ in 0..pool.string_count {
            offsets.push(r.read_u32::<LittleEndian>()?);
        }
        let mut strings = Vec::with_capacity(offsets.len());
        for offset in offsets {
            let start = pool.strings_start as u64 + offset as u64;
            if start >= limit {
                return Err(invalid("string offset out of bounds"));
            }
            r.set_position(start);
            let s = if pool.is_utf8() {
                let _utf16_len = read_utf8_len(&mut r)?;
                let len = read_utf8_len(&mut r)?;
                if r.position() + len as u64 > limit {
                    return Err(invalid("string overruns its chunk"));
                }
                let mut bytes = vec![0; len];
                r.read_exact(&mut bytes)?;
                String::from_utf8_lossy(&bytes).into_owned()
            } else {
                let len = read_utf16_len(&mut r)?;
                if r.position() + len as u64 * 2 > limit {
                    return Err(invalid("string overruns its chunk"));
                }
                let mut units = Vec::with_capacity(len);
                for _ in 0..len {
                    units.push(r.read_u16::<LittleEndian>()?);
                }
                String::from_utf16_lossy(&units)
            };
            strings.push(s);
        }
        Ok(Self { strings })
    }

    pub fn get(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }
}

fn read_utf8_len(r: &mut impl Read) -> io::Result<usize> {
    let first = r.read_u8()? as usize;
    if first & 0x80 != 0 {
        let second = r.read_u8()? as usize;
        Ok(((first & 0x7f) << 8) | second)
    } else {
        Ok(first)
    }
}

fn read_utf16_len(r: &mut impl Read) -> io::Result<usize> {
    let first = r.read_u16::<LittleEndian>()? as usize;
    if first & 0x8000 != 0 {
        let second = r.read_u16::<LittleEndian>()? as usize;
        Ok(((first & 0x7fff) << 16) | second)
    } else {
        Ok(first)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlStartElement {
    pub namespace: u32,
    pub name: u32,
    /// Offset from the start of this structure to the first attribute.
    pub attribute_start: u16,
    pub attribute_size: u16,
    pub attribute_count: u16,
}

impl ResXmlStartElement {
    pub fn read(r: &mut impl Read) -> io::Result<Self> {
        let namespace = r.read_u32::<LittleEndian>()?;
        let name = r.read_u32::<LittleEndian>()?;
        let attribute_start = r.read_u16::<LittleEndian>()?;
        let attribute_size = r.read_u16::<LittleEndian>()?;
        let attribute_count = r.read_u16::<LittleEndian>()?;
        // id, class and style indices
        for _ in 0..3 {
            r.read_u16::<LittleEndian>()?;
        }
        Ok(Self {
            namespace,
            name,
            attribute_start,
            attribute_size,
            attribute_count,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResValue {
    pub data_type: u8,
    pub data: u32,
}

impl ResValue {
    pub const TYPE_STRING: u8 = 0x03;
    pub const TYPE_INT_DEC: u8 = 0x10;
    pub const TYPE_INT_HEX: u8 = 0x11;

    pub fn read(r: &mut impl Read) -> io::Result<Self> {
        let _size = r.read_u16::<LittleEndian>()?;
        let _res0 = r.read_u8()?;
        let data_type = r.read_u8()?;
        let data = r.read_u32::<LittleEndian>()?;
        Ok(Self { data_type, data })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlAttribute {
    pub namespace: u32,
    pub name: u32,
    /// String pool index of the original text, or `NO_ENTRY`.
    pub raw_value: u32,
    pub typed_value: ResValue,
}

impl ResXmlAttribute {
    pub const NO_ENTRY: u32 = 0xFFFF_FFFF;

    pub fn read(r: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            namespace: r.read_u32::<LittleEndian>()?,
            name: r.read_u32::<LittleEndian>()?,
            raw_value: r.read_u32::<LittleEndian>()?,
            typed_value: ResValue::read(r)?,
        })
    }

    fn string<'a>(&self, pool: &'a StringPool) -> Option<&'a str> {
        if self.raw_value != Self::NO_ENTRY {
            return pool.get(self.raw_value);
        }
        match self.typed_value.data_type {
            ResValue::TYPE_STRING => pool.get(self.typed_value.data),
            _ => None,
        }
    }

    fn integer(&self, pool: &StringPool) -> Option<u32> {
        match self.typed_value.data_type {
            ResValue::TYPE_INT_DEC | ResValue::TYPE_INT_HEX => Some(self.typed_value.data),
            _ => self.string(pool).and_then(|s| s.trim().parse().ok()),
        }
    }
}

/// The `<manifest>` attributes that identify a package.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ManifestAttributes {
    pub package: Option<String>,
    pub version_code: Option<u32>,
    pub version_name: Option<String>,
}

pub fn is_binary_xml(bytes: &[u8]) -> bool {
    bytes.len() >= ResChunkHeader::SIZE as usize
        && u16::from_le_bytes([bytes[0], bytes[1]]) == ChunkType::Xml as u16
}

pub fn read_manifest_attributes(bytes: &[u8]) -> Result<ManifestAttributes, SigningError> {
    parse_manifest(bytes).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => {
            SigningError::ArchiveFormat("truncated binary AndroidManifest.xml".to_string())
        }
        _ => SigningError::ArchiveFormat(format!("malformed binary AndroidManifest.xml: {}", err)),
    })
}

fn invalid(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.to_string())
}

fn parse_manifest(bytes: &[u8]) -> io::Result<ManifestAttributes> {
    let mut r = Cursor::new(bytes);
    let root = ResChunkHeader::read(&mut r)?;
    if root.ty != ChunkType::Xml as u16 {
        return Err(invalid("not an XML chunk"));
    }
    let end = (root.size as u64).min(bytes.len() as u64);
    let mut pool = StringPool::default();
    let mut pos = root.header_size as u64;

    while pos + ResChunkHeader::SIZE <= end {
        r.set_position(pos);
        let header = ResChunkHeader::read(&mut r)?;
        let chunk_end = pos + header.size as u64;
        if (header.size as u64) < ResChunkHeader::SIZE || chunk_end > end {
            return Err(invalid("chunk size out of bounds"));
        }
        match ChunkType::from_u16(header.ty) {
            Some(ChunkType::StringPool) => {
                pool = StringPool::parse(&bytes[pos as usize..chunk_end as usize], header)?;
            }
            Some(ChunkType::XmlStartElement) => {
                let body = pos + header.header_size as u64;
                r.set_position(body);
                let element = ResXmlStartElement::read(&mut r)?;
                if pool.get(element.name) == Some("manifest") {
                    return manifest_attributes(&mut r, body, &element, &pool);
                }
            }
            _ => {}
        }
        pos = chunk_end;
    }
    Err(invalid("no <manifest> element"))
}

fn manifest_attributes(
    r: &mut Cursor<&[u8]>,
    body: u64,
    element: &ResXmlStartElement,
    pool: &StringPool,
) -> io::Result<ManifestAttributes> {
    let mut attributes = ManifestAttributes::default();
    for i in 0..element.attribute_count as u64 {
        r.set_position(
            body + element.attribute_start as u64 + i * element.attribute_size as u64,
        );
        let attribute = ResXmlAttribute::read(r)?;
        match pool.get(attribute.name) {
            Some("package") => attributes.package = attribute.string(pool).map(str::to_string),
            Some("versionCode") => attributes.version_code = attribute.integer(pool),
            Some("versionName") => {
                attributes.version_name = attribute.string(pool).map(str::to_string)
            }
            _ => {}
        }
    }
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::compiled_manifest;

    #[test]
    fn should_read_manifest_attributes() {
        let bytes = compiled_manifest("app.example", 42, "2.0.1");
        assert!(is_binary_xml(&bytes));
        let attributes = read_manifest_attributes(&bytes).unwrap();
        assert_eq!(attributes.package.as_deref(), Some("app.example"));
        assert_eq!(attributes.version_code, Some(42));
        assert_eq!(attributes.version_name.as_deref(), Some("2.0.1"));
    }

    #[test]
    fn should_reject_truncated_documents() {
        let bytes = compiled_manifest("app.example", 1, "1.0");
        let err = read_manifest_attributes(&bytes[..bytes.len() - 30]).unwrap_err();
        assert!(matches!(err, SigningError::ArchiveFormat(_)));
    }

    #[test]
    fn should_not_mistake_text_xml_for_binary() {
        assert!(!is_binary_xml(b"<?xml version=\"1.0\"?><manifest/>"));
        assert!(!is_binary_xml(&[0x03, 0x00]));
        assert!(read_manifest_attributes(b"<manifest package=\"a\"/>").is_err());
    }

    /// XML root chunk wrapping one string pool header with no string data.
    fn pool_only_document(string_count: u32, flags: u32, trailer: &[u8]) -> Vec<u8> {
        let pool_size = 28 + trailer.len() as u32;
        let mut bytes: Vec<u8> = vec![];
        bytes.extend_from_slice(&0x0003u16.to_le_bytes());
        bytes.extend_from_slice(&8u16.to_le_bytes());
        bytes.extend_from_slice(&(8 + pool_size).to_le_bytes());
        bytes.extend_from_slice(&0x0001u16.to_le_bytes());
        bytes.extend_from_slice(&28u16.to_le_bytes());
        bytes.extend_from_slice(&pool_size.to_le_bytes());
        bytes.extend_from_slice(&string_count.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&flags.to_le_bytes());
        bytes.extend_from_slice(&28u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(trailer);
        bytes
    }

    #[test]
    fn should_reject_string_counts_larger_than_the_pool() {
        let bytes = pool_only_document(u32::MAX, 0, &[]);
        let err = read_manifest_attributes(&bytes).unwrap_err();
        assert!(matches!(err, SigningError::ArchiveFormat(_)), "{err}");
    }

    #[test]
    fn should_reject_string_lengths_past_the_pool() {
        // One offset pointing at a UTF-16 length prefix claiming 0x7fffffff units.
        let mut trailer = 4u32.to_le_bytes().to_vec();
        trailer.extend_from_slice(&0xffffu16.to_le_bytes());
        trailer.extend_from_slice(&0xffffu16.to_le_bytes());
        let bytes = pool_only_document(1, 0, &trailer);
        let err = read_manifest_attributes(&bytes).unwrap_err();
        assert!(matches!(err, SigningError::ArchiveFormat(_)), "{err}");
    }

    #[test]
    fn should_reject_string_offsets_past_the_pool() {
        let trailer = 0x1000u32.to_le_bytes();
        let bytes = pool_only_document(1, ResStringPoolHeader::UTF8_FLAG, &trailer);
        let err = read_manifest_attributes(&bytes).unwrap_err();
        assert!(matches!(err, SigningError::ArchiveFormat(_)), "{err}");
    }

    #[test]
    fn should_read_utf8_string_pools() {
        // Pool with ["manifest", "package", "app.utf8"] encoded as UTF-8.
        let strings = ["manifest", "package", "app.utf8"];
        let mut data: Vec<u8> = vec![];
        let mut offsets = vec![];
        for s in strings {
            offsets.push(data.len() as u32);
            data.push(s.len() as u8);
            data.push(s.len() as u8);
            data.extend_from_slice(s.as_bytes());
            data.push(0);
        }
        while data.len() % 4 != 0 {
            data.push(0);
        }
        let strings_start = 28 + 4 * strings.len() as u32;
        let mut chunk: Vec<u8> = vec![];
        chunk.extend_from_slice(&0x0001u16.to_le_bytes());
        chunk.extend_from_slice(&28u16.to_le_bytes());
        chunk.extend_from_slice(&(strings_start + data.len() as u32).to_le_bytes());
        chunk.extend_from_slice(&(strings.len() as u32).to_le_bytes());
        chunk.extend_from_slice(&0u32.to_le_bytes());
        chunk.extend_from_slice(&ResStringPoolHeader::UTF8_FLAG.to_le_bytes());
        chunk.extend_from_slice(&strings_start.to_le_bytes());
        chunk.extend_from_slice(&0u32.to_le_bytes());
        for offset in offsets {
            chunk.extend_from_slice(&offset.to_le_bytes());
        }
        chunk.extend_from_slice(&data);

        let mut r = Cursor::new(&chunk[..]);
        let header = ResChunkHeader::read(&mut r).unwrap();
        let pool = StringPool::parse(&chunk, header).unwrap();
        assert_eq!(pool.get(2), Some("app.utf8"));
        assert_eq!(pool.get(3), None);
    }
}
