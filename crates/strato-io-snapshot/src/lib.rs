//! Deterministic snapshot encoding for emulated device state.
//!
//! The format is a small tag-length-value (TLV) encoding chosen for:
//! - deterministic byte output (fields are emitted in call order)
//! - forward compatibility (unknown tags are skipped on load)
//! - explicit versioning (major/minor) per device

#![forbid(unsafe_code)]

pub mod codec;

use std::collections::BTreeMap;

use thiserror::Error;

pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("snapshot is for device {found:?}, expected {expected:?}")]
    DeviceMismatch { expected: [u8; 4], found: [u8; 4] },
    #[error("snapshot device major version {found} unsupported (expected {supported})")]
    UnsupportedMajor { supported: u16, found: u16 },
    #[error("snapshot truncated")]
    Truncated,
    #[error("trailing bytes after decoding")]
    TrailingBytes,
    #[error("duplicate field tag {0}")]
    DuplicateTag(u16),
    #[error("field tag {tag} has length {len}, expected {expected}")]
    FieldLength { tag: u16, len: usize, expected: usize },
}

/// Device snapshot version, bumped independently of the workspace version.
///
/// A major bump breaks old readers; minor bumps may only add new TLV fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

/// Snapshotting contract for emulated devices.
///
/// Implementations must keep `DEVICE_ID` stable forever and only perform
/// forward-compatible additions within the same major version by adding new
/// TLV fields.
pub trait IoSnapshot {
    const DEVICE_ID: [u8; 4];
    const DEVICE_VERSION: SnapshotVersion;

    fn save_state(&self) -> Vec<u8>;
    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()>;
}

/// Serializes one device: a fixed header followed by tagged fields.
#[derive(Debug)]
pub struct SnapshotWriter {
    buf: Vec<u8>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], version: SnapshotVersion) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&device_id);
        buf.extend_from_slice(&version.major.to_le_bytes());
        buf.extend_from_slice(&version.minor.to_le_bytes());
        Self { buf }
    }

    fn field(&mut self, tag: u16, payload: &[u8]) {
        self.buf.extend_from_slice(&tag.to_le_bytes());
        self.buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(payload);
    }

    pub fn field_u8(&mut self, tag: u16, value: u8) {
        self.field(tag, &[value]);
    }

    pub fn field_u16(&mut self, tag: u16, value: u16) {
        self.field(tag, &value.to_le_bytes());
    }

    pub fn field_u32(&mut self, tag: u16, value: u32) {
        self.field(tag, &value.to_le_bytes());
    }

    pub fn field_u64(&mut self, tag: u16, value: u64) {
        self.field(tag, &value.to_le_bytes());
    }

    pub fn field_bool(&mut self, tag: u16, value: bool) {
        self.field(tag, &[u8::from(value)]);
    }

    pub fn field_bytes(&mut self, tag: u16, payload: Vec<u8>) {
        self.field(tag, &payload);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Parses a device snapshot into a tag-indexed field map.
///
/// Absent tags read back as `None`; fields written by a newer minor version
/// are simply ignored by older readers.
#[derive(Debug)]
pub struct SnapshotReader<'a> {
    version: SnapshotVersion,
    fields: BTreeMap<u16, &'a [u8]>,
}

impl<'a> SnapshotReader<'a> {
    pub fn parse(bytes: &'a [u8], device_id: [u8; 4]) -> SnapshotResult<Self> {
        if bytes.len() < 8 {
            return Err(SnapshotError::Truncated);
        }
        let found = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if found != device_id {
            return Err(SnapshotError::DeviceMismatch {
                expected: device_id,
                found,
            });
        }
        let major = u16::from_le_bytes([bytes[4], bytes[5]]);
        let minor = u16::from_le_bytes([bytes[6], bytes[7]]);

        let mut fields = BTreeMap::new();
        let mut rest = &bytes[8..];
        while !rest.is_empty() {
            if rest.len() < 6 {
                return Err(SnapshotError::Truncated);
            }
            let tag = u16::from_le_bytes([rest[0], rest[1]]);
            let len = u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]) as usize;
            rest = &rest[6..];
            if rest.len() < len {
                return Err(SnapshotError::Truncated);
            }
            if fields.insert(tag, &rest[..len]).is_some() {
                return Err(SnapshotError::DuplicateTag(tag));
            }
            rest = &rest[len..];
        }

        Ok(Self {
            version: SnapshotVersion::new(major, minor),
            fields,
        })
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn ensure_device_major(&self, supported: u16) -> SnapshotResult<()> {
        if self.version.major != supported {
            return Err(SnapshotError::UnsupportedMajor {
                supported,
                found: self.version.major,
            });
        }
        Ok(())
    }

    fn fixed(&self, tag: u16, expected: usize) -> SnapshotResult<Option<&'a [u8]>> {
        match self.fields.get(&tag) {
            None => Ok(None),
            Some(payload) if payload.len() == expected => Ok(Some(payload)),
            Some(payload) => Err(SnapshotError::FieldLength {
                tag,
                len: payload.len(),
                expected,
            }),
        }
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        Ok(self.fixed(tag, 1)?.map(|p| p[0]))
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<Option<u16>> {
        Ok(self
            .fixed(tag, 2)?
            .map(|p| u16::from_le_bytes([p[0], p[1]])))
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        Ok(self
            .fixed(tag, 4)?
            .map(|p| u32::from_le_bytes([p[0], p[1], p[2], p[3]])))
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<Option<u64>> {
        Ok(self.fixed(tag, 8)?.map(|p| {
            u64::from_le_bytes([p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7]])
        }))
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<Option<bool>> {
        Ok(self.fixed(tag, 1)?.map(|p| p[0] != 0))
    }

    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields.get(&tag).copied()
    }
}
