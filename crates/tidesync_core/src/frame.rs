//! Checksummed frame envelope shared by the record table and the change log.
//!
//! ```text
//! magic (4) | version (2) | kind (1) | length (4) | CBOR body (length) | crc32 (4)
//! ```
//!
//! The CRC covers everything before it. Integers are little-endian.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tidesync_storage::StorageBackend;

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// A decoded frame envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawFrame {
    /// Offset of the frame's first byte.
    pub offset: u64,
    /// Frame kind tag.
    pub kind: u8,
    /// CBOR body.
    pub body: Vec<u8>,
}

impl RawFrame {
    /// Total encoded size of this frame.
    pub fn encoded_len(&self) -> u64 {
        (HEADER_SIZE + self.body.len() + CRC_SIZE) as u64
    }

    /// Decodes the body.
    pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<T> {
        ciborium::from_reader(self.body.as_slice()).map_err(|e| {
            CoreError::codec(format!("frame at offset {}: {e}", self.offset))
        })
    }
}

/// Encodes `body` into a complete frame.
pub(crate) fn encode_frame<T: Serialize>(magic: [u8; 4], kind: u8, body: &T) -> CoreResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(body, &mut payload).map_err(|e| CoreError::codec(e.to_string()))?;

    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::invalid_operation("frame body exceeds 4 GiB"))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&magic);
    data.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    data.push(kind);
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&payload);

    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());

    Ok(data)
}

/// Reads the complete frame starting at `offset`.
///
/// Used for point lookups, where a short read is corruption rather than a
/// torn tail.
pub(crate) fn read_frame_at(
    backend: &dyn StorageBackend,
    magic: [u8; 4],
    offset: u64,
) -> CoreResult<RawFrame> {
    let header = backend.read_at(offset, HEADER_SIZE)?;
    let (kind, len) = parse_header(&header, magic, offset)?;
    let rest = backend.read_at(offset + HEADER_SIZE as u64, len + CRC_SIZE)?;
    finish_frame(offset, header, rest, kind, len)
}

fn parse_header(header: &[u8], magic: [u8; 4], offset: u64) -> CoreResult<(u8, usize)> {
    if header[0..4] != magic {
        return Err(CoreError::corrupted(format!(
            "bad frame magic at offset {offset}"
        )));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FRAME_VERSION {
        return Err(CoreError::corrupted(format!(
            "unsupported frame version {version} at offset {offset}"
        )));
    }

    let kind = header[6];
    let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
    Ok((kind, len))
}

fn finish_frame(
    offset: u64,
    mut data: Vec<u8>,
    rest: Vec<u8>,
    kind: u8,
    len: usize,
) -> CoreResult<RawFrame> {
    data.extend_from_slice(&rest[..len]);
    let stored = u32::from_le_bytes([rest[len], rest[len + 1], rest[len + 2], rest[len + 3]]);
    let actual = compute_crc32(&data);

    if stored != actual {
        return Err(CoreError::ChecksumMismatch {
            offset,
            expected: stored,
            actual,
        });
    }

    Ok(RawFrame {
        offset,
        kind,
        body: data.split_off(HEADER_SIZE),
    })
}

/// Sequential reader used when a store file is opened.
///
/// A frame cut short by the end of the file is a torn write: iteration stops
/// and [`FrameReader::valid_end`] reports where the intact prefix ends so the
/// caller can truncate it away. A complete frame with a bad checksum or magic
/// is corruption and is returned as an error.
pub(crate) struct FrameReader<'a> {
    backend: &'a dyn StorageBackend,
    magic: [u8; 4],
    offset: u64,
    size: u64,
    finished: bool,
}

impl<'a> FrameReader<'a> {
    /// Starts reading at offset 0.
    pub fn new(backend: &'a dyn StorageBackend, magic: [u8; 4]) -> CoreResult<Self> {
        let size = backend.size()?;
        Ok(Self {
            backend,
            magic,
            offset: 0,
            size,
            finished: false,
        })
    }

    /// Offset just past the last intact frame read so far.
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    /// Size of the underlying storage when the reader was created.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn read_next(&mut self) -> CoreResult<Option<RawFrame>> {
        let remaining = self.size - self.offset;
        if remaining < HEADER_SIZE as u64 {
            return Ok(None);
        }

        let header = self.backend.read_at(self.offset, HEADER_SIZE)?;
        let (kind, len) = parse_header(&header, self.magic, self.offset)?;

        if remaining < (HEADER_SIZE + len + CRC_SIZE) as u64 {
            return Ok(None);
        }

        let rest = self
            .backend
            .read_at(self.offset + HEADER_SIZE as u64, len + CRC_SIZE)?;
        let frame = finish_frame(self.offset, header, rest, kind, len)?;
        self.offset += frame.encoded_len();
        Ok(Some(frame))
    }
}

impl Iterator for FrameReader<'_> {
    type Item = CoreResult<RawFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_storage::InMemoryBackend;

    const MAGIC: [u8; 4] = *b"TEST";

    fn backend_with(frames: &[(u8, &str)]) -> InMemoryBackend {
        let mut backend = InMemoryBackend::new();
        for (kind, body) in frames {
            let bytes = encode_frame(MAGIC, *kind, body).unwrap();
            backend.append(&bytes).unwrap();
        }
        backend
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn reads_frames_in_order() {
        let backend = backend_with(&[(1, "first"), (2, "second")]);
        let frames: Vec<_> = FrameReader::new(&backend, MAGIC)
            .unwrap()
            .collect::<CoreResult<_>>()
            .unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, 1);
        assert_eq!(frames[1].decode::<String>().unwrap(), "second");
        assert_eq!(frames[1].offset, frames[0].encoded_len());
    }

    #[test]
    fn point_read() {
        let backend = backend_with(&[(1, "first"), (2, "second")]);
        let second_offset = encode_frame(MAGIC, 1, &"first").unwrap().len() as u64;

        let frame = read_frame_at(&backend, MAGIC, second_offset).unwrap();
        assert_eq!(frame.kind, 2);
        assert_eq!(frame.decode::<String>().unwrap(), "second");
    }

    #[test]
    fn torn_tail_ends_iteration() {
        let backend = backend_with(&[(1, "kept")]);
        let intact = backend.size().unwrap();
        let torn = encode_frame(MAGIC, 2, &"lost").unwrap();
        let mut writer = backend.clone();
        writer.append(&torn[..torn.len() - 3]).unwrap();

        let mut reader = FrameReader::new(&backend, MAGIC).unwrap();
        assert!(reader.next().unwrap().is_ok());
        assert!(reader.next().is_none());
        assert_eq!(reader.valid_end(), intact);
        assert!(reader.size() > intact);
    }

    #[test]
    fn checksum_mismatch_is_corruption() {
        let backend = backend_with(&[(1, "payload")]);
        backend.corrupt_byte(HEADER_SIZE + 2);

        let mut reader = FrameReader::new(&backend, MAGIC).unwrap();
        assert!(matches!(
            reader.next(),
            Some(Err(CoreError::ChecksumMismatch { offset: 0, .. }))
        ));
        assert!(reader.next().is_none());
    }

    #[test]
    fn wrong_magic_is_corruption() {
        let backend = backend_with(&[(1, "payload")]);
        let result = FrameReader::new(&backend, *b"XXXX").unwrap().next();
        assert!(matches!(result, Some(Err(CoreError::Corrupted { .. }))));
    }
}
