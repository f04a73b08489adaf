//! WAL record types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::types::{DataId, TransactionId};

/// Magic bytes identifying a WAL record.
pub const WAL_MAGIC: [u8; 4] = *b"TWAL";

/// Current WAL format version.
pub const WAL_VERSION: u16 = 1;

/// magic (4) + version (2) + tag (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Tag byte of a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalTag {
    /// A transaction started.
    Start = 1,
    /// A chunk of a primary-storage value.
    StoreChunk = 2,
    /// A chunk of a derived index payload.
    IndexChunk = 3,
    /// A primary-storage deletion.
    Delete = 4,
    /// The transaction committed.
    Commit = 5,
    /// The transaction rolled back.
    Rollback = 6,
}

impl WalTag {
    /// Converts a byte to a tag.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Start),
            2 => Some(Self::StoreChunk),
            3 => Some(Self::IndexChunk),
            4 => Some(Self::Delete),
            5 => Some(Self::Commit),
            6 => Some(Self::Rollback),
            _ => None,
        }
    }

    /// Converts the tag to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Position of an entry within the log: ordered by transaction, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey {
    /// Owning transaction.
    pub txid: TransactionId,
    /// Position within the transaction (the Start entry is 0).
    pub seq: u64,
}

impl EntryKey {
    /// Creates an entry key.
    #[must_use]
    pub const fn new(txid: TransactionId, seq: u64) -> Self {
        Self { txid, seq }
    }
}

/// The operation an entry records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalOp {
    /// Transaction start with wall-clock milliseconds since the Unix epoch.
    Start {
        /// Start time, used to reclaim abandoned transactions.
        timestamp_ms: u64,
    },
    /// Part of a primary-storage value. An empty chunk ends the value.
    StoreChunk {
        /// Entity (collection) name.
        entity: String,
        /// Record id.
        id: DataId,
        /// Chunk bytes.
        bytes: Vec<u8>,
    },
    /// Part of a derived index payload. An empty chunk ends the value.
    IndexChunk {
        /// Entity (collection) name.
        entity: String,
        /// Index name.
        index: String,
        /// Record id.
        id: DataId,
        /// Chunk bytes.
        bytes: Vec<u8>,
    },
    /// Deletion of a primary-storage record.
    Delete {
        /// Entity (collection) name.
        entity: String,
        /// Record id.
        id: DataId,
    },
    /// Commit marker.
    Commit,
    /// Rollback marker.
    Rollback,
}

impl WalOp {
    /// Returns the tag for this operation.
    #[must_use]
    pub fn tag(&self) -> WalTag {
        match self {
            Self::Start { .. } => WalTag::Start,
            Self::StoreChunk { .. } => WalTag::StoreChunk,
            Self::IndexChunk { .. } => WalTag::IndexChunk,
            Self::Delete { .. } => WalTag::Delete,
            Self::Commit => WalTag::Commit,
            Self::Rollback => WalTag::Rollback,
        }
    }
}

/// A single WAL entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Where the entry sits in its transaction.
    pub key: EntryKey,
    /// What the entry records.
    pub op: WalOp,
}

impl WalRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(key: EntryKey, op: WalOp) -> Self {
        Self { key, op }
    }

    /// Serializes the payload: varint txid, varint seq, then tag-specific fields.
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_varint(&mut buf, self.key.txid.as_u64());
        put_varint(&mut buf, self.key.seq);

        match &self.op {
            WalOp::Start { timestamp_ms } => put_varint(&mut buf, *timestamp_ms),
            WalOp::StoreChunk { entity, id, bytes } => {
                put_bytes(&mut buf, entity.as_bytes());
                put_varint(&mut buf, id.as_u64());
                put_bytes(&mut buf, bytes);
            }
            WalOp::IndexChunk {
                entity,
                index,
                id,
                bytes,
            } => {
                put_bytes(&mut buf, entity.as_bytes());
                put_bytes(&mut buf, index.as_bytes());
                put_varint(&mut buf, id.as_u64());
                put_bytes(&mut buf, bytes);
            }
            WalOp::Delete { entity, id } => {
                put_bytes(&mut buf, entity.as_bytes());
                put_varint(&mut buf, id.as_u64());
            }
            WalOp::Commit | WalOp::Rollback => {}
        }

        buf
    }

    /// Deserializes a record from its tag and payload.
    pub fn decode_payload(tag: WalTag, payload: &[u8]) -> CoreResult<Self> {
        let mut reader = PayloadReader::new(payload);
        let txid = TransactionId::new(reader.varint()?);
        let seq = reader.varint()?;

        let op = match tag {
            WalTag::Start => WalOp::Start {
                timestamp_ms: reader.varint()?,
            },
            WalTag::StoreChunk => WalOp::StoreChunk {
                entity: reader.string()?,
                id: DataId::new(reader.varint()?),
                bytes: reader.bytes()?.to_vec(),
            },
            WalTag::IndexChunk => WalOp::IndexChunk {
                entity: reader.string()?,
                index: reader.string()?,
                id: DataId::new(reader.varint()?),
                bytes: reader.bytes()?.to_vec(),
            },
            WalTag::Delete => WalOp::Delete {
                entity: reader.string()?,
                id: DataId::new(reader.varint()?),
            },
            WalTag::Commit => WalOp::Commit,
            WalTag::Rollback => WalOp::Rollback,
        };
        reader.finish(tag)?;

        Ok(Self::new(EntryKey::new(txid, seq), op))
    }

    /// Builds the full on-disk frame: header, payload and CRC32.
    pub(crate) fn encode_frame(&self) -> CoreResult<Vec<u8>> {
        let payload = self.encode_payload();
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_argument("WAL record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&WAL_MAGIC);
        data.extend_from_slice(&WAL_VERSION.to_le_bytes());
        data.push(self.op.tag().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);

        let crc = crc32fast::hash(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }
}

/// Validates a frame header and returns the tag and payload length.
///
/// Unknown tags, bad magic and future versions are fatal: the log was
/// written by something this build cannot interpret.
pub(crate) fn parse_header(header: &[u8], offset: u64) -> CoreResult<(WalTag, usize)> {
    if header.len() < HEADER_SIZE || header[0..4] != WAL_MAGIC {
        return Err(CoreError::wal_corruption(format!(
            "invalid magic at offset {offset}"
        )));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version > WAL_VERSION {
        return Err(CoreError::wal_corruption(format!(
            "unsupported version {version} at offset {offset}"
        )));
    }

    let tag = WalTag::from_byte(header[6]).ok_or_else(|| {
        CoreError::wal_corruption(format!(
            "unknown operation tag {} at offset {offset}",
            header[6]
        ))
    })?;

    let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
    Ok((tag, len))
}

/// Verifies the CRC of a complete frame and decodes its record.
pub(crate) fn decode_frame(frame: &[u8], tag: WalTag) -> CoreResult<WalRecord> {
    let body_len = frame.len() - CRC_SIZE;
    let (body, crc) = frame.split_at(body_len);
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(CoreError::ChecksumMismatch { expected, actual });
    }
    WalRecord::decode_payload(tag, &body[HEADER_SIZE..])
}

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

struct PayloadReader<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, pos: 0 }
    }

    fn varint(&mut self) -> CoreResult<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .payload
                .get(self.pos)
                .ok_or_else(|| CoreError::wal_corruption("unexpected end of payload"))?;
            self.pos += 1;
            if shift >= 64 || (shift == 63 && byte > 1) {
                return Err(CoreError::wal_corruption("varint overflow"));
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn bytes(&mut self) -> CoreResult<&'a [u8]> {
        let len = usize::try_from(self.varint()?)
            .map_err(|_| CoreError::wal_corruption("length overflow"))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.payload.len())
            .ok_or_else(|| CoreError::wal_corruption("unexpected end of byte range"))?;
        let bytes = &self.payload[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn string(&mut self) -> CoreResult<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CoreError::wal_corruption("invalid UTF-8 in name"))
    }

    fn finish(&self, tag: WalTag) -> CoreResult<()> {
        if self.pos != self.payload.len() {
            return Err(CoreError::wal_corruption(format!(
                "trailing bytes in {tag:?} record: expected {} bytes, got {}",
                self.pos,
                self.payload.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tx: u64, seq: u64) -> EntryKey {
        EntryKey::new(TransactionId::new(tx), seq)
    }

    #[test]
    fn tag_bytes_are_stable() {
        assert_eq!(WalTag::Start.as_byte(), 1);
        assert_eq!(WalTag::Rollback.as_byte(), 6);
        assert_eq!(WalTag::from_byte(3), Some(WalTag::IndexChunk));
        assert_eq!(WalTag::from_byte(0), None);
        assert_eq!(WalTag::from_byte(7), None);
    }

    #[test]
    fn index_chunk_payload_layout() {
        let record = WalRecord::new(
            key(300, 2),
            WalOp::IndexChunk {
                entity: "user".into(),
                index: "name".into(),
                id: DataId::new(5),
                bytes: vec![0xAA, 0xBB],
            },
        );
        let payload = record.encode_payload();

        // 300 needs two varint bytes
        assert_eq!(&payload[..2], &[0xAC, 0x02]);
        assert_eq!(payload[2], 2);
        assert_eq!(&payload[3..8], &[4, b'u', b's', b'e', b'r']);

        let decoded = WalRecord::decode_payload(WalTag::IndexChunk, &payload).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn empty_chunk_is_representable() {
        let record = WalRecord::new(
            key(1, 4),
            WalOp::StoreChunk {
                entity: "e".into(),
                id: DataId::new(u64::MAX),
                bytes: Vec::new(),
            },
        );
        let decoded =
            WalRecord::decode_payload(WalTag::StoreChunk, &record.encode_payload()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut payload = WalRecord::new(key(1, 9), WalOp::Commit).encode_payload();
        payload.push(0);
        let err = WalRecord::decode_payload(WalTag::Commit, &payload).unwrap_err();
        assert!(matches!(err, CoreError::WalCorruption { .. }));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let payload = WalRecord::new(
            key(1, 1),
            WalOp::Delete {
                entity: "entity".into(),
                id: DataId::new(1),
            },
        )
        .encode_payload();
        let err = WalRecord::decode_payload(WalTag::Delete, &payload[..4]).unwrap_err();
        assert!(matches!(err, CoreError::WalCorruption { .. }));
    }

    #[test]
    fn unknown_tag_in_header_is_fatal() {
        let mut frame = WalRecord::new(key(1, 0), WalOp::Start { timestamp_ms: 1 })
            .encode_frame()
            .unwrap();
        frame[6] = 42;
        let err = parse_header(&frame[..HEADER_SIZE], 0).unwrap_err();
        assert!(err.to_string().contains("unknown operation tag 42"));
    }

    #[test]
    fn corrupted_frame_fails_crc() {
        let mut frame = WalRecord::new(key(1, 0), WalOp::Start { timestamp_ms: 99 })
            .encode_frame()
            .unwrap();
        let last_payload_byte = frame.len() - CRC_SIZE - 1;
        frame[last_payload_byte] ^= 0xFF;

        let (tag, _) = parse_header(&frame, 0).unwrap();
        let err = decode_frame(&frame, tag).unwrap_err();
        assert!(matches!(err, CoreError::ChecksumMismatch { .. }));
    }
}
