//! Journal entry types and framing

use crate::column::{BucketRow, DataRow};
use crate::{Result, StoreError, Timestamp};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Journal entry type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalEntryType {
    /// Bucket counter upsert
    UpsertBucket = 1,
    /// Bulk insert of message rows
    InsertRows = 2,
}

impl TryFrom<u8> for JournalEntryType {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(JournalEntryType::UpsertBucket),
            2 => Ok(JournalEntryType::InsertRows),
            _ => Err(StoreError::InvalidFormat(format!(
                "Invalid journal entry type: {}",
                value
            ))),
        }
    }
}

/// One journaled mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalEntry {
    /// A bucket row was inserted or overwritten
    UpsertBucket(BucketRow),
    /// A batch of rows was inserted; `expires_at` is wall-clock millis
    InsertRows {
        rows: Vec<DataRow>,
        expires_at: Option<Timestamp>,
    },
}

impl JournalEntry {
    pub fn entry_type(&self) -> JournalEntryType {
        match self {
            JournalEntry::UpsertBucket(_) => JournalEntryType::UpsertBucket,
            JournalEntry::InsertRows { .. } => JournalEntryType::InsertRows,
        }
    }

    /// Encode the entry with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: frame length (excluding this field)
    /// - 1 byte: entry type
    /// - 4 bytes: payload length
    /// - N bytes: bincode payload
    /// - 4 bytes: CRC32 of type and payload
    pub fn encode(&self) -> Result<Bytes> {
        let payload = bincode::serialize(self)
            .map_err(|e| StoreError::InvalidFormat(e.to_string()))?;

        let mut buf = BytesMut::with_capacity(payload.len() + 13);
        buf.put_u32_le(0);
        buf.put_u8(self.entry_type() as u8);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);

        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        Ok(buf.freeze())
    }

    /// Decode one framed entry, returning it and the bytes consumed
    ///
    /// Returns `Ok(None)` for a torn frame at the end of the data.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = (&data[..4]).get_u32_le() as usize;
        if len < 9 {
            return Err(StoreError::Corruption(format!("journal frame too short: {}", len)));
        }
        if data.len() < 4 + len {
            return Ok(None);
        }

        let frame = &data[4..4 + len];
        let (body, mut trailer) = frame.split_at(len - 4);
        let expected = trailer.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(StoreError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let entry_type = JournalEntryType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_u32_le() as usize;
        if cursor.len() != payload_len {
            return Err(StoreError::Corruption(format!(
                "journal payload length {} does not match frame ({} bytes)",
                payload_len,
                cursor.len()
            )));
        }

        let entry: JournalEntry = bincode::deserialize(cursor)
            .map_err(|e| StoreError::InvalidFormat(e.to_string()))?;
        if entry.entry_type() != entry_type {
            return Err(StoreError::Corruption("journal entry type tag mismatch".into()));
        }

        Ok(Some((entry, 4 + len)))
    }
}
