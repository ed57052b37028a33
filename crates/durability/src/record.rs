//! WAL record format: msgpack payloads in CRC-framed envelopes.
//!
//! # Framing
//!
//! ```text
//! ┌──────────────┬─────────────────────┬────────────────┐
//! │ size: u32 be │ payload (msgpack)   │ crc32c: u32 be │
//! └──────────────┴─────────────────────┴────────────────┘
//! ```
//!
//! `size` counts the payload only; the checksum covers the payload only.
//!
//! # Payload shapes
//!
//! Every payload is a msgpack array starting `[last_crc, wal_id, txn_id]`.
//! `last_crc` chains to the previous record's payload checksum so a reader
//! detects missing or reordered records.
//!
//! | kind            | shape |
//! |-----------------|-------|
//! | COMMIT          | `[last_crc, wal_id, txn_id]` |
//! | DATA            | `[last_crc, wal_id, txn_id, node, params]` |
//! | PHYSICAL_INSERT | `[last_crc, wal_id, txn_id, 2, db, coll, chunk, row_start, row_count]` |
//! | PHYSICAL_DELETE | `[last_crc, wal_id, txn_id, 3, db, coll, row_ids, count]` |
//! | PHYSICAL_UPDATE | `[last_crc, wal_id, txn_id, 4, db, coll, row_ids, new_chunk, count]` |

use byteorder::{BigEndian, ByteOrder};
use otterbrix_core::CollectionName;
use thiserror::Error;

/// Position of a record in the single logical WAL sequence.
pub type WalId = u64;

/// Record kinds. DATA and COMMIT are recognized by array length alone;
/// physical records carry their kind at payload index 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum RecordKind {
    /// Logical plan fragment
    Data = 0,
    /// Transaction commit marker
    Commit = 1,
    /// Raw appended rows
    PhysicalInsert = 2,
    /// Raw deleted row ids
    PhysicalDelete = 3,
    /// Raw replaced rows
    PhysicalUpdate = 4,
}

/// Body of a WAL record, without the sequencing header.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    /// Serialized logical-plan node plus bound parameters.
    Data {
        /// Plan node bytes
        node: Vec<u8>,
        /// Bound parameter bytes
        params: Vec<u8>,
    },
    /// Commit marker for the record's transaction id.
    Commit,
    /// Rows appended to a collection, bypassing planning on replay.
    PhysicalInsert {
        /// Target collection
        collection: CollectionName,
        /// Serialized data chunk
        chunk: Vec<u8>,
        /// First global row id the append produced
        row_start: u64,
        /// Number of rows
        row_count: u64,
    },
    /// Row ids deleted from a collection.
    PhysicalDelete {
        /// Target collection
        collection: CollectionName,
        /// Deleted global row ids
        row_ids: Vec<i64>,
        /// Number of rows
        count: u64,
    },
    /// Rows replaced in a collection: old ids plus their new contents.
    PhysicalUpdate {
        /// Target collection
        collection: CollectionName,
        /// Replaced global row ids
        row_ids: Vec<i64>,
        /// Serialized replacement chunk
        new_chunk: Vec<u8>,
        /// Number of rows
        count: u64,
    },
}

impl RecordBody {
    /// The record kind of this body.
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBody::Data { .. } => RecordKind::Data,
            RecordBody::Commit => RecordKind::Commit,
            RecordBody::PhysicalInsert { .. } => RecordKind::PhysicalInsert,
            RecordBody::PhysicalDelete { .. } => RecordKind::PhysicalDelete,
            RecordBody::PhysicalUpdate { .. } => RecordKind::PhysicalUpdate,
        }
    }

    /// Target collection for physical bodies.
    pub fn collection(&self) -> Option<&CollectionName> {
        match self {
            RecordBody::PhysicalInsert { collection, .. }
            | RecordBody::PhysicalDelete { collection, .. }
            | RecordBody::PhysicalUpdate { collection, .. } => Some(collection),
            _ => None,
        }
    }
}

/// A full WAL record: sequencing header plus body.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    /// Checksum of the previous record's payload in the same segment,
    /// 0 for the first record of a segment
    pub last_crc: u32,
    /// Position in the logical sequence
    pub wal_id: WalId,
    /// Owning transaction, 0 for transaction-less catalog records
    pub txn_id: u64,
    /// Record body
    pub body: RecordBody,
}

/// Codec failures. The first framing or checksum error in a segment ends
/// replay for that segment (torn tail).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalCodecError {
    /// Not enough bytes for a complete frame
    #[error("truncated record")]
    Truncated,

    /// Frame or payload structure is malformed
    #[error("invalid record format: {0}")]
    InvalidFormat(String),

    /// Payload checksum does not match
    #[error("checksum mismatch: stored {stored:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Checksum read from the frame
        stored: u32,
        /// Checksum computed over the payload
        computed: u32,
    },

    /// Physical record kind discriminant is unknown
    #[error("unsupported record kind {0}")]
    UnsupportedKind(u64),
}

type CodecResult<T> = std::result::Result<T, WalCodecError>;

fn bad(e: impl std::fmt::Display) -> WalCodecError {
    WalCodecError::InvalidFormat(e.to_string())
}

fn write_uint(out: &mut Vec<u8>, v: u64) {
    rmp::encode::write_uint(out, v).expect("vec write cannot fail");
}

fn write_bin(out: &mut Vec<u8>, v: &[u8]) {
    rmp::encode::write_bin(out, v).expect("vec write cannot fail");
}

fn write_str(out: &mut Vec<u8>, v: &str) {
    rmp::encode::write_str(out, v).expect("vec write cannot fail");
}

fn read_u64(rd: &mut &[u8]) -> CodecResult<u64> {
    rmp::decode::read_int(rd).map_err(bad)
}

fn read_i64(rd: &mut &[u8]) -> CodecResult<i64> {
    rmp::decode::read_int(rd).map_err(bad)
}

fn read_bin(rd: &mut &[u8]) -> CodecResult<Vec<u8>> {
    let len = rmp::decode::read_bin_len(rd).map_err(bad)? as usize;
    if rd.len() < len {
        return Err(WalCodecError::Truncated);
    }
    let bytes = rd[..len].to_vec();
    *rd = &rd[len..];
    Ok(bytes)
}

fn read_str(rd: &mut &[u8]) -> CodecResult<String> {
    let len = rmp::decode::read_str_len(rd).map_err(bad)? as usize;
    if rd.len() < len {
        return Err(WalCodecError::Truncated);
    }
    let s = std::str::from_utf8(&rd[..len])
        .map_err(bad)?
        .to_string();
    *rd = &rd[len..];
    Ok(s)
}

impl WalRecord {
    /// Serialize the payload (the msgpack array, without framing).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        let header = |out: &mut Vec<u8>, len: u32| {
            rmp::encode::write_array_len(out, len).expect("vec write cannot fail");
            write_uint(out, self.last_crc as u64);
            write_uint(out, self.wal_id);
            write_uint(out, self.txn_id);
        };
        match &self.body {
            RecordBody::Commit => header(&mut out, 3),
            RecordBody::Data { node, params } => {
                header(&mut out, 5);
                write_bin(&mut out, node);
                write_bin(&mut out, params);
            }
            RecordBody::PhysicalInsert {
                collection,
                chunk,
                row_start,
                row_count,
            } => {
                header(&mut out, 9);
                write_uint(&mut out, RecordKind::PhysicalInsert as u64);
                write_str(&mut out, &collection.database);
                write_str(&mut out, &collection.collection);
                write_bin(&mut out, chunk);
                write_uint(&mut out, *row_start);
                write_uint(&mut out, *row_count);
            }
            RecordBody::PhysicalDelete {
                collection,
                row_ids,
                count,
            } => {
                header(&mut out, 8);
                write_uint(&mut out, RecordKind::PhysicalDelete as u64);
                write_str(&mut out, &collection.database);
                write_str(&mut out, &collection.collection);
                rmp::encode::write_array_len(&mut out, row_ids.len() as u32)
                    .expect("vec write cannot fail");
                for id in row_ids {
                    rmp::encode::write_sint(&mut out, *id).expect("vec write cannot fail");
                }
                write_uint(&mut out, *count);
            }
            RecordBody::PhysicalUpdate {
                collection,
                row_ids,
                new_chunk,
                count,
            } => {
                header(&mut out, 9);
                write_uint(&mut out, RecordKind::PhysicalUpdate as u64);
                write_str(&mut out, &collection.database);
                write_str(&mut out, &collection.collection);
                rmp::encode::write_array_len(&mut out, row_ids.len() as u32)
                    .expect("vec write cannot fail");
                for id in row_ids {
                    rmp::encode::write_sint(&mut out, *id).expect("vec write cannot fail");
                }
                write_bin(&mut out, new_chunk);
                write_uint(&mut out, *count);
            }
        }
        out
    }

    /// Serialize the full frame. Returns the bytes and the payload
    /// checksum, which becomes the next record's `last_crc`.
    pub fn to_bytes(&self) -> (Vec<u8>, u32) {
        let payload = self.encode_payload();
        let crc = crc32c::crc32c(&payload);
        let mut frame = Vec::with_capacity(payload.len() + 8);
        let mut size = [0u8; 4];
        BigEndian::write_u32(&mut size, payload.len() as u32);
        frame.extend_from_slice(&size);
        frame.extend_from_slice(&payload);
        let mut crc_bytes = [0u8; 4];
        BigEndian::write_u32(&mut crc_bytes, crc);
        frame.extend_from_slice(&crc_bytes);
        (frame, crc)
    }

    /// Parse one record from the front of `buf`.
    ///
    /// Returns the record, its payload checksum and the bytes consumed.
    pub fn from_bytes(buf: &[u8]) -> CodecResult<(WalRecord, u32, usize)> {
        if buf.len() < 4 {
            return Err(WalCodecError::Truncated);
        }
        let size = BigEndian::read_u32(&buf[..4]) as usize;
        if size == 0 {
            return Err(WalCodecError::InvalidFormat("zero-length record".into()));
        }
        if buf.len() < 4 + size + 4 {
            return Err(WalCodecError::Truncated);
        }
        let payload = &buf[4..4 + size];
        let stored = BigEndian::read_u32(&buf[4 + size..4 + size + 4]);
        let computed = crc32c::crc32c(payload);
        if stored != computed {
            return Err(WalCodecError::ChecksumMismatch { stored, computed });
        }
        let record = Self::decode_payload(payload)?;
        Ok((record, computed, 4 + size + 4))
    }

    fn decode_payload(payload: &[u8]) -> CodecResult<WalRecord> {
        let mut rd = payload;
        let arr_len = rmp::decode::read_array_len(&mut rd).map_err(bad)?;
        let last_crc = read_u64(&mut rd)? as u32;
        let wal_id = read_u64(&mut rd)?;
        let txn_id = read_u64(&mut rd)?;
        let body = match arr_len {
            3 => RecordBody::Commit,
            5 => RecordBody::Data {
                node: read_bin(&mut rd)?,
                params: read_bin(&mut rd)?,
            },
            8 | 9 => {
                let kind = read_u64(&mut rd)?;
                let collection = CollectionName::new(read_str(&mut rd)?, read_str(&mut rd)?);
                match (arr_len, kind) {
                    (9, k) if k == RecordKind::PhysicalInsert as u64 => {
                        RecordBody::PhysicalInsert {
                            collection,
                            chunk: read_bin(&mut rd)?,
                            row_start: read_u64(&mut rd)?,
                            row_count: read_u64(&mut rd)?,
                        }
                    }
                    (8, k) if k == RecordKind::PhysicalDelete as u64 => {
                        let ids_len = rmp::decode::read_array_len(&mut rd).map_err(bad)?;
                        let mut row_ids = Vec::with_capacity(ids_len as usize);
                        for _ in 0..ids_len {
                            row_ids.push(read_i64(&mut rd)?);
                        }
                        RecordBody::PhysicalDelete {
                            collection,
                            row_ids,
                            count: read_u64(&mut rd)?,
                        }
                    }
                    (9, k) if k == RecordKind::PhysicalUpdate as u64 => {
                        let ids_len = rmp::decode::read_array_len(&mut rd).map_err(bad)?;
                        let mut row_ids = Vec::with_capacity(ids_len as usize);
                        for _ in 0..ids_len {
                            row_ids.push(read_i64(&mut rd)?);
                        }
                        RecordBody::PhysicalUpdate {
                            collection,
                            row_ids,
                            new_chunk: read_bin(&mut rd)?,
                            count: read_u64(&mut rd)?,
                        }
                    }
                    (_, k) => return Err(WalCodecError::UnsupportedKind(k)),
                }
            }
            n => {
                return Err(WalCodecError::InvalidFormat(format!(
                    "unexpected array length {}",
                    n
                )))
            }
        };
        Ok(WalRecord {
            last_crc,
            wal_id,
            txn_id,
            body,
        })
    }
}
