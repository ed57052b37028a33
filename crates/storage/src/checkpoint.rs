//! `table.otbx` checkpoint files.
//!
//! A checkpoint is a point-in-time durable image of one disk-backed
//! collection, written with the write-fsync-rename pattern so either the
//! complete new file is visible or the old one still is.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────┬────────────────┐
//! │ magic "OTBX" │ version: u32 be│
//! ├──────────────┴────────────────┤
//! │ body_len: u64 be              │
//! │ body (bincode)                │
//! │ body crc32c: u32 be           │
//! ├───────────────────────────────┤
//! │ footer_len: u32 be            │
//! │ footer (bincode)              │
//! │ footer crc32c: u32 be         │
//! └───────────────────────────────┘
//! ```
//!
//! The footer carries the wal watermark: recovery replays only records
//! with `wal_id` above it.

use crate::table::TableStore;
use byteorder::{BigEndian, ByteOrder};
use otterbrix_core::{
    CollectionName, Error, Result, Schema, Value, NOT_DELETED, TXN_BASE,
};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

/// Magic bytes identifying a checkpoint file.
pub const OTBX_MAGIC: [u8; 4] = *b"OTBX";

/// Current checkpoint format version.
pub const OTBX_FORMAT_VERSION: u32 = 1;

/// Checkpoint file name inside a collection directory.
pub const OTBX_FILE_NAME: &str = "table.otbx";

/// Index definition carried through the checkpoint so disk-backed
/// collections keep their indexes across truncated WALs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Index name
    pub name: String,
    /// Key column path
    pub column: String,
    /// Unique flag
    pub unique: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointRow {
    insert_id: u64,
    delete_id: u64,
    values: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointBody {
    rows: Vec<CheckpointRow>,
    indexes: Vec<IndexMeta>,
}

/// Trailer of a checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFooter {
    /// Highest wal id whose effects the checkpoint includes
    pub max_wal_id: u64,
    /// Column schema at checkpoint time
    pub schema: Schema,
    /// Number of rows in the body
    pub row_count: u64,
}

/// Writes checkpoint images.
pub struct CheckpointWriter;

impl CheckpointWriter {
    /// Dump `table` as visible at `safe_ts` into `dir/table.otbx`.
    ///
    /// Rows inserted by still-active transactions are excluded and
    /// uncommitted delete stamps are normalized back to live; both will
    /// be re-established by WAL replay if their transaction commits.
    pub fn write(dir: &Path, table: &TableStore, safe_ts: u64, max_wal_id: u64) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        let mut rows = Vec::new();
        for group in table.row_groups() {
            for slot in 0..group.cardinality() {
                let versions = group.versions();
                if versions.is_dead(slot) {
                    continue;
                }
                let insert_id = versions.insert_id(slot);
                if insert_id >= safe_ts {
                    continue;
                }
                let delete_id = versions.delete_id(slot);
                if delete_id < safe_ts && delete_id < TXN_BASE {
                    // Deleted below the horizon: gone for every reader.
                    continue;
                }
                let delete_id = if delete_id >= TXN_BASE && delete_id != NOT_DELETED {
                    NOT_DELETED
                } else {
                    delete_id
                };
                rows.push(CheckpointRow {
                    insert_id,
                    delete_id,
                    values: group.row(slot),
                });
            }
        }

        let indexes = table
            .indexes()
            .indexes()
            .iter()
            .map(|i| IndexMeta {
                name: i.name().to_string(),
                column: i.column().to_string(),
                unique: i.is_unique(),
            })
            .collect();

        let footer = CheckpointFooter {
            max_wal_id,
            schema: table.schema().clone(),
            row_count: rows.len() as u64,
        };
        let body = CheckpointBody { rows, indexes };
        let body_bytes = bincode::serialize(&body)?;
        let footer_bytes = bincode::serialize(&footer)?;

        let mut out = Vec::with_capacity(body_bytes.len() + footer_bytes.len() + 32);
        out.extend_from_slice(&OTBX_MAGIC);
        let mut scratch4 = [0u8; 4];
        let mut scratch8 = [0u8; 8];
        BigEndian::write_u32(&mut scratch4, OTBX_FORMAT_VERSION);
        out.extend_from_slice(&scratch4);
        BigEndian::write_u64(&mut scratch8, body_bytes.len() as u64);
        out.extend_from_slice(&scratch8);
        out.extend_from_slice(&body_bytes);
        BigEndian::write_u32(&mut scratch4, crc32c::crc32c(&body_bytes));
        out.extend_from_slice(&scratch4);
        BigEndian::write_u32(&mut scratch4, footer_bytes.len() as u32);
        out.extend_from_slice(&scratch4);
        out.extend_from_slice(&footer_bytes);
        BigEndian::write_u32(&mut scratch4, crc32c::crc32c(&footer_bytes));
        out.extend_from_slice(&scratch4);

        // Write-fsync-rename keeps the previous image intact on a crash.
        let final_path = dir.join(OTBX_FILE_NAME);
        let temp_path = dir.join(".table.otbx.tmp");
        let _ = std::fs::remove_file(&temp_path);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        file.write_all(&out)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp_path, &final_path)?;
        if let Ok(dir_handle) = std::fs::File::open(dir) {
            let _ = dir_handle.sync_all();
        }

        info!(
            collection = %table.name(),
            rows = footer.row_count,
            max_wal_id,
            "checkpoint published"
        );
        Ok(())
    }
}

/// Reads checkpoint images back into table stores.
pub struct CheckpointReader;

impl CheckpointReader {
    /// Read the footer and rebuild a table store from `dir/table.otbx`.
    ///
    /// Returns `Ok(None)` when no checkpoint exists. Any structural or
    /// checksum failure is a `Corruption` error; the caller degrades the
    /// collection to empty with a logged warning instead of crashing.
    pub fn load(dir: &Path, name: CollectionName) -> Result<Option<(TableStore, CheckpointFooter)>> {
        let path = dir.join(OTBX_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let (body, footer) = Self::parse(&bytes)?;

        let mut table = TableStore::new(name, footer.schema.clone());
        for meta in &body.indexes {
            table
                .indexes_mut()
                .create_index(&meta.name, &meta.column, meta.unique)?;
        }
        for row in &body.rows {
            let chunk = otterbrix_core::DataChunk::from_rows(
                footer.schema.types(),
                std::slice::from_ref(&row.values),
            )?;
            let ids = table.append(&chunk, row.insert_id)?;
            if row.delete_id != NOT_DELETED {
                table.delete(&ids, row.delete_id)?;
            }
        }
        debug!(rows = body.rows.len(), "checkpoint loaded");
        Ok(Some((table, footer)))
    }

    fn parse(bytes: &[u8]) -> Result<(CheckpointBody, CheckpointFooter)> {
        let corrupt = |what: &str| Error::Corruption(format!("checkpoint: {}", what));
        if bytes.len() < 16 {
            return Err(corrupt("file too short"));
        }
        if bytes[..4] != OTBX_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = BigEndian::read_u32(&bytes[4..8]);
        if version != OTBX_FORMAT_VERSION {
            return Err(corrupt(&format!("unsupported version {}", version)));
        }
        let body_len = BigEndian::read_u64(&bytes[8..16]) as usize;
        let body_end = 16 + body_len;
        if bytes.len() < body_end + 4 {
            return Err(corrupt("truncated body"));
        }
        let body_bytes = &bytes[16..body_end];
        let stored = BigEndian::read_u32(&bytes[body_end..body_end + 4]);
        if stored != crc32c::crc32c(body_bytes) {
            return Err(corrupt("body checksum mismatch"));
        }

        let footer_start = body_end + 4;
        if bytes.len() < footer_start + 4 {
            return Err(corrupt("missing footer"));
        }
        let footer_len = BigEndian::read_u32(&bytes[footer_start..footer_start + 4]) as usize;
        let footer_end = footer_start + 4 + footer_len;
        if bytes.len() < footer_end + 4 {
            return Err(corrupt("truncated footer"));
        }
        let footer_bytes = &bytes[footer_start + 4..footer_end];
        let stored = BigEndian::read_u32(&bytes[footer_end..footer_end + 4]);
        if stored != crc32c::crc32c(footer_bytes) {
            return Err(corrupt("footer checksum mismatch"));
        }

        let body: CheckpointBody =
            bincode::deserialize(body_bytes).map_err(|e| corrupt(&e.to_string()))?;
        let footer: CheckpointFooter =
            bincode::deserialize(footer_bytes).map_err(|e| corrupt(&e.to_string()))?;
        if footer.row_count != body.rows.len() as u64 {
            return Err(corrupt("row count mismatch"));
        }
        Ok((body, footer))
    }
}
