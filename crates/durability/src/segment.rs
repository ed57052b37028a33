//! Append-only WAL segment files.
//!
//! Segments are named `.wal_<worker>_<nnnnnn>`. A segment holds framed
//! records back to back with no file header; the chained CRC is seeded
//! afresh (to zero) at each segment start.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// File name for a worker's segment.
pub fn segment_file_name(worker: usize, seq: u64) -> String {
    format!(".wal_{}_{:06}", worker, seq)
}

/// Parse `(worker, seq)` out of a segment file name.
pub fn parse_segment_name(name: &str) -> Option<(usize, u64)> {
    let rest = name.strip_prefix(".wal_")?;
    let (worker, seq) = rest.split_once('_')?;
    Some((worker.parse().ok()?, seq.parse().ok()?))
}

/// Sorted sequence numbers of one worker's segments in `dir`.
pub fn list_segments(dir: &Path, worker: usize) -> std::io::Result<Vec<u64>> {
    let mut seqs = Vec::new();
    if !dir.exists() {
        return Ok(seqs);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some((w, seq)) = parse_segment_name(&name) {
            if w == worker {
                seqs.push(seq);
            }
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

/// One open segment file.
///
/// Only the newest segment of a worker is writable; older ones are
/// immutable and eventually pruned by checkpoint truncation.
#[derive(Debug)]
pub struct WalSegment {
    file: File,
    path: PathBuf,
    seq: u64,
    write_position: u64,
}

impl WalSegment {
    /// Create a fresh segment. Fails if the file already exists.
    pub fn create(dir: &Path, worker: usize, seq: u64) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(segment_file_name(worker, seq));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)?;
        Ok(WalSegment {
            file,
            path,
            seq,
            write_position: 0,
        })
    }

    /// Open an existing segment positioned at its end for appending.
    pub fn open_append(dir: &Path, worker: usize, seq: u64) -> std::io::Result<Self> {
        let path = dir.join(segment_file_name(worker, seq));
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let write_position = file.seek(SeekFrom::End(0))?;
        Ok(WalSegment {
            file,
            path,
            seq,
            write_position,
        })
    }

    /// Read a whole segment into memory.
    pub fn read_all(dir: &Path, worker: usize, seq: u64) -> std::io::Result<Vec<u8>> {
        let path = dir.join(segment_file_name(worker, seq));
        let mut file = OpenOptions::new().read(true).open(&path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Current size in bytes.
    pub fn size(&self) -> u64 {
        self.write_position
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw bytes.
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data)?;
        self.write_position += data.len() as u64;
        Ok(())
    }

    /// Force contents to disk.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }

    /// Cut the file at `position`, discarding a torn tail found on open.
    pub fn truncate(&mut self, position: u64) -> std::io::Result<()> {
        self.file.set_len(position)?;
        self.write_position = position;
        self.file.seek(SeekFrom::Start(position))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn names_roundtrip() {
        assert_eq!(segment_file_name(0, 1), ".wal_0_000001");
        assert_eq!(segment_file_name(3, 42), ".wal_3_000042");
        assert_eq!(parse_segment_name(".wal_3_000042"), Some((3, 42)));
        assert_eq!(parse_segment_name("table.otbx"), None);
        assert_eq!(parse_segment_name(".wal_x_000001"), None);
    }

    #[test]
    fn create_write_reopen() {
        let dir = tempdir().unwrap();
        let mut segment = WalSegment::create(dir.path(), 0, 1).unwrap();
        segment.write(b"hello").unwrap();
        segment.sync().unwrap();
        assert_eq!(segment.size(), 5);
        drop(segment);

        let segment = WalSegment::open_append(dir.path(), 0, 1).unwrap();
        assert_eq!(segment.size(), 5);
        assert_eq!(WalSegment::read_all(dir.path(), 0, 1).unwrap(), b"hello");
    }

    #[test]
    fn listing_filters_by_worker() {
        let dir = tempdir().unwrap();
        WalSegment::create(dir.path(), 0, 2).unwrap();
        WalSegment::create(dir.path(), 0, 1).unwrap();
        WalSegment::create(dir.path(), 1, 5).unwrap();
        assert_eq!(list_segments(dir.path(), 0).unwrap(), vec![1, 2]);
        assert_eq!(list_segments(dir.path(), 1).unwrap(), vec![5]);
        assert!(list_segments(dir.path(), 2).unwrap().is_empty());
    }

    #[test]
    fn truncate_discards_tail() {
        let dir = tempdir().unwrap();
        let mut segment = WalSegment::create(dir.path(), 0, 1).unwrap();
        segment.write(b"keepdrop").unwrap();
        segment.truncate(4).unwrap();
        segment.write(b"!").unwrap();
        drop(segment);
        assert_eq!(WalSegment::read_all(dir.path(), 0, 1).unwrap(), b"keep!");
    }
}
