//! The result cursor handed back to sessions.

use otterbrix_core::{Error, ErrorCode, Value};

/// A snapshot-bound, restartable sequence of typed row batches.
///
/// The snapshot is fixed when the cursor is materialized; later commits
/// never change its contents. User errors travel through the cursor as
/// `(code, what)` instead of crashing the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    affected: usize,
    position: usize,
    error: Option<(ErrorCode, String)>,
    start_ts: u64,
}

impl Cursor {
    /// Successful cursor with no rows, reporting `affected` mutated rows.
    pub fn ok(affected: usize) -> Self {
        Cursor {
            columns: Vec::new(),
            rows: Vec::new(),
            affected,
            position: 0,
            error: None,
            start_ts: 0,
        }
    }

    /// Successful cursor over materialized rows.
    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<Value>>, start_ts: u64) -> Self {
        Cursor {
            columns,
            affected: rows.len(),
            rows,
            position: 0,
            error: None,
            start_ts,
        }
    }

    /// Error cursor carrying the code and description of a failure.
    pub fn from_error(error: &Error) -> Self {
        Cursor {
            columns: Vec::new(),
            rows: Vec::new(),
            affected: 0,
            position: 0,
            error: Some((error.code(), error.what())),
            start_ts: 0,
        }
    }

    /// Whether the cursor carries an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether the operation succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Error code, `None` when there is no error.
    pub fn code(&self) -> ErrorCode {
        self.error
            .as_ref()
            .map(|(code, _)| *code)
            .unwrap_or(ErrorCode::None)
    }

    /// Error description, empty on success.
    pub fn what(&self) -> &str {
        self.error.as_ref().map(|(_, what)| what.as_str()).unwrap_or("")
    }

    /// Output column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Total row count.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the cursor holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows mutated by a DML statement (row count for reads).
    pub fn affected(&self) -> usize {
        self.affected
    }

    /// Snapshot the rows were read at.
    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    /// All rows.
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// One row by position.
    pub fn row(&self, index: usize) -> Option<&[Value]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Next batch of at most `size` rows; `None` once exhausted.
    pub fn next_batch(&mut self, size: usize) -> Option<&[Vec<Value>]> {
        if self.position >= self.rows.len() {
            return None;
        }
        let start = self.position;
        let end = (start + size).min(self.rows.len());
        self.position = end;
        Some(&self.rows[start..end])
    }

    /// Restart batch iteration from the beginning.
    pub fn rewind(&mut self) {
        self.position = 0;
    }
}
