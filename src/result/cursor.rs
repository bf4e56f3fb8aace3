use bson::Document;
use std::collections::VecDeque;
use std::sync::Arc;

use super::description::ColumnTracker;
use super::{ColumnDescription, CursorError, RowShape};
use crate::error::Result;
use crate::executor::RawResult;
use crate::storage::{CursorBatch, DocumentStore};

/// Rows requested per `getMore` and returned by `fetch_many(None)`
pub const DEFAULT_ARRAYSIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Nothing bound yet
    Unbound,
    /// Rows may still be available
    Active,
    /// Every row has been delivered
    Exhausted,
    Closed,
}

/// Paging cursor over a bound result.
///
/// Rows are cached per batch and topped up with `getMore` while the server
/// cursor id is non-zero. Write results carry only an affected count.
pub struct ResultCursor {
    state: CursorState,
    store: Option<Arc<dyn DocumentStore>>,
    shape: RowShape,
    rows: VecDeque<Document>,
    cursor_id: i64,
    namespace: String,
    total_fetched: u64,
    affected: Option<u64>,
    arraysize: usize,
    columns: ColumnTracker,
}

impl ResultCursor {
    pub fn new() -> Self {
        Self {
            state: CursorState::Unbound,
            store: None,
            shape: RowShape::passthrough(),
            rows: VecDeque::new(),
            cursor_id: 0,
            namespace: String::new(),
            total_fetched: 0,
            affected: None,
            arraysize: DEFAULT_ARRAYSIZE,
            columns: ColumnTracker::default(),
        }
    }

    pub fn with_arraysize(mut self, size: usize) -> Self {
        self.arraysize = size.max(1);
        self
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn arraysize(&self) -> usize {
        self.arraysize
    }

    pub fn set_arraysize(&mut self, size: usize) -> std::result::Result<(), CursorError> {
        if size == 0 {
            return Err(CursorError::InvalidArraysize);
        }
        self.arraysize = size;
        Ok(())
    }

    /// Attach a result, releasing whatever was bound before
    pub fn bind(&mut self, raw: RawResult, store: Arc<dyn DocumentStore>) -> Result<()> {
        if self.state == CursorState::Closed {
            return Err(CursorError::Closed.into());
        }
        self.release();
        self.rows.clear();
        self.total_fetched = 0;
        self.columns = ColumnTracker::default();

        match raw {
            RawResult::Cursor { reply, shape } => {
                let batch = CursorBatch::from_reply(&reply)?;
                for (name, tag) in shape.declared_columns() {
                    self.columns.declare(&name, tag);
                }
                self.shape = shape;
                self.affected = None;
                self.namespace = batch.namespace.clone();
                self.cursor_id = batch.id;
                self.store = Some(store);
                self.ingest(batch.documents);
                tracing::debug!(
                    namespace = %self.namespace,
                    cursor_id = self.cursor_id,
                    cached = self.rows.len(),
                    "cursor bound"
                );
            }
            RawResult::Write { affected, .. } => {
                self.shape = RowShape::passthrough();
                self.affected = Some(affected);
                self.cursor_id = 0;
                self.store = Some(store);
            }
        }

        self.state = if self.cursor_id == 0 && self.rows.is_empty() {
            CursorState::Exhausted
        } else {
            CursorState::Active
        };
        Ok(())
    }

    fn ingest(&mut self, documents: Vec<Document>) {
        self.total_fetched += documents.len() as u64;
        for raw in documents {
            let row = self.shape.apply(raw);
            self.columns.observe(&row);
            self.rows.push_back(row);
        }
    }

    fn check_readable(&self) -> Result<()> {
        match self.state {
            CursorState::Closed => Err(CursorError::Closed.into()),
            CursorState::Unbound => Err(CursorError::NoResultSet.into()),
            _ if self.affected.is_some() => Err(CursorError::NoResultSet.into()),
            _ => Ok(()),
        }
    }

    /// Pull the next batch from the server cursor
    fn fill(&mut self) -> Result<()> {
        let Some(store) = self.store.clone() else {
            self.cursor_id = 0;
            return Ok(());
        };
        let batch = store.get_more(&self.namespace, self.cursor_id, Some(self.arraysize as u32))?;
        self.cursor_id = batch.id;
        self.ingest(batch.documents);
        Ok(())
    }

    pub fn fetch_one(&mut self) -> Result<Option<Document>> {
        self.check_readable()?;
        while self.rows.is_empty() && self.cursor_id != 0 {
            self.fill()?;
        }
        match self.rows.pop_front() {
            Some(row) => Ok(Some(row)),
            None => {
                self.state = CursorState::Exhausted;
                Ok(None)
            }
        }
    }

    /// Up to `size` rows, `arraysize` when `None`
    pub fn fetch_many(&mut self, size: Option<usize>) -> Result<Vec<Document>> {
        let size = size.unwrap_or(self.arraysize);
        let mut out = Vec::with_capacity(size.min(self.arraysize));
        while out.len() < size {
            match self.fetch_one()? {
                Some(row) => out.push(row),
                None => break,
            }
        }
        Ok(out)
    }

    pub fn fetch_all(&mut self) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        while let Some(row) = self.fetch_one()? {
            out.push(row);
        }
        Ok(out)
    }

    /// Rows received from the source so far, or the affected count of a write
    pub fn row_count(&self) -> u64 {
        self.affected.unwrap_or(self.total_fetched)
    }

    pub fn description(&self) -> Option<Vec<ColumnDescription>> {
        if self.affected.is_some() || self.columns.is_empty() {
            return None;
        }
        Some(self.columns.describe())
    }

    /// Release the server cursor; later fetches fail
    pub fn close(&mut self) {
        self.release();
        self.rows.clear();
        self.state = CursorState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == CursorState::Closed
    }

    fn release(&mut self) {
        if self.cursor_id == 0 {
            return;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.kill_cursor(&self.namespace, self.cursor_id) {
                tracing::warn!(cursor_id = self.cursor_id, error = %e, "failed to kill server cursor");
            }
        }
        self.cursor_id = 0;
    }
}

impl Default for ResultCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResultCursor {
    fn drop(&mut self) {
        self.release();
    }
}

impl Iterator for ResultCursor {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        self.fetch_one().transpose()
    }
}

impl std::fmt::Debug for ResultCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCursor")
            .field("state", &self.state)
            .field("namespace", &self.namespace)
            .field("cursor_id", &self.cursor_id)
            .field("cached", &self.rows.len())
            .field("total_fetched", &self.total_fetched)
            .field("arraysize", &self.arraysize)
            .finish()
    }
}
