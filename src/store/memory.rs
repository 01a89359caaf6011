// ABOUTME: In-memory SegmentStore keeping rows in their persisted column layout behind one mutex
// ABOUTME: Models storage that is inaccessible until unlock so recovery failure paths can be exercised

use crate::error::{StoreError, StoreResult};
use crate::row::{RowId, StoredRow};
use crate::segment::{ReassemblyGroupKey, SegmentRecord};
use crate::store::SegmentStore;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct Table {
    rows: Vec<StoredRow>,
    next_id: RowId,
    locked: bool,
}

impl Table {
    fn check_unlocked(&self) -> StoreResult<()> {
        if self.locked {
            return Err(StoreError::Unavailable("storage locked".to_string()));
        }
        Ok(())
    }
}

/// Segment store backed by a vector of [`StoredRow`]s
///
/// Rows are kept in their on-disk form (hex PDU, packed port flags), so
/// every read goes through the same decoding a database-backed store
/// would. A single mutex serializes all operations, which makes group
/// deletion atomic with respect to queries.
#[derive(Debug, Default)]
pub struct MemorySegmentStore {
    table: Mutex<Table>,
}

impl MemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects every operation until [`unlock`](Self::unlock)
    pub fn locked() -> Self {
        let store = Self::default();
        if let Ok(mut table) = store.table.lock() {
            table.locked = true;
        }
        store
    }

    /// Make the store accessible
    pub fn unlock(&self) -> StoreResult<()> {
        self.table.lock().map_err(|_| StoreError::Poisoned)?.locked = false;
        Ok(())
    }

    /// Insert a raw row as-is, keeping its id when it is not already taken
    ///
    /// Used to load rows written by an earlier process, including rows
    /// that no longer decode.
    pub fn insert_row(&self, mut row: StoredRow) -> StoreResult<RowId> {
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        table.check_unlocked()?;
        if table.rows.iter().any(|existing| existing.id == row.id) {
            row.id = table.next_id;
        }
        table.next_id = table.next_id.max(row.id + 1);
        let id = row.id;
        table.rows.push(row);
        Ok(id)
    }

    /// Every row including soft-deleted ones
    pub fn all_rows(&self) -> StoreResult<Vec<StoredRow>> {
        let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(table.rows.clone())
    }

    /// Number of rows not marked deleted
    pub fn live_count(&self) -> StoreResult<usize> {
        let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(table.rows.iter().filter(|row| !row.deleted).count())
    }
}

impl SegmentStore for MemorySegmentStore {
    fn insert(&self, record: &SegmentRecord) -> StoreResult<RowId> {
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        table.check_unlocked()?;
        let id = table.next_id;
        let row = StoredRow::from_record(id, record)?;
        table.next_id += 1;
        table.rows.push(row);
        debug!(id, key = %record.group_key(), "segment persisted");
        Ok(id)
    }

    fn query_non_deleted(&self) -> StoreResult<Vec<StoredRow>> {
        let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        table.check_unlocked()?;
        Ok(table.rows.iter().filter(|row| !row.deleted).cloned().collect())
    }

    fn query_group(&self, key: &ReassemblyGroupKey) -> StoreResult<Vec<StoredRow>> {
        let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        table.check_unlocked()?;
        Ok(table
            .rows
            .iter()
            .filter(|row| row.matches_key(key))
            .cloned()
            .collect())
    }

    fn soft_delete_by_id(&self, id: RowId) -> StoreResult<()> {
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        table.check_unlocked()?;
        let row = table
            .rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(StoreError::UnknownRow(id))?;
        row.deleted = true;
        Ok(())
    }

    fn hard_delete_by_key(&self, key: &ReassemblyGroupKey) -> StoreResult<usize> {
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        table.check_unlocked()?;
        let before = table.rows.len();
        table.rows.retain(|row| !row.matches_key(key));
        let removed = before - table.rows.len();
        debug!(key = %key, removed, "group permanently deleted");
        Ok(removed)
    }
}
