// ABOUTME: Durable segment store interface shared by the live intake path and the recovery scanner
// ABOUTME: Exports the store trait and an in-memory implementation that keeps the persisted row layout

//! Segment Store Module
//!
//! The reassembly engine never touches files itself. Every persisted
//! segment goes through a [`SegmentStore`], supplied by the host:
//!
//! * `insert` - persist one segment and return its row id
//! * `query_non_deleted` - every live row, in no particular order
//! * `query_group` - every row of one concatenation group, soft-deleted ones included
//! * `soft_delete_by_id` - mark a row deleted after its message was broadcast
//! * `hard_delete_by_key` - permanently remove an expired group
//!
//! Implementations must make group deletion atomic with respect to queries,
//! so a recovery scan never observes a half-deleted group.

pub mod memory;

pub use memory::MemorySegmentStore;

use crate::error::StoreResult;
use crate::row::{RowId, StoredRow};
use crate::segment::{ReassemblyGroupKey, SegmentRecord};

/// Durable storage for received segments
pub trait SegmentStore: Send + Sync {
    /// Persist `record` and return the id of the new row
    fn insert(&self, record: &SegmentRecord) -> StoreResult<RowId>;

    /// Every row not marked deleted
    ///
    /// The returned rows are a snapshot; calling again restarts the sequence.
    fn query_non_deleted(&self) -> StoreResult<Vec<StoredRow>>;

    /// Every row belonging to the group identified by `key`
    ///
    /// Soft-deleted rows are included (check [`StoredRow::deleted`]) so the
    /// intake path can recognise retransmissions of already delivered segments.
    fn query_group(&self, key: &ReassemblyGroupKey) -> StoreResult<Vec<StoredRow>>;

    /// Mark a row deleted without removing it
    fn soft_delete_by_id(&self, id: RowId) -> StoreResult<()>;

    /// Permanently remove every row of a group, deleted or not
    ///
    /// Returns the number of rows removed.
    fn hard_delete_by_key(&self, key: &ReassemblyGroupKey) -> StoreResult<usize>;
}
