// ABOUTME: Recovery scan run once storage is accessible: re-dispatches complete groups left from a prior run
// ABOUTME: Rebuilds partial group state and permanently deletes incomplete groups past their expiry

use crate::clock::Clock;
use crate::delivery::{InboundMessage, TransportRouter};
use crate::error::StoreResult;
use crate::intake::DEFAULT_PARTIAL_MESSAGE_EXPIRY;
use crate::row::RowId;
use crate::segment::{ReassemblyGroupKey, SegmentRecord};
use crate::store::SegmentStore;
use crate::tracker::{Completion, ReassemblyTracker};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for [`RecoveryScanner`]
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Incomplete groups whose first scanned segment is at least this old are deleted (default: 30 days)
    pub partial_message_expiry: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            partial_message_expiry: DEFAULT_PARTIAL_MESSAGE_EXPIRY,
        }
    }
}

impl RecoveryConfig {
    pub fn with_partial_message_expiry(mut self, expiry: Duration) -> Self {
        self.partial_message_expiry = expiry;
        self
    }
}

/// A partial group found by the scan and kept for later completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGroupState {
    pub key: ReassemblyGroupKey,
    /// Zero-based indices already stored, ascending
    pub indices: Vec<u32>,
    pub first_seen: i64,
}

/// Summary of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub rows_scanned: usize,
    /// Messages queued on a delivery leg
    pub dispatched: usize,
    /// Complete messages no leg accepted; their rows stay stored
    pub undelivered: usize,
    /// Rows skipped because they do not decode or their index is out of range
    pub corrupt_rows: usize,
    /// Groups deleted for being incomplete past the expiry
    pub expired_groups: Vec<ReassemblyGroupKey>,
    pub rows_deleted: usize,
    /// Partial groups still waiting for segments
    pub pending: Vec<PendingGroupState>,
}

/// Scans the segment store for work left over from an earlier run
///
/// * single-part rows are dispatched straight away
/// * multi-part rows are grouped by key; complete groups are dispatched
/// * an incomplete group whose first scanned segment is older than the
///   expiry is permanently deleted, unless it completes during the scan
///
/// Dispatched messages go through the same per-transport delivery queues
/// as live traffic. The scan does blocking storage I/O, so run it with
/// [`RecoveryScanner::spawn`] rather than on a delivery task.
pub struct RecoveryScanner {
    config: RecoveryConfig,
    store: Arc<dyn SegmentStore>,
    router: TransportRouter,
    clock: Arc<dyn Clock>,
}

impl RecoveryScanner {
    pub fn new(
        config: RecoveryConfig,
        store: Arc<dyn SegmentStore>,
        router: TransportRouter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            router,
            clock,
        }
    }

    /// Run the scan on Tokio's blocking pool
    pub fn spawn(self) -> JoinHandle<StoreResult<RecoveryReport>> {
        tokio::task::spawn_blocking(move || self.scan())
    }

    /// Run one recovery pass
    ///
    /// A failure to read the store aborts the pass before anything is
    /// dispatched or deleted.
    pub fn scan(&self) -> StoreResult<RecoveryReport> {
        let rows = self.store.query_non_deleted().map_err(|e| {
            error!(error = %e, "recovery scan aborted, segment store unreadable");
            e
        })?;

        let expiry = i64::try_from(self.config.partial_message_expiry.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_millis().saturating_sub(expiry);

        let mut report = RecoveryReport::default();
        let mut tracker = ReassemblyTracker::new();
        let mut groups: HashMap<ReassemblyGroupKey, Vec<(RowId, SegmentRecord)>> = HashMap::new();
        let mut completed: Vec<ReassemblyGroupKey> = Vec::new();
        let mut completed_keys: HashSet<ReassemblyGroupKey> = HashSet::new();

        for row in rows {
            report.rows_scanned += 1;
            let record = match row.to_record() {
                Ok(record) => record,
                Err(e) => {
                    warn!(id = row.id, error = %e, "skipping undecodable row");
                    report.corrupt_rows += 1;
                    continue;
                }
            };

            if record.is_single_part() {
                self.dispatch(InboundMessage::single(row.id, record), &mut report);
                continue;
            }

            let key = record.group_key();
            if completed_keys.contains(&key) {
                // late duplicate of a group that already completed in this pass
                groups.entry(key).or_default().push((row.id, record));
                continue;
            }

            let first_seen = !tracker.is_tracking(&key);
            let completion = match tracker.on_segment_received(&record) {
                Ok(completion) => completion,
                Err(_) => {
                    report.corrupt_rows += 1;
                    continue;
                }
            };
            if first_seen && record.timestamp <= cutoff {
                tracker.mark_expire_candidate(&key);
            }
            groups.entry(key).or_default().push((row.id, record));

            if let Completion::Complete(key) = completion {
                completed_keys.insert(key.clone());
                completed.push(key);
            }
        }

        for key in completed {
            let segments = groups.remove(&key).unwrap_or_default();
            match InboundMessage::assemble(&key, segments) {
                Ok(message) => self.dispatch(message, &mut report),
                Err(e) => warn!(key = %key, error = %e, "recovered group failed to assemble"),
            }
        }

        let mut expired = Vec::new();
        for (key, group) in tracker.pending_groups() {
            if group.is_expire_candidate() {
                expired.push(key.clone());
            } else {
                report.pending.push(PendingGroupState {
                    key: key.clone(),
                    indices: group.indices().collect(),
                    first_seen: group.first_seen(),
                });
            }
        }
        expired.sort();
        report.pending.sort_by(|a, b| a.key.cmp(&b.key));

        for key in expired {
            match self.store.hard_delete_by_key(&key) {
                Ok(removed) => {
                    debug!(key = %key, removed, "deleted expired partial group");
                    report.rows_deleted += removed;
                    report.expired_groups.push(key);
                }
                Err(e) => warn!(key = %key, error = %e, "failed to delete expired partial group"),
            }
        }

        info!(
            scanned = report.rows_scanned,
            dispatched = report.dispatched,
            undelivered = report.undelivered,
            expired = report.expired_groups.len(),
            pending = report.pending.len(),
            corrupt = report.corrupt_rows,
            "recovery scan finished"
        );
        Ok(report)
    }

    fn dispatch(&self, message: InboundMessage, report: &mut RecoveryReport) {
        let key = message.key.clone();
        match self.router.route(message) {
            Ok(()) => {
                debug!(key = %key, "recovered message queued");
                report.dispatched += 1;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "recovered message not delivered");
                report.undelivered += 1;
            }
        }
    }
}
