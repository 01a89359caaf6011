// ABOUTME: Reassembly tracker deciding when every segment of a concatenated SMS has arrived
// ABOUTME: Tracks distinct segment indices per group key so duplicates never cause early completion

use crate::error::RecordError;
use crate::segment::{ReassemblyGroupKey, SegmentRecord};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Result of feeding one segment to the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// More segments are needed before the message can be delivered
    Incomplete { received: usize, expected: u32 },
    /// Every segment of the group has been seen
    ///
    /// The tracker keeps no segment bodies; for multi-part groups the
    /// caller reads the siblings back from the segment store.
    Complete(ReassemblyGroupKey),
}

/// In-memory state of a partially received group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGroup {
    received: BTreeSet<u32>,
    /// Timestamp of the first segment seen for this group
    first_seen: i64,
    /// Old enough to be deleted if the group never completes
    expire_candidate: bool,
}

impl PendingGroup {
    fn new(first_seen: i64) -> Self {
        Self {
            received: BTreeSet::new(),
            first_seen,
            expire_candidate: false,
        }
    }

    /// Zero-based indices received so far, ascending
    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.received.iter().copied()
    }

    pub fn received(&self) -> usize {
        self.received.len()
    }

    pub fn first_seen(&self) -> i64 {
        self.first_seen
    }

    pub fn is_expire_candidate(&self) -> bool {
        self.expire_candidate
    }
}

/// Groups arriving segments by [`ReassemblyGroupKey`] and reports completion
///
/// Completion requires `segment_count` *distinct* indices. A retransmitted
/// segment is recognised by its index and never counted twice, so a group
/// cannot complete while a different segment is still missing.
///
/// # Example
///
/// ```rust
/// use sms_inbound::segment::{SegmentRecord, Transport};
/// use sms_inbound::tracker::{Completion, ReassemblyTracker};
///
/// let mut tracker = ReassemblyTracker::new();
/// let first = SegmentRecord::builder(Transport::Gsm3gpp, vec![0x01])
///     .from("+15550100")
///     .part(5, 1, 2)
///     .build()
///     .unwrap();
/// let second = SegmentRecord { sequence_number: 2, ..first.clone() };
///
/// assert!(matches!(tracker.on_segment_received(&first), Ok(Completion::Incomplete { .. })));
/// assert_eq!(
///     tracker.on_segment_received(&second).unwrap(),
///     Completion::Complete(first.group_key())
/// );
/// ```
#[derive(Debug, Default)]
pub struct ReassemblyTracker {
    pending: HashMap<ReassemblyGroupKey, PendingGroup>,
}

impl ReassemblyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one received segment
    ///
    /// Single-part records complete immediately. Records whose index is out
    /// of range for their group are rejected with
    /// [`RecordError::CorruptIndex`] and leave the tracker untouched.
    pub fn on_segment_received(&mut self, record: &SegmentRecord) -> Result<Completion, RecordError> {
        let key = record.group_key();
        if record.is_single_part() {
            return Ok(Completion::Complete(key));
        }

        let index = match record.index() {
            Ok(index) => index,
            Err(e) => {
                warn!(key = %key, error = %e, "rejecting corrupt segment");
                return Err(e);
            }
        };

        let expected = record.segment_count;
        let group = self
            .pending
            .entry(key.clone())
            .or_insert_with(|| PendingGroup::new(record.timestamp));

        if !group.received.insert(index) {
            warn!(key = %key, index, "duplicate segment ignored");
        }
        group.first_seen = group.first_seen.min(record.timestamp);

        let received = group.received.len();
        if received as u64 >= u64::from(expected) {
            self.pending.remove(&key);
            debug!(key = %key, "all {} segments received", expected);
            Ok(Completion::Complete(key))
        } else {
            debug!(key = %key, received, expected, "segment recorded");
            Ok(Completion::Incomplete { received, expected })
        }
    }

    /// Whether a partial group is currently tracked for `key`
    pub fn is_tracking(&self, key: &ReassemblyGroupKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_group(&self, key: &ReassemblyGroupKey) -> Option<&PendingGroup> {
        self.pending.get(key)
    }

    /// Flag a tracked group as eligible for expiry-deletion
    ///
    /// Returns false when the key is not tracked.
    pub fn mark_expire_candidate(&mut self, key: &ReassemblyGroupKey) -> bool {
        match self.pending.get_mut(key) {
            Some(group) => {
                group.expire_candidate = true;
                true
            }
            None => false,
        }
    }

    /// Seed a partial group, for example with indices found by a recovery scan
    ///
    /// Indices outside `[0, segment_count)` are ignored. Existing state for
    /// the key is merged rather than replaced.
    pub fn restore(&mut self, key: ReassemblyGroupKey, indices: impl IntoIterator<Item = u32>, first_seen: i64) {
        let count = key.segment_count;
        let group = self
            .pending
            .entry(key)
            .or_insert_with(|| PendingGroup::new(first_seen));
        group.first_seen = group.first_seen.min(first_seen);
        group.received.extend(indices.into_iter().filter(|index| *index < count));
    }

    /// Drop tracking state for `key`
    pub fn forget(&mut self, key: &ReassemblyGroupKey) -> Option<PendingGroup> {
        self.pending.remove(key)
    }

    /// Drop every partial group whose first segment arrived before `cutoff`
    ///
    /// Returns the keys that were dropped so the caller can delete their rows.
    pub fn prune_older_than(&mut self, cutoff: i64) -> Vec<ReassemblyGroupKey> {
        let stale: Vec<ReassemblyGroupKey> = self
            .pending
            .iter()
            .filter(|(_, group)| group.first_seen < cutoff)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.pending.remove(key);
        }
        if !stale.is_empty() {
            debug!("pruned {} stale partial groups", stale.len());
        }
        stale
    }

    /// Iterate over every partial group
    pub fn pending_groups(&self) -> impl Iterator<Item = (&ReassemblyGroupKey, &PendingGroup)> {
        self.pending.iter()
    }

    /// Number of partial groups being tracked
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
