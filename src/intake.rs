// ABOUTME: Live intake path for one transport leg: deduplicate, persist, track and hand off segments
// ABOUTME: Completion is evaluated only after the triggering segment has been durably stored

use crate::clock::Clock;
use crate::delivery::{DeliveryHandle, InboundMessage};
use crate::error::{IntakeResult, RecordError};
use crate::recovery::PendingGroupState;
use crate::row::{RowId, StoredRow, decode_rows};
use crate::segment::{ReassemblyGroupKey, SegmentRecord};
use crate::store::SegmentStore;
use crate::tracker::{Completion, ReassemblyTracker};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Age after which an incomplete group is given up (30 days)
pub const DEFAULT_PARTIAL_MESSAGE_EXPIRY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Configuration for [`SmsIntake`]
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Check the store for an identical segment before persisting (default: true)
    pub deduplicate: bool,

    /// Partial groups older than this are dropped from memory by
    /// [`SmsIntake::prune_stale`] (default: 30 days)
    pub partial_message_expiry: Duration,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            deduplicate: true,
            partial_message_expiry: DEFAULT_PARTIAL_MESSAGE_EXPIRY,
        }
    }
}

impl IntakeConfig {
    pub fn with_deduplication(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    pub fn with_partial_message_expiry(mut self, expiry: Duration) -> Self {
        self.partial_message_expiry = expiry;
        self
    }
}

/// What happened to one received segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Stored; the group still misses segments
    Pending { received: usize, expected: u32 },
    /// Stored and the complete message was queued for broadcast
    Dispatched(ReassemblyGroupKey),
    /// An identical segment is already stored or was already delivered; nothing stored
    Duplicate,
    /// The segment is corrupt; nothing stored
    Rejected(RecordError),
}

enum Existing {
    None,
    Duplicate,
    Stale(Vec<RowId>),
}

/// Intake for one transport leg
///
/// Each received segment is validated, checked against the store for
/// retransmissions, persisted, and only then fed to the
/// [`ReassemblyTracker`]. When a group completes, its rows are read back
/// from the store and the assembled message is queued on the leg's
/// delivery state machine.
pub struct SmsIntake {
    config: IntakeConfig,
    store: Arc<dyn SegmentStore>,
    tracker: ReassemblyTracker,
    delivery: DeliveryHandle,
    clock: Arc<dyn Clock>,
}

impl SmsIntake {
    pub fn new(
        config: IntakeConfig,
        store: Arc<dyn SegmentStore>,
        delivery: DeliveryHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            tracker: ReassemblyTracker::new(),
            delivery,
            clock,
        }
    }

    /// Handle one received segment
    ///
    /// A record without a receipt time is stamped with the injected clock.
    /// Corrupt records and duplicates are reported through the outcome;
    /// only storage failures and a shut-down delivery queue are errors, in
    /// which case the segment should not be acknowledged to the network.
    pub fn on_segment(&mut self, mut record: SegmentRecord) -> IntakeResult<IntakeOutcome> {
        if let Err(e) = record.index() {
            warn!(key = %record.group_key(), error = %e, "rejecting corrupt segment");
            return Ok(IntakeOutcome::Rejected(e));
        }
        if record.timestamp <= 0 {
            record.timestamp = self.clock.now_millis();
        }

        if self.config.deduplicate {
            match self.find_existing(&record)? {
                Existing::Duplicate => {
                    info!(key = %record.group_key(), sequence = record.sequence_number, "duplicate segment dropped");
                    return Ok(IntakeOutcome::Duplicate);
                }
                Existing::Stale(ids) => {
                    warn!(
                        key = %record.group_key(),
                        sequence = record.sequence_number,
                        "reference reused with a different PDU, replacing stored segment"
                    );
                    for id in ids {
                        self.store.soft_delete_by_id(id)?;
                    }
                }
                Existing::None => {}
            }
        }

        let id = self.store.insert(&record)?;
        if record.is_single_part() {
            let key = record.group_key();
            self.delivery.deliver(InboundMessage::single(id, record))?;
            return Ok(IntakeOutcome::Dispatched(key));
        }

        match self.tracker.on_segment_received(&record) {
            Err(e) => Ok(IntakeOutcome::Rejected(e)),
            Ok(Completion::Incomplete { received, expected }) => {
                Ok(IntakeOutcome::Pending { received, expected })
            }
            Ok(Completion::Complete(key)) => self.complete(key, record.timestamp),
        }
    }

    fn complete(&mut self, key: ReassemblyGroupKey, timestamp: i64) -> IntakeResult<IntakeOutcome> {
        let rows: Vec<StoredRow> = self
            .store
            .query_group(&key)?
            .into_iter()
            .filter(|row| !row.deleted)
            .collect();
        let segments = decode_rows(rows);

        match InboundMessage::assemble(&key, segments.clone()) {
            Ok(message) => {
                self.delivery.deliver(message)?;
                Ok(IntakeOutcome::Dispatched(key))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "tracked group incomplete in store, waiting for more segments");
                let indices: Vec<u32> = segments
                    .iter()
                    .filter_map(|(_, record)| record.index().ok())
                    .collect();
                let first_seen = segments
                    .iter()
                    .map(|(_, record)| record.timestamp)
                    .min()
                    .unwrap_or(timestamp);
                self.tracker.restore(key.clone(), indices, first_seen);
                let received = self
                    .tracker
                    .pending_group(&key)
                    .map_or(0, |group| group.received());
                Ok(IntakeOutcome::Pending {
                    received,
                    expected: key.segment_count,
                })
            }
        }
    }

    fn find_existing(&self, record: &SegmentRecord) -> IntakeResult<Existing> {
        let pdu = hex::encode_upper(&record.pdu);
        let mut stale = Vec::new();

        for row in self.store.query_group(&record.group_key())? {
            if record.is_single_part() {
                if row.pdu == pdu && row.date == record.timestamp {
                    return Ok(Existing::Duplicate);
                }
                continue;
            }
            if row.sequence != record.sequence_number {
                continue;
            }
            if row.pdu == pdu {
                return Ok(Existing::Duplicate);
            }
            if !row.deleted {
                stale.push(row.id);
            }
        }

        if stale.is_empty() {
            Ok(Existing::None)
        } else {
            Ok(Existing::Stale(stale))
        }
    }

    /// Seed the tracker with partial groups left over from a previous run
    ///
    /// Live segments may already have arrived for an adopted group. A group
    /// that is complete once merged is delivered straight away; the keys of
    /// those groups are returned.
    pub fn adopt_pending(
        &mut self,
        groups: impl IntoIterator<Item = PendingGroupState>,
    ) -> IntakeResult<Vec<ReassemblyGroupKey>> {
        let mut dispatched = Vec::new();
        for group in groups {
            debug!(key = %group.key, received = group.indices.len(), "adopting partial group");
            let key = group.key;
            self.tracker.restore(key.clone(), group.indices, group.first_seen);

            let complete = self
                .tracker
                .pending_group(&key)
                .is_some_and(|pending| pending.received() as u64 >= u64::from(key.segment_count));
            if !complete {
                continue;
            }
            let first_seen = self
                .tracker
                .forget(&key)
                .map_or(group.first_seen, |pending| pending.first_seen());
            if let IntakeOutcome::Dispatched(key) = self.complete(key, first_seen)? {
                dispatched.push(key);
            }
        }
        Ok(dispatched)
    }

    /// Drop partial groups whose first segment is older than the configured expiry
    ///
    /// Only in-memory state is dropped; the recovery scan deletes the rows.
    pub fn prune_stale(&mut self) -> Vec<ReassemblyGroupKey> {
        let expiry = i64::try_from(self.config.partial_message_expiry.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_millis().saturating_sub(expiry);
        self.tracker.prune_older_than(cutoff)
    }

    pub fn tracker(&self) -> &ReassemblyTracker {
        &self.tracker
    }

    pub fn delivery(&self) -> &DeliveryHandle {
        &self.delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::delivery::{
        Broadcast, ChannelDispatcher, CountingWakeLock, DeliveryConfig, DeliveryStateMachine,
    };
    use crate::error::{IntakeError, StoreError};
    use crate::segment::Transport;
    use crate::store::MemorySegmentStore;
    use tokio::sync::mpsc;

    const NOW: i64 = 1_700_000_000_000;

    fn setup() -> (SmsIntake, Arc<MemorySegmentStore>, mpsc::UnboundedReceiver<Broadcast>) {
        let store = Arc::new(MemorySegmentStore::new());
        let (dispatcher, broadcasts) = ChannelDispatcher::new();
        let delivery = DeliveryStateMachine::spawn(
            DeliveryConfig::new("gsm"),
            store.clone(),
            dispatcher,
            Arc::new(CountingWakeLock::new("gsm")),
        );
        let intake = SmsIntake::new(
            IntakeConfig::default(),
            store.clone(),
            delivery,
            Arc::new(ManualClock::new(NOW)),
        );
        (intake, store, broadcasts)
    }

    fn part(sequence: i32, count: u32) -> SegmentRecord {
        SegmentRecord::builder(Transport::Gsm3gpp, vec![0xA0, sequence as u8])
            .from("+15550100")
            .timestamp(NOW - 10)
            .part(5, sequence, count)
            .body(format!("part{sequence} "))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_two_part_message_dispatched_on_second_segment() {
        let (mut intake, store, mut broadcasts) = setup();

        assert_eq!(
            intake.on_segment(part(1, 2)).unwrap(),
            IntakeOutcome::Pending { received: 1, expected: 2 }
        );
        assert_eq!(
            intake.on_segment(part(2, 2)).unwrap(),
            IntakeOutcome::Dispatched(part(1, 2).group_key())
        );

        let broadcast = broadcasts.recv().await.unwrap();
        assert_eq!(broadcast.message.segment_count(), 2);
        assert_eq!(broadcast.message.body.as_deref(), Some("part1 part2 "));
        assert_eq!(store.live_count().unwrap(), 2);

        broadcast.ack.complete();
        intake.delivery().wait_until(|s| s.completed == 1).await;
        assert_eq!(store.live_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_segment_is_not_stored_twice() {
        let (mut intake, store, mut broadcasts) = setup();

        intake.on_segment(part(2, 2)).unwrap();
        assert_eq!(intake.on_segment(part(2, 2)).unwrap(), IntakeOutcome::Duplicate);
        assert_eq!(store.live_count().unwrap(), 1);

        assert!(matches!(intake.on_segment(part(1, 2)).unwrap(), IntakeOutcome::Dispatched(_)));
        let broadcast = broadcasts.recv().await.unwrap();
        assert_eq!(broadcast.message.row_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_without_dedup_still_waits_for_missing_segment() {
        let (intake, store, mut broadcasts) = setup();
        let mut intake = SmsIntake {
            config: IntakeConfig::default().with_deduplication(false),
            ..intake
        };

        intake.on_segment(part(2, 2)).unwrap();
        assert_eq!(
            intake.on_segment(part(2, 2)).unwrap(),
            IntakeOutcome::Pending { received: 1, expected: 2 }
        );
        assert!(matches!(intake.on_segment(part(1, 2)).unwrap(), IntakeOutcome::Dispatched(_)));

        let broadcast = broadcasts.recv().await.unwrap();
        assert_eq!(broadcast.message.segment_count(), 2);
        assert_eq!(broadcast.message.row_ids.len(), 3);
        broadcast.ack.complete();
        intake.delivery().wait_until(|s| s.completed == 1).await;
        assert_eq!(store.live_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retransmission_after_delivery_is_duplicate() {
        let (mut intake, _store, mut broadcasts) = setup();
        intake.on_segment(part(1, 2)).unwrap();
        intake.on_segment(part(2, 2)).unwrap();
        broadcasts.recv().await.unwrap().ack.complete();
        intake.delivery().wait_until(|s| s.completed == 1).await;

        assert_eq!(intake.on_segment(part(2, 2)).unwrap(), IntakeOutcome::Duplicate);
        assert!(intake.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_reused_reference_replaces_stale_segment() {
        let (mut intake, store, mut broadcasts) = setup();
        intake.on_segment(part(1, 2)).unwrap();

        let replacement = SegmentRecord {
            pdu: vec![0xB0, 0x01].into(),
            message_body: Some("new ".to_string()),
            ..part(1, 2)
        };
        assert_eq!(
            intake.on_segment(replacement).unwrap(),
            IntakeOutcome::Pending { received: 1, expected: 2 }
        );
        assert_eq!(store.live_count().unwrap(), 1);

        intake.on_segment(part(2, 2)).unwrap();
        let broadcast = broadcasts.recv().await.unwrap();
        assert_eq!(broadcast.message.body.as_deref(), Some("new part2 "));
    }

    #[tokio::test]
    async fn test_corrupt_segment_is_rejected_before_storage() {
        let (mut intake, store, _broadcasts) = setup();
        let outcome = intake.on_segment(part(3, 2)).unwrap();
        assert!(matches!(outcome, IntakeOutcome::Rejected(RecordError::CorruptIndex { .. })));
        assert_eq!(store.live_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_single_part_dispatched_immediately_and_stamped() {
        let (mut intake, store, mut broadcasts) = setup();
        let record = SegmentRecord::builder(Transport::Gsm3gpp, vec![0x11])
            .from("+15550100")
            .body("hello")
            .build()
            .unwrap();

        assert!(matches!(intake.on_segment(record.clone()).unwrap(), IntakeOutcome::Dispatched(_)));
        let broadcast = broadcasts.recv().await.unwrap();
        assert_eq!(broadcast.message.timestamp, NOW);
        assert_eq!(store.all_rows().unwrap()[0].date, NOW);

        // same PDU at the same receipt time is a retransmission
        assert_eq!(intake.on_segment(record).unwrap(), IntakeOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_adopted_group_completes_with_live_segment() {
        let (mut intake, store, mut broadcasts) = setup();
        store.insert(&part(1, 2)).unwrap();
        let adopted = intake
            .adopt_pending(vec![PendingGroupState {
                key: part(1, 2).group_key(),
                indices: vec![0],
                first_seen: NOW - 10,
            }])
            .unwrap();
        assert!(adopted.is_empty());

        assert!(matches!(intake.on_segment(part(2, 2)).unwrap(), IntakeOutcome::Dispatched(_)));
        assert_eq!(broadcasts.recv().await.unwrap().message.segment_count(), 2);
    }

    #[tokio::test]
    async fn test_adopting_group_completed_by_live_segment_dispatches_it() {
        let (mut intake, store, mut broadcasts) = setup();
        // segment 1 stored by the previous run, segment 2 arrives before recovery finishes
        store.insert(&part(1, 2)).unwrap();
        assert_eq!(
            intake.on_segment(part(2, 2)).unwrap(),
            IntakeOutcome::Pending { received: 1, expected: 2 }
        );

        let key = part(1, 2).group_key();
        let adopted = intake
            .adopt_pending(vec![PendingGroupState {
                key: key.clone(),
                indices: vec![0],
                first_seen: NOW - 10,
            }])
            .unwrap();
        assert_eq!(adopted, vec![key.clone()]);
        assert!(!intake.tracker().is_tracking(&key));

        let broadcast = broadcasts.recv().await.unwrap();
        assert_eq!(broadcast.message.segment_count(), 2);
        assert_eq!(broadcast.message.body.as_deref(), Some("part1 part2 "));
        broadcast.ack.complete();
        intake.delivery().wait_until(|s| s.completed == 1).await;

        // a retransmission afterwards is recognized rather than re-tracked
        assert_eq!(intake.on_segment(part(2, 2)).unwrap(), IntakeOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_single_part_with_zero_sequence_is_dispatched() {
        let (mut intake, _store, mut broadcasts) = setup();
        let record = SegmentRecord::builder(Transport::Gsm3gpp, vec![0x12])
            .from("+15550100")
            .part(crate::segment::SINGLE_PART_REFERENCE, 0, 1)
            .body("seq zero")
            .build()
            .unwrap();

        assert!(matches!(intake.on_segment(record).unwrap(), IntakeOutcome::Dispatched(_)));
        let broadcast = broadcasts.recv().await.unwrap();
        assert_eq!(broadcast.message.body.as_deref(), Some("seq zero"));
    }

    #[tokio::test]
    async fn test_completion_with_rows_missing_from_store_keeps_waiting() {
        let (mut intake, _store, _broadcasts) = setup();
        // tracker believes index 0 arrived but the store never saw it
        intake
            .adopt_pending(vec![PendingGroupState {
                key: part(1, 2).group_key(),
                indices: vec![0],
                first_seen: NOW - 10,
            }])
            .unwrap();

        assert_eq!(
            intake.on_segment(part(2, 2)).unwrap(),
            IntakeOutcome::Pending { received: 1, expected: 2 }
        );
        assert!(matches!(intake.on_segment(part(1, 2)).unwrap(), IntakeOutcome::Dispatched(_)));
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error() {
        let store = Arc::new(MemorySegmentStore::locked());
        let (dispatcher, _broadcasts) = ChannelDispatcher::new();
        let delivery = DeliveryStateMachine::spawn(
            DeliveryConfig::default(),
            store.clone(),
            dispatcher,
            Arc::new(CountingWakeLock::new("gsm")),
        );
        let mut intake = SmsIntake::new(
            IntakeConfig::default(),
            store,
            delivery,
            Arc::new(ManualClock::new(NOW)),
        );
        assert!(matches!(
            intake.on_segment(part(1, 2)),
            Err(IntakeError::Store(StoreError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_prune_stale_drops_expired_partial_groups() {
        let (mut intake, _store, _broadcasts) = setup();
        let old = SegmentRecord {
            timestamp: NOW - 31 * 24 * 60 * 60 * 1000,
            reference_number: 9,
            ..part(1, 2)
        };
        intake.on_segment(old.clone()).unwrap();
        intake.on_segment(part(1, 2)).unwrap();

        assert_eq!(intake.prune_stale(), vec![old.group_key()]);
        assert_eq!(intake.tracker().len(), 1);
    }
}
