// ABOUTME: Inbound SMS reassembly, deduplication and wake-lock guarded delivery sequencing
// ABOUTME: Crate root wiring the segment model, store, tracker, intake, recovery and delivery modules

pub mod clock;
pub mod delivery;
pub mod error;
pub mod intake;
pub mod recovery;
pub mod row;
pub mod segment;
pub mod store;
pub mod tracker;


use std::sync::Arc;

// Re-export the types most hosts need to wire up a transport leg
pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{
    Broadcast, BroadcastAck, BroadcastDispatcher, ChannelDispatcher, CountingWakeLock,
    DeliveryConfig, DeliveryHandle, DeliveryState, DeliveryStateMachine, DeliveryStats,
    InboundMessage, TransportRouter, WakeLock,
};
pub use error::{
    DeliveryError, DispatchError, IntakeError, IntakeResult, RecordError, StoreError, StoreResult,
};
pub use intake::{IntakeConfig, IntakeOutcome, SmsIntake};
pub use recovery::{PendingGroupState, RecoveryConfig, RecoveryReport, RecoveryScanner};
pub use row::{RowId, StoredRow};
pub use segment::{ReassemblyGroupKey, SegmentRecord, Transport};
pub use store::{MemorySegmentStore, SegmentStore};
pub use tracker::{Completion, ReassemblyTracker};

/// Wire one transport leg: delivery state machine plus intake
///
/// # Examples
///
/// ## Receiving a two-part message
///
/// ```rust,no_run
/// use sms_inbound::{
///     ChannelDispatcher, CountingWakeLock, MemorySegmentStore, SegmentRecord, SystemClock,
///     Transport, spawn_leg,
/// };
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (dispatcher, mut broadcasts) = ChannelDispatcher::new();
///     let mut intake = spawn_leg(
///         Transport::Gsm3gpp,
///         Arc::new(MemorySegmentStore::new()),
///         dispatcher,
///         Arc::new(CountingWakeLock::new("sms-inbound")),
///         Arc::new(SystemClock),
///     );
///
///     for sequence in [2, 1] {
///         let segment = SegmentRecord::builder(Transport::Gsm3gpp, vec![0x00, sequence as u8])
///             .from("+15550100")
///             .part(5, sequence, 2)
///             .build()?;
///         println!("{:?}", intake.on_segment(segment)?);
///     }
///
///     let broadcast = broadcasts.recv().await.ok_or("delivery stopped")?;
///     println!("{} segments from {}", broadcast.message.segment_count(), broadcast.message.key);
///     broadcast.ack.complete();
///     Ok(())
/// }
/// ```
pub fn spawn_leg(
    transport: Transport,
    store: Arc<dyn SegmentStore>,
    dispatcher: impl BroadcastDispatcher,
    wake_lock: Arc<dyn WakeLock>,
    clock: Arc<dyn Clock>,
) -> SmsIntake {
    let delivery = DeliveryStateMachine::spawn(
        DeliveryConfig::new(format!("{transport}-inbound")),
        store.clone(),
        dispatcher,
        wake_lock,
    );
    SmsIntake::new(IntakeConfig::default(), store, delivery, clock)
}
