// ABOUTME: Delivery module serializing broadcast of reassembled messages under a wake-lock
// ABOUTME: Exports the state machine, its handle, dispatcher and wake-lock interfaces and the router

//! Delivery Module
//!
//! Complete messages leave the reassembly engine through a
//! [`DeliveryStateMachine`], one per transport leg. The machine runs on its
//! own Tokio task and processes events strictly in arrival order:
//!
//! * **new message** - dispatched when idle, deferred while a broadcast is outstanding
//! * **broadcast complete** - the outstanding message's rows are deleted and the next deferred message goes out
//! * **broadcast abandoned** - the ack was dropped; rows are kept and the next deferred message goes out
//! * **release wake-lock** - fired 3000 ms after every return to idle
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sms_inbound::delivery::{
//!     ChannelDispatcher, CountingWakeLock, DeliveryConfig, DeliveryStateMachine,
//! };
//! use sms_inbound::store::MemorySegmentStore;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let (dispatcher, mut broadcasts) = ChannelDispatcher::new();
//! let handle = DeliveryStateMachine::spawn(
//!     DeliveryConfig::new("gsm"),
//!     Arc::new(MemorySegmentStore::new()),
//!     dispatcher,
//!     Arc::new(CountingWakeLock::new("sms-inbound")),
//! );
//!
//! while let Some(broadcast) = broadcasts.recv().await {
//!     println!("received {} segments", broadcast.message.segment_count());
//!     broadcast.ack.complete();
//! }
//! # handle.shutdown().await.ok();
//! # }
//! ```

pub mod dispatcher;
pub mod machine;
pub mod message;
pub mod router;
pub mod wakelock;

pub use dispatcher::{Broadcast, BroadcastAck, BroadcastDispatcher, ChannelDispatcher};
pub use machine::{
    DEFAULT_WAKE_LOCK_RELEASE_DELAY, DeliveryConfig, DeliveryHandle, DeliveryState,
    DeliveryStateMachine, DeliveryStats,
};
pub use message::InboundMessage;
pub use router::TransportRouter;
pub use wakelock::{CountingWakeLock, WakeLock};
