// ABOUTME: Wake-lock guarded delivery state machine serializing broadcast of reassembled messages
// ABOUTME: Runs on one Tokio task fed by an event channel so exactly one broadcast is outstanding

use crate::delivery::dispatcher::{BroadcastAck, BroadcastDispatcher};
use crate::delivery::message::InboundMessage;
use crate::delivery::wakelock::WakeLock;
use crate::error::DeliveryError;
use crate::store::SegmentStore;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay between entering [`DeliveryState::Idle`] and dropping one wake-lock reference
pub const DEFAULT_WAKE_LOCK_RELEASE_DELAY: Duration = Duration::from_millis(3000);

/// Configuration for a delivery state machine
///
/// # Example
///
/// ```rust
/// use sms_inbound::delivery::DeliveryConfig;
/// use std::time::Duration;
///
/// let config = DeliveryConfig::new("gsm-inbound")
///     .with_release_delay(Duration::from_millis(500));
/// assert_eq!(config.name, "gsm-inbound");
/// ```
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Name used in logs and errors, typically one per transport leg
    pub name: String,

    /// How long the wake-lock stays held after the machine goes idle (default: 3000 ms)
    ///
    /// A message arriving within this window re-enters the waiting state
    /// without the lock ever being dropped.
    pub wake_lock_release_delay: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            name: "sms-delivery".to_string(),
            wake_lock_release_delay: DEFAULT_WAKE_LOCK_RELEASE_DELAY,
        }
    }
}

impl DeliveryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_release_delay(mut self, delay: Duration) -> Self {
        self.wake_lock_release_delay = delay;
        self
    }
}

/// States of the delivery state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryState {
    /// Nothing in flight; the next message is dispatched immediately
    #[default]
    Idle,
    /// One broadcast outstanding; new messages are deferred
    Waiting,
}

/// Snapshot of machine progress, published after every event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub state: DeliveryState,
    /// Messages handed to the dispatcher
    pub dispatched: u64,
    /// Broadcasts acknowledged by the dispatcher
    pub completed: u64,
    /// Messages the dispatcher refused
    pub failed: u64,
    /// Broadcasts whose acknowledgment was dropped without completing
    pub abandoned: u64,
    /// Messages dropped because they were already queued, in flight or delivered
    pub skipped: u64,
    /// Messages currently deferred behind the outstanding broadcast
    pub deferred: usize,
    /// False once the machine has shut down
    pub running: bool,
}

/// Events processed by the machine, strictly in arrival order
#[derive(Debug)]
pub(crate) enum DeliveryEvent {
    NewMessage(InboundMessage),
    BroadcastComplete(u64),
    BroadcastAbandoned(u64),
    ReleaseWakeLock,
    Shutdown(oneshot::Sender<()>),
}

impl DeliveryEvent {
    fn name(&self) -> &'static str {
        match self {
            DeliveryEvent::NewMessage(_) => "NewMessage",
            DeliveryEvent::BroadcastComplete(_) => "BroadcastComplete",
            DeliveryEvent::BroadcastAbandoned(_) => "BroadcastAbandoned",
            DeliveryEvent::ReleaseWakeLock => "ReleaseWakeLock",
            DeliveryEvent::Shutdown(_) => "Shutdown",
        }
    }
}

/// Sequencer dispatching one complete message at a time
///
/// ## State diagram
///
/// ```text
///            new message                      new message
///   Idle ----------------------> Waiting <-----------------+ (deferred)
///    ^                             |   |                    |
///    |  broadcast complete/abandoned |   +--------------------+
///    +-----------------------------+
/// ```
///
/// ## Duplicates
///
/// A recovery scan and live intake can both produce the same message. A
/// message sharing a row with the broadcast in flight or with a deferred
/// message is dropped on arrival, and one whose rows are already deleted
/// is dropped instead of being dispatched.
///
/// ## Wake-lock discipline
///
/// The lock is acquired once at creation and again on every exit from
/// `Idle`. Every entry into `Idle` schedules one delayed release. Because
/// releases are matched one-for-one with acquires, a message arriving
/// before the delay expires keeps the lock held through the next broadcast.
/// Shutdown releases the lock completely regardless of its count.
///
/// ## Unhandled events
///
/// An event the current state does not handle (a broadcast-complete while
/// idle that no broadcast ever issued) panics in debug builds and is logged
/// and dropped in release builds. Acknowledgments of earlier broadcasts,
/// such as the one dropped by a failed dispatch, are ignored.
pub struct DeliveryStateMachine {
    config: DeliveryConfig,
    state: DeliveryState,
    dispatcher: Box<dyn BroadcastDispatcher>,
    wake_lock: Arc<dyn WakeLock>,
    store: Arc<dyn SegmentStore>,
    events: mpsc::UnboundedSender<DeliveryEvent>,
    deferred: VecDeque<InboundMessage>,
    in_flight: Option<(u64, InboundMessage)>,
    next_broadcast: u64,
    release_timers: Vec<JoinHandle<()>>,
    stats: DeliveryStats,
    stats_tx: watch::Sender<DeliveryStats>,
}

impl DeliveryStateMachine {
    /// Start a machine on its own Tokio task and return the handle feeding it
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        config: DeliveryConfig,
        store: Arc<dyn SegmentStore>,
        dispatcher: impl BroadcastDispatcher,
        wake_lock: Arc<dyn WakeLock>,
    ) -> DeliveryHandle {
        let (machine, events) = Self::new(config, store, Box::new(dispatcher), wake_lock);
        let handle = machine.handle();
        tokio::spawn(machine.run(events));
        handle
    }

    fn new(
        config: DeliveryConfig,
        store: Arc<dyn SegmentStore>,
        dispatcher: Box<dyn BroadcastDispatcher>,
        wake_lock: Arc<dyn WakeLock>,
    ) -> (Self, mpsc::UnboundedReceiver<DeliveryEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let stats = DeliveryStats {
            running: true,
            ..Default::default()
        };
        let (stats_tx, _) = watch::channel(stats.clone());

        wake_lock.acquire();
        let mut machine = Self {
            config,
            state: DeliveryState::Idle,
            dispatcher,
            wake_lock,
            store,
            events,
            deferred: VecDeque::new(),
            in_flight: None,
            next_broadcast: 0,
            release_timers: Vec::new(),
            stats,
            stats_tx,
        };
        machine.enter_idle();
        machine.publish_stats();
        (machine, receiver)
    }

    fn handle(&self) -> DeliveryHandle {
        DeliveryHandle {
            name: self.config.name.clone(),
            events: self.events.clone(),
            stats: self.stats_tx.subscribe(),
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<DeliveryEvent>) {
        debug!(machine = %self.config.name, "delivery state machine started");
        while let Some(event) = events.recv().await {
            if self.handle_event(event).is_break() {
                break;
            }
        }
        debug!(machine = %self.config.name, "delivery state machine stopped");
    }

    fn handle_event(&mut self, event: DeliveryEvent) -> ControlFlow<()> {
        match (self.state, event) {
            (_, DeliveryEvent::Shutdown(done)) => {
                self.quit();
                let _ = done.send(());
                return ControlFlow::Break(());
            }
            (_, DeliveryEvent::NewMessage(message)) if self.is_queued(&message) => {
                debug!(machine = %self.config.name, key = %message.key, "message already queued, dropping");
                self.stats.skipped += 1;
            }
            (DeliveryState::Idle, DeliveryEvent::NewMessage(message)) => {
                if self.dispatch(message) {
                    self.transition_to(DeliveryState::Waiting);
                }
            }
            (DeliveryState::Waiting, DeliveryEvent::NewMessage(message)) => {
                debug!(machine = %self.config.name, key = %message.key, "deferring message");
                self.deferred.push_back(message);
            }
            (DeliveryState::Waiting, DeliveryEvent::BroadcastComplete(id)) if self.is_in_flight(id) => {
                self.finish_in_flight();
                self.transition_to(DeliveryState::Idle);
            }
            (DeliveryState::Waiting, DeliveryEvent::BroadcastAbandoned(id)) if self.is_in_flight(id) => {
                if let Some((_, message)) = self.in_flight.take() {
                    warn!(
                        machine = %self.config.name,
                        key = %message.key,
                        "broadcast abandoned, segments stay stored until the next recovery scan"
                    );
                }
                self.stats.abandoned += 1;
                self.transition_to(DeliveryState::Idle);
            }
            (_, DeliveryEvent::BroadcastComplete(id) | DeliveryEvent::BroadcastAbandoned(id))
                if id < self.next_broadcast =>
            {
                debug!(machine = %self.config.name, broadcast = id, "stale acknowledgment ignored");
            }
            (state, DeliveryEvent::ReleaseWakeLock) => {
                self.wake_lock.release();
                if !self.wake_lock.is_held() {
                    if state == DeliveryState::Waiting {
                        error!(machine = %self.config.name, "wake-lock released while waiting for a broadcast");
                    } else {
                        debug!(machine = %self.config.name, "wake-lock released");
                    }
                }
            }
            (state, event) => self.unhandled(state, &event),
        }
        self.publish_stats();
        ControlFlow::Continue(())
    }

    fn transition_to(&mut self, to: DeliveryState) {
        let from = self.state;
        if from == to {
            return;
        }
        if from == DeliveryState::Idle {
            self.wake_lock.acquire();
        }
        self.state = to;
        debug!(machine = %self.config.name, ?from, ?to, "state transition");
        if to == DeliveryState::Idle {
            self.enter_idle();
        }
    }

    /// Entry action of `Idle`: schedule a release, then replay deferred messages
    fn enter_idle(&mut self) {
        self.schedule_release();
        while self.state == DeliveryState::Idle {
            let Some(message) = self.deferred.pop_front() else {
                break;
            };
            if self.dispatch(message) {
                self.transition_to(DeliveryState::Waiting);
            }
        }
    }

    fn schedule_release(&mut self) {
        self.release_timers.retain(|timer| !timer.is_finished());
        let events = self.events.clone();
        let delay = self.config.wake_lock_release_delay;
        self.release_timers.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(DeliveryEvent::ReleaseWakeLock);
        }));
    }

    fn is_in_flight(&self, id: u64) -> bool {
        matches!(self.in_flight, Some((current, _)) if current == id)
    }

    /// True when `message` shares a row with the broadcast in flight or a deferred message
    fn is_queued(&self, message: &InboundMessage) -> bool {
        let overlaps = |other: &InboundMessage| other.row_ids.iter().any(|id| message.row_ids.contains(id));
        self.in_flight.iter().any(|(_, current)| overlaps(current)) || self.deferred.iter().any(overlaps)
    }

    /// True when any of the message's stored rows has already been deleted
    ///
    /// Rows that are not found at all do not count; store errors are logged
    /// and the message is treated as undelivered.
    fn already_delivered(&self, message: &InboundMessage) -> bool {
        match self.store.query_group(&message.key) {
            Ok(rows) => rows
                .iter()
                .any(|row| row.deleted && message.row_ids.contains(&row.id)),
            Err(e) => {
                warn!(machine = %self.config.name, key = %message.key, error = %e, "failed to check delivered segments");
                false
            }
        }
    }

    /// Hand `message` to the dispatcher; true when it was accepted
    fn dispatch(&mut self, message: InboundMessage) -> bool {
        if self.already_delivered(&message) {
            debug!(machine = %self.config.name, key = %message.key, "message already delivered, dropping");
            self.stats.skipped += 1;
            return false;
        }
        let id = self.next_broadcast;
        self.next_broadcast += 1;
        let ack = BroadcastAck::new(id, self.events.clone());
        match self.dispatcher.dispatch(message.clone(), ack) {
            Ok(()) => {
                info!(
                    machine = %self.config.name,
                    key = %message.key,
                    segments = message.segment_count(),
                    "message dispatched"
                );
                self.stats.dispatched += 1;
                self.in_flight = Some((id, message));
                true
            }
            Err(e) => {
                warn!(
                    machine = %self.config.name,
                    key = %message.key,
                    error = %e,
                    "dispatch failed, segments stay stored until the next recovery scan"
                );
                self.stats.failed += 1;
                false
            }
        }
    }

    /// Delete the rows of the acknowledged message
    fn finish_in_flight(&mut self) {
        self.stats.completed += 1;
        let Some((_, message)) = self.in_flight.take() else {
            return;
        };
        for id in &message.row_ids {
            if let Err(e) = self.store.soft_delete_by_id(*id) {
                warn!(machine = %self.config.name, id, error = %e, "failed to delete delivered segment");
            }
        }
        debug!(machine = %self.config.name, key = %message.key, "broadcast complete");
    }

    fn quit(&mut self) {
        for timer in self.release_timers.drain(..) {
            timer.abort();
        }
        if !self.deferred.is_empty() {
            info!(
                machine = %self.config.name,
                dropped = self.deferred.len(),
                "shutting down with deferred messages"
            );
        }
        self.deferred.clear();
        self.in_flight = None;
        self.wake_lock.release_all();
        self.stats.running = false;
        self.publish_stats();
        info!(machine = %self.config.name, "delivery state machine shut down");
    }

    fn unhandled(&self, state: DeliveryState, event: &DeliveryEvent) {
        let text = format!(
            "{}: unhandled event {} in state {:?}",
            self.config.name,
            event.name(),
            state
        );
        if cfg!(debug_assertions) {
            panic!("{}", text);
        }
        error!("{}", text);
    }

    fn publish_stats(&mut self) {
        self.stats.state = self.state;
        self.stats.deferred = self.deferred.len();
        self.stats_tx.send_replace(self.stats.clone());
    }
}

/// Clonable handle posting events to a running [`DeliveryStateMachine`]
#[derive(Debug, Clone)]
pub struct DeliveryHandle {
    name: String,
    events: mpsc::UnboundedSender<DeliveryEvent>,
    stats: watch::Receiver<DeliveryStats>,
}

impl DeliveryHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a complete message for broadcast
    pub fn deliver(&self, message: InboundMessage) -> Result<(), DeliveryError> {
        self.events
            .send(DeliveryEvent::NewMessage(message))
            .map_err(|_| DeliveryError::ShutDown(self.name.clone()))
    }

    /// Stop the machine and wait until it has released its wake-lock
    ///
    /// Deferred messages are discarded; their rows stay stored.
    pub async fn shutdown(&self) -> Result<(), DeliveryError> {
        let (done, finished) = oneshot::channel();
        self.events
            .send(DeliveryEvent::Shutdown(done))
            .map_err(|_| DeliveryError::ShutDown(self.name.clone()))?;
        finished
            .await
            .map_err(|_| DeliveryError::ShutDown(self.name.clone()))
    }

    /// Latest published statistics
    pub fn stats(&self) -> DeliveryStats {
        self.stats.borrow().clone()
    }

    /// Wait until the published statistics satisfy `predicate`
    ///
    /// Returns the last snapshot if the machine stops first.
    pub async fn wait_until(&self, predicate: impl FnMut(&DeliveryStats) -> bool) -> DeliveryStats {
        let mut stats = self.stats.clone();
        if let Ok(snapshot) = stats.wait_for(predicate).await {
            return snapshot.clone();
        }
        let last = stats.borrow().clone();
        last
    }

    pub fn is_running(&self) -> bool {
        !self.events.is_closed()
    }
}
