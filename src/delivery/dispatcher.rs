// ABOUTME: Downstream broadcast interface and the acknowledgment handle that re-enters the delivery queue
// ABOUTME: Includes a channel-backed dispatcher for applications consuming messages from a task

use crate::delivery::machine::DeliveryEvent;
use crate::delivery::message::InboundMessage;
use crate::error::DispatchError;
use tokio::sync::mpsc;
use tracing::debug;

/// Receives complete messages from a delivery state machine
///
/// `dispatch` is called exactly once per message and must not block. The
/// machine stays in its waiting state until the [`BroadcastAck`] is
/// completed, so the next message is only dispatched after that.
///
/// Closures with the same signature implement this trait.
pub trait BroadcastDispatcher: Send + 'static {
    fn dispatch(&mut self, message: InboundMessage, ack: BroadcastAck) -> Result<(), DispatchError>;
}

impl<F> BroadcastDispatcher for F
where
    F: FnMut(InboundMessage, BroadcastAck) -> Result<(), DispatchError> + Send + 'static,
{
    fn dispatch(&mut self, message: InboundMessage, ack: BroadcastAck) -> Result<(), DispatchError> {
        self(message, ack)
    }
}

/// Completion handle for one dispatched message
///
/// Completing it posts a broadcast-complete event to the machine's queue,
/// where it is handled in order with every other event. Dropping it without
/// completing posts a broadcast-abandoned event instead: the machine returns
/// to idle and the message's segments stay stored for the next recovery scan.
#[derive(Debug)]
#[must_use = "the delivery state machine waits until the broadcast is acknowledged"]
pub struct BroadcastAck {
    id: u64,
    events: Option<mpsc::UnboundedSender<DeliveryEvent>>,
}

impl BroadcastAck {
    pub(crate) fn new(id: u64, events: mpsc::UnboundedSender<DeliveryEvent>) -> Self {
        Self {
            id,
            events: Some(events),
        }
    }

    /// Report that the broadcast has finished
    pub fn complete(mut self) {
        if let Some(events) = self.events.take() {
            if events.send(DeliveryEvent::BroadcastComplete(self.id)).is_err() {
                debug!(broadcast = self.id, "broadcast acknowledged after delivery state machine shut down");
            }
        }
    }
}

impl Drop for BroadcastAck {
    fn drop(&mut self) {
        if let Some(events) = self.events.take() {
            let _ = events.send(DeliveryEvent::BroadcastAbandoned(self.id));
        }
    }
}

/// A message together with its acknowledgment handle
#[derive(Debug)]
pub struct Broadcast {
    pub message: InboundMessage,
    pub ack: BroadcastAck,
}

/// Dispatcher forwarding every message into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    sender: mpsc::UnboundedSender<Broadcast>,
}

impl ChannelDispatcher {
    /// Create the dispatcher and the receiving end applications read from
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Broadcast>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl BroadcastDispatcher for ChannelDispatcher {
    fn dispatch(&mut self, message: InboundMessage, ack: BroadcastAck) -> Result<(), DispatchError> {
        self.sender
            .send(Broadcast { message, ack })
            .map_err(|_| DispatchError::ReceiverClosed)
    }
}
