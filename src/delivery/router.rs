// ABOUTME: Routes reassembled messages to the delivery queue of their transport leg
// ABOUTME: Used by recovery to feed recovered messages into the same queues as live traffic

use crate::delivery::machine::DeliveryHandle;
use crate::delivery::message::InboundMessage;
use crate::error::DispatchError;
use crate::segment::Transport;
use tracing::warn;

/// Delivery handles for the 3GPP and 3GPP2 legs
#[derive(Debug, Clone, Default)]
pub struct TransportRouter {
    gsm: Option<DeliveryHandle>,
    cdma: Option<DeliveryHandle>,
}

impl TransportRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the delivery queue for `transport`
    pub fn with_leg(mut self, transport: Transport, handle: DeliveryHandle) -> Self {
        match transport {
            Transport::Gsm3gpp => self.gsm = Some(handle),
            Transport::Cdma3gpp2 => self.cdma = Some(handle),
        }
        self
    }

    pub fn leg(&self, transport: Transport) -> Result<&DeliveryHandle, DispatchError> {
        let leg = match transport {
            Transport::Gsm3gpp => self.gsm.as_ref(),
            Transport::Cdma3gpp2 => self.cdma.as_ref(),
        };
        leg.ok_or(DispatchError::NoReceiver(transport))
    }

    /// Queue `message` on the leg of its transport
    pub fn route(&self, message: InboundMessage) -> Result<(), DispatchError> {
        let leg = self.leg(message.transport)?;
        leg.deliver(message).map_err(|e| {
            warn!(leg = leg.name(), error = %e, "delivery queue closed");
            DispatchError::ReceiverClosed
        })
    }
}
