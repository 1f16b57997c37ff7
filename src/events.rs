use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Domain events emitted by the services.
///
/// `PaymentConfirmed` is the user-visible confirmation signal; the monitor
/// guarantees it fires at most once per order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    CartUpdated { session: String },
    CartCleared { session: String },

    OrderCreated(Uuid),

    PaymentInitiated {
        order_id: Uuid,
        checkout_request_id: String,
    },
    PaymentConfirmed(Uuid),
    PaymentFailed(Uuid),

    /// A mobile-money order stayed pending past the configured timeout and
    /// needs an operator's attention.
    PaymentReviewRequired(Uuid),
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the receiver is
    /// gone. Event delivery is best-effort and never blocks a request.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.sender.send(event).await {
            warn!("Event dropped: {}", e);
        }
    }
}

/// Creates an event channel together with its sender.
pub fn channel(buffer: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(buffer);
    (EventSender::new(tx), rx)
}

/// Consumes events and logs them. The binary runs this as its event sink;
/// tests usually keep the receiver to assert on emitted events instead.
pub async fn log_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        info!(?event, "domain event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_or_log_does_not_fail_without_receiver() {
        let (sender, receiver) = channel(4);
        drop(receiver);
        sender.send_or_log(Event::OrderCreated(Uuid::new_v4())).await;
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (sender, mut receiver) = channel(4);
        let id = Uuid::new_v4();
        sender.send_or_log(Event::OrderCreated(id)).await;
        sender.send_or_log(Event::PaymentConfirmed(id)).await;

        assert!(matches!(receiver.recv().await, Some(Event::OrderCreated(got)) if got == id));
        assert!(matches!(receiver.recv().await, Some(Event::PaymentConfirmed(got)) if got == id));
    }
}
