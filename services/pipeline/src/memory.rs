//! In-process enrichment channel.
//!
//! Implements both halves of the channel contract on a single queue with the
//! same ack discipline as the broker-backed implementation: at most one
//! delivery is outstanding, an acked delivery is gone, a released delivery
//! goes back to the head of the queue.

use crate::consumer::{
    ConsumerError, Delivery, EventSubscription, IncomingMessage, MessageMetadata,
};
use crate::event::EnrichmentEvent;
use crate::producer::{EventPublisher, OutgoingMessage, PublishError};
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct ChannelState {
    queue: VecDeque<IncomingMessage>,
    in_flight: Option<i64>,
    next_offset: i64,
    acked: Vec<i64>,
    released: usize,
    closed: bool,
}

/// Single-queue channel living in process memory
pub struct MemoryChannel {
    name: String,
    state: Mutex<ChannelState>,
    notify: Notify,
}

impl MemoryChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ChannelState::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueue an already encoded message
    pub async fn push(&self, message: OutgoingMessage) {
        let mut state = self.state.lock().await;
        let offset = state.next_offset;
        state.next_offset += 1;
        state.queue.push_back(IncomingMessage {
            payload: message.payload,
            metadata: MessageMetadata {
                queue: message.queue,
                partition: 0,
                offset,
                headers: message.headers.into_iter().collect(),
            },
        });
        drop(state);
        self.notify.notify_one();
    }

    /// Stop handing out deliveries once the queue drains
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Messages waiting to be delivered, excluding the one in flight
    pub async fn pending(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Offsets acknowledged so far, in acknowledgment order
    pub async fn acked(&self) -> Vec<i64> {
        self.state.lock().await.acked.clone()
    }

    /// Number of deliveries handed back for redelivery
    pub async fn released(&self) -> usize {
        self.state.lock().await.released
    }

    pub async fn in_flight(&self) -> Option<i64> {
        self.state.lock().await.in_flight
    }
}

#[async_trait]
impl EventPublisher for MemoryChannel {
    async fn publish(&self, event: &EnrichmentEvent) -> Result<(), PublishError> {
        if self.state.lock().await.closed {
            return Err(PublishError::Connect(format!("channel {} is closed", self.name)));
        }
        self.push(OutgoingMessage::for_event(&self.name, event)).await;
        Ok(())
    }
}

#[async_trait]
impl EventSubscription for MemoryChannel {
    async fn next_delivery(&self) -> Result<Delivery, ConsumerError> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if state.in_flight.is_none() {
                    if let Some(message) = state.queue.pop_front() {
                        state.in_flight = Some(message.metadata.offset);
                        return Ok(Delivery { message });
                    }
                    if state.closed {
                        return Err(ConsumerError::Closed);
                    }
                }
            }
            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        let mut state = self.state.lock().await;
        if state.in_flight != Some(delivery.offset()) {
            return Err(ConsumerError::AckError(format!(
                "offset {} is not in flight",
                delivery.offset()
            )));
        }
        state.in_flight = None;
        state.acked.push(delivery.offset());
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        let mut state = self.state.lock().await;
        if state.in_flight != Some(delivery.offset()) {
            return Err(ConsumerError::ReleaseError(format!(
                "offset {} is not in flight",
                delivery.offset()
            )));
        }
        state.in_flight = None;
        state.released += 1;
        state.queue.push_front(delivery.message.clone());
        drop(state);
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Timestamp;

    fn event(path: &str) -> EnrichmentEvent {
        EnrichmentEvent::new(path, "1463745600.00000".parse::<Timestamp>().unwrap())
    }

    #[tokio::test]
    async fn test_ack_removes_delivery() {
        let channel = MemoryChannel::new("q");
        channel.publish(&event("/a.jpg")).await.unwrap();
        channel.publish(&event("/b.jpg")).await.unwrap();

        let first = channel.next_delivery().await.unwrap();
        assert_eq!(first.event().unwrap().path, "/a.jpg");
        channel.ack(&first).await.unwrap();

        let second = channel.next_delivery().await.unwrap();
        assert_eq!(second.event().unwrap().path, "/b.jpg");
        channel.ack(&second).await.unwrap();

        assert_eq!(channel.acked().await, vec![0, 1]);
        assert_eq!(channel.pending().await, 0);
    }

    #[tokio::test]
    async fn test_release_redelivers_same_message() {
        let channel = MemoryChannel::new("q");
        channel.publish(&event("/a.jpg")).await.unwrap();
        channel.publish(&event("/b.jpg")).await.unwrap();

        let first = channel.next_delivery().await.unwrap();
        channel.release(&first).await.unwrap();

        let again = channel.next_delivery().await.unwrap();
        assert_eq!(again.offset(), first.offset());
        assert_eq!(again.event().unwrap().path, "/a.jpg");
        assert_eq!(channel.released().await, 1);
    }

    #[tokio::test]
    async fn test_one_delivery_in_flight() {
        let channel = MemoryChannel::new("q");
        channel.publish(&event("/a.jpg")).await.unwrap();
        channel.publish(&event("/b.jpg")).await.unwrap();

        let first = channel.next_delivery().await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            channel.next_delivery(),
        )
        .await;
        assert!(blocked.is_err());

        channel.ack(&first).await.unwrap();
        let second = channel.next_delivery().await.unwrap();
        assert_eq!(second.offset(), 1);
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let channel = MemoryChannel::new("q");
        channel.close().await;

        assert!(matches!(
            channel.next_delivery().await,
            Err(ConsumerError::Closed)
        ));
        assert!(channel.publish(&event("/a.jpg")).await.is_err());
    }
}
