// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0

// In-Memory Transport - Pub/Sub over tokio broadcast channels
//
// One broadcast channel per topic, created on first use. Every subscriber
// sees every message published after it subscribed (fan-out, like the same
// topic consumed by several modules). Used for tests and single-process
// deployments; a broker-backed adapter implements the same port.
//
// Messages are lost on restart and a slow subscriber that lags past the
// channel capacity skips the messages it missed. The publish log keeps only
// the newest `log_capacity` messages.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::transport::{Transport, TransportError, TransportMessage};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_LOG_CAPACITY: usize = 256;

pub struct InMemoryTransport {
    topics: DashMap<String, broadcast::Sender<TransportMessage>>,
    capacity: usize,
    published: Mutex<VecDeque<TransportMessage>>,
    log_capacity: usize,
    closed: AtomicBool,
}

impl InMemoryTransport {
    /// `capacity` is the per-topic buffer before slow subscribers lag.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            published: Mutex::new(VecDeque::new()),
            log_capacity: DEFAULT_LOG_CAPACITY,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Bound the publish log. Zero disables recording.
    pub fn with_log_capacity(mut self, log_capacity: usize) -> Self {
        self.log_capacity = log_capacity;
        self
    }

    /// Most recent published messages, oldest first.
    pub fn published(&self) -> Vec<TransportMessage> {
        self.published.lock().iter().cloned().collect()
    }

    pub fn published_to(&self, topic: &str) -> Vec<TransportMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Reject further publishes and subscriptions and end every open
    /// subscription stream.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.topics.clear();
        info!("In-memory transport closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<TransportMessage> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    fn record(&self, message: &TransportMessage) {
        if self.log_capacity == 0 {
            return;
        }
        let mut log = self.published.lock();
        while log.len() >= self.log_capacity {
            log.pop_front();
        }
        log.push_back(message.clone());
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, message: TransportMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let sender = self.sender(&message.topic);
        debug!(topic = %message.topic, key = ?message.key, "Publishing message");
        self.record(&message);

        // send() only fails when nobody is subscribed
        if sender.send(message).is_err() {
            debug!("No subscribers listening on topic");
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, TransportMessage>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let receiver = self.sender(topic).subscribe();
        let topic = topic.to_string();

        let stream = stream::unfold((receiver, topic), |(mut receiver, topic)| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, (receiver, topic))),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(topic = %topic, skipped = n, "Transport subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let transport = InMemoryTransport::default();
        let mut a = transport.subscribe("llm.requests").unwrap();
        let mut b = transport.subscribe("llm.requests").unwrap();
        assert_eq!(transport.subscriber_count("llm.requests"), 2);

        let message = TransportMessage::new("llm.requests", b"hello".to_vec()).with_key("chat-42");
        transport.publish(message.clone()).await.unwrap();

        assert_eq!(a.next().await.unwrap(), message);
        assert_eq!(b.next().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let transport = InMemoryTransport::default();
        let mut responses = transport.subscribe("llm.responses").unwrap();

        transport
            .publish(TransportMessage::new("llm.requests", b"req".to_vec()))
            .await
            .unwrap();
        transport
            .publish(TransportMessage::new("llm.responses", b"resp".to_vec()))
            .await
            .unwrap();

        assert_eq!(responses.next().await.unwrap().payload, b"resp".to_vec());
        assert_eq!(transport.published().len(), 2);
        assert_eq!(transport.published_to("llm.requests").len(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let transport = InMemoryTransport::default();
        let result = transport
            .publish(TransportMessage::new("nobody", b"x".to_vec()))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_ahead() {
        let transport = InMemoryTransport::new(2);
        let mut slow = transport.subscribe("t").unwrap();
        for i in 0..5u8 {
            transport.publish(TransportMessage::new("t", vec![i])).await.unwrap();
        }
        // the two newest survive
        assert_eq!(slow.next().await.unwrap().payload, vec![3]);
        assert_eq!(slow.next().await.unwrap().payload, vec![4]);
    }

    #[tokio::test]
    async fn test_publish_log_keeps_newest() {
        let transport = InMemoryTransport::default().with_log_capacity(3);
        for i in 0..5u8 {
            transport.publish(TransportMessage::new("t", vec![i])).await.unwrap();
        }
        let payloads: Vec<_> = transport.published().into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, vec![vec![2], vec![3], vec![4]]);

        let silent = InMemoryTransport::default().with_log_capacity(0);
        silent.publish(TransportMessage::new("t", vec![1])).await.unwrap();
        assert!(silent.published().is_empty());
    }

    #[tokio::test]
    async fn test_close_ends_streams_and_rejects_publish() {
        let transport = InMemoryTransport::default();
        let mut inbound = transport.subscribe("t").unwrap();

        transport.close();
        assert!(inbound.next().await.is_none());
        assert!(matches!(
            transport.publish(TransportMessage::new("t", vec![1])).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(transport.subscribe("t"), Err(TransportError::Closed)));
    }
}
