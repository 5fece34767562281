// aqlink Gateway - LoRaWAN ingestion layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Bounded ingestion queue
//!
//! Many producers (broker workers), one consumer (the dispatcher).
//! Producers never wait: when the queue is full the envelope is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::envelope::Envelope;

/// Create a queue holding at most `capacity` envelopes
pub fn channel(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        QueueSender {
            tx,
            capacity: capacity.max(1),
            dropped: Arc::clone(&dropped),
        },
        QueueReceiver { rx, dropped },
    )
}

/// Producer side, cheap to clone
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<Envelope>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl QueueSender {
    /// Offer an envelope without waiting; `false` when it was dropped
    pub fn offer(&self, envelope: Envelope) -> bool {
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(envelope)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    source = %envelope.source,
                    device = %envelope.dev_id,
                    capacity = self.capacity,
                    "ingestion queue full, dropping envelope"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Envelopes waiting
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Envelopes dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer side
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<Envelope>,
    dropped: Arc<AtomicU64>,
}

impl QueueReceiver {
    /// Pop the oldest envelope if any
    pub fn try_pop(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for an envelope
    pub async fn pop_timeout(&mut self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Envelopes dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(dev: &str) -> Envelope {
        Envelope::parse(
            &format!(r#"{{ "app_id": "a", "dev_id": "{}", "port": 2, "payload_raw": "AQ==" }}"#, dev),
            25,
        )
        .unwrap()
    }

    #[test]
    fn test_full_queue_drops() {
        let (tx, mut rx) = channel(2);
        assert!(tx.offer(envelope("d1")));
        assert!(tx.offer(envelope("d2")));
        assert!(!tx.offer(envelope("d3")));
        assert_eq!(tx.len(), 2);
        assert_eq!(tx.dropped(), 1);
        assert_eq!(rx.dropped(), 1);

        // arrival order is kept
        assert_eq!(rx.try_pop().unwrap().dev_id, "d1");
        assert_eq!(rx.try_pop().unwrap().dev_id, "d2");
        assert!(rx.try_pop().is_none());
        assert!(tx.is_empty());
    }

    #[tokio::test]
    async fn test_pop_timeout() {
        let (tx, mut rx) = channel(4);
        assert!(rx.pop_timeout(Duration::from_millis(10)).await.is_none());
        tx.offer(envelope("d1"));
        assert_eq!(
            rx.pop_timeout(Duration::from_millis(10)).await.unwrap().dev_id,
            "d1"
        );
    }
}
