// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stream broker seam.
//!
//! A broker exposes append-only logs addressed by name. Entries are
//! identified by a monotonically increasing `u64` offset. Consumers
//! subscribe from an [`OffsetSpec`] and receive [`Delivery`] values in
//! offset order through a bounded channel fed by a reader task.
//!
//! ```text
//! StreamBroker::connect ──► BrokerConnection ──► subscribe ──► Subscription
//!                                                                │
//!                                       reader task ── mpsc ─────┘
//! ```
//!
//! Implementations:
//! - [`redis::RedisStreamBroker`]: Redis Streams (XREAD)
//! - [`memory::MemoryBroker`]: in-process log for tests and local runs

pub mod memory;
pub mod redis;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{BoxFuture, Result};
use crate::properties::TransportProperties;

pub use self::memory::MemoryBroker;
pub use self::redis::{BrokerCheckpointStore, RedisStreamBroker};

/// How long [`Subscription::close`] waits for the reader task before aborting it.
const READER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Where a subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    /// The oldest retained entry.
    First,
    /// The most recent entry, inclusive.
    Last,
    /// Only entries appended after subscribing.
    Next,
    /// The entry at this offset, inclusive.
    Offset(u64),
    /// The first entry stored at or after this unix time (seconds).
    Timestamp(i64),
}

impl fmt::Display for OffsetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => write!(f, "first"),
            Self::Last => write!(f, "last"),
            Self::Next => write!(f, "next"),
            Self::Offset(offset) => write!(f, "offset({})", offset),
            Self::Timestamp(secs) => write!(f, "timestamp({})", secs),
        }
    }
}

/// A message as the broker carries it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamMessage {
    pub properties: TransportProperties,
    pub body: Vec<u8>,
}

impl StreamMessage {
    pub fn new(properties: TransportProperties, body: impl Into<Vec<u8>>) -> Self {
        Self {
            properties,
            body: body.into(),
        }
    }
}

/// A message paired with its log offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub offset: u64,
    pub message: StreamMessage,
}

/// Factory for broker connections.
pub trait StreamBroker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    fn connect(&self) -> BoxFuture<'_, Self::Connection>;
}

/// An open broker connection.
pub trait BrokerConnection: Send + Sync + 'static {
    /// Offset the broker tracks for `reference` on `stream`, if any.
    fn query_offset<'a>(&'a self, reference: &'a str, stream: &'a str) -> BoxFuture<'a, Option<u64>>;

    /// Start reading `stream` from `start`. Deliveries are buffered up to
    /// `capacity` before the reader task waits.
    fn subscribe<'a>(
        &'a self,
        stream: &'a str,
        reference: &'a str,
        start: OffsetSpec,
        capacity: usize,
    ) -> BoxFuture<'a, Subscription>;

    /// Release the connection. Safe to call more than once.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// A live subscription.
///
/// Owns the reader task feeding it. Dropping the subscription aborts the
/// reader; [`close`](Self::close) stops it cooperatively first.
pub struct Subscription {
    rx: mpsc::Receiver<Result<Delivery>>,
    stop_tx: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
    start: OffsetSpec,
}

impl Subscription {
    /// Spawn `reader` with the sending half of a `capacity`-bounded channel
    /// and a stop signal.
    ///
    /// The reader should return once the stop signal fires or the channel
    /// closes. A reader error is sent as `Err` and ends the subscription.
    pub fn spawn<F, Fut>(start: OffsetSpec, capacity: usize, reader: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Result<Delivery>>, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(reader(tx, stop_rx));

        Self {
            rx,
            stop_tx,
            reader: Some(handle),
            start,
        }
    }

    /// Next delivery in offset order. `None` once the reader has finished.
    pub async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        self.rx.recv().await
    }

    /// The offset spec this subscription was opened with.
    pub fn start(&self) -> OffsetSpec {
        self.start
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    /// Stop the reader and discard anything still buffered.
    pub async fn close(&mut self) {
        let Some(mut handle) = self.reader.take() else {
            return;
        };

        let _ = self.stop_tx.send(true);
        self.rx.close();

        match tokio::time::timeout(READER_STOP_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => debug!("Subscription reader stopped"),
            Ok(Err(e)) => warn!(error = %e, "Subscription reader ended abnormally"),
            Err(_) => {
                warn!("Subscription reader did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("start", &self.start)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;

    fn delivery(offset: u64) -> Delivery {
        Delivery {
            offset,
            message: StreamMessage::default(),
        }
    }

    #[tokio::test]
    async fn test_subscription_delivers_in_order() {
        let mut sub = Subscription::spawn(OffsetSpec::First, 4, |tx, _stop| async move {
            for offset in 0..3 {
                if tx.send(Ok(delivery(offset))).await.is_err() {
                    return;
                }
            }
        });

        for expected in 0..3 {
            let d = sub.next_delivery().await.unwrap().unwrap();
            assert_eq!(d.offset, expected);
        }
        assert!(sub.next_delivery().await.is_none());
    }

    #[tokio::test]
    async fn test_subscription_close_stops_reader() {
        let mut sub = Subscription::spawn(OffsetSpec::Next, 1, |_tx, mut stop| async move {
            let _ = stop.changed().await;
        });

        assert!(!sub.is_closed());
        sub.close().await;
        assert!(sub.is_closed());
        // Idempotent
        sub.close().await;
    }

    #[tokio::test]
    async fn test_subscription_close_aborts_stuck_reader() {
        let mut sub = Subscription::spawn(OffsetSpec::Next, 1, |_tx, _stop| async move {
            std::future::pending::<()>().await;
        });

        tokio::time::pause();
        sub.close().await;
        assert!(sub.is_closed());
    }

    #[tokio::test]
    async fn test_reader_error_is_delivered() {
        let mut sub = Subscription::spawn(OffsetSpec::First, 1, |tx, _stop| async move {
            let _ = tx.send(Err(RelayError::broker_msg("XREAD", "connection reset"))).await;
        });

        assert!(sub.next_delivery().await.unwrap().is_err());
        assert!(sub.next_delivery().await.is_none());
    }

    #[test]
    fn test_offset_spec_display() {
        assert_eq!(OffsetSpec::Offset(9000).to_string(), "offset(9000)");
        assert_eq!(OffsetSpec::Last.to_string(), "last");
        assert_eq!(OffsetSpec::Timestamp(1_700_000_000).to_string(), "timestamp(1700000000)");
    }
}
