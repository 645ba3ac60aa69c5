// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process broker.
//!
//! Streams are vectors; an entry's offset is its index. Useful for tests
//! (with failure injection) and for running the relay without a broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::Notify;
use tracing::debug;

use super::{BrokerConnection, Delivery, OffsetSpec, StreamBroker, StreamMessage, Subscription};
use crate::error::{BoxFuture, RelayError, Result};

#[derive(Debug)]
struct StoredEntry {
    /// Unix seconds.
    timestamp: i64,
    message: StreamMessage,
}

#[derive(Debug, Default)]
struct MemoryState {
    streams: HashMap<String, Vec<StoredEntry>>,
    tracked: HashMap<(String, String), u64>,
    /// Bumped to end every open subscription.
    generation: u64,
    subscriptions: Vec<SubscriptionRecord>,
}

/// What a subscriber asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub stream: String,
    pub reference: String,
    pub start: OffsetSpec,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<MemoryState>,
    appended: Notify,
    fail_connects: AtomicUsize,
    fail_subscribes: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

/// Shared in-memory broker. Clones see the same streams.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create `stream` if it does not exist.
    pub fn create_stream(&self, stream: &str) {
        self.state().streams.entry(stream.to_string()).or_default();
    }

    /// Append a message stamped with the current time. Creates the stream.
    pub fn publish(&self, stream: &str, message: StreamMessage) -> u64 {
        self.publish_at(stream, message, Utc::now().timestamp())
    }

    /// Append a message with an explicit unix-seconds timestamp.
    pub fn publish_at(&self, stream: &str, message: StreamMessage, timestamp: i64) -> u64 {
        let offset = {
            let mut state = self.state();
            let entries = state.streams.entry(stream.to_string()).or_default();
            entries.push(StoredEntry { timestamp, message });
            (entries.len() - 1) as u64
        };
        self.inner.appended.notify_waiters();
        offset
    }

    pub fn len(&self, stream: &str) -> usize {
        self.state().streams.get(stream).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// Record a broker-side offset for `reference`.
    pub fn track_offset(&self, reference: &str, stream: &str, offset: u64) {
        self.state()
            .tracked
            .insert((reference.to_string(), stream.to_string()), offset);
    }

    /// Make the next `n` connects fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` subscribes fail.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.inner.fail_subscribes.store(n, Ordering::SeqCst);
    }

    /// End every open subscription with an error, as a dropped session would.
    pub fn sever_subscriptions(&self) {
        self.state().generation += 1;
        self.inner.appended.notify_waiters();
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Every subscribe call that succeeded, in order.
    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.state().subscriptions.clone()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn start_index(entries: &[StoredEntry], start: OffsetSpec) -> usize {
        match start {
            OffsetSpec::First => 0,
            OffsetSpec::Last => entries.len().saturating_sub(1),
            OffsetSpec::Next => entries.len(),
            OffsetSpec::Offset(offset) => usize::try_from(offset).unwrap_or(usize::MAX),
            OffsetSpec::Timestamp(secs) => entries
                .iter()
                .position(|e| e.timestamp >= secs)
                .unwrap_or(entries.len()),
        }
    }
}

impl StreamBroker for MemoryBroker {
    type Connection = MemoryConnection;

    fn connect(&self) -> BoxFuture<'_, MemoryConnection> {
        Box::pin(async move {
            if Self::take_failure(&self.inner.fail_connects) {
                return Err(RelayError::broker_msg("CONNECT", "injected connect failure"));
            }
            self.inner.connects.fetch_add(1, Ordering::SeqCst);
            Ok(MemoryConnection {
                broker: self.clone(),
                closed: AtomicBool::new(false),
            })
        })
    }
}

/// Connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl BrokerConnection for MemoryConnection {
    fn query_offset<'a>(&'a self, reference: &'a str, stream: &'a str) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async move {
            Ok(self
                .broker
                .state()
                .tracked
                .get(&(reference.to_string(), stream.to_string()))
                .copied())
        })
    }

    fn subscribe<'a>(
        &'a self,
        stream: &'a str,
        reference: &'a str,
        start: OffsetSpec,
        capacity: usize,
    ) -> BoxFuture<'a, Subscription> {
        Box::pin(async move {
            if MemoryBroker::take_failure(&self.broker.inner.fail_subscribes) {
                return Err(RelayError::broker_msg("SUBSCRIBE", "injected subscribe failure"));
            }

            let (first, generation) = {
                let mut state = self.broker.state();
                let Some(entries) = state.streams.get(stream) else {
                    return Err(RelayError::StreamNotFound(stream.to_string()));
                };
                let first = MemoryBroker::start_index(entries, start);
                let generation = state.generation;
                state.subscriptions.push(SubscriptionRecord {
                    stream: stream.to_string(),
                    reference: reference.to_string(),
                    start,
                });
                (first, generation)
            };

            debug!(stream, reference, start = %start, first, "Memory subscription opened");

            let broker = self.broker.clone();
            let stream = stream.to_string();
            Ok(Subscription::spawn(start, capacity, move |tx, mut stop| async move {
                let mut next = first;
                loop {
                    let appended = broker.inner.appended.notified();
                    tokio::pin!(appended);
                    appended.as_mut().enable();

                    let (entry, severed) = {
                        let state = broker.state();
                        let entry = state
                            .streams
                            .get(&stream)
                            .and_then(|entries| entries.get(next))
                            .map(|e| e.message.clone());
                        (entry, state.generation != generation)
                    };

                    if severed {
                        let _ = tx
                            .send(Err(RelayError::broker_msg("READ", "subscription severed")))
                            .await;
                        return;
                    }

                    if let Some(message) = entry {
                        let delivery = Delivery {
                            offset: next as u64,
                            message,
                        };
                        if tx.send(Ok(delivery)).await.is_err() {
                            return;
                        }
                        next += 1;
                        continue;
                    }

                    tokio::select! {
                        biased;
                        _ = stop.changed() => return,
                        _ = &mut appended => {}
                    }
                }
            }))
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.broker.inner.closes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }
}
