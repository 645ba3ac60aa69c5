//! Recording collaborators for the dispatcher and consumer.
//!
//! `MockLookup` and `MockSink` record every call and can be told to fail for
//! specific ids. Event helpers build messages the way the registry publishes
//! them: with the AMQP 1.0 blobs as the only headers.

#![allow(dead_code)]

use registry_relay::broker::StreamMessage;
use registry_relay::dispatcher::{EVENT_NAME_HEADER, HER_ID_HEADER};
use registry_relay::entity::{
    CommunicationParty, EntityLookup, EntitySink, LookupError, LookupFuture, SinkError, SinkFuture,
};
use registry_relay::mapper::PropertyMapper;
use registry_relay::properties::{HeaderBag, TransportProperties};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Lookup that answers with a stub entity for every id.
///
/// # Example
/// ```rust,ignore
/// let lookup = MockLookup::new();
/// lookup.fail_for(7).await;
///
/// // Use in tests...
///
/// assert_eq!(lookup.calls().await, vec![4200, 7]);
/// ```
#[derive(Default)]
pub struct MockLookup {
    calls: RwLock<Vec<i32>>,
    failing: RwLock<HashSet<i32>>,
    flaky: RwLock<HashMap<i32, usize>>,
    call_count: AtomicUsize,
}

impl MockLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `NotFound` for `her_id`.
    pub async fn fail_for(&self, her_id: i32) {
        self.failing.write().await.insert(her_id);
    }

    /// Answer a transport error for the next `times` lookups of `her_id`.
    pub async fn fail_times(&self, her_id: i32, times: usize) {
        self.flaky.write().await.insert(her_id, times);
    }

    pub async fn calls(&self) -> Vec<i32> {
        self.calls.read().await.clone()
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

impl EntityLookup for MockLookup {
    fn fetch_entity(&self, her_id: i32) -> LookupFuture<'_> {
        Box::pin(async move {
            self.calls.write().await.push(her_id);
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if self.failing.read().await.contains(&her_id) {
                return Err(LookupError::NotFound(her_id));
            }
            if let Some(left) = self.flaky.write().await.get_mut(&her_id).filter(|n| **n > 0) {
                *left -= 1;
                return Err(LookupError::Transport(format!("registry unavailable for {}", her_id)));
            }
            Ok(CommunicationParty::new(her_id, format!("party-{}", her_id)))
        })
    }
}

/// Sink that records every entity it accepts.
#[derive(Default)]
pub struct MockSink {
    received: RwLock<Vec<CommunicationParty>>,
    rejecting: RwLock<HashSet<i32>>,
    attempts: AtomicUsize,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reject(&self, her_id: i32) {
        self.rejecting.write().await.insert(her_id);
    }

    pub async fn received_ids(&self) -> Vec<i32> {
        self.received.read().await.iter().map(|p| p.her_id).collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl EntitySink for MockSink {
    fn notify(&self, entity: CommunicationParty) -> SinkFuture<'_> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.rejecting.read().await.contains(&entity.her_id) {
                return Err(SinkError(format!("rejected {}", entity.her_id)));
            }
            self.received.write().await.push(entity);
            Ok(())
        })
    }
}

// =============================================================================
// Event helpers
// =============================================================================

/// A registry event whose headers are only the encoded AMQP 1.0 blobs.
pub fn encoded_event(event_name: &str, her_id: i32) -> StreamMessage {
    let plain: HeaderBag = [(EVENT_NAME_HEADER, event_name.to_string()), (HER_ID_HEADER, her_id.to_string())]
        .into_iter()
        .collect();
    let mut transport = TransportProperties {
        message_id: Some(format!("msg-{}", her_id)),
        content_type: Some("application/json".to_string()),
        ..TransportProperties::with_headers(plain)
    };

    PropertyMapper::default().denormalize_outgoing(&mut transport);
    transport.headers.remove(EVENT_NAME_HEADER);
    transport.headers.remove(HER_ID_HEADER);

    StreamMessage::new(transport, Vec::new())
}

pub fn updated(her_id: i32) -> StreamMessage {
    encoded_event("CommunicationPartyUpdated", her_id)
}

pub fn created(her_id: i32) -> StreamMessage {
    encoded_event("CommunicationPartyCreated", her_id)
}

/// Poll `condition` every 5ms until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
