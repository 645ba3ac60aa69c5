// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event dispatch: filter, look up, forward.
//!
//! For each normalized delivery the dispatcher reads `eventName` and
//! `herId`. Only `CommunicationPartyCreated` and `CommunicationPartyUpdated`
//! are acted on. A matching event waits a random delay (to spread load on
//! the lookup service), fetches the full entity and hands it to the sink.
//!
//! Failures never escape: they are logged with the event name and id and
//! reported as [`HandleOutcome::Failed`]. The message still counts as
//! consumed.
//!
//! Lookup and sink failures can be retried in place a bounded number of
//! times, with a fixed delay between attempts. The default is one attempt.
//! A missing or invalid `herId` is never retried.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::broker::Delivery;
use crate::config::DispatcherConfig;
use crate::entity::{EntityLookup, EntitySink, LookupError, SinkError};
use crate::metrics;
use crate::properties::{HeaderBag, HeaderValue};
use crate::resilience::{Jitter, RateLimiter};

pub const EVENT_NAME_HEADER: &str = "eventName";
pub const HER_ID_HEADER: &str = "herId";

/// Events that trigger a lookup.
pub const RELEVANT_EVENTS: [&str; 2] = ["CommunicationPartyCreated", "CommunicationPartyUpdated"];

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Entity fetched and forwarded.
    Dispatched,
    /// Not a relevant event.
    Ignored,
    /// Relevant, but something failed. Already logged.
    Failed,
}

impl HandleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Ignored => "ignored",
            Self::Failed => "failed",
        }
    }
}

pub type HandleFuture<'a> = Pin<Box<dyn Future<Output = HandleOutcome> + Send + 'a>>;

/// Processes one normalized delivery. Must not fail.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, delivery: &'a Delivery) -> HandleFuture<'a>;
}

/// `herId` as an integer. Accepts a numeric string or a long.
pub fn parse_her_id(headers: &HeaderBag) -> Option<i32> {
    match headers.get(HER_ID_HEADER)? {
        HeaderValue::String(s) => s.trim().parse().ok(),
        HeaderValue::Long(v) => i32::try_from(*v).ok(),
        other => other.to_text().and_then(|s| s.trim().parse().ok()),
    }
}

pub fn is_relevant_event(event_name: &str) -> bool {
    RELEVANT_EVENTS.contains(&event_name)
}

#[derive(Debug, Error)]
enum ForwardError {
    #[error("could not fetch communication party: {0}")]
    Lookup(#[from] LookupError),

    #[error("sink rejected communication party update: {0}")]
    Sink(#[from] SinkError),
}

/// The relay's [`MessageHandler`].
pub struct EventDispatcher<L: EntityLookup, S: EntitySink> {
    lookup: Arc<L>,
    sink: Arc<S>,
    jitter: Jitter,
    rate_limiter: Option<RateLimiter>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl<L: EntityLookup, S: EntitySink> EventDispatcher<L, S> {
    /// Default jitter (50ms..=5s), no rate limit, a single attempt.
    pub fn new(lookup: Arc<L>, sink: Arc<S>) -> Self {
        Self {
            lookup,
            sink,
            jitter: Jitter::default(),
            rate_limiter: None,
            max_attempts: 1,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn from_config(lookup: Arc<L>, sink: Arc<S>, config: &DispatcherConfig) -> Self {
        Self {
            lookup,
            sink,
            jitter: config.jitter(),
            rate_limiter: config.rate_limit_config().map(RateLimiter::new),
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay_duration(),
        }
    }

    /// Try lookup and sink up to `max_attempts` times (at least once).
    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    async fn dispatch(&self, headers: &HeaderBag) -> HandleOutcome {
        let Some(event_name) = headers.get(EVENT_NAME_HEADER).and_then(HeaderValue::to_text) else {
            debug!("Delivery has no event name, ignoring");
            return HandleOutcome::Ignored;
        };

        if !is_relevant_event(&event_name) {
            debug!(event_name = %event_name, "Ignoring event");
            return HandleOutcome::Ignored;
        }

        let Some(her_id) = parse_her_id(headers) else {
            error!(
                event_name = %event_name,
                her_id = ?headers.get(HER_ID_HEADER),
                "Event has a missing or invalid herId"
            );
            return HandleOutcome::Failed;
        };

        tokio::time::sleep(self.jitter.sample()).await;

        let mut attempt = 1;
        loop {
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            match self.forward(&event_name, her_id).await {
                Ok(()) => return HandleOutcome::Dispatched,
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        event_name = %event_name,
                        her_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Forwarding failed, retrying"
                    );
                    metrics::record_dispatch_retry();
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(event_name = %event_name, her_id, attempts = attempt, error = %e, "Dropping event");
                    return HandleOutcome::Failed;
                }
            }
        }
    }

    async fn forward(&self, event_name: &str, her_id: i32) -> Result<(), ForwardError> {
        let entity = self.lookup.fetch_entity(her_id).await?;
        info!(event_name, her_id, "Received event");
        self.sink.notify(entity).await?;
        Ok(())
    }
}

impl<L: EntityLookup, S: EntitySink> MessageHandler for EventDispatcher<L, S> {
    fn handle<'a>(&'a self, delivery: &'a Delivery) -> HandleFuture<'a> {
        Box::pin(async move {
            let outcome = self.dispatch(&delivery.message.properties.headers).await;
            metrics::record_dispatch(outcome.as_str());
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::StreamMessage;
    use crate::entity::{CommunicationParty, LookupError, LookupFuture, SinkError, SinkFuture};
    use crate::properties::TransportProperties;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubLookup {
        missing: bool,
        calls: Mutex<Vec<i32>>,
    }

    impl EntityLookup for StubLookup {
        fn fetch_entity(&self, her_id: i32) -> LookupFuture<'_> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(her_id);
                if self.missing {
                    Err(LookupError::NotFound(her_id))
                } else {
                    Ok(CommunicationParty::new(her_id, "stub"))
                }
            })
        }
    }

    #[derive(Default)]
    struct StubSink {
        reject: bool,
        received: Mutex<Vec<i32>>,
    }

    impl EntitySink for StubSink {
        fn notify(&self, entity: CommunicationParty) -> SinkFuture<'_> {
            Box::pin(async move {
                if self.reject {
                    return Err(SinkError("downstream offline".into()));
                }
                self.received.lock().unwrap().push(entity.her_id);
                Ok(())
            })
        }
    }

    fn delivery(headers: &[(&str, HeaderValue)]) -> Delivery {
        let bag: HeaderBag = headers.iter().cloned().collect();
        Delivery {
            offset: 0,
            message: StreamMessage::new(TransportProperties::with_headers(bag), Vec::new()),
        }
    }

    fn dispatcher(lookup: StubLookup, sink: StubSink) -> EventDispatcher<StubLookup, StubSink> {
        EventDispatcher::new(Arc::new(lookup), Arc::new(sink)).with_jitter(Jitter::none())
    }

    #[test]
    fn test_parse_her_id_forms() {
        let s: HeaderBag = [(HER_ID_HEADER, HeaderValue::from("4200"))].into_iter().collect();
        let l: HeaderBag = [(HER_ID_HEADER, HeaderValue::Long(4200))].into_iter().collect();
        let bad: HeaderBag = [(HER_ID_HEADER, HeaderValue::from("abc"))].into_iter().collect();
        assert_eq!(parse_her_id(&s), Some(4200));
        assert_eq!(parse_her_id(&l), Some(4200));
        assert_eq!(parse_her_id(&bad), None);
        assert_eq!(parse_her_id(&HeaderBag::new()), None);
    }

    #[tokio::test]
    async fn test_relevant_event_is_forwarded() {
        let d = dispatcher(StubLookup::default(), StubSink::default());
        let outcome = d
            .handle(&delivery(&[
                (EVENT_NAME_HEADER, "CommunicationPartyUpdated".into()),
                (HER_ID_HEADER, "4200".into()),
            ]))
            .await;
        assert_eq!(outcome, HandleOutcome::Dispatched);
        assert_eq!(*d.sink.received.lock().unwrap(), vec![4200]);
    }

    #[tokio::test]
    async fn test_other_events_are_ignored() {
        let d = dispatcher(StubLookup::default(), StubSink::default());
        let outcome = d
            .handle(&delivery(&[
                (EVENT_NAME_HEADER, "CommunicationPartyDeleted".into()),
                (HER_ID_HEADER, "1".into()),
            ]))
            .await;
        assert_eq!(outcome, HandleOutcome::Ignored);
        assert!(d.lookup.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_event_name_is_ignored() {
        let d = dispatcher(StubLookup::default(), StubSink::default());
        let outcome = d.handle(&delivery(&[(HER_ID_HEADER, "1".into())])).await;
        assert_eq!(outcome, HandleOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_bad_her_id_fails_without_lookup() {
        let d = dispatcher(StubLookup::default(), StubSink::default());
        let outcome = d
            .handle(&delivery(&[
                (EVENT_NAME_HEADER, "CommunicationPartyCreated".into()),
                (HER_ID_HEADER, "not-a-number".into()),
            ]))
            .await;
        assert_eq!(outcome, HandleOutcome::Failed);
        assert!(d.lookup.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failure_is_contained() {
        let lookup = StubLookup {
            missing: true,
            ..Default::default()
        };
        let d = dispatcher(lookup, StubSink::default());
        let outcome = d
            .handle(&delivery(&[
                (EVENT_NAME_HEADER, "CommunicationPartyCreated".into()),
                (HER_ID_HEADER, "7".into()),
            ]))
            .await;
        assert_eq!(outcome, HandleOutcome::Failed);
        assert!(d.sink.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_is_contained() {
        let sink = StubSink {
            reject: true,
            ..Default::default()
        };
        let d = dispatcher(StubLookup::default(), sink);
        let outcome = d
            .handle(&delivery(&[
                (EVENT_NAME_HEADER, "CommunicationPartyUpdated".into()),
                (HER_ID_HEADER, "7".into()),
            ]))
            .await;
        assert_eq!(outcome, HandleOutcome::Failed);
    }

    /// Lookup that fails for the first `failures` calls.
    struct FlakyLookup {
        failures: usize,
        calls: Mutex<usize>,
    }

    impl EntityLookup for FlakyLookup {
        fn fetch_entity(&self, her_id: i32) -> LookupFuture<'_> {
            Box::pin(async move {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                if *calls <= self.failures {
                    Err(LookupError::Transport("connection reset".into()))
                } else {
                    Ok(CommunicationParty::new(her_id, "stub"))
                }
            })
        }
    }

    fn flaky(failures: usize) -> FlakyLookup {
        FlakyLookup {
            failures,
            calls: Mutex::new(0),
        }
    }

    fn updated_event() -> Delivery {
        delivery(&[
            (EVENT_NAME_HEADER, "CommunicationPartyUpdated".into()),
            (HER_ID_HEADER, "42".into()),
        ])
    }

    #[tokio::test]
    async fn test_single_attempt_by_default() {
        let d = EventDispatcher::new(Arc::new(flaky(1)), Arc::new(StubSink::default())).with_jitter(Jitter::none());
        assert_eq!(d.max_attempts(), 1);
        assert_eq!(d.handle(&updated_event()).await, HandleOutcome::Failed);
        assert_eq!(*d.lookup.calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failure() {
        let d = EventDispatcher::new(Arc::new(flaky(2)), Arc::new(StubSink::default()))
            .with_jitter(Jitter::none())
            .with_retry(3, Duration::from_secs(2));

        let start = tokio::time::Instant::now();
        assert_eq!(d.handle(&updated_event()).await, HandleOutcome::Dispatched);
        assert_eq!(*d.lookup.calls.lock().unwrap(), 3);
        assert_eq!(*d.sink.received.lock().unwrap(), vec![42]);
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let sink = StubSink {
            reject: true,
            ..Default::default()
        };
        let d = EventDispatcher::new(Arc::new(StubLookup::default()), Arc::new(sink))
            .with_jitter(Jitter::none())
            .with_retry(3, Duration::from_millis(10));

        assert_eq!(d.handle(&updated_event()).await, HandleOutcome::Failed);
        assert_eq!(d.lookup.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_bad_her_id_is_not_retried() {
        let d = dispatcher(StubLookup::default(), StubSink::default()).with_retry(5, Duration::from_secs(60));
        let outcome = d
            .handle(&delivery(&[
                (EVENT_NAME_HEADER, "CommunicationPartyCreated".into()),
                (HER_ID_HEADER, "".into()),
            ]))
            .await;
        assert_eq!(outcome, HandleOutcome::Failed);
        assert!(d.lookup.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_delays_lookup() {
        let d = EventDispatcher::new(Arc::new(StubLookup::default()), Arc::new(StubSink::default()))
            .with_jitter(Jitter::new(
                Duration::from_millis(50),
                Duration::from_millis(50),
            ));
        let start = tokio::time::Instant::now();
        d.handle(&delivery(&[
            (EVENT_NAME_HEADER, "CommunicationPartyUpdated".into()),
            (HER_ID_HEADER, "1".into()),
        ]))
        .await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
