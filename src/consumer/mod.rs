// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resumable stream consumer.
//!
//! Ties together:
//! - the broker seam ([`crate::broker`])
//! - checkpoint persistence ([`crate::checkpoint`])
//! - header normalization ([`crate::mapper::PropertyMapper`])
//! - message handling ([`crate::dispatcher::MessageHandler`])
//!
//! # Sessions
//!
//! A session is one connection plus one subscription. Setup failures and
//! lost sessions are retried after a fixed delay, forever, until the
//! shutdown signal fires. Each session resumes from the last checkpoint.
//!
//! # Checkpoints
//!
//! Every `checkpoint_interval`th delivery of a session commits that
//! delivery's offset, after the handler has run. Up to K-1 handled
//! deliveries (plus the committed one, since `Offset(n)` is inclusive) are
//! redelivered after a restart.
//!
//! # Graceful Shutdown
//!
//! 1. No further deliveries are taken
//! 2. An in-flight handler gets `drain_grace` to finish
//! 3. The subscription is closed, then the connection

mod offset;
mod types;

pub use offset::resolve_start_offset;
pub use types::{ConsumerState, ConsumerStats, ConsumerStatsSnapshot};

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broker::{BrokerConnection, OffsetSpec, StreamBroker, Subscription};
use crate::checkpoint::CheckpointStore;
use crate::config::RelayConfig;
use crate::dispatcher::MessageHandler;
use crate::error::{RelayError, Result};
use crate::initial_population::InitialPopulation;
use crate::mapper::PropertyMapper;
use crate::metrics;
use crate::resilience::RetryPolicy;

/// Tunables for a [`StreamConsumer`].
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub stream: String,
    /// Consumer identity on the broker. Checkpoints are keyed by it.
    pub reference: String,
    /// Commit every K deliveries.
    pub checkpoint_interval: u64,
    pub retry: RetryPolicy,
    pub drain_grace: Duration,
    pub channel_capacity: usize,
    /// Start offset when nothing is stored anywhere.
    pub fallback: OffsetSpec,
}

impl ConsumerSettings {
    pub fn new(stream: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            reference: reference.into(),
            checkpoint_interval: 10,
            retry: RetryPolicy::default(),
            drain_grace: Duration::from_secs(1),
            channel_capacity: 256,
            fallback: OffsetSpec::Last,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            stream: config.broker.stream.clone(),
            reference: config.broker.reference.clone(),
            checkpoint_interval: config.consumer.checkpoint_interval,
            retry: RetryPolicy {
                delay: config.consumer.retry_delay_duration(),
                connection_timeout: config.broker.connection_timeout_duration(),
            },
            drain_grace: config.consumer.drain_grace_duration(),
            channel_capacity: config.consumer.channel_capacity,
            fallback: config.consumer.fallback_offset.to_spec(),
        }
    }

    /// Millisecond delays for tests.
    pub fn testing(stream: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            retry: RetryPolicy::testing(),
            drain_grace: Duration::from_millis(100),
            channel_capacity: 16,
            ..Self::new(stream, reference)
        }
    }
}

struct Session<C> {
    connection: C,
    subscription: Subscription,
}

enum SessionEnd {
    Cancelled,
    Lost(RelayError),
}

/// Resolves when shutdown is signalled or the sender is gone.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn shutdown_signalled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Consumes one stream for one reference.
pub struct StreamConsumer<B, C, H>
where
    B: StreamBroker,
    C: CheckpointStore,
    H: MessageHandler,
{
    broker: Arc<B>,
    checkpoints: Arc<C>,
    handler: Arc<H>,
    mapper: PropertyMapper,
    population: InitialPopulation,
    settings: ConsumerSettings,
    state_tx: watch::Sender<ConsumerState>,
    state_rx: watch::Receiver<ConsumerState>,
    stats: Arc<ConsumerStats>,
    last_committed: Mutex<Option<u64>>,
}

impl<B, C, H> StreamConsumer<B, C, H>
where
    B: StreamBroker,
    C: CheckpointStore,
    H: MessageHandler,
{
    pub fn new(
        broker: Arc<B>,
        checkpoints: Arc<C>,
        handler: Arc<H>,
        settings: ConsumerSettings,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Disconnected);
        Self {
            broker,
            checkpoints,
            handler,
            mapper: PropertyMapper::default(),
            population: InitialPopulation::disabled(),
            settings,
            state_tx,
            state_rx,
            stats: Arc::new(ConsumerStats::default()),
            last_committed: Mutex::new(None),
        }
    }

    /// Use a specific mapper (and so a specific descriptor registry).
    pub fn with_mapper(mut self, mapper: PropertyMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_initial_population(mut self, population: InitialPopulation) -> Self {
        self.population = population;
        self
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn state(&self) -> ConsumerState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConsumerState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Highest offset this consumer has committed.
    pub fn last_committed(&self) -> Option<u64> {
        *self.last_committed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Consumer state changed");
            metrics::record_consumer_state(&self.settings.stream, &state.to_string());
        }
    }

    /// Run until `shutdown` fires (or its sender is dropped).
    ///
    /// Never returns an error: every failure is logged and retried.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let span = info_span!(
            "consumer",
            stream = %self.settings.stream,
            reference = %self.settings.reference
        );

        async move {
            info!("Starting stream consumer");
            let mut attempt = 0usize;

            loop {
                if shutdown_signalled(&shutdown) {
                    break;
                }
                attempt += 1;
                self.set_state(ConsumerState::Connecting);

                let Some(setup) = self.setup(&mut shutdown).await else {
                    break;
                };

                match setup {
                    Ok(session) => {
                        attempt = 0;
                        self.stats.record_session();
                        metrics::record_setup_attempt(&self.settings.stream, true);
                        match self.consume(session, &mut shutdown).await {
                            SessionEnd::Cancelled => break,
                            SessionEnd::Lost(e) => warn!(
                                error = %e,
                                delay_ms = self.settings.retry.delay.as_millis() as u64,
                                "Stream session lost, reconnecting after delay"
                            ),
                        }
                    }
                    Err(e) => {
                        self.stats.record_setup_failure();
                        metrics::record_setup_attempt(&self.settings.stream, false);
                        error!(
                            attempt,
                            retryable = e.is_retryable(),
                            error = %e,
                            "Failed to set up stream consumer. The stream may not have been created yet, will retry in a moment"
                        );
                    }
                }

                self.set_state(ConsumerState::Retrying);
                let delay = self.settings.retry.delay_for_attempt(attempt.max(1));
                tokio::select! {
                    biased;
                    _ = cancelled(&mut shutdown) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.set_state(ConsumerState::Closed);
            info!("Stream consumer stopped");
        }
        .instrument(span)
        .await
    }

    /// Connect, then subscribe. `None` if shutdown fires first; a connection
    /// opened by then is closed before returning.
    async fn setup(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Result<Session<B::Connection>>> {
        let connection = tokio::select! {
            biased;
            _ = cancelled(shutdown) => return None,
            result = self.connect() => match result {
                Ok(connection) => connection,
                Err(e) => return Some(Err(e)),
            },
        };

        let subscribing = tokio::select! {
            biased;
            _ = cancelled(shutdown) => None,
            result = self.subscribe(&connection) => Some(result),
        };

        match subscribing {
            Some(Ok(subscription)) => Some(Ok(Session {
                connection,
                subscription,
            })),
            Some(Err(e)) => {
                Self::teardown(None, Some(&connection)).await;
                Some(Err(e))
            }
            None => {
                debug!("Shutdown during subscribe, closing connection");
                Self::teardown(None, Some(&connection)).await;
                None
            }
        }
    }

    async fn connect(&self) -> Result<B::Connection> {
        let timeout = self.settings.retry.connection_timeout;
        match tokio::time::timeout(timeout, self.broker.connect()).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::broker_msg(
                "CONNECT",
                format!("timed out after {:?}", timeout),
            )),
        }
    }

    async fn subscribe(&self, connection: &B::Connection) -> Result<Subscription> {
        let start = resolve_start_offset(
            &self.population,
            self.checkpoints.as_ref(),
            connection,
            &self.settings.reference,
            &self.settings.stream,
            self.settings.fallback,
        )
        .await;

        connection
            .subscribe(
                &self.settings.stream,
                &self.settings.reference,
                start,
                self.settings.channel_capacity,
            )
            .await
    }

    /// Close whatever exists: subscription first, then connection.
    async fn teardown(subscription: Option<&mut Subscription>, connection: Option<&B::Connection>) {
        if let Some(subscription) = subscription {
            subscription.close().await;
        }
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Failed to close broker connection");
            }
        }
    }

    async fn consume(
        &self,
        mut session: Session<B::Connection>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        self.set_state(ConsumerState::Subscribed);
        info!(start = %session.subscription.start(), "Consumer subscribed");

        let interval = self.settings.checkpoint_interval.max(1);
        let mut delivered: u64 = 0;

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(shutdown) => {
                    self.set_state(ConsumerState::Draining);
                    break SessionEnd::Cancelled;
                }
                next = session.subscription.next_delivery() => next,
            };

            let mut delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => break SessionEnd::Lost(e),
                None => break SessionEnd::Lost(RelayError::broker_msg("READ", "subscription ended")),
            };

            if delivered == 0 {
                self.set_state(ConsumerState::Consuming);
            }

            self.mapper
                .normalize_incoming(&mut delivery.message.properties.headers);
            metrics::record_delivery(&self.settings.stream);

            let handling = self.handler.handle(&delivery);
            tokio::pin!(handling);

            let (outcome, cancelling) = tokio::select! {
                biased;
                outcome = &mut handling => (Some(outcome), false),
                _ = cancelled(shutdown) => {
                    self.set_state(ConsumerState::Draining);
                    let outcome = tokio::time::timeout(self.settings.drain_grace, &mut handling)
                        .await
                        .ok();
                    (outcome, true)
                }
            };

            match outcome {
                Some(outcome) => {
                    self.stats.record_outcome(outcome);
                    delivered += 1;
                    if delivered % interval == 0 {
                        self.commit(delivery.offset).await;
                    }
                }
                None => warn!(
                    offset = delivery.offset,
                    grace_ms = self.settings.drain_grace.as_millis() as u64,
                    "In-flight delivery did not finish within the drain grace period"
                ),
            }

            if cancelling {
                break SessionEnd::Cancelled;
            }
        };

        Self::teardown(Some(&mut session.subscription), Some(&session.connection)).await;
        end
    }

    async fn commit(&self, offset: u64) {
        if let Some(last) = self.last_committed() {
            if offset <= last {
                debug!(offset, last, "Skipping regressive checkpoint");
                return;
            }
        }

        match self
            .checkpoints
            .save(&self.settings.reference, &self.settings.stream, offset)
            .await
        {
            Ok(()) => {
                *self.last_committed.lock().unwrap_or_else(PoisonError::into_inner) = Some(offset);
                self.stats.record_commit(true);
                metrics::record_checkpoint_commit(&self.settings.stream, true);
                info!(offset, "Stored offset");
            }
            Err(e) => {
                self.stats.record_commit(false);
                metrics::record_checkpoint_commit(&self.settings.stream, false);
                warn!(offset, error = %e, "Failed to store offset");
            }
        }
    }
}
