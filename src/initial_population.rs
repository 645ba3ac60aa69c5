// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Initial population: replay every entity the registry knows about.
//!
//! When a run is requested the relay records its start time. The stream
//! consumer then starts from that time instead of its checkpoint, and
//! [`InitialPopulationJob`] streams the full export into the sink. Changes
//! that land during the export are picked up by the consumer, so nothing
//! falls in between.
//!
//! # Export format
//!
//! [`NdjsonExport`] reads one JSON entity per line:
//!
//! ```text
//! {"HerId":4200,"Name":"Legekontoret","Type":"Service"}
//! {"HerId":4201,"Name":"Fastlege","Type":"Person","ParentHerId":4200}
//! ```
//!
//! Blank lines are skipped. A line that does not parse is reported as an
//! error item and reading continues. A transport error ends the stream.

use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::Client;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::OffsetSpec;
use crate::config::InitialPopulationConfig;
use crate::consumer::cancelled;
use crate::entity::{CommunicationParty, EntitySink};
use crate::error::{BoxFuture, RelayError, Result};
use crate::metrics;

/// Whether an initial population run is active, and when it began.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitialPopulation {
    /// Unix seconds.
    started_at: Option<i64>,
}

impl InitialPopulation {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn started_now() -> Self {
        Self::started_at(Utc::now().timestamp())
    }

    pub fn started_at(unix_secs: i64) -> Self {
        Self {
            started_at: Some(unix_secs),
        }
    }

    pub fn in_progress(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn started_at_secs(&self) -> Option<i64> {
        self.started_at
    }

    /// Where the consumer should start while this run is active.
    pub fn start_offset(&self) -> Option<OffsetSpec> {
        self.started_at.map(OffsetSpec::Timestamp)
    }
}

/// Lazy, finite stream of exported entities.
pub type EntityStream = BoxStream<'static, Result<CommunicationParty>>;

/// Source of the full entity set. Each call starts from the beginning.
pub trait EntityExport: Send + Sync + 'static {
    fn export_all(&self) -> BoxFuture<'_, EntityStream>;
}

// =============================================================================
// NDJSON over HTTP
// =============================================================================

/// Streams the registry's newline-delimited JSON export.
#[derive(Debug, Clone)]
pub struct NdjsonExport {
    client: Client,
    url: String,
    username: Option<String>,
    password: Option<String>,
}

impl NdjsonExport {
    pub fn new(config: &InitialPopulationConfig) -> Result<Self> {
        if config.export_url.is_empty() {
            return Err(RelayError::Config("initial_population.export_url is empty".into()));
        }
        let client = Client::builder()
            .timeout(config.timeout_duration())
            .build()
            .map_err(|e| RelayError::Export(e.to_string()))?;
        Ok(Self {
            client,
            url: config.export_url.clone(),
            username: None,
            password: None,
        })
    }

    pub fn with_basic_auth(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    async fn open(&self) -> Result<EntityStream> {
        let mut request = self.client.get(&self.url);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Export(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Export(format!("export returned HTTP {}", status)));
        }

        debug!(url = %self.url, "Export stream established");
        Ok(ndjson_entities(response.bytes_stream()))
    }
}

impl EntityExport for NdjsonExport {
    fn export_all(&self) -> BoxFuture<'_, EntityStream> {
        Box::pin(self.open())
    }
}

struct LineReader<E> {
    body: BoxStream<'static, std::result::Result<Bytes, E>>,
    buf: Vec<u8>,
    finished: bool,
}

fn parse_line(line: &[u8]) -> Result<CommunicationParty> {
    serde_json::from_slice(line).map_err(|e| RelayError::Export(format!("invalid export line: {}", e)))
}

/// Split a byte stream into lines and parse each as an entity.
pub fn ndjson_entities<S, E>(body: S) -> EntityStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let reader = LineReader {
        body: body.boxed(),
        buf: Vec::new(),
        finished: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(pos) = reader.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = reader.buf.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some((parse_line(&line), reader));
            }

            if reader.finished {
                if reader.buf.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                let line = std::mem::take(&mut reader.buf);
                return Some((parse_line(&line), reader));
            }

            match reader.body.next().await {
                Some(Ok(chunk)) => reader.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    reader.finished = true;
                    reader.buf.clear();
                    return Some((Err(RelayError::Export(e.to_string())), reader));
                }
                None => reader.finished = true,
            }
        }
    })
    .boxed()
}

// =============================================================================
// Job
// =============================================================================

/// Totals for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulationSummary {
    pub forwarded: u64,
    pub failed: u64,
    pub cancelled: bool,
}

/// Pushes every exported entity into the sink.
pub struct InitialPopulationJob<E: EntityExport, S: EntitySink> {
    export: Arc<E>,
    sink: Arc<S>,
}

impl<E: EntityExport, S: EntitySink> InitialPopulationJob<E, S> {
    pub fn new(export: Arc<E>, sink: Arc<S>) -> Self {
        Self { export, sink }
    }

    /// Run to the end of the export or until `shutdown` fires.
    ///
    /// Per-entity failures are logged and counted. Only failing to open the
    /// export is an error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<PopulationSummary> {
        info!("Initial population start");
        let mut entities = self.export.export_all().await?;
        let mut summary = PopulationSummary::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => {
                    summary.cancelled = true;
                    warn!("Initial population cancelled");
                    break;
                }
                next = entities.next() => next,
            };

            match next {
                None => break,
                Some(Ok(party)) => {
                    let her_id = party.her_id;
                    match self.sink.notify(party).await {
                        Ok(()) => summary.forwarded += 1,
                        Err(e) => {
                            summary.failed += 1;
                            error!(her_id, error = %e, "Could not run initial population on communication party");
                        }
                    }
                }
                Some(Err(e)) => {
                    summary.failed += 1;
                    error!(error = %e, "Skipping unreadable export entry");
                }
            }
            metrics::record_population_progress(summary.forwarded, summary.failed);
        }

        info!(
            forwarded = summary.forwarded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Initial population end"
        );
        Ok(summary)
    }
}

/// Convenience for tests and fixed exports.
#[derive(Debug, Clone, Default)]
pub struct StaticExport {
    entities: Vec<CommunicationParty>,
}

impl StaticExport {
    pub fn new(entities: Vec<CommunicationParty>) -> Self {
        Self { entities }
    }
}

impl EntityExport for StaticExport {
    fn export_all(&self) -> BoxFuture<'_, EntityStream> {
        let items: Vec<Result<CommunicationParty>> = self.entities.iter().cloned().map(Ok).collect();
        Box::pin(async move { Ok(stream::iter(items).boxed()) })
    }
}
