// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry entities and the collaborator seams around them.
//!
//! The relay needs two things from the outside world:
//!
//! 1. [`EntityLookup`]: fetch the current state of a communication party
//! 2. [`EntitySink`]: hand that state to the downstream system
//!
//! Both are traits so tests can substitute recording mocks.
//!
//! # Example
//!
//! ```rust,no_run
//! use registry_relay::entity::{CommunicationParty, EntitySink, SinkFuture};
//!
//! struct Downstream;
//!
//! impl EntitySink for Downstream {
//!     fn notify(&self, entity: CommunicationParty) -> SinkFuture<'_> {
//!         Box::pin(async move {
//!             println!("updated {}", entity.her_id);
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// A communication party as the registry describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommunicationParty {
    pub her_id: i32,
    pub name: String,
    #[serde(default, rename = "Type")]
    pub party_type: Option<String>,
    #[serde(default)]
    pub parent_her_id: Option<i32>,
    #[serde(default)]
    pub parent_name: Option<String>,
    #[serde(default)]
    pub organization_number: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Only services and persons can hold collaboration agreements.
    #[serde(default = "default_true")]
    pub is_valid_communication_party: bool,
    #[serde(default)]
    pub last_changed: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl CommunicationParty {
    /// Minimal party, for tests and stubs.
    pub fn new(her_id: i32, name: impl Into<String>) -> Self {
        Self {
            her_id,
            name: name.into(),
            party_type: None,
            parent_her_id: None,
            parent_name: None,
            organization_number: None,
            active: true,
            is_valid_communication_party: true,
            last_changed: None,
        }
    }
}

/// Entity lookup failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("communication party {0} not found")]
    NotFound(i32),

    #[error("lookup transport failure: {0}")]
    Transport(String),
}

/// Downstream sink failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Future returned by [`EntityLookup::fetch_entity`].
pub type LookupFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommunicationParty, LookupError>> + Send + 'a>>;

/// Future returned by [`EntitySink::notify`].
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

/// Fetches full entity state by id.
pub trait EntityLookup: Send + Sync + 'static {
    fn fetch_entity(&self, her_id: i32) -> LookupFuture<'_>;
}

/// Receives entity updates.
pub trait EntitySink: Send + Sync + 'static {
    fn notify(&self, entity: CommunicationParty) -> SinkFuture<'_>;
}

/// Sink that only logs what it receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

impl EntitySink for LoggingSink {
    fn notify(&self, entity: CommunicationParty) -> SinkFuture<'_> {
        Box::pin(async move {
            info!(
                her_id = entity.her_id,
                name = %entity.name,
                "Received an update to communication party"
            );
            Ok(())
        })
    }
}
