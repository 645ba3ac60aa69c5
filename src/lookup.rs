// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP client for the registry's entity detail endpoint.
//!
//! `GET {base_url}/communication-parties/{herId}` returning the party as
//! JSON. A 404 is [`LookupError::NotFound`]; anything else that is not a
//! success is [`LookupError::Transport`].

use std::time::Instant;

use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::config::LookupConfig;
use crate::entity::{CommunicationParty, EntityLookup, LookupError, LookupFuture};
use crate::metrics;

/// Entity lookup over HTTP with optional basic auth.
#[derive(Debug, Clone)]
pub struct HttpEntityLookup {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpEntityLookup {
    pub fn new(config: &LookupConfig) -> Result<Self, LookupError> {
        if config.base_url.is_empty() {
            return Err(LookupError::Transport("lookup base_url not configured".into()));
        }

        let client = Client::builder()
            .timeout(config.timeout_duration())
            .build()
            .map_err(|e| LookupError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn entity_url(&self, her_id: i32) -> String {
        format!("{}/communication-parties/{}", self.base_url, her_id)
    }

    async fn fetch(&self, her_id: i32) -> Result<CommunicationParty, LookupError> {
        let mut request = self.client.get(self.entity_url(her_id));
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| LookupError::Transport(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let party: CommunicationParty = response
                    .json()
                    .await
                    .map_err(|e| LookupError::Transport(format!("invalid entity body: {}", e)))?;
                if !party.is_valid_communication_party {
                    warn!(
                        her_id,
                        "Communication party cannot hold collaboration agreements"
                    );
                }
                Ok(party)
            }
            StatusCode::NOT_FOUND => Err(LookupError::NotFound(her_id)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(LookupError::Transport(format!(
                    "HTTP {} - {}",
                    status,
                    body.chars().take(200).collect::<String>()
                )))
            }
        }
    }
}

impl EntityLookup for HttpEntityLookup {
    fn fetch_entity(&self, her_id: i32) -> LookupFuture<'_> {
        Box::pin(async move {
            let start = Instant::now();
            let result = self.fetch(her_id).await;
            metrics::record_lookup(start.elapsed(), result.is_ok());
            debug!(her_id, ok = result.is_ok(), "Entity lookup finished");
            result
        })
    }
}
