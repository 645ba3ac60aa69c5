// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up a Redis broker for integration tests.

#![allow(dead_code)]

use registry_relay::broker::redis::RedisConnection;
use registry_relay::broker::{RedisStreamBroker, StreamBroker, StreamMessage};
use registry_relay::config::BrokerConfig;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis broker in a container plus a config pointing at it.
pub struct TestBroker<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub config: BrokerConfig,
}

impl<'a> TestBroker<'a> {
    pub fn new(docker: &'a Cli, stream: &str, reference: &str) -> Self {
        let container = redis_container(docker);
        let config = BrokerConfig {
            redis_url: redis_url(&container),
            stream: stream.to_string(),
            reference: reference.to_string(),
            block_timeout: "200ms".to_string(),
            ..Default::default()
        };
        Self { container, config }
    }

    pub fn broker(&self) -> RedisStreamBroker {
        RedisStreamBroker::new(self.config.clone()).unwrap()
    }

    pub async fn connection(&self) -> RedisConnection {
        self.broker().connect().await.unwrap()
    }

    /// Publish `messages` in order, returning their offsets.
    pub async fn publish_all(&self, messages: &[StreamMessage]) -> Vec<u64> {
        let conn = self.connection().await;
        let mut offsets = Vec::with_capacity(messages.len());
        for message in messages {
            offsets.push(conn.publish(&self.config.stream, message).await.unwrap());
        }
        offsets
    }
}
