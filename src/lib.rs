//! # Registry Relay
//!
//! Keeps a downstream system in sync with a healthcare address registry by
//! consuming the registry's change-notification stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                             registry-relay                                │
//! │                                                                           │
//! │  ┌──────────────┐   ┌────────────────┐   ┌─────────────────────────────┐  │
//! │  │ StreamBroker │──►│ StreamConsumer │──►│ EventDispatcher             │  │
//! │  │ (XREAD)      │   │ (normalize,    │   │ (filter, jitter, lookup,    │  │
//! │  └──────────────┘   │  commit every K)│   │  sink.notify)               │  │
//! │                     └────────────────┘   └─────────────────────────────┘  │
//! │                            │                                              │
//! │                            ▼                                              │
//! │                     ┌─────────────────┐   ┌────────────────────────────┐  │
//! │                     │ CheckpointStore │   │ InitialPopulationJob       │  │
//! │                     │ (SQLite/broker) │   │ (full export into the sink)│  │
//! │                     └─────────────────┘   └────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Messages carry AMQP 1.0 envelope and application properties as encoded
//! header blobs. [`mapper::PropertyMapper`] decodes them into plain headers
//! using [`codec::AmqpCodec`] before the dispatcher sees them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use registry_relay::{
//!     ConsumerSettings, EventDispatcher, HttpEntityLookup, LoggingSink, RedisStreamBroker,
//!     RelayConfig, SqliteCheckpointStore, StreamConsumer,
//! };
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> registry_relay::Result<()> {
//!     let config = RelayConfig::from_yaml_file("relay.yaml")?;
//!     let broker = Arc::new(RedisStreamBroker::new(config.broker.clone())?);
//!     let store = Arc::new(SqliteCheckpointStore::new(&config.checkpoint.sqlite_path).await?);
//!     let lookup = Arc::new(HttpEntityLookup::new(&config.lookup).expect("lookup config"));
//!     let dispatcher = Arc::new(EventDispatcher::from_config(
//!         lookup,
//!         Arc::new(LoggingSink),
//!         &config.dispatcher,
//!     ));
//!
//!     let consumer = StreamConsumer::new(broker, store, dispatcher, ConsumerSettings::from_config(&config));
//!     let (_tx, rx) = watch::channel(false);
//!     consumer.run(rx).await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod initial_population;
pub mod lookup;
pub mod mapper;
pub mod metrics;
pub mod properties;
pub mod resilience;

// Re-exports for convenience
pub use broker::{
    BrokerCheckpointStore, BrokerConnection, Delivery, MemoryBroker, OffsetSpec, RedisStreamBroker,
    StreamBroker, StreamMessage, Subscription,
};
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use codec::{AmqpCodec, AmqpValue, CodecError, Descriptor, DescriptorRegistry, Record};
pub use config::{CheckpointBackend, RelayConfig};
pub use consumer::{ConsumerSettings, ConsumerState, ConsumerStatsSnapshot, StreamConsumer};
pub use dispatcher::{EventDispatcher, HandleOutcome, MessageHandler};
pub use entity::{CommunicationParty, EntityLookup, EntitySink, LoggingSink, LookupError, SinkError};
pub use error::{RelayError, Result};
pub use initial_population::{
    EntityExport, InitialPopulation, InitialPopulationJob, NdjsonExport, PopulationSummary,
};
pub use lookup::HttpEntityLookup;
pub use mapper::PropertyMapper;
pub use properties::{AmqpTimestamp, HeaderBag, HeaderValue, SimpleValue, TransportProperties};
