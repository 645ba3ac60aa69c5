// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams broker.
//!
//! Each stream entry is one message. Header keys become entry fields;
//! the body and the direct transport fields live under `_`-prefixed
//! fields:
//!
//! | Field | Content |
//! |-------|---------|
//! | `_body` | message body, raw bytes |
//! | `_message_id`, `_user_id`, `_reply_to`, `_correlation_id` | direct fields |
//! | `_content_type`, `_content_encoding` | direct fields |
//! | `_timestamp` | unix seconds |
//! | anything else | header |
//!
//! # Offsets
//!
//! Stream ids `{millis}-{seq}` are packed into a `u64` as
//! `millis << 20 | seq`, which keeps offsets ordered the same way as ids.
//! A sequence number that does not fit 20 bits is a parse error.
//!
//! Tracked offsets live in a hash `{offsets_key}:{stream}` with one field
//! per consumer reference. [`BrokerCheckpointStore`] writes them and
//! [`BrokerConnection::query_offset`] reads them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::{BrokerConnection, Delivery, OffsetSpec, StreamBroker, StreamMessage, Subscription};
use crate::checkpoint::CheckpointStore;
use crate::config::BrokerConfig;
use crate::error::{BoxFuture, RelayError, Result};
use crate::properties::{
    format_timestamp, HeaderBag, HeaderValue, TransportProperties, APPLICATION_PROPERTIES_HEADER,
    PROPERTIES_HEADER,
};

const BODY_FIELD: &str = "_body";
const MESSAGE_ID_FIELD: &str = "_message_id";
const USER_ID_FIELD: &str = "_user_id";
const REPLY_TO_FIELD: &str = "_reply_to";
const CORRELATION_ID_FIELD: &str = "_correlation_id";
const CONTENT_TYPE_FIELD: &str = "_content_type";
const CONTENT_ENCODING_FIELD: &str = "_content_encoding";
const TIMESTAMP_FIELD: &str = "_timestamp";

const SEQ_BITS: u32 = 20;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;

/// A Redis stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamPosition {
    pub millis: u64,
    pub seq: u64,
}

impl StreamPosition {
    pub const ZERO: Self = Self { millis: 0, seq: 0 };

    /// Parse `{millis}-{seq}`.
    pub fn parse(id: &str) -> Result<Self> {
        let (millis, seq) = id
            .split_once('-')
            .ok_or_else(|| RelayError::StreamParse(format!("Malformed stream id: {}", id)))?;
        let parse = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| RelayError::StreamParse(format!("Malformed stream id: {}", id)))
        };
        Ok(Self {
            millis: parse(millis)?,
            seq: parse(seq)?,
        })
    }

    pub fn from_offset(offset: u64) -> Self {
        Self {
            millis: offset >> SEQ_BITS,
            seq: offset & SEQ_MASK,
        }
    }

    pub fn to_offset(self) -> Result<u64> {
        if self.seq > SEQ_MASK || self.millis >> (64 - SEQ_BITS) != 0 {
            return Err(RelayError::StreamParse(format!(
                "Stream id {} does not fit an offset",
                self
            )));
        }
        Ok(self.millis << SEQ_BITS | self.seq)
    }

    /// The id just before this one. XREAD is exclusive, so reading after
    /// the predecessor includes this position.
    pub fn predecessor(self) -> Self {
        match (self.millis, self.seq) {
            (0, 0) => Self::ZERO,
            (millis, 0) => Self {
                millis: millis - 1,
                seq: u64::MAX,
            },
            (millis, seq) => Self { millis, seq: seq - 1 },
        }
    }
}

impl std::fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

fn offsets_hash(prefix: &str, stream: &str) -> String {
    format!("{}:{}", prefix, stream)
}

// =============================================================================
// Broker
// =============================================================================

/// Redis Streams implementation of [`StreamBroker`].
#[derive(Debug, Clone)]
pub struct RedisStreamBroker {
    client: Client,
    config: BrokerConfig,
}

impl RedisStreamBroker {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| RelayError::Config(format!("Invalid Redis URL: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    async fn open_manager(&self) -> Result<ConnectionManager> {
        open_manager(&self.client, self.config.connection_timeout_duration()).await
    }
}

async fn open_manager(client: &Client, connection_timeout: Duration) -> Result<ConnectionManager> {
    match timeout(connection_timeout, client.get_connection_manager()).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(RelayError::broker("CONNECT", e)),
        Err(_) => Err(RelayError::broker_msg(
            "CONNECT",
            format!("timed out after {:?}", connection_timeout),
        )),
    }
}

impl StreamBroker for RedisStreamBroker {
    type Connection = RedisConnection;

    fn connect(&self) -> BoxFuture<'_, RedisConnection> {
        Box::pin(async move {
            let conn = self.open_manager().await?;
            info!(url = %self.config.redis_url, "Connected to stream broker");
            Ok(RedisConnection {
                client: self.client.clone(),
                conn,
                config: self.config.clone(),
                closed: AtomicBool::new(false),
            })
        })
    }
}

/// A connection to a Redis broker.
///
/// Commands share one multiplexed connection. Each subscription opens its
/// own, since a blocking XREAD would stall everything queued behind it.
pub struct RedisConnection {
    client: Client,
    conn: ConnectionManager,
    config: BrokerConfig,
    closed: AtomicBool,
}

impl RedisConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::InvalidState {
                expected: "open".into(),
                actual: "closed".into(),
            });
        }
        Ok(())
    }

    /// Append a message and return its offset.
    pub async fn publish(&self, stream: &str, message: &StreamMessage) -> Result<u64> {
        self.ensure_open()?;
        let fields = message_to_fields(message);
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(stream, "*", &fields)
            .await
            .map_err(|e| RelayError::broker("XADD", e))?;
        StreamPosition::parse(&id)?.to_offset()
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(stream)
            .await
            .map_err(|e| RelayError::broker("EXISTS", e))
    }

    async fn latest_position(&self, stream: &str) -> Result<Option<StreamPosition>> {
        let mut conn = self.conn.clone();
        let newest: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XREVRANGE")
            .arg(stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::broker("XREVRANGE", e))?;
        newest
            .first()
            .map(|(id, _)| StreamPosition::parse(id))
            .transpose()
    }

    /// XREAD cursor (exclusive) for a start spec.
    async fn start_cursor(&self, stream: &str, start: OffsetSpec) -> Result<StreamPosition> {
        Ok(match start {
            OffsetSpec::First => StreamPosition::ZERO,
            OffsetSpec::Last => self
                .latest_position(stream)
                .await?
                .map(StreamPosition::predecessor)
                .unwrap_or(StreamPosition::ZERO),
            OffsetSpec::Next => self
                .latest_position(stream)
                .await?
                .unwrap_or(StreamPosition::ZERO),
            OffsetSpec::Offset(offset) => StreamPosition::from_offset(offset).predecessor(),
            OffsetSpec::Timestamp(secs) => {
                let millis = u64::try_from(secs).unwrap_or(0).saturating_mul(1000);
                StreamPosition { millis, seq: 0 }.predecessor()
            }
        })
    }
}

impl BrokerConnection for RedisConnection {
    fn query_offset<'a>(&'a self, reference: &'a str, stream: &'a str) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async move {
            self.ensure_open()?;
            read_tracked_offset(&self.conn, &self.config.offsets_key, reference, stream).await
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
            self.ensure_open()?;
            if !self.stream_exists(stream).await? {
                return Err(RelayError::StreamNotFound(stream.to_string()));
            }

            let cursor = self.start_cursor(stream, start).await?;
            let reader_conn =
                open_manager(&self.client, self.config.connection_timeout_duration()).await?;

            info!(
                stream,
                reference,
                start = %start,
                cursor = %cursor,
                "Subscribed to stream"
            );

            let reader = StreamReader {
                stream: stream.to_string(),
                conn: reader_conn,
                cursor,
                block_timeout: self.config.block_timeout_duration(),
                batch_size: self.config.batch_size,
            };
            Ok(Subscription::spawn(start, capacity, move |tx, stop| {
                reader.run(tx, stop)
            }))
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                debug!("Broker connection closed");
            }
            Ok(())
        })
    }
}

/// Reader task behind a Redis subscription.
struct StreamReader {
    stream: String,
    conn: ConnectionManager,
    cursor: StreamPosition,
    block_timeout: Duration,
    batch_size: usize,
}

impl StreamReader {
    async fn run(mut self, tx: mpsc::Sender<Result<Delivery>>, mut stop: watch::Receiver<bool>) {
        let opts = StreamReadOptions::default()
            .block(self.block_timeout.as_millis() as usize)
            .count(self.batch_size);

        loop {
            let cursor = self.cursor.to_string();
            let keys = [&self.stream];
            let ids = [&cursor];
            let read: redis::RedisResult<StreamReadReply> = tokio::select! {
                biased;
                _ = stop.changed() => return,
                r = self.conn.xread_options(&keys, &ids, &opts) => r,
            };

            let reply = match read {
                Ok(reply) => reply,
                Err(e) => {
                    let _ = tx.send(Err(RelayError::broker("XREAD", e))).await;
                    return;
                }
            };

            for key in reply.keys {
                for entry in key.ids {
                    let position = match StreamPosition::parse(&entry.id) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(stream = %self.stream, stream_id = %entry.id, error = %e, "Skipping entry");
                            continue;
                        }
                    };
                    self.cursor = position;

                    let offset = match position.to_offset() {
                        Ok(offset) => offset,
                        Err(e) => {
                            warn!(stream = %self.stream, stream_id = %entry.id, error = %e, "Skipping entry");
                            continue;
                        }
                    };

                    trace!(stream = %self.stream, offset, "Read stream entry");
                    let delivery = Delivery {
                        offset,
                        message: message_from_fields(entry.map),
                    };
                    if tx.send(Ok(delivery)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn read_tracked_offset(
    conn: &ConnectionManager,
    prefix: &str,
    reference: &str,
    stream: &str,
) -> Result<Option<u64>> {
    let mut conn = conn.clone();
    let raw: Option<String> = conn
        .hget(offsets_hash(prefix, stream), reference)
        .await
        .map_err(|e| RelayError::broker("HGET", e))?;
    raw.map(|s| {
        s.parse::<u64>()
            .map_err(|_| RelayError::StreamParse(format!("Tracked offset is not a number: {}", s)))
    })
    .transpose()
}

// =============================================================================
// Entry <-> message
// =============================================================================

fn field_bytes(value: redis::Value) -> Option<Vec<u8>> {
    match value {
        redis::Value::BulkString(bytes) => Some(bytes),
        redis::Value::SimpleString(s) => Some(s.into_bytes()),
        redis::Value::Int(i) => Some(i.to_string().into_bytes()),
        _ => None,
    }
}

fn field_text(value: redis::Value) -> Option<String> {
    field_bytes(value).and_then(|b| String::from_utf8(b).ok())
}

fn message_from_fields(fields: HashMap<String, redis::Value>) -> StreamMessage {
    let mut properties = TransportProperties::default();
    let mut body = Vec::new();

    // HashMap order is arbitrary; sort so header order is stable.
    let mut fields: Vec<_> = fields.into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));

    let mut headers = HeaderBag::new();
    for (name, value) in fields {
        match name.as_str() {
            BODY_FIELD => body = field_bytes(value).unwrap_or_default(),
            MESSAGE_ID_FIELD => properties.message_id = field_text(value),
            USER_ID_FIELD => properties.user_id = field_text(value),
            REPLY_TO_FIELD => properties.reply_to = field_text(value),
            CORRELATION_ID_FIELD => properties.correlation_id = field_text(value),
            CONTENT_TYPE_FIELD => properties.content_type = field_text(value),
            CONTENT_ENCODING_FIELD => properties.content_encoding = field_text(value),
            TIMESTAMP_FIELD => {
                properties.timestamp = field_text(value)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0)
            }
            PROPERTIES_HEADER | APPLICATION_PROPERTIES_HEADER => {
                if let Some(bytes) = field_bytes(value) {
                    headers.insert(name, HeaderValue::Bytes(bytes));
                }
            }
            _ => {
                if let Some(bytes) = field_bytes(value) {
                    let header = match String::from_utf8(bytes) {
                        Ok(text) => HeaderValue::String(text),
                        Err(e) => HeaderValue::Bytes(e.into_bytes()),
                    };
                    headers.insert(name, header);
                }
            }
        }
    }

    properties.headers = headers;
    StreamMessage { properties, body }
}

fn header_bytes(value: &HeaderValue) -> Vec<u8> {
    match value {
        HeaderValue::String(s) => s.as_bytes().to_vec(),
        HeaderValue::Bytes(b) => b.clone(),
        HeaderValue::Bool(v) => v.to_string().into_bytes(),
        HeaderValue::Long(v) => v.to_string().into_bytes(),
        HeaderValue::Double(v) => v.to_string().into_bytes(),
        HeaderValue::Timestamp(t) => format_timestamp(*t).into_bytes(),
    }
}

fn message_to_fields(message: &StreamMessage) -> Vec<(String, Vec<u8>)> {
    let props = &message.properties;
    let mut fields = Vec::with_capacity(props.headers.len() + 8);

    let direct = [
        (MESSAGE_ID_FIELD, &props.message_id),
        (USER_ID_FIELD, &props.user_id),
        (REPLY_TO_FIELD, &props.reply_to),
        (CORRELATION_ID_FIELD, &props.correlation_id),
        (CONTENT_TYPE_FIELD, &props.content_type),
        (CONTENT_ENCODING_FIELD, &props.content_encoding),
    ];
    for (field, value) in direct {
        if let Some(v) = value {
            fields.push((field.to_string(), v.as_bytes().to_vec()));
        }
    }
    if props.timestamp > 0 {
        fields.push((TIMESTAMP_FIELD.to_string(), props.timestamp.to_string().into_bytes()));
    }
    for (key, value) in &props.headers {
        fields.push((key.clone(), header_bytes(value)));
    }
    fields.push((BODY_FIELD.to_string(), message.body.clone()));
    fields
}

// =============================================================================
// Broker-side checkpoints
// =============================================================================

/// Checkpoints kept on the broker, next to the stream.
///
/// Writes are read-compare-write, so a lower offset never replaces a higher
/// one as long as a single consumer owns the reference.
#[derive(Clone)]
pub struct BrokerCheckpointStore {
    conn: ConnectionManager,
    prefix: String,
}

impl BrokerCheckpointStore {
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| RelayError::Config(format!("Invalid Redis URL: {}", e)))?;
        let conn = open_manager(&client, config.connection_timeout_duration()).await?;
        Ok(Self {
            conn,
            prefix: config.offsets_key.clone(),
        })
    }

    async fn save_offset(&self, reference: &str, stream: &str, offset: u64) -> Result<()> {
        let current = read_tracked_offset(&self.conn, &self.prefix, reference, stream).await?;
        if current.is_some_and(|c| c >= offset) {
            debug!(reference, stream, offset, "Ignoring regressive checkpoint");
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(offsets_hash(&self.prefix, stream), reference, offset.to_string())
            .await
            .map_err(|e| RelayError::broker("HSET", e))?;
        Ok(())
    }
}

impl CheckpointStore for BrokerCheckpointStore {
    fn load<'a>(&'a self, reference: &'a str, stream: &'a str) -> BoxFuture<'a, Option<u64>> {
        Box::pin(read_tracked_offset(&self.conn, &self.prefix, reference, stream))
    }

    fn save<'a>(&'a self, reference: &'a str, stream: &'a str, offset: u64) -> BoxFuture<'a, ()> {
        Box::pin(self.save_offset(reference, stream, offset))
    }
}

impl std::fmt::Debug for BrokerCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCheckpointStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_parse() {
        let pos = StreamPosition::parse("1700000000000-3").unwrap();
        assert_eq!(pos.millis, 1_700_000_000_000);
        assert_eq!(pos.seq, 3);
        assert!(StreamPosition::parse("garbage").is_err());
        assert!(StreamPosition::parse("12-x").is_err());
    }

    #[test]
    fn test_offset_packing_preserves_order() {
        let a = StreamPosition::parse("1700000000000-0").unwrap();
        let b = StreamPosition::parse("1700000000000-1").unwrap();
        let c = StreamPosition::parse("1700000000001-0").unwrap();
        let (oa, ob, oc) = (a.to_offset().unwrap(), b.to_offset().unwrap(), c.to_offset().unwrap());
        assert!(oa < ob && ob < oc);
        assert_eq!(StreamPosition::from_offset(ob), b);
    }

    #[test]
    fn test_offset_rejects_oversized_seq() {
        let pos = StreamPosition {
            millis: 1,
            seq: SEQ_MASK + 1,
        };
        assert!(pos.to_offset().is_err());
    }

    #[test]
    fn test_predecessor() {
        assert_eq!(StreamPosition::ZERO.predecessor(), StreamPosition::ZERO);
        assert_eq!(
            StreamPosition { millis: 5, seq: 2 }.predecessor(),
            StreamPosition { millis: 5, seq: 1 }
        );
        assert_eq!(
            StreamPosition { millis: 5, seq: 0 }.predecessor(),
            StreamPosition {
                millis: 4,
                seq: u64::MAX
            }
        );
    }

    #[test]
    fn test_fields_round_trip() {
        let mut props = TransportProperties::default();
        props.message_id = Some("m-1".into());
        props.timestamp = 1_700_000_000;
        props.headers.insert("eventName", "CommunicationPartyUpdated");
        props.headers.insert(PROPERTIES_HEADER, HeaderValue::Bytes(vec![0x00, 0x53, 0x73, 0x45]));
        let message = StreamMessage::new(props, b"{}".to_vec());

        let fields: HashMap<String, redis::Value> = message_to_fields(&message)
            .into_iter()
            .map(|(k, v)| (k, redis::Value::BulkString(v)))
            .collect();
        let back = message_from_fields(fields);

        assert_eq!(back, message);
    }

    #[test]
    fn test_non_utf8_header_stays_bytes() {
        let fields = HashMap::from([("blob".to_string(), redis::Value::BulkString(vec![0xff, 0xfe]))]);
        let message = message_from_fields(fields);
        assert_eq!(
            message.properties.headers.get("blob"),
            Some(&HeaderValue::Bytes(vec![0xff, 0xfe]))
        );
    }
}
