// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message metadata shared by the codec, the mapper and the brokers.
//!
//! # Reserved header keys
//!
//! | Key | Content |
//! |-----|---------|
//! | `x-amqp-1.0-properties` | encoded `properties` section |
//! | `x-amqp-1.0-app-properties` | encoded `application-properties` section |
//! | `x-amqp-1.0-properties-to` | `to` address, plain string |
//! | `x-amqp-1.0-properties-subject` | `subject`, plain string |
//! | `x-amqp-1.0-properties-absolute-expiry-time` | expiry, ISO-8601 string |
//!
//! Everything under the `x-amqp-1.0-` prefix belongs to the codec and is
//! never packed into application properties.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use indexmap::IndexMap;
use uuid::Uuid;

use crate::codec::{AmqpValue, CodecError};

pub const RESERVED_PREFIX: &str = "x-amqp-1.0-";
pub const PROPERTIES_HEADER: &str = "x-amqp-1.0-properties";
pub const APPLICATION_PROPERTIES_HEADER: &str = "x-amqp-1.0-app-properties";
pub const TO_HEADER: &str = "x-amqp-1.0-properties-to";
pub const SUBJECT_HEADER: &str = "x-amqp-1.0-properties-subject";
pub const ABSOLUTE_EXPIRY_TIME_HEADER: &str = "x-amqp-1.0-properties-absolute-expiry-time";

/// Whether `key` is owned by the codec.
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

/// Format a time the way expiry headers carry it.
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// =============================================================================
// AMQP 1.0 sections
// =============================================================================

/// AMQP 1.0 `message-id` / `correlation-id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Ulong(u64),
    Uuid(Uuid),
    Binary(Vec<u8>),
    String(String),
}

impl MessageId {
    pub(crate) fn to_amqp(&self) -> AmqpValue {
        match self {
            Self::Ulong(v) => AmqpValue::Ulong(*v),
            Self::Uuid(u) => AmqpValue::Uuid(*u),
            Self::Binary(b) => AmqpValue::Binary(b.clone()),
            Self::String(s) => AmqpValue::String(s.clone()),
        }
    }
}

impl From<&str> for MessageId {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

/// An AMQP 1.0 timestamp: whole milliseconds after the unix epoch.
///
/// The wire has no finer resolution and treats zero as unset, so both are
/// enforced at construction and every value survives the codec unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AmqpTimestamp(DateTime<Utc>);

impl AmqpTimestamp {
    /// `None` at or before the epoch, or outside chrono's range.
    pub fn from_millis(ms: i64) -> Option<Self> {
        if ms <= 0 {
            return None;
        }
        Utc.timestamp_millis_opt(ms).single().map(Self)
    }

    /// Truncates to the millisecond.
    pub fn from_datetime(time: DateTime<Utc>) -> Option<Self> {
        Self::from_millis(time.timestamp_millis())
    }

    pub fn millis(self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

/// The AMQP 1.0 `properties` section. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeProperties {
    pub message_id: Option<MessageId>,
    pub user_id: Option<Vec<u8>>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<MessageId>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub absolute_expiry_time: Option<AmqpTimestamp>,
    pub creation_time: Option<AmqpTimestamp>,
    pub group_id: Option<String>,
    pub group_sequence: Option<u32>,
    pub reply_to_group_id: Option<String>,
}

impl EnvelopeProperties {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A non-compound AMQP value, the only kind application properties carry.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleValue(AmqpValue);

impl SimpleValue {
    pub fn as_amqp(&self) -> &AmqpValue {
        &self.0
    }

    pub fn into_amqp(self) -> AmqpValue {
        self.0
    }
}

impl TryFrom<AmqpValue> for SimpleValue {
    type Error = CodecError;

    fn try_from(value: AmqpValue) -> Result<Self, Self::Error> {
        if value.is_compound() {
            return Err(CodecError::UnexpectedType {
                field: "application-properties value",
                expected: "simple type",
                found: value.type_name(),
            });
        }
        Ok(Self(value))
    }
}

macro_rules! simple_value_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for SimpleValue {
                fn from(v: $ty) -> Self {
                    Self(AmqpValue::from(v))
                }
            }
        )*
    };
}

simple_value_from!(&str, String, bool, i32, i64, f64, Vec<u8>, Uuid);

impl From<AmqpTimestamp> for SimpleValue {
    fn from(v: AmqpTimestamp) -> Self {
        Self(AmqpValue::Timestamp(v.millis()))
    }
}

/// The AMQP 1.0 `application-properties` section: string keys to simple
/// values, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplicationProperties(IndexMap<String, SimpleValue>);

impl ApplicationProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<SimpleValue>) -> Option<SimpleValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&AmqpValue> {
        self.0.get(key).map(SimpleValue::as_amqp)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, SimpleValue> {
        self.0.iter()
    }
}

impl IntoIterator for ApplicationProperties {
    type Item = (String, SimpleValue);
    type IntoIter = indexmap::map::IntoIter<String, SimpleValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(String, SimpleValue)> for ApplicationProperties {
    fn from_iter<I: IntoIterator<Item = (String, SimpleValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// =============================================================================
// Transport side
// =============================================================================

/// A header value as the transport carries it.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Long(i64),
    Double(f64),
    Timestamp(DateTime<Utc>),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Textual form, if the value has one. Byte blobs only qualify when
    /// they are valid UTF-8.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.clone()),
            Self::Bytes(b) => String::from_utf8(b.clone()).ok(),
            Self::Bool(v) => Some(v.to_string()),
            Self::Long(v) => Some(v.to_string()),
            Self::Double(v) => Some(v.to_string()),
            Self::Timestamp(t) => Some(format_timestamp(*t)),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Insertion-ordered, case-sensitive header map.
///
/// Equality ignores order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderBag(IndexMap<String, HeaderValue>);

impl HeaderBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.0.get(key)
    }

    /// String value of `key`, if it holds one.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(HeaderValue::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert or replace, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Option<HeaderValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Insert only when `key` is absent. Returns whether the value was added.
    pub fn insert_if_absent(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> bool {
        match self.0.entry(key.into()) {
            indexmap::map::Entry::Occupied(_) => false,
            indexmap::map::Entry::Vacant(slot) => {
                slot.insert(value.into());
                true
            }
        }
    }

    /// Remove `key`, keeping the order of the remaining headers.
    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        self.0.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, HeaderValue> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<HeaderValue>> FromIterator<(K, V)> for HeaderBag {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<'a> IntoIterator for &'a HeaderBag {
    type Item = (&'a String, &'a HeaderValue);
    type IntoIter = indexmap::map::Iter<'a, String, HeaderValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Direct transport fields plus the header bag.
///
/// `timestamp` is unix seconds; zero or negative means unset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportProperties {
    pub message_id: Option<String>,
    pub user_id: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub timestamp: i64,
    pub headers: HeaderBag,
}

impl TransportProperties {
    pub fn with_headers(headers: HeaderBag) -> Self {
        Self {
            headers,
            ..Default::default()
        }
    }
}
