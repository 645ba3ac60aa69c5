// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property mapper between AMQP 1.0 blobs and plain transport headers.
//!
//! # Receive path
//!
//! [`PropertyMapper::normalize_incoming`] decodes the reserved blob headers
//! and folds their content into plain headers, first write wins, then drops
//! the blobs. Handlers downstream only ever look at plain headers.
//!
//! # Send path
//!
//! [`PropertyMapper::denormalize_outgoing`] does the reverse: it builds the
//! `properties` section from the direct transport fields and the derived
//! headers, and packs every non-reserved header into an
//! `application-properties` blob.
//!
//! Absent or malformed blobs are never an error: the mapper logs and leaves
//! the header bag as it found it.

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::codec::{AmqpCodec, AmqpValue, Record};
use crate::properties::{
    format_timestamp, is_reserved_key, AmqpTimestamp, ApplicationProperties, EnvelopeProperties,
    HeaderBag, HeaderValue, MessageId, SimpleValue, TransportProperties, ABSOLUTE_EXPIRY_TIME_HEADER,
    APPLICATION_PROPERTIES_HEADER, PROPERTIES_HEADER, SUBJECT_HEADER, TO_HEADER,
};

/// Bytes of a malformed blob included in the warning.
const BLOB_LOG_PREFIX: usize = 16;

/// Stateless converter; cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct PropertyMapper {
    codec: AmqpCodec,
}

impl PropertyMapper {
    pub fn new(codec: AmqpCodec) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &AmqpCodec {
        &self.codec
    }

    /// Fold incoming AMQP 1.0 blobs into plain headers.
    ///
    /// Idempotent: a second call finds no blobs (or the same malformed ones)
    /// and changes nothing.
    pub fn normalize_incoming(&self, headers: &mut HeaderBag) {
        self.fold_properties(headers);
        self.fold_application_properties(headers);
    }

    /// Rebuild the AMQP 1.0 blobs for an outgoing message.
    pub fn denormalize_outgoing(&self, transport: &mut TransportProperties) {
        let mut properties = EnvelopeProperties {
            message_id: non_empty(&transport.message_id).map(MessageId::from),
            user_id: non_empty(&transport.user_id).map(|u| u.as_bytes().to_vec()),
            reply_to: non_empty(&transport.reply_to).map(str::to_owned),
            correlation_id: non_empty(&transport.correlation_id).map(MessageId::from),
            content_type: non_empty(&transport.content_type).map(str::to_owned),
            content_encoding: non_empty(&transport.content_encoding).map(str::to_owned),
            creation_time: creation_time(transport.timestamp),
            ..Default::default()
        };

        let headers = &mut transport.headers;
        properties.to = take_text(headers, TO_HEADER);
        properties.subject = take_text(headers, SUBJECT_HEADER);
        properties.absolute_expiry_time = take_expiry(headers);

        let blob = self.codec.encode(&Record::Properties(properties));
        if headers.insert(PROPERTIES_HEADER, blob).is_some() {
            debug!(header = PROPERTIES_HEADER, "Replaced existing properties blob");
        }

        let application: ApplicationProperties = headers
            .iter()
            .filter(|(key, _)| !is_reserved_key(key))
            .map(|(key, value)| (key.clone(), amqp_from_header(value)))
            .collect();
        if !application.is_empty() {
            let blob = self.codec.encode(&Record::ApplicationProperties(application));
            headers.insert(APPLICATION_PROPERTIES_HEADER, blob);
        }
    }

    fn fold_properties(&self, headers: &mut HeaderBag) {
        let Some(properties) = self.decode_blob(headers, PROPERTIES_HEADER, |record| match record {
            Record::Properties(p) => Some(p),
            _ => None,
        }) else {
            return;
        };

        if let Some(to) = properties.to.filter(|s| !s.is_empty()) {
            headers.insert_if_absent(TO_HEADER, to);
        }
        if let Some(subject) = properties.subject.filter(|s| !s.is_empty()) {
            headers.insert_if_absent(SUBJECT_HEADER, subject);
        }
        if let Some(expiry) = properties.absolute_expiry_time {
            headers.insert_if_absent(ABSOLUTE_EXPIRY_TIME_HEADER, format_timestamp(expiry.to_datetime()));
        }
        headers.remove(PROPERTIES_HEADER);
    }

    fn fold_application_properties(&self, headers: &mut HeaderBag) {
        let Some(application) =
            self.decode_blob(headers, APPLICATION_PROPERTIES_HEADER, |record| match record {
                Record::ApplicationProperties(a) => Some(a),
                _ => None,
            })
        else {
            return;
        };

        for (key, value) in application {
            if is_reserved_key(&key) {
                debug!(key = %key, "Skipping reserved key inside application properties");
                continue;
            }
            if let Some(value) = header_from_amqp(value.into_amqp()) {
                headers.insert_if_absent(key, value);
            }
        }
        headers.remove(APPLICATION_PROPERTIES_HEADER);
    }

    fn decode_blob<T>(
        &self,
        headers: &HeaderBag,
        key: &'static str,
        select: impl FnOnce(Record) -> Option<T>,
    ) -> Option<T> {
        let bytes = match headers.get(key)? {
            HeaderValue::Bytes(bytes) if !bytes.is_empty() => bytes,
            HeaderValue::Bytes(_) => return None,
            _ => {
                debug!(header = key, "Reserved header is not a byte blob, leaving it in place");
                return None;
            }
        };

        match self.codec.decode(bytes) {
            Ok(record) => {
                let descriptor = record.descriptor();
                let selected = select(record);
                if selected.is_none() {
                    warn!(
                        header = key,
                        descriptor = descriptor.name,
                        "Blob holds an unexpected section, leaving it in place"
                    );
                }
                selected
            }
            Err(e) => {
                warn!(
                    header = key,
                    error = %e,
                    len = bytes.len(),
                    prefix = %hex::encode(&bytes[..bytes.len().min(BLOB_LOG_PREFIX)]),
                    "Malformed AMQP 1.0 blob, leaving it in place"
                );
                None
            }
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Transport timestamps are unix seconds; zero means unset.
fn creation_time(unix_seconds: i64) -> Option<AmqpTimestamp> {
    AmqpTimestamp::from_millis(unix_seconds.checked_mul(1000)?)
}

fn take_text(headers: &mut HeaderBag, key: &str) -> Option<String> {
    let text = headers.get(key)?.to_text()?;
    headers.remove(key);
    Some(text).filter(|t| !t.is_empty())
}

fn take_expiry(headers: &mut HeaderBag) -> Option<AmqpTimestamp> {
    let parsed = match headers.get(ABSOLUTE_EXPIRY_TIME_HEADER)? {
        HeaderValue::Timestamp(t) => Some(*t),
        other => other
            .to_text()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)),
    };

    match parsed {
        Some(expiry) => {
            headers.remove(ABSOLUTE_EXPIRY_TIME_HEADER);
            AmqpTimestamp::from_datetime(expiry)
        }
        None => {
            warn!(
                header = ABSOLUTE_EXPIRY_TIME_HEADER,
                "Expiry header is not a timestamp, leaving it in place"
            );
            None
        }
    }
}

fn amqp_from_header(value: &HeaderValue) -> SimpleValue {
    match value {
        HeaderValue::String(s) => SimpleValue::from(s.as_str()),
        HeaderValue::Bytes(b) => SimpleValue::from(b.clone()),
        HeaderValue::Bool(v) => SimpleValue::from(*v),
        HeaderValue::Long(v) => SimpleValue::from(*v),
        HeaderValue::Double(v) => SimpleValue::from(*v),
        HeaderValue::Timestamp(t) => match AmqpTimestamp::from_datetime(*t) {
            Some(ts) => SimpleValue::from(ts),
            None => SimpleValue::from(format_timestamp(*t)),
        },
    }
}

/// Application property values arrive as text, except binaries. Null,
/// empty and compound values produce no header.
fn header_from_amqp(value: AmqpValue) -> Option<HeaderValue> {
    let text = match value {
        AmqpValue::Null => return None,
        AmqpValue::Binary(bytes) if bytes.is_empty() => return None,
        AmqpValue::Binary(bytes) => return Some(HeaderValue::Bytes(bytes)),
        AmqpValue::String(s) | AmqpValue::Symbol(s) => s,
        AmqpValue::Bool(v) => v.to_string(),
        AmqpValue::Ubyte(v) => v.to_string(),
        AmqpValue::Ushort(v) => v.to_string(),
        AmqpValue::Uint(v) => v.to_string(),
        AmqpValue::Ulong(v) => v.to_string(),
        AmqpValue::Byte(v) => v.to_string(),
        AmqpValue::Short(v) => v.to_string(),
        AmqpValue::Int(v) => v.to_string(),
        AmqpValue::Long(v) => v.to_string(),
        AmqpValue::Float(v) => v.to_string(),
        AmqpValue::Double(v) => v.to_string(),
        AmqpValue::Char(c) => c.to_string(),
        AmqpValue::Uuid(u) => u.to_string(),
        AmqpValue::Timestamp(ms) => match Utc.timestamp_millis_opt(ms).single() {
            Some(t) => format_timestamp(t),
            None => ms.to_string(),
        },
        AmqpValue::List(_) | AmqpValue::Map(_) | AmqpValue::Described(..) => return None,
    };
    if text.is_empty() {
        return None;
    }
    Some(HeaderValue::String(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> PropertyMapper {
        PropertyMapper::default()
    }

    fn properties_blob(properties: EnvelopeProperties) -> Vec<u8> {
        AmqpCodec::standard().encode(&Record::Properties(properties))
    }

    fn application_blob(pairs: &[(&str, AmqpValue)]) -> Vec<u8> {
        let app: ApplicationProperties = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), SimpleValue::try_from(v.clone()).unwrap()))
            .collect();
        AmqpCodec::standard().encode(&Record::ApplicationProperties(app))
    }

    fn decode_properties(bytes: &HeaderValue) -> EnvelopeProperties {
        match AmqpCodec::standard().decode(bytes.as_bytes().unwrap()).unwrap() {
            Record::Properties(p) => p,
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_normalize_folds_properties() {
        let expiry = AmqpTimestamp::from_millis(1_800_000_000_000).unwrap();
        let mut headers = HeaderBag::new();
        headers.insert(
            PROPERTIES_HEADER,
            properties_blob(EnvelopeProperties {
                to: Some("registry".into()),
                subject: Some("update".into()),
                absolute_expiry_time: Some(expiry),
                ..Default::default()
            }),
        );

        mapper().normalize_incoming(&mut headers);

        assert!(!headers.contains_key(PROPERTIES_HEADER));
        assert_eq!(headers.get_str(TO_HEADER), Some("registry"));
        assert_eq!(headers.get_str(SUBJECT_HEADER), Some("update"));
        assert_eq!(
            headers.get_str(ABSOLUTE_EXPIRY_TIME_HEADER),
            Some("2027-01-15T08:00:00.000Z")
        );
    }

    #[test]
    fn test_normalize_does_not_overwrite_plain_values() {
        let mut headers = HeaderBag::new();
        headers.insert(TO_HEADER, "already-set");
        headers.insert("herId", "1");
        headers.insert(
            PROPERTIES_HEADER,
            properties_blob(EnvelopeProperties {
                to: Some("from-blob".into()),
                ..Default::default()
            }),
        );
        headers.insert(
            APPLICATION_PROPERTIES_HEADER,
            application_blob(&[("herId", AmqpValue::Int(4200)), ("eventName", "X".into())]),
        );

        mapper().normalize_incoming(&mut headers);

        assert_eq!(headers.get_str(TO_HEADER), Some("already-set"));
        assert_eq!(headers.get_str("herId"), Some("1"));
        assert_eq!(headers.get_str("eventName"), Some("X"));
    }

    #[test]
    fn test_normalize_application_properties_as_text() {
        let mut headers = HeaderBag::new();
        headers.insert(
            APPLICATION_PROPERTIES_HEADER,
            application_blob(&[
                ("eventName", "CommunicationPartyCreated".into()),
                ("herId", AmqpValue::Int(4200)),
                ("empty", "".into()),
                ("nothing", AmqpValue::Null),
                ("raw", AmqpValue::Binary(vec![1, 2])),
            ]),
        );

        mapper().normalize_incoming(&mut headers);

        assert_eq!(headers.get_str("eventName"), Some("CommunicationPartyCreated"));
        assert_eq!(headers.get_str("herId"), Some("4200"));
        assert_eq!(headers.get("raw"), Some(&HeaderValue::Bytes(vec![1, 2])));
        assert!(!headers.contains_key("empty"));
        assert!(!headers.contains_key("nothing"));
        assert!(!headers.contains_key(APPLICATION_PROPERTIES_HEADER));
    }

    #[test]
    fn test_normalize_without_blobs_is_noop() {
        let mut headers: HeaderBag = [("eventName", "X"), ("herId", "1")].into_iter().collect();
        let before = headers.clone();
        mapper().normalize_incoming(&mut headers);
        assert_eq!(headers, before);
    }

    #[test]
    fn test_normalize_malformed_blob_is_noop() {
        let mut headers = HeaderBag::new();
        headers.insert(PROPERTIES_HEADER, vec![0x00, 0x53, 0x73, 0xc0, 0x09]);
        headers.insert(APPLICATION_PROPERTIES_HEADER, vec![0xde, 0xad]);
        let before = headers.clone();

        mapper().normalize_incoming(&mut headers);
        assert_eq!(headers, before);
    }

    #[test]
    fn test_normalize_non_binary_blob_is_noop() {
        let mut headers = HeaderBag::new();
        headers.insert(PROPERTIES_HEADER, "not bytes");
        let before = headers.clone();
        mapper().normalize_incoming(&mut headers);
        assert_eq!(headers, before);
    }

    #[test]
    fn test_normalize_wrong_section_is_noop() {
        let mut headers = HeaderBag::new();
        headers.insert(PROPERTIES_HEADER, application_blob(&[("k", "v".into())]));
        let before = headers.clone();
        mapper().normalize_incoming(&mut headers);
        assert_eq!(headers, before);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut headers = HeaderBag::new();
        headers.insert(
            APPLICATION_PROPERTIES_HEADER,
            application_blob(&[("eventName", "X".into())]),
        );
        mapper().normalize_incoming(&mut headers);
        let once = headers.clone();
        mapper().normalize_incoming(&mut headers);
        assert_eq!(headers, once);
    }

    #[test]
    fn test_denormalize_empty_user_id_is_absent() {
        let mut transport = TransportProperties {
            user_id: Some(String::new()),
            ..Default::default()
        };
        mapper().denormalize_outgoing(&mut transport);

        let props = decode_properties(transport.headers.get(PROPERTIES_HEADER).unwrap());
        assert!(props.user_id.is_none());
    }

    #[test]
    fn test_denormalize_user_id_bytes() {
        let mut transport = TransportProperties {
            user_id: Some("relay".into()),
            ..Default::default()
        };
        mapper().denormalize_outgoing(&mut transport);

        let props = decode_properties(transport.headers.get(PROPERTIES_HEADER).unwrap());
        assert_eq!(props.user_id.as_deref(), Some(&b"relay"[..]));
    }

    #[test]
    fn test_denormalize_zero_timestamp_has_no_creation_time() {
        let mut transport = TransportProperties::default();
        mapper().denormalize_outgoing(&mut transport);

        let props = decode_properties(transport.headers.get(PROPERTIES_HEADER).unwrap());
        assert!(props.creation_time.is_none());
    }

    #[test]
    fn test_denormalize_timestamp_is_seconds() {
        let mut transport = TransportProperties {
            timestamp: 1_700_000_000,
            ..Default::default()
        };
        mapper().denormalize_outgoing(&mut transport);

        let props = decode_properties(transport.headers.get(PROPERTIES_HEADER).unwrap());
        assert_eq!(props.creation_time.map(|t| t.to_datetime().timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn test_denormalize_folds_derived_headers() {
        let mut transport = TransportProperties::default();
        transport.headers.insert(TO_HEADER, "registry");
        transport.headers.insert(SUBJECT_HEADER, "update");
        transport
            .headers
            .insert(ABSOLUTE_EXPIRY_TIME_HEADER, "2027-01-15T08:00:00.000Z");

        mapper().denormalize_outgoing(&mut transport);

        assert!(!transport.headers.contains_key(TO_HEADER));
        assert!(!transport.headers.contains_key(SUBJECT_HEADER));
        assert!(!transport.headers.contains_key(ABSOLUTE_EXPIRY_TIME_HEADER));
        let props = decode_properties(transport.headers.get(PROPERTIES_HEADER).unwrap());
        assert_eq!(props.to.as_deref(), Some("registry"));
        assert_eq!(props.subject.as_deref(), Some("update"));
        assert_eq!(
            props.absolute_expiry_time.map(AmqpTimestamp::millis),
            Some(1_800_000_000_000)
        );
        // Only reserved keys remain, so no application properties blob.
        assert!(!transport.headers.contains_key(APPLICATION_PROPERTIES_HEADER));
    }

    #[test]
    fn test_denormalize_leaves_unparseable_expiry() {
        let mut transport = TransportProperties::default();
        transport.headers.insert(ABSOLUTE_EXPIRY_TIME_HEADER, "tomorrow");
        mapper().denormalize_outgoing(&mut transport);
        assert_eq!(
            transport.headers.get_str(ABSOLUTE_EXPIRY_TIME_HEADER),
            Some("tomorrow")
        );
    }

    #[test]
    fn test_denormalize_packs_plain_headers() {
        let mut transport = TransportProperties::default();
        transport.headers.insert("eventName", "CommunicationPartyUpdated");
        transport.headers.insert("herId", 4200i64);

        mapper().denormalize_outgoing(&mut transport);

        let blob = transport.headers.get(APPLICATION_PROPERTIES_HEADER).unwrap();
        let Record::ApplicationProperties(app) =
            AmqpCodec::standard().decode(blob.as_bytes().unwrap()).unwrap()
        else {
            panic!("expected application properties");
        };
        assert_eq!(app.len(), 2);
        assert_eq!(app.get("herId"), Some(&AmqpValue::Long(4200)));
        // Plain headers stay for transport-level readers.
        assert_eq!(transport.headers.get_str("eventName"), Some("CommunicationPartyUpdated"));
    }

    #[test]
    fn test_denormalize_then_normalize_restores_headers() {
        let original: HeaderBag = [
            ("eventName", "CommunicationPartyCreated"),
            ("herId", "4200"),
            (TO_HEADER, "registry"),
        ]
        .into_iter()
        .collect();

        let mut transport = TransportProperties::with_headers(original.clone());
        mapper().denormalize_outgoing(&mut transport);
        let mut headers = transport.headers;
        mapper().normalize_incoming(&mut headers);

        assert_eq!(headers, original);
    }
}
