// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Body layouts for the standard message sections.

use super::{AmqpValue, CodecError, Record};
use crate::properties::{AmqpTimestamp, ApplicationProperties, EnvelopeProperties, MessageId, SimpleValue};

// properties: list of 13 fields, trailing nulls omitted.
pub(crate) fn properties_body(p: &EnvelopeProperties) -> AmqpValue {
    let mut fields = vec![
        p.message_id.as_ref().map_or(AmqpValue::Null, MessageId::to_amqp),
        p.user_id.clone().map_or(AmqpValue::Null, AmqpValue::Binary),
        p.to.clone().map_or(AmqpValue::Null, AmqpValue::String),
        p.subject.clone().map_or(AmqpValue::Null, AmqpValue::String),
        p.reply_to.clone().map_or(AmqpValue::Null, AmqpValue::String),
        p.correlation_id.as_ref().map_or(AmqpValue::Null, MessageId::to_amqp),
        p.content_type.clone().map_or(AmqpValue::Null, AmqpValue::Symbol),
        p.content_encoding.clone().map_or(AmqpValue::Null, AmqpValue::Symbol),
        timestamp_value(p.absolute_expiry_time),
        timestamp_value(p.creation_time),
        p.group_id.clone().map_or(AmqpValue::Null, AmqpValue::String),
        p.group_sequence.map_or(AmqpValue::Null, AmqpValue::Uint),
        p.reply_to_group_id.clone().map_or(AmqpValue::Null, AmqpValue::String),
    ];
    while fields.last() == Some(&AmqpValue::Null) {
        fields.pop();
    }
    AmqpValue::List(fields)
}

pub(crate) fn properties_from_body(body: AmqpValue) -> Result<Record, CodecError> {
    let fields = match body {
        AmqpValue::List(fields) => fields,
        other => return Err(unexpected("properties", "list", &other)),
    };
    let mut fields = fields.into_iter();

    let message_id = message_id_field("message-id", take(&mut fields))?;
    let user_id = binary_field("user-id", take(&mut fields))?;
    let to = string_field("to", take(&mut fields))?;
    let subject = string_field("subject", take(&mut fields))?;
    let reply_to = string_field("reply-to", take(&mut fields))?;
    let correlation_id = message_id_field("correlation-id", take(&mut fields))?;
    let content_type = symbol_field("content-type", take(&mut fields))?;
    let content_encoding = symbol_field("content-encoding", take(&mut fields))?;
    let absolute_expiry_time = timestamp_field("absolute-expiry-time", take(&mut fields))?;
    let creation_time = timestamp_field("creation-time", take(&mut fields))?;
    let group_id = string_field("group-id", take(&mut fields))?;
    let group_sequence = match take(&mut fields) {
        AmqpValue::Null => None,
        AmqpValue::Uint(v) => Some(v),
        other => return Err(unexpected("group-sequence", "uint", &other)),
    };
    let reply_to_group_id = string_field("reply-to-group-id", take(&mut fields))?;

    Ok(Record::Properties(EnvelopeProperties {
        message_id,
        user_id,
        to,
        subject,
        reply_to,
        correlation_id,
        content_type,
        content_encoding,
        absolute_expiry_time,
        creation_time,
        group_id,
        group_sequence,
        reply_to_group_id,
    }))
}

pub(crate) fn application_properties_body(a: &ApplicationProperties) -> AmqpValue {
    AmqpValue::Map(
        a.iter()
            .map(|(key, value)| (AmqpValue::String(key.clone()), value.as_amqp().clone()))
            .collect(),
    )
}

pub(crate) fn application_properties_from_body(body: AmqpValue) -> Result<Record, CodecError> {
    let entries = match body {
        AmqpValue::Map(entries) => entries,
        other => return Err(unexpected("application-properties", "map", &other)),
    };

    let mut properties = ApplicationProperties::new();
    for (key, value) in entries {
        let key = match key {
            AmqpValue::String(k) | AmqpValue::Symbol(k) => k,
            other => return Err(unexpected("application-properties key", "string", &other)),
        };
        properties.insert(key, SimpleValue::try_from(value)?);
    }
    Ok(Record::ApplicationProperties(properties))
}

fn take(fields: &mut impl Iterator<Item = AmqpValue>) -> AmqpValue {
    fields.next().unwrap_or(AmqpValue::Null)
}

fn unexpected(field: &'static str, expected: &'static str, found: &AmqpValue) -> CodecError {
    CodecError::UnexpectedType {
        field,
        expected,
        found: found.type_name(),
    }
}

fn string_field(field: &'static str, value: AmqpValue) -> Result<Option<String>, CodecError> {
    match value {
        AmqpValue::Null => Ok(None),
        AmqpValue::String(s) => Ok(Some(s)),
        other => Err(unexpected(field, "string", &other)),
    }
}

// Some peers send content-type as a string.
fn symbol_field(field: &'static str, value: AmqpValue) -> Result<Option<String>, CodecError> {
    match value {
        AmqpValue::Null => Ok(None),
        AmqpValue::Symbol(s) | AmqpValue::String(s) => Ok(Some(s)),
        other => Err(unexpected(field, "symbol", &other)),
    }
}

fn binary_field(field: &'static str, value: AmqpValue) -> Result<Option<Vec<u8>>, CodecError> {
    match value {
        AmqpValue::Null => Ok(None),
        AmqpValue::Binary(b) => Ok(Some(b)),
        other => Err(unexpected(field, "binary", &other)),
    }
}

fn message_id_field(field: &'static str, value: AmqpValue) -> Result<Option<MessageId>, CodecError> {
    match value {
        AmqpValue::Null => Ok(None),
        AmqpValue::Ulong(v) => Ok(Some(MessageId::Ulong(v))),
        AmqpValue::Uuid(u) => Ok(Some(MessageId::Uuid(u))),
        AmqpValue::Binary(b) => Ok(Some(MessageId::Binary(b))),
        AmqpValue::String(s) => Ok(Some(MessageId::String(s))),
        other => Err(unexpected(field, "message-id", &other)),
    }
}

/// Zero (and anything before it) is the wire's "unset" time.
fn timestamp_field(field: &'static str, value: AmqpValue) -> Result<Option<AmqpTimestamp>, CodecError> {
    match value {
        AmqpValue::Null => Ok(None),
        AmqpValue::Timestamp(ms) => Ok(AmqpTimestamp::from_millis(ms)),
        other => Err(unexpected(field, "timestamp", &other)),
    }
}

fn timestamp_value(time: Option<AmqpTimestamp>) -> AmqpValue {
    time.map_or(AmqpValue::Null, |t| AmqpValue::Timestamp(t.millis()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_trailing_nulls_trimmed() {
        let props = EnvelopeProperties {
            message_id: Some(MessageId::Ulong(9)),
            ..Default::default()
        };
        assert_eq!(
            properties_body(&props),
            AmqpValue::List(vec![AmqpValue::Ulong(9)])
        );
        assert_eq!(
            properties_body(&EnvelopeProperties::default()),
            AmqpValue::List(vec![])
        );
    }

    #[test]
    fn test_short_list_fills_with_none() {
        let Record::Properties(props) =
            properties_from_body(AmqpValue::List(vec![AmqpValue::from("id")])).unwrap()
        else {
            panic!("expected properties");
        };
        assert_eq!(props.message_id, Some(MessageId::String("id".into())));
        assert!(props.to.is_none());
        assert!(props.reply_to_group_id.is_none());
    }

    #[test]
    fn test_zero_timestamp_is_unset() {
        let mut fields = vec![AmqpValue::Null; 9];
        fields.push(AmqpValue::Timestamp(0));
        let Record::Properties(props) = properties_from_body(AmqpValue::List(fields)).unwrap()
        else {
            panic!("expected properties");
        };
        assert!(props.creation_time.is_none());
    }

    #[test]
    fn test_sub_millisecond_time_survives_roundtrip() {
        let precise = Utc.timestamp_nanos(1_700_000_000_123_456_789);
        let props = EnvelopeProperties {
            creation_time: AmqpTimestamp::from_datetime(precise),
            ..Default::default()
        };
        let Record::Properties(back) = properties_from_body(properties_body(&props)).unwrap() else {
            panic!("expected properties");
        };
        assert_eq!(back, props);
        assert_eq!(back.creation_time.map(AmqpTimestamp::millis), Some(1_700_000_000_123));
    }

    #[test]
    fn test_wrong_field_type() {
        let err = properties_from_body(AmqpValue::List(vec![
            AmqpValue::Null,
            AmqpValue::from("not-binary"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            CodecError::UnexpectedType {
                field: "user-id",
                expected: "binary",
                found: "string"
            }
        );
    }

    #[test]
    fn test_application_properties_reject_compound_values() {
        let body = AmqpValue::Map(vec![(AmqpValue::from("k"), AmqpValue::List(vec![]))]);
        assert_eq!(
            application_properties_from_body(body).unwrap_err(),
            CodecError::UnexpectedType {
                field: "application-properties value",
                expected: "simple type",
                found: "list"
            }
        );
    }

    #[test]
    fn test_application_properties_roundtrip() {
        let mut app = ApplicationProperties::new();
        app.insert("eventName", "CommunicationPartyUpdated");
        app.insert("herId", 4200);
        app.insert("blob", vec![1u8, 2, 3]);
        app.insert("sent", AmqpTimestamp::from_millis(1_700_000_000_001).unwrap());

        let Record::ApplicationProperties(back) =
            application_properties_from_body(application_properties_body(&app)).unwrap()
        else {
            panic!("expected application properties");
        };
        assert_eq!(back, app);
    }

    #[test]
    fn test_application_properties_reject_non_string_keys() {
        let body = AmqpValue::Map(vec![(AmqpValue::Int(1), AmqpValue::from("v"))]);
        assert!(application_properties_from_body(body).is_err());
    }

    #[test]
    fn test_application_properties_keep_order() {
        let body = AmqpValue::Map(vec![
            (AmqpValue::from("b"), AmqpValue::Int(2)),
            (AmqpValue::from("a"), AmqpValue::Int(1)),
        ]);
        let Record::ApplicationProperties(app) = application_properties_from_body(body).unwrap()
        else {
            panic!("expected application properties");
        };
        let keys: Vec<_> = app.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }
}
