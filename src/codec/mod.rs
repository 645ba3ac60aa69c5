// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! AMQP 1.0 binary descriptor codec.
//!
//! Messages that crossed an AMQP 1.0 hop carry their `properties` and
//! `application-properties` sections as opaque binary blobs inside the
//! transport's header bag. This module turns those blobs into typed
//! [`Record`]s and back.
//!
//! # Wire format
//!
//! A record is a described value: the `0x00` constructor, a descriptor
//! (ulong code or symbol name), then the body.
//!
//! ```text
//! 00 53 73 c0 <size> <count> <field>...     properties (list)
//! 00 53 74 c1 <size> <count> <k> <v>...     application-properties (map)
//! ```
//!
//! Descriptors are resolved through a [`DescriptorRegistry`]. Unknown
//! descriptors are an error; the [`PropertyMapper`](crate::mapper::PropertyMapper)
//! treats every codec error as "no data".

mod records;
pub mod registry;
pub mod value;

use std::sync::Arc;

use thiserror::Error;

use crate::properties::{ApplicationProperties, EnvelopeProperties};

pub use registry::{DescriptorRegistry, RecordConstructor, Registration};
pub use value::AmqpValue;

/// A descriptor: 64-bit code plus symbolic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub code: u64,
    pub name: &'static str,
}

impl Descriptor {
    /// `amqp:properties:list`
    pub const PROPERTIES: Descriptor = Descriptor {
        code: 0x73,
        name: "amqp:properties:list",
    };

    /// `amqp:application-properties:map`
    pub const APPLICATION_PROPERTIES: Descriptor = Descriptor {
        code: 0x74,
        name: "amqp:application-properties:map",
    };
}

/// A typed described value.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Properties(EnvelopeProperties),
    ApplicationProperties(ApplicationProperties),
}

impl Record {
    pub fn descriptor(&self) -> Descriptor {
        match self {
            Self::Properties(_) => Descriptor::PROPERTIES,
            Self::ApplicationProperties(_) => Descriptor::APPLICATION_PROPERTIES,
        }
    }

    /// The record as a described value with a numeric descriptor.
    pub fn to_value(&self) -> AmqpValue {
        let body = match self {
            Self::Properties(p) => records::properties_body(p),
            Self::ApplicationProperties(a) => records::application_properties_body(a),
        };
        AmqpValue::Described(
            Box::new(AmqpValue::Ulong(self.descriptor().code)),
            Box::new(body),
        )
    }
}

/// Errors produced while decoding a blob.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("invalid format code 0x{0:02x}")]
    InvalidFormatCode(u8),

    #[error("unsupported format code 0x{0:02x}")]
    UnsupportedFormatCode(u8),

    #[error("invalid boolean byte 0x{0:02x}")]
    InvalidBoolean(u8),

    #[error("invalid UTF-8 in string or symbol")]
    InvalidUtf8,

    #[error("invalid char code point {0:#x}")]
    InvalidChar(u32),

    #[error("map has odd element count {0}")]
    OddMapCount(usize),

    #[error("nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    #[error("value is not a described type")]
    NotDescribed,

    #[error("descriptor must be a ulong or symbol, found {0}")]
    InvalidDescriptor(&'static str),

    #[error("unknown descriptor {0}")]
    UnknownDescriptor(String),

    #[error("field {field}: expected {expected}, found {found}")]
    UnexpectedType {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
}

/// Encoder/decoder bound to a descriptor registry.
#[derive(Debug, Clone)]
pub struct AmqpCodec {
    registry: Arc<DescriptorRegistry>,
}

impl AmqpCodec {
    /// Bind to `registry`, registering the standard sections if needed.
    pub fn new(registry: Arc<DescriptorRegistry>) -> Self {
        registry.register_standard();
        Self { registry }
    }

    /// Codec with its own registry holding only the standard sections.
    pub fn standard() -> Self {
        Self::new(Arc::new(DescriptorRegistry::new()))
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    pub fn encode(&self, record: &Record) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        record.to_value().encode(&mut buf);
        buf
    }

    /// Decode a single described record. Trailing bytes are ignored.
    pub fn decode(&self, bytes: &[u8]) -> Result<Record, CodecError> {
        let mut buf = bytes;
        let AmqpValue::Described(descriptor, body) = AmqpValue::decode(&mut buf)? else {
            return Err(CodecError::NotDescribed);
        };

        let resolved = match *descriptor {
            AmqpValue::Ulong(code) => self
                .registry
                .resolve_code(code)
                .ok_or_else(|| CodecError::UnknownDescriptor(format!("{code:#x}")))?,
            AmqpValue::Symbol(name) => self
                .registry
                .resolve_name(&name)
                .ok_or(CodecError::UnknownDescriptor(name))?,
            other => return Err(CodecError::InvalidDescriptor(other.type_name())),
        };

        let (_, construct) = resolved;
        construct(*body)
    }
}

impl Default for AmqpCodec {
    fn default() -> Self {
        Self::standard()
    }
}
