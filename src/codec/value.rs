// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! AMQP 1.0 primitive type system (core types, section 1.6).
//!
//! The encoder always picks the most compact constructor for a value, and the
//! decoder accepts every fixed and variable width form, so
//! `decode(encode(v)) == v` holds for all values without NaN floats.
//!
//! Arrays (`0xe0`/`0xf0`) are not produced by any peer this relay talks to
//! and are rejected as unsupported.

use bytes::{Buf, BufMut};
use uuid::Uuid;

use super::CodecError;

/// Maximum nesting of lists, maps and described values accepted by the decoder.
pub const MAX_DEPTH: usize = 32;

/// AMQP 1.0 format codes.
pub mod format_code {
    pub const DESCRIBED: u8 = 0x00;
    pub const NULL: u8 = 0x40;
    pub const BOOLEAN_TRUE: u8 = 0x41;
    pub const BOOLEAN_FALSE: u8 = 0x42;
    pub const UINT0: u8 = 0x43;
    pub const ULONG0: u8 = 0x44;
    pub const LIST0: u8 = 0x45;
    pub const UBYTE: u8 = 0x50;
    pub const BYTE: u8 = 0x51;
    pub const SMALL_UINT: u8 = 0x52;
    pub const SMALL_ULONG: u8 = 0x53;
    pub const SMALL_INT: u8 = 0x54;
    pub const SMALL_LONG: u8 = 0x55;
    pub const BOOLEAN: u8 = 0x56;
    pub const USHORT: u8 = 0x60;
    pub const SHORT: u8 = 0x61;
    pub const UINT: u8 = 0x70;
    pub const INT: u8 = 0x71;
    pub const FLOAT: u8 = 0x72;
    pub const CHAR: u8 = 0x73;
    pub const ULONG: u8 = 0x80;
    pub const LONG: u8 = 0x81;
    pub const DOUBLE: u8 = 0x82;
    pub const TIMESTAMP: u8 = 0x83;
    pub const UUID: u8 = 0x98;
    pub const VBIN8: u8 = 0xa0;
    pub const STR8: u8 = 0xa1;
    pub const SYM8: u8 = 0xa3;
    pub const VBIN32: u8 = 0xb0;
    pub const STR32: u8 = 0xb1;
    pub const SYM32: u8 = 0xb3;
    pub const LIST8: u8 = 0xc0;
    pub const MAP8: u8 = 0xc1;
    pub const LIST32: u8 = 0xd0;
    pub const MAP32: u8 = 0xd1;
    pub const ARRAY8: u8 = 0xe0;
    pub const ARRAY32: u8 = 0xf0;
}

use format_code::*;

/// A decoded AMQP 1.0 value.
#[derive(Debug, Clone, PartialEq)]
pub enum AmqpValue {
    Null,
    Bool(bool),
    Ubyte(u8),
    Ushort(u16),
    Uint(u32),
    Ulong(u64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    /// Milliseconds since the unix epoch.
    Timestamp(i64),
    Uuid(Uuid),
    Binary(Vec<u8>),
    String(String),
    Symbol(String),
    List(Vec<AmqpValue>),
    Map(Vec<(AmqpValue, AmqpValue)>),
    Described(Box<AmqpValue>, Box<AmqpValue>),
}

impl AmqpValue {
    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Ubyte(_) => "ubyte",
            Self::Ushort(_) => "ushort",
            Self::Uint(_) => "uint",
            Self::Ulong(_) => "ulong",
            Self::Byte(_) => "byte",
            Self::Short(_) => "short",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Char(_) => "char",
            Self::Timestamp(_) => "timestamp",
            Self::Uuid(_) => "uuid",
            Self::Binary(_) => "binary",
            Self::String(_) => "string",
            Self::Symbol(_) => "symbol",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Described(..) => "described",
        }
    }

    /// Lists, maps and described values.
    pub fn is_compound(&self) -> bool {
        matches!(self, Self::List(_) | Self::Map(_) | Self::Described(..))
    }

    /// Append the wire encoding of this value to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Null => buf.put_u8(NULL),
            Self::Bool(true) => buf.put_u8(BOOLEAN_TRUE),
            Self::Bool(false) => buf.put_u8(BOOLEAN_FALSE),
            Self::Ubyte(v) => {
                buf.put_u8(UBYTE);
                buf.put_u8(*v);
            }
            Self::Ushort(v) => {
                buf.put_u8(USHORT);
                buf.put_u16(*v);
            }
            Self::Uint(0) => buf.put_u8(UINT0),
            Self::Uint(v) => match u8::try_from(*v) {
                Ok(small) => {
                    buf.put_u8(SMALL_UINT);
                    buf.put_u8(small);
                }
                Err(_) => {
                    buf.put_u8(UINT);
                    buf.put_u32(*v);
                }
            },
            Self::Ulong(0) => buf.put_u8(ULONG0),
            Self::Ulong(v) => match u8::try_from(*v) {
                Ok(small) => {
                    buf.put_u8(SMALL_ULONG);
                    buf.put_u8(small);
                }
                Err(_) => {
                    buf.put_u8(ULONG);
                    buf.put_u64(*v);
                }
            },
            Self::Byte(v) => {
                buf.put_u8(BYTE);
                buf.put_i8(*v);
            }
            Self::Short(v) => {
                buf.put_u8(SHORT);
                buf.put_i16(*v);
            }
            Self::Int(v) => match i8::try_from(*v) {
                Ok(small) => {
                    buf.put_u8(SMALL_INT);
                    buf.put_i8(small);
                }
                Err(_) => {
                    buf.put_u8(INT);
                    buf.put_i32(*v);
                }
            },
            Self::Long(v) => match i8::try_from(*v) {
                Ok(small) => {
                    buf.put_u8(SMALL_LONG);
                    buf.put_i8(small);
                }
                Err(_) => {
                    buf.put_u8(LONG);
                    buf.put_i64(*v);
                }
            },
            Self::Float(v) => {
                buf.put_u8(FLOAT);
                buf.put_f32(*v);
            }
            Self::Double(v) => {
                buf.put_u8(DOUBLE);
                buf.put_f64(*v);
            }
            Self::Char(c) => {
                buf.put_u8(CHAR);
                buf.put_u32(u32::from(*c));
            }
            Self::Timestamp(ms) => {
                buf.put_u8(TIMESTAMP);
                buf.put_i64(*ms);
            }
            Self::Uuid(u) => {
                buf.put_u8(UUID);
                buf.put_slice(u.as_bytes());
            }
            Self::Binary(b) => write_variable(buf, VBIN8, VBIN32, b),
            Self::String(s) => write_variable(buf, STR8, STR32, s.as_bytes()),
            Self::Symbol(s) => write_variable(buf, SYM8, SYM32, s.as_bytes()),
            Self::List(items) if items.is_empty() => buf.put_u8(LIST0),
            Self::List(items) => {
                let mut body = Vec::new();
                for item in items {
                    item.encode(&mut body);
                }
                write_compound(buf, LIST8, LIST32, items.len(), &body);
            }
            Self::Map(entries) => {
                let mut body = Vec::new();
                for (key, value) in entries {
                    key.encode(&mut body);
                    value.encode(&mut body);
                }
                write_compound(buf, MAP8, MAP32, entries.len() * 2, &body);
            }
            Self::Described(descriptor, value) => {
                buf.put_u8(DESCRIBED);
                descriptor.encode(buf);
                value.encode(buf);
            }
        }
    }

    /// Decode one value from the front of `buf`, advancing it.
    pub fn decode(buf: &mut &[u8]) -> Result<Self, CodecError> {
        decode_value(buf, 0)
    }
}

fn write_variable(buf: &mut Vec<u8>, short: u8, long: u8, data: &[u8]) {
    match u8::try_from(data.len()) {
        Ok(len) => {
            buf.put_u8(short);
            buf.put_u8(len);
        }
        Err(_) => {
            buf.put_u8(long);
            buf.put_u32(data.len() as u32);
        }
    }
    buf.put_slice(data);
}

/// Size covers the count field plus the encoded elements.
fn write_compound(buf: &mut Vec<u8>, short: u8, long: u8, count: usize, body: &[u8]) {
    if count <= u8::MAX as usize && body.len() < u8::MAX as usize {
        buf.put_u8(short);
        buf.put_u8((body.len() + 1) as u8);
        buf.put_u8(count as u8);
    } else {
        buf.put_u8(long);
        buf.put_u32((body.len() + 4) as u32);
        buf.put_u32(count as u32);
    }
    buf.put_slice(body);
}

fn decode_value(buf: &mut &[u8], depth: usize) -> Result<AmqpValue, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::NestingTooDeep(MAX_DEPTH));
    }

    let code = take_u8(buf)?;
    let value = match code {
        DESCRIBED => {
            let descriptor = decode_value(buf, depth + 1)?;
            let value = decode_value(buf, depth + 1)?;
            AmqpValue::Described(Box::new(descriptor), Box::new(value))
        }
        NULL => AmqpValue::Null,
        BOOLEAN_TRUE => AmqpValue::Bool(true),
        BOOLEAN_FALSE => AmqpValue::Bool(false),
        BOOLEAN => match take_u8(buf)? {
            0x00 => AmqpValue::Bool(false),
            0x01 => AmqpValue::Bool(true),
            other => return Err(CodecError::InvalidBoolean(other)),
        },
        UBYTE => AmqpValue::Ubyte(take_u8(buf)?),
        USHORT => {
            need(buf, 2)?;
            AmqpValue::Ushort(buf.get_u16())
        }
        UINT0 => AmqpValue::Uint(0),
        SMALL_UINT => AmqpValue::Uint(u32::from(take_u8(buf)?)),
        UINT => AmqpValue::Uint(take_u32(buf)?),
        ULONG0 => AmqpValue::Ulong(0),
        SMALL_ULONG => AmqpValue::Ulong(u64::from(take_u8(buf)?)),
        ULONG => {
            need(buf, 8)?;
            AmqpValue::Ulong(buf.get_u64())
        }
        BYTE => {
            need(buf, 1)?;
            AmqpValue::Byte(buf.get_i8())
        }
        SHORT => {
            need(buf, 2)?;
            AmqpValue::Short(buf.get_i16())
        }
        SMALL_INT => {
            need(buf, 1)?;
            AmqpValue::Int(i32::from(buf.get_i8()))
        }
        INT => {
            need(buf, 4)?;
            AmqpValue::Int(buf.get_i32())
        }
        SMALL_LONG => {
            need(buf, 1)?;
            AmqpValue::Long(i64::from(buf.get_i8()))
        }
        LONG => {
            need(buf, 8)?;
            AmqpValue::Long(buf.get_i64())
        }
        FLOAT => {
            need(buf, 4)?;
            AmqpValue::Float(buf.get_f32())
        }
        DOUBLE => {
            need(buf, 8)?;
            AmqpValue::Double(buf.get_f64())
        }
        CHAR => {
            let raw = take_u32(buf)?;
            AmqpValue::Char(char::from_u32(raw).ok_or(CodecError::InvalidChar(raw))?)
        }
        TIMESTAMP => {
            need(buf, 8)?;
            AmqpValue::Timestamp(buf.get_i64())
        }
        UUID => {
            need(buf, 16)?;
            let mut raw = [0u8; 16];
            buf.copy_to_slice(&mut raw);
            AmqpValue::Uuid(Uuid::from_bytes(raw))
        }
        VBIN8 => {
            let len = usize::from(take_u8(buf)?);
            AmqpValue::Binary(take_slice(buf, len)?.to_vec())
        }
        VBIN32 => {
            let len = take_u32(buf)? as usize;
            AmqpValue::Binary(take_slice(buf, len)?.to_vec())
        }
        STR8 | SYM8 => {
            let len = usize::from(take_u8(buf)?);
            let text = take_utf8(buf, len)?;
            if code == STR8 {
                AmqpValue::String(text)
            } else {
                AmqpValue::Symbol(text)
            }
        }
        STR32 | SYM32 => {
            let len = take_u32(buf)? as usize;
            let text = take_utf8(buf, len)?;
            if code == STR32 {
                AmqpValue::String(text)
            } else {
                AmqpValue::Symbol(text)
            }
        }
        LIST0 => AmqpValue::List(Vec::new()),
        LIST8 => {
            let size = usize::from(take_u8(buf)?);
            let mut body = take_slice(buf, size)?;
            let count = usize::from(take_u8(&mut body)?);
            AmqpValue::List(decode_items(&mut body, count, depth)?)
        }
        LIST32 => {
            let size = take_u32(buf)? as usize;
            let mut body = take_slice(buf, size)?;
            let count = take_u32(&mut body)? as usize;
            AmqpValue::List(decode_items(&mut body, count, depth)?)
        }
        MAP8 => {
            let size = usize::from(take_u8(buf)?);
            let mut body = take_slice(buf, size)?;
            let count = usize::from(take_u8(&mut body)?);
            AmqpValue::Map(decode_pairs(&mut body, count, depth)?)
        }
        MAP32 => {
            let size = take_u32(buf)? as usize;
            let mut body = take_slice(buf, size)?;
            let count = take_u32(&mut body)? as usize;
            AmqpValue::Map(decode_pairs(&mut body, count, depth)?)
        }
        ARRAY8 | ARRAY32 => return Err(CodecError::UnsupportedFormatCode(code)),
        other => return Err(CodecError::InvalidFormatCode(other)),
    };
    Ok(value)
}

fn decode_items(body: &mut &[u8], count: usize, depth: usize) -> Result<Vec<AmqpValue>, CodecError> {
    // Every element takes at least one byte, which bounds the allocation.
    need(body, count)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(decode_value(body, depth + 1)?);
    }
    Ok(items)
}

fn decode_pairs(
    body: &mut &[u8],
    count: usize,
    depth: usize,
) -> Result<Vec<(AmqpValue, AmqpValue)>, CodecError> {
    if count % 2 != 0 {
        return Err(CodecError::OddMapCount(count));
    }
    let mut items = decode_items(body, count, depth)?.into_iter();
    let mut pairs = Vec::with_capacity(count / 2);
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn need(buf: &[u8], n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::Truncated {
            needed: n,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn take_slice<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], CodecError> {
    need(buf, len)?;
    let whole: &'a [u8] = *buf;
    let (head, tail) = whole.split_at(len);
    *buf = tail;
    Ok(head)
}

fn take_utf8(buf: &mut &[u8], len: usize) -> Result<String, CodecError> {
    let raw = take_slice(buf, len)?;
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| CodecError::InvalidUtf8)
}

// =============================================================================
// Conversions
// =============================================================================

impl From<&str> for AmqpValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for AmqpValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<bool> for AmqpValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for AmqpValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for AmqpValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for AmqpValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<Vec<u8>> for AmqpValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(v)
    }
}

impl From<Uuid> for AmqpValue {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}
