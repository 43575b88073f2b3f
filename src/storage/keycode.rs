use chrono::{Datelike, NaiveDate};

use crate::{
    error::{Error, Result},
    types::Value,
};

// Type prefixes for order-preserving encoding.
// Order matters: Null must sort before every typed value, matching the
// Value partial ordering used elsewhere.
const TAG_NULL: u8 = 0x00;
const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_DATE: u8 = 0x04;
const TAG_STRING: u8 = 0x05;

/// Encodes a scalar so that unsigned byte comparison of encodings matches
/// value comparison within one data type. Every encoding is self-delimiting,
/// so concatenations form composite keys with tuple ordering.
pub fn encode_value(value: &Value) -> Vec<u8> {
    match value {
        Value::Null => vec![TAG_NULL],
        Value::Boolean(b) => vec![TAG_BOOLEAN, *b as u8],
        Value::Integer(i) => {
            let mut out = vec![TAG_INTEGER];
            out.extend_from_slice(&order_preserving_i64(*i));
            out
        }
        Value::Float(f) => {
            let mut out = vec![TAG_FLOAT];
            out.extend_from_slice(&order_preserving_f64(*f));
            out
        }
        Value::Date(d) => {
            // Days since the common era order the same as the dates
            let mut out = vec![TAG_DATE];
            out.extend_from_slice(&order_preserving_i64(d.num_days_from_ce() as i64));
            out
        }
        Value::String(s) => {
            let mut out = vec![TAG_STRING];
            out.extend_from_slice(&escape_bytes(s.as_bytes()));
            out
        }
    }
}

/// Encodes a tuple of scalars as the concatenation of their encodings
pub fn encode_tuple(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        out.extend_from_slice(&encode_value(value));
    }
    out
}

/// Decodes one scalar from the front of `input`, advancing it
pub fn decode_value(input: &mut &[u8]) -> Result<Value> {
    let (&tag, rest) = input
        .split_first()
        .ok_or_else(|| Error::Serialization("truncated key".into()))?;
    *input = rest;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOLEAN => {
            let (&b, rest) = input
                .split_first()
                .ok_or_else(|| Error::Serialization("truncated boolean key".into()))?;
            *input = rest;
            Ok(Value::Boolean(b == 0x01))
        }
        TAG_INTEGER => Ok(Value::Integer(take_i64(input)?)),
        TAG_FLOAT => {
            let bits = take_u64(input)?;
            let original = if bits & (1u64 << 63) != 0 {
                bits & !(1u64 << 63)
            } else {
                !bits
            };
            Ok(Value::Float(f64::from_bits(original)))
        }
        TAG_DATE => {
            let days = take_i64(input)?;
            let date = NaiveDate::from_num_days_from_ce_opt(days as i32)
                .ok_or_else(|| Error::Serialization("date key out of range".into()))?;
            Ok(Value::Date(date))
        }
        TAG_STRING => {
            let bytes = unescape_bytes(input)?;
            Ok(Value::String(String::from_utf8(bytes).map_err(|e| {
                Error::Serialization(e.to_string())
            })?))
        }
        other => Err(Error::Serialization(format!(
            "unknown key tag {:#04x}",
            other
        ))),
    }
}

/// Flip the sign bit so negative integers sort before positive ones
fn order_preserving_i64(i: i64) -> [u8; 8] {
    ((i as u64) ^ (1u64 << 63)).to_be_bytes()
}

/// IEEE 754 ordering: negative floats flip all bits, positive ones only
/// the sign bit
fn order_preserving_f64(f: f64) -> [u8; 8] {
    let bits = f.to_bits();
    let ordered = if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits | (1u64 << 63)
    };
    ordered.to_be_bytes()
}

/// Escapes 0x00 as 0x00 0xFF and terminates with 0x00 0x00, so embedded
/// zero bytes cannot cut a composite key short
pub fn escape_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 2);
    for &b in bytes {
        if b == 0x00 {
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&[0x00, 0x00]);
    out
}

/// Reverses escape_bytes, consuming through the terminator
pub fn unescape_bytes(input: &mut &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        match input.get(i) {
            Some(0x00) => match input.get(i + 1) {
                Some(0xFF) => {
                    out.push(0x00);
                    i += 2;
                }
                Some(0x00) => {
                    *input = &input[i + 2..];
                    return Ok(out);
                }
                _ => return Err(Error::Serialization("invalid key escape".into())),
            },
            Some(&b) => {
                out.push(b);
                i += 1;
            }
            None => return Err(Error::Serialization("unterminated key bytes".into())),
        }
    }
}

pub fn encode_u64(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

pub fn take_u64(input: &mut &[u8]) -> Result<u64> {
    if input.len() < 8 {
        return Err(Error::Serialization("truncated u64 key".into()));
    }
    let (bytes, rest) = input.split_at(8);
    *input = rest;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}

fn take_i64(input: &mut &[u8]) -> Result<i64> {
    Ok((take_u64(input)? ^ (1u64 << 63)) as i64)
}
