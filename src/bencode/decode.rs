//! Bencode decoder
//!
//! A recursive-descent decoder over a byte slice. Besides producing a
//! [`Value`] tree it can report the raw byte span of a dictionary entry,
//! which is what the infohash is computed over.

use anyhow::Result;
use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::{error, trace};

use super::value::Value;
use crate::error::TorrentError;

const MAX_DEPTH: usize = 64;

/// Decode a complete Bencode document; trailing bytes are an error
pub fn decode(data: &[u8]) -> Result<Value> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        error!("Trailing data after bencode value: {} of {} bytes consumed", consumed, data.len());
        return Err(TorrentError::protocol_error_with_source(
            "Trailing data after bencode value",
            format!("consumed {} of {} bytes", consumed, data.len()),
        )
        .into());
    }
    Ok(value)
}

/// Decode the first value in `data`, returning it with the number of bytes consumed
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize)> {
    trace!("Decoding bencode value from {} bytes", data.len());
    let mut pos = 0;
    let value = decode_value(data, &mut pos, 0)?;
    Ok((value, pos))
}

/// Raw encoded bytes of `key`'s value in the top-level dictionary of `data`
///
/// Returns `Ok(None)` when the dictionary has no such key. The returned
/// slice is exactly the input bytes, not a re-encoding.
pub fn dict_value_span<'a>(data: &'a [u8], key: &[u8]) -> Result<Option<&'a [u8]>> {
    if data.first() != Some(&b'd') {
        return Err(format_error("Expected a dictionary", 0));
    }
    let mut pos = 1;
    while pos < data.len() && data[pos] != b'e' {
        let entry_key = decode_bytes(data, &mut pos)?;
        let start = pos;
        decode_value(data, &mut pos, 1)?;
        if entry_key.as_ref() == key {
            trace!("Found span for key {:?}: {}..{}", String::from_utf8_lossy(key), start, pos);
            return Ok(Some(&data[start..pos]));
        }
    }
    if pos >= data.len() {
        return Err(format_error("Unterminated dictionary", pos));
    }
    Ok(None)
}

fn format_error(message: &str, pos: usize) -> anyhow::Error {
    error!("Bencode format error at offset {}: {}", pos, message);
    TorrentError::protocol_error_with_source(message, format!("offset {}", pos)).into()
}

fn decode_value(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(format_error("Nesting too deep", *pos));
    }

    match data.get(*pos) {
        None => Err(format_error("Unexpected end of data", *pos)),
        Some(b'i') => decode_integer(data, pos),
        Some(b'l') => decode_list(data, pos, depth),
        Some(b'd') => decode_dict(data, pos, depth),
        Some(b'0'..=b'9') => decode_bytes(data, pos).map(Value::Bytes),
        Some(other) => Err(format_error(&format!("Unexpected byte 0x{:02x}", other), *pos)),
    }
}

fn decode_integer(data: &[u8], pos: &mut usize) -> Result<Value> {
    *pos += 1;
    let start = *pos;
    let end = data[start..]
        .iter()
        .position(|&b| b == b'e')
        .map(|p| start + p)
        .ok_or_else(|| format_error("Unterminated integer", start))?;

    let digits = std::str::from_utf8(&data[start..end])
        .map_err(|_| format_error("Integer is not ASCII", start))?;
    if digits.is_empty() {
        return Err(format_error("Empty integer", start));
    }
    if digits.starts_with("-0") || (digits.starts_with('0') && digits.len() > 1) {
        return Err(format_error("Integer has leading zeros", start));
    }
    let value: i64 = digits
        .parse()
        .map_err(|_| format_error("Invalid integer", start))?;

    *pos = end + 1;
    Ok(Value::Integer(value))
}

fn decode_bytes(data: &[u8], pos: &mut usize) -> Result<Bytes> {
    let start = *pos;
    let colon = data[start..]
        .iter()
        .position(|&b| b == b':')
        .map(|p| start + p)
        .ok_or_else(|| format_error("Unterminated string length", start))?;

    let len_str = &data[start..colon];
    if len_str.is_empty() || !len_str.iter().all(u8::is_ascii_digit) {
        return Err(format_error("Non-numeric string length", start));
    }
    let len: usize = std::str::from_utf8(len_str)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| format_error("Invalid string length", start))?;

    let body = colon + 1;
    if len > data.len() - body {
        return Err(format_error("String exceeds input", start));
    }
    *pos = body + len;
    Ok(Bytes::copy_from_slice(&data[body..body + len]))
}

fn decode_list(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value> {
    let start = *pos;
    *pos += 1;
    let mut list = Vec::new();
    while *pos < data.len() && data[*pos] != b'e' {
        list.push(decode_value(data, pos, depth + 1)?);
    }
    if *pos >= data.len() {
        return Err(format_error("Unterminated list", start));
    }
    *pos += 1;
    Ok(Value::List(list))
}

fn decode_dict(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value> {
    let start = *pos;
    *pos += 1;
    let mut dict = BTreeMap::new();
    while *pos < data.len() && data[*pos] != b'e' {
        if !data[*pos].is_ascii_digit() {
            return Err(format_error("Dictionary key must be a byte string", *pos));
        }
        let key = decode_bytes(data, pos)?;
        let value = decode_value(data, pos, depth + 1)?;
        dict.insert(key, value);
    }
    if *pos >= data.len() {
        return Err(format_error("Unterminated dictionary", start));
    }
    *pos += 1;
    Ok(Value::Dict(dict))
}
