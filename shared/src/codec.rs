//! Self-describing value codec used for control-socket messages and for the
//! canonical encoding that service signatures are computed over.
//!
//! Every value starts with a one-byte tag. Integers are big-endian, strings
//! and containers carry an explicit length or count, and nothing is
//! NUL-terminated.

use bytes::{Buf, BufMut};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use thiserror::Error;

const TAG_NIL: u8 = 0x00;
const TAG_TRUE: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_U8: u8 = 0x03;
const TAG_U16: u8 = 0x04;
const TAG_U32: u8 = 0x05;
const TAG_U64: u8 = 0x06;
const TAG_STR8: u8 = 0x07;
const TAG_STR16: u8 = 0x08;
const TAG_LIST16: u8 = 0x09;
const TAG_MAP16: u8 = 0x0a;

/// Containers nested deeper than this are rejected while decoding.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed message at offset {offset}: {reason}")]
    MalformedMessage { offset: usize, reason: &'static str },

    #[error("duplicate map key {key:?}")]
    DuplicateKey { key: String },

    #[error("encoded message is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("container with {len} elements exceeds the 16-bit count")]
    TooManyElements { len: usize },

    #[error("string of {len} bytes exceeds the 16-bit length")]
    StringTooLong { len: usize },
}

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Nil,
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Str(Vec<u8>),
    List(Vec<Value>),
    Map(Map),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Any unsigned integer width, widened.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::U8(v) => Some(v.into()),
            Value::U16(v) => Some(v.into()),
            Value::U32(v) => Some(v.into()),
            Value::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Smallest unsigned width that holds `v`.
    pub fn uint(v: u64) -> Self {
        if let Ok(v) = u8::try_from(v) {
            Value::U8(v)
        } else if let Ok(v) = u16::try_from(v) {
            Value::U16(v)
        } else if let Ok(v) = u32::try_from(v) {
            Value::U32(v)
        } else {
            Value::U64(v)
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s.into_bytes())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::U8(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::U16(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Nil, Into::into)
    }
}

/// String-keyed map with unique keys, iterated in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Map {
    entries: Vec<(String, Value)>,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Inserts `key`, failing if it is already present.
    pub fn try_insert(&mut self, key: impl Into<String>, value: Value) -> Result<(), CodecError> {
        let key = key.into();
        if self.contains_key(&key) {
            return Err(CodecError::DuplicateKey { key });
        }
        self.entries.push((key, value));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Map {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Map::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// Encodes `values` back to back.
pub fn encode(values: &[Value]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for value in values {
        encode_into(value, &mut out)?;
    }
    Ok(out)
}

/// Like [`encode`], but fails when the result would exceed `limit` bytes.
pub fn encode_bounded(values: &[Value], limit: usize) -> Result<Vec<u8>, CodecError> {
    let out = encode(values)?;
    if out.len() > limit {
        return Err(CodecError::TooLarge {
            size: out.len(),
            limit,
        });
    }
    Ok(out)
}

fn encode_into(value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match value {
        Value::Nil => out.put_u8(TAG_NIL),
        Value::Bool(true) => out.put_u8(TAG_TRUE),
        Value::Bool(false) => out.put_u8(TAG_FALSE),
        Value::U8(v) => {
            out.put_u8(TAG_U8);
            out.put_u8(*v);
        }
        Value::U16(v) => {
            out.put_u8(TAG_U16);
            out.put_u16(*v);
        }
        Value::U32(v) => {
            out.put_u8(TAG_U32);
            out.put_u32(*v);
        }
        Value::U64(v) => {
            out.put_u8(TAG_U64);
            out.put_u64(*v);
        }
        Value::Str(bytes) => encode_str(bytes, out)?,
        Value::List(items) => {
            out.put_u8(TAG_LIST16);
            out.put_u16(container_len(items.len())?);
            for item in items {
                encode_into(item, out)?;
            }
        }
        Value::Map(map) => {
            out.put_u8(TAG_MAP16);
            out.put_u16(container_len(map.len())?);
            for (key, item) in map.iter() {
                encode_str(key.as_bytes(), out)?;
                encode_into(item, out)?;
            }
        }
    }
    Ok(())
}

fn encode_str(bytes: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
    if let Ok(len) = u8::try_from(bytes.len()) {
        out.put_u8(TAG_STR8);
        out.put_u8(len);
    } else if let Ok(len) = u16::try_from(bytes.len()) {
        out.put_u8(TAG_STR16);
        out.put_u16(len);
    } else {
        return Err(CodecError::StringTooLong { len: bytes.len() });
    }
    out.put_slice(bytes);
    Ok(())
}

fn container_len(len: usize) -> Result<u16, CodecError> {
    u16::try_from(len).map_err(|_| CodecError::TooManyElements { len })
}

/// Decodes values until `bytes` is exhausted. Returns the values and the
/// number of bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<(Vec<Value>, usize), CodecError> {
    let mut decoder = Decoder::new(bytes);
    let mut values = Vec::new();
    while decoder.buf.has_remaining() {
        values.push(decoder.value(0)?);
    }
    Ok((values, decoder.offset()))
}

/// Decodes exactly one value from the front of `bytes`.
pub fn decode_value(bytes: &[u8]) -> Result<(Value, usize), CodecError> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.value(0)?;
    Ok((value, decoder.offset()))
}

struct Decoder<'a> {
    buf: &'a [u8],
    total: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            total: buf.len(),
        }
    }

    fn offset(&self) -> usize {
        self.total - self.buf.remaining()
    }

    fn malformed(&self, reason: &'static str) -> CodecError {
        CodecError::MalformedMessage {
            offset: self.offset(),
            reason,
        }
    }

    fn need(&self, n: usize, reason: &'static str) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(self.malformed(reason));
        }
        Ok(())
    }

    fn value(&mut self, depth: usize) -> Result<Value, CodecError> {
        if depth > MAX_DEPTH {
            return Err(self.malformed("nesting too deep"));
        }
        self.need(1, "missing type tag")?;
        let tag = self.buf.get_u8();
        let value = match tag {
            TAG_NIL => Value::Nil,
            TAG_TRUE => Value::Bool(true),
            TAG_FALSE => Value::Bool(false),
            TAG_U8 => {
                self.need(1, "truncated u8")?;
                Value::U8(self.buf.get_u8())
            }
            TAG_U16 => {
                self.need(2, "truncated u16")?;
                Value::U16(self.buf.get_u16())
            }
            TAG_U32 => {
                self.need(4, "truncated u32")?;
                Value::U32(self.buf.get_u32())
            }
            TAG_U64 => {
                self.need(8, "truncated u64")?;
                Value::U64(self.buf.get_u64())
            }
            TAG_STR8 | TAG_STR16 => Value::Str(self.string_body(tag)?),
            TAG_LIST16 => {
                let count = self.count()?;
                let mut items = Vec::with_capacity(count.min(self.buf.remaining()));
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Value::List(items)
            }
            TAG_MAP16 => {
                let count = self.count()?;
                let mut map = Map::new();
                for _ in 0..count {
                    let key = self.key()?;
                    let item = self.value(depth + 1)?;
                    map.try_insert(key, item)?;
                }
                Value::Map(map)
            }
            _ => return Err(self.malformed("unknown type tag")),
        };
        Ok(value)
    }

    fn count(&mut self) -> Result<usize, CodecError> {
        self.need(2, "truncated element count")?;
        Ok(self.buf.get_u16().into())
    }

    fn string_body(&mut self, tag: u8) -> Result<Vec<u8>, CodecError> {
        let len = if tag == TAG_STR8 {
            self.need(1, "truncated string length")?;
            usize::from(self.buf.get_u8())
        } else {
            self.need(2, "truncated string length")?;
            usize::from(self.buf.get_u16())
        };
        self.need(len, "string length exceeds buffer")?;
        let body = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(body)
    }

    fn key(&mut self) -> Result<String, CodecError> {
        self.need(1, "missing map key")?;
        let tag = self.buf.get_u8();
        if tag != TAG_STR8 && tag != TAG_STR16 {
            return Err(self.malformed("map key is not a string"));
        }
        let body = self.string_body(tag)?;
        String::from_utf8(body).map_err(|_| self.malformed("map key is not UTF-8"))
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Nil => serializer.serialize_unit(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::U8(v) => serializer.serialize_u8(*v),
            Value::U16(v) => serializer.serialize_u16(*v),
            Value::U32(v) => serializer.serialize_u32(*v),
            Value::U64(v) => serializer.serialize_u64(*v),
            Value::Str(bytes) => serializer.serialize_str(&String::from_utf8_lossy(bytes)),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(map) => map.serialize(serializer),
        }
    }
}

impl Serialize for Map {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(self.len()))?;
        for (key, value) in self.iter() {
            out.serialize_entry(key, value)?;
        }
        out.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        let mut inner = Map::new();
        inner.insert("name", "Mesh Chat");
        inner.insert("ttl", 5u8);
        inner.insert("categories", vec![Value::from("chat"), Value::from("social")]);
        Value::List(vec![
            Value::Nil,
            Value::Bool(true),
            Value::U16(513),
            Value::U64(u64::MAX),
            Value::Map(inner),
        ])
    }

    #[test]
    fn test_nested_values_survive_encoding() {
        let bytes = encode(&[sample()]).unwrap();
        let (values, consumed) = decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(values, vec![sample()]);
    }

    #[test]
    fn test_wire_layout_is_big_endian_and_length_prefixed() {
        let bytes = encode(&[Value::U32(1), Value::from("ab")]).unwrap();
        assert_eq!(bytes, vec![TAG_U32, 0, 0, 0, 1, TAG_STR8, 2, b'a', b'b']);
    }

    #[test]
    fn test_long_strings_use_wide_length() {
        let long = "x".repeat(300);
        let bytes = encode(&[Value::from(long.as_str())]).unwrap();
        assert_eq!(bytes[0], TAG_STR16);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]), 300);
        let (value, _) = decode_value(&bytes).unwrap();
        assert_eq!(value.as_str(), Some(long.as_str()));
    }

    #[test]
    fn test_every_strict_prefix_is_malformed() {
        let bytes = encode(&[sample()]).unwrap();
        for len in 0..bytes.len() {
            let err = decode_value(&bytes[..len]).unwrap_err();
            assert!(
                matches!(err, CodecError::MalformedMessage { .. }),
                "prefix of {len} bytes gave {err:?}"
            );
        }
    }

    #[test]
    fn test_declared_length_past_end_is_rejected() {
        let err = decode(&[TAG_STR8, 10, b'a']).unwrap_err();
        assert_eq!(
            err,
            CodecError::MalformedMessage {
                offset: 2,
                reason: "string length exceeds buffer"
            }
        );
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let err = decode(&[0x7f]).unwrap_err();
        assert!(matches!(err, CodecError::MalformedMessage { reason: "unknown type tag", .. }));
    }

    #[test]
    fn test_duplicate_map_key_is_rejected() {
        let bytes = vec![
            TAG_MAP16, 0, 2, TAG_STR8, 1, b'k', TAG_NIL, TAG_STR8, 1, b'k', TAG_TRUE,
        ];
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err, CodecError::DuplicateKey { key: "k".to_string() });
    }

    #[test]
    fn test_map_keeps_insertion_order_and_replaces() {
        let mut map = Map::new();
        map.insert("b", 1u8);
        map.insert("a", 2u8);
        assert_eq!(map.insert("b", 3u8), Some(Value::U8(1)));
        let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(map.get("b"), Some(&Value::U8(3)));
        assert!(map.try_insert("a", Value::Nil).is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let mut bytes = Vec::new();
        for _ in 0..=MAX_DEPTH + 1 {
            bytes.extend_from_slice(&[TAG_LIST16, 0, 1]);
        }
        bytes.push(TAG_NIL);
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::MalformedMessage { reason: "nesting too deep", .. }));
    }

    #[test]
    fn test_bounded_encode_fails_instead_of_truncating() {
        let value = Value::from("y".repeat(2000));
        let err = encode_bounded(&[value], 1024).unwrap_err();
        assert_eq!(err, CodecError::TooLarge { size: 2003, limit: 1024 });
    }

    #[test]
    fn test_oversized_containers_are_rejected() {
        let big = Value::List(vec![Value::Nil; usize::from(u16::MAX) + 1]);
        assert_eq!(
            encode(&[big]).unwrap_err(),
            CodecError::TooManyElements { len: 65536 }
        );
    }

    #[test]
    fn test_uint_picks_smallest_width() {
        assert_eq!(Value::uint(7), Value::U8(7));
        assert_eq!(Value::uint(300), Value::U16(300));
        assert_eq!(Value::uint(70_000), Value::U32(70_000));
        assert_eq!(Value::uint(1 << 40), Value::U64(1 << 40));
        assert_eq!(Value::U16(300).as_u64(), Some(300));
    }
}
