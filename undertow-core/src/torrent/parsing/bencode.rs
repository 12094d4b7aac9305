//! Bencode value model, decoder and encoder
//!
//! Values are one of four explicit variants; mapping into concrete records
//! happens in the callers (`parser.rs`, the tracker client) by matching on
//! them, never through reflection.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

const MAX_DEPTH: usize = 64;

/// Errors produced while decoding bencode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid integer at byte {position}: {reason}")]
    InvalidInteger { position: usize, reason: String },

    #[error("invalid string length at byte {position}")]
    InvalidStringLength { position: usize },

    #[error("unexpected byte {byte:#04x} at byte {position}")]
    UnexpectedByte { byte: u8, position: usize },

    #[error("dictionary key at byte {position} is not a byte string")]
    NonStringKey { position: usize },

    #[error("trailing data at byte {position}")]
    TrailingData { position: usize },

    #[error("nesting deeper than {MAX_DEPTH} levels")]
    NestingTooDeep,
}

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    /// Byte string, not necessarily UTF-8
    Bytes(Bytes),
    List(Vec<Value>),
    /// Dictionary keyed by byte strings; iteration order is the canonical sorted order
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Byte string from UTF-8 text.
    pub fn string(text: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Byte string as UTF-8, if it is one and decodes cleanly.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up `key` when this value is a dictionary.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(key.as_bytes())
    }

    /// Canonical encoding of this value.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Value::Integer(value) => {
                buf.put_u8(b'i');
                buf.put_slice(value.to_string().as_bytes());
                buf.put_u8(b'e');
            }
            Value::Bytes(bytes) => encode_bytes(bytes, buf),
            Value::List(items) => {
                buf.put_u8(b'l');
                for item in items {
                    item.encode_into(buf);
                }
                buf.put_u8(b'e');
            }
            Value::Dict(entries) => {
                buf.put_u8(b'd');
                for (key, value) in entries {
                    encode_bytes(key, buf);
                    value.encode_into(buf);
                }
                buf.put_u8(b'e');
            }
        }
    }

    fn write_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            Value::Integer(value) => writeln!(f, "{value}"),
            Value::Bytes(bytes) => writeln!(f, "{}", describe_bytes(bytes)),
            Value::List(items) => {
                writeln!(f, "list ({} items)", items.len())?;
                for item in items {
                    write!(f, "{:indent$}- ", "", indent = (depth + 1) * 2)?;
                    item.write_tree(f, depth + 1)?;
                }
                Ok(())
            }
            Value::Dict(entries) => {
                writeln!(f, "dict ({} keys)", entries.len())?;
                for (key, value) in entries {
                    write!(
                        f,
                        "{:indent$}{}: ",
                        "",
                        String::from_utf8_lossy(key),
                        indent = (depth + 1) * 2
                    )?;
                    value.write_tree(f, depth + 1)?;
                }
                Ok(())
            }
        }
    }
}

/// Indented tree, one node per line. Binary strings are summarised by length.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_tree(f, 0)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::string(text)
    }
}

fn encode_bytes(bytes: &[u8], buf: &mut BytesMut) {
    buf.put_slice(bytes.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(bytes);
}

fn describe_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.chars().any(char::is_control) => format!("{text:?}"),
        _ => {
            let preview = &bytes[..bytes.len().min(8)];
            format!("<{} bytes: {}..>", bytes.len(), hex::encode(preview))
        }
    }
}

/// Decodes exactly one value.
///
/// Whitespace before any value and after the last one is skipped; any other
/// trailing data is an error.
///
/// # Errors
/// - `BencodeError` - Malformed input
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut decoder = Decoder::new(data);
    let value = decoder.value(0)?;
    decoder.finish()?;
    Ok(value)
}

/// Returns the exact encoded bytes stored under `key` in a top-level dictionary.
///
/// Needed for the info hash, which must be computed over the bytes as they
/// appear in the file rather than over a re-encoding.
///
/// # Errors
/// - `BencodeError` - Malformed input or the root is not a dictionary
pub fn raw_dict_value<'a>(data: &'a [u8], key: &[u8]) -> Result<Option<&'a [u8]>, BencodeError> {
    let mut decoder = Decoder::new(data);
    decoder.skip_whitespace();
    decoder.expect(b'd')?;

    let mut found = None;
    loop {
        decoder.skip_whitespace();
        match decoder.peek()? {
            b'e' => {
                decoder.pos += 1;
                break;
            }
            b'0'..=b'9' => {}
            _ => {
                return Err(BencodeError::NonStringKey {
                    position: decoder.pos,
                });
            }
        }

        let entry_key = decoder.byte_string()?;
        decoder.skip_whitespace();
        let start = decoder.pos;
        decoder.value(1)?;
        if found.is_none() && entry_key == key {
            found = Some(&data[start..decoder.pos]);
        }
    }

    decoder.finish()?;
    Ok(found)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn expect(&mut self, byte: u8) -> Result<(), BencodeError> {
        let found = self.peek()?;
        if found != byte {
            return Err(BencodeError::UnexpectedByte {
                byte: found,
                position: self.pos,
            });
        }
        self.pos += 1;
        Ok(())
    }

    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\n' | b'\r' | b'\t') = self.data.get(self.pos) {
            self.pos += 1;
        }
    }

    fn finish(&mut self) -> Result<(), BencodeError> {
        self.skip_whitespace();
        if self.pos != self.data.len() {
            return Err(BencodeError::TrailingData { position: self.pos });
        }
        Ok(())
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        self.skip_whitespace();
        match self.peek()? {
            b'i' => self.integer().map(Value::Integer),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.byte_string().map(Value::Bytes),
            byte => Err(BencodeError::UnexpectedByte {
                byte,
                position: self.pos,
            }),
        }
    }

    fn integer(&mut self) -> Result<i64, BencodeError> {
        self.expect(b'i')?;
        let start = self.pos;
        let digits = self.take_until(b'e')?;

        let invalid = |reason: &str| BencodeError::InvalidInteger {
            position: start,
            reason: reason.to_string(),
        };

        let text = std::str::from_utf8(digits).map_err(|_| invalid("not ASCII"))?;
        if text.is_empty() {
            return Err(invalid("empty"));
        }
        if text.starts_with("-0") || (text.starts_with('0') && text.len() > 1) {
            return Err(invalid("leading zero"));
        }

        text.parse().map_err(|_| invalid(text))
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        let digits = self.take_until(b':')?;

        let length: usize = std::str::from_utf8(digits)
            .ok()
            .filter(|text| text.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|text| text.parse().ok())
            .ok_or(BencodeError::InvalidStringLength { position: start })?;

        let end = self
            .pos
            .checked_add(length)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof)?;

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.expect(b'l')?;
        let mut items = Vec::new();

        loop {
            self.skip_whitespace();
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(Value::List(items));
            }
            items.push(self.value(depth + 1)?);
        }
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.expect(b'd')?;
        let mut entries = BTreeMap::new();

        loop {
            self.skip_whitespace();
            match self.peek()? {
                b'e' => {
                    self.pos += 1;
                    return Ok(Value::Dict(entries));
                }
                b'0'..=b'9' => {
                    let key = self.byte_string()?;
                    let value = self.value(depth + 1)?;
                    entries.insert(key, value);
                }
                _ => return Err(BencodeError::NonStringKey { position: self.pos }),
            }
        }
    }

    /// Consumes bytes up to `terminator`, returning them without it.
    fn take_until(&mut self, terminator: u8) -> Result<&'a [u8], BencodeError> {
        let data = self.data;
        let offset = data[self.pos..]
            .iter()
            .position(|&b| b == terminator)
            .ok_or(BencodeError::UnexpectedEof)?;

        let taken = &data[self.pos..self.pos + offset];
        self.pos += offset + 1;
        Ok(taken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dict(
            entries
                .into_iter()
                .map(|(key, value)| (Bytes::copy_from_slice(key.as_bytes()), value))
                .collect(),
        )
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Integer(-7));
        assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
        assert_eq!(decode(b"4:spam").unwrap(), Value::string("spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::string(""));
    }

    #[test]
    fn test_decode_nested() {
        let value = decode(b"d4:listl1:ai2ee3:numi1ee").unwrap();

        assert_eq!(
            value,
            dict(vec![
                (
                    "list",
                    Value::List(vec![Value::string("a"), Value::Integer(2)])
                ),
                ("num", Value::Integer(1)),
            ])
        );
        assert_eq!(value.get("num").and_then(Value::as_integer), Some(1));
    }

    #[test]
    fn test_whitespace_is_skipped() {
        let value = decode(b"\n d 1:a\n i1e\n1:b l i2e\te e\n").unwrap();
        assert_eq!(
            value,
            dict(vec![
                ("a", Value::Integer(1)),
                ("b", Value::List(vec![Value::Integer(2)])),
            ])
        );
    }

    #[test]
    fn test_rejects_malformed_integers() {
        for input in [&b"ie"[..], b"i-0e", b"i03e", b"i1x2e", b"i99999999999999999999e"] {
            assert!(
                matches!(decode(input), Err(BencodeError::InvalidInteger { .. })),
                "accepted {:?}",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn test_rejects_structural_errors() {
        assert_eq!(decode(b"5:abc"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"l i1e"), Err(BencodeError::UnexpectedEof));
        assert!(matches!(
            decode(b"di1ei2ee"),
            Err(BencodeError::NonStringKey { position: 1 })
        ));
        assert!(matches!(
            decode(b"i1ei2e"),
            Err(BencodeError::TrailingData { position: 3 })
        ));
        assert!(matches!(
            decode(b"x"),
            Err(BencodeError::UnexpectedByte { byte: b'x', .. })
        ));
        assert!(matches!(
            decode(b"-3:abc"),
            Err(BencodeError::UnexpectedByte { .. })
        ));
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}{}", "l".repeat(100), "e".repeat(100));
        assert_eq!(decode(deep.as_bytes()), Err(BencodeError::NestingTooDeep));
    }

    #[test]
    fn test_encode_sorts_dictionary_keys() {
        let value = dict(vec![
            ("zeta", Value::Integer(1)),
            ("alpha", Value::List(vec![Value::string("x"), Value::Integer(-3)])),
        ]);

        assert_eq!(&value.encode()[..], b"d5:alphal1:xi-3ee4:zetai1ee");
    }

    #[test]
    fn test_encode_decode_preserves_binary() {
        let value = Value::Bytes(Bytes::from_static(&[0, 255, 19, b':', b'e']));
        assert_eq!(decode(&value.encode()).unwrap(), value);
    }

    #[test]
    fn test_raw_dict_value_returns_original_bytes() {
        // Keys out of order and whitespace inside the info value: a
        // re-encoding would differ from the original bytes.
        let data = b"d8:announce3:url4:infod4:name1:x6:lengthi3e e3:zzzi0ee";
        let raw = raw_dict_value(data, b"info").unwrap().unwrap();

        assert_eq!(raw, b"d4:name1:x6:lengthi3e e");
        assert_eq!(raw_dict_value(data, b"missing").unwrap(), None);
    }

    #[test]
    fn test_raw_dict_value_requires_dictionary() {
        assert!(raw_dict_value(b"li1ee", b"info").is_err());
    }

    #[test]
    fn test_display_tree() {
        let value = dict(vec![
            ("name", Value::string("file.iso")),
            ("hash", Value::Bytes(Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF]))),
            ("sizes", Value::List(vec![Value::Integer(1)])),
        ]);

        let rendered = value.to_string();
        assert_eq!(
            rendered,
            "dict (3 keys)\n  hash: <4 bytes: deadbeef..>\n  name: \"file.iso\"\n  sizes: list (1 items)\n    - 1\n"
        );
    }
}
