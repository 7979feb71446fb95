//! Order preserving binary encoding of JSON values.
//!
//! Index keys are compared as bytes, so the encoding sorts like the values it encodes:
//! null, false, true, numbers, strings, arrays, objects. Arrays compare element by element
//! with shorter prefixes first. Objects compare by their canonical JSON text.

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use serde_json::{Number, Value};

const NULL: u8 = 0x10;
const FALSE: u8 = 0x11;
const TRUE: u8 = 0x12;
const NUMBER: u8 = 0x20;
const STRING: u8 = 0x30;
const ARRAY: u8 = 0x40;
const OBJECT: u8 = 0x50;

/// Ends an array. Sorts before every element tag.
const ARRAY_END: u8 = 0x00;
const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0x01;
const STRING_END: u8 = 0x00;

/// Largest magnitude below which every integer is exact in an `f64`.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

pub fn encode(value: &Value) -> Bytes {
    let mut out = Vec::new();
    write_value(&mut out, value);
    out.into()
}

/// The key stored for a document that emitted `key`.
pub fn encode_row(key: &Value, id: &str) -> Bytes {
    encode(&Value::Array(vec![key.clone(), Value::String(id.to_string())]))
}

/// Inverse of [`encode_row`].
pub fn decode_row(bytes: &[u8]) -> Result<(Value, String)> {
    match decode(bytes)? {
        Value::Array(mut items) if items.len() == 2 => {
            let id = match items.pop() {
                Some(Value::String(id)) => id,
                other => bail!("row id must be a string, got {other:?}"),
            };
            let key = items.pop().context("row without key")?;
            Ok((key, id))
        }
        other => bail!("not an index row: {other}"),
    }
}

/// Prefix shared by every row whose emitted key is `key`.
pub fn key_prefix(key: &Value) -> Bytes {
    let mut out = vec![ARRAY];
    write_value(&mut out, key);
    out.into()
}

/// Prefix shared by every row whose emitted key is an array starting with `items`.
pub fn array_prefix(items: &[Value]) -> Bytes {
    let mut out = vec![ARRAY, ARRAY];
    for item in items {
        write_value(&mut out, item);
    }
    out.into()
}

/// The smallest byte string greater than every string starting with `prefix`, or `None`
/// when no such string exists.
pub fn prefix_end(prefix: &[u8]) -> Option<Bytes> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end.into());
        }
    }
    None
}

pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut reader = Reader { bytes, pos: 0 };
    let value = reader.value()?;
    ensure!(reader.pos == bytes.len(), "trailing bytes after key");
    Ok(value)
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(NULL),
        Value::Bool(false) => out.push(FALSE),
        Value::Bool(true) => out.push(TRUE),
        Value::Number(n) => {
            out.push(NUMBER);
            out.extend_from_slice(&number_bytes(n.as_f64().unwrap_or_default()));
        }
        Value::String(s) => {
            out.push(STRING);
            write_str(out, s);
        }
        Value::Array(items) => {
            out.push(ARRAY);
            for item in items {
                write_value(out, item);
            }
            out.push(ARRAY_END);
        }
        Value::Object(_) => {
            out.push(OBJECT);
            write_str(out, &value.to_string());
        }
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    for &b in s.as_bytes() {
        if b == 0 {
            out.extend_from_slice(&[ESCAPE, ESCAPED_ZERO]);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&[ESCAPE, STRING_END]);
}

fn number_bytes(n: f64) -> [u8; 8] {
    // -0.0 and 0.0 are the same key
    let n = if n == 0.0 { 0.0 } else { n };
    let bits = n.to_bits();
    let bits = if bits >> 63 == 1 { !bits } else { bits | 1 << 63 };
    bits.to_be_bytes()
}

fn number_from_bytes(bytes: [u8; 8]) -> Value {
    let bits = u64::from_be_bytes(bytes);
    let bits = if bits >> 63 == 1 { bits & !(1 << 63) } else { !bits };
    let n = f64::from_bits(bits);
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn byte(&mut self) -> Result<u8> {
        let b = *self.bytes.get(self.pos).context("unexpected end of key")?;
        self.pos += 1;
        Ok(b)
    }

    fn peek(&self) -> Result<u8> {
        self.bytes.get(self.pos).copied().context("unexpected end of key")
    }

    fn value(&mut self) -> Result<Value> {
        Ok(match self.byte()? {
            NULL => Value::Null,
            FALSE => Value::Bool(false),
            TRUE => Value::Bool(true),
            NUMBER => {
                let end = self.pos + 8;
                let slice = self.bytes.get(self.pos..end).context("truncated number")?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(slice);
                self.pos = end;
                number_from_bytes(buf)
            }
            STRING => Value::String(self.string()?),
            ARRAY => {
                let mut items = Vec::new();
                while self.peek()? != ARRAY_END {
                    items.push(self.value()?);
                }
                self.pos += 1;
                Value::Array(items)
            }
            OBJECT => serde_json::from_str(&self.string()?)?,
            tag => bail!("unknown key tag {tag:#04x}"),
        })
    }

    fn string(&mut self) -> Result<String> {
        let mut out = Vec::new();
        loop {
            match self.byte()? {
                ESCAPE => match self.byte()? {
                    STRING_END => break,
                    ESCAPED_ZERO => out.push(0),
                    b => bail!("invalid escape {b:#04x}"),
                },
                b => out.push(b),
            }
        }
        Ok(String::from_utf8(out)?)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn types_sort_in_collation_order() {
        let ordered = [
            json!(null),
            json!(false),
            json!(true),
            json!(-10),
            json!(-1.5),
            json!(0),
            json!(2),
            json!(10),
            json!(""),
            json!("a"),
            json!("a\u{0}"),
            json!("a\u{1}"),
            json!("b"),
            json!([]),
            json!([1]),
            json!([1, 2]),
            json!([2]),
            json!({"a": 1}),
        ];
        for pair in ordered.windows(2) {
            assert!(
                encode(&pair[0]) < encode(&pair[1]),
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn rows_decode_back() {
        let key = json!(["tag", 3, {"nested": [null, true]}, "x\u{0}y"]);
        let row = encode_row(&key, "doc-1");
        assert_eq!(decode_row(&row).unwrap(), (key, "doc-1".to_string()));
        assert_eq!(decode(&encode(&json!(-0.25))).unwrap(), json!(-0.25));
        assert!(decode(&[0x7f]).is_err());
    }

    #[test]
    fn prefixes_bound_their_rows() {
        let prefix = key_prefix(&json!("b"));
        let end = prefix_end(&prefix).unwrap();
        for (key, inside) in [("a", false), ("b", true), ("bb", false), ("c", false)] {
            let row = encode_row(&json!(key), "id");
            assert_eq!(row >= prefix && row < end, inside, "{key}");
        }

        let prefix = array_prefix(&[json!("x")]);
        assert!(encode_row(&json!(["x", 1]), "id").starts_with(&prefix));
        assert!(encode_row(&json!(["x"]), "id").starts_with(&prefix));
        assert!(!encode_row(&json!(["y", 1]), "id").starts_with(&prefix));
        assert_eq!(prefix_end(&[0x01, 0xff]), Some(Bytes::from_static(&[0x02])));
        assert_eq!(prefix_end(&[0xff]), None);
    }

    proptest! {
        #[test]
        fn numbers_keep_their_order(a in -1e12f64..1e12, b in -1e12f64..1e12) {
            let expected = a.partial_cmp(&b).unwrap();
            prop_assert_eq!(encode(&json!(a)).cmp(&encode(&json!(b))), expected);
        }

        #[test]
        fn strings_keep_their_order(a in any::<String>(), b in any::<String>()) {
            prop_assert_eq!(encode(&json!(a)).cmp(&encode(&json!(b))), a.cmp(&b));
        }
    }
}
