//! Record keys, key paths and key ranges.
//!
//! A key is either a number or a string. Numbers sort before strings, numbers
//! compare numerically and strings compare bytewise. The byte encoding used by
//! ordered backends preserves this order, so a range scan over encoded keys
//! yields records in key order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

/// Type tag for numeric keys.
const TAG_NUMBER: u8 = 0x10;

/// Type tag for string keys.
const TAG_TEXT: u8 = 0x20;

/// Escape byte inside encoded strings.
const ESCAPE: u8 = 0x00;

/// Follows `ESCAPE` to encode a literal 0x00 byte.
const ESCAPED_NUL: u8 = 0xFF;

/// Follows `ESCAPE` to terminate an encoded string.
const TERMINATOR: u8 = 0x01;

/// A primary or index key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Number(f64),
    Text(String),
}

impl KeyValue {
    /// Extract a key from a JSON value. Only numbers and strings are keys.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().filter(|f| !f.is_nan()).map(KeyValue::Number),
            Value::String(s) => Some(KeyValue::Text(s.clone())),
            _ => None,
        }
    }

    /// Convert back to JSON, keeping integral numbers integral.
    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::Number(f) => {
                if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    Value::from(*f as i64)
                } else {
                    serde_json::Number::from_f64(*f)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            KeyValue::Text(s) => Value::String(s.clone()),
        }
    }

    /// Resolve `key_path` in `record` and extract a key from it.
    pub fn extract(record: &Value, key_path: &str) -> Option<Self> {
        resolve_path(record, key_path).and_then(Self::from_json)
    }

    /// Encode to an order-preserving byte string.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        self.encode_into(&mut out);
        out
    }

    /// Append the order-preserving encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            KeyValue::Number(f) => {
                out.push(TAG_NUMBER);
                out.extend_from_slice(&order_bits(*f).to_be_bytes());
            }
            KeyValue::Text(s) => {
                out.push(TAG_TEXT);
                for &b in s.as_bytes() {
                    if b == ESCAPE {
                        out.push(ESCAPE);
                        out.push(ESCAPED_NUL);
                    } else {
                        out.push(b);
                    }
                }
                out.push(ESCAPE);
                out.push(TERMINATOR);
            }
        }
    }

    /// Decode a key from the front of `bytes`, returning it and the number of
    /// bytes consumed. Encodings are self-delimiting, so composite keys can
    /// be split without a length prefix.
    pub fn decode_prefix(bytes: &[u8]) -> Option<(Self, usize)> {
        match *bytes.first()? {
            TAG_NUMBER => {
                let raw: [u8; 8] = bytes.get(1..9)?.try_into().ok()?;
                Some((KeyValue::Number(from_order_bits(u64::from_be_bytes(raw))), 9))
            }
            TAG_TEXT => {
                let mut text = Vec::new();
                let mut i = 1;
                loop {
                    let b = *bytes.get(i)?;
                    if b == ESCAPE {
                        match *bytes.get(i + 1)? {
                            ESCAPED_NUL => text.push(0),
                            TERMINATOR => {
                                let s = String::from_utf8(text).ok()?;
                                return Some((KeyValue::Text(s), i + 2));
                            }
                            _ => return None,
                        }
                        i += 2;
                    } else {
                        text.push(b);
                        i += 1;
                    }
                }
            }
            _ => None,
        }
    }

    /// Decode a key that occupies all of `bytes`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        match Self::decode_prefix(bytes)? {
            (key, used) if used == bytes.len() => Some(key),
            _ => None,
        }
    }
}

/// Map an f64 to a u64 whose unsigned order matches numeric order.
fn order_bits(f: f64) -> u64 {
    // -0.0 and 0.0 are the same key
    let bits = (f + 0.0).to_bits();
    if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits ^ (1 << 63)
    }
}

fn from_order_bits(bits: u64) -> f64 {
    if bits & (1 << 63) != 0 {
        f64::from_bits(bits ^ (1 << 63))
    } else {
        f64::from_bits(!bits)
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Number(a), KeyValue::Number(b)) => (a + 0.0).total_cmp(&(b + 0.0)),
            (KeyValue::Number(_), KeyValue::Text(_)) => Ordering::Less,
            (KeyValue::Text(_), KeyValue::Number(_)) => Ordering::Greater,
            (KeyValue::Text(a), KeyValue::Text(b)) => a.as_bytes().cmp(b.as_bytes()),
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        KeyValue::Text(s.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(s: String) -> Self {
        KeyValue::Text(s)
    }
}

impl From<i64> for KeyValue {
    fn from(n: i64) -> Self {
        KeyValue::Number(n as f64)
    }
}

impl From<i32> for KeyValue {
    fn from(n: i32) -> Self {
        KeyValue::Number(f64::from(n))
    }
}

impl From<f64> for KeyValue {
    fn from(n: f64) -> Self {
        KeyValue::Number(n)
    }
}

/// Resolve a dotted key path (`"value.expiresAt"`) inside a JSON value.
pub fn resolve_path<'a>(value: &'a Value, key_path: &str) -> Option<&'a Value> {
    key_path
        .split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

// ============================================================================
// KEY RANGES
// ============================================================================

/// A range over keys with independently open or closed bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    lower: Bound<KeyValue>,
    upper: Bound<KeyValue>,
}

impl KeyRange {
    /// Every key.
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// Exactly one key.
    pub fn only(key: impl Into<KeyValue>) -> Self {
        let key = key.into();
        Self {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    /// Keys `<= key`.
    pub fn at_most(key: impl Into<KeyValue>) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Included(key.into()),
        }
    }

    /// Keys `< key`.
    pub fn below(key: impl Into<KeyValue>) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Excluded(key.into()),
        }
    }

    /// Keys `>= key`.
    pub fn at_least(key: impl Into<KeyValue>) -> Self {
        Self {
            lower: Bound::Included(key.into()),
            upper: Bound::Unbounded,
        }
    }

    /// Keys `> key`.
    pub fn above(key: impl Into<KeyValue>) -> Self {
        Self {
            lower: Bound::Excluded(key.into()),
            upper: Bound::Unbounded,
        }
    }

    /// Keys between `lower` and `upper`, each bound open or closed.
    pub fn between(
        lower: impl Into<KeyValue>,
        upper: impl Into<KeyValue>,
        lower_open: bool,
        upper_open: bool,
    ) -> Self {
        let (lower, upper) = (lower.into(), upper.into());
        Self {
            lower: if lower_open {
                Bound::Excluded(lower)
            } else {
                Bound::Included(lower)
            },
            upper: if upper_open {
                Bound::Excluded(upper)
            } else {
                Bound::Included(upper)
            },
        }
    }

    pub fn lower(&self) -> Bound<&KeyValue> {
        self.lower.as_ref()
    }

    pub fn upper(&self) -> Bound<&KeyValue> {
        self.upper.as_ref()
    }

    /// True if `key` lies below the lower bound.
    pub fn is_below(&self, key: &KeyValue) -> bool {
        match &self.lower {
            Bound::Unbounded => false,
            Bound::Included(lo) => key < lo,
            Bound::Excluded(lo) => key <= lo,
        }
    }

    /// True if `key` lies past the upper bound; an ascending scan can stop.
    pub fn is_above(&self, key: &KeyValue) -> bool {
        match &self.upper {
            Bound::Unbounded => false,
            Bound::Included(hi) => key > hi,
            Bound::Excluded(hi) => key >= hi,
        }
    }

    pub fn contains(&self, key: &KeyValue) -> bool {
        !self.is_below(key) && !self.is_above(key)
    }

    /// Encoded lower bound for a byte-ordered scan start. Excluded bounds
    /// start at the key itself; callers skip it with [`KeyRange::contains`].
    pub fn encoded_start(&self) -> Option<Vec<u8>> {
        match &self.lower {
            Bound::Unbounded => None,
            Bound::Included(k) | Bound::Excluded(k) => Some(k.encode()),
        }
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numbers_sort_before_strings() {
        assert!(KeyValue::from(1_000_000) < KeyValue::from(""));
        assert!(KeyValue::from("a") < KeyValue::from("b"));
        assert!(KeyValue::from(-5) < KeyValue::from(3));
    }

    #[test]
    fn test_negative_zero_equals_zero() {
        assert_eq!(KeyValue::Number(-0.0), KeyValue::Number(0.0));
        assert_eq!(KeyValue::Number(-0.0).encode(), KeyValue::Number(0.0).encode());
    }

    #[test]
    fn test_from_json_rejects_non_keys() {
        assert!(KeyValue::from_json(&json!(true)).is_none());
        assert!(KeyValue::from_json(&json!(null)).is_none());
        assert!(KeyValue::from_json(&json!({"a": 1})).is_none());
        assert_eq!(KeyValue::from_json(&json!(7)), Some(KeyValue::from(7)));
    }

    #[test]
    fn test_to_json_keeps_integers() {
        assert_eq!(KeyValue::from(42).to_json(), json!(42));
        assert_eq!(KeyValue::from(1.5).to_json(), json!(1.5));
        assert_eq!(KeyValue::from("k").to_json(), json!("k"));
    }

    #[test]
    fn test_resolve_dotted_path() {
        let record = json!({"key": "p1", "value": {"expiresAt": 1700}});
        assert_eq!(resolve_path(&record, "value.expiresAt"), Some(&json!(1700)));
        assert_eq!(resolve_path(&record, "value.missing"), None);
        assert_eq!(KeyValue::extract(&record, "key"), Some(KeyValue::from("p1")));
    }

    #[test]
    fn test_string_with_nul_roundtrips() {
        let key = KeyValue::from("a\0b");
        assert_eq!(KeyValue::decode(&key.encode()), Some(key));
    }

    #[test]
    fn test_decode_prefix_splits_composite() {
        let mut bytes = KeyValue::from("idx").encode();
        let pk = KeyValue::from(9);
        pk.encode_into(&mut bytes);

        let (first, used) = KeyValue::decode_prefix(&bytes).expect("prefix should decode");
        assert_eq!(first, KeyValue::from("idx"));
        assert_eq!(KeyValue::decode(&bytes[used..]), Some(pk));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(KeyValue::decode(&[]).is_none());
        assert!(KeyValue::decode(&[0x99, 1, 2]).is_none());
        assert!(KeyValue::decode(&[TAG_TEXT, b'a']).is_none());
        assert!(KeyValue::decode(&[TAG_NUMBER, 0, 0]).is_none());
    }

    #[test]
    fn test_range_bounds() {
        let range = KeyRange::between(10, 20, true, false);
        assert!(!range.contains(&KeyValue::from(10)));
        assert!(range.contains(&KeyValue::from(15)));
        assert!(range.contains(&KeyValue::from(20)));
        assert!(range.is_above(&KeyValue::from(21)));

        let upto = KeyRange::at_most(100);
        assert!(upto.contains(&KeyValue::from(-1_000)));
        assert!(upto.contains(&KeyValue::from(100)));
        assert!(!upto.contains(&KeyValue::from("100")));

        let only = KeyRange::only("x");
        assert!(only.contains(&KeyValue::from("x")));
        assert!(!only.contains(&KeyValue::from("xy")));
        assert!(KeyRange::all().contains(&KeyValue::from("anything")));
    }
}
