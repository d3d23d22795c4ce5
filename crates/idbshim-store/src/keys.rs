//! Keys, key paths, key ranges and their order-preserving text encoding
//!
//! Encoded keys are stored in `key` and `I_` columns and compared by the
//! backend as plain text, so `encode_key(a) < encode_key(b)` must hold
//! exactly when `a < b`:
//!
//! ```text
//! Number  '1' + 16 hex digits of the order-transformed IEEE-754 bits
//! String  '3' + body + U+0001   (U+0000..=U+0002 written as U+0002 + digit)
//! Array   '5' + encoded elements + U+0001
//! ```
//!
//! String keys compare by UTF-16 code unit while the backend compares
//! UTF-8 text by code point. The two orders differ only for U+E000..=U+FFFF,
//! which sort after every supplementary character as code units. Those
//! characters are written as U+10FFFF + the character, and U+10FFFF itself
//! as U+10FFFF + U+0003.
//!
//! A multi-entry index column holds the concatenated encodings of the
//! distinct elements of an array key.

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::iter::Peekable;
use std::str::Chars;

use idbshim_codec::{ObjectRef, Value};
use serde::{Deserialize, Serialize};

use crate::error::ShimError;
use crate::ShimResult;

const NUMBER_TAG: char = '1';
const STRING_TAG: char = '3';
const ARRAY_TAG: char = '5';
const TERMINATOR: char = '\u{1}';
const ESCAPE: char = '\u{2}';
const HIGH_SHIFT: char = '\u{10FFFF}';
const HIGH_SHIFT_SELF: char = '\u{3}';

/// A valid key. Numbers are never NaN.
#[derive(Debug, Clone)]
pub enum Key {
    Number(f64),
    String(String),
    Array(Vec<Key>),
}

impl Key {
    /// Convert a record value into a key, if it is one.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Number(n) if !n.is_nan() => Some(Key::Number(*n)),
            Value::String(s) => Some(Key::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
            Value::Raw(raw) => Key::from_value(&Value::from(raw.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) => Value::Number(*n),
            Key::String(s) => Value::String(s.clone()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Key::Number(n) => !n.is_nan(),
            Key::String(_) => true,
            Key::Array(items) => items.iter().all(Key::is_valid),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::String(_) => 1,
            Key::Array(_) => 2,
        }
    }

    /// Key order: numbers before strings before arrays.
    pub fn compare(&self, other: &Key) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Key::String(a), Key::String(b)) => a.encode_utf16().cmp(b.encode_utf16()),
            (Key::Array(a), Key::Array(b)) => {
                for (x, y) in a.iter().zip(b) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl From<f64> for Key {
    fn from(n: f64) -> Self {
        Key::Number(n)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(f64::from(n))
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Self {
        Key::Array(items)
    }
}

/// Store or index key path, persisted as a JSON string or array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    /// Dotted path; the empty string means the record itself
    Single(String),
    Sequence(Vec<String>),
}

impl KeyPath {
    pub fn is_valid(&self) -> bool {
        match self {
            KeyPath::Single(path) => is_valid_path(path),
            KeyPath::Sequence(paths) => !paths.is_empty() && paths.iter().all(|p| is_valid_path(p)),
        }
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self, KeyPath::Sequence(_))
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Single(path.to_string())
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(paths: Vec<&str>) -> Self {
        KeyPath::Sequence(paths.into_iter().map(String::from).collect())
    }
}

fn is_valid_path(path: &str) -> bool {
    path.is_empty() || path.split('.').all(is_identifier)
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c == '$' || c == '_' || c.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '$' || c == '_' || c.is_alphanumeric())
}

/// Follow a dotted path. `length` resolves on strings (UTF-16 units) and
/// arrays.
fn resolve(value: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(value.clone());
    }
    let mut current = value.clone();
    for segment in path.split('.') {
        if let Value::Raw(raw) = &current {
            current = Value::from(raw.clone());
        }
        current = match &current {
            Value::String(s) if segment == "length" => Value::Number(s.encode_utf16().count() as f64),
            Value::Array(items) if segment == "length" => Value::Number(items.len() as f64),
            Value::Object(obj) => obj.get(segment)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Evaluate a key path against a record; `None` when it yields no valid key.
pub fn evaluate_key_path(value: &Value, key_path: &KeyPath) -> Option<Key> {
    match key_path {
        KeyPath::Single(path) => resolve(value, path).and_then(|v| Key::from_value(&v)),
        KeyPath::Sequence(paths) => paths
            .iter()
            .map(|p| resolve(value, p).and_then(|v| Key::from_value(&v)))
            .collect::<Option<Vec<_>>>()
            .map(Key::Array),
    }
}

/// Evaluate an index key path. For multi-entry indexes an array value
/// keeps only its distinct valid elements.
pub fn evaluate_index_key(value: &Value, key_path: &KeyPath, multi_entry: bool) -> Option<Key> {
    let KeyPath::Single(path) = key_path else {
        return evaluate_key_path(value, key_path);
    };
    if !multi_entry {
        return evaluate_key_path(value, key_path);
    }
    match resolve(value, path)? {
        Value::Array(items) => {
            let mut distinct: Vec<Key> = Vec::new();
            for key in items.iter().filter_map(Key::from_value) {
                if !distinct.contains(&key) {
                    distinct.push(key);
                }
            }
            Some(Key::Array(distinct))
        }
        other => Key::from_value(&other),
    }
}

/// Whether a generated key could be stored at `path` inside `value`.
pub fn can_inject_key(value: &Value, path: &str) -> bool {
    let Value::Object(obj) = value else {
        return false;
    };
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = obj.clone();
    for segment in &segments[..segments.len() - 1] {
        match current.get(segment) {
            None => return true,
            Some(Value::Object(next)) => current = next,
            Some(_) => return false,
        }
    }
    true
}

/// Store `key` at `path` inside `value`, creating intermediate objects.
pub fn inject_key(value: &Value, path: &str, key: &Key) -> ShimResult<()> {
    let Value::Object(obj) = value else {
        return Err(ShimError::Data(
            "Cannot inject a key into a non-object value".to_string(),
        ));
    };
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| ShimError::Data("Empty key path".to_string()))?;
    let mut current = obj.clone();
    for segment in parents {
        current = match current.get(segment) {
            None => {
                let next = ObjectRef::new();
                current.set(*segment, next.clone());
                next
            }
            Some(Value::Object(next)) => next,
            Some(_) => {
                return Err(ShimError::Data(format!(
                    "Cannot inject a key: \"{segment}\" is not an object"
                )))
            }
        };
    }
    current.set(*last, key.to_value());
    Ok(())
}

/// Order-preserving text encoding of one key.
pub fn encode_key(key: &Key) -> String {
    let mut out = String::new();
    write_key(key, &mut out);
    out
}

/// Index column text. Multi-entry array keys become the concatenation of
/// their distinct element encodings (empty when there are none).
pub fn encode_index_key(key: &Key, multi_entry: bool) -> String {
    match key {
        Key::Array(items) if multi_entry => {
            let mut seen: Vec<&Key> = Vec::new();
            let mut out = String::new();
            for item in items {
                if !seen.contains(&item) {
                    seen.push(item);
                    write_key(item, &mut out);
                }
            }
            out
        }
        _ => encode_key(key),
    }
}

fn write_key(key: &Key, out: &mut String) {
    match key {
        Key::Number(n) => {
            let n = if *n == 0.0 { 0.0 } else { *n };
            let bits = n.to_bits();
            let ordered = if bits >> 63 == 1 {
                !bits
            } else {
                bits | (1 << 63)
            };
            out.push(NUMBER_TAG);
            let _ = write!(out, "{ordered:016x}");
        }
        Key::String(s) => {
            out.push(STRING_TAG);
            for c in s.chars() {
                let code = u32::from(c);
                match c {
                    '\u{0}'..='\u{2}' => {
                        out.push(ESCAPE);
                        out.push(char::from(b'0' + code as u8));
                    }
                    '\u{E000}'..='\u{FFFF}' => {
                        out.push(HIGH_SHIFT);
                        out.push(c);
                    }
                    HIGH_SHIFT => {
                        out.push(HIGH_SHIFT);
                        out.push(HIGH_SHIFT_SELF);
                    }
                    _ => out.push(c),
                }
            }
            out.push(TERMINATOR);
        }
        Key::Array(items) => {
            out.push(ARRAY_TAG);
            for item in items {
                write_key(item, out);
            }
            out.push(TERMINATOR);
        }
    }
}

/// Decode one key written by [`encode_key`].
pub fn decode_key(text: &str) -> ShimResult<Key> {
    let mut chars = text.chars().peekable();
    let key = read_key(&mut chars)?;
    if chars.next().is_some() {
        return Err(malformed(text));
    }
    Ok(key)
}

/// Decode an index column into the keys it holds.
pub fn decode_index_key(text: &str, multi_entry: bool) -> ShimResult<Vec<Key>> {
    if !multi_entry {
        return Ok(vec![decode_key(text)?]);
    }
    let mut chars = text.chars().peekable();
    let mut keys = Vec::new();
    while chars.peek().is_some() {
        keys.push(read_key(&mut chars).map_err(|_| malformed(text))?);
    }
    Ok(keys)
}

fn read_key(chars: &mut Peekable<Chars<'_>>) -> ShimResult<Key> {
    match chars.next() {
        Some(NUMBER_TAG) => {
            let hex: String = chars.by_ref().take(16).collect();
            let ordered = u64::from_str_radix(&hex, 16)
                .ok()
                .filter(|_| hex.len() == 16)
                .ok_or_else(|| malformed(&hex))?;
            let bits = if ordered >> 63 == 1 {
                ordered & !(1 << 63)
            } else {
                !ordered
            };
            Ok(Key::Number(f64::from_bits(bits)))
        }
        Some(STRING_TAG) => {
            let mut s = String::new();
            loop {
                match chars.next() {
                    Some(TERMINATOR) => return Ok(Key::String(s)),
                    Some(ESCAPE) => match chars.next() {
                        Some(d @ '0'..='2') => s.push(char::from(d as u8 - b'0')),
                        _ => return Err(malformed(&s)),
                    },
                    Some(HIGH_SHIFT) => match chars.next() {
                        Some(HIGH_SHIFT_SELF) => s.push(HIGH_SHIFT),
                        Some(c @ '\u{E000}'..='\u{FFFF}') => s.push(c),
                        _ => return Err(malformed(&s)),
                    },
                    Some(c) => s.push(c),
                    None => return Err(malformed(&s)),
                }
            }
        }
        Some(ARRAY_TAG) => {
            let mut items = Vec::new();
            loop {
                match chars.peek() {
                    Some(&TERMINATOR) => {
                        chars.next();
                        return Ok(Key::Array(items));
                    }
                    Some(_) => items.push(read_key(chars)?),
                    None => return Err(malformed("unterminated array")),
                }
            }
        }
        _ => Err(malformed("unknown key tag")),
    }
}

fn malformed(text: &str) -> ShimError {
    ShimError::Data(format!("Malformed key encoding: {text:?}"))
}

/// Interval of keys.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    pub lower: Option<Key>,
    pub upper: Option<Key>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRange {
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    /// Fails with `Data` when the bounds describe an empty range.
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> ShimResult<Self> {
        let (lower, upper) = (lower.into(), upper.into());
        match lower.compare(&upper) {
            Ordering::Greater => {
                return Err(ShimError::Data(
                    "The lower key is greater than the upper key".to_string(),
                ))
            }
            Ordering::Equal if lower_open || upper_open => {
                return Err(ShimError::Data(
                    "The lower key and upper key are equal and one of the bounds is open"
                        .to_string(),
                ))
            }
            _ => {}
        }
        Ok(Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        })
    }

    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Some(key.into()),
            upper: None,
            lower_open: open,
            upper_open: false,
        }
    }

    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: None,
            upper: Some(key.into()),
            lower_open: false,
            upper_open: open,
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        let above = self.lower.as_ref().map_or(true, |lower| {
            match key.compare(lower) {
                Ordering::Greater => true,
                Ordering::Equal => !self.lower_open,
                Ordering::Less => false,
            }
        });
        let below = self.upper.as_ref().map_or(true, |upper| {
            match key.compare(upper) {
                Ordering::Less => true,
                Ordering::Equal => !self.upper_open,
                Ordering::Greater => false,
            }
        });
        above && below
    }
}

/// Argument of index lookups: one key or a range.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyQuery {
    Key(Key),
    Range(KeyRange),
}

impl KeyQuery {
    pub fn matches(&self, key: &Key) -> bool {
        match self {
            KeyQuery::Key(k) => k == key,
            KeyQuery::Range(range) => range.contains(key),
        }
    }

    pub(crate) fn validate(&self) -> ShimResult<()> {
        let valid = match self {
            KeyQuery::Key(k) => k.is_valid(),
            KeyQuery::Range(r) => {
                r.lower.as_ref().map_or(true, Key::is_valid)
                    && r.upper.as_ref().map_or(true, Key::is_valid)
            }
        };
        if valid {
            Ok(())
        } else {
            Err(ShimError::Data("The parameter is not a valid key".to_string()))
        }
    }
}

impl From<Key> for KeyQuery {
    fn from(key: Key) -> Self {
        KeyQuery::Key(key)
    }
}

impl From<KeyRange> for KeyQuery {
    fn from(range: KeyRange) -> Self {
        KeyQuery::Range(range)
    }
}

impl From<&str> for KeyQuery {
    fn from(s: &str) -> Self {
        KeyQuery::Key(Key::from(s))
    }
}

impl From<f64> for KeyQuery {
    fn from(n: f64) -> Self {
        KeyQuery::Key(Key::from(n))
    }
}

impl From<i32> for KeyQuery {
    fn from(n: i32) -> Self {
        KeyQuery::Key(Key::from(n))
    }
}
