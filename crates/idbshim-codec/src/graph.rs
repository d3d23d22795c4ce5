//! Identity-preserving object-graph codec
//!
//! Record values are graphs: objects are shared by reference and may
//! point back at their ancestors. The stored form is a JSON tree in which
//! every object carries a call-scoped surrogate id (`@id`) the first time it
//! is seen and is replaced by a reference marker (`@ref`) afterwards.
//!
//! ```text
//! a = {name: "a"}; a.self = a; root = [a, a]
//! => [{"@id":"0","name":"a","self":{"@ref":"0"}}, {"@ref":"0"}]
//! ```
//!
//! Visited objects are tracked in a table keyed by allocation address that
//! lives only for one `encode`/`decode` call; the graph itself is never
//! touched. User keys starting with `@` are escaped with one more `@`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Number};

use crate::error::GraphError;
use crate::GraphResult;

/// Surrogate id marker key
pub const ID_PROPERTY: &str = "@id";

/// Back-reference marker key
pub const REF_PROPERTY: &str = "@ref";

/// A node in a record value graph.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Sequences have no identity of their own and encode element-wise.
    Array(Vec<Value>),
    Object(ObjectRef),
    /// Self-describing value emitted verbatim by `encode`. It must not use
    /// the `@id`/`@ref` keys; it decodes back as ordinary nodes.
    Raw(serde_json::Value),
}

/// Shared, mutable keyed structure. Clones share identity.
#[derive(Clone, Default)]
pub struct ObjectRef(Arc<RwLock<BTreeMap<String, Value>>>);

impl ObjectRef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an object from `(key, value)` pairs.
    pub fn from_fields<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let map = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self(Arc::new(RwLock::new(map)))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Whether both handles point at the same object.
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Snapshot of the fields; the lock is released before returning so
    /// callers may revisit this object while walking the snapshot.
    pub fn fields(&self) -> Vec<(String, Value)> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ObjectRef {
    // Fields are omitted: printing them would not terminate on cycles.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("keys", &self.keys())
            .finish()
    }
}

impl Value {
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Property lookup on objects; `None` for every other node.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.as_object().and_then(|obj| obj.get(key))
    }

    /// Structural equality that terminates on cycles: a pair of objects
    /// already under comparison is assumed equal.
    pub fn structural_eq(&self, other: &Value) -> bool {
        let mut assumed = HashSet::new();
        structural_eq_inner(self, other, &mut assumed)
    }
}

fn structural_eq_inner(a: &Value, b: &Value, assumed: &mut HashSet<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y || (x.is_nan() && y.is_nan()),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Raw(x), Value::Raw(y)) => x == y,
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys)
                    .all(|(x, y)| structural_eq_inner(x, y, assumed))
        }
        (Value::Object(x), Value::Object(y)) => {
            if x.ptr_eq(y) || !assumed.insert((x.addr(), y.addr())) {
                return true;
            }
            let xf = x.fields();
            let yf = y.fields();
            xf.len() == yf.len()
                && xf.iter().zip(&yf).all(|((kx, vx), (ky, vy))| {
                    kx == ky && structural_eq_inner(vx, vy, assumed)
                })
        }
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.structural_eq(other)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Value::Object(obj)
    }
}

impl From<serde_json::Value> for Value {
    /// Plain JSON becomes a fresh graph with no sharing.
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(ObjectRef::from_fields(
                map.into_iter().map(|(k, v)| (k, Value::from(v))),
            )),
        }
    }
}

/// Encode a graph into its tree form.
pub fn encode(value: &Value) -> serde_json::Value {
    Encoder::default().encode(value)
}

/// Rebuild a graph from its tree form, restoring shared identity.
pub fn decode(encoded: &serde_json::Value) -> GraphResult<Value> {
    Decoder::default().decode(encoded)
}

/// Encode and serialize to JSON text.
pub fn to_string(value: &Value) -> GraphResult<String> {
    Ok(serde_json::to_string(&encode(value))?)
}

/// Parse JSON text and decode it.
pub fn from_str(text: &str) -> GraphResult<Value> {
    let json: serde_json::Value = serde_json::from_str(text)?;
    decode(&json)
}

/// Deep copy that keeps the sharing topology of `value` inside the copy.
pub fn structured_clone(value: &Value) -> GraphResult<Value> {
    decode(&encode(value))
}

#[derive(Default)]
struct Encoder {
    ids: HashMap<usize, u64>,
    next_id: u64,
}

impl Encoder {
    fn encode(&mut self, value: &Value) -> serde_json::Value {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            // Non-finite numbers have no JSON form and serialize as null.
            Value::Number(n) => Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Raw(raw) => raw.clone(),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|item| self.encode(item)).collect())
            }
            Value::Object(obj) => self.encode_object(obj),
        }
    }

    fn encode_object(&mut self, obj: &ObjectRef) -> serde_json::Value {
        let addr = obj.addr();
        if let Some(id) = self.ids.get(&addr) {
            let mut marker = Map::new();
            marker.insert(REF_PROPERTY.to_string(), id.to_string().into());
            return serde_json::Value::Object(marker);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(addr, id);

        let mut out = Map::new();
        out.insert(ID_PROPERTY.to_string(), id.to_string().into());
        for (key, field) in obj.fields() {
            let encoded = self.encode(&field);
            out.insert(escape_key(&key), encoded);
        }
        serde_json::Value::Object(out)
    }
}

#[derive(Default)]
struct Decoder {
    found: HashMap<String, ObjectRef>,
}

impl Decoder {
    fn decode(&mut self, encoded: &serde_json::Value) -> GraphResult<Value> {
        Ok(match encoded {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.decode(item))
                    .collect::<GraphResult<_>>()?,
            ),
            serde_json::Value::Object(map) => self.decode_object(map)?,
        })
    }

    fn decode_object(&mut self, map: &Map<String, serde_json::Value>) -> GraphResult<Value> {
        if let Some(reference) = map.get(REF_PROPERTY) {
            let id = surrogate_id(reference)?;
            return self
                .found
                .get(&id)
                .cloned()
                .map(Value::Object)
                .ok_or(GraphError::UnknownReference(id));
        }

        // Registered before its fields so descendants can refer back to it.
        let obj = ObjectRef::new();
        if let Some(id) = map.get(ID_PROPERTY) {
            self.found.insert(surrogate_id(id)?, obj.clone());
        }
        for (key, field) in map {
            if key == ID_PROPERTY {
                continue;
            }
            let decoded = self.decode(field)?;
            obj.set(unescape_key(key), decoded);
        }
        Ok(Value::Object(obj))
    }
}

fn surrogate_id(marker: &serde_json::Value) -> GraphResult<String> {
    match marker {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(GraphError::InvalidSurrogateId(other.to_string())),
    }
}

fn escape_key(key: &str) -> String {
    if key.starts_with('@') {
        format!("@{key}")
    } else {
        key.to_string()
    }
}

fn unescape_key(key: &str) -> String {
    match key.strip_prefix('@') {
        Some(rest) if rest.starts_with('@') => rest.to_string(),
        _ => key.to_string(),
    }
}
