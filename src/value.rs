use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::Value as JsonValue;

use crate::document::Document;
use crate::error::{Error, Result};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Parsed sequences at or above this never move the generator, which keeps
/// `fetch_add` far away from wrapping.
const MAX_ADOPTED_SEQUENCE: u64 = 1 << 63;

/// Unique document identifier.
///
/// Ordered by creation: the sequence number is compared first, so an id
/// generated later always sorts after one generated earlier in the same
/// process. Rendered as 24 hex digits (8 for the creation second, 16 for
/// the sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    sequence: u64,
    timestamp: u32,
}

impl ObjectId {
    pub fn new() -> Self {
        let sequence = NEXT_SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed);
        let timestamp = u32::try_from(Utc::now().timestamp()).unwrap_or(0);
        Self {
            sequence,
            timestamp,
        }
    }

    /// Parse the 24-hex-digit form produced by [`ObjectId::to_hex`].
    ///
    /// Parsed ids below 2^63 advance the generator so freshly generated ids
    /// never collide with ids seen from outside.
    pub fn parse_str(s: &str) -> Option<Self> {
        if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let timestamp = u32::from_str_radix(&s[..8], 16).ok()?;
        let sequence = u64::from_str_radix(&s[8..], 16).ok()?;
        if sequence < MAX_ADOPTED_SEQUENCE {
            NEXT_SEQUENCE.fetch_max(sequence + 1, AtomicOrdering::Relaxed);
        }
        Some(Self {
            sequence,
            timestamp,
        })
    }

    pub fn to_hex(&self) -> String {
        format!("{:08x}{:016x}", self.timestamp, self.sequence)
    }

    /// The wall-clock second this id was generated in.
    pub fn generation_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(i64::from(self.timestamp), 0).unwrap_or_default()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Any field value.
///
/// Total order across types: Null < Boolean < numbers < String < Array <
/// Document < Id. Integers and floats share one numeric rank and compare by
/// value, so `Integer(2) == Float(2.0)`.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Document(Document),
    Id(ObjectId),
}

impl Value {
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Document(_) => 5,
            Value::Id(_) => 6,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "bool",
            Value::Integer(_) => "int",
            Value::Float(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Document(_) => "object",
            Value::Id(_) => "objectId",
        }
    }

    /// True when both values sit in the same type bracket, i.e. `$gt`/`$lt`
    /// may compare them.
    pub fn is_comparable_with(&self, other: &Value) -> bool {
        self.type_rank() == other.type_rank()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// Expression truthiness: null, false and numeric zero are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            _ => true,
        }
    }

    /// Strict equality: same variants, same field order. Used to decide
    /// whether an update actually changed a document, where `1` and `1.0`
    /// must count as different.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.identical(y))
            }
            (Value::Document(a), Value::Document(b)) => a.identical(b),
            (Value::Id(a), Value::Id(b)) => a == b,
            _ => false,
        }
    }

    /// Position of `self` relative to `other` in the cross-type total order.
    pub fn compare(&self, other: &Value) -> Ordering {
        self.cmp(other)
    }

    // -- Numeric coercion -----------------------------------------------------

    pub fn add(&self, other: &Value) -> Result<Value> {
        self.arith(other, "add", i64::checked_add, |a, b| a + b)
    }

    pub fn subtract(&self, other: &Value) -> Result<Value> {
        self.arith(other, "subtract", i64::checked_sub, |a, b| a - b)
    }

    pub fn multiply(&self, other: &Value) -> Result<Value> {
        self.arith(other, "multiply", i64::checked_mul, |a, b| a * b)
    }

    /// Division always yields a float.
    pub fn divide(&self, other: &Value) -> Result<Value> {
        match (self.as_f64(), other.as_f64()) {
            (Some(_), Some(b)) if b == 0.0 => {
                Err(Error::TypeMismatch("cannot divide by zero".into()))
            }
            (Some(a), Some(b)) => Ok(Value::Float(a / b)),
            _ => Err(self.numeric_mismatch(other, "divide")),
        }
    }

    fn arith(
        &self,
        other: &Value,
        verb: &str,
        int_op: fn(i64, i64) -> Option<i64>,
        float_op: fn(f64, f64) -> f64,
    ) -> Result<Value> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Ok(match int_op(*a, *b) {
                Some(n) => Value::Integer(n),
                None => Value::Float(float_op(*a as f64, *b as f64)),
            }),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(float_op(a, b))),
                _ => Err(self.numeric_mismatch(other, verb)),
            },
        }
    }

    fn numeric_mismatch(&self, other: &Value, verb: &str) -> Error {
        Error::TypeMismatch(format!(
            "cannot {verb} {} and {}: both operands must be numeric",
            self.type_name(),
            other.type_name()
        ))
    }

    // -- JSON conversion ------------------------------------------------------

    /// Convert a JSON value. `{"$oid": "<24 hex>"}` becomes an [`ObjectId`].
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Boolean(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    n.as_f64().map(Value::Float).unwrap_or(Value::Null)
                }
            }
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            JsonValue::Object(map) => {
                if map.len() == 1 {
                    if let Some(JsonValue::String(hex)) = map.get("$oid") {
                        if let Some(id) = ObjectId::parse_str(hex) {
                            return Value::Id(id);
                        }
                    }
                }
                Value::Document(
                    map.into_iter()
                        .map(|(k, v)| (k, Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Relaxed extended JSON: ids render as `{"$oid": ...}`, non-finite
    /// floats as `null`.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Integer(i) => JsonValue::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Document(doc) => doc.to_json(),
            Value::Id(id) => serde_json::json!({ "$oid": id.to_hex() }),
        }
    }
}

/// Exact comparison; `i64` values beyond 2^53 are not rounded to `f64`.
fn compare_int_float(a: i64, b: f64) -> Ordering {
    // 2^63, the first float above i64::MAX
    const I64_END: f64 = 9_223_372_036_854_775_808.0;

    if b.is_nan() {
        return if b.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if b >= I64_END {
        return Ordering::Less;
    }
    if b < -I64_END {
        return Ordering::Greater;
    }
    let whole = b.trunc();
    match a.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0_f64.partial_cmp(&(b - whole)).unwrap_or(Ordering::Equal),
        ordering => ordering,
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Float(b)) => compare_int_float(*a, *b),
            (Float(a), Integer(b)) => compare_int_float(*b, *a).reverse(),
            (Float(a), Float(b)) => a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b)),
            (String(a), String(b)) => a.cmp(b),
            (Array(a), Array(b)) => a.iter().cmp(b.iter()),
            (Document(a), Document(b)) => a.cmp(b),
            (Id(a), Id(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Id(id) => write!(f, "ObjectId(\"{id}\")"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Document(doc) => doc.serialize(serializer),
            Value::Id(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("$oid", &id.to_hex())?;
                map.end()
            }
        }
    }
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        Value::from_json(value)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
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

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Document(doc)
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Id(id)
    }
}
