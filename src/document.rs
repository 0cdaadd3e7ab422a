use std::cmp::Ordering;

use indexmap::IndexMap;
use indexmap::map::{IntoIter, Iter};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::value::Value;

/// Name of the reserved identifier field.
pub const ID_FIELD: &str = "_id";

/// An ordered mapping from field name to [`Value`].
///
/// Insertion order is kept for output; equality and ordering ignore it.
#[derive(Debug, Clone, Default)]
pub struct Document {
    fields: IndexMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: IndexMap::with_capacity(capacity),
        }
    }

    pub fn from_json(value: JsonValue) -> Result<Self> {
        match Value::from_json(value) {
            Value::Document(doc) => Ok(doc),
            _ => Err(Error::NotADocument),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let map: Map<String, JsonValue> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        JsonValue::Object(map)
    }

    pub fn id(&self) -> Option<&Value> {
        self.fields.get(ID_FIELD)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Insert or overwrite a field. Overwriting keeps the field's position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    /// Remove a field, keeping the relative order of the rest.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    pub fn iter(&self) -> Iter<'_, String, Value> {
        self.fields.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Access a nested field using dot notation: "user.address.city".
    /// Numeric segments index into arrays: "orders.0.item".
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Document(doc) => doc.fields.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set a field by dot path, creating intermediate documents as needed.
    ///
    /// Fails with `TypeMismatch` when an intermediate segment holds a scalar,
    /// or when an array is addressed with a non-numeric segment.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<()> {
        let parts: Vec<&str> = path.split('.').collect();
        let (last, parents) = match parts.split_last() {
            Some(split) => split,
            None => return Err(Error::InvalidUpdate("empty field path".into())),
        };
        if parents.is_empty() {
            self.fields.insert(last.to_string(), value);
            return Ok(());
        }
        let slot = self
            .fields
            .entry(parents[0].to_string())
            .or_insert_with(|| Value::Document(Document::new()));
        set_in_value(slot, &parents[1..], last, value, path)
    }

    /// Remove a field by dot path. Missing paths are a no-op.
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        let parts: Vec<&str> = path.split('.').collect();
        let (last, parents) = parts.split_last()?;
        if parents.is_empty() {
            return self.remove(last);
        }
        let mut current = self.fields.get_mut(parents[0])?;
        for part in &parents[1..] {
            current = match current {
                Value::Document(doc) => doc.fields.get_mut(*part)?,
                Value::Array(items) => items.get_mut(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        match current {
            Value::Document(doc) => doc.remove(last),
            Value::Array(items) => {
                // Removing an array element leaves a null hole, as the index
                // positions of the remaining elements must not shift.
                let slot = items.get_mut(last.parse::<usize>().ok()?)?;
                Some(std::mem::replace(slot, Value::Null))
            }
            _ => None,
        }
    }

    /// Strict comparison: same fields in the same order with identical values.
    pub fn identical(&self, other: &Document) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(other.fields.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va.identical(vb))
    }

    fn sorted_entries(&self) -> Vec<(&String, &Value)> {
        let mut entries: Vec<_> = self.fields.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

fn set_in_value(
    current: &mut Value,
    parents: &[&str],
    last: &str,
    value: Value,
    full_path: &str,
) -> Result<()> {
    let Some((head, rest)) = parents.split_first() else {
        return match current {
            Value::Document(doc) => {
                doc.fields.insert(last.to_string(), value);
                Ok(())
            }
            Value::Array(items) => {
                let idx = array_index(last, full_path)?;
                pad_to_index(items, idx, full_path)?;
                items[idx] = value;
                Ok(())
            }
            other => Err(cannot_traverse(other, last, full_path)),
        };
    };
    let next = match current {
        Value::Document(doc) => doc
            .fields
            .entry(head.to_string())
            .or_insert_with(|| Value::Document(Document::new())),
        Value::Array(items) => {
            let idx = array_index(head, full_path)?;
            pad_to_index(items, idx, full_path)?;
            let slot = &mut items[idx];
            if slot.is_null() {
                *slot = Value::Document(Document::new());
            }
            slot
        }
        other => return Err(cannot_traverse(other, head, full_path)),
    };
    set_in_value(next, rest, last, value, full_path)
}

/// How far past the end of an array a path may address; the gap is
/// filled with nulls.
const MAX_ARRAY_PADDING: usize = 1024;

fn pad_to_index(items: &mut Vec<Value>, idx: usize, full_path: &str) -> Result<()> {
    if idx < items.len() {
        return Ok(());
    }
    if idx - items.len() > MAX_ARRAY_PADDING {
        return Err(Error::TypeMismatch(format!(
            "index {idx} of '{full_path}' is more than {MAX_ARRAY_PADDING} past the end of a {}-element array",
            items.len()
        )));
    }
    items.resize(idx + 1, Value::Null);
    Ok(())
}

fn array_index(segment: &str, full_path: &str) -> Result<usize> {
    segment.parse::<usize>().map_err(|_| {
        Error::TypeMismatch(format!(
            "cannot use non-numeric segment '{segment}' of '{full_path}' to index an array"
        ))
    })
}

fn cannot_traverse(value: &Value, segment: &str, full_path: &str) -> Error {
    Error::TypeMismatch(format!(
        "cannot create field '{segment}' of '{full_path}' inside a {} value",
        value.type_name()
    ))
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Document {}

impl PartialOrd for Document {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Document {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sorted_entries().cmp(&other.sorted_entries())
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl TryFrom<JsonValue> for Document {
    type Error = Error;

    fn try_from(value: JsonValue) -> Result<Self> {
        Document::from_json(value)
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl Extend<(String, Value)> for Document {
    fn extend<I: IntoIterator<Item = (String, Value)>>(&mut self, iter: I) {
        self.fields.extend(iter);
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<'a> IntoIterator for &'a Document {
    type Item = (&'a String, &'a Value);
    type IntoIter = Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}
