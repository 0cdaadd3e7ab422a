use crate::document::{Document, ID_FIELD};
use crate::error::{Error, Result};
use crate::value::Value;

/// A field projection such as `{"name": 1, "city": 1, "_id": 0}`.
///
/// Either every listed non-`_id` field is included or every one is excluded.
/// `{$slice: ...}` entries trim arrays in either mode; a projection made only
/// of slices keeps all other fields.
#[derive(Debug, Clone)]
pub struct Projection {
    inclusion: bool,
    include_id: bool,
    rules: Vec<(String, Rule)>,
}

#[derive(Debug, Clone)]
enum Rule {
    Include,
    Exclude,
    Slice { skip: i64, limit: Option<usize> },
}

impl Projection {
    pub fn parse(spec: &Document) -> Result<Projection> {
        let mut include_id = true;
        let mut rules = Vec::with_capacity(spec.len());
        let mut saw_include = false;
        let mut saw_exclude = false;
        let mut id_included_explicitly = false;

        for (path, flag) in spec {
            if path.is_empty() || path.starts_with('$') || path.split('.').any(str::is_empty) {
                return Err(Error::InvalidProjection(format!("invalid field path '{path}'")));
            }
            let rule = parse_rule(path, flag)?;
            if path == ID_FIELD {
                match rule {
                    Rule::Include => {
                        include_id = true;
                        id_included_explicitly = true;
                    }
                    Rule::Exclude => include_id = false,
                    Rule::Slice { .. } => rules.push((path.clone(), rule)),
                }
                continue;
            }
            match rule {
                Rule::Include => saw_include = true,
                Rule::Exclude => saw_exclude = true,
                Rule::Slice { .. } => {}
            }
            if let Some((other, _)) = rules.iter().find(|(p, _)| paths_collide(p, path)) {
                return Err(Error::InvalidProjection(format!(
                    "path collision between '{other}' and '{path}'"
                )));
            }
            rules.push((path.clone(), rule));
        }

        if saw_include && saw_exclude {
            return Err(Error::InvalidProjection(
                "cannot mix inclusion and exclusion of fields other than _id".into(),
            ));
        }

        Ok(Projection {
            inclusion: saw_include || (id_included_explicitly && !saw_exclude && rules.is_empty()),
            include_id,
            rules,
        })
    }

    pub fn is_inclusion(&self) -> bool {
        self.inclusion
    }

    /// Build the projected copy of `doc`, keeping the original field order.
    pub fn apply(&self, doc: &Document) -> Document {
        let rules: Vec<(&str, &Rule)> = self
            .rules
            .iter()
            .map(|(path, rule)| (path.as_str(), rule))
            .collect();

        let mut out = Document::with_capacity(doc.len());
        for (key, value) in doc {
            if key == ID_FIELD && !self.include_id {
                continue;
            }
            let projected = if key == ID_FIELD && rules_for(&rules, key).is_empty() {
                Some(value.clone())
            } else {
                project_field(key, value, &rules, self.inclusion)
            };
            if let Some(v) = projected {
                out.insert(key.clone(), v);
            }
        }
        out
    }
}

fn parse_rule(path: &str, flag: &Value) -> Result<Rule> {
    match flag {
        Value::Boolean(true) => Ok(Rule::Include),
        Value::Boolean(false) => Ok(Rule::Exclude),
        Value::Integer(0) => Ok(Rule::Exclude),
        Value::Integer(_) => Ok(Rule::Include),
        Value::Float(f) if *f == 0.0 => Ok(Rule::Exclude),
        Value::Float(_) => Ok(Rule::Include),
        Value::Document(op) if op.len() == 1 && op.contains_key("$slice") => {
            parse_slice(path, op.get("$slice").unwrap_or(&Value::Null))
        }
        other => Err(Error::InvalidProjection(format!(
            "unsupported projection value for '{path}': {other}"
        ))),
    }
}

fn parse_slice(path: &str, arg: &Value) -> Result<Rule> {
    let bad = || {
        Error::InvalidProjection(format!(
            "$slice for '{path}' must be an integer or [skip, limit]"
        ))
    };
    match arg {
        Value::Array(pair) if pair.len() == 2 => {
            let skip = pair[0].as_i64().ok_or_else(bad)?;
            let limit = pair[1]
                .as_i64()
                .filter(|n| *n > 0)
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(bad)?;
            Ok(Rule::Slice {
                skip,
                limit: Some(limit),
            })
        }
        other => {
            let n = other.as_i64().ok_or_else(bad)?;
            if n >= 0 {
                Ok(Rule::Slice {
                    skip: 0,
                    limit: Some(usize::try_from(n).map_err(|_| bad())?),
                })
            } else {
                Ok(Rule::Slice {
                    skip: n,
                    limit: None,
                })
            }
        }
    }
}

fn paths_collide(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    long == short || (long.starts_with(short) && long.as_bytes()[short.len()] == b'.')
}

/// Rules that concern `key`, with their paths made relative to it.
/// An exact match yields an empty relative path.
fn rules_for<'a>(rules: &[(&'a str, &'a Rule)], key: &str) -> Vec<(&'a str, &'a Rule)> {
    rules
        .iter()
        .filter_map(|(path, rule)| {
            if *path == key {
                Some(("", *rule))
            } else {
                path.strip_prefix(key)
                    .and_then(|rest| rest.strip_prefix('.'))
                    .map(|rest| (rest, *rule))
            }
        })
        .collect()
}

fn project_field(
    key: &str,
    value: &Value,
    rules: &[(&str, &Rule)],
    inclusion: bool,
) -> Option<Value> {
    let matching = rules_for(rules, key);
    if matching.is_empty() {
        return (!inclusion).then(|| value.clone());
    }
    if let Some((_, rule)) = matching.iter().find(|(rest, _)| rest.is_empty()) {
        return match rule {
            Rule::Include => Some(value.clone()),
            Rule::Exclude => None,
            Rule::Slice { skip, limit } => Some(slice(value, *skip, *limit)),
        };
    }
    match value {
        Value::Document(sub) => Some(Value::Document(project_document(sub, &matching, inclusion))),
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Document(sub) => {
                        Some(Value::Document(project_document(sub, &matching, inclusion)))
                    }
                    other => (!inclusion).then(|| other.clone()),
                })
                .collect(),
        )),
        other => (!inclusion).then(|| other.clone()),
    }
}

fn project_document(doc: &Document, rules: &[(&str, &Rule)], inclusion: bool) -> Document {
    let mut out = Document::new();
    for (key, value) in doc {
        if let Some(v) = project_field(key, value, rules, inclusion) {
            out.insert(key.clone(), v);
        }
    }
    out
}

fn slice(value: &Value, skip: i64, limit: Option<usize>) -> Value {
    let Value::Array(items) = value else {
        return value.clone();
    };
    let len = items.len();
    let start = if skip >= 0 {
        usize::try_from(skip).unwrap_or(usize::MAX).min(len)
    } else {
        len.saturating_sub(usize::try_from(skip.unsigned_abs()).unwrap_or(usize::MAX))
    };
    let end = match limit {
        Some(n) => start.saturating_add(n).min(len),
        None => len,
    };
    Value::Array(items[start..end].to_vec())
}
