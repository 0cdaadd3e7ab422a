use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};

use crate::document::Document;
use crate::error::{Error, Result};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Find options: sort / skip / limit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

/// Compare two documents by a list of sort keys. Missing fields sort as null.
pub fn compare_documents(a: &Document, b: &Document, keys: &[(String, SortOrder)]) -> Ordering {
    for (field, order) in keys {
        let av = a.get_path(field).unwrap_or(&Value::Null);
        let bv = b.get_path(field).unwrap_or(&Value::Null);
        let ordering = order.apply(av.cmp(bv));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub projection: Option<Document>,
    pub sort: Option<Vec<(String, SortOrder)>>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

/// Parse a sort specification: an object of field → 1 / -1.
pub fn parse_sort(spec: &Document) -> Result<Vec<(String, SortOrder)>> {
    let mut fields = Vec::with_capacity(spec.len());
    for (field, dir) in spec {
        let order = match dir.as_i64() {
            Some(1) => SortOrder::Asc,
            Some(-1) => SortOrder::Desc,
            _ => {
                return Err(Error::InvalidFilter(format!(
                    "sort direction for '{field}' must be 1 (asc) or -1 (desc)"
                )));
            }
        };
        fields.push((field.clone(), order));
    }
    Ok(fields)
}

/// Parse find options from a request object with optional `projection`,
/// `sort`, `skip` and `limit` fields.
pub fn parse_find_options(request: &Document) -> Result<FindOptions> {
    let mut opts = FindOptions::default();

    if let Some(projection) = request.get("projection") {
        let spec = projection
            .as_document()
            .ok_or_else(|| Error::InvalidProjection("projection must be an object".into()))?;
        opts.projection = Some(spec.clone());
    }

    if let Some(sort_val) = request.get("sort") {
        let spec = sort_val
            .as_document()
            .ok_or_else(|| Error::InvalidFilter("sort must be an object".into()))?;
        let fields = parse_sort(spec)?;
        if !fields.is_empty() {
            opts.sort = Some(fields);
        }
    }

    if let Some(skip_val) = request.get("skip") {
        opts.skip = Some(non_negative(skip_val, "skip")?);
    }

    if let Some(limit_val) = request.get("limit") {
        opts.limit = Some(non_negative(limit_val, "limit")?);
    }

    Ok(opts)
}

fn non_negative(value: &Value, name: &str) -> Result<u64> {
    value
        .as_i64()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| Error::InvalidFilter(format!("{name} must be a non-negative integer")))
}

// ---------------------------------------------------------------------------
// Filter AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum QueryOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    All(Vec<Value>),
    Exists(bool),
    Size(usize),
    Regex(Regex),
    ElemMatch(ElemMatch),
}

#[derive(Debug, Clone)]
pub enum ElemMatch {
    /// `{$elemMatch: {qty: {$gt: 1}}}`: elements are documents matched by a filter.
    Document(Box<Filter>),
    /// `{$elemMatch: {$gte: 80, $lt: 85}}`: operators applied to each element.
    Operators(Vec<QueryOp>),
}

#[derive(Debug, Clone)]
pub enum Filter {
    Field { field: String, op: QueryOp },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    All, // match everything
}

// ---------------------------------------------------------------------------
// Parsing: Document → Filter AST
// ---------------------------------------------------------------------------

impl Filter {
    pub fn parse(query: &Document) -> Result<Filter> {
        if query.is_empty() {
            return Ok(Filter::All);
        }

        let mut conditions: Vec<Filter> = Vec::new();

        for (key, value) in query {
            match key.as_str() {
                "$and" => conditions.push(Filter::And(parse_clauses("$and", value)?)),
                "$or" => conditions.push(Filter::Or(parse_clauses("$or", value)?)),
                "$nor" => conditions.push(Filter::Nor(parse_clauses("$nor", value)?)),
                op if op.starts_with('$') => {
                    return Err(Error::InvalidFilter(format!(
                        "unknown top-level operator: {op}"
                    )));
                }
                field => match value {
                    Value::Document(ops) if is_operator_document(ops) => {
                        for op in parse_ops(ops)? {
                            conditions.push(Filter::Field {
                                field: field.to_string(),
                                op,
                            });
                        }
                    }
                    // Shorthand for $eq, including plain embedded documents
                    _ => conditions.push(Filter::Field {
                        field: field.to_string(),
                        op: QueryOp::Eq(value.clone()),
                    }),
                },
            }
        }

        Ok(match conditions.len() {
            0 => Filter::All,
            1 => conditions.remove(0),
            _ => Filter::And(conditions),
        })
    }

    /// Filter matching a single `_id` value.
    pub fn by_id(id: Value) -> Filter {
        Filter::Field {
            field: crate::document::ID_FIELD.to_string(),
            op: QueryOp::Eq(id),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Field { field, op } => {
                let candidates = lookup_path(doc, field);
                op.matches_candidates(&candidates)
            }
            Filter::And(subs) => subs.iter().all(|s| s.matches(doc)),
            Filter::Or(subs) => subs.iter().any(|s| s.matches(doc)),
            Filter::Nor(subs) => !subs.iter().any(|s| s.matches(doc)),
        }
    }
}

fn parse_clauses(name: &str, value: &Value) -> Result<Vec<Filter>> {
    let arr = value
        .as_array()
        .ok_or_else(|| Error::InvalidFilter(format!("{name} must be an array")))?;
    if arr.is_empty() {
        return Err(Error::InvalidFilter(format!("{name} must be a non-empty array")));
    }
    arr.iter()
        .map(|clause| match clause {
            Value::Document(doc) => Filter::parse(doc),
            _ => Err(Error::InvalidFilter(format!(
                "each {name} clause must be an object"
            ))),
        })
        .collect()
}

/// An operator document has `$`-prefixed keys only. Mixing operators with
/// plain fields is rejected by [`parse_ops`].
pub(crate) fn is_operator_document(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}

pub(crate) fn parse_ops(ops: &Document) -> Result<Vec<QueryOp>> {
    let mut parsed = Vec::with_capacity(ops.len());
    let options = match ops.get("$options") {
        Some(Value::String(flags)) => Some(flags.as_str()),
        Some(_) => return Err(Error::InvalidFilter("$options must be a string".into())),
        None => None,
    };
    for (op_key, op_val) in ops {
        if op_key == "$options" {
            if !ops.contains_key("$regex") {
                return Err(Error::InvalidFilter("$options requires $regex".into()));
            }
            continue;
        }
        parsed.push(parse_op(op_key, op_val, options)?);
    }
    Ok(parsed)
}

fn parse_op(op_key: &str, op_val: &Value, options: Option<&str>) -> Result<QueryOp> {
    match op_key {
        "$eq" => Ok(QueryOp::Eq(op_val.clone())),
        "$ne" => Ok(QueryOp::Ne(op_val.clone())),
        "$gt" => Ok(QueryOp::Gt(op_val.clone())),
        "$gte" => Ok(QueryOp::Gte(op_val.clone())),
        "$lt" => Ok(QueryOp::Lt(op_val.clone())),
        "$lte" => Ok(QueryOp::Lte(op_val.clone())),
        "$in" => Ok(QueryOp::In(operand_list(op_key, op_val)?)),
        "$nin" => Ok(QueryOp::Nin(operand_list(op_key, op_val)?)),
        "$all" => {
            let mut values = operand_list(op_key, op_val)?;
            values.sort();
            values.dedup();
            Ok(QueryOp::All(values))
        }
        "$exists" => {
            let b = op_val
                .as_bool()
                .or_else(|| op_val.as_f64().map(|n| n != 0.0))
                .ok_or_else(|| Error::InvalidFilter("$exists must be a boolean".into()))?;
            Ok(QueryOp::Exists(b))
        }
        "$size" => {
            let n = op_val
                .as_i64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| {
                    Error::InvalidFilter("$size must be a non-negative integer".into())
                })?;
            Ok(QueryOp::Size(n))
        }
        "$regex" => {
            let pattern = op_val
                .as_str()
                .ok_or_else(|| Error::InvalidFilter("$regex must be a string".into()))?;
            Ok(QueryOp::Regex(build_regex(pattern, options.unwrap_or(""))?))
        }
        "$elemMatch" => {
            let body = op_val
                .as_document()
                .ok_or_else(|| Error::InvalidFilter("$elemMatch must be an object".into()))?;
            if is_operator_document(body) {
                Ok(QueryOp::ElemMatch(ElemMatch::Operators(parse_ops(body)?)))
            } else {
                Ok(QueryOp::ElemMatch(ElemMatch::Document(Box::new(
                    Filter::parse(body)?,
                ))))
            }
        }
        other if other.starts_with('$') => {
            Err(Error::InvalidFilter(format!("unknown operator: {other}")))
        }
        other => Err(Error::InvalidFilter(format!(
            "cannot mix operators and field '{other}' in one condition"
        ))),
    }
}

fn operand_list(op_key: &str, op_val: &Value) -> Result<Vec<Value>> {
    op_val
        .as_array()
        .cloned()
        .ok_or_else(|| Error::InvalidFilter(format!("{op_key} must be an array")))
}

fn build_regex(pattern: &str, flags: &str) -> Result<Regex> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => {
                return Err(Error::InvalidFilter(format!("unsupported regex option '{other}'")));
            }
        };
    }
    builder
        .build()
        .map_err(|e| Error::InvalidFilter(format!("invalid regex: {e}")))
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Resolve a dotted path to every value it reaches. Arrays of documents
/// are traversed element-wise, so "orders.qty" yields the qty of each order.
fn lookup_path<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((head, rest)) = parts.split_first() {
        if let Some(value) = doc.get(head) {
            collect_path(value, rest, &mut out);
        }
    }
    out
}

fn collect_path<'a>(value: &'a Value, parts: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = parts.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Document(doc) => {
            if let Some(next) = doc.get(head) {
                collect_path(next, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(idx) = head.parse::<usize>() {
                if let Some(next) = items.get(idx) {
                    collect_path(next, rest, out);
                }
            }
            for item in items {
                if matches!(item, Value::Document(_)) {
                    collect_path(item, parts, out);
                }
            }
        }
        _ => {}
    }
}

/// True when `candidate` equals `target`, or is an array with an element
/// equal to `target`.
fn equals_or_contains(candidate: &Value, target: &Value) -> bool {
    candidate == target
        || candidate
            .as_array()
            .is_some_and(|items| items.iter().any(|item| item == target))
}

fn compare_matches(candidate: &Value, target: &Value, accept: fn(Ordering) -> bool) -> bool {
    let direct = |v: &Value| v.is_comparable_with(target) && accept(v.cmp(target));
    direct(candidate)
        || candidate
            .as_array()
            .is_some_and(|items| items.iter().any(direct))
}

impl QueryOp {
    /// Evaluate against every value the field path resolved to. An empty
    /// slice means the field is missing.
    fn matches_candidates(&self, candidates: &[&Value]) -> bool {
        match self {
            QueryOp::Ne(v) => !candidates.iter().any(|c| equals_or_contains(c, v)),
            QueryOp::Nin(vals) => !candidates
                .iter()
                .any(|c| vals.iter().any(|v| equals_or_contains(c, v))),
            QueryOp::Exists(expected) => !candidates.is_empty() == *expected,
            _ => candidates.iter().any(|c| self.matches_value(c)),
        }
    }

    /// Evaluate against one present value, with implicit array-element matching.
    pub(crate) fn matches_value(&self, value: &Value) -> bool {
        match self {
            QueryOp::Eq(v) => equals_or_contains(value, v),
            QueryOp::Ne(v) => !equals_or_contains(value, v),
            QueryOp::Gt(v) => compare_matches(value, v, Ordering::is_gt),
            QueryOp::Gte(v) => compare_matches(value, v, Ordering::is_ge),
            QueryOp::Lt(v) => compare_matches(value, v, Ordering::is_lt),
            QueryOp::Lte(v) => compare_matches(value, v, Ordering::is_le),
            QueryOp::In(vals) => vals.iter().any(|v| equals_or_contains(value, v)),
            QueryOp::Nin(vals) => !vals.iter().any(|v| equals_or_contains(value, v)),
            QueryOp::All(vals) => match value {
                Value::Array(items) => {
                    !vals.is_empty() && vals.iter().all(|v| items.contains(v))
                }
                _ => false,
            },
            QueryOp::Exists(expected) => *expected,
            QueryOp::Size(n) => value.as_array().is_some_and(|items| items.len() == *n),
            QueryOp::Regex(re) => match value {
                Value::String(s) => re.is_match(s),
                Value::Array(items) => items
                    .iter()
                    .any(|item| item.as_str().is_some_and(|s| re.is_match(s))),
                _ => false,
            },
            QueryOp::ElemMatch(elem) => value.as_array().is_some_and(|items| {
                items.iter().any(|item| match elem {
                    ElemMatch::Document(filter) => {
                        item.as_document().is_some_and(|d| filter.matches(d))
                    }
                    ElemMatch::Operators(ops) => ops.iter().all(|op| op.matches_value(item)),
                })
            }),
        }
    }
}
