use std::collections::BTreeMap;

use tracing::trace;

use crate::document::{Document, ID_FIELD};
use crate::error::{Error, Result};
use crate::expression::Expression;
use crate::projection::Projection;
use crate::query::{self, Filter, QueryOp, SortOrder};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Accumulators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Accumulator {
    Sum(Expression),
    Avg(Expression),
    Min(Expression),
    Max(Expression),
    Count,
    First(Expression),
    Last(Expression),
    Push(Expression),
    AddToSet(Expression),
}

/// Running state of one accumulator within one group. Each variant borrows
/// the expression it folds over.
enum AccumulatorState<'a> {
    Sum { expr: &'a Expression, total: Value },
    Avg { expr: &'a Expression, sum: f64, count: u64 },
    Min { expr: &'a Expression, current: Option<Value> },
    Max { expr: &'a Expression, current: Option<Value> },
    Count(i64),
    First { expr: &'a Expression, current: Option<Value> },
    Last { expr: &'a Expression, current: Value },
    Push { expr: &'a Expression, items: Vec<Value> },
    AddToSet { expr: &'a Expression, items: Vec<Value> },
}

impl Accumulator {
    fn start(&self) -> AccumulatorState<'_> {
        match self {
            Accumulator::Sum(expr) => AccumulatorState::Sum {
                expr,
                total: Value::Integer(0),
            },
            Accumulator::Avg(expr) => AccumulatorState::Avg {
                expr,
                sum: 0.0,
                count: 0,
            },
            Accumulator::Min(expr) => AccumulatorState::Min { expr, current: None },
            Accumulator::Max(expr) => AccumulatorState::Max { expr, current: None },
            Accumulator::Count => AccumulatorState::Count(0),
            Accumulator::First(expr) => AccumulatorState::First { expr, current: None },
            Accumulator::Last(expr) => AccumulatorState::Last {
                expr,
                current: Value::Null,
            },
            Accumulator::Push(expr) => AccumulatorState::Push {
                expr,
                items: Vec::new(),
            },
            Accumulator::AddToSet(expr) => AccumulatorState::AddToSet {
                expr,
                items: Vec::new(),
            },
        }
    }
}

impl AccumulatorState<'_> {
    fn accumulate(&mut self, doc: &Document) -> Result<()> {
        match self {
            AccumulatorState::Sum { expr, total } => {
                // Non-numeric results contribute nothing.
                let v = expr.eval(doc)?;
                if v.is_numeric() {
                    *total = total.add(&v)?;
                }
            }
            AccumulatorState::Avg { expr, sum, count } => {
                if let Some(n) = expr.eval(doc)?.as_f64() {
                    *sum += n;
                    *count += 1;
                }
            }
            AccumulatorState::Min { expr, current } => {
                if let Some(v) = expr.eval_present(doc)?.filter(|v| !v.is_null()) {
                    if current.as_ref().is_none_or(|cur| v < *cur) {
                        *current = Some(v);
                    }
                }
            }
            AccumulatorState::Max { expr, current } => {
                if let Some(v) = expr.eval_present(doc)?.filter(|v| !v.is_null()) {
                    if current.as_ref().is_none_or(|cur| v > *cur) {
                        *current = Some(v);
                    }
                }
            }
            AccumulatorState::Count(c) => *c += 1,
            AccumulatorState::First { expr, current } => {
                if current.is_none() {
                    *current = Some(expr.eval(doc)?);
                }
            }
            AccumulatorState::Last { expr, current } => {
                *current = expr.eval(doc)?;
            }
            AccumulatorState::Push { expr, items } => {
                if let Some(v) = expr.eval_present(doc)? {
                    items.push(v);
                }
            }
            AccumulatorState::AddToSet { expr, items } => {
                if let Some(v) = expr.eval_present(doc)? {
                    if !items.contains(&v) {
                        items.push(v);
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Value {
        match self {
            AccumulatorState::Sum { total, .. } => total,
            AccumulatorState::Avg { sum, count, .. } => {
                if count == 0 {
                    Value::Float(0.0)
                } else {
                    Value::Float(sum / count as f64)
                }
            }
            AccumulatorState::Min { current, .. }
            | AccumulatorState::Max { current, .. }
            | AccumulatorState::First { current, .. } => current.unwrap_or(Value::Null),
            AccumulatorState::Count(c) => Value::Integer(c),
            AccumulatorState::Last { current, .. } => current,
            AccumulatorState::Push { items, .. } | AccumulatorState::AddToSet { items, .. } => {
                Value::Array(items)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Stage {
    Match(Filter),
    Group {
        key: Expression,
        accumulators: Vec<(String, Accumulator)>,
    },
    Sort(Vec<(String, SortOrder)>),
    Skip(usize),
    Limit(usize),
    Project {
        projection: Projection,
        computed: Vec<(String, Expression)>,
    },
    Count(String),
    Unwind {
        path: String,
        preserve_null_and_empty: bool,
        include_array_index: Option<String>,
    },
    AddFields(Vec<(String, Expression)>),
    Lookup {
        from: String,
        local_field: String,
        foreign_field: String,
        as_field: String,
    },
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Group { .. } => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Skip(_) => "$skip",
            Stage::Limit(_) => "$limit",
            Stage::Project { .. } => "$project",
            Stage::Count(_) => "$count",
            Stage::Unwind { .. } => "$unwind",
            Stage::AddFields(_) => "$addFields",
            Stage::Lookup { .. } => "$lookup",
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A parsed aggregation pipeline. Stages run strictly left to right, each
/// consuming the previous stage's output.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

// ---------------------------------------------------------------------------
// Stage parsing helpers
// ---------------------------------------------------------------------------

fn parse_accumulator(name: &str, val: &Value) -> Result<Accumulator> {
    let spec = val.as_document().filter(|d| d.len() == 1).ok_or_else(|| {
        Error::InvalidPipeline(format!(
            "accumulator '{name}' must be an object with exactly one operator"
        ))
    })?;
    let Some((op, arg)) = spec.iter().next() else {
        return Err(Error::InvalidPipeline(format!("accumulator '{name}' is empty")));
    };
    let expr = || Expression::parse(arg);
    match op.as_str() {
        "$sum" => Ok(Accumulator::Sum(expr()?)),
        "$avg" => Ok(Accumulator::Avg(expr()?)),
        "$min" => Ok(Accumulator::Min(expr()?)),
        "$max" => Ok(Accumulator::Max(expr()?)),
        "$first" => Ok(Accumulator::First(expr()?)),
        "$last" => Ok(Accumulator::Last(expr()?)),
        "$push" => Ok(Accumulator::Push(expr()?)),
        "$addToSet" => Ok(Accumulator::AddToSet(expr()?)),
        "$count" => match arg {
            Value::Document(d) if d.is_empty() => Ok(Accumulator::Count),
            _ => Err(Error::InvalidPipeline("$count accumulator takes {}".into())),
        },
        other => Err(Error::InvalidPipeline(format!("unknown accumulator: {other}"))),
    }
}

fn parse_group_stage(body: &Value) -> Result<Stage> {
    let spec = body
        .as_document()
        .ok_or_else(|| Error::InvalidPipeline("$group must be an object".into()))?;
    let id_val = spec
        .get(ID_FIELD)
        .ok_or_else(|| Error::InvalidPipeline("$group requires an '_id' field".into()))?;
    let key = Expression::parse(id_val)?;

    let mut accumulators = Vec::new();
    for (name, acc) in spec {
        if name == ID_FIELD {
            continue;
        }
        validate_output_field(name)?;
        accumulators.push((name.clone(), parse_accumulator(name, acc)?));
    }
    Ok(Stage::Group { key, accumulators })
}

fn parse_sort(body: &Value) -> Result<Vec<(String, SortOrder)>> {
    let spec = body
        .as_document()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| Error::InvalidPipeline("$sort must be a non-empty object".into()))?;
    query::parse_sort(spec).map_err(|e| Error::InvalidPipeline(format!("$sort: {e}")))
}

fn parse_count(body: &Value, stage: &str) -> Result<usize> {
    body.as_i64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| Error::InvalidPipeline(format!("{stage} must be a non-negative integer")))
}

/// `$project` entries are either projection flags (`1`, `0`, `{$slice}`) or
/// computed expressions. Computed fields count as inclusions.
fn parse_project(body: &Value) -> Result<Stage> {
    let spec = body
        .as_document()
        .ok_or_else(|| Error::InvalidPipeline("$project must be an object".into()))?;
    if spec.is_empty() {
        return Err(Error::InvalidPipeline("$project requires at least one field".into()));
    }
    let mut flags = Document::with_capacity(spec.len());
    let mut computed = Vec::new();
    for (field, value) in spec {
        let is_flag = match value {
            Value::Boolean(_) | Value::Integer(_) | Value::Float(_) => true,
            Value::Document(d) => d.len() == 1 && d.contains_key("$slice"),
            _ => false,
        };
        if is_flag {
            flags.insert(field.clone(), value.clone());
        } else {
            validate_output_field(field)?;
            computed.push((field.clone(), Expression::parse(value)?));
            flags.insert(field.clone(), Value::Integer(1));
        }
    }
    Ok(Stage::Project {
        projection: Projection::parse(&flags)?,
        computed,
    })
}

fn parse_add_fields(body: &Value, stage: &str) -> Result<Vec<(String, Expression)>> {
    let spec = body
        .as_document()
        .ok_or_else(|| Error::InvalidPipeline(format!("{stage} must be an object")))?;
    spec.iter()
        .map(|(field, value)| {
            validate_output_field(field)?;
            Ok((field.clone(), Expression::parse(value)?))
        })
        .collect()
}

fn field_path_operand(value: &Value, what: &str) -> Result<String> {
    value
        .as_str()
        .and_then(|s| s.strip_prefix('$'))
        .filter(|path| !path.is_empty() && !path.starts_with('$'))
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidPipeline(format!("{what} must be a '$field' path")))
}

fn parse_unwind(body: &Value) -> Result<Stage> {
    match body {
        Value::String(_) => Ok(Stage::Unwind {
            path: field_path_operand(body, "$unwind")?,
            preserve_null_and_empty: false,
            include_array_index: None,
        }),
        Value::Document(spec) => {
            let path = spec
                .get("path")
                .ok_or_else(|| Error::InvalidPipeline("$unwind requires 'path'".into()))?;
            let preserve_null_and_empty = match spec.get("preserveNullAndEmptyArrays") {
                None => false,
                Some(Value::Boolean(b)) => *b,
                Some(_) => {
                    return Err(Error::InvalidPipeline(
                        "preserveNullAndEmptyArrays must be a boolean".into(),
                    ));
                }
            };
            let include_array_index = match spec.get("includeArrayIndex") {
                None => None,
                Some(Value::String(name)) if !name.is_empty() && !name.starts_with('$') => {
                    Some(name.clone())
                }
                Some(_) => {
                    return Err(Error::InvalidPipeline(
                        "includeArrayIndex must be a field name".into(),
                    ));
                }
            };
            if let Some(extra) = spec
                .keys()
                .find(|k| !matches!(k.as_str(), "path" | "preserveNullAndEmptyArrays" | "includeArrayIndex"))
            {
                return Err(Error::InvalidPipeline(format!(
                    "unrecognized option to $unwind: {extra}"
                )));
            }
            Ok(Stage::Unwind {
                path: field_path_operand(path, "$unwind path")?,
                preserve_null_and_empty,
                include_array_index,
            })
        }
        _ => Err(Error::InvalidPipeline("$unwind must be a string or object".into())),
    }
}

fn parse_lookup(body: &Value) -> Result<Stage> {
    let spec = body
        .as_document()
        .ok_or_else(|| Error::InvalidPipeline("$lookup must be an object".into()))?;
    let field = |name: &str| -> Result<String> {
        spec.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidPipeline(format!("$lookup requires '{name}' string")))
    };
    Ok(Stage::Lookup {
        from: field("from")?,
        local_field: field("localField")?,
        foreign_field: field("foreignField")?,
        as_field: field("as")?,
    })
}

fn validate_output_field(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('$') || name.split('.').any(str::is_empty) {
        return Err(Error::InvalidPipeline(format!("invalid output field name '{name}'")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stage execution
// ---------------------------------------------------------------------------

fn exec_match(docs: Vec<Document>, filter: &Filter) -> Vec<Document> {
    docs.into_iter().filter(|doc| filter.matches(doc)).collect()
}

fn exec_group(
    docs: Vec<Document>,
    key: &Expression,
    accumulators: &[(String, Accumulator)],
) -> Result<Vec<Document>> {
    // Groups in order of first appearance, plus a key index into them.
    let mut groups: Vec<(Value, Vec<AccumulatorState<'_>>)> = Vec::new();
    let mut index: BTreeMap<Value, usize> = BTreeMap::new();

    for doc in &docs {
        let key_val = key.eval(doc)?;
        let slot = match index.get(&key_val) {
            Some(&slot) => slot,
            None => {
                let states = accumulators.iter().map(|(_, acc)| acc.start()).collect();
                groups.push((key_val.clone(), states));
                index.insert(key_val, groups.len() - 1);
                groups.len() - 1
            }
        };
        for state in &mut groups[slot].1 {
            state.accumulate(doc)?;
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key_val, states)| {
            let mut out = Document::with_capacity(accumulators.len() + 1);
            out.insert(ID_FIELD, key_val);
            for ((name, _), state) in accumulators.iter().zip(states) {
                out.insert(name.clone(), state.finish());
            }
            out
        })
        .collect())
}

/// Stable: documents with equal keys keep their input order.
fn exec_sort(mut docs: Vec<Document>, sort_fields: &[(String, SortOrder)]) -> Vec<Document> {
    docs.sort_by(|a, b| query::compare_documents(a, b, sort_fields));
    docs
}

fn exec_project(
    docs: Vec<Document>,
    projection: &Projection,
    computed: &[(String, Expression)],
) -> Result<Vec<Document>> {
    docs.iter()
        .map(|doc| {
            let mut out = projection.apply(doc);
            for (field, expr) in computed {
                match expr.eval_present(doc)? {
                    Some(v) => out.set_path(field, v)?,
                    None => {
                        out.remove_path(field);
                    }
                }
            }
            Ok(out)
        })
        .collect()
}

fn exec_count(docs: Vec<Document>, field_name: &str) -> Vec<Document> {
    if docs.is_empty() {
        return Vec::new();
    }
    let mut out = Document::new();
    out.insert(field_name, i64::try_from(docs.len()).unwrap_or(i64::MAX));
    vec![out]
}

fn exec_unwind(
    docs: Vec<Document>,
    path: &str,
    preserve_null_and_empty: bool,
    include_array_index: Option<&str>,
) -> Result<Vec<Document>> {
    let mut result = Vec::with_capacity(docs.len());
    for mut doc in docs {
        match doc.get_path(path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for (i, item) in items.into_iter().enumerate() {
                    let mut unwound = doc.clone();
                    unwound.set_path(path, item)?;
                    if let Some(index_field) = include_array_index {
                        unwound.set_path(index_field, Value::Integer(i64::try_from(i).unwrap_or(i64::MAX)))?;
                    }
                    result.push(unwound);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve_null_and_empty {
                    if matches!(doc.get_path(path), Some(Value::Array(_))) {
                        doc.remove_path(path);
                    }
                    if let Some(index_field) = include_array_index {
                        doc.set_path(index_field, Value::Null)?;
                    }
                    result.push(doc);
                }
            }
            Some(_) => {
                // A non-array value unwinds to itself.
                if let Some(index_field) = include_array_index {
                    doc.set_path(index_field, Value::Null)?;
                }
                result.push(doc);
            }
        }
    }
    Ok(result)
}

fn exec_add_fields(docs: Vec<Document>, fields: &[(String, Expression)]) -> Result<Vec<Document>> {
    docs.into_iter()
        .map(|doc| {
            let mut out = doc.clone();
            for (name, expr) in fields {
                out.set_path(name, expr.eval(&doc)?)?;
            }
            Ok(out)
        })
        .collect()
}

fn exec_lookup<F>(
    docs: Vec<Document>,
    from: &str,
    local_field: &str,
    foreign_field: &str,
    as_field: &str,
    lookup_fn: &F,
) -> Result<Vec<Document>>
where
    F: Fn(&str, &Filter) -> Result<Vec<Document>>,
{
    let mut result = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let local_val = doc.get_path(local_field).cloned().unwrap_or(Value::Null);
        let op = match local_val {
            Value::Array(items) => QueryOp::In(items),
            other => QueryOp::Eq(other),
        };
        let filter = Filter::Field {
            field: foreign_field.to_string(),
            op,
        };
        let foreign_docs = lookup_fn(from, &filter)?;
        doc.set_path(
            as_field,
            Value::Array(foreign_docs.into_iter().map(Value::Document).collect()),
        )?;
        result.push(doc);
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Pipeline parsing & execution
// ---------------------------------------------------------------------------

impl Pipeline {
    pub fn parse(stages: &[Document]) -> Result<Self> {
        let mut parsed = Vec::with_capacity(stages.len());
        for (i, stage_doc) in stages.iter().enumerate() {
            if stage_doc.len() != 1 {
                return Err(Error::InvalidPipeline(format!(
                    "stage {i} must have exactly one key"
                )));
            }
            let Some((stage_name, body)) = stage_doc.iter().next() else {
                return Err(Error::InvalidPipeline(format!("stage {i} is empty")));
            };

            let stage = match stage_name.as_str() {
                "$match" => {
                    let filter = body
                        .as_document()
                        .ok_or_else(|| Error::InvalidPipeline("$match must be an object".into()))?;
                    Stage::Match(Filter::parse(filter)?)
                }
                "$group" => parse_group_stage(body)?,
                "$sort" => Stage::Sort(parse_sort(body)?),
                "$skip" => Stage::Skip(parse_count(body, "$skip")?),
                "$limit" => Stage::Limit(parse_count(body, "$limit")?),
                "$project" => parse_project(body)?,
                "$count" => {
                    let field = body.as_str().ok_or_else(|| {
                        Error::InvalidPipeline("$count must be a string".into())
                    })?;
                    if field.contains('.') {
                        return Err(Error::InvalidPipeline(
                            "$count field name must not contain '.'".into(),
                        ));
                    }
                    validate_output_field(field)?;
                    Stage::Count(field.to_string())
                }
                "$unwind" => parse_unwind(body)?,
                "$addFields" | "$set" => Stage::AddFields(parse_add_fields(body, stage_name)?),
                "$lookup" => parse_lookup(body)?,
                other => {
                    return Err(Error::InvalidPipeline(format!(
                        "stage {i}: unknown stage {other}"
                    )));
                }
            };
            parsed.push(stage);
        }

        Ok(Pipeline { stages: parsed })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The filter of a leading `$match` stage. A caller can apply it while
    /// scanning the source and then start execution at stage 1.
    pub fn leading_match(&self) -> Option<&Filter> {
        match self.stages.first() {
            Some(Stage::Match(filter)) => Some(filter),
            _ => None,
        }
    }

    pub fn execute<F>(&self, docs: Vec<Document>, lookup_fn: &F) -> Result<Vec<Document>>
    where
        F: Fn(&str, &Filter) -> Result<Vec<Document>>,
    {
        self.execute_from(0, docs, lookup_fn)
    }

    /// Execute pipeline stages starting from `start` index. A failing stage
    /// aborts the run with an [`Error::Aggregation`] carrying its index.
    pub fn execute_from<F>(
        &self,
        start: usize,
        docs: Vec<Document>,
        lookup_fn: &F,
    ) -> Result<Vec<Document>>
    where
        F: Fn(&str, &Filter) -> Result<Vec<Document>>,
    {
        let mut current = docs;
        for (i, stage) in self.stages.iter().enumerate().skip(start) {
            let input = current.len();
            current = Self::run_stage(stage, current, lookup_fn).map_err(|e| Error::Aggregation {
                stage: i,
                name: stage.name().to_string(),
                source: Box::new(e),
            })?;
            trace!(
                target: "memdoc::pipeline",
                stage = i,
                stage_name = stage.name(),
                input,
                output = current.len(),
                "stage executed"
            );
        }
        Ok(current)
    }

    fn run_stage<F>(stage: &Stage, docs: Vec<Document>, lookup_fn: &F) -> Result<Vec<Document>>
    where
        F: Fn(&str, &Filter) -> Result<Vec<Document>>,
    {
        Ok(match stage {
            Stage::Match(filter) => exec_match(docs, filter),
            Stage::Group { key, accumulators } => exec_group(docs, key, accumulators)?,
            Stage::Sort(fields) => exec_sort(docs, fields),
            Stage::Skip(n) => docs.into_iter().skip(*n).collect(),
            Stage::Limit(n) => docs.into_iter().take(*n).collect(),
            Stage::Project {
                projection,
                computed,
            } => exec_project(docs, projection, computed)?,
            Stage::Count(field) => exec_count(docs, field),
            Stage::Unwind {
                path,
                preserve_null_and_empty,
                include_array_index,
            } => exec_unwind(
                docs,
                path,
                *preserve_null_and_empty,
                include_array_index.as_deref(),
            )?,
            Stage::AddFields(fields) => exec_add_fields(docs, fields)?,
            Stage::Lookup {
                from,
                local_field,
                foreign_field,
                as_field,
            } => exec_lookup(docs, from, local_field, foreign_field, as_field, lookup_fn)?,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
