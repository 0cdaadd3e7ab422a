use chrono::{SecondsFormat, Utc};

use crate::document::{Document, ID_FIELD};
use crate::error::{Error, Result};
use crate::query::{QueryOp, is_operator_document, parse_ops};
use crate::value::Value;

/// A parsed update document such as `{"$set": {"a": 1}, "$inc": {"n": 2}}`.
///
/// Every operator reads the document as it was before the update, and no two
/// operators may touch overlapping paths, so the order of application does
/// not affect the result.
#[derive(Debug, Clone)]
pub struct UpdateSpec {
    updates: Vec<FieldUpdate>,
}

#[derive(Debug, Clone)]
struct FieldUpdate {
    path: String,
    action: Action,
}

#[derive(Debug, Clone)]
enum Action {
    Set(Value),
    Unset,
    Inc(Value),
    Mul(Value),
    Min(Value),
    Max(Value),
    Rename(String),
    CurrentDate,
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
    Pop(PopEnd),
    Pull(PullCondition),
}

#[derive(Debug, Clone, Copy)]
enum PopEnd {
    First,
    Last,
}

#[derive(Debug, Clone)]
enum PullCondition {
    Equals(Value),
    Matches(Vec<QueryOp>),
}

impl Action {
    fn operator(&self) -> &'static str {
        match self {
            Action::Set(_) => "$set",
            Action::Unset => "$unset",
            Action::Inc(_) => "$inc",
            Action::Mul(_) => "$mul",
            Action::Min(_) => "$min",
            Action::Max(_) => "$max",
            Action::Rename(_) => "$rename",
            Action::CurrentDate => "$currentDate",
            Action::Push(_) => "$push",
            Action::AddToSet(_) => "$addToSet",
            Action::Pop(_) => "$pop",
            Action::Pull(_) => "$pull",
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl UpdateSpec {
    pub fn parse(update: &Document) -> Result<UpdateSpec> {
        if update.is_empty() {
            return Err(Error::InvalidUpdate("update document must not be empty".into()));
        }

        let mut updates = Vec::new();
        for (op, fields) in update {
            if !op.starts_with('$') {
                return Err(Error::InvalidUpdate(format!(
                    "'{op}' is not an update operator; replacement documents are not supported"
                )));
            }
            let fields = fields
                .as_document()
                .ok_or_else(|| Error::InvalidUpdate(format!("{op} value must be an object")))?;
            for (path, operand) in fields {
                if path.is_empty() || path.split('.').any(str::is_empty) {
                    return Err(Error::InvalidUpdate(format!("invalid field path '{path}'")));
                }
                updates.push(FieldUpdate {
                    path: path.clone(),
                    action: parse_action(op, path, operand)?,
                });
            }
        }

        check_conflicts(&updates)?;
        Ok(UpdateSpec { updates })
    }

    /// Apply the update to `doc`. The document is only replaced when every
    /// operator succeeds. Returns whether the content actually changed.
    pub fn apply(&self, doc: &mut Document) -> Result<bool> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut updated = doc.clone();
        for update in &self.updates {
            update.apply(doc, &mut updated, &now)?;
        }

        let id_changed = match (doc.id(), updated.id()) {
            (Some(before), Some(after)) => !before.identical(after),
            (None, None) => false,
            _ => true,
        };
        if id_changed {
            return Err(Error::ImmutableField(ID_FIELD.to_string()));
        }

        if updated.identical(doc) {
            return Ok(false);
        }
        *doc = updated;
        Ok(true)
    }
}

fn parse_action(op: &str, path: &str, operand: &Value) -> Result<Action> {
    let action = match op {
        "$set" => Action::Set(operand.clone()),
        "$unset" => Action::Unset,
        "$inc" => Action::Inc(numeric_operand(op, path, operand)?),
        "$mul" => Action::Mul(numeric_operand(op, path, operand)?),
        "$min" => Action::Min(operand.clone()),
        "$max" => Action::Max(operand.clone()),
        "$rename" => {
            let target = operand.as_str().ok_or_else(|| {
                Error::InvalidUpdate(format!("$rename target for '{path}' must be a string"))
            })?;
            if target == path || target.is_empty() {
                return Err(Error::InvalidUpdate(format!(
                    "$rename target for '{path}' must be a different field"
                )));
            }
            Action::Rename(target.to_string())
        }
        "$currentDate" => match operand {
            Value::Boolean(true) => Action::CurrentDate,
            Value::Document(spec) if matches!(spec.get("$type").and_then(Value::as_str), Some("date" | "timestamp")) => {
                Action::CurrentDate
            }
            _ => {
                return Err(Error::InvalidUpdate(format!(
                    "$currentDate for '{path}' must be true or {{$type: \"date\"}}"
                )));
            }
        },
        "$push" => Action::Push(each_operand(op, operand)?),
        "$addToSet" => {
            let mut values: Vec<Value> = Vec::new();
            for value in each_operand(op, operand)? {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
            Action::AddToSet(values)
        }
        "$pop" => match operand.as_i64() {
            Some(1) => Action::Pop(PopEnd::Last),
            Some(-1) => Action::Pop(PopEnd::First),
            _ => {
                return Err(Error::InvalidUpdate(format!(
                    "$pop value for '{path}' must be 1 or -1"
                )));
            }
        },
        "$pull" => match operand {
            Value::Document(cond) if is_operator_document(cond) => {
                let ops = parse_ops(cond).map_err(|e| {
                    Error::InvalidUpdate(format!("$pull condition for '{path}': {e}"))
                })?;
                Action::Pull(PullCondition::Matches(ops))
            }
            other => Action::Pull(PullCondition::Equals(other.clone())),
        },
        _ => return Err(Error::InvalidUpdate(format!("unknown update operator: {op}"))),
    };
    Ok(action)
}

fn numeric_operand(op: &str, path: &str, operand: &Value) -> Result<Value> {
    if operand.is_numeric() {
        Ok(operand.clone())
    } else {
        Err(Error::InvalidUpdate(format!(
            "{op} value for '{path}' must be numeric, got {}",
            operand.type_name()
        )))
    }
}

/// `$push`/`$addToSet` take either a single value or `{$each: [...]}`.
fn each_operand(op: &str, operand: &Value) -> Result<Vec<Value>> {
    if let Value::Document(spec) = operand {
        if let Some(each) = spec.get("$each") {
            if spec.len() != 1 {
                return Err(Error::InvalidUpdate(format!(
                    "{op} only supports the $each modifier"
                )));
            }
            return each
                .as_array()
                .cloned()
                .ok_or_else(|| Error::InvalidUpdate(format!("{op} $each must be an array")));
        }
    }
    Ok(vec![operand.clone()])
}

fn paths_overlap(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    long == short || (long.starts_with(short) && long.as_bytes()[short.len()] == b'.')
}

fn check_conflicts(updates: &[FieldUpdate]) -> Result<()> {
    let mut touched: Vec<(&str, &'static str)> = Vec::new();
    for update in updates {
        let op = update.action.operator();
        let mut paths = vec![update.path.as_str()];
        if let Action::Rename(target) = &update.action {
            paths.push(target.as_str());
        }
        for path in paths {
            if let Some((other, other_op)) = touched.iter().find(|(p, _)| paths_overlap(p, path)) {
                return Err(Error::InvalidUpdate(format!(
                    "updating '{path}' with {op} conflicts with {other_op} on '{other}'"
                )));
            }
            touched.push((path, op));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

impl FieldUpdate {
    /// Read from `original`, write into `target`.
    fn apply(&self, original: &Document, target: &mut Document, now: &str) -> Result<()> {
        let path = self.path.as_str();
        let current = original.get_path(path);

        match &self.action {
            Action::Set(value) => target.set_path(path, value.clone()),
            Action::Unset => {
                target.remove_path(path);
                Ok(())
            }
            Action::Inc(by) => {
                let next = match current {
                    None => by.clone(),
                    Some(cur) if cur.is_numeric() => cur.add(by)?,
                    Some(cur) => return Err(non_numeric("$inc", path, cur)),
                };
                target.set_path(path, next)
            }
            Action::Mul(by) => {
                let next = match current {
                    None => match by {
                        Value::Integer(_) => Value::Integer(0),
                        _ => Value::Float(0.0),
                    },
                    Some(cur) if cur.is_numeric() => cur.multiply(by)?,
                    Some(cur) => return Err(non_numeric("$mul", path, cur)),
                };
                target.set_path(path, next)
            }
            Action::Min(value) => match current {
                Some(cur) if cur <= value => Ok(()),
                _ => target.set_path(path, value.clone()),
            },
            Action::Max(value) => match current {
                Some(cur) if cur >= value => Ok(()),
                _ => target.set_path(path, value.clone()),
            },
            Action::Rename(to) => {
                if let Some(value) = current {
                    target.remove_path(path);
                    target.set_path(to, value.clone())?;
                }
                Ok(())
            }
            Action::CurrentDate => target.set_path(path, Value::from(now)),
            Action::Push(values) => {
                let mut items = existing_array("$push", path, current)?;
                items.extend(values.iter().cloned());
                target.set_path(path, Value::Array(items))
            }
            Action::AddToSet(values) => {
                let existed = current.is_some();
                let mut items = existing_array("$addToSet", path, current)?;
                let before = items.len();
                for value in values {
                    if !items.contains(value) {
                        items.push(value.clone());
                    }
                }
                if existed && items.len() == before {
                    return Ok(());
                }
                target.set_path(path, Value::Array(items))
            }
            Action::Pop(end) => {
                let Some(cur) = current else { return Ok(()) };
                let mut items = existing_array("$pop", path, Some(cur))?;
                if items.is_empty() {
                    return Ok(());
                }
                match end {
                    PopEnd::First => {
                        items.remove(0);
                    }
                    PopEnd::Last => {
                        items.pop();
                    }
                }
                target.set_path(path, Value::Array(items))
            }
            Action::Pull(cond) => {
                let Some(cur) = current else { return Ok(()) };
                let items = existing_array("$pull", path, Some(cur))?;
                let before = items.len();
                let kept: Vec<Value> = items
                    .into_iter()
                    .filter(|item| !cond.matches(item))
                    .collect();
                if kept.len() == before {
                    return Ok(());
                }
                target.set_path(path, Value::Array(kept))
            }
        }
    }
}

impl PullCondition {
    fn matches(&self, item: &Value) -> bool {
        match self {
            PullCondition::Equals(value) => item == value,
            PullCondition::Matches(ops) => ops.iter().all(|op| op.matches_value(item)),
        }
    }
}

fn existing_array(op: &str, path: &str, current: Option<&Value>) -> Result<Vec<Value>> {
    match current {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(Error::TypeMismatch(format!(
            "{op} requires field '{path}' to be an array, found {}",
            other.type_name()
        ))),
    }
}

fn non_numeric(op: &str, path: &str, current: &Value) -> Error {
    Error::TypeMismatch(format!(
        "{op} cannot be applied to non-numeric field '{path}' of type {}",
        current.type_name()
    ))
}

// ===========================================================================
// Tests
// ===========================================================================
