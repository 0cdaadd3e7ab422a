use std::cmp::Ordering;

use crate::document::Document;
use crate::error::{Error, Result};
use crate::value::Value;

/// Variables every expression may reference.
const BUILTIN_VARIABLES: [&str; 2] = ["ROOT", "CURRENT"];

/// Default variable name bound by `$filter` when `as` is omitted.
const DEFAULT_FILTER_VARIABLE: &str = "this";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    fn from_operator(op: &str) -> Option<CompareOp> {
        match op {
            "$eq" => Some(CompareOp::Eq),
            "$ne" => Some(CompareOp::Ne),
            "$gt" => Some(CompareOp::Gt),
            "$gte" => Some(CompareOp::Gte),
            "$lt" => Some(CompareOp::Lt),
            "$lte" => Some(CompareOp::Lte),
            _ => None,
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering.is_eq(),
            CompareOp::Ne => ordering.is_ne(),
            CompareOp::Gt => ordering.is_gt(),
            CompareOp::Gte => ordering.is_ge(),
            CompareOp::Lt => ordering.is_lt(),
            CompareOp::Lte => ordering.is_le(),
        }
    }
}

/// A computed value inside an aggregation stage: `"$field"`, `"$$var.sub"`,
/// `{"$multiply": [...]}`, `{"$filter": {...}}`, literals, and so on.
#[derive(Debug, Clone)]
pub enum Expression {
    Literal(Value),
    Field(String),
    Variable { name: String, path: Option<String> },
    Object(Vec<(String, Expression)>),
    Array(Vec<Expression>),
    Add(Vec<Expression>),
    Subtract(Box<Expression>, Box<Expression>),
    Multiply(Vec<Expression>),
    Divide(Box<Expression>, Box<Expression>),
    Compare(CompareOp, Box<Expression>, Box<Expression>),
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Not(Box<Expression>),
    Cond {
        condition: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
    IfNull(Vec<Expression>),
    Size(Box<Expression>),
    Concat(Vec<Expression>),
    Filter {
        input: Box<Expression>,
        variable: String,
        cond: Box<Expression>,
    },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl Expression {
    pub fn parse(value: &Value) -> Result<Expression> {
        let mut scope: Vec<String> = BUILTIN_VARIABLES.iter().map(|v| v.to_string()).collect();
        parse_in(value, &mut scope)
    }

    /// True for a bare `"$field"` or `"$$var.path"` reference.
    pub fn is_path(&self) -> bool {
        matches!(self, Expression::Field(_) | Expression::Variable { .. })
    }
}

fn parse_in(value: &Value, scope: &mut Vec<String>) -> Result<Expression> {
    match value {
        Value::String(s) if s.starts_with("$$") => parse_variable(&s[2..], scope),
        Value::String(s) if s.starts_with('$') => {
            let path = &s[1..];
            if path.is_empty() || path.split('.').any(str::is_empty) {
                return Err(Error::InvalidPipeline(format!("invalid field path '{s}'")));
            }
            Ok(Expression::Field(path.to_string()))
        }
        Value::Array(items) => Ok(Expression::Array(
            items
                .iter()
                .map(|item| parse_in(item, scope))
                .collect::<Result<_>>()?,
        )),
        Value::Document(doc) => {
            let operators = doc.keys().filter(|k| k.starts_with('$')).count();
            match operators {
                0 => Ok(Expression::Object(
                    doc.iter()
                        .map(|(k, v)| Ok((k.clone(), parse_in(v, scope)?)))
                        .collect::<Result<_>>()?,
                )),
                1 if doc.len() == 1 => {
                    let Some((op, arg)) = doc.iter().next() else {
                        return Err(Error::InvalidPipeline("empty expression".into()));
                    };
                    parse_operator(op, arg, scope)
                }
                _ => Err(Error::InvalidPipeline(
                    "an expression object must hold exactly one operator".into(),
                )),
            }
        }
        other => Ok(Expression::Literal(other.clone())),
    }
}

fn parse_variable(reference: &str, scope: &[String]) -> Result<Expression> {
    let (name, path) = match reference.split_once('.') {
        Some((name, path)) => (name, Some(path.to_string())),
        None => (reference, None),
    };
    if !scope.iter().any(|v| v == name) {
        return Err(Error::InvalidPipeline(format!(
            "use of undefined variable: $${name}"
        )));
    }
    Ok(Expression::Variable {
        name: name.to_string(),
        path,
    })
}

fn parse_operator(op: &str, arg: &Value, scope: &mut Vec<String>) -> Result<Expression> {
    if let Some(cmp) = CompareOp::from_operator(op) {
        let [a, b] = fixed_args::<2>(op, arg, scope)?;
        return Ok(Expression::Compare(cmp, Box::new(a), Box::new(b)));
    }
    let expr = match op {
        "$literal" => Expression::Literal(arg.clone()),
        "$add" => Expression::Add(list_args(arg, scope)?),
        "$multiply" => Expression::Multiply(list_args(arg, scope)?),
        "$subtract" => {
            let [a, b] = fixed_args::<2>(op, arg, scope)?;
            Expression::Subtract(Box::new(a), Box::new(b))
        }
        "$divide" => {
            let [a, b] = fixed_args::<2>(op, arg, scope)?;
            Expression::Divide(Box::new(a), Box::new(b))
        }
        "$and" => Expression::And(list_args(arg, scope)?),
        "$or" => Expression::Or(list_args(arg, scope)?),
        "$not" => {
            let [a] = fixed_args::<1>(op, arg, scope)?;
            Expression::Not(Box::new(a))
        }
        "$size" => {
            let [a] = fixed_args::<1>(op, arg, scope)?;
            Expression::Size(Box::new(a))
        }
        "$concat" => Expression::Concat(list_args(arg, scope)?),
        "$ifNull" => {
            let args = list_args(arg, scope)?;
            if args.len() < 2 {
                return Err(Error::InvalidPipeline(
                    "$ifNull needs at least 2 arguments".into(),
                ));
            }
            Expression::IfNull(args)
        }
        "$cond" => parse_cond(arg, scope)?,
        "$filter" => parse_filter(arg, scope)?,
        other => {
            return Err(Error::InvalidPipeline(format!(
                "unknown expression operator: {other}"
            )));
        }
    };
    Ok(expr)
}

fn list_args(arg: &Value, scope: &mut Vec<String>) -> Result<Vec<Expression>> {
    match arg {
        Value::Array(items) => items.iter().map(|item| parse_in(item, scope)).collect(),
        single => Ok(vec![parse_in(single, scope)?]),
    }
}

fn fixed_args<const N: usize>(
    op: &str,
    arg: &Value,
    scope: &mut Vec<String>,
) -> Result<[Expression; N]> {
    let args = list_args(arg, scope)?;
    let count = args.len();
    args.try_into().map_err(|_| {
        Error::InvalidPipeline(format!(
            "{op} takes exactly {N} argument(s), got {count}"
        ))
    })
}

fn parse_cond(arg: &Value, scope: &mut Vec<String>) -> Result<Expression> {
    let (condition, then, otherwise) = match arg {
        Value::Array(items) if items.len() == 3 => (
            parse_in(&items[0], scope)?,
            parse_in(&items[1], scope)?,
            parse_in(&items[2], scope)?,
        ),
        Value::Document(spec) => {
            let field = |name: &str| {
                spec.get(name).ok_or_else(|| {
                    Error::InvalidPipeline(format!("$cond requires '{name}'"))
                })
            };
            if let Some(extra) = spec.keys().find(|k| !matches!(k.as_str(), "if" | "then" | "else")) {
                return Err(Error::InvalidPipeline(format!(
                    "unrecognized parameter to $cond: {extra}"
                )));
            }
            let (c, t, o) = (field("if")?, field("then")?, field("else")?);
            (parse_in(c, scope)?, parse_in(t, scope)?, parse_in(o, scope)?)
        }
        _ => {
            return Err(Error::InvalidPipeline(
                "$cond takes [if, then, else] or {if, then, else}".into(),
            ));
        }
    };
    Ok(Expression::Cond {
        condition: Box::new(condition),
        then: Box::new(then),
        otherwise: Box::new(otherwise),
    })
}

fn parse_filter(arg: &Value, scope: &mut Vec<String>) -> Result<Expression> {
    let spec = arg
        .as_document()
        .ok_or_else(|| Error::InvalidPipeline("$filter must be an object".into()))?;
    if let Some(extra) = spec.keys().find(|k| !matches!(k.as_str(), "input" | "as" | "cond")) {
        return Err(Error::InvalidPipeline(format!(
            "unrecognized parameter to $filter: {extra}"
        )));
    }
    let input = spec
        .get("input")
        .ok_or_else(|| Error::InvalidPipeline("$filter requires 'input'".into()))?;
    let cond = spec
        .get("cond")
        .ok_or_else(|| Error::InvalidPipeline("$filter requires 'cond'".into()))?;
    let variable = match spec.get("as") {
        None => DEFAULT_FILTER_VARIABLE.to_string(),
        Some(Value::String(name)) if is_valid_variable_name(name) => name.clone(),
        Some(other) => {
            return Err(Error::InvalidPipeline(format!(
                "$filter 'as' must be a variable name, got {other}"
            )));
        }
    };

    let input = parse_in(input, scope)?;
    scope.push(variable.clone());
    let cond = parse_in(cond, scope);
    scope.pop();

    Ok(Expression::Filter {
        input: Box::new(input),
        variable,
        cond: Box::new(cond?),
    })
}

fn is_valid_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase() || !c.is_ascii())
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Variable bindings, innermost first.
#[derive(Clone, Copy)]
struct Scope<'a> {
    root: &'a Document,
    binding: Option<(&'a str, &'a Value, &'a Scope<'a>)>,
}

impl<'a> Scope<'a> {
    fn lookup(&self, name: &str) -> Option<&'a Value> {
        match self.binding {
            Some((bound, value, _)) if bound == name => Some(value),
            Some((_, _, parent)) => parent.lookup(name),
            None => None,
        }
    }
}

impl Expression {
    /// Evaluate against `doc`. A reference to a missing field yields null.
    pub fn eval(&self, doc: &Document) -> Result<Value> {
        Ok(self.eval_present(doc)?.unwrap_or(Value::Null))
    }

    /// Like [`Expression::eval`], but a bare path that resolves to nothing
    /// yields `None`, so callers can omit the field instead of writing null.
    pub fn eval_present(&self, doc: &Document) -> Result<Option<Value>> {
        self.evaluate(&Scope {
            root: doc,
            binding: None,
        })
    }

    fn evaluate(&self, scope: &Scope<'_>) -> Result<Option<Value>> {
        let value = match self {
            Expression::Literal(v) => v.clone(),
            Expression::Field(path) => return Ok(resolve_in_document(scope.root, path)),
            Expression::Variable { name, path } => {
                return Ok(match name.as_str() {
                    "ROOT" | "CURRENT" => match path {
                        Some(path) => resolve_in_document(scope.root, path),
                        None => Some(Value::Document(scope.root.clone())),
                    },
                    _ => scope.lookup(name).and_then(|value| match path {
                        Some(path) => resolve_in_value(value, path),
                        None => Some(value.clone()),
                    }),
                });
            }
            Expression::Object(fields) => {
                let mut out = Document::with_capacity(fields.len());
                for (key, expr) in fields {
                    if let Some(v) = expr.evaluate(scope)? {
                        out.insert(key.clone(), v);
                    }
                }
                Value::Document(out)
            }
            Expression::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.value(scope))
                    .collect::<Result<_>>()?,
            ),
            Expression::Add(args) => fold_numeric(args, scope, Value::Integer(0), Value::add)?,
            Expression::Multiply(args) => {
                fold_numeric(args, scope, Value::Integer(1), Value::multiply)?
            }
            Expression::Subtract(a, b) => binary_numeric(a, b, scope, Value::subtract)?,
            Expression::Divide(a, b) => binary_numeric(a, b, scope, Value::divide)?,
            Expression::Compare(op, a, b) => {
                let ordering = a.value(scope)?.cmp(&b.value(scope)?);
                Value::Boolean(op.holds(ordering))
            }
            Expression::And(args) => {
                let mut all = true;
                for arg in args {
                    if !arg.value(scope)?.is_truthy() {
                        all = false;
                        break;
                    }
                }
                Value::Boolean(all)
            }
            Expression::Or(args) => {
                let mut any = false;
                for arg in args {
                    if arg.value(scope)?.is_truthy() {
                        any = true;
                        break;
                    }
                }
                Value::Boolean(any)
            }
            Expression::Not(arg) => Value::Boolean(!arg.value(scope)?.is_truthy()),
            Expression::Cond {
                condition,
                then,
                otherwise,
            } => {
                return if condition.value(scope)?.is_truthy() {
                    then.evaluate(scope)
                } else {
                    otherwise.evaluate(scope)
                };
            }
            Expression::IfNull(args) => {
                let (fallback, candidates) = match args.split_last() {
                    Some(split) => split,
                    None => return Ok(Some(Value::Null)),
                };
                for candidate in candidates {
                    match candidate.evaluate(scope)? {
                        Some(v) if !v.is_null() => return Ok(Some(v)),
                        _ => {}
                    }
                }
                return fallback.evaluate(scope);
            }
            Expression::Size(arg) => match arg.value(scope)? {
                Value::Array(items) => Value::Integer(i64::try_from(items.len()).unwrap_or(i64::MAX)),
                other => {
                    return Err(Error::TypeMismatch(format!(
                        "$size requires an array, found {}",
                        other.type_name()
                    )));
                }
            },
            Expression::Concat(args) => {
                let mut out = String::new();
                for arg in args {
                    match arg.value(scope)? {
                        Value::String(s) => out.push_str(&s),
                        Value::Null => return Ok(Some(Value::Null)),
                        other => {
                            return Err(Error::TypeMismatch(format!(
                                "$concat only supports strings, found {}",
                                other.type_name()
                            )));
                        }
                    }
                }
                Value::String(out)
            }
            Expression::Filter {
                input,
                variable,
                cond,
            } => match input.value(scope)? {
                Value::Null => Value::Null,
                Value::Array(items) => {
                    let mut kept = Vec::new();
                    for item in &items {
                        let inner = Scope {
                            root: scope.root,
                            binding: Some((variable.as_str(), item, scope)),
                        };
                        if cond.value(&inner)?.is_truthy() {
                            kept.push(item.clone());
                        }
                    }
                    Value::Array(kept)
                }
                other => {
                    return Err(Error::TypeMismatch(format!(
                        "$filter input must be an array, found {}",
                        other.type_name()
                    )));
                }
            },
        };
        Ok(Some(value))
    }

    fn value(&self, scope: &Scope<'_>) -> Result<Value> {
        Ok(self.evaluate(scope)?.unwrap_or(Value::Null))
    }
}

fn fold_numeric(
    args: &[Expression],
    scope: &Scope<'_>,
    initial: Value,
    op: fn(&Value, &Value) -> Result<Value>,
) -> Result<Value> {
    let mut acc = initial;
    for arg in args {
        let v = arg.value(scope)?;
        if v.is_null() {
            return Ok(Value::Null);
        }
        acc = op(&acc, &v)?;
    }
    Ok(acc)
}

fn binary_numeric(
    a: &Expression,
    b: &Expression,
    scope: &Scope<'_>,
    op: fn(&Value, &Value) -> Result<Value>,
) -> Result<Value> {
    let (a, b) = (a.value(scope)?, b.value(scope)?);
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    op(&a, &b)
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

fn resolve_in_document(doc: &Document, path: &str) -> Option<Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let value = doc.get(head)?;
    match rest {
        Some(rest) => resolve_in_value(value, rest),
        None => Some(value.clone()),
    }
}

/// Arrays of documents map the remaining path over their elements, so
/// `"$orders.qty"` yields the list of quantities.
fn resolve_in_value(value: &Value, path: &str) -> Option<Value> {
    match value {
        Value::Document(doc) => resolve_in_document(doc, path),
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Document(doc) => resolve_in_document(doc, path),
                    _ => None,
                })
                .collect(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value as JsonValue, json};

    fn doc(v: JsonValue) -> Document {
        Document::from_json(v).unwrap()
    }

    fn eval(expr: JsonValue, input: JsonValue) -> Value {
        Expression::parse(&Value::from_json(expr))
            .unwrap()
            .eval(&doc(input))
            .unwrap()
    }

    fn eval_err(expr: JsonValue, input: JsonValue) -> Error {
        Expression::parse(&Value::from_json(expr))
            .unwrap()
            .eval(&doc(input))
            .unwrap_err()
    }

    #[test]
    fn field_ref_and_nested_path() {
        assert_eq!(eval(json!("$name"), json!({"name": "Alice"})), Value::from("Alice"));
        assert_eq!(eval(json!("$a.b.c"), json!({"a": {"b": {"c": 42}}})), Value::Integer(42));
        assert_eq!(eval(json!("$missing"), json!({"a": 1})), Value::Null);
    }

    #[test]
    fn path_maps_over_array_of_documents() {
        let out = eval(json!("$orders.qty"), json!({"orders": [{"qty": 1}, {"qty": 3}]}));
        assert_eq!(out, Value::from_json(json!([1, 3])));
    }

    #[test]
    fn literals_objects_and_arrays() {
        assert_eq!(eval(json!(42), json!({})), Value::Integer(42));
        assert_eq!(eval(json!({"$literal": "$name"}), json!({"name": "x"})), Value::from("$name"));
        assert_eq!(
            eval(json!({"n": "$name", "list": ["$a", 2]}), json!({"name": "x", "a": 1})),
            Value::from_json(json!({"n": "x", "list": [1, 2]}))
        );
    }

    #[test]
    fn arithmetic() {
        let d = json!({"qty": 3, "price": 2.5, "a": 10, "b": 4});
        assert_eq!(eval(json!({"$multiply": ["$qty", "$price"]}), d.clone()), Value::Float(7.5));
        assert!(eval(json!({"$add": ["$a", "$b", 1]}), d.clone()).identical(&Value::Integer(15)));
        assert_eq!(eval(json!({"$subtract": ["$a", "$b"]}), d.clone()), Value::Integer(6));
        assert_eq!(eval(json!({"$divide": ["$a", "$b"]}), d), Value::Float(2.5));
    }

    #[test]
    fn arithmetic_on_null_or_missing_is_null() {
        assert_eq!(eval(json!({"$add": ["$a", "$missing"]}), json!({"a": 1})), Value::Null);
        assert_eq!(eval(json!({"$multiply": ["$a", null]}), json!({"a": 1})), Value::Null);
    }

    #[test]
    fn arithmetic_on_string_is_type_mismatch() {
        let err = eval_err(json!({"$multiply": ["$name", 2]}), json!({"name": "Alice"}));
        assert!(matches!(err, Error::TypeMismatch(_)));
    }

    #[test]
    fn divide_by_zero_is_type_mismatch() {
        let err = eval_err(json!({"$divide": ["$a", 0]}), json!({"a": 1}));
        assert!(matches!(err, Error::TypeMismatch(_)));
    }

    #[test]
    fn comparisons_and_logic() {
        let d = json!({"qty": 2});
        assert_eq!(eval(json!({"$gt": ["$qty", 1]}), d.clone()), Value::Boolean(true));
        assert_eq!(eval(json!({"$lte": ["$qty", 1]}), d.clone()), Value::Boolean(false));
        assert_eq!(eval(json!({"$eq": ["$qty", 2.0]}), d.clone()), Value::Boolean(true));
        assert_eq!(
            eval(json!({"$and": [{"$gt": ["$qty", 1]}, {"$lt": ["$qty", 5]}]}), d.clone()),
            Value::Boolean(true)
        );
        assert_eq!(eval(json!({"$not": [{"$gt": ["$qty", 1]}]}), d), Value::Boolean(false));
    }

    #[test]
    fn cond_and_if_null() {
        let d = json!({"qty": 2, "note": null});
        assert_eq!(
            eval(json!({"$cond": {"if": {"$gte": ["$qty", 2]}, "then": "bulk", "else": "single"}}), d.clone()),
            Value::from("bulk")
        );
        assert_eq!(eval(json!({"$cond": [false, 1, 2]}), d.clone()), Value::Integer(2));
        assert_eq!(eval(json!({"$ifNull": ["$note", "n/a"]}), d.clone()), Value::from("n/a"));
        assert_eq!(eval(json!({"$ifNull": ["$missing", "n/a"]}), d), Value::from("n/a"));
    }

    #[test]
    fn size_and_concat() {
        let d = json!({"tags": ["a", "b"], "first": "Ada", "last": "Lovelace"});
        assert_eq!(eval(json!({"$size": "$tags"}), d.clone()), Value::Integer(2));
        assert_eq!(
            eval(json!({"$concat": ["$first", " ", "$last"]}), d.clone()),
            Value::from("Ada Lovelace")
        );
        assert!(matches!(eval_err(json!({"$size": "$first"}), d), Error::TypeMismatch(_)));
    }

    #[test]
    fn filter_binds_variable() {
        let d = json!({"orders": [
            {"item": "Laptop", "qty": 1},
            {"item": "Mouse", "qty": 2},
            {"item": "Pad", "qty": 3}
        ]});
        let out = eval(
            json!({"$filter": {"input": "$orders", "as": "order", "cond": {"$gt": ["$$order.qty", 1]}}}),
            d,
        );
        assert_eq!(
            out,
            Value::from_json(json!([{"item": "Mouse", "qty": 2}, {"item": "Pad", "qty": 3}]))
        );
    }

    #[test]
    fn filter_default_variable_and_nesting() {
        let d = json!({"matrix": [[1, 5], [7, 9]]});
        let out = eval(
            json!({"$filter": {
                "input": "$matrix",
                "as": "row",
                "cond": {"$gt": [{"$size": {"$filter": {"input": "$$row", "cond": {"$gt": ["$$this", 4]}}}}, 1]}
            }}),
            d,
        );
        assert_eq!(out, Value::from_json(json!([[7, 9]])));
    }

    #[test]
    fn root_variable() {
        let out = eval(json!("$$ROOT.name"), json!({"name": "Alice"}));
        assert_eq!(out, Value::from("Alice"));
        let out = eval(json!("$$CURRENT"), json!({"name": "Alice"}));
        assert_eq!(out, Value::from_json(json!({"name": "Alice"})));
    }

    #[test]
    fn undefined_variable_fails_at_parse() {
        let err = Expression::parse(&Value::from("$$order.qty")).unwrap_err();
        assert!(matches!(err, Error::InvalidPipeline(_)));
        // The variable is only visible inside cond.
        let err = Expression::parse(&Value::from_json(json!({
            "$add": [{"$size": {"$filter": {"input": "$a", "as": "x", "cond": true}}}, "$$x"]
        })))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidPipeline(_)));
    }

    #[test]
    fn malformed_expressions_fail_at_parse() {
        for bad in [
            json!({"$bogus": 1}),
            json!({"$subtract": [1]}),
            json!({"$gt": 1, "$lt": 2}),
            json!({"$filter": {"input": "$a"}}),
            json!({"$cond": [true, 1]}),
            json!("$"),
        ] {
            assert!(Expression::parse(&Value::from_json(bad.clone())).is_err(), "{bad}");
        }
    }
}
