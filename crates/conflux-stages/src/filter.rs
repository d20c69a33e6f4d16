//! The filter expression language used by the query stage.
//!
//! A deliberately small path language over JSON values:
//!
//! - `.` — identity
//! - `.a.b` — field access (missing fields yield `null`, like `null`
//!   itself; indexing a scalar is an error)
//! - `.[]`, `.a[]` — iterate an array's elements (or an object's values),
//!   producing one result per element
//! - `.[0]`, `.a[2]` — array indexing
//! - `[f]` — collect all of `f`'s results into a single array
//!
//! A filter maps one input value to zero or more output values; `.[]`
//! over a two-element array yields two results.

use std::fmt;

use serde_json::Value;

/// Errors from filter compilation and evaluation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    /// The expression does not parse.
    #[error("invalid filter expression {expr:?}: {reason}")]
    Parse {
        /// The offending expression.
        expr: String,
        /// What went wrong.
        reason: String,
    },

    /// `[]` applied to a value that has no elements to iterate.
    #[error("cannot iterate over {0}")]
    CannotIterate(&'static str),

    /// A field or index applied to a value that cannot be indexed.
    #[error("cannot index {0} with {1}")]
    CannotIndex(&'static str, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
    Iterate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Path(Vec<Segment>),
    Collect(Box<Expr>),
}

/// A compiled filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    expr: Expr,
    source: String,
}

impl Program {
    /// Compiles a filter expression.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Parse`] if the expression is not part of the
    /// supported subset.
    pub fn compile(source: &str) -> Result<Self, FilterError> {
        let expr = parse_expr(source.trim(), source)?;
        Ok(Self {
            expr,
            source: source.to_string(),
        })
    }

    /// The expression this program was compiled from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Runs the filter over `input`, producing zero or more results.
    ///
    /// # Errors
    ///
    /// Returns a [`FilterError`] if the filter is applied to a value of an
    /// incompatible shape; evaluation stops at the first error.
    pub fn eval(&self, input: &Value) -> Result<Vec<Value>, FilterError> {
        eval_expr(&self.expr, input)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_error(expr: &str, reason: impl Into<String>) -> FilterError {
    FilterError::Parse {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

fn parse_expr(s: &str, full: &str) -> Result<Expr, FilterError> {
    if s.is_empty() {
        return Err(parse_error(full, "empty expression"));
    }
    if let Some(inner) = s.strip_prefix('[') {
        let Some(inner) = inner.strip_suffix(']') else {
            return Err(parse_error(full, "unclosed '['"));
        };
        return Ok(Expr::Collect(Box::new(parse_expr(inner.trim(), full)?)));
    }
    Ok(Expr::Path(parse_path(s, full)?))
}

fn parse_path(s: &str, full: &str) -> Result<Vec<Segment>, FilterError> {
    if !s.starts_with('.') {
        return Err(parse_error(full, "a path must start with '.'"));
    }
    if s == "." {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        rest = rest
            .strip_prefix('.')
            .ok_or_else(|| parse_error(full, "expected '.'"))?;
        if rest.is_empty() {
            return Err(parse_error(full, "trailing '.'"));
        }

        let end = rest.find(['.', '[']).unwrap_or(rest.len());
        let field = &rest[..end];
        if !field.is_empty() {
            if !field.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
                return Err(parse_error(full, format!("invalid field name {field:?}")));
            }
            segments.push(Segment::Field(field.to_string()));
        }
        rest = &rest[end..];

        let mut bracketed = false;
        while let Some(open) = rest.strip_prefix('[') {
            bracketed = true;
            let close = open
                .find(']')
                .ok_or_else(|| parse_error(full, "unclosed '['"))?;
            let inner = &open[..close];
            if inner.is_empty() {
                segments.push(Segment::Iterate);
            } else {
                let index = inner
                    .parse::<usize>()
                    .map_err(|_| parse_error(full, format!("invalid index {inner:?}")))?;
                segments.push(Segment::Index(index));
            }
            rest = &open[close + 1..];
        }

        if field.is_empty() && !bracketed {
            return Err(parse_error(full, "empty path segment"));
        }
        if !rest.is_empty() && !rest.starts_with('.') {
            return Err(parse_error(full, format!("unexpected input {rest:?}")));
        }
    }
    Ok(segments)
}

fn eval_expr(expr: &Expr, input: &Value) -> Result<Vec<Value>, FilterError> {
    match expr {
        Expr::Collect(inner) => Ok(vec![Value::Array(eval_expr(inner, input)?)]),
        Expr::Path(segments) => {
            let mut values = vec![input.clone()];
            for segment in segments {
                values = apply_segment(segment, values)?;
            }
            Ok(values)
        }
    }
}

fn apply_segment(segment: &Segment, values: Vec<Value>) -> Result<Vec<Value>, FilterError> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        match segment {
            Segment::Field(name) => match value {
                Value::Object(map) => {
                    out.push(map.get(name).cloned().unwrap_or(Value::Null));
                }
                Value::Null => out.push(Value::Null),
                other => {
                    return Err(FilterError::CannotIndex(type_name(&other), format!("\"{name}\"")));
                }
            },
            Segment::Index(index) => match value {
                Value::Array(items) => {
                    out.push(items.get(*index).cloned().unwrap_or(Value::Null));
                }
                Value::Null => out.push(Value::Null),
                other => {
                    return Err(FilterError::CannotIndex(type_name(&other), index.to_string()));
                }
            },
            Segment::Iterate => match value {
                Value::Array(items) => out.extend(items),
                Value::Object(map) => out.extend(map.into_iter().map(|(_, v)| v)),
                other => return Err(FilterError::CannotIterate(type_name(&other))),
            },
        }
    }
    Ok(out)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
