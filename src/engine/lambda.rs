//! Cross-query correlation
//!
//! `FILTER` narrows the left query to values found by the right query.
//! `LINK` joins right-query tuples onto left-query tuples.
//!
//! # Examples
//!
//! ```text
//! cpu:(usage, host) FILTER O::host:(name) WITH {host = name}
//! O::host:(name, os) LINK cpu:(host, usage) WITH {name = host}
//! ```

use crate::engine::result::Row;
use crate::query::ast::{BinOp, Expr};
use crate::query::{DqlError, DqlResult, Value};

/// One `left_col op right_col` correlation
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub left: String,
    pub op: BinOp,
    pub right: String,
}

impl JoinSpec {
    pub fn from_expr(e: &Expr) -> DqlResult<Self> {
        let e = match e {
            Expr::Paren(inner) => inner.as_ref(),
            other => other,
        };
        match e {
            Expr::Binary { op, lhs, rhs } if op.is_comparison() => {
                match (lhs.as_name(), rhs.as_name()) {
                    (Some(left), Some(right)) => Ok(Self {
                        left: left.to_string(),
                        op: *op,
                        right: right.to_string(),
                    }),
                    _ => Err(DqlError::parse(format!(
                        "lambda condition `{}' must compare two columns",
                        e
                    ))),
                }
            }
            other => Err(DqlError::parse(format!(
                "lambda condition `{}' must be a comparison",
                other
            ))),
        }
    }

    fn matches(&self, left: &Value, right: &Value) -> bool {
        use std::cmp::Ordering::*;
        if left.is_null() || right.is_null() {
            return false;
        }
        match self.op {
            BinOp::Eq => left.loose_eq(right),
            BinOp::Ne => !left.loose_eq(right),
            BinOp::Gt => left.partial_cmp_value(right) == Some(Greater),
            BinOp::Lt => left.partial_cmp_value(right) == Some(Less),
            BinOp::Gte => matches!(left.partial_cmp_value(right), Some(Greater | Equal)),
            BinOp::Lte => matches!(left.partial_cmp_value(right), Some(Less | Equal)),
            _ => false,
        }
    }
}

/// Join specs for each right query; one shared spec or one per query
pub fn join_specs(with: &[Expr], right_count: usize) -> DqlResult<Vec<JoinSpec>> {
    let specs: Vec<JoinSpec> = with.iter().map(JoinSpec::from_expr).collect::<DqlResult<_>>()?;
    match specs.len() {
        1 => Ok(vec![specs[0].clone(); right_count]),
        n if n == right_count => Ok(specs),
        n => Err(DqlError::parse(format!(
            "lambda needs 1 or {} WITH conditions, got {}",
            right_count, n
        ))),
    }
}

/// Distinct non-null values of a column across every series, first-seen order
pub fn column_values(series: &[Row], column: &str) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for row in series {
        let Some(idx) = row.column_index(column) else {
            continue;
        };
        for tuple in &row.values {
            if let Some(v) = tuple.get(idx) {
                if !v.is_null() && !out.iter().any(|seen| seen.loose_eq(v)) {
                    out.push(v.clone());
                }
            }
        }
    }
    out
}

fn literal(v: &Value) -> Option<Expr> {
    match v {
        Value::Null => Some(Expr::Nil),
        Value::Bool(b) => Some(Expr::Bool(*b)),
        Value::Int(i) => Some(Expr::Int(*i)),
        Value::Float(f) => Some(Expr::Float(*f)),
        Value::Str(s) => Some(Expr::Str(s.clone())),
        Value::List(_) => None,
    }
}

/// Condition narrowing `column` to the given values.
///
/// `=` and the ordering operators give a disjunction, `!=` a conjunction.
/// `None` means no value was found.
pub fn filter_condition(column: &str, op: BinOp, values: &[Value]) -> Option<Expr> {
    let conds: Vec<Expr> = values
        .iter()
        .filter_map(literal)
        .map(|v| Expr::binary(op, Expr::Ident(column.to_string()), v))
        .collect();
    if op == BinOp::Ne {
        Expr::and_all(conds).map(|e| Expr::Paren(Box::new(e)))
    } else {
        Expr::or_all(conds)
    }
}

/// `column in [values]`
pub fn membership_condition(column: &str, values: &[Value]) -> Option<Expr> {
    let items: Vec<Expr> = values.iter().filter_map(literal).collect();
    if items.is_empty() {
        return None;
    }
    Some(Expr::binary(
        BinOp::In,
        Expr::Ident(column.to_string()),
        Expr::List(items),
    ))
}

/// Attach to every left tuple the first right tuple satisfying the spec.
///
/// The right columns, minus its join column, are appended once. Left tuples
/// without a match get nulls.
pub fn link(left: Vec<Row>, right: &[Row], spec: &JoinSpec) -> Vec<Row> {
    let mut right_columns: Vec<String> = Vec::new();
    for row in right {
        for c in &row.columns {
            if !right_columns.contains(c) {
                right_columns.push(c.clone());
            }
        }
    }
    let Some(join_idx) = right_columns.iter().position(|c| c == &spec.right) else {
        return left
            .into_iter()
            .map(|mut row| {
                for tuple in &mut row.values {
                    tuple.extend(std::iter::repeat(Value::Null).take(right_columns.len()));
                }
                for name in &right_columns {
                    let unique = unique_column(&row.columns, name);
                    row.columns.push(unique);
                }
                row
            })
            .collect();
    };

    let mut tuples: Vec<Vec<Value>> = Vec::new();
    for row in right {
        for tuple in &row.values {
            tuples.push(
                right_columns
                    .iter()
                    .map(|c| {
                        row.column_index(c)
                            .and_then(|i| tuple.get(i).cloned())
                            .unwrap_or_default()
                    })
                    .collect(),
            );
        }
    }
    tuples.push(vec![Value::Null; right_columns.len()]);
    let sentinel = tuples.len() - 1;

    let appended: Vec<String> = right_columns
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != join_idx)
        .map(|(_, c)| c.clone())
        .collect();

    left.into_iter()
        .map(|mut row| {
            let left_idx = row.column_index(&spec.left);
            for tuple in &mut row.values {
                let key = left_idx.and_then(|i| tuple.get(i)).cloned().unwrap_or_default();
                let found = tuples[..sentinel]
                    .iter()
                    .position(|t| spec.matches(&key, &t[join_idx]))
                    .unwrap_or(sentinel);
                tuple.extend(
                    tuples[found]
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != join_idx)
                        .map(|(_, v)| v.clone()),
                );
            }
            for name in &appended {
                let unique = unique_column(&row.columns, name);
                row.columns.push(unique);
            }
            row
        })
        .collect()
}

/// `name`, or `name_<n>` when the row already has that column
fn unique_column(columns: &[String], name: &str) -> String {
    let mut candidate = name.to_string();
    let mut n = 1;
    while columns.contains(&candidate) {
        candidate = format!("{}_{}", name, n);
        n += 1;
    }
    candidate
}
