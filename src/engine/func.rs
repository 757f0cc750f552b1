//! Function-service delegation
//!
//! Arguments of an `F::` call are converted to JSON. `dql('...')` arguments
//! are inner queries: they are collected here, executed by the caller, and
//! their series passed to the service as keyword arguments.

use serde_json::{Map, Value as Json};

use crate::backend::FuncRequest;
use crate::engine::result::Row;
use crate::query::ast::{Expr, FuncCall};
use crate::query::{DqlError, DqlResult};

/// Inner query waiting to be executed
#[derive(Debug, Clone, PartialEq)]
pub struct InnerQuery {
    /// Keyword the series are passed under
    pub key: String,
    pub dql: String,
}

/// A function request whose inner queries have not run yet
#[derive(Debug, Clone, PartialEq)]
pub struct FuncPlan {
    pub function: String,
    pub kwargs: Map<String, Json>,
    pub args: Vec<Json>,
    pub inner: Vec<InnerQuery>,
}

fn inner_dql(e: &Expr) -> Option<DqlResult<String>> {
    let call = e.as_call()?;
    if !call.name.eq_ignore_ascii_case("dql") {
        return None;
    }
    Some(match call.arg(0, "dql") {
        Some(Expr::Str(text)) => Ok(text.clone()),
        _ => Err(DqlError::parse("dql() takes a query string")),
    })
}

/// JSON form of a literal argument
pub fn expr_to_json(e: &Expr) -> Json {
    match e {
        Expr::Str(s) | Expr::Ident(s) => Json::String(s.clone()),
        Expr::Int(i) => Json::from(*i),
        Expr::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Expr::Bool(b) => Json::Bool(*b),
        Expr::Nil => Json::Null,
        Expr::List(items) => Json::Array(items.iter().map(expr_to_json).collect()),
        Expr::Paren(inner) => expr_to_json(inner),
        other => Json::String(other.to_string()),
    }
}

/// Split the call into literal arguments and inner queries.
///
/// A keyword inner query keeps its keyword; positional ones are passed as
/// `dql`, then `dql_1`, `dql_2` and so on.
pub fn plan_call(fc: &FuncCall) -> DqlResult<FuncPlan> {
    let mut plan = FuncPlan {
        function: fc.function_name(),
        kwargs: Map::new(),
        args: Vec::new(),
        inner: Vec::new(),
    };

    let mut positional = 0;
    for arg in &fc.call.args {
        match inner_dql(arg) {
            Some(dql) => {
                let key = if positional == 0 {
                    "dql".to_string()
                } else {
                    format!("dql_{}", positional)
                };
                positional += 1;
                plan.inner.push(InnerQuery { key, dql: dql? });
            }
            None => plan.args.push(expr_to_json(arg)),
        }
    }
    for (name, arg) in &fc.call.kwargs {
        match inner_dql(arg) {
            Some(dql) => plan.inner.push(InnerQuery {
                key: name.clone(),
                dql: dql?,
            }),
            None => {
                plan.kwargs.insert(name.clone(), expr_to_json(arg));
            }
        }
    }
    Ok(plan)
}

impl FuncPlan {
    /// Attach executed inner series under their keyword
    pub fn fill_inner(&mut self, key: &str, series: &[Row]) -> DqlResult<()> {
        let value = serde_json::to_value(series)
            .map_err(|e| DqlError::query(format!("failed to encode inner series: {}", e)))?;
        self.kwargs.insert(key.to_string(), value);
        Ok(())
    }

    pub fn into_request(self, workspace: &str) -> FuncRequest {
        FuncRequest {
            function: self.function,
            workspace: workspace.to_string(),
            kwargs: self.kwargs,
            args: self.args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{parse_dql, Stmt, Value};
    use serde_json::json;

    fn func(text: &str) -> FuncCall {
        match parse_dql(text).unwrap().remove(0) {
            Stmt::Func(f) => f,
            other => panic!("not a func: {:?}", other),
        }
    }

    #[test]
    fn test_plan_collects_inner_queries() {
        let plan = plan_call(&func(
            "F::anomaly:(detect(dql('cpu:(usage)'), sensitivity=3, base=dql('cpu:(free)')))",
        ))
        .unwrap();
        assert_eq!(plan.function, "anomaly.detect");
        assert_eq!(plan.kwargs.get("sensitivity"), Some(&json!(3)));
        assert_eq!(
            plan.inner,
            vec![
                InnerQuery { key: "dql".into(), dql: "cpu:(usage)".into() },
                InnerQuery { key: "base".into(), dql: "cpu:(free)".into() },
            ]
        );
    }

    #[test]
    fn test_literal_arguments_become_json() {
        let plan = plan_call(&func("F::m:(f('a', 1.5, [1, 2], true, nil))")).unwrap();
        assert_eq!(plan.args, vec![json!("a"), json!(1.5), json!([1, 2]), json!(true), Json::Null]);
        assert!(plan.inner.is_empty());
    }

    #[test]
    fn test_fill_inner_serializes_rows() {
        let mut plan = plan_call(&func("F::m:(f(x=dql('cpu:(usage)')))")).unwrap();
        let rows = vec![Row::new("cpu", vec!["time".into(), "usage".into()])
            .with_values(vec![vec![Value::Int(1), Value::Float(0.5)]])];
        plan.fill_inner("x", &rows).unwrap();
        let request = plan.into_request("ws1");
        assert_eq!(request.kwargs["x"][0]["values"], json!([[1, 0.5]]));
        assert_eq!(request.workspace, "ws1");
    }

    #[test]
    fn test_dql_needs_string() {
        assert!(plan_call(&func("F::m:(f(dql(1)))")).is_err());
    }
}
