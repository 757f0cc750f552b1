//! Where-condition clauses

use std::collections::BTreeMap;

use serde_json::{json, Value as Json};

use super::NamespaceMeta;
use crate::query::ast::*;
use crate::query::error::{DqlError, DqlResult};

/// Longest query_string text sent to the backend
const QUERY_STRING_LIMIT: usize = 1000;

/// Characters query_string would treat as syntax
const RESERVED_CHARS: &[char] = &[
    '{', '}', '[', ']', '(', ')', '\\', '/', ':', '"', '.', '?', '+', '*', '|',
];

/// Field name compared against `script(...)`
const SCRIPT_FIELD: &str = "__script";

/// Clean up free text for a query_string clause
fn query_string_text(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .take(QUERY_STRING_LIMIT)
        .map(|c| if RESERVED_CHARS.contains(&c) { ' ' } else { c })
        .collect()
}

fn literal(e: &Expr) -> DqlResult<Json> {
    match e {
        Expr::Str(s) => Ok(json!(s)),
        Expr::Int(i) => Ok(json!(i)),
        Expr::Float(f) => Ok(json!(f)),
        Expr::Bool(b) => Ok(json!(b)),
        other => Err(DqlError::Parse(format!(
            "expected a literal value, got `{}'",
            other
        ))),
    }
}

fn string_arg(call: &Call) -> DqlResult<String> {
    match call.args.first() {
        Some(Expr::Str(s)) | Some(Expr::Ident(s)) => Ok(s.clone()),
        _ => Err(DqlError::Parse(format!(
            "{}() takes one string argument",
            call.name
        ))),
    }
}

fn must_not(inner: Json) -> Json {
    json!({"bool": {"must_not": [inner]}})
}

/// Translates conditions into query clauses, collecting highlight fields
pub struct ClauseBuilder<'a> {
    meta: &'a NamespaceMeta,
    aliases: &'a BTreeMap<String, String>,
    highlight: bool,
    highlight_fields: Vec<String>,
}

impl<'a> ClauseBuilder<'a> {
    pub fn new(
        meta: &'a NamespaceMeta,
        aliases: &'a BTreeMap<String, String>,
        highlight: bool,
    ) -> Self {
        Self {
            meta,
            aliases,
            highlight,
            highlight_fields: Vec::new(),
        }
    }

    pub fn into_highlight_fields(self) -> Vec<String> {
        self.highlight_fields
    }

    fn field(&self, e: &Expr) -> DqlResult<String> {
        let name = e.as_name().ok_or_else(|| {
            DqlError::Parse(format!("left side of a condition must be a field, got `{}'", e))
        })?;
        Ok(self
            .aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string()))
    }

    fn add_highlight(&mut self, field: &str) {
        if self.highlight && !self.highlight_fields.iter().any(|f| f == field) {
            self.highlight_fields.push(field.to_string());
        }
    }

    fn term(&self, field: &str, value: &Expr) -> DqlResult<Json> {
        Ok(json!({"term": { self.meta.keyword_field(field): {"value": literal(value)?} }}))
    }

    pub fn clause(&mut self, e: &Expr) -> DqlResult<Json> {
        match e {
            Expr::Paren(inner) => self.clause(inner),
            Expr::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs),
            other => Err(DqlError::Parse(format!(
                "`{}' is not a valid condition",
                other
            ))),
        }
    }

    fn binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> DqlResult<Json> {
        match op {
            BinOp::And => Ok(json!({"bool": {"must": [self.clause(lhs)?, self.clause(rhs)?]}})),
            BinOp::Or => Ok(json!({"bool": {"should": [self.clause(lhs)?, self.clause(rhs)?]}})),
            BinOp::In | BinOp::NotIn => {
                let field = self.field(lhs)?;
                let values = match rhs {
                    Expr::List(items) if !items.is_empty() => items,
                    _ => return Err(DqlError::parse("`in' requires a non-empty list")),
                };
                let should = values
                    .iter()
                    .map(|v| self.term(&field, v))
                    .collect::<DqlResult<Vec<_>>>()?;
                let any = json!({"bool": {"should": should}});
                Ok(if op == BinOp::In { any } else { must_not(any) })
            }
            BinOp::Eq | BinOp::Ne => {
                let positive = self.equality(lhs, rhs)?;
                Ok(if op == BinOp::Eq {
                    positive
                } else {
                    must_not(positive)
                })
            }
            BinOp::Gt | BinOp::Lt | BinOp::Gte | BinOp::Lte => {
                let field = self.field(lhs)?;
                let key = match op {
                    BinOp::Gt => "gt",
                    BinOp::Lt => "lt",
                    BinOp::Gte => "gte",
                    _ => "lte",
                };
                Ok(json!({"range": { field: { key: literal(rhs)? } }}))
            }
            other => Err(DqlError::Parse(format!(
                "operator `{}' is not supported in conditions",
                other.as_str()
            ))),
        }
    }

    /// Clause matching `lhs = rhs`
    fn equality(&mut self, lhs: &Expr, rhs: &Expr) -> DqlResult<Json> {
        let field = self.field(lhs)?;
        match rhs {
            Expr::Regex(re) => Ok(json!({"regexp": { field: {"value": re} }})),
            Expr::Nil => Ok(must_not(json!({"exists": {"field": field}}))),
            Expr::Call(call) => match call.name.to_lowercase().as_str() {
                "match" => {
                    self.add_highlight(&field);
                    Ok(json!({"match": { field: {"query": string_arg(call)?} }}))
                }
                "wildcard" => Ok(json!({"wildcard": { field: {"value": string_arg(call)?} }})),
                "query_string" | "querystring" => {
                    self.add_highlight(&field);
                    Ok(json!({"query_string": {
                        "default_field": field,
                        "query": query_string_text(&string_arg(call)?),
                        "default_operator": "AND",
                        "analyze_wildcard": true,
                    }}))
                }
                "exists" => Ok(json!({"exists": {"field": field}})),
                "script" if field == SCRIPT_FIELD => {
                    Ok(json!({"script": {"script": string_arg(call)?}}))
                }
                other => Err(DqlError::Parse(format!(
                    "function `{}' is not supported in conditions",
                    other
                ))),
            },
            value => self.term(&field, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse_conditions;

    fn clause(ns: Namespace, text: &str) -> Json {
        let meta = NamespaceMeta::for_namespace(ns).unwrap();
        let aliases = BTreeMap::from([("st".to_string(), "status".to_string())]);
        let mut builder = ClauseBuilder::new(&meta, &aliases, true);
        let conds = parse_conditions(text).unwrap();
        builder.clause(&conds[0]).unwrap()
    }

    #[test]
    fn test_term_uses_keyword_for_text_fields() {
        assert_eq!(
            clause(Namespace::Logging, "message = 'boom'"),
            json!({"term": {"message.keyword": {"value": "boom"}}})
        );
        assert_eq!(
            clause(Namespace::Logging, "host = 'a'"),
            json!({"term": {"host": {"value": "a"}}})
        );
    }

    #[test]
    fn test_not_equal_and_range() {
        assert_eq!(
            clause(Namespace::Logging, "host != 'a'"),
            json!({"bool": {"must_not": [{"term": {"host": {"value": "a"}}}]}})
        );
        assert_eq!(
            clause(Namespace::Logging, "st < 300"),
            json!({"range": {"status": {"lt": 300}}})
        );
    }

    #[test]
    fn test_logical_and_in() {
        assert_eq!(
            clause(Namespace::Logging, "a = 1 or b = 2"),
            json!({"bool": {"should": [
                {"term": {"a": {"value": 1}}},
                {"term": {"b": {"value": 2}}}
            ]}})
        );
        assert_eq!(
            clause(Namespace::Logging, "host in ['a', 'b']"),
            json!({"bool": {"should": [
                {"term": {"host": {"value": "a"}}},
                {"term": {"host": {"value": "b"}}}
            ]}})
        );
    }

    #[test]
    fn test_functions() {
        assert_eq!(
            clause(Namespace::Logging, "host = re('web.*')"),
            json!({"regexp": {"host": {"value": "web.*"}}})
        );
        assert_eq!(
            clause(Namespace::Logging, "host = wildcard('web*')"),
            json!({"wildcard": {"host": {"value": "web*"}}})
        );
        assert_eq!(
            clause(Namespace::Logging, "host = exists()"),
            json!({"exists": {"field": "host"}})
        );
        assert_eq!(
            clause(Namespace::Logging, "__script = script('doc.a.value > 1')"),
            json!({"script": {"script": "doc.a.value > 1"}})
        );
    }

    #[test]
    fn test_query_string_cleanup() {
        let c = clause(Namespace::Logging, "message = query_string('Error: (Disk) Full?')");
        assert_eq!(c["query_string"]["query"], json!("error   disk  full "));
        assert_eq!(c["query_string"]["default_operator"], json!("AND"));
        assert_eq!(c["query_string"]["default_field"], json!("message"));
    }
}
