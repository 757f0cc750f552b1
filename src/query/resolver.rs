//! Namespace resolution
//!
//! Classifies each parsed statement into a [`Namespace`] and translates it
//! into the native query of the backend that namespace lives on. Resolution
//! never mutates its input: normalization happens on a clone, so resolving
//! the same statement twice gives the same result.

use serde::Serialize;

use crate::query::ast::*;
use crate::query::error::{DqlError, DqlResult};
use crate::query::influxql;
use crate::query::params::{ExtraParam, QueryLimits, QuerySpec};
use crate::query::parser::parse_dql;
use crate::query::search::{self, SearchLimits, SearchPlan};

/// Most statements a single query text may compile into
pub const MAX_PARSE_RESULTS: usize = 5;

/// Aggregates that suppress the implicit `last()` wrapping
const BUCKET_AGGREGATES: &[&str] = &[
    "avg",
    "bottom",
    "count",
    "count_distinct",
    "distinct",
    "first",
    "last",
    "max",
    "min",
    "percentile",
    "sum",
    "top",
];

/// Backend-native form of a resolved statement
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NativeQuery {
    /// Composite statements translate their inner queries when they run
    Deferred,
    /// Time-series statement text
    Statement { text: String },
    /// Search body and response helper
    Search { plan: SearchPlan },
}

/// A statement with its namespace and translated query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AstResult {
    pub stmt: Stmt,
    pub namespace: Namespace,
    pub native: NativeQuery,
}

impl AstResult {
    /// Native query as text, for explain output and logs
    pub fn query_text(&self) -> String {
        match &self.native {
            NativeQuery::Deferred => String::new(),
            NativeQuery::Statement { text } => text.clone(),
            NativeQuery::Search { plan } => plan.body.to_string(),
        }
    }

    /// Search plan, when the statement runs against the search backend
    pub fn search_plan(&self) -> Option<&SearchPlan> {
        match &self.native {
            NativeQuery::Search { plan } => Some(plan),
            _ => None,
        }
    }
}

/// Namespace a statement belongs to
pub fn classify(stmt: &Stmt) -> DqlResult<Namespace> {
    let ns = match stmt {
        Stmt::Query(q) => Namespace::from_code(&q.namespace)?,
        Stmt::Show(s) => Namespace::from_code(&s.namespace)?,
        Stmt::Lambda(l) => {
            Namespace::from_code(&l.left.namespace)?;
            for q in &l.right {
                Namespace::from_code(&q.namespace)?;
            }
            Namespace::Lambda
        }
        Stmt::OuterFuncs(_) => Namespace::OuterFunc,
        Stmt::DeleteFunc(_) => Namespace::DeleteFunc,
        Stmt::Func(_) => Namespace::Func,
    };
    Ok(ns)
}

fn is_bucket_aggregate(e: &Expr) -> bool {
    match e {
        Expr::Call(c) => BUCKET_AGGREGATES.contains(&c.name.to_lowercase().as_str()),
        _ => false,
    }
}

fn wrap_last(e: Expr) -> Expr {
    match e {
        Expr::Ident(_) | Expr::Str(_) => Expr::Call(Call::new("last", vec![e])),
        Expr::Binary { op, lhs, rhs } => Expr::binary(op, wrap_last(*lhs), wrap_last(*rhs)),
        Expr::Paren(inner) => Expr::Paren(Box::new(wrap_last(*inner))),
        Expr::Call(mut call) => {
            call.args = call.args.into_iter().map(wrap_last).collect();
            Expr::Call(call)
        }
        other => other,
    }
}

/// Copy of the query where a bucketed query without aggregates gets `last()`
/// around every field reference
pub fn with_default_aggregate(q: &DFQuery) -> DFQuery {
    let mut q = q.clone();
    let bucketed = q.interval_ms().is_some();
    if !bucketed || q.is_all_targets() || q.targets.iter().any(|t| is_bucket_aggregate(&t.expr))
    {
        return q;
    }
    for t in &mut q.targets {
        t.expr = wrap_last(std::mem::replace(&mut t.expr, Expr::Nil));
    }
    q
}

/// Inputs translation needs besides the statement
#[derive(Debug, Clone)]
pub struct TranslateContext {
    pub search: SearchLimits,
    pub now_ms: i64,
}

/// Classify and translate one statement
pub fn resolve(stmt: &Stmt, ctx: &TranslateContext) -> DqlResult<AstResult> {
    let namespace = classify(stmt)?;

    let (stmt, native) = match stmt {
        Stmt::Query(q) => {
            let q = with_default_aggregate(q);
            let native = if namespace == Namespace::Metric {
                NativeQuery::Statement {
                    text: influxql::translate_query(&q)?,
                }
            } else if namespace.is_document() {
                NativeQuery::Search {
                    plan: search::translate_query(&q, namespace, &ctx.search, ctx.now_ms)?,
                }
            } else {
                return Err(DqlError::NotImplemented(format!(
                    "select query on namespace {}",
                    namespace
                )));
            };
            (Stmt::Query(q), native)
        }
        Stmt::Show(s) => {
            let native = if namespace == Namespace::Metric {
                NativeQuery::Statement {
                    text: influxql::translate_show(s)?,
                }
            } else if namespace.is_document() {
                NativeQuery::Search {
                    plan: search::translate_show(s, namespace, ctx.now_ms)?,
                }
            } else {
                return Err(DqlError::NotImplemented(format!(
                    "show on namespace {}",
                    namespace
                )));
            };
            (Stmt::Show(s.clone()), native)
        }
        other => (other.clone(), NativeQuery::Deferred),
    };

    Ok(AstResult {
        stmt,
        namespace,
        native,
    })
}

/// Parses, parameterizes and resolves query texts
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    pub limits: QueryLimits,
    pub search: SearchLimits,
}

impl Compiler {
    pub fn new(limits: QueryLimits, search: SearchLimits) -> Self {
        Self { limits, search }
    }

    /// Compile one inbound query spec
    pub fn compile(&self, spec: &QuerySpec, now_ms: i64) -> DqlResult<Vec<AstResult>> {
        let params = ExtraParam::from_spec(spec, &self.limits)?;
        self.compile_with(&spec.query, &params, now_ms)
    }

    /// Compile query text with already-built parameters
    pub fn compile_with(
        &self,
        text: &str,
        params: &ExtraParam,
        now_ms: i64,
    ) -> DqlResult<Vec<AstResult>> {
        let mut stmts = parse_dql(text)?;
        if stmts.len() > MAX_PARSE_RESULTS {
            return Err(DqlError::TooManyQueries {
                max: MAX_PARSE_RESULTS,
                got: stmts.len(),
            });
        }

        let ctx = TranslateContext {
            search: self.search.clone(),
            now_ms,
        };
        stmts
            .iter_mut()
            .map(|stmt| {
                params.apply(stmt, now_ms)?;
                resolve(stmt, &ctx)
            })
            .collect()
    }

    /// Compile text that must hold exactly one statement
    pub fn compile_single(
        &self,
        text: &str,
        params: &ExtraParam,
        now_ms: i64,
    ) -> DqlResult<AstResult> {
        let mut results = self.compile_with(text, params, now_ms)?;
        if results.len() != 1 {
            return Err(DqlError::Parse(format!(
                "expected a single statement, got {}",
                results.len()
            )));
        }
        Ok(results.remove(0))
    }
}
