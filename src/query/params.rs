//! Per-request query parameters
//!
//! Each query spec in an inbound batch carries extras (time range, extra
//! conditions, ordering, paging) that are folded into every statement parsed
//! from its text.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::query::ast::*;
use crate::query::error::{DqlError, DqlResult};
use crate::query::parser::{parse_conditions, parse_duration};

/// One query in an inbound batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySpec {
    /// DQL text
    pub query: String,
    /// One or two unix millisecond timestamps
    pub time_range: Vec<i64>,
    /// Extra condition text, AND-ed into every query
    pub conditions: String,
    /// Point count used to resolve `auto` resolutions
    pub max_point: i64,
    /// Longest allowed time range, e.g. `30d`
    pub max_duration: String,
    /// `[{"time": "desc"}]`
    pub order_by: Vec<BTreeMap<String, String>>,
    pub limit: i64,
    pub offset: i64,
    pub disable_multiple_field: bool,
    pub disable_slimit: bool,
    pub search_after: Vec<serde_json::Value>,
    pub highlight: bool,
}

impl QuerySpec {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// Engine-wide bounds applied while folding parameters
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLimits {
    pub default_limit: i64,
    pub max_limit: i64,
    pub default_slimit: i64,
    pub max_slimit: i64,
    /// Default cap on the queried range, in ms
    pub max_duration_ms: Option<i64>,
    /// Point count for `auto` when neither the query nor the request gives one
    pub default_auto_points: i64,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            default_limit: 1000,
            max_limit: 10000,
            default_slimit: 20,
            max_slimit: 100,
            max_duration_ms: None,
            default_auto_points: 360,
        }
    }
}

/// Parameters folded into each parsed statement
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraParam {
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub conditions: Vec<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub default_limit: i64,
    pub max_limit: i64,
    /// `None` disables the default series limit
    pub default_slimit: Option<i64>,
    pub max_slimit: i64,
    pub single_target: bool,
    pub max_point: Option<i64>,
    pub default_auto_points: i64,
    pub max_duration_ms: Option<i64>,
    pub search_after: Option<Vec<serde_json::Value>>,
    pub highlight: bool,
}

impl Default for ExtraParam {
    fn default() -> Self {
        Self::from_limits(&QueryLimits::default())
    }
}

impl ExtraParam {
    /// Parameters that only carry the configured defaults
    pub fn from_limits(limits: &QueryLimits) -> Self {
        Self {
            start_ms: None,
            end_ms: None,
            conditions: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            default_limit: limits.default_limit,
            max_limit: limits.max_limit,
            default_slimit: Some(limits.default_slimit),
            max_slimit: limits.max_slimit,
            single_target: false,
            max_point: None,
            default_auto_points: limits.default_auto_points,
            max_duration_ms: limits.max_duration_ms,
            search_after: None,
            highlight: false,
        }
    }

    /// Build parameters from a request, validating what can be checked early
    pub fn from_spec(spec: &QuerySpec, limits: &QueryLimits) -> DqlResult<Self> {
        let mut order_by = Vec::new();
        for elem in &spec.order_by {
            for (column, direction) in elem {
                let direction = match direction.as_str() {
                    "asc" => OrderDirection::Asc,
                    "desc" => OrderDirection::Desc,
                    other => {
                        return Err(DqlError::Parse(format!(
                            "invalid orderby param, only accept asc and desc, got: {}",
                            other
                        )))
                    }
                };
                order_by.push(OrderBy {
                    column: column.clone(),
                    direction,
                });
            }
        }

        let max_duration_ms = if spec.max_duration.is_empty() {
            limits.max_duration_ms
        } else {
            Some(parse_duration(&spec.max_duration).map_err(|e| {
                DqlError::Parse(format!("parse max_duration failed: {}", e))
            })?)
        };

        if spec.limit < 0 || spec.offset < 0 {
            return Err(DqlError::parse("limit and offset must not be negative"));
        }

        Ok(Self {
            start_ms: spec.time_range.first().copied(),
            end_ms: spec.time_range.get(1).copied(),
            conditions: parse_conditions(&spec.conditions)?,
            order_by,
            limit: (spec.limit > 0).then_some(spec.limit),
            offset: (spec.offset > 0).then_some(spec.offset),
            default_limit: limits.default_limit,
            max_limit: limits.max_limit,
            default_slimit: (!spec.disable_slimit).then_some(limits.default_slimit),
            max_slimit: limits.max_slimit,
            single_target: spec.disable_multiple_field,
            max_point: (spec.max_point > 0).then_some(spec.max_point),
            default_auto_points: limits.default_auto_points,
            max_duration_ms,
            search_after: (!spec.search_after.is_empty()).then(|| spec.search_after.clone()),
            highlight: spec.highlight,
        })
    }

    /// Fold the parameters into one statement in place
    pub fn apply(&self, stmt: &mut Stmt, now_ms: i64) -> DqlResult<()> {
        match stmt {
            Stmt::Query(q) => self.apply_query(q, now_ms),
            Stmt::Show(s) => self.apply_show(s, now_ms),
            Stmt::Lambda(l) => {
                self.apply_query(&mut l.left, now_ms)?;
                for q in &mut l.right {
                    self.apply_query(q, now_ms)?;
                }
                Ok(())
            }
            // inner queries pick the parameters up when they are parsed
            Stmt::OuterFuncs(_) | Stmt::DeleteFunc(_) | Stmt::Func(_) => Ok(()),
        }
    }

    fn apply_query(&self, q: &mut DFQuery, now_ms: i64) -> DqlResult<()> {
        q.time_range = self.resolve_time_range(q.time_range, now_ms)?;
        q.conditions.extend(self.conditions.iter().cloned());

        if q.order_by.is_empty() {
            q.order_by = self.order_by.clone();
        }

        if let Some(limit) = self.limit {
            q.limit = Some(limit);
        }
        let limit = q.limit.unwrap_or(self.default_limit);
        if limit < 0 || limit > self.max_limit {
            return Err(DqlError::Parse(format!(
                "query max limit size is {}, but you set {}",
                self.max_limit, limit
            )));
        }
        q.limit = Some(limit);

        if let Some(offset) = self.offset {
            q.offset = Some(offset);
        }

        let is_metric = matches!(Namespace::from_code(&q.namespace), Ok(Namespace::Metric));
        match q.slimit {
            Some(n) if n > self.max_slimit => {
                return Err(DqlError::Parse(format!(
                    "max slimit is {}, but you set {}",
                    self.max_slimit, n
                )))
            }
            None if is_metric && !q.group_by.is_empty() => q.slimit = self.default_slimit,
            _ => {}
        }

        if self.single_target && q.targets.len() > 1 {
            return Err(DqlError::parse("only one target is allowed in this query"));
        }

        if self.search_after.is_some() {
            q.search_after = self.search_after.clone();
        }
        q.highlight = self.highlight;
        Ok(())
    }

    fn apply_show(&self, s: &mut Show, now_ms: i64) -> DqlResult<()> {
        s.time_range = self.resolve_time_range(s.time_range, now_ms)?;
        s.conditions.extend(self.conditions.iter().cloned());
        if let Some(limit) = self.limit {
            s.limit = Some(limit);
        }
        if let Some(offset) = self.offset {
            s.offset = Some(offset);
        }
        Ok(())
    }

    /// Turn relative bounds and `auto` resolutions into absolute values
    fn resolve_time_range(
        &self,
        declared: Option<TimeRange>,
        now_ms: i64,
    ) -> DqlResult<Option<TimeRange>> {
        let mut tr = declared.unwrap_or_default();

        if tr.start.is_none() && tr.end.is_none() {
            tr.start = self.start_ms.map(TimeBound::Absolute);
            tr.end = self.end_ms.map(TimeBound::Absolute);
        }

        let start = tr.start.map(|b| b.to_millis(now_ms));
        let end = match (tr.start, tr.end) {
            (_, Some(b)) => Some(b.to_millis(now_ms)),
            (Some(_), None) => Some(now_ms),
            (None, None) => None,
        };

        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(DqlError::Parse(format!(
                    "time range start {} is after end {}",
                    s, e
                )));
            }
            if let Some(max) = self.max_duration_ms {
                if e - s > max {
                    return Err(DqlError::Parse(format!(
                        "time range {}ms exceeds max duration {}ms",
                        e - s,
                        max
                    )));
                }
            }
        }

        tr.start = start.map(TimeBound::Absolute);
        tr.end = end.map(TimeBound::Absolute);

        if let Some(Resolution::Auto(points)) = tr.resolution {
            let (s, e) = match (start, end) {
                (Some(s), Some(e)) => (s, e),
                _ => {
                    return Err(DqlError::parse(
                        "auto resolution requires a time range",
                    ))
                }
            };
            let points = points
                .or(self.max_point)
                .unwrap_or(self.default_auto_points)
                .max(1);
            tr.resolution = Some(Resolution::Interval(((e - s) / points).max(1)));
        }

        if tr == TimeRange::default() {
            Ok(None)
        } else {
            Ok(Some(tr))
        }
    }
}
