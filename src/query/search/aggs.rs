//! Aggregation sub-compiler
//!
//! Aggregations nest outside in: one `terms` bucket per `BY` field, then the
//! `time` date histogram, then an optional numeric histogram, with metric
//! aggregations at the leaves. Names chosen here are what the normalizer
//! reads back as tags and columns.

use serde_json::{json, Map, Value as Json};

use super::{Helper, NamespaceMeta, SearchLimits, TIME_COLUMN};
use crate::query::ast::*;
use crate::query::error::{DqlError, DqlResult};

/// Functions that make a target an aggregation
pub const AGGREGATE_FUNCS: &[&str] = &[
    "avg",
    "bottom",
    "count",
    "count_distinct",
    "distinct",
    "first",
    "histogram",
    "last",
    "max",
    "min",
    "percentile",
    "sum",
    "top",
];

/// Whether a target expression is an aggregate call
pub fn is_aggregate(e: &Expr) -> bool {
    match e {
        Expr::Call(c) => AGGREGATE_FUNCS.contains(&c.name.to_lowercase().as_str()),
        _ => false,
    }
}

struct Histogram {
    name: String,
    field: String,
    start: f64,
    end: f64,
    interval: f64,
    min_doc: i64,
}

struct Metric {
    name: String,
    body: Json,
    /// Source field read back from top_hits
    hit_field: Option<String>,
    /// The key of this bucket aggregation is a value column
    column_bucket: bool,
    first_last: bool,
}

/// Shape of the aggregation a query needs
pub(super) struct AggPlan {
    groups: Vec<String>,
    /// Plain targets naming a group field
    group_targets: Vec<String>,
    date_histogram: Option<i64>,
    histogram: Option<Histogram>,
    metrics: Vec<Metric>,
    /// Fields that must exist for top-hits functions
    exists: Vec<String>,
}

/// Aggregation JSON plus query filters it requires
pub(super) struct BuiltAggs {
    pub aggs: Json,
    pub filters: Vec<Json>,
}

fn field_arg(call: &Call, idx: usize) -> DqlResult<String> {
    call.args
        .get(idx)
        .and_then(|e| match e {
            Expr::Star => Some("*"),
            other => other.as_name(),
        })
        .map(|s| s.to_string())
        .ok_or_else(|| {
            DqlError::Parse(format!("{}() requires a field name argument", call.name))
        })
}

fn number_arg(call: &Call, idx: usize, what: &str) -> DqlResult<f64> {
    call.args.get(idx).and_then(|e| e.as_number()).ok_or_else(|| {
        DqlError::Parse(format!("{}() requires a numeric {}", call.name, what))
    })
}

fn unique_name(metrics: &[Metric], name: String) -> String {
    let taken = |n: &str| metrics.iter().any(|m| m.name == n);
    if !taken(&name) {
        return name;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}_{}", name, n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn metric(call: &Call, name: String, meta: &NamespaceMeta, limit: i64) -> DqlResult<Metric> {
    let fname = call.name.to_lowercase();
    let simple = |body: Json| Metric {
        name: name.clone(),
        body,
        hit_field: None,
        column_bucket: false,
        first_last: false,
    };
    let top_hits = |field: String, sort_field: &str, order: &str, size: i64, first_last: bool| {
        Metric {
            name: name.clone(),
            body: json!({"top_hits": {
                "size": size,
                "sort": [{ sort_field: {"order": order} }],
                "_source": {"includes": [field.clone(), meta.time_field]},
            }}),
            hit_field: Some(field),
            column_bucket: false,
            first_last,
        }
    };

    match fname.as_str() {
        "avg" | "sum" | "min" | "max" => {
            let field = field_arg(call, 0)?;
            Ok(simple(json!({ fname.as_str(): {"field": field} })))
        }
        "count" => {
            let field = field_arg(call, 0)?;
            let field = if field == "*" {
                meta.time_field.to_string()
            } else {
                meta.keyword_field(&field)
            };
            Ok(simple(json!({"value_count": {"field": field}})))
        }
        "count_distinct" => {
            let field = meta.keyword_field(&field_arg(call, 0)?);
            Ok(simple(json!({"cardinality": {"field": field}})))
        }
        "distinct" => {
            let field = meta.keyword_field(&field_arg(call, 0)?);
            Ok(Metric {
                column_bucket: true,
                ..simple(json!({"terms": {"field": field, "size": limit}}))
            })
        }
        "percentile" => {
            let field = field_arg(call, 0)?;
            let p = number_arg(call, 1, "percent")?;
            if !(0.0..=100.0).contains(&p) {
                return Err(DqlError::Parse(format!(
                    "percentile must be between 0 and 100, got {}",
                    p
                )));
            }
            Ok(simple(json!({"percentiles": {"field": field, "percents": [p]}})))
        }
        "top" | "bottom" => {
            let field = field_arg(call, 0)?;
            let n = call.args.get(1).and_then(|e| e.as_int()).ok_or_else(|| {
                DqlError::Parse(format!("{}() requires an integer size", fname))
            })?;
            if n <= 0 {
                return Err(DqlError::Parse(format!(
                    "{}() size must be positive, got {}",
                    fname, n
                )));
            }
            let order = if fname == "top" { "desc" } else { "asc" };
            let sort_field = field.clone();
            Ok(top_hits(field, &sort_field, order, n, false))
        }
        "first" | "last" => {
            let field = field_arg(call, 0)?;
            let order = if fname == "first" { "asc" } else { "desc" };
            Ok(top_hits(field, meta.time_field, order, 1, true))
        }
        other => Err(DqlError::NotImplemented(format!(
            "aggregate function `{}' for search",
            other
        ))),
    }
}

fn histogram(call: &Call, name: String) -> DqlResult<Histogram> {
    let field = field_arg(call, 0)?;
    let start = number_arg(call, 1, "start")?;
    let end = number_arg(call, 2, "end")?;
    let interval = number_arg(call, 3, "interval")?;
    if interval <= 0.0 || start >= end {
        return Err(DqlError::parse(
            "histogram() requires start < end and a positive interval",
        ));
    }
    let min_doc = call.args.get(4).and_then(|e| e.as_int()).unwrap_or(0);
    Ok(Histogram {
        name,
        field,
        start,
        end,
        interval,
        min_doc,
    })
}

/// Work out the aggregation shape; `None` for plain hit queries
pub(super) fn plan(
    q: &DFQuery,
    meta: &NamespaceMeta,
    limits: &SearchLimits,
) -> DqlResult<Option<AggPlan>> {
    let has_aggregate = q.targets.iter().any(|t| is_aggregate(&t.expr));
    if !has_aggregate && q.group_by.is_empty() {
        return Ok(None);
    }

    if q.group_by.len() > limits.max_bucket_depth {
        return Err(DqlError::Parse(format!(
            "at most {} group by fields are allowed",
            limits.max_bucket_depth
        )));
    }
    let mut groups: Vec<String> = Vec::new();
    for g in &q.group_by {
        if groups.contains(g) {
            return Err(DqlError::parse("each field can only be grouped once"));
        }
        groups.push(g.clone());
    }

    let limit = q.limit.unwrap_or(limits.default_group_size);
    let mut metrics: Vec<Metric> = Vec::new();
    let mut group_targets = Vec::new();
    let mut hist = None;
    let mut exists = Vec::new();

    for target in &q.targets {
        match &target.expr {
            Expr::Star => {}
            Expr::Call(call) if call.name.eq_ignore_ascii_case("histogram") => {
                if hist.is_some() {
                    return Err(DqlError::parse("only one histogram() is allowed"));
                }
                hist = Some(histogram(call, target.column_name())?);
            }
            Expr::Call(call) if is_aggregate(&target.expr) => {
                let name = unique_name(&metrics, target.column_name());
                let m = metric(call, name, meta, limit)?;
                if let Some(field) = &m.hit_field {
                    exists.push(field.clone());
                }
                metrics.push(m);
            }
            other => match other.as_name() {
                Some(field) if groups.iter().any(|g| g == field) => {
                    group_targets.push(field.to_string())
                }
                _ => {
                    return Err(DqlError::Parse(format!(
                        "`{}' must be an aggregate function or a group by field",
                        other
                    )))
                }
            },
        }
    }

    let date_histogram = match q.interval_ms() {
        Some(interval) => {
            let tr = q.time_range.as_ref();
            if let (Some(start), Some(end)) = (
                tr.and_then(|t| t.start_ms()),
                tr.and_then(|t| t.end_ms()),
            ) {
                if (end - start) / interval >= limits.max_buckets {
                    return Err(DqlError::Parse(format!(
                        "too many time buckets, at most {} are allowed",
                        limits.max_buckets
                    )));
                }
            }
            Some(interval)
        }
        None => None,
    };

    Ok(Some(AggPlan {
        groups,
        group_targets,
        date_histogram,
        histogram: hist,
        metrics,
        exists,
    }))
}

fn with_sub_aggs(mut agg: Map<String, Json>, sub: Map<String, Json>) -> Json {
    if !sub.is_empty() {
        agg.insert("aggs".into(), Json::Object(sub));
    }
    Json::Object(agg)
}

impl AggPlan {
    pub(super) fn build(
        self,
        q: &DFQuery,
        meta: &NamespaceMeta,
        limits: &SearchLimits,
        helper: &mut Helper,
    ) -> DqlResult<BuiltAggs> {
        let limit = q.limit.unwrap_or(limits.default_group_size);
        let offset = q.offset.unwrap_or(0);
        if limit + offset > limits.max_group_size {
            return Err(DqlError::Parse(format!(
                "aggs max limit size is {}",
                limits.max_group_size
            )));
        }
        helper.aggs_from = offset.max(0) as usize;

        let has_hits = self.metrics.iter().any(|m| m.hit_field.is_some());
        if self.date_histogram.is_some() || has_hits {
            helper.sort_fields.push(TIME_COLUMN.to_string());
        }

        let mut filters: Vec<Json> = self
            .exists
            .iter()
            .map(|f| json!({"exists": {"field": f}}))
            .collect();

        let mut inner = Map::new();
        for target in &q.targets {
            let name = target.column_name();
            if self.histogram.as_ref().is_some_and(|h| h.name == name)
                || self.metrics.iter().any(|m| m.name == name)
            {
                if !helper.sort_fields.contains(&name) {
                    helper.sort_fields.push(name);
                }
            }
        }
        if self.metrics.is_empty() && self.histogram.is_none() && self.date_histogram.is_none() {
            helper.sort_fields.extend(self.group_targets.iter().cloned());
        }

        for m in &self.metrics {
            if let Some(field) = &m.hit_field {
                helper.hit_fields.insert(m.name.clone(), field.clone());
            }
            if m.first_last {
                helper.fl_func_count += 1;
            }
            if m.column_bucket {
                helper.column_buckets.push(m.name.clone());
            }
            inner.insert(m.name.clone(), m.body.clone());
        }

        if let Some(h) = &self.histogram {
            let mut agg = Map::new();
            agg.insert(
                "histogram".into(),
                json!({
                    "field": h.field,
                    "interval": h.interval,
                    "min_doc_count": h.min_doc,
                    "extended_bounds": {"min": h.start, "max": h.end},
                }),
            );
            let mut wrapped = Map::new();
            wrapped.insert(h.name.clone(), with_sub_aggs(agg, inner));
            inner = wrapped;
            helper.column_buckets.push(h.name.clone());
            filters.push(json!({"range": { h.field.clone(): {"gte": h.start, "lte": h.end} }}));
        }

        if let Some(interval) = self.date_histogram {
            let mut spec = Map::new();
            spec.insert("field".into(), json!(meta.time_field));
            spec.insert("fixed_interval".into(), json!(format!("{}ms", interval)));
            spec.insert("min_doc_count".into(), json!(0));
            if let (Some(min), Some(max)) = (helper.start_time, helper.end_time) {
                spec.insert("extended_bounds".into(), json!({"min": min, "max": max}));
            }
            let mut agg = Map::new();
            agg.insert("date_histogram".into(), Json::Object(spec));
            let mut wrapped = Map::new();
            wrapped.insert(TIME_COLUMN.to_string(), with_sub_aggs(agg, inner));
            inner = wrapped;
            helper.column_buckets.push(TIME_COLUMN.to_string());
        }

        let innermost = self.groups.len().saturating_sub(1);
        for (level, group) in self.groups.iter().enumerate().rev() {
            let mut terms = Map::new();
            terms.insert("field".into(), json!(meta.keyword_field(group)));
            terms.insert("size".into(), json!(limit + offset));
            if let Some(order) = q.order_by.first() {
                let dir = match order.direction {
                    OrderDirection::Asc => "asc",
                    OrderDirection::Desc => "desc",
                };
                if &order.column == group {
                    terms.insert("order".into(), json!({"_key": dir}));
                } else if level == innermost
                    && self.date_histogram.is_none()
                    && self
                        .metrics
                        .iter()
                        .any(|m| m.name == order.column && m.hit_field.is_none() && !m.column_bucket)
                {
                    terms.insert("order".into(), json!({ order.column.clone(): dir }));
                }
            }
            let mut agg = Map::new();
            agg.insert("terms".into(), Json::Object(terms));
            let mut wrapped = Map::new();
            wrapped.insert(group.clone(), with_sub_aggs(agg, inner));
            inner = wrapped;
        }

        Ok(BuiltAggs {
            aggs: Json::Object(inner),
            filters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::{translate_query, SearchLimits};
    use super::*;
    use crate::query::parser::parse_dql;

    fn plan_for(text: &str, range: Option<(i64, i64, i64)>) -> DqlResult<super::super::SearchPlan> {
        let mut q = match parse_dql(text).unwrap().remove(0) {
            Stmt::Query(q) => q,
            other => panic!("unexpected {:?}", other),
        };
        if let Some((start, end, interval)) = range {
            q.time_range = Some(TimeRange {
                start: Some(TimeBound::Absolute(start)),
                end: Some(TimeBound::Absolute(end)),
                resolution: Some(Resolution::Interval(interval)),
            });
        }
        let ns = Namespace::from_code(&q.namespace).unwrap();
        translate_query(&q, ns, &SearchLimits::default(), 0)
    }

    #[test]
    fn test_group_by_with_metric() {
        let plan = plan_for("L::nginx:(count(status)) BY host LIMIT 5 OFFSET 2", None).unwrap();
        assert_eq!(plan.body["size"], json!(0));
        assert_eq!(
            plan.body["aggs"],
            json!({"host": {
                "terms": {"field": "host", "size": 7},
                "aggs": {"count(status)": {"value_count": {"field": "status"}}}
            }})
        );
        assert!(plan.helper.is_aggs);
        assert_eq!(plan.helper.aggs_from, 2);
        assert_eq!(plan.helper.sort_fields, vec!["count(status)"]);
        assert!(plan.body.get("track_total_hits").is_none());
    }

    #[test]
    fn test_date_histogram_nesting() {
        let plan = plan_for(
            "L::nginx:(avg(latency) AS lat) BY host",
            Some((0, 600_000, 60_000)),
        )
        .unwrap();
        let host = &plan.body["aggs"]["host"];
        let time = &host["aggs"]["time"];
        assert_eq!(time["date_histogram"]["fixed_interval"], json!("60000ms"));
        assert_eq!(time["date_histogram"]["field"], json!("date"));
        assert_eq!(time["aggs"]["lat"], json!({"avg": {"field": "latency"}}));
        assert_eq!(plan.helper.sort_fields, vec!["time", "lat"]);
        assert!(plan.helper.has_date_histogram());
    }

    #[test]
    fn test_too_many_buckets() {
        assert!(plan_for("L::nginx:(count(a))", Some((0, 100_000_000, 1))).is_err());
    }

    #[test]
    fn test_first_last_use_top_hits() {
        let plan = plan_for("O::host:(first(cpu), last(mem))", None).unwrap();
        let aggs = &plan.body["aggs"];
        assert_eq!(
            aggs["first(cpu)"]["top_hits"]["sort"],
            json!([{"last_update_time": {"order": "asc"}}])
        );
        assert_eq!(aggs["last(mem)"]["top_hits"]["size"], json!(1));
        assert_eq!(plan.helper.fl_func_count, 2);
        assert_eq!(plan.helper.hit_fields.get("last(mem)"), Some(&"mem".to_string()));
        assert_eq!(plan.helper.sort_fields, vec!["time", "first(cpu)", "last(mem)"]);

        let must = plan.body["query"]["bool"]["must"].as_array().unwrap();
        assert!(must.contains(&json!({"exists": {"field": "cpu"}})));
    }

    #[test]
    fn test_group_field_rules() {
        assert!(plan_for("L::nginx:(count(a)) BY host, host", None).is_err());
        assert!(plan_for("L::nginx:(count(a)) BY a, b, c, d", None).is_err());
        assert!(plan_for("L::nginx:(status, count(a)) BY host", None).is_err());

        let plan = plan_for("L::nginx:(host) BY host", None).unwrap();
        assert_eq!(plan.helper.sort_fields, vec!["host"]);
        assert_eq!(
            plan.body["aggs"],
            json!({"host": {"terms": {"field": "host", "size": 10}}})
        );
    }

    #[test]
    fn test_text_field_group_uses_keyword() {
        let plan = plan_for("E::monitor:(count(*)) BY title", None).unwrap();
        assert_eq!(plan.body["aggs"]["title"]["terms"]["field"], json!("title.keyword"));
        assert_eq!(
            plan.body["aggs"]["title"]["aggs"]["count(*)"],
            json!({"value_count": {"field": "date"}})
        );
    }

    #[test]
    fn test_histogram_adds_range_filter() {
        let plan = plan_for("L::nginx:(histogram(latency, 0, 100, 10))", None).unwrap();
        let name = "histogram(latency, 0, 100, 10)";
        assert_eq!(plan.body["aggs"][name]["histogram"]["interval"], json!(10.0));
        assert_eq!(plan.helper.column_buckets, vec![name.to_string()]);
        let must = plan.body["query"]["bool"]["must"].as_array().unwrap();
        assert!(must.contains(&json!({"range": {"latency": {"gte": 0.0, "lte": 100.0}}})));
    }

    #[test]
    fn test_aggs_limit_checked() {
        assert!(plan_for("L::nginx:(count(a)) BY host LIMIT 20000", None).is_err());
    }
}
