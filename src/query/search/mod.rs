//! Search dialect translator
//!
//! Compiles document-namespace statements into a JSON search body plus a
//! [`Helper`] describing how to turn the backend response back into rows.
//!
//! # Supported Syntax
//!
//! ```text
//! L::nginx:(message, status) {status >= 500} [1h] LIMIT 10
//! L::nginx:(count(status)) [1h::5m] BY host
//! O::host:(last(cpu)) {message = match('oom')}
//! show_logging_source()
//! show_logging_field()
//! ```

mod aggs;
mod query;

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};

use crate::query::ast::*;
use crate::query::error::{DqlError, DqlResult};

pub use query::ClauseBuilder;

/// Name of the canonical time column in results
pub const TIME_COLUMN: &str = "time";

/// Suffix of the keyword sub-field of text fields
pub const KEYWORD_SUFFIX: &str = ".keyword";

/// Name of the bucket aggregation used by class listings
pub const SHOW_AGG: &str = "aggs1";

/// Static field metadata of one document namespace
#[derive(Debug, Clone, Copy)]
pub struct NamespaceMeta {
    pub namespace: Namespace,
    pub class_field: &'static str,
    pub time_field: &'static str,
    text_fields: TextFields,
}

/// RUM text fields are any field ending in `message` or `stack`
static RUM_TEXT_FIELD: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(".*(message|stack)$").ok());

#[derive(Debug, Clone, Copy)]
enum TextFields {
    List(&'static [&'static str]),
    Pattern(&'static Lazy<Option<Regex>>),
}

impl NamespaceMeta {
    pub fn for_namespace(ns: Namespace) -> DqlResult<Self> {
        let (class_field, time_field, text_fields) = match ns {
            Namespace::Object => ("class", "last_update_time", TextFields::List(&["message"])),
            Namespace::Logging => ("source", "date", TextFields::List(&["message"])),
            Namespace::BackupLogging => ("source", "date", TextFields::List(&["message"])),
            Namespace::Event => ("source", "date", TextFields::List(&["message", "title"])),
            Namespace::Tracing => ("service", "date", TextFields::List(&["message"])),
            Namespace::Rum => ("source", "date", TextFields::Pattern(&RUM_TEXT_FIELD)),
            Namespace::Security => ("category", "date", TextFields::List(&["message", "title"])),
            other => {
                return Err(DqlError::query(format!(
                    "namespace {} has no search index",
                    other
                )))
            }
        };
        Ok(Self {
            namespace: ns,
            class_field,
            time_field,
            text_fields,
        })
    }

    /// Whether the field is analyzed text and needs the keyword sub-field
    pub fn is_text_field(&self, field: &str) -> bool {
        match self.text_fields {
            TextFields::List(fields) => fields.contains(&field),
            TextFields::Pattern(pattern) => pattern
                .as_ref()
                .map(|re| re.is_match(field))
                .unwrap_or(false),
        }
    }

    /// Field name to use in terms queries and bucket aggregations
    pub fn keyword_field(&self, field: &str) -> String {
        if self.is_text_field(field) {
            format!("{}{}", field, KEYWORD_SUFFIX)
        } else {
            field.to_string()
        }
    }

    /// Column holding the document time in raw hits
    pub fn time_column(&self) -> &'static str {
        if self.namespace == Namespace::Object {
            self.time_field
        } else {
            TIME_COLUMN
        }
    }
}

/// Bounds checked while translating document queries
#[derive(Debug, Clone, PartialEq)]
pub struct SearchLimits {
    /// Largest `limit` for plain hit queries
    pub max_limit: i64,
    /// Largest `offset + limit` for plain hit queries
    pub max_offset: i64,
    /// Largest bucket count per terms aggregation
    pub max_group_size: i64,
    /// Deepest `BY` nesting
    pub max_bucket_depth: usize,
    /// Largest number of date histogram buckets
    pub max_buckets: i64,
    /// Default group count for terms aggregations
    pub default_group_size: i64,
    /// Hit count when the query sets no limit
    pub default_limit: i64,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            max_limit: 10000,
            max_offset: 10000,
            max_group_size: 10000,
            max_bucket_depth: 3,
            max_buckets: 10000,
            default_group_size: 10,
            default_limit: 1000,
        }
    }
}

/// What a document show statement lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShowKind {
    /// Distinct class values
    Classes,
    /// Field mappings of the index
    Fields,
}

/// Translation metadata needed to interpret the search response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Helper {
    pub namespace: Namespace,
    /// Raw column name to result column name
    pub alias: BTreeMap<String, String>,
    /// Class names the query selected, joined for the row name
    pub class_names: String,
    /// Requested column order
    pub sort_fields: Vec<String>,
    /// Number of first/last functions
    pub fl_func_count: usize,
    pub time_field: String,
    pub highlight_fields: Vec<String>,
    /// Rows skipped after aggregation
    pub aggs_from: usize,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub is_aggs: bool,
    /// Bucket aggregations whose key is a value column rather than a tag
    pub column_buckets: Vec<String>,
    /// top_hits aggregation name to the source field it selects
    pub hit_fields: BTreeMap<String, String>,
    pub show: Option<ShowKind>,
}

impl Helper {
    pub fn new(meta: &NamespaceMeta) -> Self {
        Self {
            namespace: meta.namespace,
            alias: BTreeMap::new(),
            class_names: String::new(),
            sort_fields: Vec::new(),
            fl_func_count: 0,
            time_field: meta.time_field.to_string(),
            highlight_fields: Vec::new(),
            aggs_from: 0,
            start_time: None,
            end_time: None,
            is_aggs: false,
            column_buckets: Vec::new(),
            hit_fields: BTreeMap::new(),
            show: None,
        }
    }

    /// Whether any date histogram bucket was requested
    pub fn has_date_histogram(&self) -> bool {
        self.column_buckets.iter().any(|b| b == TIME_COLUMN)
    }
}

/// Search request body plus its helper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPlan {
    /// `Json::Null` for mapping lookups, which need no body
    pub body: Json,
    pub helper: Helper,
}

/// Strip the keyword suffix and any object path from a field name
pub fn format_alias_field(field: &str) -> String {
    let parts: Vec<&str> = field.split('.').collect();
    match parts.as_slice() {
        [.., parent, "keyword"] => parent.to_string(),
        [.., last] => last.to_string(),
        [] => field.to_string(),
    }
}

fn class_names(sources: &[Source]) -> String {
    sources
        .iter()
        .map(|s| s.text().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// `bool.should` over the class field; `None` when every class matches
fn class_filter(meta: &NamespaceMeta, sources: &[Source]) -> Option<Json> {
    if let [Source::Regex(re)] = sources {
        if re == ".*" {
            return None;
        }
    }
    if sources.is_empty() {
        return None;
    }
    let should: Vec<Json> = sources
        .iter()
        .map(|s| match s {
            Source::Name(name) => json!({"term": {meta.class_field: {"value": name}}}),
            Source::Regex(re) => json!({"regexp": {meta.class_field: {"value": re}}}),
        })
        .collect();
    Some(json!({"bool": {"should": should}}))
}

/// Time range clause; objects without a range look at the last five minutes
fn time_filter(
    meta: &NamespaceMeta,
    tr: Option<&TimeRange>,
    helper: &mut Helper,
    now_ms: i64,
) -> Option<Json> {
    let (start, end) = match tr {
        Some(tr) if tr.start_ms().is_some() || tr.end_ms().is_some() => {
            (tr.start_ms(), tr.end_ms())
        }
        _ if meta.namespace == Namespace::Object => (Some(now_ms - 5 * 60 * 1000), Some(now_ms)),
        _ => return None,
    };
    let start = start.unwrap_or(now_ms);
    let end = end.unwrap_or(now_ms);
    helper.start_time = Some(start);
    helper.end_time = Some(end);
    Some(json!({
        "range": {meta.time_field: {"gte": start, "lte": end, "format": "epoch_millis"}}
    }))
}

/// Map alias names used in conditions back to the fields they stand for
fn alias_fields(q: &DFQuery) -> BTreeMap<String, String> {
    q.targets
        .iter()
        .filter_map(|t| match (&t.alias, t.expr.as_name()) {
            (Some(alias), Some(field)) => Some((alias.clone(), field.to_string())),
            _ => None,
        })
        .collect()
}

/// Translate a document select query
pub fn translate_query(
    q: &DFQuery,
    ns: Namespace,
    limits: &SearchLimits,
    now_ms: i64,
) -> DqlResult<SearchPlan> {
    let meta = NamespaceMeta::for_namespace(ns)?;
    let mut helper = Helper::new(&meta);
    helper.class_names = class_names(&q.sources);

    let agg_plan = aggs::plan(q, &meta, limits)?;
    helper.is_aggs = agg_plan.is_some();

    let aliases = alias_fields(q);
    let mut clauses = ClauseBuilder::new(&meta, &aliases, q.highlight && !helper.is_aggs);

    let mut must = Vec::new();
    must.extend(class_filter(&meta, &q.sources));
    must.extend(time_filter(&meta, q.time_range.as_ref(), &mut helper, now_ms));
    for cond in &q.conditions {
        must.push(clauses.clause(cond)?);
    }

    let mut body = Map::new();
    match agg_plan {
        Some(plan) => {
            let built = plan.build(q, &meta, limits, &mut helper)?;
            must.extend(built.filters);
            body.insert("aggs".into(), built.aggs);
            body.insert("size".into(), json!(0));
        }
        None => {
            let limit = q.limit.unwrap_or(limits.default_limit);
            let offset = q.offset.unwrap_or(0);
            if limit > limits.max_limit {
                return Err(DqlError::Parse(format!(
                    "query max limit size is {}",
                    limits.max_limit
                )));
            }
            if offset + limit > limits.max_offset {
                return Err(DqlError::Parse(format!(
                    "query max offset size is {}, got {}",
                    limits.max_offset,
                    offset + limit
                )));
            }

            if !q.is_all_targets() {
                helper.sort_fields.push(meta.time_column().to_string());
                let mut source = vec![meta.time_column().to_string()];
                for t in &q.targets {
                    let field = t.expr.as_name().ok_or_else(|| {
                        DqlError::Parse(format!(
                            "`{}' must be a field name or an aggregate function",
                            t.expr
                        ))
                    })?;
                    if !helper.sort_fields.iter().any(|f| f == field) {
                        helper.sort_fields.push(field.to_string());
                        source.push(field.to_string());
                    }
                    if let Some(alias) = &t.alias {
                        helper.alias.insert(format_alias_field(field), alias.clone());
                    }
                }
                body.insert("_source".into(), json!(source));
            }

            body.insert("size".into(), json!(limit));
            if offset > 0 && q.search_after.is_none() {
                body.insert("from".into(), json!(offset));
            }
            body.insert("sort".into(), sort_clause(q, &meta, &aliases));
            body.insert("track_total_hits".into(), json!(true));
            if let Some(after) = &q.search_after {
                body.insert("search_after".into(), json!(after));
            }
        }
    }

    if meta.namespace == Namespace::Object {
        helper
            .alias
            .insert(meta.time_field.to_string(), TIME_COLUMN.to_string());
    }

    helper.highlight_fields = clauses.into_highlight_fields();
    if !helper.highlight_fields.is_empty() {
        let fields: Map<String, Json> = helper
            .highlight_fields
            .iter()
            .map(|f| (f.clone(), json!({"fragment_size": 1_000_000})))
            .collect();
        body.insert("highlight".into(), json!({ "fields": fields }));
    }

    if !must.is_empty() {
        body.insert("query".into(), json!({"bool": {"must": must}}));
    }

    Ok(SearchPlan {
        body: Json::Object(body),
        helper,
    })
}

/// Sort clause for hit queries; newest first unless ordered explicitly
fn sort_clause(q: &DFQuery, meta: &NamespaceMeta, aliases: &BTreeMap<String, String>) -> Json {
    if q.order_by.is_empty() {
        return json!([{meta.time_field: {"order": "desc"}}]);
    }
    let sorts: Vec<Json> = q
        .order_by
        .iter()
        .map(|o| {
            let column = aliases.get(&o.column).unwrap_or(&o.column);
            let field = if column == TIME_COLUMN {
                meta.time_field.to_string()
            } else {
                meta.keyword_field(column)
            };
            let dir = match o.direction {
                OrderDirection::Asc => "asc",
                OrderDirection::Desc => "desc",
            };
            json!({ field: {"order": dir} })
        })
        .collect();
    Json::Array(sorts)
}

/// Translate a document query into a delete-by-query body
pub fn translate_delete(
    q: &DFQuery,
    ns: Namespace,
    limits: &SearchLimits,
    now_ms: i64,
) -> DqlResult<Json> {
    let stripped = DFQuery {
        targets: Vec::new(),
        group_by: Vec::new(),
        order_by: Vec::new(),
        ..q.clone()
    };
    let plan = translate_query(&stripped, ns, limits, now_ms)?;
    let query = plan
        .body
        .get("query")
        .cloned()
        .unwrap_or_else(|| json!({"match_all": {}}));
    Ok(json!({ "query": query }))
}

/// Body deleting every document of an index
pub fn match_all_delete() -> Json {
    json!({"query": {"match_all": {}}})
}

/// Translate a document show statement
pub fn translate_show(s: &Show, ns: Namespace, now_ms: i64) -> DqlResult<SearchPlan> {
    let meta = NamespaceMeta::for_namespace(ns)?;
    let mut helper = Helper::new(&meta);

    if s.is_field_listing() {
        helper.show = Some(ShowKind::Fields);
        return Ok(SearchPlan {
            body: Json::Null,
            helper,
        });
    }
    helper.show = Some(ShowKind::Classes);

    let aliases = BTreeMap::new();
    let mut clauses = ClauseBuilder::new(&meta, &aliases, false);
    let mut must = Vec::new();
    must.extend(time_filter(&meta, s.time_range.as_ref(), &mut helper, now_ms));
    for cond in &s.conditions {
        must.push(clauses.clause(cond)?);
    }

    let size = s.limit.unwrap_or(1000) + s.offset.unwrap_or(0);
    helper.aggs_from = s.offset.unwrap_or(0).max(0) as usize;

    let mut body = Map::new();
    body.insert("size".into(), json!(0));
    body.insert(
        "aggs".into(),
        json!({ SHOW_AGG: {"terms": {"field": meta.class_field, "size": size}} }),
    );
    if !must.is_empty() {
        body.insert("query".into(), json!({"bool": {"must": must}}));
    }
    Ok(SearchPlan {
        body: Json::Object(body),
        helper,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse_dql;

    const NOW: i64 = 1_700_000_000_000;

    fn query(text: &str) -> (DFQuery, Namespace) {
        match parse_dql(text).unwrap().remove(0) {
            Stmt::Query(q) => {
                let ns = Namespace::from_code(&q.namespace).unwrap();
                (q, ns)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn translate(text: &str) -> SearchPlan {
        let (q, ns) = query(text);
        translate_query(&q, ns, &SearchLimits::default(), NOW).unwrap()
    }

    #[test]
    fn test_text_fields() {
        let event = NamespaceMeta::for_namespace(Namespace::Event).unwrap();
        assert_eq!(event.keyword_field("title"), "title.keyword");
        assert_eq!(event.keyword_field("host"), "host");

        let rum = NamespaceMeta::for_namespace(Namespace::Rum).unwrap();
        assert!(rum.is_text_field("error_stack"));
        assert!(!rum.is_text_field("stack_size"));

        assert!(NamespaceMeta::for_namespace(Namespace::Metric).is_err());
    }

    #[test]
    fn test_format_alias_field() {
        assert_eq!(format_alias_field("message.keyword"), "message");
        assert_eq!(format_alias_field("a.b.c"), "c");
        assert_eq!(format_alias_field("host"), "host");
    }

    #[test]
    fn test_plain_hits_query() {
        let plan = translate("L::nginx:(message AS msg, status) {status >= 500} LIMIT 10 OFFSET 5");
        let body = &plan.body;
        assert_eq!(body["size"], json!(10));
        assert_eq!(body["from"], json!(5));
        assert_eq!(body["track_total_hits"], json!(true));
        assert_eq!(body["_source"], json!(["time", "message", "status"]));
        assert_eq!(body["sort"], json!([{"date": {"order": "desc"}}]));

        let must = body["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must[0], json!({"bool": {"should": [{"term": {"source": {"value": "nginx"}}}]}}));
        assert_eq!(must[1], json!({"range": {"status": {"gte": 500}}}));

        assert_eq!(plan.helper.sort_fields, vec!["time", "message", "status"]);
        assert_eq!(plan.helper.alias.get("message"), Some(&"msg".to_string()));
        assert_eq!(plan.helper.class_names, "nginx");
        assert!(!plan.helper.is_aggs);
    }

    #[test]
    fn test_wildcard_source_skips_class_filter() {
        let plan = translate("L::re('.*'):(message)");
        assert!(plan.body.get("query").is_none());
    }

    #[test]
    fn test_object_defaults_to_recent_range() {
        let plan = translate("O::host:(name)");
        let must = plan.body["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(
            must[1]["range"]["last_update_time"]["gte"],
            json!(NOW - 300_000)
        );
        assert_eq!(plan.helper.alias.get("last_update_time"), Some(&"time".to_string()));
        assert_eq!(plan.helper.sort_fields[0], "last_update_time");
    }

    #[test]
    fn test_limit_checks() {
        let (q, ns) = query("L::nginx:(message) LIMIT 20000");
        assert!(translate_query(&q, ns, &SearchLimits::default(), NOW).is_err());
    }

    #[test]
    fn test_highlight_fields() {
        let (mut q, ns) = query("L::nginx:(message) {message = match('timeout')}");
        q.highlight = true;
        let plan = translate_query(&q, ns, &SearchLimits::default(), NOW).unwrap();
        assert_eq!(plan.helper.highlight_fields, vec!["message"]);
        assert_eq!(
            plan.body["highlight"],
            json!({"fields": {"message": {"fragment_size": 1_000_000}}})
        );
    }

    #[test]
    fn test_show_classes_and_fields() {
        let show = |text: &str| match parse_dql(text).unwrap().remove(0) {
            Stmt::Show(s) => s,
            other => panic!("unexpected {:?}", other),
        };
        let plan = translate_show(&show("show_logging_source() LIMIT 5"), Namespace::Logging, NOW)
            .unwrap();
        assert_eq!(plan.helper.show, Some(ShowKind::Classes));
        assert_eq!(
            plan.body["aggs"],
            json!({"aggs1": {"terms": {"field": "source", "size": 5}}})
        );

        let plan = translate_show(&show("show_logging_field()"), Namespace::Logging, NOW).unwrap();
        assert_eq!(plan.helper.show, Some(ShowKind::Fields));
        assert_eq!(plan.body, Json::Null);
    }

    #[test]
    fn test_delete_body() {
        let (q, ns) = query("L::nginx {status = 500}");
        let body = translate_delete(&q, ns, &SearchLimits::default(), NOW).unwrap();
        let must = body["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must.len(), 2);
        assert_eq!(match_all_delete(), json!({"query": {"match_all": {}}}));
    }
}
