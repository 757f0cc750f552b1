//! Search response normalization
//!
//! Turns raw search responses back into [`Row`]s using the [`Helper`] the
//! translator recorded. Two response shapes exist:
//!
//! - **Hits**: one tuple per document, columns from the flattened `_source`
//! - **Aggregations**: a tree of named nodes (`value`, `values`, `buckets`,
//!   `hits`) walked into row fragments, which are grouped into series by a
//!   digest of their tags
//!
//! Both shapes then go through the same post-processing: empty series are
//! dropped, columns are put back into the requested order, aliases are
//! applied, first/last tuples are merged and aggregation paging is trimmed.

use std::collections::{BTreeMap, HashMap};

use md5::{Digest, Md5};
use serde_json::{Map, Value as Json};

use crate::engine::result::{QueryResult, Row};
use crate::query::search::{format_alias_field, Helper, ShowKind, SHOW_AGG, TIME_COLUMN};
use crate::query::{DqlError, DqlResult, Value};

/// Keys of a bucket object that are not sub-aggregations
const BUCKET_META_KEYS: &[&str] = &[
    "key",
    "key_as_string",
    "doc_count",
    "from",
    "from_as_string",
    "to",
    "to_as_string",
    "doc_count_error_upper_bound",
    "sum_other_doc_count",
    "after_key",
];

/// Normalize a search response for a select or class listing
pub fn normalize_search(response: &Json, helper: &Helper) -> DqlResult<QueryResult> {
    if helper.show == Some(ShowKind::Classes) {
        return Ok(QueryResult::from_series(class_listing(response, helper)?));
    }

    let mut result = if helper.is_aggs {
        let aggs = response
            .get("aggregations")
            .and_then(Json::as_object)
            .cloned()
            .unwrap_or_default();
        let mut fragments = Vec::new();
        walk_aggs(&aggs, &BTreeMap::new(), &[], helper, &mut fragments);
        let series = merge_fragments(fragments, &helper.class_names);
        let mut result = QueryResult::from_series(series);
        if let Some(row) = result.series.first() {
            result.group_by = row.tags.keys().cloned().collect();
        }
        result
    } else {
        hits_result(response, helper)
    };

    result.total_hits = total_hits(response);
    result.series = post_process(std::mem::take(&mut result.series), helper);
    Ok(result)
}

fn total_hits(response: &Json) -> Option<i64> {
    let total = response.get("hits")?.get("total")?;
    total
        .get("value")
        .and_then(Json::as_i64)
        .or_else(|| total.as_i64())
}

// ============================================================================
// Hits
// ============================================================================

/// Flatten a document, keeping the leaf key of nested objects
fn flatten_source(source: &Map<String, Json>, out: &mut BTreeMap<String, Json>) {
    for (key, value) in source {
        match value {
            Json::Object(inner) => flatten_source(inner, out),
            other => {
                out.insert(key.clone(), other.clone());
            }
        }
    }
}

fn hit_document(hit: &Json) -> BTreeMap<String, Json> {
    let mut doc = BTreeMap::new();
    if let Some(source) = hit.get("_source").and_then(Json::as_object) {
        flatten_source(source, &mut doc);
    }
    if let Some(highlight) = hit.get("highlight").and_then(Json::as_object) {
        for (field, fragments) in highlight {
            let text = match fragments {
                Json::Array(parts) => parts
                    .iter()
                    .filter_map(Json::as_str)
                    .collect::<Vec<_>>()
                    .join(""),
                other => other.as_str().unwrap_or_default().to_string(),
            };
            doc.insert(format_alias_field(field), Json::String(text));
        }
    }
    doc
}

/// `time` first, every other column in name order
fn hit_columns(docs: &[BTreeMap<String, Json>]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for doc in docs {
        for key in doc.keys() {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
    }
    names.sort();
    if let Some(pos) = names.iter().position(|c| c == TIME_COLUMN) {
        let time = names.remove(pos);
        names.insert(0, time);
    }
    names
}

fn hits_result(response: &Json, helper: &Helper) -> QueryResult {
    let hits = response
        .get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(Json::as_array)
        .cloned()
        .unwrap_or_default();

    let docs: Vec<BTreeMap<String, Json>> = hits.iter().map(hit_document).collect();
    let columns = hit_columns(&docs);
    let values = docs
        .iter()
        .map(|doc| {
            columns
                .iter()
                .map(|c| doc.get(c).map(Value::from).unwrap_or_default())
                .collect()
        })
        .collect();

    let mut result =
        QueryResult::from_series(vec![Row::new(helper.class_names.clone(), columns).with_values(values)]);
    result.search_after = hits
        .last()
        .and_then(|h| h.get("sort"))
        .and_then(Json::as_array)
        .cloned();
    result
}

// ============================================================================
// Aggregations
// ============================================================================

/// One tuple produced while walking the aggregation tree
#[derive(Debug, Clone)]
struct Fragment {
    tags: BTreeMap<String, String>,
    cells: Vec<(String, Value)>,
}

/// Push a cell, renaming with `_<n>` until the name is unique
fn push_cell(cells: &mut Vec<(String, Value)>, name: &str, value: Value) {
    let mut candidate = name.to_string();
    let mut n = 1;
    while cells.iter().any(|(c, _)| c == &candidate) {
        candidate = format!("{}_{}", name, n);
        n += 1;
    }
    cells.push((candidate, value));
}

fn key_text(key: &Json) -> String {
    match key {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn sub_aggregations(bucket: &Json) -> Map<String, Json> {
    bucket
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter(|(k, v)| !BUCKET_META_KEYS.contains(&k.as_str()) && v.is_object())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn source_field(source: &Json, field: &str) -> Value {
    let mut node = source;
    for part in field.split('.') {
        match node.get(part) {
            Some(next) => node = next,
            None => return source.get(field).map(Value::from).unwrap_or_default(),
        }
    }
    Value::from(node)
}

fn walk_aggs(
    level: &Map<String, Json>,
    tags: &BTreeMap<String, String>,
    base: &[(String, Value)],
    helper: &Helper,
    out: &mut Vec<Fragment>,
) {
    let mut leaves: Vec<(String, Value)> = base.to_vec();
    let mut has_leaf = false;

    for (name, node) in level {
        if let Some(value) = node.get("value") {
            push_cell(&mut leaves, name, Value::from(value));
            has_leaf = true;
        } else if let Some(values) = node.get("values").and_then(Json::as_object) {
            if values.len() == 1 {
                if let Some(v) = values.values().next() {
                    push_cell(&mut leaves, name, Value::from(v));
                }
            } else {
                for (key, v) in values {
                    push_cell(&mut leaves, &format!("{}_{}", name, key), Value::from(v));
                }
            }
            has_leaf = true;
        } else if let Some(buckets) = node.get("buckets") {
            let buckets: Vec<&Json> = match buckets {
                Json::Array(items) => items.iter().collect(),
                Json::Object(keyed) => keyed.values().collect(),
                _ => Vec::new(),
            };
            let is_column = helper.column_buckets.iter().any(|b| b == name);
            for bucket in buckets {
                let key = bucket.get("key").cloned().unwrap_or(Json::Null);
                let sub = sub_aggregations(bucket);
                let mut bucket_tags = tags.clone();
                let mut bucket_base = base.to_vec();
                if is_column {
                    push_cell(&mut bucket_base, name, Value::from(&key));
                } else {
                    bucket_tags.insert(name.clone(), key_text(&key));
                }

                if sub.is_empty() {
                    if !is_column {
                        push_cell(&mut bucket_base, name, Value::from(&key));
                    }
                    out.push(Fragment {
                        tags: bucket_tags,
                        cells: bucket_base,
                    });
                } else {
                    walk_aggs(&sub, &bucket_tags, &bucket_base, helper, out);
                }
            }
        } else if let Some(hits) = node
            .get("hits")
            .and_then(|h| h.get("hits"))
            .and_then(Json::as_array)
        {
            let field = helper.hit_fields.get(name).map(String::as_str).unwrap_or(name);
            if hits.len() <= 1 {
                let source = hits.first().and_then(|h| h.get("_source"));
                let (time, value) = match source {
                    Some(s) => (source_field(s, &helper.time_field), source_field(s, field)),
                    None => (Value::Null, Value::Null),
                };
                if !leaves.iter().any(|(c, _)| c == TIME_COLUMN) {
                    leaves.push((TIME_COLUMN.to_string(), time));
                }
                push_cell(&mut leaves, name, value);
                has_leaf = true;
            } else {
                for hit in hits {
                    let source = hit.get("_source").cloned().unwrap_or(Json::Null);
                    let mut cells = base.to_vec();
                    if !cells.iter().any(|(c, _)| c == TIME_COLUMN) {
                        cells.push((
                            TIME_COLUMN.to_string(),
                            source_field(&source, &helper.time_field),
                        ));
                    }
                    push_cell(&mut cells, name, source_field(&source, field));
                    out.push(Fragment {
                        tags: tags.clone(),
                        cells,
                    });
                }
            }
        }
    }

    if has_leaf {
        out.push(Fragment {
            tags: tags.clone(),
            cells: leaves,
        });
    }
}

/// Digest identifying the series a set of tags belongs to
pub fn tags_digest(tags: &BTreeMap<String, String>) -> String {
    let text = tags
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    hex::encode(Md5::digest(text.as_bytes()))
}

/// Group fragments into series, widening columns with null fill
fn merge_fragments(fragments: Vec<Fragment>, name: &str) -> Vec<Row> {
    let mut rows: Vec<Row> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for fragment in fragments {
        let digest = tags_digest(&fragment.tags);
        let idx = *index.entry(digest).or_insert_with(|| {
            let mut row = Row::new(name, Vec::new());
            row.tags = fragment.tags.clone();
            rows.push(row);
            rows.len() - 1
        });
        let row = &mut rows[idx];

        for (column, _) in &fragment.cells {
            if row.column_index(column).is_none() {
                row.columns.push(column.clone());
                for tuple in &mut row.values {
                    tuple.push(Value::Null);
                }
            }
        }
        let mut tuple = vec![Value::Null; row.columns.len()];
        for (column, value) in fragment.cells {
            if let Some(i) = row.column_index(&column) {
                tuple[i] = value;
            }
        }
        row.values.push(tuple);
    }
    rows
}

// ============================================================================
// Post-processing
// ============================================================================

fn post_process(series: Vec<Row>, helper: &Helper) -> Vec<Row> {
    let mut series: Vec<Row> = series
        .into_iter()
        .filter(|r| !r.columns.is_empty() && !r.values.is_empty())
        .collect();

    if !helper.sort_fields.is_empty() {
        for row in &mut series {
            sort_to_fields(row, &helper.sort_fields);
        }
    }
    for row in &mut series {
        apply_alias(row, helper);
    }
    if helper.fl_func_count > 1 && !helper.has_date_histogram() {
        for row in &mut series {
            merge_first_last(row);
        }
    }
    if helper.is_aggs && helper.aggs_from > 0 {
        if helper.aggs_from >= series.len() {
            series.clear();
        } else {
            series.drain(..helper.aggs_from);
        }
    }
    series
}

/// Reorder columns to the requested list; missing ones become null
fn sort_to_fields(row: &mut Row, fields: &[String]) {
    let picks: Vec<(String, Option<usize>)> = fields
        .iter()
        .map(|f| match row.column_index(f) {
            Some(i) => (f.clone(), Some(i)),
            None => {
                let leaf = format_alias_field(f);
                let i = row.column_index(&leaf);
                (leaf, i)
            }
        })
        .collect();

    row.values = row
        .values
        .iter()
        .map(|tuple| {
            picks
                .iter()
                .map(|(_, i)| i.and_then(|i| tuple.get(i).cloned()).unwrap_or_default())
                .collect()
        })
        .collect();
    row.columns = picks.into_iter().map(|(c, _)| c).collect();
}

fn apply_alias(row: &mut Row, helper: &Helper) {
    for column in &mut row.columns {
        if let Some(alias) = helper.alias.get(column.as_str()) {
            *column = alias.clone();
        }
    }
    row.name = helper.class_names.clone();
}

/// Collapse every tuple into one; later non-null values win
fn merge_first_last(row: &mut Row) {
    if row.values.len() < 2 {
        return;
    }
    let mut merged = vec![Value::Null; row.columns.len()];
    for tuple in &row.values {
        for (slot, value) in merged.iter_mut().zip(tuple) {
            if !value.is_null() {
                *slot = value.clone();
            }
        }
    }
    row.values = vec![merged];
}

// ============================================================================
// Show
// ============================================================================

fn class_listing(response: &Json, helper: &Helper) -> DqlResult<Vec<Row>> {
    let buckets = response
        .get("aggregations")
        .and_then(|a| a.get(SHOW_AGG))
        .and_then(|a| a.get("buckets"))
        .and_then(Json::as_array)
        .ok_or_else(|| DqlError::SearchQueryFailed("response carries no class buckets".into()))?;

    let values: Vec<Vec<Value>> = buckets
        .iter()
        .skip(helper.aggs_from)
        .filter_map(|b| b.get("key"))
        .map(|k| vec![Value::Str(key_text(k))])
        .collect();
    if values.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![Row::new("measurements", vec!["name".into()]).with_values(values)])
}

fn collect_fields(properties: &Map<String, Json>, prefix: &str, out: &mut BTreeMap<String, String>) {
    for (name, spec) in properties {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };
        match spec.get("properties").and_then(Json::as_object) {
            Some(nested) => collect_fields(nested, &path, out),
            None => {
                let kind = spec
                    .get("type")
                    .and_then(Json::as_str)
                    .unwrap_or("object")
                    .to_string();
                out.entry(path).or_insert(kind);
            }
        }
    }
}

/// Field listing from a `_mapping` response covering one or more indices
pub fn normalize_mapping(mapping: &Json) -> QueryResult {
    let mut fields = BTreeMap::new();
    if let Some(indices) = mapping.as_object() {
        for index in indices.values() {
            if let Some(props) = index
                .get("mappings")
                .and_then(|m| m.get("properties"))
                .and_then(Json::as_object)
            {
                collect_fields(props, "", &mut fields);
            }
        }
    }
    if fields.is_empty() {
        return QueryResult::default();
    }
    let values = fields
        .into_iter()
        .map(|(k, t)| vec![Value::Str(k), Value::Str(t)])
        .collect();
    QueryResult::from_series(vec![
        Row::new("fields", vec!["fieldKey".into(), "fieldType".into()]).with_values(values)
    ])
}

/// Drop series without columns or values
pub fn valid_series(series: Vec<Row>) -> Vec<Row> {
    series
        .into_iter()
        .filter(|r| !r.columns.is_empty() && !r.values.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Compiler, QuerySpec};
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    fn helper_for(text: &str) -> Helper {
        let mut spec = QuerySpec::new(text);
        spec.time_range = vec![NOW - 3_600_000, NOW];
        let results = Compiler::default().compile(&spec, NOW).unwrap();
        results[0].search_plan().unwrap().helper.clone()
    }

    #[test]
    fn test_hits_become_time_first_rows() {
        let helper = helper_for("L::nginx");
        let response = json!({
            "hits": {
                "total": {"value": 42},
                "hits": [
                    {"_source": {"time": 2, "status": 500, "http": {"host": "a"}}, "sort": [2]},
                    {"_source": {"time": 1, "message": "ok"}, "sort": [1]}
                ]
            }
        });
        let result = normalize_search(&response, &helper).unwrap();
        let row = &result.series[0];
        assert_eq!(row.name, "nginx");
        assert_eq!(row.columns, vec!["time", "host", "message", "status"]);
        assert_eq!(row.values[0][1], Value::Str("a".into()));
        assert_eq!(row.values[1][3], Value::Null);
        assert_eq!(result.total_hits, Some(42));
        assert_eq!(result.search_after, Some(vec![json!(1)]));
    }

    #[test]
    fn test_hits_follow_requested_columns_and_aliases() {
        let helper = helper_for("L::nginx:(status AS code, missing)");
        let response = json!({
            "hits": {"hits": [{"_source": {"time": 1, "status": 200, "extra": "x"}}]}
        });
        let result = normalize_search(&response, &helper).unwrap();
        let row = &result.series[0];
        assert_eq!(row.columns, vec!["time", "code", "missing"]);
        assert_eq!(row.values[0], vec![Value::Int(1), Value::Int(200), Value::Null]);
    }

    #[test]
    fn test_highlight_replaces_source_value() {
        let helper = helper_for("L::nginx");
        let response = json!({
            "hits": {"hits": [{
                "_source": {"time": 1, "message": "disk full"},
                "highlight": {"message": ["<em>disk</em> full"]}
            }]}
        });
        let result = normalize_search(&response, &helper).unwrap();
        assert_eq!(result.series[0].values[0][1], Value::Str("<em>disk</em> full".into()));
    }

    #[test]
    fn test_grouped_buckets_become_tagged_series() {
        let helper = helper_for("L::nginx:(count(status)) [1h::30m] BY host");
        let response = json!({
            "aggregations": {
                "host": {"buckets": [
                    {"key": "a", "doc_count": 3, "time": {"buckets": [
                        {"key": 1000, "doc_count": 1, "count(status)": {"value": 1}},
                        {"key": 2000, "doc_count": 2, "count(status)": {"value": 2}}
                    ]}},
                    {"key": "b", "doc_count": 1, "time": {"buckets": [
                        {"key": 1000, "doc_count": 1, "count(status)": {"value": 1}}
                    ]}}
                ]}
            }
        });
        let result = normalize_search(&response, &helper).unwrap();
        assert_eq!(result.series.len(), 2);
        let a = &result.series[0];
        assert_eq!(a.tags.get("host"), Some(&"a".to_string()));
        assert_eq!(a.columns, vec!["time", "count(status)"]);
        assert_eq!(a.values, vec![
            vec![Value::Int(1000), Value::Int(1)],
            vec![Value::Int(2000), Value::Int(2)],
        ]);
        assert_eq!(result.series[1].values.len(), 1);
        assert_eq!(result.group_by, vec!["host"]);
    }

    #[test]
    fn test_first_last_hits_attach_to_row() {
        let helper = helper_for("L::nginx:(first(status), last(bytes))");
        let response = json!({
            "aggregations": {
                "first(status)": {"hits": {"hits": [{"_source": {"date": 10, "status": 200}}]}},
                "last(bytes)": {"hits": {"hits": [{"_source": {"date": 20, "bytes": 512}}]}}
            }
        });
        let result = normalize_search(&response, &helper).unwrap();
        let row = &result.series[0];
        assert_eq!(row.columns, vec!["time", "first(status)", "last(bytes)"]);
        assert_eq!(row.values, vec![vec![Value::Int(10), Value::Int(200), Value::Int(512)]]);
    }

    #[test]
    fn test_aggregation_paging_drops_leading_series() {
        let helper = helper_for("L::nginx:(count(status)) BY host LIMIT 1 OFFSET 1");
        assert_eq!(helper.aggs_from, 1);
        let response = json!({
            "aggregations": {"host": {"buckets": [
                {"key": "a", "doc_count": 1, "count(status)": {"value": 5}},
                {"key": "b", "doc_count": 1, "count(status)": {"value": 7}}
            ]}}
        });
        let result = normalize_search(&response, &helper).unwrap();
        assert_eq!(result.series.len(), 1);
        assert_eq!(result.series[0].tags["host"], "b");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let helper = helper_for("L::nginx:(avg(bytes)) BY host");
        let response = json!({
            "aggregations": {"host": {"buckets": [
                {"key": "a", "doc_count": 1, "avg(bytes)": {"value": 1.5}}
            ]}}
        });
        let first = normalize_search(&response, &helper).unwrap();
        let second = normalize_search(&response, &helper).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_column_collisions_get_suffix() {
        let mut cells = vec![("a".to_string(), Value::Int(1))];
        push_cell(&mut cells, "a", Value::Int(2));
        push_cell(&mut cells, "a", Value::Int(3));
        let names: Vec<&str> = cells.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(names, vec!["a", "a_1", "a_2"]);
    }

    #[test]
    fn test_fragments_widen_with_nulls() {
        let tags = BTreeMap::from([("host".to_string(), "a".to_string())]);
        let rows = merge_fragments(
            vec![
                Fragment { tags: tags.clone(), cells: vec![("x".into(), Value::Int(1))] },
                Fragment { tags, cells: vec![("y".into(), Value::Int(2))] },
            ],
            "m",
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns, vec!["x", "y"]);
        assert_eq!(rows[0].values, vec![
            vec![Value::Int(1), Value::Null],
            vec![Value::Null, Value::Int(2)],
        ]);
    }

    #[test]
    fn test_tags_digest_is_order_independent() {
        let a = BTreeMap::from([("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]);
        let b = BTreeMap::from([("b".to_string(), "2".to_string()), ("a".to_string(), "1".to_string())]);
        assert_eq!(tags_digest(&a), tags_digest(&b));
        assert_eq!(tags_digest(&a).len(), 32);
    }

    #[test]
    fn test_class_listing() {
        let helper = helper_for("show_logging_source()");
        let response = json!({
            "aggregations": {"aggs1": {"buckets": [{"key": "nginx"}, {"key": "mysql"}]}}
        });
        let result = normalize_search(&response, &helper).unwrap();
        assert_eq!(result.series[0].name, "measurements");
        assert_eq!(result.series[0].values[1], vec![Value::Str("mysql".into())]);
    }

    #[test]
    fn test_mapping_listing_flattens_properties() {
        let mapping = json!({
            "ws_logging-000001": {"mappings": {"properties": {
                "message": {"type": "text"},
                "http": {"properties": {"status": {"type": "long"}}}
            }}}
        });
        let result = normalize_mapping(&mapping);
        let row = &result.series[0];
        assert_eq!(row.name, "fields");
        assert_eq!(row.values, vec![
            vec![Value::Str("http.status".into()), Value::Str("long".into())],
            vec![Value::Str("message".into()), Value::Str("text".into())],
        ]);
    }
}
