//! HTTP backend clients
//!
//! `reqwest` implementations of the collaborator traits:
//!
//! - time-series store: `/query` with `q`, `db`, `rp` and `epoch`; reads go
//!   out as GET, writes (`delete from`, `drop measurement`) as a POST form
//! - search cluster: `_search`, `_mapping`, `_delete_by_query`, `_cat/indices`
//! - function service: `POST /api/v1/func/{name}`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, error};

use super::{
    BackendError, FuncRequest, FunctionService, IndexInfo, SearchClient, TimeSeriesClient,
    TimeSeriesConnector, TsQuery,
};
use crate::engine::Row;

fn build_client(timeout_ms: u64) -> Result<Client, BackendError> {
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| BackendError::Unavailable(format!("failed to create HTTP client: {}", e)))
}

/// Turn a non-success response into a status error carrying its body
async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Basic credentials shared by the HTTP clients
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        if self.username.is_empty() {
            request
        } else {
            request.basic_auth(&self.username, Some(&self.password))
        }
    }
}

// ============================================================================
// Time series
// ============================================================================

#[derive(Debug, Deserialize)]
struct TsResponse {
    #[serde(default)]
    results: Vec<TsStatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TsStatementResult {
    #[serde(default)]
    series: Vec<Row>,
    #[serde(default)]
    error: Option<String>,
}

/// Decode a `/query` response body into rows
fn decode_ts_response(body: TsResponse) -> Result<Vec<Row>, BackendError> {
    if let Some(err) = body.error {
        return Err(BackendError::Rejected(err));
    }
    let mut rows = Vec::new();
    for result in body.results {
        if let Some(err) = result.error {
            return Err(BackendError::Rejected(err));
        }
        rows.extend(result.series);
    }
    Ok(rows)
}

/// Client for one time-series instance
pub struct HttpTimeSeriesClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpTimeSeriesClient {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Credentials,
        timeout_ms: u64,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            client: build_client(timeout_ms)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }
}

/// `SELECT` and `SHOW` are the only statements InfluxDB accepts over GET
fn is_read_statement(statement: &str) -> bool {
    let head = statement
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or_default();
    head.eq_ignore_ascii_case("select") || head.eq_ignore_ascii_case("show")
}

impl HttpTimeSeriesClient {
    fn request(&self, query: &TsQuery) -> RequestBuilder {
        let url = format!("{}/query", self.base_url);
        let params = [
            ("q", query.statement.as_str()),
            ("db", query.database.as_str()),
            ("rp", query.retention_policy.as_str()),
            ("epoch", query.precision.as_str()),
        ];
        let request = if is_read_statement(&query.statement) {
            self.client.get(&url).query(&params)
        } else {
            self.client.post(&url).form(&params)
        };
        self.credentials.apply(request)
    }
}

#[async_trait]
impl TimeSeriesClient for HttpTimeSeriesClient {
    async fn query(&self, query: &TsQuery) -> Result<Vec<Row>, BackendError> {
        debug!(db = %query.database, statement = %query.statement, "time-series query");

        let response = self.request(query).send().await.map_err(|e| {
            error!(base_url = %self.base_url, error = %e, "time-series request failed");
            BackendError::from(e)
        })?;
        let body: TsResponse = check_status(response).await?.json().await?;
        decode_ts_response(body)
    }
}

/// Opens clients for the configured time-series instances
pub struct HttpTimeSeriesConnector {
    instances: HashMap<String, String>,
    credentials: Credentials,
    timeout_ms: u64,
}

impl HttpTimeSeriesConnector {
    /// `instances` maps instance names to base URLs
    pub fn new(instances: HashMap<String, String>, credentials: Credentials, timeout_ms: u64) -> Self {
        Self {
            instances,
            credentials,
            timeout_ms,
        }
    }
}

impl TimeSeriesConnector for HttpTimeSeriesConnector {
    fn connect(&self, instance: &str) -> Result<Arc<dyn TimeSeriesClient>, BackendError> {
        let url = self
            .instances
            .get(instance)
            .ok_or_else(|| BackendError::UnknownInstance(instance.to_string()))?;
        let client = HttpTimeSeriesClient::new(url.clone(), self.credentials.clone(), self.timeout_ms)?;
        Ok(Arc::new(client))
    }
}

// ============================================================================
// Search
// ============================================================================

#[derive(Debug, Deserialize)]
struct CatIndex {
    index: String,
    #[serde(rename = "creation.date", default)]
    creation_date: Option<String>,
}

/// Client for the search cluster
pub struct HttpSearchClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpSearchClient {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Credentials,
        timeout_ms: u64,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            client: build_client(timeout_ms)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    async fn send_json(&self, request: RequestBuilder) -> Result<Json, BackendError> {
        let response = self.credentials.apply(request).send().await.map_err(|e| {
            error!(error = %e, "search request failed");
            BackendError::from(e)
        })?;
        Ok(check_status(response).await?.json().await?)
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search(&self, indices: &[String], body: &Json) -> Result<Json, BackendError> {
        let url = format!("{}/{}/_search", self.base_url, indices.join(","));
        debug!(indices = ?indices, "search query");
        self.send_json(
            self.client
                .post(&url)
                .query(&[("ignore_unavailable", "true")])
                .json(body),
        )
        .await
    }

    async fn mapping(&self, index: &str) -> Result<Json, BackendError> {
        let url = format!("{}/{}/_mapping", self.base_url, index);
        self.send_json(self.client.get(&url)).await
    }

    async fn delete_by_query(&self, index: &str, body: &Json) -> Result<Json, BackendError> {
        let url = format!("{}/{}/_delete_by_query", self.base_url, index);
        debug!(index = %index, "delete by query");
        self.send_json(
            self.client
                .post(&url)
                .query(&[("conflicts", "proceed")])
                .json(body),
        )
        .await
    }

    async fn list_indices(&self) -> Result<Vec<IndexInfo>, BackendError> {
        let url = format!("{}/_cat/indices", self.base_url);
        let body = self
            .send_json(
                self.client
                    .get(&url)
                    .query(&[("format", "json"), ("h", "index,creation.date")]),
            )
            .await?;
        let entries: Vec<CatIndex> =
            serde_json::from_value(body).map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(entries
            .into_iter()
            .map(|e| IndexInfo {
                created_ms: e
                    .creation_date
                    .and_then(|d| d.parse().ok())
                    .unwrap_or_default(),
                name: e.index,
            })
            .collect())
    }
}

// ============================================================================
// Function service
// ============================================================================

#[derive(Debug, Serialize)]
struct FuncBody<'a> {
    workspace: &'a str,
    kwargs: &'a serde_json::Map<String, Json>,
    args: &'a [Json],
}

#[derive(Debug, Deserialize)]
struct FuncResponse {
    #[serde(default)]
    series: Vec<Row>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for the function-execution service
pub struct HttpFunctionService {
    client: Client,
    base_url: String,
}

impl HttpFunctionService {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Result<Self, BackendError> {
        Ok(Self {
            client: build_client(timeout_ms)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl FunctionService for HttpFunctionService {
    async fn call(&self, request: &FuncRequest) -> Result<Vec<Row>, BackendError> {
        let url = format!(
            "{}/api/v1/func/{}",
            self.base_url,
            urlencoding::encode(&request.function)
        );
        debug!(function = %request.function, "function call");

        let body = FuncBody {
            workspace: &request.workspace,
            kwargs: &request.kwargs,
            args: &request.args,
        };
        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            error!(function = %request.function, error = %e, "function call failed");
            BackendError::from(e)
        })?;
        let decoded: FuncResponse = check_status(response).await?.json().await?;
        match decoded.error {
            Some(err) if !err.is_empty() => Err(BackendError::Rejected(err)),
            _ => Ok(decoded.series),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Value;
    use serde_json::json;

    #[test]
    fn test_decode_ts_response_flattens_series() {
        let body: TsResponse = serde_json::from_value(json!({
            "results": [
                {"statement_id": 0, "series": [
                    {"name": "cpu", "tags": {"host": "a"}, "columns": ["time", "usage"], "values": [[1, 2.5]]},
                    {"name": "cpu", "tags": {"host": "b"}, "columns": ["time", "usage"], "values": [[1, 3]]}
                ]}
            ]
        }))
        .unwrap();
        let rows = decode_ts_response(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values[0][1], Value::Float(2.5));
        assert_eq!(rows[1].tags["host"], "b");
    }

    #[test]
    fn test_decode_ts_response_statement_error() {
        let body: TsResponse = serde_json::from_value(json!({
            "results": [{"statement_id": 0, "error": "measurement not found"}]
        }))
        .unwrap();
        assert_eq!(
            decode_ts_response(body).unwrap_err(),
            BackendError::Rejected("measurement not found".into())
        );
    }

    fn ts_query(statement: &str) -> TsQuery {
        TsQuery {
            statement: statement.to_string(),
            database: "ws1".into(),
            retention_policy: String::new(),
            precision: "ms".into(),
        }
    }

    #[test]
    fn test_read_statements_use_get() {
        let client = HttpTimeSeriesClient::new("http://ts0:8086/", Credentials::default(), 1000).unwrap();
        for statement in ["SELECT mean(\"usage\") FROM \"cpu\"", "  show measurements"] {
            let request = client.request(&ts_query(statement)).build().unwrap();
            assert_eq!(request.method(), reqwest::Method::GET, "{}", statement);
            assert_eq!(request.url().path(), "/query");
            assert!(request.url().query().unwrap_or_default().contains("db=ws1"));
            assert!(request.body().is_none());
        }
    }

    #[test]
    fn test_write_statements_are_posted_as_form() {
        let client = HttpTimeSeriesClient::new("http://ts0:8086", Credentials::default(), 1000).unwrap();
        for statement in ["drop measurement \"cpu\"", "delete from \"cpu\" where time < 10"] {
            let request = client.request(&ts_query(statement)).build().unwrap();
            assert_eq!(request.method(), reqwest::Method::POST, "{}", statement);
            assert_eq!(request.url().query(), None);
            assert_eq!(
                request.headers()[reqwest::header::CONTENT_TYPE],
                "application/x-www-form-urlencoded"
            );
            let body = request.body().and_then(|b| b.as_bytes()).unwrap();
            let body = std::str::from_utf8(body).unwrap();
            assert!(body.starts_with("q="), "{}", body);
            assert!(body.contains("&db=ws1&rp=&epoch=ms"), "{}", body);
        }
    }

    #[test]
    fn test_decode_ts_response_empty_result() {
        let body: TsResponse = serde_json::from_value(json!({"results": [{"statement_id": 0}]})).unwrap();
        assert!(decode_ts_response(body).unwrap().is_empty());
    }

    #[test]
    fn test_connector_rejects_unknown_instance() {
        let connector = HttpTimeSeriesConnector::new(
            HashMap::from([("ts1".to_string(), "http://localhost:8086".to_string())]),
            Credentials::default(),
            1000,
        );
        assert!(connector.connect("ts1").is_ok());
        assert!(matches!(
            connector.connect("ts2"),
            Err(BackendError::UnknownInstance(_))
        ));
    }
}
