//! In-memory backend doubles for tests

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value as Json};

use super::{
    BackendError, Backends, FuncRequest, FunctionService, IndexInfo, SearchClient,
    StaticDirectory, TimeSeriesClient, TimeSeriesConnector, TsQuery,
};
use crate::engine::Row;

type TsReply = Result<Vec<Row>, BackendError>;

/// Time-series double answering by statement substring
#[derive(Default)]
pub struct MockTimeSeries {
    replies: Mutex<Vec<(String, TsReply)>>,
    pub calls: Mutex<Vec<TsQuery>>,
    pub connects: Mutex<Vec<String>>,
}

impl MockTimeSeries {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer statements containing `pattern` with `rows`
    pub fn reply(&self, pattern: &str, rows: Vec<Row>) {
        self.replies.lock().unwrap().push((pattern.to_string(), Ok(rows)));
    }

    pub fn fail(&self, pattern: &str, err: BackendError) {
        self.replies.lock().unwrap().push((pattern.to_string(), Err(err)));
    }

    pub fn statements(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|q| q.statement.clone())
            .collect()
    }
}

#[async_trait]
impl TimeSeriesClient for MockTimeSeries {
    async fn query(&self, query: &TsQuery) -> Result<Vec<Row>, BackendError> {
        self.calls.lock().unwrap().push(query.clone());
        let replies = self.replies.lock().unwrap();
        replies
            .iter()
            .find(|(pattern, _)| query.statement.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Connector handing out one shared [`MockTimeSeries`]
pub struct MockConnector(pub Arc<MockTimeSeries>);

impl TimeSeriesConnector for MockConnector {
    fn connect(&self, instance: &str) -> Result<Arc<dyn TimeSeriesClient>, BackendError> {
        self.0.connects.lock().unwrap().push(instance.to_string());
        Ok(self.0.clone())
    }
}

/// Search double answering by index substring
#[derive(Default)]
pub struct MockSearch {
    replies: Mutex<Vec<(String, Json)>>,
    mappings: Mutex<Vec<(String, Json)>>,
    indices: Mutex<Vec<IndexInfo>>,
    pub searches: Mutex<Vec<(Vec<String>, Json)>>,
    pub deletes: Mutex<Vec<(String, Json)>>,
}

impl MockSearch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, index: &str, response: Json) {
        self.replies.lock().unwrap().push((index.to_string(), response));
    }

    pub fn mapping_for(&self, index: &str, mapping: Json) {
        self.mappings.lock().unwrap().push((index.to_string(), mapping));
    }

    pub fn set_indices(&self, indices: Vec<IndexInfo>) {
        *self.indices.lock().unwrap() = indices;
    }

    pub fn last_body(&self) -> Option<Json> {
        self.searches.lock().unwrap().last().map(|(_, b)| b.clone())
    }
}

#[async_trait]
impl SearchClient for MockSearch {
    async fn search(&self, indices: &[String], body: &Json) -> Result<Json, BackendError> {
        self.searches
            .lock()
            .unwrap()
            .push((indices.to_vec(), body.clone()));
        let replies = self.replies.lock().unwrap();
        Ok(replies
            .iter()
            .find(|(index, _)| indices.iter().any(|i| i.contains(index.as_str())))
            .map(|(_, r)| r.clone())
            .unwrap_or_else(|| json!({"hits": {"total": {"value": 0}, "hits": []}})))
    }

    async fn mapping(&self, index: &str) -> Result<Json, BackendError> {
        let mappings = self.mappings.lock().unwrap();
        mappings
            .iter()
            .find(|(i, _)| i == index)
            .map(|(_, m)| m.clone())
            .ok_or_else(|| BackendError::Status {
                status: 404,
                message: format!("no such index [{}]", index),
            })
    }

    async fn delete_by_query(&self, index: &str, body: &Json) -> Result<Json, BackendError> {
        self.deletes
            .lock()
            .unwrap()
            .push((index.to_string(), body.clone()));
        Ok(json!({"deleted": 0}))
    }

    async fn list_indices(&self) -> Result<Vec<IndexInfo>, BackendError> {
        Ok(self.indices.lock().unwrap().clone())
    }
}

/// Function-service double returning fixed rows
#[derive(Default)]
pub struct MockFunctions {
    rows: Mutex<Vec<Row>>,
    pub calls: Mutex<Vec<FuncRequest>>,
}

impl MockFunctions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, rows: Vec<Row>) {
        *self.rows.lock().unwrap() = rows;
    }
}

#[async_trait]
impl FunctionService for MockFunctions {
    async fn call(&self, request: &FuncRequest) -> Result<Vec<Row>, BackendError> {
        self.calls.lock().unwrap().push(request.clone());
        Ok(self.rows.lock().unwrap().clone())
    }
}

/// Every double, plus the bundle wired from them
pub struct MockBackends {
    pub timeseries: Arc<MockTimeSeries>,
    pub search: Arc<MockSearch>,
    pub functions: Arc<MockFunctions>,
    pub backends: Backends,
}

impl MockBackends {
    /// Any workspace resolves to database `{ws}` on instance `ts0`
    pub fn new() -> Self {
        let timeseries = MockTimeSeries::new();
        let search = MockSearch::new();
        let functions = MockFunctions::new();
        let backends = Backends {
            directory: Arc::new(StaticDirectory::new(vec![], Some("ts0".into()), "autogen")),
            timeseries: Arc::new(MockConnector(timeseries.clone())),
            search: search.clone(),
            functions: functions.clone(),
        };
        Self {
            timeseries,
            search,
            functions,
            backends,
        }
    }
}
