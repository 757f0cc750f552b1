//! Worker pool
//!
//! Three queue families (main, debug, backup), each consumed by a fixed
//! number of long-lived workers. A worker owns its [`Executor`] and handles
//! one request at a time, end to end. Every worker runs under a supervisor
//! that fails the in-flight request with `WorkerCrashed` when the worker
//! panics, then restarts it with a fresh executor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::exec::Executor;
use crate::engine::result::QueryResult;
use crate::query::{DqlError, DqlResult, QuerySpec};

/// Builds the executor a (re)started worker owns
pub type ExecutorFactory = Arc<dyn Fn() -> Executor + Send + Sync>;

/// Batch of queries for one workspace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    pub workspace: String,
    pub queries: Vec<QuerySpec>,
    /// Echo native queries in the results
    pub explain: bool,
}

/// Native query passed straight to a backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugRequest {
    pub workspace: String,
    pub namespace: String,
    pub query: String,
}

/// Pool sizing and failure policy
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub debug_workers: usize,
    pub backup_workers: usize,
    /// Upper bound on one submission, queue wait included
    pub query_timeout_secs: u64,
    /// First restart delay after a crash; 0 restarts immediately
    pub restart_backoff_ms: u64,
    pub max_restart_backoff_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            debug_workers: 1,
            backup_workers: 1,
            query_timeout_secs: 30,
            restart_backoff_ms: 100,
            max_restart_backoff_ms: 10_000,
        }
    }
}

enum Payload {
    Batch { request: QueryRequest, backup: bool },
    Debug(DebugRequest),
}

enum Reply {
    Batch(oneshot::Sender<DqlResult<Vec<QueryResult>>>),
    Debug(oneshot::Sender<DqlResult<Json>>),
}

impl Reply {
    /// Best effort; the caller may already be gone
    fn fail(self, e: DqlError) {
        match self {
            Reply::Batch(tx) => {
                let _ = tx.send(Err(e));
            }
            Reply::Debug(tx) => {
                let _ = tx.send(Err(e));
            }
        }
    }
}

struct Job {
    payload: Payload,
    reply: Reply,
}

type JobQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>;

/// Reply slot of the request a worker is currently running
type InFlight = Arc<Mutex<Option<Reply>>>;

fn lock_slot(slot: &InFlight) -> std::sync::MutexGuard<'_, Option<Reply>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Counters shared by every worker
#[derive(Debug, Default)]
pub struct PoolStats {
    completed: AtomicU64,
    crashes: AtomicU64,
}

impl PoolStats {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn crashes(&self) -> u64 {
        self.crashes.load(Ordering::Relaxed)
    }
}

async fn run_batch(
    executor: &mut Executor,
    request: &QueryRequest,
    backup: bool,
) -> DqlResult<Vec<QueryResult>> {
    let mut results = Vec::new();
    for spec in &request.queries {
        let found = executor
            .run_spec(&request.workspace, spec, request.explain, backup)
            .await?;
        results.extend(found);
    }
    Ok(results)
}

struct Worker {
    queue: &'static str,
    id: usize,
    jobs: JobQueue,
    in_flight: InFlight,
    timeout: Duration,
    stats: Arc<PoolStats>,
}

impl Worker {
    async fn run(self, mut executor: Executor) {
        loop {
            let job = {
                let mut jobs = self.jobs.lock().await;
                jobs.recv().await
            };
            let Some(job) = job else {
                debug!(queue = self.queue, worker = self.id, "queue closed, worker exiting");
                return;
            };

            *lock_slot(&self.in_flight) = Some(job.reply);
            let outcome = tokio::time::timeout(self.timeout, self.handle(&mut executor, job.payload)).await;
            let reply = lock_slot(&self.in_flight).take();
            let Some(reply) = reply else {
                continue;
            };

            match (outcome, reply) {
                (Ok(Outcome::Batch(result)), Reply::Batch(tx)) => {
                    let _ = tx.send(result);
                }
                (Ok(Outcome::Debug(result)), Reply::Debug(tx)) => {
                    let _ = tx.send(result);
                }
                (Ok(_), reply) => {
                    reply.fail(DqlError::query("reply slot does not match the request kind"));
                }
                (Err(_), reply) => {
                    warn!(
                        queue = self.queue,
                        worker = self.id,
                        timeout_secs = self.timeout.as_secs(),
                        "request timed out"
                    );
                    reply.fail(DqlError::Timeout(self.timeout.as_secs()));
                }
            }
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn handle(&self, executor: &mut Executor, payload: Payload) -> Outcome {
        match payload {
            Payload::Batch { request, backup } => {
                Outcome::Batch(run_batch(executor, &request, backup).await)
            }
            Payload::Debug(request) => Outcome::Debug(
                executor
                    .debug_query(&request.workspace, &request.namespace, &request.query)
                    .await,
            ),
        }
    }
}

enum Outcome {
    Batch(DqlResult<Vec<QueryResult>>),
    Debug(DqlResult<Json>),
}

/// Run one worker slot, restarting it after every panic
fn supervise(
    queue: &'static str,
    id: usize,
    jobs: JobQueue,
    factory: ExecutorFactory,
    config: PoolConfig,
    stats: Arc<PoolStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let in_flight: InFlight = Arc::new(Mutex::new(None));
        let mut backoff = config.restart_backoff_ms;

        loop {
            let worker = Worker {
                queue,
                id,
                jobs: jobs.clone(),
                in_flight: in_flight.clone(),
                timeout: Duration::from_secs(config.query_timeout_secs),
                stats: stats.clone(),
            };
            let handle = tokio::spawn(worker.run(factory()));

            match handle.await {
                Ok(()) => return,
                Err(e) if e.is_panic() => {
                    let crashes = stats.crashes.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(queue, worker = id, crashes, "worker crashed, restarting");
                    let reply = lock_slot(&in_flight).take();
                    if let Some(reply) = reply {
                        reply.fail(DqlError::WorkerCrashed(format!("{} worker {} panicked", queue, id)));
                    }
                    if backoff > 0 {
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                        backoff = backoff.saturating_mul(2).min(config.max_restart_backoff_ms.max(backoff));
                    }
                }
                Err(e) => {
                    error!(queue, worker = id, error = %e, "worker cancelled");
                    return;
                }
            }
        }
    })
}

fn start_queue(
    queue: &'static str,
    workers: usize,
    factory: &ExecutorFactory,
    config: &PoolConfig,
    stats: &Arc<PoolStats>,
    handles: &mut Vec<JoinHandle<()>>,
) -> mpsc::UnboundedSender<Job> {
    let (tx, rx) = mpsc::unbounded_channel();
    let jobs: JobQueue = Arc::new(tokio::sync::Mutex::new(rx));
    for id in 0..workers.max(1) {
        handles.push(supervise(
            queue,
            id,
            jobs.clone(),
            factory.clone(),
            config.clone(),
            stats.clone(),
        ));
    }
    tx
}

/// Entry point for submitting queries
pub struct WorkerPool {
    main: mpsc::UnboundedSender<Job>,
    debug: mpsc::UnboundedSender<Job>,
    backup: mpsc::UnboundedSender<Job>,
    timeout: Duration,
    stats: Arc<PoolStats>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn every queue's workers; must run inside a tokio runtime
    pub fn start(config: PoolConfig, factory: ExecutorFactory) -> Self {
        let stats = Arc::new(PoolStats::default());
        let mut handles = Vec::new();
        let main = start_queue("main", config.workers, &factory, &config, &stats, &mut handles);
        let debug = start_queue("debug", config.debug_workers, &factory, &config, &stats, &mut handles);
        let backup = start_queue("backup", config.backup_workers, &factory, &config, &stats, &mut handles);

        info!(
            workers = config.workers,
            debug_workers = config.debug_workers,
            backup_workers = config.backup_workers,
            timeout_secs = config.query_timeout_secs,
            "worker pool started"
        );

        Self {
            main,
            debug,
            backup,
            timeout: Duration::from_secs(config.query_timeout_secs),
            stats,
            handles,
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Whether every worker slot is still supervised
    pub fn is_running(&self) -> bool {
        self.handles.iter().all(|h| !h.is_finished())
    }

    async fn wait<T>(&self, rx: oneshot::Receiver<DqlResult<T>>) -> DqlResult<T> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DqlError::WorkerCrashed("worker dropped the request".into())),
            Err(_) => Err(DqlError::Timeout(self.timeout.as_secs())),
        }
    }

    async fn submit_batch(
        &self,
        queue: &mpsc::UnboundedSender<Job>,
        request: QueryRequest,
        backup: bool,
    ) -> DqlResult<Vec<QueryResult>> {
        let (tx, rx) = oneshot::channel();
        queue
            .send(Job {
                payload: Payload::Batch { request, backup },
                reply: Reply::Batch(tx),
            })
            .map_err(|_| DqlError::WorkerCrashed("worker queue is closed".into()))?;
        self.wait(rx).await
    }

    /// Run a batch on the main queue
    pub async fn query(&self, request: QueryRequest) -> DqlResult<Vec<QueryResult>> {
        self.submit_batch(&self.main, request, false).await
    }

    /// Run a batch on the backup queue; logging reads the backup index
    pub async fn backup_query(&self, request: QueryRequest) -> DqlResult<Vec<QueryResult>> {
        self.submit_batch(&self.backup, request, true).await
    }

    /// Pass a native query through the debug queue
    pub async fn debug(&self, request: DebugRequest) -> DqlResult<Json> {
        let (tx, rx) = oneshot::channel();
        self.debug
            .send(Job {
                payload: Payload::Debug(request),
                reply: Reply::Debug(tx),
            })
            .map_err(|_| DqlError::WorkerCrashed("worker queue is closed".into()))?;
        self.wait(rx).await
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackends;
    use crate::backend::{BackendError, TimeSeriesClient, TimeSeriesConnector, TsQuery};
    use crate::engine::result::Row;
    use crate::query::{Compiler, Value};
    use async_trait::async_trait;
    use serde_json::json;

    /// Panics on statements mentioning `boom`, stalls on `slow`
    struct Hostile;

    #[async_trait]
    impl TimeSeriesClient for Hostile {
        async fn query(&self, query: &TsQuery) -> Result<Vec<Row>, BackendError> {
            if query.statement.contains("boom") {
                panic!("backend client blew up");
            }
            if query.statement.contains("slow") {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(vec![Row::new("ok", vec!["time".into(), "v".into()])
                .with_values(vec![vec![Value::Int(1), Value::Int(2)]])])
        }
    }

    struct HostileConnector;

    impl TimeSeriesConnector for HostileConnector {
        fn connect(&self, _instance: &str) -> Result<Arc<dyn TimeSeriesClient>, BackendError> {
            Ok(Arc::new(Hostile))
        }
    }

    fn pool(query_timeout_secs: u64) -> (WorkerPool, MockBackends) {
        let mocks = MockBackends::new();
        let mut backends = mocks.backends.clone();
        backends.timeseries = Arc::new(HostileConnector);
        let factory: ExecutorFactory =
            Arc::new(move || Executor::new(backends.clone(), Compiler::default(), None, "ms"));
        let config = PoolConfig {
            workers: 1,
            debug_workers: 1,
            backup_workers: 1,
            query_timeout_secs,
            restart_backoff_ms: 0,
            max_restart_backoff_ms: 0,
        };
        (WorkerPool::start(config, factory), mocks)
    }

    fn request(queries: &[&str]) -> QueryRequest {
        QueryRequest {
            workspace: "ws1".into(),
            queries: queries.iter().map(|q| QuerySpec::new(*q)).collect(),
            explain: false,
        }
    }

    #[tokio::test]
    async fn test_batch_runs_every_query() {
        let (pool, _mocks) = pool(10);
        let results = pool.query(request(&["cpu:(v)", "mem:(v)"])).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].series[0].columns, vec!["time", "v"]);
        assert_eq!(pool.stats().completed(), 1);
    }

    #[tokio::test]
    async fn test_batch_stops_at_first_error() {
        let (pool, _mocks) = pool(10);
        let err = pool
            .query(request(&["cpu:(v)", "cpu:(", "mem:(v)"]))
            .await
            .unwrap_err();
        assert!(matches!(err, DqlError::Parse(_)));
    }

    #[tokio::test]
    async fn test_crashed_worker_fails_request_and_restarts() {
        let (pool, _mocks) = pool(10);
        let err = pool.query(request(&["boom:(v)"])).await.unwrap_err();
        assert!(matches!(err, DqlError::WorkerCrashed(_)), "{:?}", err);
        assert_eq!(pool.stats().crashes(), 1);

        let results = pool.query(request(&["cpu:(v)"])).await.unwrap();
        assert_eq!(results[0].series.len(), 1);
        assert!(pool.is_running());
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let (pool, _mocks) = pool(1);
        let err = pool.query(request(&["slow:(v)"])).await.unwrap_err();
        assert_eq!(err, DqlError::Timeout(1));
    }

    #[tokio::test]
    async fn test_backup_queue_reads_backup_index() {
        let (pool, mocks) = pool(10);
        pool.backup_query(request(&["L::nginx:(message)"])).await.unwrap();
        let searches = mocks.search.searches.lock().unwrap();
        assert_eq!(searches[0].0, vec!["ws1_backup_log".to_string()]);
    }

    #[tokio::test]
    async fn test_debug_queue_passthrough() {
        let (pool, mocks) = pool(10);
        mocks.search.reply("ws1_logging", json!({"took": 3}));
        let raw = pool
            .debug(DebugRequest {
                workspace: "ws1".into(),
                namespace: "L".into(),
                query: "{}".into(),
            })
            .await
            .unwrap();
        assert_eq!(raw, json!({"took": 3}));
    }
}
