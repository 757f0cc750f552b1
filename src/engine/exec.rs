//! Statement execution
//!
//! An [`Executor`] belongs to exactly one worker. It owns that worker's
//! time-series clients, one per instance and shared by every workspace
//! stored there, so no locking is needed.
//! Composite statements (lambda, outer functions, deletes, function calls)
//! run their inner queries by recursing into [`Executor::execute`] on the
//! same worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::Value as Json;
use tracing::{debug, error, info};

use crate::backend::{BackendError, Backends, TimeSeriesClient, TsQuery, WorkspaceInfo};
use crate::engine::delete::{plan_direct_delete, plan_query_delete, DeletePlan};
use crate::engine::func::plan_call;
use crate::engine::lambda::{column_values, filter_condition, join_specs, link, membership_condition};
use crate::engine::normalize::{normalize_mapping, normalize_search, valid_series};
use crate::engine::outer::apply_chain;
use crate::engine::result::{QueryResult, Row};
use crate::engine::rewrite::{reconcile_document, rewrite_metric};
use crate::query::ast::*;
use crate::query::resolver::{resolve, TranslateContext};
use crate::query::search::{SearchPlan, ShowKind};
use crate::query::{AstResult, Compiler, DqlError, DqlResult, ExtraParam, NativeQuery, QuerySpec};
use crate::warmup::IndexCache;

/// Deepest chain of inner queries a statement may issue
pub const MAX_NESTING: usize = 3;

/// Per-request inputs shared by a statement and its inner queries
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub workspace: String,
    pub params: ExtraParam,
    pub explain: bool,
    /// Logging queries read the backup index
    pub backup: bool,
    pub now_ms: i64,
}

#[derive(Clone)]
struct Connection {
    info: WorkspaceInfo,
    client: Arc<dyn TimeSeriesClient>,
}

/// Runs resolved statements against the backends
pub struct Executor {
    backends: Backends,
    compiler: Compiler,
    index_cache: Option<Arc<IndexCache>>,
    precision: String,
    workspaces: HashMap<String, WorkspaceInfo>,
    /// Instance name to client
    clients: HashMap<String, Arc<dyn TimeSeriesClient>>,
}

fn search_error(e: BackendError) -> DqlError {
    error!(error = %e, "search backend failed");
    DqlError::SearchQueryFailed(e.to_string())
}

fn format_cost(started: Instant) -> String {
    format!("{:?}", started.elapsed())
}

impl Executor {
    pub fn new(
        backends: Backends,
        compiler: Compiler,
        index_cache: Option<Arc<IndexCache>>,
        precision: impl Into<String>,
    ) -> Self {
        Self {
            backends,
            compiler,
            index_cache,
            precision: precision.into(),
            workspaces: HashMap::new(),
            clients: HashMap::new(),
        }
    }

    /// Number of open time-series clients, one per instance
    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    /// Compile one query spec and run every statement it yields
    pub async fn run_spec(
        &mut self,
        workspace: &str,
        spec: &QuerySpec,
        explain: bool,
        backup: bool,
    ) -> DqlResult<Vec<QueryResult>> {
        let now_ms = Utc::now().timestamp_millis();
        let params = ExtraParam::from_spec(spec, &self.compiler.limits)?;
        let asts = self.compiler.compile_with(&spec.query, &params, now_ms)?;

        let ctx = ExecContext {
            workspace: workspace.to_string(),
            params,
            explain,
            backup,
            now_ms,
        };
        let mut results = Vec::with_capacity(asts.len());
        for ast in &asts {
            results.push(self.execute(ast, &ctx, 0).await?);
        }
        Ok(results)
    }

    /// Execute one resolved statement
    pub fn execute<'a>(
        &'a mut self,
        ast: &'a AstResult,
        ctx: &'a ExecContext,
        depth: usize,
    ) -> BoxFuture<'a, DqlResult<QueryResult>> {
        Box::pin(async move {
            let started = Instant::now();
            debug!(
                workspace = %ctx.workspace,
                namespace = %ast.namespace,
                kind = ast.stmt.kind(),
                query = %ast.query_text(),
                "executing statement"
            );

            let mut result = match (&ast.stmt, &ast.native) {
                (Stmt::Query(q), NativeQuery::Statement { text }) => {
                    self.metric_query(q, text, ctx).await?
                }
                (Stmt::Query(q), NativeQuery::Search { plan }) => {
                    self.document_query(q, ast.namespace, plan, ctx).await?
                }
                (Stmt::Show(_), NativeQuery::Statement { text }) => {
                    let rows = self.run_statement(&ctx.workspace, text).await?;
                    QueryResult::from_series(valid_series(rows))
                }
                (Stmt::Show(_), NativeQuery::Search { plan }) => {
                    self.document_show(ast.namespace, plan, ctx).await?
                }
                (Stmt::Lambda(l), _) => self.lambda(l, ctx, depth).await?,
                (Stmt::OuterFuncs(o), _) => self.outer(o, ctx, depth).await?,
                (Stmt::DeleteFunc(d), _) => self.delete(d, ctx, depth).await?,
                (Stmt::Func(f), _) => self.func(f, ctx, depth).await?,
                (stmt, _) => {
                    return Err(DqlError::NotImplemented(format!(
                        "{} statement on namespace {}",
                        stmt.kind(),
                        ast.namespace
                    )))
                }
            };

            if ctx.explain && result.raw_query.is_none() {
                let text = ast.query_text();
                if !text.is_empty() {
                    result.raw_query = Some(text);
                }
            }
            result.cost = format_cost(started);
            Ok(result)
        })
    }

    fn compile_inner(&self, text: &str, ctx: &ExecContext, depth: usize) -> DqlResult<AstResult> {
        if depth >= MAX_NESTING {
            return Err(DqlError::query(format!(
                "inner queries nest deeper than {} levels",
                MAX_NESTING
            )));
        }
        self.compiler.compile_single(text, &ctx.params, ctx.now_ms)
    }

    fn resolve_query(&self, q: &DFQuery, ctx: &ExecContext) -> DqlResult<AstResult> {
        let tctx = TranslateContext {
            search: self.compiler.search.clone(),
            now_ms: ctx.now_ms,
        };
        resolve(&Stmt::Query(q.clone()), &tctx)
    }

    // ------------------------------------------------------------------
    // Time series
    // ------------------------------------------------------------------

    fn connection(&mut self, workspace: &str) -> DqlResult<Connection> {
        let info = match self.workspaces.get(workspace) {
            Some(info) => info.clone(),
            None => {
                let info = self.backends.directory.lookup(workspace)?;
                self.workspaces.insert(workspace.to_string(), info.clone());
                info
            }
        };
        let client = match self.clients.get(&info.instance) {
            Some(client) => client.clone(),
            None => {
                let client = self.backends.timeseries.connect(&info.instance)?;
                debug!(workspace, instance = %info.instance, "opened time-series connection");
                self.clients.insert(info.instance.clone(), client.clone());
                client
            }
        };
        Ok(Connection { info, client })
    }

    async fn run_statement(&mut self, workspace: &str, statement: &str) -> DqlResult<Vec<Row>> {
        let conn = self.connection(workspace)?;
        let query = TsQuery {
            statement: statement.to_string(),
            database: conn.info.database.clone(),
            retention_policy: conn.info.retention_policy.clone(),
            precision: self.precision.clone(),
        };
        conn.client.query(&query).await.map_err(|e| {
            error!(workspace, statement, error = %e, "time-series query failed");
            DqlError::query(e.to_string())
        })
    }

    async fn metric_query(
        &mut self,
        q: &DFQuery,
        text: &str,
        ctx: &ExecContext,
    ) -> DqlResult<QueryResult> {
        let mut series = valid_series(self.run_statement(&ctx.workspace, text).await?);
        rewrite_metric(q, &mut series)?;
        let mut result = QueryResult::from_series(series);
        result.group_by = q.group_by.clone();
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    async fn indices(
        &self,
        ns: Namespace,
        ctx: &ExecContext,
        start: Option<i64>,
        end: Option<i64>,
    ) -> DqlResult<Vec<String>> {
        let ns = if ctx.backup && ns == Namespace::Logging {
            Namespace::BackupLogging
        } else {
            ns
        };
        let base = ns
            .index_name(&ctx.workspace)
            .ok_or_else(|| DqlError::InvalidNamespace(ns.code().to_string()))?;
        if let Some(cache) = &self.index_cache {
            let found = cache.time_range_indices(&base, start, end).await;
            if !found.is_empty() {
                return Ok(found);
            }
        }
        Ok(vec![base])
    }

    async fn document_query(
        &mut self,
        q: &DFQuery,
        ns: Namespace,
        plan: &SearchPlan,
        ctx: &ExecContext,
    ) -> DqlResult<QueryResult> {
        let indices = self
            .indices(ns, ctx, plan.helper.start_time, plan.helper.end_time)
            .await?;
        let response = self
            .backends
            .search
            .search(&indices, &plan.body)
            .await
            .map_err(search_error)?;
        let mut result = normalize_search(&response, &plan.helper)?;
        if plan.helper.has_date_histogram() {
            reconcile_document(q, &plan.helper, &mut result.series)?;
        }
        Ok(result)
    }

    async fn document_show(
        &mut self,
        ns: Namespace,
        plan: &SearchPlan,
        ctx: &ExecContext,
    ) -> DqlResult<QueryResult> {
        let indices = self
            .indices(ns, ctx, plan.helper.start_time, plan.helper.end_time)
            .await?;
        if plan.helper.show == Some(ShowKind::Fields) {
            let mapping = self
                .backends
                .search
                .mapping(&indices.join(","))
                .await
                .map_err(search_error)?;
            return Ok(normalize_mapping(&mapping));
        }
        let response = self
            .backends
            .search
            .search(&indices, &plan.body)
            .await
            .map_err(search_error)?;
        normalize_search(&response, &plan.helper)
    }

    // ------------------------------------------------------------------
    // Composite statements
    // ------------------------------------------------------------------

    async fn run_query(
        &mut self,
        q: &DFQuery,
        ctx: &ExecContext,
        depth: usize,
    ) -> DqlResult<QueryResult> {
        let ast = self.resolve_query(q, ctx)?;
        self.execute(&ast, ctx, depth + 1).await
    }

    async fn lambda(&mut self, l: &Lambda, ctx: &ExecContext, depth: usize) -> DqlResult<QueryResult> {
        let specs = join_specs(&l.with, l.right.len())?;
        match l.kind {
            LambdaKind::Filter => {
                let mut left = l.left.clone();
                for (right, spec) in l.right.iter().zip(&specs) {
                    let found = self.run_query(right, ctx, depth).await?;
                    let values = column_values(&found.series, &spec.right);
                    match filter_condition(&spec.left, spec.op, &values) {
                        Some(cond) => left.conditions.push(cond),
                        None if spec.op == BinOp::Ne => {}
                        None => return Ok(QueryResult::default()),
                    }
                }
                self.run_query(&left, ctx, depth).await
            }
            LambdaKind::Link => {
                let mut result = self.run_query(&l.left, ctx, depth).await?;
                for (right, spec) in l.right.iter().zip(&specs) {
                    let values = column_values(&result.series, &spec.left);
                    let found = match membership_condition(&spec.right, &values) {
                        Some(cond) => {
                            let mut right = right.clone();
                            right.conditions.push(cond);
                            self.run_query(&right, ctx, depth).await?.series
                        }
                        None => Vec::new(),
                    };
                    result.series = link(std::mem::take(&mut result.series), &found, spec);
                }
                Ok(result)
            }
        }
    }

    async fn outer(&mut self, o: &OuterFuncs, ctx: &ExecContext, depth: usize) -> DqlResult<QueryResult> {
        let inner = self.compile_inner(o.inner_query()?, ctx, depth)?;
        let found = self.execute(&inner, ctx, depth + 1).await?;
        let mut result = QueryResult::from_series(apply_chain(&o.funcs, found.series)?);
        result.raw_query = found.raw_query;
        Ok(result)
    }

    async fn delete(&mut self, d: &DeleteFunc, ctx: &ExecContext, depth: usize) -> DqlResult<QueryResult> {
        let plan = match &d.target {
            DeleteTarget::Dql(text) => {
                let inner = self.compile_inner(text, ctx, depth)?;
                plan_query_delete(&inner, &ctx.workspace, &self.compiler.search, ctx.now_ms)?
            }
            other => plan_direct_delete(other, &ctx.workspace)?,
        };

        match &plan {
            DeletePlan::Statement(text) => {
                self.run_statement(&ctx.workspace, text).await?;
            }
            DeletePlan::ByQuery { index, body } => {
                self.backends
                    .search
                    .delete_by_query(index, body)
                    .await
                    .map_err(search_error)?;
            }
        }
        info!(workspace = %ctx.workspace, query = %plan.raw_query(), "delete executed");

        Ok(QueryResult {
            raw_query: Some(plan.raw_query()),
            ..Default::default()
        })
    }

    async fn func(&mut self, f: &FuncCall, ctx: &ExecContext, depth: usize) -> DqlResult<QueryResult> {
        let mut plan = plan_call(f)?;
        for inner in plan.inner.clone() {
            let ast = self.compile_inner(&inner.dql, ctx, depth)?;
            if ast.namespace == Namespace::Func {
                return Err(DqlError::parse("function calls cannot be nested in dql()"));
            }
            let found = self.execute(&ast, ctx, depth + 1).await?;
            plan.fill_inner(&inner.key, &found.series)?;
        }

        let request = plan.into_request(&ctx.workspace);
        let rows = self.backends.functions.call(&request).await.map_err(|e| {
            error!(function = %request.function, error = %e, "function call failed");
            DqlError::query(e.to_string())
        })?;

        let mut result = QueryResult::from_series(rows);
        if ctx.explain {
            result.raw_query = serde_json::to_string(&request).ok();
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Debug passthrough
    // ------------------------------------------------------------------

    /// Run a native query as-is and return the raw backend answer
    pub async fn debug_query(&mut self, workspace: &str, namespace: &str, query: &str) -> DqlResult<Json> {
        let ns = Namespace::from_code(namespace)?;
        if ns == Namespace::Metric {
            let rows = self.run_statement(workspace, query).await?;
            return serde_json::to_value(rows)
                .map_err(|e| DqlError::query(format!("failed to encode rows: {}", e)));
        }
        if !ns.is_document() {
            return Err(DqlError::NotImplemented(format!("debug query on namespace {}", ns)));
        }

        let body: Json = serde_json::from_str(query)
            .map_err(|e| DqlError::parse(format!("debug query body is not JSON: {}", e)))?;
        let ctx = ExecContext {
            workspace: workspace.to_string(),
            params: ExtraParam::from_limits(&self.compiler.limits),
            explain: false,
            backup: false,
            now_ms: Utc::now().timestamp_millis(),
        };
        let indices = self.indices(ns, &ctx, None, None).await?;
        self.backends
            .search
            .search(&indices, &body)
            .await
            .map_err(search_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackends;
    use crate::backend::IndexInfo;
    use crate::query::Value;
    use crate::warmup::WarmupConfig;
    use serde_json::json;

    fn executor(mocks: &MockBackends) -> Executor {
        Executor::new(mocks.backends.clone(), Compiler::default(), None, "ms")
    }

    async fn run(exec: &mut Executor, text: &str) -> DqlResult<Vec<QueryResult>> {
        exec.run_spec("ws1", &QuerySpec::new(text), false, false).await
    }

    fn cpu_row(values: Vec<Vec<Value>>) -> Row {
        Row::new("cpu", vec!["time".into(), "usage".into()]).with_values(values)
    }

    #[tokio::test]
    async fn test_metric_query_renames_and_caches_connection() {
        let mocks = MockBackends::new();
        mocks.timeseries.reply(
            "FROM \"cpu\"",
            vec![Row::new("cpu", vec!["time".into(), "mean".into()])
                .with_values(vec![vec![Value::Int(1), Value::Float(0.5)]])],
        );
        let mut exec = executor(&mocks);

        let results = run(&mut exec, "cpu:(avg(usage))").await.unwrap();
        assert_eq!(results[0].series[0].columns, vec!["time", "avg(usage)"]);
        assert!(!results[0].cost.is_empty());
        run(&mut exec, "cpu:(avg(usage))").await.unwrap();

        assert_eq!(exec.connection_count(), 1);
        assert_eq!(mocks.timeseries.connects.lock().unwrap().len(), 1);
        let calls = mocks.timeseries.calls.lock().unwrap();
        assert_eq!(calls[0].database, "ws1");
        assert_eq!(calls[0].precision, "ms");
    }

    #[tokio::test]
    async fn test_workspaces_on_one_instance_share_a_client() {
        let mocks = MockBackends::new();
        let mut exec = executor(&mocks);
        for workspace in ["ws1", "ws2", "ws1"] {
            exec.run_spec(workspace, &QuerySpec::new("cpu:(usage)"), false, false)
                .await
                .unwrap();
        }

        assert_eq!(exec.connection_count(), 1);
        assert_eq!(*mocks.timeseries.connects.lock().unwrap(), vec!["ts0".to_string()]);
        let databases: Vec<String> = mocks
            .timeseries
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|q| q.database.clone())
            .collect();
        assert_eq!(databases, vec!["ws1", "ws2", "ws1"]);
    }

    #[tokio::test]
    async fn test_explain_echoes_native_query() {
        let mocks = MockBackends::new();
        let mut exec = executor(&mocks);
        let results = exec
            .run_spec("ws1", &QuerySpec::new("cpu:(usage)"), true, false)
            .await
            .unwrap();
        assert!(results[0].raw_query.as_deref().unwrap().starts_with("SELECT \"usage\""));
    }

    #[tokio::test]
    async fn test_backend_failure_is_query_error() {
        let mocks = MockBackends::new();
        mocks.timeseries.fail("cpu", BackendError::Rejected("boom".into()));
        let mut exec = executor(&mocks);
        assert!(matches!(run(&mut exec, "cpu:(usage)").await, Err(DqlError::Query(_))));
    }

    #[tokio::test]
    async fn test_too_many_queries_never_reach_backend() {
        let mocks = MockBackends::new();
        let mut exec = executor(&mocks);
        let text = vec!["cpu:(usage)"; 6].join(";");
        assert!(matches!(
            run(&mut exec, &text).await,
            Err(DqlError::TooManyQueries { max: 5, got: 6 })
        ));
        assert!(mocks.timeseries.statements().is_empty());
    }

    #[tokio::test]
    async fn test_document_query_targets_workspace_index() {
        let mocks = MockBackends::new();
        mocks.search.reply(
            "ws1_logging",
            json!({"hits": {"total": {"value": 1}, "hits": [{"_source": {"time": 5, "message": "hi"}}]}}),
        );
        let mut exec = executor(&mocks);
        let results = run(&mut exec, "L::nginx:(message)").await.unwrap();
        assert_eq!(results[0].series[0].values[0], vec![Value::Int(5), Value::Str("hi".into())]);
        let searches = mocks.search.searches.lock().unwrap();
        assert_eq!(searches[0].0, vec!["ws1_logging".to_string()]);
    }

    #[tokio::test]
    async fn test_backup_reads_backup_index() {
        let mocks = MockBackends::new();
        let mut exec = executor(&mocks);
        exec.run_spec("ws1", &QuerySpec::new("L::nginx:(message)"), false, true)
            .await
            .unwrap();
        let searches = mocks.search.searches.lock().unwrap();
        assert_eq!(searches[0].0, vec!["ws1_backup_log".to_string()]);
    }

    #[tokio::test]
    async fn test_rollover_indices_from_cache() {
        let mocks = MockBackends::new();
        mocks.search.set_indices(vec![
            IndexInfo { name: "ws1_logging-000001".into(), created_ms: 0 },
            IndexInfo { name: "ws1_logging-000002".into(), created_ms: 1 },
        ]);
        let cache = Arc::new(IndexCache::new(mocks.search.clone(), WarmupConfig::default()));
        cache.refresh().await.unwrap();
        let mut exec = Executor::new(mocks.backends.clone(), Compiler::default(), Some(cache), "ms");
        run(&mut exec, "L::nginx:(message)").await.unwrap();
        let searches = mocks.search.searches.lock().unwrap();
        assert_eq!(searches[0].0.len(), 2);
    }

    #[tokio::test]
    async fn test_lambda_filter_narrows_left_query() {
        let mocks = MockBackends::new();
        mocks.search.reply(
            "ws1_object",
            json!({"hits": {"hits": [
                {"_source": {"last_update_time": 1, "name": "web-1"}},
                {"_source": {"last_update_time": 2, "name": "web-2"}}
            ]}}),
        );
        let mut exec = executor(&mocks);
        run(&mut exec, "cpu:(usage) FILTER O::host:(name) WITH {host = name}")
            .await
            .unwrap();
        let statements = mocks.timeseries.statements();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("'web-1'"), "{}", statements[0]);
        assert!(statements[0].contains("'web-2'"), "{}", statements[0]);
    }

    #[tokio::test]
    async fn test_lambda_filter_without_matches_is_empty() {
        let mocks = MockBackends::new();
        let mut exec = executor(&mocks);
        let results = run(&mut exec, "cpu:(usage) FILTER O::host:(name) WITH {host = name}")
            .await
            .unwrap();
        assert!(results[0].series.is_empty());
        assert!(mocks.timeseries.statements().is_empty());
    }

    #[tokio::test]
    async fn test_lambda_link_joins_right_rows() {
        let mocks = MockBackends::new();
        mocks.search.reply(
            "ws1_object",
            json!({"hits": {"hits": [
                {"_source": {"last_update_time": 1, "name": "a"}},
                {"_source": {"last_update_time": 2, "name": "b"}}
            ]}}),
        );
        mocks.timeseries.reply(
            "FROM \"cpu\"",
            vec![Row::new("cpu", vec!["time".into(), "host".into(), "usage".into()])
                .with_values(vec![vec![Value::Int(9), Value::Str("a".into()), Value::Int(10)]])],
        );
        let mut exec = executor(&mocks);
        let results = run(&mut exec, "O::host:(name) LINK cpu:(host, usage) WITH {name = host}")
            .await
            .unwrap();
        let row = &results[0].series[0];
        assert_eq!(row.columns, vec!["time", "name", "time_1", "usage"]);
        assert_eq!(row.values[0][3], Value::Int(10));
        assert_eq!(row.values[1][3], Value::Null);
        assert!(mocks.timeseries.statements()[0].contains("'a'"));
    }

    #[tokio::test]
    async fn test_outer_function_over_inner_query() {
        let mocks = MockBackends::new();
        mocks.timeseries.reply(
            "FROM \"cpu\"",
            vec![cpu_row(vec![
                vec![Value::Int(1000), Value::Int(1)],
                vec![Value::Int(2000), Value::Int(4)],
            ])],
        );
        let mut exec = executor(&mocks);
        let results = run(&mut exec, "difference(dql='cpu:(usage)')").await.unwrap();
        assert_eq!(results[0].series[0].values, vec![vec![Value::Int(2000), Value::Float(3.0)]]);
    }

    #[tokio::test]
    async fn test_delete_measurement_and_index() {
        let mocks = MockBackends::new();
        let mut exec = executor(&mocks);

        let results = run(&mut exec, "delete(measurement='cpu')").await.unwrap();
        assert_eq!(
            results[0].raw_query.as_deref(),
            Some("delete by query: drop measurement \"cpu\"")
        );
        assert!(results[0].series.is_empty());

        run(&mut exec, "delete(index='logging')").await.unwrap();
        let deletes = mocks.search.deletes.lock().unwrap();
        assert_eq!(deletes[0].0, "ws1_logging");
    }

    #[tokio::test]
    async fn test_delete_by_inner_query() {
        let mocks = MockBackends::new();
        let mut exec = executor(&mocks);
        run(&mut exec, "delete(dql='cpu:(usage) {host = \"a\"}')").await.unwrap();
        let statements = mocks.timeseries.statements();
        assert!(statements[0].starts_with("delete from \"cpu\""), "{}", statements[0]);
    }

    #[tokio::test]
    async fn test_func_runs_inner_queries_first() {
        let mocks = MockBackends::new();
        mocks
            .timeseries
            .reply("FROM \"cpu\"", vec![cpu_row(vec![vec![Value::Int(1), Value::Int(2)]])]);
        mocks
            .functions
            .reply(vec![Row::new("out", vec!["score".into()]).with_values(vec![vec![Value::Int(7)]])]);
        let mut exec = executor(&mocks);

        let results = run(&mut exec, "F::anomaly:(detect(data=dql('cpu:(usage)')))")
            .await
            .unwrap();
        assert_eq!(results[0].series[0].name, "out");
        let calls = mocks.functions.calls.lock().unwrap();
        assert_eq!(calls[0].function, "anomaly.detect");
        assert_eq!(calls[0].kwargs["data"][0]["values"], json!([[1, 2]]));
    }

    #[tokio::test]
    async fn test_show_fields_reads_mapping() {
        let mocks = MockBackends::new();
        mocks.search.mapping_for(
            "ws1_logging",
            json!({"ws1_logging": {"mappings": {"properties": {"status": {"type": "long"}}}}}),
        );
        let mut exec = executor(&mocks);
        let results = run(&mut exec, "show_logging_field()").await.unwrap();
        assert_eq!(results[0].series[0].columns, vec!["fieldKey", "fieldType"]);
    }

    #[tokio::test]
    async fn test_debug_query_passthrough() {
        let mocks = MockBackends::new();
        mocks.search.reply("ws1_rum", json!({"took": 1}));
        let mut exec = executor(&mocks);
        let raw = exec
            .debug_query("ws1", "R", r#"{"size": 0}"#)
            .await
            .unwrap();
        assert_eq!(raw, json!({"took": 1}));
        assert_eq!(mocks.search.last_body(), Some(json!({"size": 0})));
        assert!(matches!(
            exec.debug_query("ws1", "R", "not json").await,
            Err(DqlError::Parse(_))
        ));
    }
}
