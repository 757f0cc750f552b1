//! DQL error types
//!
//! Every failure surfaced by the engine maps onto one of a fixed set of
//! error kinds. Each kind carries a stable code and an HTTP-style status
//! class so the front door never has to inspect type names.

use thiserror::Error;

/// Errors that can occur while compiling or executing DQL
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DqlError {
    /// Malformed query text or invalid parameters
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid fill specification or fill failure
    #[error("fill error: {0}")]
    Fill(String),

    /// Backend execution failure
    #[error("query error: {0}")]
    Query(String),

    /// A single query text compiled into more statements than allowed
    #[error("do not query larger than {max} statements, got {got}")]
    TooManyQueries { max: usize, got: usize },

    /// A result exceeded the configured size
    #[error("too many results: {0}")]
    TooManyResults(String),

    /// Namespace code is not one of the recognized codes
    #[error("invalid namespace `{0}'")]
    InvalidNamespace(String),

    /// Statement shape is recognized but not supported
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The worker serving the request crashed
    #[error("query worker crashed: {0}")]
    WorkerCrashed(String),

    /// The search backend rejected or failed the query
    #[error("search query failed: {0}")]
    SearchQueryFailed(String),

    /// The request was not answered within its deadline
    #[error("query timed out after {0}s")]
    Timeout(u64),
}

impl DqlError {
    /// Stable error code reported to callers
    pub fn code(&self) -> &'static str {
        match self {
            DqlError::Parse(_) => "dql.ParseError",
            DqlError::Fill(_) => "dql.FillError",
            DqlError::Query(_) => "dql.QueryError",
            DqlError::TooManyQueries { .. } => "dql.TooManyQueries",
            DqlError::TooManyResults(_) => "dql.TooManyResults",
            DqlError::InvalidNamespace(_) => "dql.InvalidNamespace",
            DqlError::NotImplemented(_) => "dql.NotImplemented",
            DqlError::WorkerCrashed(_) => "dql.QueryWorkerCrashed",
            DqlError::SearchQueryFailed(_) => "dql.SearchQueryFailed",
            DqlError::Timeout(_) => "dql.Timeout",
        }
    }

    /// HTTP status class for this error kind
    pub fn status(&self) -> u16 {
        match self {
            DqlError::Parse(_)
            | DqlError::Fill(_)
            | DqlError::TooManyQueries { .. }
            | DqlError::TooManyResults(_)
            | DqlError::InvalidNamespace(_) => 400,
            DqlError::NotImplemented(_) => 501,
            DqlError::Timeout(_) => 504,
            DqlError::Query(_) | DqlError::WorkerCrashed(_) | DqlError::SearchQueryFailed(_) => {
                500
            }
        }
    }

    /// Whether the error was detected before any backend call
    pub fn is_compile_time(&self) -> bool {
        matches!(
            self,
            DqlError::Parse(_)
                | DqlError::Fill(_)
                | DqlError::TooManyQueries { .. }
                | DqlError::InvalidNamespace(_)
        )
    }

    /// Shorthand used by translators and executors
    pub fn query(msg: impl Into<String>) -> Self {
        DqlError::Query(msg.into())
    }

    /// Shorthand used by the parser and parameter checks
    pub fn parse(msg: impl Into<String>) -> Self {
        DqlError::Parse(msg.into())
    }
}

/// Result type for DQL operations
pub type DqlResult<T> = Result<T, DqlError>;
