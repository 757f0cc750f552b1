//! DQL Front End
//!
//! Turns query text into resolved, backend-native queries:
//!
//! - **Parser**: DQL text into [`Stmt`] values
//! - **Params**: per-request extras folded into each statement
//! - **Resolver**: namespace classification and translation
//! - **InfluxQL / Search**: the two backend dialects
//!
//! # Query Language
//!
//! ```text
//! [namespace::]source:(targets) [{conditions}] [[start:end:resolution]]
//!     [BY tags] [ORDER BY col] [LIMIT n] [OFFSET n] [SLIMIT n] [SOFFSET n]
//! ```
//!
//! # Examples
//!
//! ```rust,ignore
//! use dql_engine::query::{Compiler, QuerySpec};
//!
//! let compiler = Compiler::default();
//! let results = compiler.compile(&QuerySpec::new("M::cpu:(avg(usage)) [1h::5m] BY host"), now_ms)?;
//! println!("{} => {}", results[0].namespace, results[0].query_text());
//! ```

pub mod ast;
pub mod error;
pub mod influxql;
pub mod params;
pub mod parser;
pub mod resolver;
pub mod search;
pub mod value;

pub use ast::{Namespace, Stmt};
pub use error::{DqlError, DqlResult};
pub use params::{ExtraParam, QueryLimits, QuerySpec};
pub use parser::{parse_conditions, parse_dql, parse_duration};
pub use resolver::{AstResult, Compiler, NativeQuery, MAX_PARSE_RESULTS};
pub use search::{Helper, SearchLimits, SearchPlan};
pub use value::Value;
