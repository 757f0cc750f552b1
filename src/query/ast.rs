//! DQL Abstract Syntax Tree
//!
//! A query text parses into one or more [`Stmt`] values. The statement set is
//! closed: every statement maps onto exactly one [`Namespace`] during
//! resolution.
//!
//! # Example Queries
//!
//! ```text
//! M::cpu:(avg(usage)) {host="a"} [1h::5m] BY region
//! L::nginx:(message) {status >= 500} LIMIT 10
//! difference(dql="M::cpu:(usage) [10m]").cumsum()
//! cpu:(f1, host) FILTER O::ecs:(host) {state="running"} WITH {host = host}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::query::error::{DqlError, DqlResult};

/// Backend family a statement targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Metric,
    Object,
    Logging,
    Event,
    Tracing,
    Rum,
    Security,
    BackupLogging,
    Func,
    Lambda,
    OuterFunc,
    DeleteFunc,
}

impl Namespace {
    /// Resolve a namespace prefix written in a query.
    ///
    /// An empty prefix means the metric store. Only the storage namespaces and
    /// `func` can be named explicitly; the composite namespaces come from the
    /// statement shape.
    pub fn from_code(code: &str) -> DqlResult<Self> {
        match code {
            "" | "M" | "metric" => Ok(Namespace::Metric),
            "O" | "object" => Ok(Namespace::Object),
            "L" | "logging" => Ok(Namespace::Logging),
            "E" | "event" | "keyevent" => Ok(Namespace::Event),
            "T" | "tracing" => Ok(Namespace::Tracing),
            "R" | "rum" => Ok(Namespace::Rum),
            "S" | "security" => Ok(Namespace::Security),
            "BL" | "backup_log" => Ok(Namespace::BackupLogging),
            "F" | "func" => Ok(Namespace::Func),
            other => Err(DqlError::InvalidNamespace(other.to_string())),
        }
    }

    /// Canonical short code
    pub fn code(&self) -> &'static str {
        match self {
            Namespace::Metric => "M",
            Namespace::Object => "O",
            Namespace::Logging => "L",
            Namespace::Event => "E",
            Namespace::Tracing => "T",
            Namespace::Rum => "R",
            Namespace::Security => "S",
            Namespace::BackupLogging => "BL",
            Namespace::Func => "F",
            Namespace::Lambda => "lambda",
            Namespace::OuterFunc => "outer_func",
            Namespace::DeleteFunc => "delete_func",
        }
    }

    /// Whether statements in this namespace run against the search backend
    pub fn is_document(&self) -> bool {
        matches!(
            self,
            Namespace::Object
                | Namespace::Logging
                | Namespace::Event
                | Namespace::Tracing
                | Namespace::Rum
                | Namespace::Security
                | Namespace::BackupLogging
        )
    }

    /// Suffix of the per-workspace search index for document namespaces
    pub fn index_suffix(&self) -> Option<&'static str> {
        match self {
            Namespace::Object => Some("object"),
            Namespace::Logging => Some("logging"),
            Namespace::Event => Some("keyevent"),
            Namespace::Tracing => Some("tracing"),
            Namespace::Rum => Some("rum"),
            Namespace::Security => Some("security"),
            Namespace::BackupLogging => Some("backup_log"),
            _ => None,
        }
    }

    /// Search index name for a workspace, if this is a document namespace
    pub fn index_name(&self, workspace: &str) -> Option<String> {
        self.index_suffix()
            .map(|suffix| format!("{}_{}", workspace, suffix))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Binary operators, lowest precedence first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    NotIn,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinOp::Or => "or",
            BinOp::And => "and",
            BinOp::Eq => "=",
            BinOp::Ne => "!=",
            BinOp::Gt => ">",
            BinOp::Lt => "<",
            BinOp::Gte => ">=",
            BinOp::Lte => "<=",
            BinOp::In => "in",
            BinOp::NotIn => "not in",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Gt | BinOp::Lt | BinOp::Gte | BinOp::Lte
        )
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod
        )
    }
}

/// Function call with positional and named arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub name: String,
    pub args: Vec<Expr>,
    pub kwargs: Vec<(String, Expr)>,
}

impl Call {
    pub fn new(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self {
            name: name.into(),
            args,
            kwargs: Vec::new(),
        }
    }

    /// Look up a named argument
    pub fn kwarg(&self, name: &str) -> Option<&Expr> {
        self.kwargs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Positional argument at `idx`, or the named one when absent
    pub fn arg(&self, idx: usize, name: &str) -> Option<&Expr> {
        self.kwarg(name).or_else(|| self.args.get(idx))
    }
}

/// Expression node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Nil,
    Star,
    Regex(String),
    List(Vec<Expr>),
    Call(Call),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Paren(Box<Expr>),
}

impl Expr {
    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Join a list of conditions with AND; `None` when the list is empty
    pub fn and_all(conds: Vec<Expr>) -> Option<Expr> {
        conds
            .into_iter()
            .reduce(|acc, next| Expr::binary(BinOp::And, acc, next))
    }

    /// Join a list of conditions with OR, parenthesized
    pub fn or_all(conds: Vec<Expr>) -> Option<Expr> {
        conds
            .into_iter()
            .reduce(|acc, next| Expr::binary(BinOp::Or, acc, next))
            .map(|e| Expr::Paren(Box::new(e)))
    }

    /// Field name for identifiers and strings used as field references
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Expr::Ident(s) | Expr::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Expr::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Expr::Int(i) => Some(*i as f64),
            Expr::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<&Call> {
        match self {
            Expr::Call(c) => Some(c),
            _ => None,
        }
    }

    /// Whether the expression is a literal value
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            Expr::Str(_) | Expr::Int(_) | Expr::Float(_) | Expr::Bool(_) | Expr::Nil
        )
    }

    /// Visit every node depth-first
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::List(items) => items.iter().for_each(|e| e.walk(f)),
            Expr::Call(c) => {
                c.args.iter().for_each(|e| e.walk(f));
                c.kwargs.iter().for_each(|(_, e)| e.walk(f));
            }
            Expr::Binary { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            Expr::Paren(inner) => inner.walk(f),
            _ => {}
        }
    }
}

fn is_plain_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str, quote: char) -> fmt::Result {
    write!(f, "{}", quote)?;
    for c in s.chars() {
        if c == quote || c == '\\' {
            write!(f, "\\")?;
        }
        write!(f, "{}", c)?;
    }
    write!(f, "{}", quote)
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Ident(name) => {
                if is_plain_ident(name) {
                    write!(f, "{}", name)
                } else {
                    write_quoted(f, name, '`')
                }
            }
            Expr::Str(s) => write_quoted(f, s, '\''),
            Expr::Int(i) => write!(f, "{}", i),
            Expr::Float(x) => write!(f, "{:?}", x),
            Expr::Bool(b) => write!(f, "{}", b),
            Expr::Nil => write!(f, "nil"),
            Expr::Star => write!(f, "*"),
            Expr::Regex(r) => {
                write!(f, "re(")?;
                write_quoted(f, r, '\'')?;
                write!(f, ")")
            }
            Expr::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Expr::Call(call) => write!(f, "{}", call),
            Expr::Binary { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op.as_str(), rhs),
            Expr::Paren(inner) => write!(f, "({})", inner),
        }
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        let mut first = true;
        for arg in &self.args {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}", arg)?;
        }
        for (name, arg) in &self.kwargs {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}={}", name, arg)?;
        }
        write!(f, ")")
    }
}

/// Fill policy attached to a target with `fill(expr, policy)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Fill {
    Nil,
    Int(i64),
    Float(f64),
    Str(String),
    Previous,
    Linear,
}

impl Fill {
    /// Constant fills carry a literal; previous and linear are computed
    pub fn constant(&self) -> Option<crate::query::Value> {
        use crate::query::Value;
        match self {
            Fill::Nil => Some(Value::Null),
            Fill::Int(i) => Some(Value::Int(*i)),
            Fill::Float(x) => Some(Value::Float(*x)),
            Fill::Str(s) => Some(Value::Str(s.clone())),
            Fill::Previous | Fill::Linear => None,
        }
    }
}

/// One selected column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub expr: Expr,
    pub alias: Option<String>,
    pub fill: Option<Fill>,
}

impl Target {
    pub fn new(expr: Expr) -> Self {
        Self {
            expr,
            alias: None,
            fill: None,
        }
    }

    /// Column name this target produces: the alias, or the expression text
    pub fn column_name(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => self.expr.to_string(),
        }
    }
}

/// Query source: a measurement/class name or a regex over names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Source {
    Name(String),
    Regex(String),
}

impl Source {
    pub fn text(&self) -> &str {
        match self {
            Source::Name(s) | Source::Regex(s) => s,
        }
    }
}

/// Time range bound
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TimeBound {
    /// Unix milliseconds
    Absolute(i64),
    /// Milliseconds before now
    Relative(i64),
}

impl TimeBound {
    pub fn to_millis(&self, now_ms: i64) -> i64 {
        match self {
            TimeBound::Absolute(ms) => *ms,
            TimeBound::Relative(ago) => now_ms - ago,
        }
    }
}

/// Bucket resolution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Resolution {
    /// Fixed interval in milliseconds
    Interval(i64),
    /// Derived from the range and a point count
    Auto(Option<i64>),
}

/// `[start:end:resolution]`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<TimeBound>,
    pub end: Option<TimeBound>,
    pub resolution: Option<Resolution>,
}

impl TimeRange {
    /// Absolute start in ms, when it has been resolved
    pub fn start_ms(&self) -> Option<i64> {
        match self.start {
            Some(TimeBound::Absolute(ms)) => Some(ms),
            _ => None,
        }
    }

    pub fn end_ms(&self) -> Option<i64> {
        match self.end {
            Some(TimeBound::Absolute(ms)) => Some(ms),
            _ => None,
        }
    }

    /// Fixed bucket interval in ms
    pub fn interval_ms(&self) -> Option<i64> {
        match self.resolution {
            Some(Resolution::Interval(ms)) if ms > 0 => Some(ms),
            _ => None,
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |b: &Option<TimeBound>| match b {
            Some(TimeBound::Absolute(ms)) => format!("{}", ms),
            Some(TimeBound::Relative(ago)) => format!("{}ms", ago),
            None => String::new(),
        };
        write!(f, "[{}:{}", bound(&self.start), bound(&self.end))?;
        match self.resolution {
            Some(Resolution::Interval(ms)) => write!(f, ":{}ms]", ms),
            Some(Resolution::Auto(Some(n))) => write!(f, ":auto({})]", n),
            Some(Resolution::Auto(None)) => write!(f, ":auto]"),
            None => write!(f, "]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: OrderDirection,
}

/// Select-like query
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DFQuery {
    /// Namespace prefix as written; empty means metric
    pub namespace: String,
    pub sources: Vec<Source>,
    /// Empty means all columns
    pub targets: Vec<Target>,
    /// AND-ed conditions
    pub conditions: Vec<Expr>,
    pub time_range: Option<TimeRange>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub slimit: Option<i64>,
    pub soffset: Option<i64>,
    pub timezone: Option<String>,
    pub search_after: Option<Vec<serde_json::Value>>,
    pub highlight: bool,
}

impl DFQuery {
    pub fn is_all_targets(&self) -> bool {
        self.targets.is_empty() || self.targets.iter().all(|t| t.expr == Expr::Star)
    }

    /// Bucket interval when the query aggregates over time
    pub fn interval_ms(&self) -> Option<i64> {
        self.time_range.as_ref().and_then(|tr| tr.interval_ms())
    }
}

/// Introspection query, e.g. `show_measurement()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Show {
    pub namespace: String,
    pub func: Call,
    pub conditions: Vec<Expr>,
    pub time_range: Option<TimeRange>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Show {
    /// Whether this lists field mappings rather than class names
    pub fn is_field_listing(&self) -> bool {
        self.func.name.ends_with("_field")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LambdaKind {
    Filter,
    Link,
}

/// Two-sided correlation query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lambda {
    pub kind: LambdaKind,
    pub left: DFQuery,
    pub right: Vec<DFQuery>,
    /// `left_col op right_col` join conditions
    pub with: Vec<Expr>,
}

/// Chain of post-hoc transforms over one inner query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OuterFuncs {
    pub funcs: Vec<Call>,
}

impl OuterFuncs {
    /// Inner DQL text carried by the first function
    pub fn inner_query(&self) -> DqlResult<&str> {
        self.funcs
            .first()
            .and_then(|f| f.arg(0, "dql"))
            .and_then(|e| match e {
                Expr::Str(s) => Some(s.as_str()),
                _ => None,
            })
            .ok_or_else(|| DqlError::parse("outer function requires a dql string argument"))
    }
}

/// What a `delete(...)` statement removes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeleteTarget {
    /// Re-run a single query as a delete
    Dql(String),
    /// Drop a whole time-series measurement
    Measurement(String),
    /// Remove every document from a namespace index
    Index(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteFunc {
    pub target: DeleteTarget,
}

/// Call delegated to the function service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncCall {
    pub module: String,
    pub call: Call,
}

impl FuncCall {
    /// Function name sent to the service
    pub fn function_name(&self) -> String {
        if self.module.is_empty() {
            self.call.name.clone()
        } else {
            format!("{}.{}", self.module, self.call.name)
        }
    }
}

/// One parsed statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Query(DFQuery),
    Show(Show),
    Lambda(Lambda),
    OuterFuncs(OuterFuncs),
    DeleteFunc(DeleteFunc),
    Func(FuncCall),
}

impl Stmt {
    /// Variant name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Stmt::Query(_) => "query",
            Stmt::Show(_) => "show",
            Stmt::Lambda(_) => "lambda",
            Stmt::OuterFuncs(_) => "outer_funcs",
            Stmt::DeleteFunc(_) => "delete",
            Stmt::Func(_) => "func",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_codes() {
        assert_eq!(Namespace::from_code("").unwrap(), Namespace::Metric);
        assert_eq!(Namespace::from_code("O").unwrap(), Namespace::Object);
        assert_eq!(Namespace::from_code("keyevent").unwrap(), Namespace::Event);
        assert_eq!(
            Namespace::from_code("BL").unwrap(),
            Namespace::BackupLogging
        );
        assert!(matches!(
            Namespace::from_code("Q"),
            Err(DqlError::InvalidNamespace(_))
        ));
    }

    #[test]
    fn test_index_names() {
        assert_eq!(
            Namespace::Event.index_name("ws1"),
            Some("ws1_keyevent".to_string())
        );
        assert_eq!(
            Namespace::BackupLogging.index_name("ws1"),
            Some("ws1_backup_log".to_string())
        );
        assert_eq!(Namespace::Metric.index_name("ws1"), None);
    }

    #[test]
    fn test_expr_display() {
        let e = Expr::Call(Call::new("max", vec![Expr::Ident("a".into())]));
        assert_eq!(e.to_string(), "max(a)");

        let cond = Expr::binary(BinOp::Eq, Expr::Ident("host".into()), Expr::Str("it's".into()));
        assert_eq!(cond.to_string(), "host = 'it\\'s'");

        assert_eq!(Expr::Ident("a b".into()).to_string(), "`a b`");
        assert_eq!(Expr::Float(1.0).to_string(), "1.0");
    }

    #[test]
    fn test_target_column_name() {
        let mut t = Target::new(Expr::Call(Call::new("avg", vec![Expr::Ident("x".into())])));
        assert_eq!(t.column_name(), "avg(x)");
        t.alias = Some("mean".into());
        assert_eq!(t.column_name(), "mean");
    }

    #[test]
    fn test_and_or_all() {
        assert!(Expr::and_all(vec![]).is_none());
        let joined = Expr::or_all(vec![Expr::Int(1), Expr::Int(2)]).unwrap();
        assert_eq!(joined.to_string(), "(1 or 2)");
    }
}
