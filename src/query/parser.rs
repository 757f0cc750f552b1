//! DQL Parser
//!
//! Parses DQL text into [`Stmt`] values.
//!
//! # Supported Syntax
//!
//! ```text
//! [namespace::]source[, source]:(target[, target]) [{conditions}] [[start:end:resolution]]
//!     [BY tag, ...] [ORDER BY col [ASC|DESC]] [LIMIT n] [OFFSET n]
//!     [SLIMIT n] [SOFFSET n] [TZ('Asia/Shanghai')]
//! query (FILTER | LINK) query WITH {left = right}
//! show_tag_value(cpu, keyin=['host']) {service='redis'} [10m] LIMIT 3
//! difference(dql='M::cpu:(usage) [10m]').cumsum()
//! delete(measurement='cpu')
//! F::module:(call(data=dql('cpu:(usage) [5m]'), key=nil))
//! ```
//!
//! Several statements may be separated with `;`.

use std::sync::OnceLock;

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{char, digit1, multispace0, satisfy},
    combinator::{all_consuming, map, not, opt, peek, recognize, value},
    error::{ErrorKind, FromExternalError, ParseError},
    multi::{many0, many1, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use regex::Regex;

use crate::query::ast::*;
use crate::query::error::{DqlError, DqlResult};

/// Names accepted in an outer-function chain
pub const OUTER_FUNCS: &[&str] = &[
    "abs",
    "avg",
    "count",
    "count_distinct",
    "cumsum",
    "derivative",
    "difference",
    "first",
    "last",
    "log10",
    "log2",
    "max",
    "min",
    "moving_average",
    "non_negative_derivative",
    "non_negative_difference",
    "sum",
];

/// Parse error carrying the remaining input and, for semantic failures, the
/// error to report
#[derive(Debug, PartialEq)]
struct PError<'a> {
    input: &'a str,
    error: Option<DqlError>,
}

impl<'a> ParseError<&'a str> for PError<'a> {
    fn from_error_kind(input: &'a str, _kind: ErrorKind) -> Self {
        PError { input, error: None }
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }

    fn or(self, other: Self) -> Self {
        if self.error.is_some() {
            self
        } else {
            other
        }
    }
}

impl<'a, E: std::fmt::Display> FromExternalError<&'a str, E> for PError<'a> {
    fn from_external_error(input: &'a str, _kind: ErrorKind, e: E) -> Self {
        PError {
            input,
            error: Some(DqlError::Parse(e.to_string())),
        }
    }
}

type PResult<'a, T> = IResult<&'a str, T, PError<'a>>;

fn failure<'a, T>(input: &'a str, error: DqlError) -> PResult<'a, T> {
    Err(nom::Err::Failure(PError {
        input,
        error: Some(error),
    }))
}

fn to_dql_error(source: &str, err: nom::Err<PError<'_>>) -> DqlError {
    match err {
        nom::Err::Error(e) | nom::Err::Failure(e) => match e.error {
            Some(error) => error,
            None => {
                let offset = source.len().saturating_sub(e.input.len());
                let near: String = e.input.chars().take(24).collect();
                DqlError::Parse(format!(
                    "syntax error at position {} near `{}'",
                    offset, near
                ))
            }
        },
        nom::Err::Incomplete(_) => DqlError::parse("unexpected end of query"),
    }
}

/// Parse a query text into statements
pub fn parse_dql(input: &str) -> DqlResult<Vec<Stmt>> {
    let text = input.trim();
    if text.is_empty() {
        return Err(DqlError::parse("empty query"));
    }

    match all_consuming(statements)(text) {
        Ok((_, stmts)) => Ok(stmts),
        Err(e) => Err(to_dql_error(text, e)),
    }
}

/// Parse free-form condition text, e.g. `host='a', status >= 500`.
///
/// Surrounding braces are optional; commas mean AND.
pub fn parse_conditions(input: &str) -> DqlResult<Vec<Expr>> {
    let text = input.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let result = if text.starts_with('{') {
        all_consuming(sp(where_clause))(text)
    } else {
        all_consuming(sp(condition_list))(text)
    };

    match result {
        Ok((_, conds)) => Ok(conds),
        Err(e) => Err(to_dql_error(text, e)),
    }
}

fn duration_regexes() -> DqlResult<&'static (Regex, Regex)> {
    static RE: OnceLock<Result<(Regex, Regex), regex::Error>> = OnceLock::new();
    RE.get_or_init(|| {
        Ok((
            Regex::new(r"^(\d+(ns|us|µs|ms|s|m|h|d|w|y))+$")?,
            Regex::new(r"(\d+)(ns|us|µs|ms|s|m|h|d|w|y)")?,
        ))
    })
    .as_ref()
    .map_err(|e| DqlError::Parse(format!("duration pattern: {}", e)))
}

/// Parse a duration like `1h30m` into milliseconds
pub fn parse_duration(text: &str) -> DqlResult<i64> {
    let text = text.trim();
    let (full, part) = duration_regexes()?;
    if !full.is_match(text) {
        return Err(DqlError::Parse(format!("invalid duration `{}'", text)));
    }

    let mut nanos: i128 = 0;
    for cap in part.captures_iter(text) {
        let n: i128 = cap[1]
            .parse()
            .map_err(|_| DqlError::Parse(format!("invalid duration `{}'", text)))?;
        let unit: i128 = match &cap[2] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "d" => 86_400 * 1_000_000_000,
            "w" => 7 * 86_400 * 1_000_000_000,
            _ => 365 * 86_400 * 1_000_000_000,
        };
        nanos += n * unit;
    }

    i64::try_from(nanos / 1_000_000)
        .map_err(|_| DqlError::Parse(format!("duration `{}' out of range", text)))
}

// ---------------------------------------------------------------------------
// lexical helpers

fn sp<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> PResult<'a, O>
where
    F: FnMut(&'a str) -> PResult<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn symbol<'a>(s: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    sp(tag(s))
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    sp(terminated(tag_no_case(kw), not(peek(satisfy(is_ident_char)))))
}

/// Plain name without dots, used for calls and namespaces
fn name(input: &str) -> PResult<&str> {
    recognize(pair(satisfy(is_ident_start), take_while(is_ident_char)))(input)
}

/// Field identifier; dots allowed after the first character
fn field_ident(input: &str) -> PResult<String> {
    alt((
        quoted('`'),
        map(
            recognize(pair(
                satisfy(is_ident_start),
                take_while(|c: char| is_ident_char(c) || c == '.'),
            )),
            |s: &str| s.to_string(),
        ),
    ))(input)
}

fn quoted<'a>(quote: char) -> impl FnMut(&'a str) -> PResult<'a, String> {
    move |input: &'a str| {
        let (mut rest, _) = char(quote)(input)?;
        let mut out = String::new();
        loop {
            let mut chars = rest.chars();
            match chars.next() {
                None => return failure(input, DqlError::parse("unterminated string")),
                Some('\\') => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => return failure(input, DqlError::parse("unterminated string")),
                },
                Some(c) if c == quote => {
                    return Ok((chars.as_str(), out));
                }
                Some(c) => out.push(c),
            }
            rest = chars.as_str();
        }
    }
}

fn string_lit(input: &str) -> PResult<String> {
    alt((quoted('\''), quoted('"')))(input)
}

fn int_lit(input: &str) -> PResult<i64> {
    let (rest, digits) = recognize(pair(opt(char('-')), digit1))(input)?;
    match digits.parse::<i64>() {
        Ok(n) => Ok((rest, n)),
        Err(e) => failure(input, DqlError::Parse(format!("invalid integer: {}", e))),
    }
}

fn number_lit(input: &str) -> PResult<Expr> {
    let (rest, text) = recognize(tuple((
        opt(char('-')),
        digit1,
        opt(pair(char('.'), digit1)),
        opt(tuple((
            alt((char('e'), char('E'))),
            opt(alt((char('+'), char('-')))),
            digit1,
        ))),
    )))(input)?;

    // a digit run glued to a letter is a duration or identifier, not a number
    if let Ok((_, _)) = peek(satisfy::<_, &str, PError>(is_ident_start))(rest) {
        return Err(nom::Err::Error(PError::from_error_kind(
            input,
            ErrorKind::Digit,
        )));
    }

    if text.contains(|c| matches!(c, '.' | 'e' | 'E')) {
        match text.parse::<f64>() {
            Ok(f) => Ok((rest, Expr::Float(f))),
            Err(e) => failure(input, DqlError::Parse(format!("invalid number: {}", e))),
        }
    } else {
        match text.parse::<i64>() {
            Ok(i) => Ok((rest, Expr::Int(i))),
            Err(_) => match text.parse::<f64>() {
                Ok(f) => Ok((rest, Expr::Float(f))),
                Err(e) => failure(input, DqlError::Parse(format!("invalid number: {}", e))),
            },
        }
    }
}

fn regex_lit(input: &str) -> PResult<String> {
    preceded(
        terminated(tag_no_case("re"), multispace0),
        delimited(symbol("("), alt((string_lit, quoted('`'))), symbol(")")),
    )(input)
}

// ---------------------------------------------------------------------------
// expressions

fn expr(input: &str) -> PResult<Expr> {
    or_expr(input)
}

fn fold_binary<'a>(
    input: &'a str,
    operand: fn(&'a str) -> PResult<'a, Expr>,
    mut op: impl FnMut(&'a str) -> PResult<'a, BinOp>,
) -> PResult<'a, Expr> {
    let (mut input, mut lhs) = operand(input)?;
    loop {
        match op(input) {
            Ok((rest, bin_op)) => {
                let (rest, rhs) = operand(rest)?;
                let zero = matches!(rhs, Expr::Int(0)) || matches!(rhs, Expr::Float(f) if f == 0.0);
                if zero && matches!(bin_op, BinOp::Div | BinOp::Mod) {
                    return failure(
                        input,
                        DqlError::Parse(format!("division by zero in `{} {} {}'", lhs, bin_op.as_str(), rhs)),
                    );
                }
                lhs = Expr::binary(bin_op, lhs, rhs);
                input = rest;
            }
            Err(nom::Err::Error(_)) => return Ok((input, lhs)),
            Err(e) => return Err(e),
        }
    }
}

fn or_expr(input: &str) -> PResult<Expr> {
    fold_binary(
        input,
        and_expr,
        value(BinOp::Or, alt((symbol("||"), keyword("or")))),
    )
}

fn and_expr(input: &str) -> PResult<Expr> {
    fold_binary(
        input,
        cmp_expr,
        value(BinOp::And, alt((symbol("&&"), keyword("and")))),
    )
}

fn cmp_op(input: &str) -> PResult<BinOp> {
    alt((
        value(BinOp::Gte, symbol(">=")),
        value(BinOp::Lte, symbol("<=")),
        value(BinOp::Ne, alt((symbol("!="), symbol("<>")))),
        value(BinOp::Eq, symbol("==")),
        value(BinOp::Eq, sp(terminated(tag("="), not(peek(char('~')))))),
        value(BinOp::Gt, symbol(">")),
        value(BinOp::Lt, symbol("<")),
        value(BinOp::NotIn, pair(keyword("not"), keyword("in"))),
        value(BinOp::In, keyword("in")),
    ))(input)
}

fn cmp_expr(input: &str) -> PResult<Expr> {
    let (input, lhs) = add_expr(input)?;
    match cmp_op(input) {
        Ok((rest, op)) => {
            let (rest, rhs) = add_expr(rest)?;
            Ok((rest, Expr::binary(op, lhs, rhs)))
        }
        Err(nom::Err::Error(_)) => Ok((input, lhs)),
        Err(e) => Err(e),
    }
}

fn add_expr(input: &str) -> PResult<Expr> {
    fold_binary(
        input,
        mul_expr,
        alt((
            value(BinOp::Add, symbol("+")),
            value(BinOp::Sub, symbol("-")),
        )),
    )
}

fn mul_expr(input: &str) -> PResult<Expr> {
    fold_binary(
        input,
        primary,
        alt((
            value(BinOp::Mul, symbol("*")),
            value(BinOp::Div, symbol("/")),
            value(BinOp::Mod, symbol("%")),
        )),
    )
}

fn primary(input: &str) -> PResult<Expr> {
    sp(alt((
        map(delimited(symbol("("), expr, symbol(")")), |e| {
            Expr::Paren(Box::new(e))
        }),
        map(list_items, Expr::List),
        number_lit,
        map(string_lit, Expr::Str),
        map(regex_lit, Expr::Regex),
        value(Expr::Bool(true), keyword("true")),
        value(Expr::Bool(false), keyword("false")),
        value(Expr::Nil, alt((keyword("nil"), keyword("null")))),
        map(call, Expr::Call),
        map(field_ident, Expr::Ident),
        value(Expr::Star, symbol("*")),
    )))(input)
}

fn list_items(input: &str) -> PResult<Vec<Expr>> {
    delimited(
        symbol("["),
        terminated(separated_list0(symbol(","), expr), opt(symbol(","))),
        symbol("]"),
    )(input)
}

enum CallArg {
    Positional(Expr),
    Named(String, Expr),
}

fn call_arg(input: &str) -> PResult<CallArg> {
    alt((
        map(
            pair(
                sp(name),
                preceded(terminated(char('='), not(peek(char('=')))), expr),
            ),
            |(n, e)| CallArg::Named(n.to_string(), e),
        ),
        map(expr, CallArg::Positional),
    ))(input)
}

fn call(input: &str) -> PResult<Call> {
    let (input, fname) = terminated(name, multispace0)(input)?;
    let (input, _) = char('(')(input)?;
    let (input, args) = terminated(
        separated_list0(symbol(","), call_arg),
        opt(symbol(",")),
    )(input)?;
    let (input, _) = symbol(")")(input)?;

    let mut out = Call::new(fname, Vec::new());
    for arg in args {
        match arg {
            CallArg::Positional(e) => out.args.push(e),
            CallArg::Named(k, v) => out.kwargs.push((k, v)),
        }
    }
    Ok((input, out))
}

// ---------------------------------------------------------------------------
// clauses

fn condition_list(input: &str) -> PResult<Vec<Expr>> {
    terminated(separated_list0(symbol(","), expr), opt(symbol(",")))(input)
}

fn where_clause(input: &str) -> PResult<Vec<Expr>> {
    delimited(symbol("{"), condition_list, symbol("}"))(input)
}

fn duration_token(input: &str) -> PResult<i64> {
    let (rest, text) = recognize(many1(pair(
        digit1,
        alt((
            tag("ms"),
            tag("ns"),
            tag("us"),
            tag("µs"),
            tag("s"),
            tag("m"),
            tag("h"),
            tag("d"),
            tag("w"),
            tag("y"),
        )),
    )))(input)?;

    match parse_duration(text) {
        Ok(ms) => Ok((rest, ms)),
        Err(e) => failure(input, e),
    }
}

fn time_bound(input: &str) -> PResult<TimeBound> {
    sp(alt((
        map(duration_token, TimeBound::Relative),
        map(int_lit, |ts| {
            // second precision unless the value is clearly milliseconds
            if ts.abs() > 1_000_000_000_000 {
                TimeBound::Absolute(ts)
            } else {
                TimeBound::Absolute(ts * 1000)
            }
        }),
    )))(input)
}

fn resolution(input: &str) -> PResult<Resolution> {
    sp(alt((
        map(
            preceded(
                keyword("auto"),
                opt(delimited(symbol("("), sp(int_lit), symbol(")"))),
            ),
            Resolution::Auto,
        ),
        map(duration_token, Resolution::Interval),
    )))(input)
}

fn time_range(input: &str) -> PResult<TimeRange> {
    let (input, _) = symbol("[")(input)?;
    let (input, start) = opt(time_bound)(input)?;
    let (input, end) = opt(preceded(symbol(":"), opt(time_bound)))(input)?;
    let (input, res) = match end {
        Some(_) => opt(preceded(symbol(":"), opt(resolution)))(input)?,
        None => (input, None),
    };
    let (input, _) = symbol("]")(input)?;

    Ok((
        input,
        TimeRange {
            start,
            end: end.flatten(),
            resolution: res.flatten(),
        },
    ))
}

enum Clause {
    By(Vec<String>),
    OrderBy(Vec<OrderBy>),
    Limit(i64),
    Offset(i64),
    SLimit(i64),
    SOffset(i64),
    Tz(String),
}

fn order_elem(input: &str) -> PResult<OrderBy> {
    let (input, column) = sp(field_ident)(input)?;
    let (input, direction) = opt(alt((
        value(OrderDirection::Asc, keyword("asc")),
        value(OrderDirection::Desc, keyword("desc")),
    )))(input)?;
    Ok((
        input,
        OrderBy {
            column,
            direction: direction.unwrap_or(OrderDirection::Asc),
        },
    ))
}

fn clause(input: &str) -> PResult<Clause> {
    alt((
        map(
            preceded(pair(keyword("order"), keyword("by")), |i| {
                separated_list0(symbol(","), order_elem)(i)
            }),
            Clause::OrderBy,
        ),
        map(
            preceded(keyword("by"), |i| {
                separated_list0(symbol(","), sp(field_ident))(i)
            }),
            Clause::By,
        ),
        map(preceded(keyword("limit"), sp(int_lit)), Clause::Limit),
        map(preceded(keyword("offset"), sp(int_lit)), Clause::Offset),
        map(preceded(keyword("slimit"), sp(int_lit)), Clause::SLimit),
        map(preceded(keyword("soffset"), sp(int_lit)), Clause::SOffset),
        map(
            preceded(keyword("tz"), delimited(symbol("("), sp(string_lit), symbol(")"))),
            Clause::Tz,
        ),
    ))(input)
}

#[derive(Default)]
struct Tail {
    conditions: Vec<Expr>,
    time_range: Option<TimeRange>,
    group_by: Vec<String>,
    order_by: Vec<OrderBy>,
    limit: Option<i64>,
    offset: Option<i64>,
    slimit: Option<i64>,
    soffset: Option<i64>,
    timezone: Option<String>,
}

fn tail(input: &str) -> PResult<Tail> {
    let (input, conditions) = opt(where_clause)(input)?;
    let (input, time_range) = opt(time_range)(input)?;
    let (input, clauses) = many0(clause)(input)?;

    let mut out = Tail {
        conditions: conditions.unwrap_or_default(),
        time_range,
        ..Default::default()
    };
    for c in clauses {
        match c {
            Clause::By(fields) => out.group_by = fields,
            Clause::OrderBy(elems) => out.order_by = elems,
            Clause::Limit(n) => out.limit = Some(n),
            Clause::Offset(n) => out.offset = Some(n),
            Clause::SLimit(n) => out.slimit = Some(n),
            Clause::SOffset(n) => out.soffset = Some(n),
            Clause::Tz(tz) => out.timezone = Some(tz),
        }
    }
    Ok((input, out))
}

// ---------------------------------------------------------------------------
// statements

fn source(input: &str) -> PResult<Source> {
    sp(alt((
        map(regex_lit, Source::Regex),
        map(string_lit, Source::Name),
        map(quoted('`'), Source::Name),
        value(Source::Regex(".*".to_string()), tag("*")),
        map(
            take_while1(|c: char| is_ident_char(c) || c == '-' || c == '.'),
            |s: &str| Source::Name(s.to_string()),
        ),
    )))(input)
}

fn target(input: &str) -> PResult<Target> {
    let (input, e) = expr(input)?;
    let (input, alias) = opt(preceded(keyword("as"), sp(field_ident)))(input)?;

    let mut t = match e {
        Expr::Call(c) if c.name.eq_ignore_ascii_case("fill") => {
            if c.args.len() != 2 {
                return failure(
                    input,
                    DqlError::Fill("fill() takes an expression and a fill value".into()),
                );
            }
            let mut args = c.args.into_iter();
            let inner = args.next().unwrap_or(Expr::Nil);
            let spec = args.next().unwrap_or(Expr::Nil);
            let fill = match fill_spec(&spec) {
                Ok(f) => f,
                Err(e) => return failure(input, e),
            };
            Target {
                expr: inner,
                alias: None,
                fill: Some(fill),
            }
        }
        other => Target::new(other),
    };
    t.alias = alias;
    Ok((input, t))
}

fn fill_spec(spec: &Expr) -> DqlResult<Fill> {
    match spec {
        Expr::Nil => Ok(Fill::Nil),
        Expr::Int(i) => Ok(Fill::Int(*i)),
        Expr::Float(f) => Ok(Fill::Float(*f)),
        Expr::Str(s) => Ok(Fill::Str(s.clone())),
        Expr::Ident(s) if s.eq_ignore_ascii_case("previous") => Ok(Fill::Previous),
        Expr::Ident(s) if s.eq_ignore_ascii_case("linear") => Ok(Fill::Linear),
        other => Err(DqlError::Fill(format!("invalid fill value `{}'", other))),
    }
}

fn targets(input: &str) -> PResult<Vec<Target>> {
    preceded(
        char(':'),
        delimited(
            symbol("("),
            terminated(separated_list0(symbol(","), target), opt(symbol(","))),
            symbol(")"),
        ),
    )(input)
}

fn namespace_prefix(input: &str) -> PResult<String> {
    map(sp(terminated(name, tag("::"))), |s| s.to_string())(input)
}

fn df_query(input: &str) -> PResult<DFQuery> {
    let (input, namespace) = opt(namespace_prefix)(input)?;
    let (input, sources) = separated_list0(symbol(","), source)(input)?;
    if sources.is_empty() {
        return Err(nom::Err::Error(PError::from_error_kind(
            input,
            ErrorKind::SeparatedList,
        )));
    }
    let (input, targets) = opt(targets)(input)?;
    let (input, tail) = tail(input)?;

    Ok((
        input,
        DFQuery {
            namespace: namespace.unwrap_or_default(),
            sources,
            targets: targets.unwrap_or_default(),
            conditions: tail.conditions,
            time_range: tail.time_range,
            group_by: tail.group_by,
            order_by: tail.order_by,
            limit: tail.limit,
            offset: tail.offset,
            slimit: tail.slimit,
            soffset: tail.soffset,
            timezone: tail.timezone,
            search_after: None,
            highlight: false,
        },
    ))
}

fn lambda_kind(input: &str) -> PResult<LambdaKind> {
    alt((
        value(LambdaKind::Filter, keyword("filter")),
        value(LambdaKind::Link, keyword("link")),
    ))(input)
}

fn query_or_lambda(input: &str) -> PResult<Stmt> {
    let (input, left) = df_query(input)?;
    let (input, ops) = many0(pair(lambda_kind, df_query))(input)?;
    if ops.is_empty() {
        return Ok((input, query_stmt(input, left)?));
    }

    let (input, with) = preceded(keyword("with"), where_clause)(input)?;
    let kind = ops[0].0;
    if ops.iter().any(|(k, _)| *k != kind) {
        return failure(
            input,
            DqlError::parse("FILTER and LINK cannot be mixed in one statement"),
        );
    }
    if with.is_empty() || (with.len() != 1 && with.len() != ops.len()) {
        return failure(
            input,
            DqlError::parse("WITH takes one condition, or one per right-hand query"),
        );
    }
    for cond in &with {
        if !is_join_condition(cond) {
            return failure(
                input,
                DqlError::Parse(format!("invalid WITH condition `{}'", cond)),
            );
        }
    }

    Ok((
        input,
        Stmt::Lambda(Lambda {
            kind,
            left,
            right: ops.into_iter().map(|(_, q)| q).collect(),
            with,
        }),
    ))
}

fn is_join_condition(e: &Expr) -> bool {
    match e {
        Expr::Binary { op, lhs, rhs } => {
            op.is_comparison() && lhs.as_name().is_some() && rhs.as_name().is_some()
        }
        _ => false,
    }
}

/// Turn a `F::module:(call(...))` query into a function statement
fn query_stmt(input: &str, q: DFQuery) -> Result<Stmt, nom::Err<PError<'_>>> {
    if !matches!(q.namespace.as_str(), "F" | "func") {
        return Ok(Stmt::Query(q));
    }

    let module = match q.sources.as_slice() {
        [Source::Name(m)] => m.clone(),
        _ => {
            return Err(nom::Err::Failure(PError {
                input,
                error: Some(DqlError::parse("func query takes exactly one module name")),
            }))
        }
    };
    match q.targets.as_slice() {
        [Target {
            expr: Expr::Call(c),
            ..
        }] => Ok(Stmt::Func(FuncCall {
            module,
            call: c.clone(),
        })),
        _ => Err(nom::Err::Failure(PError {
            input,
            error: Some(DqlError::parse("func query takes exactly one function call")),
        })),
    }
}

/// Namespace a show function belongs to
fn show_namespace(func: &str) -> Option<&'static str> {
    match func {
        "show_measurement" | "show_tag_key" | "show_tag_value" | "show_field_key" => Some("M"),
        _ => {
            let rest = func.strip_prefix("show_")?;
            [
                ("object_", "O"),
                ("logging_", "L"),
                ("event_", "E"),
                ("keyevent_", "E"),
                ("tracing_", "T"),
                ("rum_", "R"),
                ("security_", "S"),
                ("backup_log_", "BL"),
            ]
            .iter()
            .find(|(prefix, _)| rest.starts_with(prefix))
            .map(|(_, code)| *code)
        }
    }
}

fn func_stmt(input: &str) -> PResult<Stmt> {
    let start = input;
    let (input, namespace) = opt(namespace_prefix)(input)?;
    let (input, first) = sp(call)(input)?;
    if first.name.eq_ignore_ascii_case("re") {
        return Err(nom::Err::Error(PError::from_error_kind(start, ErrorKind::Tag)));
    }
    let (input, rest) = many0(preceded(char('.'), sp(call)))(input)?;
    let (input, tail) = tail(input)?;

    let mut chain = vec![first];
    chain.extend(rest);

    let special = |c: &Call| c.name.starts_with("show_") || c.name == "delete";
    if chain.len() > 1 && chain.iter().any(special) {
        return failure(
            input,
            DqlError::parse("show and delete functions cannot be chained"),
        );
    }

    let head = &chain[0];
    if head.name.starts_with("show_") {
        let ns = match (namespace, show_namespace(&head.name)) {
            (Some(ns), _) => ns,
            (None, Some(code)) => code.to_string(),
            (None, None) => {
                return failure(
                    input,
                    DqlError::Parse(format!("unknown show function `{}'", head.name)),
                )
            }
        };
        return Ok((
            input,
            Stmt::Show(Show {
                namespace: ns,
                func: head.clone(),
                conditions: tail.conditions,
                time_range: tail.time_range,
                limit: tail.limit,
                offset: tail.offset,
            }),
        ));
    }

    if head.name == "delete" {
        return match delete_target(head) {
            Ok(target) => Ok((input, Stmt::DeleteFunc(DeleteFunc { target }))),
            Err(e) => failure(input, e),
        };
    }

    if !tail.conditions.is_empty() || tail.time_range.is_some() {
        return failure(
            input,
            DqlError::parse("outer functions take no conditions or time range"),
        );
    }
    match validate_outer_chain(&chain) {
        Ok(()) => Ok((input, Stmt::OuterFuncs(OuterFuncs { funcs: chain }))),
        Err(e) => failure(input, e),
    }
}

fn delete_target(call: &Call) -> DqlResult<DeleteTarget> {
    let text = |e: &Expr| -> DqlResult<String> {
        match e {
            Expr::Str(s) => Ok(s.clone()),
            other => Err(DqlError::Parse(format!(
                "delete argument must be a string, got `{}'",
                other
            ))),
        }
    };

    if call.kwargs.len() + call.args.len() != 1 {
        return Err(DqlError::parse("delete takes exactly one argument"));
    }
    if let Some(arg) = call.args.first() {
        return Ok(DeleteTarget::Dql(text(arg)?));
    }
    let (key, arg) = &call.kwargs[0];
    match key.as_str() {
        "dql" => Ok(DeleteTarget::Dql(text(arg)?)),
        "measurement" => Ok(DeleteTarget::Measurement(text(arg)?)),
        "index" => Ok(DeleteTarget::Index(text(arg)?)),
        other => Err(DqlError::Parse(format!(
            "delete accepts dql, measurement or index, got `{}'",
            other
        ))),
    }
}

fn validate_outer_chain(chain: &[Call]) -> DqlResult<()> {
    for (idx, f) in chain.iter().enumerate() {
        if !OUTER_FUNCS.contains(&f.name.as_str()) {
            return Err(DqlError::Parse(format!("unknown function `{}'", f.name)));
        }

        let dql = f.arg(0, "dql");
        if idx == 0 {
            if !matches!(dql, Some(Expr::Str(_))) {
                return Err(DqlError::Parse(format!(
                    "{}: first function needs a dql string",
                    f.name
                )));
            }
        } else if f.kwarg("dql").is_some() || !f.args.is_empty() && f.name != "moving_average" {
            return Err(DqlError::Parse(format!(
                "{}: only the first function takes dql",
                f.name
            )));
        }

        if f.name == "moving_average" {
            let size_idx = if idx == 0 { 1 } else { 0 };
            match f.arg(size_idx, "size").and_then(|e| e.as_int()) {
                Some(n) if n > 0 => {}
                _ => {
                    return Err(DqlError::parse(
                        "moving_average needs a positive integer size",
                    ))
                }
            }
        }
    }
    Ok(())
}

fn statement(input: &str) -> PResult<Stmt> {
    sp(alt((func_stmt, query_or_lambda)))(input)
}

fn statements(input: &str) -> PResult<Vec<Stmt>> {
    let (input, stmts) = separated_list0(many1(symbol(";")), statement)(input)?;
    let (input, _) = many0(symbol(";"))(input)?;
    if stmts.is_empty() {
        return Err(nom::Err::Error(PError::from_error_kind(
            input,
            ErrorKind::Many1,
        )));
    }
    Ok((input, stmts))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(q: &str) -> Stmt {
        let mut stmts = parse_dql(q).unwrap();
        assert_eq!(stmts.len(), 1, "query: {}", q);
        stmts.remove(0)
    }

    fn query(q: &str) -> DFQuery {
        match one(q) {
            Stmt::Query(df) => df,
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_simple_query() {
        let q = query("M::cpu:(f1) {a=\"123\", b != 3, c != re('x')} [3m:2m:10s]");
        assert_eq!(q.namespace, "M");
        assert_eq!(q.sources, vec![Source::Name("cpu".into())]);
        assert_eq!(q.targets.len(), 1);
        assert_eq!(q.conditions.len(), 3);
        assert_eq!(
            q.conditions[2],
            Expr::binary(BinOp::Ne, Expr::Ident("c".into()), Expr::Regex("x".into()))
        );
        let tr = q.time_range.unwrap();
        assert_eq!(tr.start, Some(TimeBound::Relative(180_000)));
        assert_eq!(tr.end, Some(TimeBound::Relative(120_000)));
        assert_eq!(tr.resolution, Some(Resolution::Interval(10_000)));
    }

    #[test]
    fn test_parse_without_namespace_defaults_to_metric() {
        let q = query("cpu:(usage)");
        assert_eq!(q.namespace, "");
        assert!(!q.is_all_targets());
    }

    #[test]
    fn test_parse_select_all_and_regex_source() {
        let q = query("L::re('nginx.*')");
        assert_eq!(q.sources, vec![Source::Regex("nginx.*".into())]);
        assert!(q.is_all_targets());
    }

    #[test]
    fn test_parse_fill_targets() {
        let q = query("cpu:(fill(max(a), linear), fill(avg(d), 123.4) as x, fill(e, previous))");
        assert_eq!(q.targets[0].fill, Some(Fill::Linear));
        assert_eq!(q.targets[0].expr.to_string(), "max(a)");
        assert_eq!(q.targets[1].fill, Some(Fill::Float(123.4)));
        assert_eq!(q.targets[1].alias.as_deref(), Some("x"));
        assert_eq!(q.targets[2].fill, Some(Fill::Previous));
    }

    #[test]
    fn test_parse_invalid_fill_is_fill_error() {
        let err = parse_dql("cpu:(fill(a, [1]))").unwrap_err();
        assert!(matches!(err, DqlError::Fill(_)));
    }

    #[test]
    fn test_parse_clauses() {
        let q = query(
            "cpu:(avg(usage)) [1h::5m] BY host, region ORDER BY time desc LIMIT 10 OFFSET 2 SLIMIT 5 SOFFSET 1 tz('Asia/Shanghai')",
        );
        assert_eq!(q.group_by, vec!["host", "region"]);
        assert_eq!(q.order_by[0].direction, OrderDirection::Desc);
        assert_eq!(q.limit, Some(10));
        assert_eq!(q.offset, Some(2));
        assert_eq!(q.slimit, Some(5));
        assert_eq!(q.soffset, Some(1));
        assert_eq!(q.timezone.as_deref(), Some("Asia/Shanghai"));
        assert_eq!(q.interval_ms(), Some(300_000));
    }

    #[test]
    fn test_parse_absolute_and_auto_range() {
        let q = query("cpu:(a) [1615883598:1615883608:auto(5)]");
        let tr = q.time_range.unwrap();
        assert_eq!(tr.start, Some(TimeBound::Absolute(1_615_883_598_000)));
        assert_eq!(tr.end, Some(TimeBound::Absolute(1_615_883_608_000)));
        assert_eq!(tr.resolution, Some(Resolution::Auto(Some(5))));

        let q = query("cpu:(a) [::1h]");
        let tr = q.time_range.unwrap();
        assert_eq!(tr.start, None);
        assert_eq!(tr.resolution, Some(Resolution::Interval(3_600_000)));
    }

    #[test]
    fn test_parse_multiple_statements() {
        let stmts = parse_dql("M::cpu; M::mem;").unwrap();
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn test_division_by_literal_zero_rejected() {
        let err = parse_dql("cpu:(a / 0)").unwrap_err();
        assert!(matches!(err, DqlError::Parse(ref m) if m.contains("division by zero")));
        assert!(parse_dql("cpu:(a % 0.0)").is_err());
        assert!(parse_dql("cpu:(a / 2)").is_ok());
    }

    #[test]
    fn test_parse_lambda_filter() {
        let stmt = one(
            "cpu:(f1, cpu_host) {host='abc'} FILTER O::ecs:(ecs_1, host) {a='b'} LIMIT 10 WITH { cpu_host = host }",
        );
        match stmt {
            Stmt::Lambda(l) => {
                assert_eq!(l.kind, LambdaKind::Filter);
                assert_eq!(l.right.len(), 1);
                assert_eq!(l.right[0].namespace, "O");
                assert_eq!(l.right[0].limit, Some(10));
                assert_eq!(l.with.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_lambda_link() {
        let stmt = one("cpu:(f1, f2) {host='abc'} LINK O::ecs:(a1, a2) WITH {f1 = a1}");
        assert!(matches!(stmt, Stmt::Lambda(Lambda { kind: LambdaKind::Link, .. })));
    }

    #[test]
    fn test_parse_func_statement() {
        let stmt = one(
            "F::DQL_expr__module:(SORT(data=dql(\"cpu:(usage) {host='a'} [5m]\"), key=nil, reverse=FALSE))",
        );
        match stmt {
            Stmt::Func(f) => {
                assert_eq!(f.module, "DQL_expr__module");
                assert_eq!(f.call.name, "SORT");
                assert_eq!(f.call.kwarg("key"), Some(&Expr::Nil));
                assert_eq!(f.call.kwarg("reverse"), Some(&Expr::Bool(false)));
                assert_eq!(f.function_name(), "DQL_expr__module.SORT");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_show() {
        let stmt = one("show_tag_value(cpu, keyin=['region', 'host']) {service='redis'} [10m] LIMIT 3 OFFSET 5");
        match stmt {
            Stmt::Show(s) => {
                assert_eq!(s.namespace, "M");
                assert_eq!(s.limit, Some(3));
                assert_eq!(s.offset, Some(5));
                assert_eq!(s.conditions.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        match one("show_logging_field()") {
            Stmt::Show(s) => {
                assert_eq!(s.namespace, "L");
                assert!(s.is_field_listing());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_show_function() {
        assert!(parse_dql("show_nothing_here()").is_err());
    }

    #[test]
    fn test_parse_outer_chain() {
        let stmt = one("difference(dql='M::cpu:(usage) [10m]').moving_average(size=3).abs()");
        match stmt {
            Stmt::OuterFuncs(o) => {
                assert_eq!(o.funcs.len(), 3);
                assert_eq!(o.inner_query().unwrap(), "M::cpu:(usage) [10m]");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_outer_chain_rules() {
        assert!(parse_dql("moving_average(dql='cpu:(a)')").is_err());
        assert!(parse_dql("bogus(dql='cpu:(a)')").is_err());
        assert!(parse_dql("abs(dql='cpu:(a)').cumsum(dql='cpu:(b)')").is_err());
        assert!(parse_dql("abs(dql='cpu:(a)').show_measurement()").is_err());
    }

    #[test]
    fn test_parse_delete() {
        match one("delete(measurement='cpu')") {
            Stmt::DeleteFunc(d) => assert_eq!(d.target, DeleteTarget::Measurement("cpu".into())),
            other => panic!("unexpected {:?}", other),
        }
        match one("delete('L::nginx {status=500}')") {
            Stmt::DeleteFunc(d) => {
                assert_eq!(d.target, DeleteTarget::Dql("L::nginx {status=500}".into()))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse_dql("delete(index=1)").is_err());
        assert!(parse_dql("delete(table='x')").is_err());
    }

    #[test]
    fn test_parse_condition_operators() {
        let conds = parse_conditions("a in ['x', 'y'], b >= 1.5e3 || c = true, message = match('err')").unwrap();
        assert_eq!(conds.len(), 3);
        assert!(matches!(conds[0], Expr::Binary { op: BinOp::In, .. }));
        assert!(matches!(conds[1], Expr::Binary { op: BinOp::Or, .. }));
        match &conds[2] {
            Expr::Binary { rhs, .. } => assert_eq!(rhs.as_call().unwrap().name, "match"),
            other => panic!("unexpected {:?}", other),
        }

        let braced = parse_conditions("{host='a'}").unwrap();
        assert_eq!(braced.len(), 1);
        assert!(parse_conditions("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1h30m").unwrap(), 5_400_000);
        assert_eq!(parse_duration("250ms").unwrap(), 250);
        assert_eq!(parse_duration("1d").unwrap(), 86_400_000);
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_dql("").is_err());
        assert!(parse_dql("cpu:(a").is_err());
        assert!(parse_dql("cpu:(a) {b=}").is_err());
    }
}
