//! Time-series dialect translator
//!
//! Renders metric `DFQuery` and `Show` statements as InfluxQL statements.
//!
//! # Supported Syntax
//!
//! ```text
//! cpu:(avg(usage)) {host='a'} [1h::5m] BY region
//!   => SELECT avg("usage") FROM "cpu" WHERE "host" = 'a' AND time >= ...ms
//!      AND time < ...ms GROUP BY time(300000ms), "region"
//! show_tag_value(cpu, keyin=['host'])
//!   => SHOW TAG VALUES FROM "cpu" WITH KEY IN ("host")
//! ```

use crate::query::ast::*;
use crate::query::error::{DqlError, DqlResult};

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

fn quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn regex_lit(re: &str) -> String {
    format!("/{}/", re.replace('/', "\\/"))
}

/// Render a source list as a FROM clause body
fn render_sources(sources: &[Source]) -> DqlResult<String> {
    if sources.is_empty() {
        return Err(DqlError::parse("metric query requires a measurement"));
    }
    Ok(sources
        .iter()
        .map(|s| match s {
            Source::Name(n) => quote_ident(n),
            Source::Regex(r) => regex_lit(r),
        })
        .collect::<Vec<_>>()
        .join(", "))
}

/// Render an expression in a selector position, where names are fields
fn render_field_expr(e: &Expr) -> DqlResult<String> {
    match e {
        Expr::Ident(name) | Expr::Str(name) => Ok(quote_ident(name)),
        Expr::Int(i) => Ok(i.to_string()),
        Expr::Float(f) => Ok(format!("{:?}", f)),
        Expr::Bool(b) => Ok(b.to_string()),
        Expr::Star => Ok("*".to_string()),
        Expr::Regex(r) => Ok(regex_lit(r)),
        Expr::Nil => Err(DqlError::parse("nil is not supported in metric queries")),
        Expr::List(_) => Err(DqlError::parse("lists are only allowed with `in'")),
        Expr::Call(call) => {
            if !call.kwargs.is_empty() {
                return Err(DqlError::Parse(format!(
                    "function `{}' does not take named arguments in metric queries",
                    call.name
                )));
            }
            let args = call
                .args
                .iter()
                .map(render_field_expr)
                .collect::<DqlResult<Vec<_>>>()?;
            Ok(format!("{}({})", call.name, args.join(", ")))
        }
        Expr::Binary { op, lhs, rhs } if op.is_arithmetic() => Ok(format!(
            "{} {} {}",
            render_field_expr(lhs)?,
            op.as_str(),
            render_field_expr(rhs)?
        )),
        Expr::Binary { .. } => render_condition(e),
        Expr::Paren(inner) => Ok(format!("({})", render_field_expr(inner)?)),
    }
}

/// Render a literal on the right-hand side of a comparison
fn render_value(e: &Expr) -> DqlResult<String> {
    match e {
        Expr::Str(s) => Ok(quote_str(s)),
        Expr::Ident(name) => Ok(quote_ident(name)),
        Expr::Int(i) => Ok(i.to_string()),
        Expr::Float(f) => Ok(format!("{:?}", f)),
        Expr::Bool(b) => Ok(b.to_string()),
        Expr::Regex(r) => Ok(regex_lit(r)),
        Expr::Nil => Err(DqlError::parse("nil is not supported in metric queries")),
        other => render_field_expr(other),
    }
}

/// Render a where-condition
pub fn render_condition(e: &Expr) -> DqlResult<String> {
    match e {
        Expr::Binary { op, lhs, rhs } => match op {
            BinOp::And => Ok(format!(
                "{} AND {}",
                render_condition(lhs)?,
                render_condition(rhs)?
            )),
            BinOp::Or => Ok(format!(
                "{} OR {}",
                render_condition(lhs)?,
                render_condition(rhs)?
            )),
            BinOp::In | BinOp::NotIn => {
                let items = match rhs.as_ref() {
                    Expr::List(items) => items.clone(),
                    single => vec![single.clone()],
                };
                if items.is_empty() {
                    return Err(DqlError::parse("`in' requires at least one value"));
                }
                let (cmp, join) = if *op == BinOp::In {
                    (BinOp::Eq, " OR ")
                } else {
                    (BinOp::Ne, " AND ")
                };
                let parts = items
                    .into_iter()
                    .map(|item| render_condition(&Expr::binary(cmp, (**lhs).clone(), item)))
                    .collect::<DqlResult<Vec<_>>>()?;
                Ok(format!("({})", parts.join(join)))
            }
            _ if op.is_comparison() => {
                let field = render_field_expr(lhs)?;
                let symbol = match (op, rhs.as_ref()) {
                    (BinOp::Eq, Expr::Regex(_)) => "=~",
                    (BinOp::Ne, Expr::Regex(_)) => "!~",
                    (_, Expr::Regex(_)) => {
                        return Err(DqlError::parse(
                            "regex can only be compared with = or !=",
                        ))
                    }
                    _ => op.as_str(),
                };
                Ok(format!("{} {} {}", field, symbol, render_value(rhs)?))
            }
            _ => render_field_expr(e),
        },
        Expr::Paren(inner) => Ok(format!("({})", render_condition(inner)?)),
        other => Err(DqlError::Parse(format!(
            "`{}' is not a valid condition",
            other
        ))),
    }
}

fn where_clause(conditions: &[Expr], time_range: Option<&TimeRange>) -> DqlResult<String> {
    let mut parts = Vec::new();
    for cond in conditions {
        let rendered = render_condition(cond)?;
        if conditions.len() > 1 && matches!(cond, Expr::Binary { op: BinOp::Or, .. }) {
            parts.push(format!("({})", rendered));
        } else {
            parts.push(rendered);
        }
    }
    if let Some(tr) = time_range {
        if let Some(start) = tr.start_ms() {
            parts.push(format!("time >= {}ms", start));
        }
        if let Some(end) = tr.end_ms() {
            parts.push(format!("time < {}ms", end));
        }
    }
    if parts.is_empty() {
        Ok(String::new())
    } else {
        Ok(format!(" WHERE {}", parts.join(" AND ")))
    }
}

/// Translate a metric select query
pub fn translate_query(q: &DFQuery) -> DqlResult<String> {
    let targets = if q.is_all_targets() {
        "*".to_string()
    } else {
        q.targets
            .iter()
            .map(|t| {
                let expr = render_field_expr(&t.expr)?;
                Ok(match &t.alias {
                    Some(alias) => format!("{} AS {}", expr, quote_ident(alias)),
                    None => expr,
                })
            })
            .collect::<DqlResult<Vec<_>>>()?
            .join(", ")
    };

    let mut sql = format!(
        "SELECT {} FROM {}{}",
        targets,
        render_sources(&q.sources)?,
        where_clause(&q.conditions, q.time_range.as_ref())?
    );

    let mut group = Vec::new();
    if let Some(interval) = q.interval_ms() {
        group.push(format!("time({}ms)", interval));
    }
    group.extend(q.group_by.iter().map(|g| quote_ident(g)));
    if !group.is_empty() {
        sql.push_str(&format!(" GROUP BY {}", group.join(", ")));
    }

    if let Some(order) = q.order_by.first() {
        if q.order_by.len() > 1 || order.column != "time" {
            return Err(DqlError::parse("metric queries can only be ordered by time"));
        }
        let dir = match order.direction {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        };
        sql.push_str(&format!(" ORDER BY time {}", dir));
    }

    if let Some(limit) = q.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    if let Some(offset) = q.offset {
        sql.push_str(&format!(" OFFSET {}", offset));
    }
    if let Some(slimit) = q.slimit.filter(|n| *n > 0) {
        sql.push_str(&format!(" SLIMIT {}", slimit));
    }
    if let Some(soffset) = q.soffset {
        sql.push_str(&format!(" SOFFSET {}", soffset));
    }
    if let Some(tz) = &q.timezone {
        sql.push_str(&format!(" tz({})", quote_str(tz)));
    }
    Ok(sql)
}

/// Translate a metric query into a delete statement
pub fn translate_delete(q: &DFQuery) -> DqlResult<String> {
    let stripped = DFQuery {
        targets: Vec::new(),
        group_by: Vec::new(),
        order_by: Vec::new(),
        limit: None,
        offset: None,
        slimit: None,
        soffset: None,
        timezone: None,
        ..q.clone()
    };
    let select = translate_query(&stripped)?;
    match select.strip_prefix("SELECT * FROM") {
        Some(rest) => Ok(format!("delete from{}", rest)),
        None => Err(DqlError::query("failed to build delete statement")),
    }
}

/// `drop measurement` statement for a whole measurement
pub fn drop_measurement(name: &str) -> String {
    format!("drop measurement {}", quote_ident(name))
}

fn name_arg(e: &Expr) -> DqlResult<String> {
    e.as_name().map(|s| s.to_string()).ok_or_else(|| {
        DqlError::Parse(format!("expected a name, got `{}'", e))
    })
}

fn from_clause(call: &Call) -> DqlResult<String> {
    let from = match call.arg(0, "from") {
        None => return Ok(String::new()),
        Some(Expr::List(items)) => items.iter().map(name_arg).collect::<DqlResult<Vec<_>>>()?,
        Some(e) => vec![name_arg(e)?],
    };
    Ok(format!(
        " FROM {}",
        from.iter().map(|f| quote_ident(f)).collect::<Vec<_>>().join(", ")
    ))
}

fn show_tail(s: &Show) -> DqlResult<String> {
    let mut out = where_clause(&s.conditions, None)?;
    if let Some(limit) = s.limit {
        out.push_str(&format!(" LIMIT {}", limit));
    }
    if let Some(offset) = s.offset {
        out.push_str(&format!(" OFFSET {}", offset));
    }
    Ok(out)
}

/// Translate a metric introspection statement
pub fn translate_show(s: &Show) -> DqlResult<String> {
    let call = &s.func;
    match call.name.as_str() {
        "show_measurement" => {
            let with = match call.arg(0, "name") {
                None => String::new(),
                Some(Expr::Regex(r)) => format!(" WITH MEASUREMENT =~ {}", regex_lit(r)),
                Some(e) => format!(" WITH MEASUREMENT = {}", quote_ident(&name_arg(e)?)),
            };
            Ok(format!("SHOW MEASUREMENTS{}{}", with, show_tail(s)?))
        }
        "show_tag_key" => Ok(format!("SHOW TAG KEYS{}{}", from_clause(call)?, show_tail(s)?)),
        "show_field_key" => Ok(format!(
            "SHOW FIELD KEYS{}{}",
            from_clause(call)?,
            show_tail(s)?
        )),
        "show_tag_value" => {
            let with = match (call.kwarg("keyin"), call.kwarg("key")) {
                (Some(Expr::List(keys)), _) if !keys.is_empty() => {
                    let keys = keys
                        .iter()
                        .map(|k| name_arg(k).map(|k| quote_ident(&k)))
                        .collect::<DqlResult<Vec<_>>>()?;
                    format!(" WITH KEY IN ({})", keys.join(", "))
                }
                (_, Some(key)) => format!(" WITH KEY = {}", quote_ident(&name_arg(key)?)),
                _ => {
                    return Err(DqlError::parse(
                        "show_tag_value requires `keyin' or `key'",
                    ))
                }
            };
            Ok(format!(
                "SHOW TAG VALUES{}{}{}",
                from_clause(call)?,
                with,
                show_tail(s)?
            ))
        }
        other => Err(DqlError::NotImplemented(format!(
            "show function `{}' for metric",
            other
        ))),
    }
}
