//! Outer function chains
//!
//! Post-hoc transforms over the `(time, value)` series of an inner query.
//! Functions apply in order, each consuming the previous output.
//!
//! # Supported Functions
//!
//! ```text
//! difference  non_negative_difference  derivative  non_negative_derivative
//! moving_average(size)  cumsum  abs  log2  log10
//! min  max  avg  sum  first  last  count  count_distinct
//! ```
//!
//! Derivatives are per second. Two samples with the same timestamp make a
//! derivative fail rather than being skipped.

use crate::engine::result::Row;
use crate::query::ast::Call;
use crate::query::{DqlError, DqlResult, Value};

type Point = (Value, Value);

/// Apply every function of the chain to every series
pub fn apply_chain(funcs: &[Call], series: Vec<Row>) -> DqlResult<Vec<Row>> {
    let mut series = series;
    for (idx, func) in funcs.iter().enumerate() {
        series = series
            .into_iter()
            .map(|row| apply_one(func, idx == 0, row))
            .collect::<DqlResult<_>>()?;
    }
    Ok(series)
}

fn apply_one(func: &Call, first_in_chain: bool, row: Row) -> DqlResult<Row> {
    if row.columns.len() != 2 {
        return Err(DqlError::query(format!(
            "{}: series `{}' needs exactly a time and a value column, got {:?}",
            func.name, row.name, row.columns
        )));
    }

    let points: Vec<Point> = row
        .values
        .iter()
        .filter_map(|t| match (t.first(), t.get(1)) {
            (Some(time), Some(v)) if !v.is_null() => Some((time.clone(), v.clone())),
            _ => None,
        })
        .collect();

    let mut out = transform(func, first_in_chain, &points)?;
    if out.is_empty() {
        out.push((Value::Null, Value::Null));
    }

    Ok(Row {
        name: row.name,
        tags: row.tags,
        columns: vec![
            row.columns[0].clone(),
            format!("{}({})", func.name, row.columns[1]),
        ],
        values: out.into_iter().map(|(t, v)| vec![t, v]).collect(),
    })
}

fn numbers(points: &[Point]) -> DqlResult<Vec<f64>> {
    points.iter().map(|(_, v)| v.as_f64()).collect()
}

fn pairwise(
    points: &[Point],
    non_negative: bool,
    f: impl Fn(f64, f64, f64) -> DqlResult<f64>,
) -> DqlResult<Vec<Point>> {
    let values = numbers(points)?;
    let mut out = Vec::new();
    for i in 1..points.len() {
        let dt = (points[i].0.as_f64()? - points[i - 1].0.as_f64()?) / 1000.0;
        let v = f(values[i - 1], values[i], dt)?;
        if !(non_negative && v < 0.0) {
            out.push((points[i].0.clone(), Value::Float(v)));
        }
    }
    Ok(out)
}

/// Per-second rate; two samples sharing a timestamp have no rate
fn rate(a: f64, b: f64, dt: f64) -> DqlResult<f64> {
    if dt == 0.0 {
        return Err(DqlError::query("derivative: two samples share a timestamp"));
    }
    Ok((b - a) / dt)
}

fn map_points(points: &[Point], mut f: impl FnMut(f64) -> Option<f64>) -> DqlResult<Vec<Point>> {
    let values = numbers(points)?;
    Ok(points
        .iter()
        .zip(values)
        .filter_map(|((t, _), v)| f(v).map(|r| (t.clone(), Value::Float(r))))
        .collect())
}

/// Single point at the time of the first sample
fn single(points: &[Point], value: Value) -> Vec<Point> {
    match points.first() {
        Some((t, _)) => vec![(t.clone(), value)],
        None => Vec::new(),
    }
}

fn extreme(points: &[Point], want: std::cmp::Ordering) -> DqlResult<Vec<Point>> {
    numbers(points)?;
    let mut best: Option<&Point> = None;
    for p in points {
        best = match best {
            Some(b) if p.1.partial_cmp_value(&b.1) != Some(want) => Some(b),
            _ => Some(p),
        };
    }
    Ok(best.map(|p| vec![p.clone()]).unwrap_or_default())
}

fn moving_average_size(func: &Call, first_in_chain: bool) -> DqlResult<usize> {
    let idx = if first_in_chain { 1 } else { 0 };
    match func.arg(idx, "size").and_then(|e| e.as_int()) {
        Some(n) if n > 0 => Ok(n as usize),
        _ => Err(DqlError::parse("moving_average needs a positive integer size")),
    }
}

fn transform(func: &Call, first_in_chain: bool, points: &[Point]) -> DqlResult<Vec<Point>> {
    match func.name.as_str() {
        "difference" => pairwise(points, false, |a, b, _| Ok(b - a)),
        "non_negative_difference" => pairwise(points, true, |a, b, _| Ok(b - a)),
        "derivative" => pairwise(points, false, rate),
        "non_negative_derivative" => pairwise(points, true, rate),
        "moving_average" => {
            let size = moving_average_size(func, first_in_chain)?;
            let values = numbers(points)?;
            Ok((size.saturating_sub(1)..points.len())
                .map(|i| {
                    let window = &values[i + 1 - size..=i];
                    let avg = window.iter().sum::<f64>() / size as f64;
                    (points[i].0.clone(), Value::Float(avg))
                })
                .collect())
        }
        "cumsum" => {
            let mut total = 0.0;
            map_points(points, |v| {
                total += v;
                Some(total)
            })
        }
        "abs" => map_points(points, |v| Some(v.abs())),
        "log2" => map_points(points, |v| (v > 0.0).then(|| v.log2())),
        "log10" => map_points(points, |v| (v > 0.0).then(|| v.log10())),
        "min" => extreme(points, std::cmp::Ordering::Less),
        "max" => extreme(points, std::cmp::Ordering::Greater),
        "sum" => {
            let total: f64 = numbers(points)?.iter().sum();
            Ok(single(points, Value::Float(total)))
        }
        "avg" => {
            let values = numbers(points)?;
            if values.is_empty() {
                return Ok(Vec::new());
            }
            let avg = values.iter().sum::<f64>() / values.len() as f64;
            Ok(single(points, Value::Float(avg)))
        }
        "count" => Ok(single(points, Value::Int(points.len() as i64))),
        "count_distinct" => {
            let mut seen: Vec<&Value> = Vec::new();
            for (_, v) in points {
                if !seen.iter().any(|s| s.loose_eq(v)) {
                    seen.push(v);
                }
            }
            Ok(single(points, Value::Int(seen.len() as i64)))
        }
        "first" => Ok(points.first().cloned().into_iter().collect()),
        "last" => Ok(points.last().cloned().into_iter().collect()),
        other => Err(DqlError::parse(format!("unknown function `{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::{Expr, OuterFuncs, Stmt};
    use crate::query::parse_dql;

    fn chain(text: &str) -> Vec<Call> {
        match parse_dql(text).unwrap().remove(0) {
            Stmt::OuterFuncs(OuterFuncs { funcs }) => funcs,
            other => panic!("not an outer chain: {:?}", other),
        }
    }

    fn series(points: &[(i64, f64)]) -> Vec<Row> {
        vec![Row::new("cpu", vec!["time".into(), "usage".into()]).with_values(
            points
                .iter()
                .map(|(t, v)| vec![Value::Int(*t), Value::Float(*v)])
                .collect(),
        )]
    }

    fn values(rows: &[Row]) -> Vec<Value> {
        rows[0].values.iter().map(|t| t[1].clone()).collect()
    }

    #[test]
    fn test_difference() {
        let out = apply_chain(
            &chain("difference(dql='cpu:(usage)')"),
            series(&[(1000, 1.0), (2000, 4.0), (3000, 2.0)]),
        )
        .unwrap();
        assert_eq!(out[0].columns, vec!["time", "difference(usage)"]);
        assert_eq!(values(&out), vec![Value::Float(3.0), Value::Float(-2.0)]);
    }

    #[test]
    fn test_non_negative_derivative_per_second() {
        let out = apply_chain(
            &chain("non_negative_derivative(dql='cpu:(usage)')"),
            series(&[(0, 0.0), (2000, 10.0), (4000, 4.0)]),
        )
        .unwrap();
        assert_eq!(values(&out), vec![Value::Float(5.0)]);
    }

    #[test]
    fn test_derivative_rejects_repeated_timestamp() {
        let result = apply_chain(
            &chain("derivative(dql='cpu:(usage)')"),
            series(&[(1000, 1.0), (1000, 2.0), (2000, 3.0)]),
        );
        assert!(matches!(result, Err(DqlError::Query(_))));
    }

    #[test]
    fn test_moving_average_then_cumsum() {
        let out = apply_chain(
            &chain("moving_average(dql='cpu:(usage)', size=2).cumsum()"),
            series(&[(1, 1.0), (2, 3.0), (3, 5.0)]),
        )
        .unwrap();
        assert_eq!(values(&out), vec![Value::Float(2.0), Value::Float(6.0)]);
        assert_eq!(out[0].columns[1], "cumsum(moving_average(usage))");
    }

    #[test]
    fn test_aggregates_collapse_to_one_point() {
        let input = series(&[(1, 2.0), (2, 8.0), (3, 2.0)]);
        let max = apply_chain(&chain("max(dql='cpu:(usage)')"), input.clone()).unwrap();
        assert_eq!(max[0].values, vec![vec![Value::Int(2), Value::Float(8.0)]]);
        let count = apply_chain(&chain("count_distinct(dql='cpu:(usage)')"), input).unwrap();
        assert_eq!(values(&count), vec![Value::Int(2)]);
    }

    #[test]
    fn test_empty_output_emits_null_point() {
        let out = apply_chain(&chain("difference(dql='cpu:(usage)')"), series(&[(1, 1.0)])).unwrap();
        assert_eq!(out[0].values, vec![vec![Value::Null, Value::Null]]);
    }

    #[test]
    fn test_single_column_series_is_error() {
        let rows = vec![Row::new("cpu", vec!["time".into()]).with_values(vec![vec![Value::Int(1)]])];
        assert!(apply_chain(&chain("abs(dql='cpu:(usage)')"), rows).is_err());

        let wide = vec![Row::new("cpu", vec!["time".into(), "a".into(), "b".into()])
            .with_values(vec![vec![Value::Int(1), Value::Int(2), Value::Int(3)]])];
        assert!(matches!(
            apply_chain(&chain("max(dql='cpu:(a, b)')"), wide),
            Err(DqlError::Query(_))
        ));
    }

    #[test]
    fn test_unknown_function_rejected() {
        let call = Call::new("median", vec![Expr::Str("cpu:(usage)".into())]);
        assert!(apply_chain(&[call], series(&[(1, 1.0)])).is_err());
    }
}
