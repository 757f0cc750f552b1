//! Result rewriting
//!
//! Metric results get their value columns renamed to the target text and
//! their fill policies applied. Bucketed document results with a single
//! constant-fill target are padded to the expected bucket count, since the
//! search backend does not guarantee a point per bucket.

use crate::engine::result::Row;
use crate::query::ast::{DFQuery, Fill};
use crate::query::search::{Helper, TIME_COLUMN};
use crate::query::{DqlError, DqlResult, Value};

/// Rename and fill metric series in place
pub fn rewrite_metric(q: &DFQuery, series: &mut [Row]) -> DqlResult<()> {
    if q.is_all_targets() {
        return Ok(());
    }
    for row in series.iter_mut() {
        row.check_shape()?;
        if row.columns.len() != q.targets.len() + 1 {
            return Err(DqlError::query(format!(
                "series `{}' has columns {:?}, expected time plus {} target(s)",
                row.name,
                row.columns,
                q.targets.len()
            )));
        }
        rename_columns(row, q);
        for (i, target) in q.targets.iter().enumerate() {
            if let Some(fill) = &target.fill {
                apply_fill(row, i + 1, fill)?;
            }
        }
    }
    Ok(())
}

/// Replace columns after the time column with the target names
pub fn rename_columns(row: &mut Row, q: &DFQuery) {
    for (i, target) in q.targets.iter().enumerate() {
        if let Some(column) = row.columns.get_mut(i + 1) {
            *column = target.column_name();
        }
    }
}

fn apply_fill(row: &mut Row, col: usize, fill: &Fill) -> DqlResult<()> {
    if col >= row.columns.len() {
        return Ok(());
    }
    let mut column: Vec<Value> = row.values.iter().map(|t| t[col].clone()).collect();
    match fill {
        Fill::Linear => fill_linear(&mut column)?,
        Fill::Previous => fill_previous(&mut column),
        constant => {
            let value = constant.constant().unwrap_or_default();
            for v in column.iter_mut().filter(|v| v.is_null()) {
                *v = value.clone();
            }
        }
    }
    for (tuple, v) in row.values.iter_mut().zip(column) {
        tuple[col] = v;
    }
    Ok(())
}

/// Carry the last non-null value forward
pub fn fill_previous(column: &mut [Value]) {
    let mut last: Option<Value> = None;
    for v in column.iter_mut() {
        if v.is_null() {
            if let Some(prev) = &last {
                *v = prev.clone();
            }
        } else {
            last = Some(v.clone());
        }
    }
}

/// Interpolate interior gaps between their non-zero neighbours.
///
/// A gap is a null or a zero. Interpolation is by sample position. Leading
/// and trailing gaps have only one neighbour and are left as they are.
pub fn fill_linear(column: &mut [Value]) -> DqlResult<()> {
    let mut samples: Vec<Option<f64>> = Vec::with_capacity(column.len());
    for v in column.iter() {
        let sample = match v {
            Value::Null => None,
            other => Some(other.as_f64().map_err(|_| {
                DqlError::Fill(format!("linear fill needs numbers, got {}", other.kind()))
            })?),
        };
        samples.push(sample.filter(|f| *f != 0.0));
    }

    let first = samples.iter().position(Option::is_some);
    let last = samples.iter().rposition(Option::is_some);
    let (Some(first), Some(last)) = (first, last) else {
        return Ok(());
    };

    let mut i = first;
    while i < last {
        let Some(a) = samples[i] else {
            i += 1;
            continue;
        };
        let mut j = i + 1;
        while samples[j].is_none() {
            j += 1;
        }
        let gap = j - i - 1;
        if gap > 0 {
            let b = samples[j].unwrap_or(a);
            for k in 0..gap {
                let v = a + (b - a) * (k + 1) as f64 / (gap + 1) as f64;
                column[i + 1 + k] = Value::Float(v);
            }
        }
        i = j;
    }
    Ok(())
}

/// Pad bucketed document series to one point per requested bucket
pub fn reconcile_document(q: &DFQuery, helper: &Helper, series: &mut Vec<Row>) -> DqlResult<()> {
    let [target] = q.targets.as_slice() else {
        return Ok(());
    };
    let Some(fill) = target.fill.as_ref().and_then(Fill::constant) else {
        return Ok(());
    };
    let (Some(start), Some(end), Some(interval)) =
        (helper.start_time, helper.end_time, q.interval_ms())
    else {
        return Ok(());
    };

    if series.is_empty() {
        series.push(Row::new(
            helper.class_names.clone(),
            vec![TIME_COLUMN.to_string(), target.column_name()],
        ));
    }
    for row in series.iter_mut() {
        reconcile_buckets(row, start, end, interval, &fill)?;
    }
    Ok(())
}

/// Synthesize missing buckets before the first and after the last sample.
///
/// An empty row is filled across the whole range.
pub fn reconcile_buckets(
    row: &mut Row,
    start: i64,
    end: i64,
    interval: i64,
    fill: &Value,
) -> DqlResult<()> {
    if interval <= 0 || end <= start {
        return Ok(());
    }
    let time_col = row
        .column_index(TIME_COLUMN)
        .ok_or_else(|| DqlError::Fill("bucketed series has no time column".into()))?;
    let width = row.columns.len();
    let point = |t: i64| {
        let mut tuple = vec![fill.clone(); width];
        tuple[time_col] = Value::Int(t);
        tuple
    };

    let total = ((end - start) / interval) as usize;
    if row.values.is_empty() {
        row.values = (0..total as i64).map(|i| point(start + i * interval)).collect();
        return Ok(());
    }
    if row.values.len() >= total {
        return Ok(());
    }

    let first = row.values[0][time_col].as_i64()?;
    let last = row.values[row.values.len() - 1][time_col].as_i64()?;

    let right = (((end - 1) - last) / interval).max(0) as usize;
    let right = right.min(total - row.values.len());
    for k in 1..=right as i64 {
        row.values.push(point(last + k * interval));
    }

    let left = total.saturating_sub(row.values.len());
    let prefix: Vec<Vec<Value>> = (1..=left as i64)
        .rev()
        .map(|k| point(first - k * interval))
        .collect();
    row.values.splice(0..0, prefix);
    Ok(())
}
