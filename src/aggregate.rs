//! Aggregation logic for the query engine.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::config::EmptyAggregate;
use crate::error::{EngineError, EngineResult};
use crate::value::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Count,
    Sum,
    #[serde(alias = "avg")]
    Average,
    Median,
    Min,
    Max,
    CountDistinct,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Count => "count",
            Metric::Sum => "sum",
            Metric::Average => "average",
            Metric::Median => "median",
            Metric::Min => "min",
            Metric::Max => "max",
            Metric::CountDistinct => "count_distinct",
        }
    }

    pub fn requires_column(&self) -> bool {
        !matches!(self, Metric::Count)
    }

    /// Whether an empty input is subject to the [`EmptyAggregate`] policy.
    /// Count and sum have a natural zero.
    fn has_empty_state(&self) -> bool {
        matches!(
            self,
            Metric::Average | Metric::Median | Metric::Min | Metric::Max
        )
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub metric: Metric,
    #[serde(default)]
    pub column: Option<String>,
}

impl MetricSpec {
    pub fn new(metric: Metric, column: impl Into<String>) -> Self {
        Self {
            metric,
            column: Some(column.into()),
        }
    }

    pub fn count() -> Self {
        Self {
            metric: Metric::Count,
            column: None,
        }
    }

    fn column(&self) -> Option<&str> {
        self.column.as_deref().filter(|c| !c.is_empty())
    }

    /// `"{metric}_of_{column}"`, or `"{metric}_of_rows"` without a column.
    pub fn output_key(&self) -> String {
        format!("{}_of_{}", self.metric, self.column().unwrap_or("rows"))
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.metric.requires_column() && self.column().is_none() {
            return Err(EngineError::invalid(format!(
                "metric '{}' requires a column",
                self.metric
            )));
        }
        Ok(())
    }
}

/// Compute one metric over a group. `None` means the metric had no valid
/// input values; callers render it through the [`EmptyAggregate`] policy.
pub fn compute_metric(rows: &[&Row], spec: &MetricSpec) -> Option<f64> {
    match spec.metric {
        Metric::Count => return Some(rows.len() as f64),
        Metric::CountDistinct => {
            let column = spec.column()?;
            let distinct: HashSet<&str> = rows.iter().map(|r| r.raw(column)).collect();
            return Some(distinct.len() as f64);
        }
        _ => {}
    }

    let mut values: Vec<f64> = match spec.column() {
        Some(column) => rows.iter().filter_map(|r| r.number(column)).collect(),
        None => Vec::new(),
    };

    match spec.metric {
        Metric::Sum => Some(saturating_sum(&values)),
        Metric::Average => mean(&values),
        Metric::Median => median(&mut values),
        Metric::Min => values.iter().copied().reduce(f64::min),
        Metric::Max => values.iter().copied().reduce(f64::max),
        Metric::Count | Metric::CountDistinct => None,
    }
}

/// Sum of finite values. Overflow saturates at `f64::MAX` (or `f64::MIN`)
/// so the result is always a JSON number.
fn saturating_sum(values: &[f64]) -> f64 {
    values.iter().sum::<f64>().clamp(f64::MIN, f64::MAX)
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let sum: f64 = values.iter().sum();
    if sum.is_finite() {
        Some(sum / n)
    } else {
        // each term is at most f64::MAX / n, so this cannot overflow
        Some(values.iter().map(|v| v / n).sum())
    }
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some(values[mid - 1] / 2.0 + values[mid] / 2.0)
    }
}

/// Render a computed metric as JSON.
pub fn render_metric(metric: Metric, value: Option<f64>, policy: EmptyAggregate) -> Value {
    match value {
        Some(v) => number_value(v),
        None if !metric.has_empty_state() || policy == EmptyAggregate::Zero => Value::from(0),
        None => Value::Null,
    }
}

/// Integral values become JSON integers so counts read as `3`, not `3.0`.
pub fn number_value(v: f64) -> Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0;
    if v.fract() == 0.0 && v.abs() < MAX_SAFE {
        Value::from(v as i64)
    } else {
        Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Compute every metric over the same group of rows.
pub fn aggregate(rows: &[&Row], metrics: &[MetricSpec], policy: EmptyAggregate) -> Map<String, Value> {
    let mut record = Map::new();
    for spec in metrics {
        let value = compute_metric(rows, spec);
        record.insert(spec.output_key(), render_metric(spec.metric, value, policy));
    }
    record
}
