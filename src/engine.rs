//! Core query types and execution logic.
//!
//! A query runs in three synchronous passes over an already loaded dataset:
//! filter every row, partition the survivors by the grouping column, then
//! aggregate each partition. Groups come out in first-seen order so repeated
//! queries render the same chart axis.

use log::debug;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::aggregate::{aggregate, compute_metric, render_metric, Metric, MetricSpec};
use crate::config::EngineConfig;
use crate::dataset::Dataset;
use crate::error::{EngineError, EngineResult};
use crate::filter::{DateRangeFilter, FilterClause, RowFilter};
use crate::group::group_rows;
use crate::value::Row;

/// One flat output record: group label plus one entry per metric.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(default)]
    pub filters: Vec<FilterClause>,
    #[serde(default)]
    pub summaries: Vec<MetricSpec>,
    #[serde(default, deserialize_with = "deserialize_column")]
    pub group_by: Option<String>,
    #[serde(default)]
    pub date_range: Option<DateRangeFilter>,
}

impl Query {
    pub fn new(summaries: Vec<MetricSpec>) -> Self {
        Self {
            summaries,
            ..Self::default()
        }
    }

    pub fn group_by(mut self, column: impl Into<String>) -> Self {
        self.group_by = Some(column.into());
        self
    }

    pub fn filter(mut self, clause: FilterClause) -> Self {
        self.filters.push(clause);
        self
    }

    pub fn date_range(mut self, range: DateRangeFilter) -> Self {
        self.date_range = Some(range);
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.summaries.is_empty() {
            return Err(EngineError::invalid("at least one summary metric is required"));
        }
        self.summaries.iter().try_for_each(MetricSpec::validate)
    }
}

/// An empty grouping column means "not grouped".
fn deserialize_column<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.filter(|c| !c.is_empty()))
}

fn date_format<'a>(dataset: &'a Dataset, config: &'a EngineConfig) -> &'a str {
    dataset
        .date_format
        .as_deref()
        .unwrap_or(&config.default_date_format)
}

fn filter_rows<'a>(
    dataset: &'a Dataset,
    filters: &[FilterClause],
    date_range: Option<&DateRangeFilter>,
    config: &EngineConfig,
) -> Vec<&'a Row> {
    let row_filter = RowFilter::new(filters, date_range, date_format(dataset, config));
    let rows: Vec<&Row> = dataset.rows.iter().filter(|r| row_filter.matches(r)).collect();
    debug!("filtered {} of {} rows", rows.len(), dataset.len());
    rows
}

/// Execute a grouped query against a loaded dataset.
pub fn run_query(dataset: &Dataset, query: &Query, config: &EngineConfig) -> EngineResult<Vec<Record>> {
    query.validate()?;

    let rows = filter_rows(dataset, &query.filters, query.date_range.as_ref(), config);
    let groups = group_rows(rows, query.group_by.as_deref());
    debug!(
        "grouped into {} groups by {:?}, {} metrics each",
        groups.len(),
        query.group_by,
        query.summaries.len()
    );

    let key_name = query.group_by.as_deref().unwrap_or(&config.ungrouped_key);
    let records = groups
        .iter()
        .map(|(key, group)| {
            let mut record = Record::new();
            record.insert(key_name.to_string(), key.to_json(&config.total_label));
            record.extend(aggregate(group, &query.summaries, config.empty_aggregate));
            record
        })
        .collect();

    Ok(records)
}

/// Sum `value_key` per distinct `category_key`.
pub fn run_chart_query(
    dataset: &Dataset,
    category_key: &str,
    value_key: &str,
    config: &EngineConfig,
) -> EngineResult<Vec<Record>> {
    if category_key.is_empty() || value_key.is_empty() {
        return Err(EngineError::invalid("categoryKey and valueKey are required"));
    }

    let spec = MetricSpec::new(Metric::Sum, value_key);
    let groups = group_rows(&dataset.rows, Some(category_key));

    let records = groups
        .iter()
        .map(|(key, group)| {
            let sum = compute_metric(group, &spec);
            let mut record = Record::new();
            record.insert(category_key.to_string(), key.to_json(&config.total_label));
            record.insert(
                value_key.to_string(),
                render_metric(spec.metric, sum, config.empty_aggregate),
            );
            record
        })
        .collect();

    Ok(records)
}

/// One metric over the whole dataset, date range applied before the clauses.
pub fn aggregate_single(
    dataset: &Dataset,
    spec: &MetricSpec,
    filters: &[FilterClause],
    date_range: Option<&DateRangeFilter>,
    config: &EngineConfig,
) -> EngineResult<Value> {
    spec.validate()?;
    let rows = filter_rows(dataset, filters, date_range, config);
    let value = compute_metric(&rows, spec);
    Ok(render_metric(spec.metric, value, config.empty_aggregate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmptyAggregate;
    use crate::filter::FilterCondition;
    use chrono::NaiveDate;
    use serde_json::json;

    fn sales() -> Dataset {
        let rows = vec![
            [("region", "East"), ("sales", "100")],
            [("region", "West"), ("sales", "50")],
            [("region", "East"), ("sales", "30")],
        ];
        Dataset::new(rows.into_iter().map(|r| r.into_iter().collect()).collect())
    }

    fn as_json(records: Vec<Record>) -> Value {
        Value::Array(records.into_iter().map(Value::Object).collect())
    }

    #[test]
    fn test_grouped_sum_first_seen_order() {
        let query = Query::new(vec![MetricSpec::new(Metric::Sum, "sales")]).group_by("region");
        let result = run_query(&sales(), &query, &EngineConfig::default()).unwrap();
        assert_eq!(
            as_json(result),
            json!([
                {"region": "East", "sum_of_sales": 130},
                {"region": "West", "sum_of_sales": 50}
            ])
        );
    }

    #[test]
    fn test_repeated_query_is_deterministic() {
        let dataset = sales();
        let query = Query::new(vec![MetricSpec::count(), MetricSpec::new(Metric::Max, "sales")])
            .group_by("region");
        let config = EngineConfig::default();
        let first = run_query(&dataset, &query, &config).unwrap();
        for _ in 0..10 {
            assert_eq!(run_query(&dataset, &query, &config).unwrap(), first);
        }
    }

    #[test]
    fn test_ungrouped_total() {
        let query = Query::new(vec![MetricSpec::count(), MetricSpec::new(Metric::Average, "sales")]);
        let result = run_query(&sales(), &query, &EngineConfig::default()).unwrap();
        assert_eq!(
            as_json(result),
            json!([{"group": "Total", "count_of_rows": 3, "average_of_sales": 60}])
        );
    }

    #[test]
    fn test_filters_applied_before_grouping() {
        let query = Query::new(vec![MetricSpec::count()])
            .group_by("region")
            .filter(FilterClause::new("region", FilterCondition::IsNot, "West"));
        let result = run_query(&sales(), &query, &EngineConfig::default()).unwrap();
        assert_eq!(as_json(result), json!([{"region": "East", "count_of_rows": 2}]));
    }

    #[test]
    fn test_missing_group_column_is_null() {
        let mut dataset = sales();
        dataset.rows.push([("sales", "5")].into_iter().collect());
        let query = Query::new(vec![MetricSpec::new(Metric::Sum, "sales")]).group_by("region");
        let result = run_query(&dataset, &query, &EngineConfig::default()).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[2]["region"], Value::Null);
        assert_eq!(result[2]["sum_of_sales"], json!(5));
    }

    #[test]
    fn test_no_summaries_rejected() {
        let err = run_query(&sales(), &Query::default(), &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidQuery(_)));
    }

    #[test]
    fn test_query_deserialize() {
        let query: Query = serde_json::from_str(
            r#"{
                "filters": [{"column": "region", "condition": "is", "value": "East"}],
                "summaries": [{"metric": "sum", "column": "sales"}],
                "groupBy": ""
            }"#,
        )
        .unwrap();
        assert_eq!(query.group_by, None);
        assert_eq!(query.filters.len(), 1);
    }

    #[test]
    fn test_chart_query() {
        let result = run_chart_query(&sales(), "region", "sales", &EngineConfig::default()).unwrap();
        assert_eq!(
            as_json(result),
            json!([{"region": "East", "sales": 130}, {"region": "West", "sales": 50}])
        );
        assert!(run_chart_query(&sales(), "", "sales", &EngineConfig::default()).is_err());
    }

    #[test]
    fn test_single_on_no_matching_rows() {
        let config = EngineConfig::default();
        let none = vec![FilterClause::new("region", FilterCondition::Is, "North")];
        for metric in [Metric::Sum, Metric::Average, Metric::Count] {
            let spec = MetricSpec::new(metric, "sales");
            let value = aggregate_single(&sales(), &spec, &none, None, &config).unwrap();
            assert_eq!(value, json!(0));
        }
        let empty = Dataset::default();
        let value = aggregate_single(&empty, &MetricSpec::new(Metric::Sum, "sales"), &[], None, &config)
            .unwrap();
        assert_eq!(value, json!(0));
    }

    #[test]
    fn test_single_null_policy() {
        let config = EngineConfig {
            empty_aggregate: EmptyAggregate::Null,
            ..EngineConfig::default()
        };
        let spec = MetricSpec::new(Metric::Min, "region");
        assert_eq!(aggregate_single(&sales(), &spec, &[], None, &config).unwrap(), Value::Null);
    }

    #[test]
    fn test_single_with_date_range() {
        let rows = vec![
            [("day", "03/01/2024"), ("amount", "10")],
            [("day", "15/01/2024"), ("amount", "20")],
            [("day", "not a day"), ("amount", "40")],
            [("day", "02/02/2024"), ("amount", "80")],
        ];
        let dataset = Dataset::new(rows.into_iter().map(|r| r.into_iter().collect()).collect())
            .with_date_format("dd/MM/yyyy");
        let range = DateRangeFilter::new(
            "day",
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap().and_hms_opt(0, 0, 0).unwrap(),
        );
        let spec = MetricSpec::new(Metric::Sum, "amount");
        let value =
            aggregate_single(&dataset, &spec, &[], Some(&range), &EngineConfig::default()).unwrap();
        assert_eq!(value, json!(30));
    }
}
