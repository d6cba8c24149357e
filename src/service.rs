//! Request/response surface: load a dataset from the store, then dispatch.
//!
//! Three endpoints share one service. Requests are validated before the
//! dataset is loaded, and nothing is retried; the caller owns retry policy.

use std::fmt;
use std::str::FromStr;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::aggregate::{Metric, MetricSpec};
use crate::config::EngineConfig;
use crate::dataset::DatasetStore;
use crate::engine::{aggregate_single, run_chart_query, run_query, Query, Record};
use crate::error::{EngineError, EngineResult};
use crate::filter::{DateRangeFilter, FilterClause};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedQueryRequest {
    pub datasource_id: String,
    pub query: Query,
}

/// Legacy sum-by-category shortcut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartQueryRequest {
    pub datasource_id: String,
    #[serde(default)]
    pub category_key: String,
    #[serde(default)]
    pub value_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleAggregateRequest {
    pub datasource_id: String,
    #[serde(default)]
    pub column_name: Option<String>,
    pub aggregation_type: Metric,
    #[serde(default)]
    pub filters: Vec<FilterClause>,
    #[serde(default)]
    pub date_range: Option<DateRangeFilter>,
}

impl SingleAggregateRequest {
    pub fn metric_spec(&self) -> MetricSpec {
        MetricSpec {
            metric: self.aggregation_type,
            column: self.column_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleAggregateResponse {
    pub result: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Query,
    Chart,
    Aggregate,
}

impl FromStr for Endpoint {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(Endpoint::Query),
            "chart" => Ok(Endpoint::Chart),
            "aggregate" => Ok(Endpoint::Aggregate),
            other => Err(EngineError::invalid(format!("unknown endpoint '{}'", other))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Endpoint::Query => "query",
            Endpoint::Chart => "chart",
            Endpoint::Aggregate => "aggregate",
        };
        f.write_str(name)
    }
}

/// Status plus JSON body, ready for whatever transport sits in front.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    pub status: u16,
    pub body: Value,
}

fn require_dataset_id(dataset_id: &str) -> EngineResult<()> {
    if dataset_id.trim().is_empty() {
        return Err(EngineError::invalid("datasourceId is required"));
    }
    Ok(())
}

fn log_outcome<T>(endpoint: Endpoint, dataset_id: &str, result: &EngineResult<T>) {
    match result {
        Ok(_) => debug!("{} on {} succeeded", endpoint, dataset_id),
        Err(e) if e.is_client_error() => warn!("{} on {} rejected: {}", endpoint, dataset_id, e),
        Err(e) => error!("{} on {} failed: {}", endpoint, dataset_id, e),
    }
}

pub struct QueryService<S> {
    store: S,
    config: EngineConfig,
}

impl<S: DatasetStore> QueryService<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn grouped_query(&self, request: &GroupedQueryRequest) -> EngineResult<Vec<Record>> {
        let result = self.grouped_query_inner(request).await;
        log_outcome(Endpoint::Query, &request.datasource_id, &result);
        result
    }

    async fn grouped_query_inner(&self, request: &GroupedQueryRequest) -> EngineResult<Vec<Record>> {
        require_dataset_id(&request.datasource_id)?;
        request.query.validate()?;
        let dataset = self.store.load_dataset(&request.datasource_id).await?;
        run_query(&dataset, &request.query, &self.config)
    }

    pub async fn chart_query(&self, request: &ChartQueryRequest) -> EngineResult<Vec<Record>> {
        let result = self.chart_query_inner(request).await;
        log_outcome(Endpoint::Chart, &request.datasource_id, &result);
        result
    }

    async fn chart_query_inner(&self, request: &ChartQueryRequest) -> EngineResult<Vec<Record>> {
        require_dataset_id(&request.datasource_id)?;
        if request.category_key.is_empty() || request.value_key.is_empty() {
            return Err(EngineError::invalid("categoryKey and valueKey are required"));
        }
        let dataset = self.store.load_dataset(&request.datasource_id).await?;
        run_chart_query(
            &dataset,
            &request.category_key,
            &request.value_key,
            &self.config,
        )
    }

    pub async fn single_aggregate(
        &self,
        request: &SingleAggregateRequest,
    ) -> EngineResult<SingleAggregateResponse> {
        let result = self.single_aggregate_inner(request).await;
        log_outcome(Endpoint::Aggregate, &request.datasource_id, &result);
        result
    }

    async fn single_aggregate_inner(
        &self,
        request: &SingleAggregateRequest,
    ) -> EngineResult<SingleAggregateResponse> {
        require_dataset_id(&request.datasource_id)?;
        let spec = request.metric_spec();
        spec.validate()?;
        let dataset = self.store.load_dataset(&request.datasource_id).await?;
        let result = aggregate_single(
            &dataset,
            &spec,
            &request.filters,
            request.date_range.as_ref(),
            &self.config,
        )?;
        Ok(SingleAggregateResponse { result })
    }

    /// Decode a JSON body, run the endpoint and encode the outcome.
    pub async fn handle_json(&self, endpoint: Endpoint, body: &str) -> ServiceResponse {
        match self.dispatch_json(endpoint, body).await {
            Ok(body) => ServiceResponse { status: 200, body },
            Err(e) => ServiceResponse {
                status: e.status_code(),
                body: json!({ "error": e.public_message() }),
            },
        }
    }

    async fn dispatch_json(&self, endpoint: Endpoint, body: &str) -> EngineResult<Value> {
        let value = match endpoint {
            Endpoint::Query => {
                let request: GroupedQueryRequest = serde_json::from_str(body)?;
                serde_json::to_value(self.grouped_query(&request).await?)
            }
            Endpoint::Chart => {
                let request: ChartQueryRequest = serde_json::from_str(body)?;
                serde_json::to_value(self.chart_query(&request).await?)
            }
            Endpoint::Aggregate => {
                let request: SingleAggregateRequest = serde_json::from_str(body)?;
                serde_json::to_value(self.single_aggregate(&request).await?)
            }
        };
        value.map_err(|e| EngineError::Internal(format!("failed to encode response: {}", e)))
    }
}
