//! Tabula Query Engine
//!
//! In-memory analytics engine behind dashboard widgets: filters the rows of
//! one uploaded dataset, groups them by a column and computes summary
//! metrics. Native callers go through [`service::QueryService`]; browser
//! callers use the WebAssembly entry points below and pass the dataset
//! document they already loaded.
//!
//! Build with: `wasm-pack build --target web --out-dir ../wasm`

pub mod aggregate;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod filter;
pub mod group;
pub mod service;
pub mod value;

use log::{debug, error};
use wasm_bindgen::prelude::*;

use crate::config::EngineConfig;
use crate::dataset::Dataset;
use crate::error::{EngineError, EngineResult};
use crate::service::{SingleAggregateRequest, SingleAggregateResponse};

pub use crate::aggregate::{Metric, MetricSpec};
pub use crate::engine::{aggregate_single, run_chart_query, run_query, Query, Record};
pub use crate::error::EngineError as Error;
pub use crate::filter::{DateRangeFilter, FilterClause, FilterCondition};

const INLINE_DATASET: &str = "inline";

/// Initialize the Wasm module (called once on load).
#[wasm_bindgen]
pub fn init() -> Result<(), JsValue> {
    Ok(())
}

fn to_js(err: EngineError) -> JsValue {
    if !err.is_client_error() {
        error!("wasm query failed: {}", err);
    }
    JsValue::from_str(&err.public_message())
}

/// Milliseconds from the host clock. Native builds have no JS clock.
#[cfg(target_arch = "wasm32")]
fn now_ms() -> f64 {
    js_sys::Date::now()
}

#[cfg(not(target_arch = "wasm32"))]
fn now_ms() -> f64 {
    0.0
}

fn load_config(config_json: Option<String>) -> EngineResult<EngineConfig> {
    match config_json {
        Some(ref json) => EngineConfig::from_json(json),
        None => Ok(EngineConfig::default()),
    }
}

fn encode<T: serde::Serialize>(value: &T) -> EngineResult<String> {
    serde_json::to_string(value)
        .map_err(|e| EngineError::Internal(format!("serialization error: {}", e)))
}

fn grouped_query_json(dataset_json: &str, query_json: &str, config_json: Option<String>) -> EngineResult<String> {
    let config = load_config(config_json)?;
    let query: Query = serde_json::from_str(query_json)?;
    query.validate()?;
    let dataset = Dataset::from_json(INLINE_DATASET, dataset_json)?;

    let start = now_ms();
    let records = run_query(&dataset, &query, &config)?;
    debug!(
        "query over {} rows produced {} records in {}ms",
        dataset.len(),
        records.len(),
        now_ms() - start
    );
    encode(&records)
}

fn chart_query_json(
    dataset_json: &str,
    category_key: &str,
    value_key: &str,
    config_json: Option<String>,
) -> EngineResult<String> {
    let config = load_config(config_json)?;
    if category_key.is_empty() || value_key.is_empty() {
        return Err(EngineError::invalid("categoryKey and valueKey are required"));
    }
    let dataset = Dataset::from_json(INLINE_DATASET, dataset_json)?;

    let start = now_ms();
    let records = run_chart_query(&dataset, category_key, value_key, &config)?;
    debug!(
        "chart query produced {} points in {}ms",
        records.len(),
        now_ms() - start
    );
    encode(&records)
}

fn single_aggregate_json(
    dataset_json: &str,
    request_json: &str,
    config_json: Option<String>,
) -> EngineResult<String> {
    let config = load_config(config_json)?;
    let mut body: serde_json::Value = serde_json::from_str(request_json)?;
    // The host already resolved the dataset, so the id is optional here.
    if let Some(obj) = body.as_object_mut() {
        obj.entry("datasourceId")
            .or_insert_with(|| INLINE_DATASET.into());
    }
    let request: SingleAggregateRequest = serde_json::from_value(body)?;
    let spec = request.metric_spec();
    spec.validate()?;
    let dataset = Dataset::from_json(INLINE_DATASET, dataset_json)?;

    let result = aggregate_single(
        &dataset,
        &spec,
        &request.filters,
        request.date_range.as_ref(),
        &config,
    )?;
    encode(&SingleAggregateResponse { result })
}

/// Run a grouped query against a dataset document.
///
/// # Arguments
/// * `dataset_json` - stored dataset document (`{"rows": [...], "dateFormat": "..."}`)
/// * `query_json` - JSON string of the query (`filters`, `summaries`, `groupBy`)
/// * `config_json` - Optional JSON string of the engine configuration
///
/// # Returns
/// JSON array of flat result records
#[wasm_bindgen]
pub fn execute_query(
    dataset_json: &str,
    query_json: &str,
    config_json: Option<String>,
) -> Result<String, JsValue> {
    grouped_query_json(dataset_json, query_json, config_json).map_err(to_js)
}

/// Sum `value_key` by `category_key`.
///
/// # Returns
/// JSON array of `{ [category_key]: label, [value_key]: number }`
#[wasm_bindgen]
pub fn execute_chart_query(
    dataset_json: &str,
    category_key: &str,
    value_key: &str,
    config_json: Option<String>,
) -> Result<String, JsValue> {
    chart_query_json(dataset_json, category_key, value_key, config_json).map_err(to_js)
}

/// Compute one aggregate for a KPI card.
///
/// # Arguments
/// * `dataset_json` - stored dataset document
/// * `request_json` - `{ columnName, aggregationType, filters?, dateRange? }`
/// * `config_json` - Optional JSON string of the engine configuration
///
/// # Returns
/// JSON string `{ "result": number }`
#[wasm_bindgen]
pub fn execute_single_aggregate(
    dataset_json: &str,
    request_json: &str,
    config_json: Option<String>,
) -> Result<String, JsValue> {
    single_aggregate_json(dataset_json, request_json, config_json).map_err(to_js)
}
