use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tabula_query_engine::config::{EmptyAggregate, EngineConfig};
use tabula_query_engine::dataset::{CachedDatasetStore, Dataset, DatasetStore, InMemoryDatasetStore};
use tabula_query_engine::error::{EngineError, EngineResult};
use tabula_query_engine::service::{
    ChartQueryRequest, Endpoint, GroupedQueryRequest, QueryService, SingleAggregateRequest,
};

const ORDERS: &str = r#"{
    "dateFormat": "dd/MM/yyyy",
    "rows": [
        {"region": "East", "product": "Widget", "sales": "100", "ordered": "03/01/2024"},
        {"region": "West", "product": "Gadget", "sales": "50",  "ordered": "17/01/2024"},
        {"region": "East", "product": "Gadget", "sales": "30",  "ordered": "02/02/2024"},
        {"region": "North", "product": "Widget", "sales": "n/a", "ordered": "unknown"},
        {"region": "West", "product": "Widget", "sales": "",    "ordered": "28/02/2024"}
    ]
}"#;

fn store() -> InMemoryDatasetStore {
    let store = InMemoryDatasetStore::new();
    store.insert_json("orders", ORDERS).unwrap();
    store.insert_json("empty", r#"{"rows": []}"#).unwrap();
    store
}

fn records(values: Vec<serde_json::Map<String, Value>>) -> Value {
    Value::Array(values.into_iter().map(Value::Object).collect())
}

#[tokio::test]
async fn test_grouped_query_end_to_end() {
    let service = QueryService::new(store());
    let request: GroupedQueryRequest = serde_json::from_value(json!({
        "datasourceId": "orders",
        "query": {
            "filters": [{"column": "product", "condition": "is", "value": "Widget"}],
            "summaries": [
                {"metric": "count"},
                {"metric": "sum", "column": "sales"},
                {"metric": "count_distinct", "column": "product"}
            ],
            "groupBy": "region"
        }
    }))
    .unwrap();

    let result = service.grouped_query(&request).await.unwrap();
    assert_eq!(
        records(result),
        json!([
            {"region": "East", "count_of_rows": 1, "sum_of_sales": 100, "count_distinct_of_product": 1},
            {"region": "North", "count_of_rows": 1, "sum_of_sales": 0, "count_distinct_of_product": 1},
            {"region": "West", "count_of_rows": 1, "sum_of_sales": 0, "count_distinct_of_product": 1}
        ])
    );
}

#[tokio::test]
async fn test_grouped_query_with_date_range() {
    let service = QueryService::new(store());
    let request: GroupedQueryRequest = serde_json::from_value(json!({
        "datasourceId": "orders",
        "query": {
            "summaries": [{"metric": "sum", "column": "sales"}],
            "groupBy": "region",
            "dateRange": {"column": "ordered", "from": "2024-01-01", "to": "2024-01-31"}
        }
    }))
    .unwrap();

    let result = service.grouped_query(&request).await.unwrap();
    assert_eq!(
        records(result),
        json!([
            {"region": "East", "sum_of_sales": 100},
            {"region": "West", "sum_of_sales": 50}
        ])
    );
}

#[tokio::test]
async fn test_missing_dataset_is_not_found() {
    let service = QueryService::new(store());
    let request = GroupedQueryRequest {
        datasource_id: "nope".to_string(),
        query: serde_json::from_value(json!({"summaries": [{"metric": "count"}]})).unwrap(),
    };
    let err = service.grouped_query(&request).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::NotFound {
            dataset_id: "nope".to_string()
        }
    );
}

#[tokio::test]
async fn test_chart_query() {
    let service = QueryService::new(store());
    let request = ChartQueryRequest {
        datasource_id: "orders".to_string(),
        category_key: "product".to_string(),
        value_key: "sales".to_string(),
    };
    let result = service.chart_query(&request).await.unwrap();
    assert_eq!(
        records(result),
        json!([{"product": "Widget", "sales": 100}, {"product": "Gadget", "sales": 80}])
    );

    let missing_key = ChartQueryRequest {
        value_key: String::new(),
        ..request
    };
    assert!(matches!(
        service.chart_query(&missing_key).await,
        Err(EngineError::InvalidQuery(_))
    ));
}

#[tokio::test]
async fn test_single_aggregate() {
    let service = QueryService::new(store());
    let request: SingleAggregateRequest = serde_json::from_value(json!({
        "datasourceId": "orders",
        "columnName": "sales",
        "aggregationType": "average",
        "filters": [{"column": "region", "condition": "is_not", "value": "North"}]
    }))
    .unwrap();
    let response = service.single_aggregate(&request).await.unwrap();
    assert_eq!(response.result, json!(60));
}

#[tokio::test]
async fn test_single_aggregate_on_empty_dataset() {
    let service = QueryService::new(store());
    for metric in ["sum", "average", "count"] {
        let request: SingleAggregateRequest = serde_json::from_value(json!({
            "datasourceId": "empty",
            "columnName": "sales",
            "aggregationType": metric
        }))
        .unwrap();
        let response = service.single_aggregate(&request).await.unwrap();
        assert_eq!(response.result, json!(0), "metric {}", metric);
    }
}

#[tokio::test]
async fn test_null_policy_through_service() {
    let config = EngineConfig {
        empty_aggregate: EmptyAggregate::Null,
        ..EngineConfig::default()
    };
    let service = QueryService::with_config(store(), config);
    let request: SingleAggregateRequest = serde_json::from_value(json!({
        "datasourceId": "empty",
        "columnName": "sales",
        "aggregationType": "max"
    }))
    .unwrap();
    assert_eq!(service.single_aggregate(&request).await.unwrap().result, Value::Null);
}

#[tokio::test]
async fn test_handle_json_status_codes() {
    let service = QueryService::new(store());

    let ok = service
        .handle_json(
            Endpoint::Aggregate,
            r#"{"datasourceId": "orders", "aggregationType": "count"}"#,
        )
        .await;
    assert_eq!(ok.status, 200);
    assert_eq!(ok.body, json!({"result": 5}));

    let no_metrics = service
        .handle_json(
            Endpoint::Query,
            r#"{"datasourceId": "orders", "query": {"summaries": []}}"#,
        )
        .await;
    assert_eq!(no_metrics.status, 400);

    let malformed = service.handle_json(Endpoint::Chart, "{").await;
    assert_eq!(malformed.status, 400);

    let missing = service
        .handle_json(
            Endpoint::Chart,
            r#"{"datasourceId": "gone", "categoryKey": "a", "valueKey": "b"}"#,
        )
        .await;
    assert_eq!(missing.status, 404);
    assert_eq!(missing.body, json!({"error": "dataset not found: gone"}));
}

struct CountingStore {
    loads: AtomicUsize,
    inner: InMemoryDatasetStore,
}

#[async_trait]
impl DatasetStore for CountingStore {
    async fn load_dataset(&self, dataset_id: &str) -> EngineResult<Arc<Dataset>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_dataset(dataset_id).await
    }
}

struct FailingStore;

#[async_trait]
impl DatasetStore for FailingStore {
    async fn load_dataset(&self, _dataset_id: &str) -> EngineResult<Arc<Dataset>> {
        Err(EngineError::Store("timeout talking to db-primary:5432".to_string()))
    }
}

#[tokio::test]
async fn test_cached_store_loads_once() {
    let cached = Arc::new(CachedDatasetStore::new(CountingStore {
        loads: AtomicUsize::new(0),
        inner: store(),
    }));
    let service = QueryService::new(cached.clone());
    let request = ChartQueryRequest {
        datasource_id: "orders".to_string(),
        category_key: "region".to_string(),
        value_key: "sales".to_string(),
    };

    let first = service.chart_query(&request).await.unwrap();
    let second = service.chart_query(&request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(cached.inner().loads.load(Ordering::SeqCst), 1);

    cached.invalidate("orders").unwrap();
    service.chart_query(&request).await.unwrap();
    assert_eq!(cached.inner().loads.load(Ordering::SeqCst), 2);

    // misses are not cached
    assert!(service
        .chart_query(&ChartQueryRequest {
            datasource_id: "gone".to_string(),
            ..request.clone()
        })
        .await
        .is_err());
    assert!(service
        .chart_query(&ChartQueryRequest {
            datasource_id: "gone".to_string(),
            ..request
        })
        .await
        .is_err());
    assert_eq!(cached.inner().loads.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_store_failure_is_internal() {
    let service = QueryService::new(FailingStore);
    let response = service
        .handle_json(
            Endpoint::Aggregate,
            r#"{"datasourceId": "orders", "aggregationType": "count"}"#,
        )
        .await;
    assert_eq!(response.status, 500);
    assert!(!response.body.to_string().contains("db-primary"));
}

#[tokio::test]
async fn test_removed_dataset_is_not_found() {
    let store = store();
    assert_eq!(store.load_dataset("orders").await.unwrap().len(), 5);

    let removed = store.remove("orders").unwrap();
    assert_eq!(removed.map(|d| d.len()), Some(5));
    assert!(store.remove("orders").unwrap().is_none());

    let service = QueryService::new(store);
    let response = service
        .handle_json(
            Endpoint::Aggregate,
            r#"{"datasourceId": "orders", "aggregationType": "count"}"#,
        )
        .await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_cache_clear_forces_reload() {
    let cached = CachedDatasetStore::new(CountingStore {
        loads: AtomicUsize::new(0),
        inner: store(),
    });

    cached.load_dataset("orders").await.unwrap();
    cached.load_dataset("empty").await.unwrap();
    cached.load_dataset("orders").await.unwrap();
    assert_eq!(cached.inner().loads.load(Ordering::SeqCst), 2);

    cached.clear().unwrap();
    cached.load_dataset("orders").await.unwrap();
    cached.load_dataset("empty").await.unwrap();
    assert_eq!(cached.inner().loads.load(Ordering::SeqCst), 4);

    // the cache keeps serving what it already holds after the source drops it
    cached.inner().inner.remove("orders").unwrap();
    assert!(cached.load_dataset("orders").await.is_ok());
    cached.invalidate("orders").unwrap();
    assert!(matches!(
        cached.load_dataset("orders").await,
        Err(EngineError::NotFound { .. })
    ));
}
