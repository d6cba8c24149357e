//! Datasets and the store the engine loads them from.
//!
//! The upload pipeline owns persistence: it parses a CSV and stores the rows
//! as a JSON document keyed by dataset id. The engine only reads them through
//! [`DatasetStore`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;

use crate::error::{EngineError, EngineResult};
use crate::value::Row;

/// An immutable row-set plus the date format its date columns were written in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub rows: Vec<Row>,
    pub date_format: Option<String>,
}

/// The stored document shape.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetDocument {
    #[serde(default)]
    rows: Option<Vec<Row>>,
    #[serde(default)]
    date_format: Option<String>,
}

impl Dataset {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            date_format: None,
        }
    }

    pub fn with_date_format(mut self, format: impl Into<String>) -> Self {
        self.date_format = Some(format.into());
        self
    }

    /// Parse a stored document. A document without `rows` was never
    /// processed and is reported as not found.
    pub fn from_json(dataset_id: &str, json: &str) -> EngineResult<Self> {
        let doc: Option<DatasetDocument> = serde_json::from_str(json).map_err(|e| {
            EngineError::Store(format!("corrupt dataset document {}: {}", dataset_id, e))
        })?;

        let doc = doc.ok_or_else(|| EngineError::NotFound {
            dataset_id: dataset_id.to_string(),
        })?;
        let rows = doc.rows.ok_or_else(|| EngineError::NotFound {
            dataset_id: dataset_id.to_string(),
        })?;

        Ok(Self {
            rows,
            date_format: doc.date_format.filter(|f| !f.trim().is_empty()),
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Source of processed datasets.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Load a dataset, failing with [`EngineError::NotFound`] when absent.
    async fn load_dataset(&self, dataset_id: &str) -> EngineResult<Arc<Dataset>>;
}

#[async_trait]
impl<S: DatasetStore + ?Sized> DatasetStore for Arc<S> {
    async fn load_dataset(&self, dataset_id: &str) -> EngineResult<Arc<Dataset>> {
        (**self).load_dataset(dataset_id).await
    }
}

/// Store backed by a map held in memory.
#[derive(Debug, Default)]
pub struct InMemoryDatasetStore {
    datasets: RwLock<HashMap<String, Arc<Dataset>>>,
}

impl InMemoryDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dataset_id: impl Into<String>, dataset: Dataset) -> EngineResult<()> {
        let mut datasets = self
            .datasets
            .write()
            .map_err(|e| EngineError::Store(format!("lock poisoned: {}", e)))?;
        datasets.insert(dataset_id.into(), Arc::new(dataset));
        Ok(())
    }

    /// Insert a stored JSON document as produced by the upload pipeline.
    pub fn insert_json(&self, dataset_id: &str, json: &str) -> EngineResult<()> {
        let dataset = Dataset::from_json(dataset_id, json)?;
        self.insert(dataset_id, dataset)
    }

    pub fn remove(&self, dataset_id: &str) -> EngineResult<Option<Arc<Dataset>>> {
        let mut datasets = self
            .datasets
            .write()
            .map_err(|e| EngineError::Store(format!("lock poisoned: {}", e)))?;
        Ok(datasets.remove(dataset_id))
    }
}

#[async_trait]
impl DatasetStore for InMemoryDatasetStore {
    async fn load_dataset(&self, dataset_id: &str) -> EngineResult<Arc<Dataset>> {
        let datasets = self
            .datasets
            .read()
            .map_err(|e| EngineError::Store(format!("lock poisoned: {}", e)))?;
        datasets
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                dataset_id: dataset_id.to_string(),
            })
    }
}

/// Load-once cache in front of another store.
///
/// The cache is an ordinary value: whoever builds the query service decides
/// whether it lives for the process or for a single request.
pub struct CachedDatasetStore<S> {
    inner: S,
    cache: RwLock<HashMap<String, Arc<Dataset>>>,
}

impl<S: DatasetStore> CachedDatasetStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Drop one cached dataset so the next load goes to the inner store.
    pub fn invalidate(&self, dataset_id: &str) -> EngineResult<()> {
        self.cache
            .write()
            .map_err(|e| EngineError::Store(format!("lock poisoned: {}", e)))?
            .remove(dataset_id);
        Ok(())
    }

    pub fn clear(&self) -> EngineResult<()> {
        self.cache
            .write()
            .map_err(|e| EngineError::Store(format!("lock poisoned: {}", e)))?
            .clear();
        Ok(())
    }

    fn cached(&self, dataset_id: &str) -> EngineResult<Option<Arc<Dataset>>> {
        let cache = self
            .cache
            .read()
            .map_err(|e| EngineError::Store(format!("lock poisoned: {}", e)))?;
        Ok(cache.get(dataset_id).cloned())
    }
}

#[async_trait]
impl<S: DatasetStore> DatasetStore for CachedDatasetStore<S> {
    async fn load_dataset(&self, dataset_id: &str) -> EngineResult<Arc<Dataset>> {
        if let Some(dataset) = self.cached(dataset_id)? {
            debug!("dataset cache hit: {}", dataset_id);
            return Ok(dataset);
        }

        // The lock is not held across the inner load.
        let dataset = self.inner.load_dataset(dataset_id).await?;
        debug!("dataset cache miss: {} ({} rows)", dataset_id, dataset.len());

        let mut cache = self
            .cache
            .write()
            .map_err(|e| EngineError::Store(format!("lock poisoned: {}", e)))?;
        Ok(cache
            .entry(dataset_id.to_string())
            .or_insert(dataset)
            .clone())
    }
}
