//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// How aggregates over zero valid values are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyAggregate {
    /// Legacy behavior: `0`, indistinguishable from a real zero.
    #[default]
    Zero,
    /// JSON `null`.
    Null,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Applies to average, median, min and max. Sum and count are always numeric.
    pub empty_aggregate: EmptyAggregate,
    /// Date pattern used when the dataset does not carry one.
    pub default_date_format: String,
    /// Label of the implicit group when no grouping column is chosen.
    pub total_label: String,
    /// Record key holding the group label for ungrouped queries.
    pub ungrouped_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            empty_aggregate: EmptyAggregate::Zero,
            default_date_format: "yyyy-MM-dd".to_string(),
            total_label: "Total".to_string(),
            ungrouped_key: "group".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
