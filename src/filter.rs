//! Filter evaluation for the query engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::value::{Cell, DatePattern, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    Is,
    IsNot,
    Contains,
    DoesNotContain,
    IsEmpty,
    NotEmpty,
}

impl FromStr for FilterCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "is" => Ok(FilterCondition::Is),
            "is_not" => Ok(FilterCondition::IsNot),
            "contains" => Ok(FilterCondition::Contains),
            "does_not_contain" => Ok(FilterCondition::DoesNotContain),
            "is_empty" => Ok(FilterCondition::IsEmpty),
            "not_empty" => Ok(FilterCondition::NotEmpty),
            other => Err(format!("unknown filter condition '{}'", other)),
        }
    }
}

impl fmt::Display for FilterCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterCondition::Is => "is",
            FilterCondition::IsNot => "is_not",
            FilterCondition::Contains => "contains",
            FilterCondition::DoesNotContain => "does_not_contain",
            FilterCondition::IsEmpty => "is_empty",
            FilterCondition::NotEmpty => "not_empty",
        };
        f.write_str(name)
    }
}

/// A single `column condition value` predicate.
///
/// Clauses left half-filled in the query builder (no column or no condition)
/// match every row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterClause {
    #[serde(default)]
    pub column: String,
    #[serde(default, deserialize_with = "deserialize_condition")]
    pub condition: Option<FilterCondition>,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub value: String,
}

impl FilterClause {
    pub fn new(column: impl Into<String>, condition: FilterCondition, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            condition: Some(condition),
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        let condition = match self.condition {
            Some(c) if !self.column.is_empty() => c,
            _ => return true,
        };
        let cell = row.raw(&self.column);

        match condition {
            FilterCondition::Is => cell == self.value,
            FilterCondition::IsNot => cell != self.value,
            FilterCondition::Contains => cell.contains(self.value.as_str()),
            FilterCondition::DoesNotContain => !cell.contains(self.value.as_str()),
            FilterCondition::IsEmpty => cell.is_empty(),
            FilterCondition::NotEmpty => !cell.is_empty(),
        }
    }
}

fn deserialize_condition<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<FilterCondition>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => s.parse().map(Some).map_err(de::Error::custom),
    }
}

fn deserialize_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Cell::deserialize(deserializer).map(|cell| cell.raw().to_string())
}

/// Inclusive date window on one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRangeFilter {
    pub column: String,
    #[serde(deserialize_with = "deserialize_boundary")]
    pub from: NaiveDateTime,
    #[serde(deserialize_with = "deserialize_boundary")]
    pub to: NaiveDateTime,
}

impl DateRangeFilter {
    pub fn new(column: impl Into<String>, from: NaiveDateTime, to: NaiveDateTime) -> Self {
        Self {
            column: column.into(),
            from,
            to,
        }
    }

    /// Rows whose cell does not parse with `pattern` never match.
    pub fn matches(&self, row: &Row, pattern: Option<&DatePattern>) -> bool {
        let (Some(pattern), Some(cell)) = (pattern, row.get(&self.column)) else {
            return false;
        };
        match cell.date(pattern) {
            Some(date) => self.from <= date && date <= self.to,
            None => false,
        }
    }
}

/// Parse a range boundary: RFC 3339, ISO date-time, or a bare ISO date.
pub fn parse_boundary(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.naive_local())
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok())
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn deserialize_boundary<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_boundary(&raw).ok_or_else(|| de::Error::custom(format!("invalid date boundary '{}'", raw)))
}

/// Evaluate a list of clauses against a row. All must match.
pub fn evaluate_filters(row: &Row, clauses: &[FilterClause]) -> bool {
    clauses.iter().all(|c| c.matches(row))
}

/// The full predicate applied to each row of a query: an optional date
/// window followed by the clause list.
pub struct RowFilter<'a> {
    clauses: &'a [FilterClause],
    date_range: Option<&'a DateRangeFilter>,
    pattern: Option<DatePattern>,
}

impl<'a> RowFilter<'a> {
    pub fn new(
        clauses: &'a [FilterClause],
        date_range: Option<&'a DateRangeFilter>,
        date_format: &str,
    ) -> Self {
        // Compiled once per query, not per row.
        let pattern = date_range.and_then(|_| DatePattern::new(date_format));
        Self {
            clauses,
            date_range,
            pattern,
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        if let Some(range) = self.date_range {
            if !range.matches(row, self.pattern.as_ref()) {
                return false;
            }
        }
        evaluate_filters(row, self.clauses)
    }
}
