//! Partitioning of filtered rows into groups.

use indexmap::IndexMap;
use serde_json::Value;

use crate::value::Row;

/// Key of one output group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    /// The single group of an ungrouped query.
    Total,
    /// Exact raw value of the grouping column, untrimmed.
    Value(String),
    /// Rows that do not have the grouping column at all.
    Missing,
}

impl GroupKey {
    /// The label written into result records. Missing renders as `null`
    /// so it can never collide with a real cell value.
    pub fn to_json(&self, total_label: &str) -> Value {
        match self {
            GroupKey::Total => Value::String(total_label.to_string()),
            GroupKey::Value(v) => Value::String(v.clone()),
            GroupKey::Missing => Value::Null,
        }
    }
}

/// Group rows by the raw value of `column`, keeping first-seen order.
pub fn group_rows<'a, I>(rows: I, column: Option<&str>) -> IndexMap<GroupKey, Vec<&'a Row>>
where
    I: IntoIterator<Item = &'a Row>,
{
    let mut groups: IndexMap<GroupKey, Vec<&'a Row>> = IndexMap::new();

    let Some(column) = column else {
        groups.insert(GroupKey::Total, rows.into_iter().collect());
        return groups;
    };

    for row in rows {
        let key = match row.get(column) {
            Some(cell) => GroupKey::Value(cell.raw().to_string()),
            None => GroupKey::Missing,
        };
        groups.entry(key).or_default().push(row);
    }
    groups
}
