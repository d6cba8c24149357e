//! Cell values and on-demand coercion of raw CSV text.
//!
//! Every cell is stored as the raw string it was uploaded with. Numeric and
//! date views are derived when a metric or filter asks for them; a value that
//! does not coerce yields `None` and is skipped by the caller.

use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Parse a raw cell as a finite number.
pub fn to_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Parse a raw cell against an explicit date pattern.
pub fn to_date(raw: &str, pattern: &str) -> Option<NaiveDateTime> {
    DatePattern::new(pattern)?.parse(raw)
}

/// A date pattern compiled to chrono's strftime syntax.
///
/// Patterns containing `%` are taken as strftime already. Anything else is
/// read as Unicode-style tokens (`yyyy-MM-dd`, `dd/MM/yyyy HH:mm`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatePattern {
    format: String,
}

impl DatePattern {
    /// Returns `None` for an empty pattern or one with unsupported tokens.
    pub fn new(pattern: &str) -> Option<Self> {
        if pattern.trim().is_empty() {
            return None;
        }
        let format = if pattern.contains('%') {
            pattern.to_string()
        } else {
            translate_tokens(pattern)?
        };
        Some(Self { format })
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn parse(&self, raw: &str) -> Option<NaiveDateTime> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        NaiveDateTime::parse_from_str(trimmed, &self.format)
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(trimmed, &self.format)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
    }
}

fn translate_tokens(pattern: &str) -> Option<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];

        if ch == '\'' {
            // '' is an escaped quote, otherwise copy until the closing quote
            if chars.get(i + 1) == Some(&'\'') {
                out.push('\'');
                i += 2;
                continue;
            }
            i += 1;
            while i < chars.len() && chars[i] != '\'' {
                push_literal(&mut out, chars[i]);
                i += 1;
            }
            i += 1;
            continue;
        }

        if !ch.is_ascii_alphabetic() {
            push_literal(&mut out, ch);
            i += 1;
            continue;
        }

        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == ch {
            run += 1;
        }
        let spec = match (ch, run) {
            ('y', 2) => "%y",
            ('y', _) => "%Y",
            ('M' | 'L', 1 | 2) => "%m",
            ('M' | 'L', 3) => "%b",
            ('M' | 'L', _) => "%B",
            ('d', 1 | 2) => "%d",
            ('D', 1..=3) => "%j",
            ('H', 1 | 2) => "%H",
            ('h', 1 | 2) => "%I",
            ('m', 1 | 2) => "%M",
            ('s', 1 | 2) => "%S",
            ('S', 3) => "%3f",
            ('S', 6) => "%6f",
            ('S', 9) => "%9f",
            ('X' | 'x', 2 | 4) => "%z",
            ('X' | 'x', _) => "%:z",
            ('a', _) => "%p",
            ('E', 1..=3) => "%a",
            ('E', _) => "%A",
            _ => return None,
        };
        out.push_str(spec);
        i += run;
    }

    Some(out)
}

fn push_literal(out: &mut String, ch: char) {
    if ch == '%' {
        out.push_str("%%");
    } else {
        out.push(ch);
    }
}

/// A raw cell with a cached numeric view.
#[derive(Debug, Clone, Default)]
pub struct Cell {
    raw: String,
    number: OnceLock<Option<f64>>,
}

impl Cell {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            number: OnceLock::new(),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn number(&self) -> Option<f64> {
        *self.number.get_or_init(|| to_number(&self.raw))
    }

    pub fn date(&self, pattern: &DatePattern) -> Option<NaiveDateTime> {
        pattern.parse(&self.raw)
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Cell {}

impl From<&str> for Cell {
    fn from(raw: &str) -> Self {
        Cell::new(raw)
    }
}

impl From<String> for Cell {
    fn from(raw: String) -> Self {
        Cell::new(raw)
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Cell {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Upload pipelines sometimes store numbers or booleans instead of text.
        let raw = match Value::deserialize(deserializer)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            other => other.to_string(),
        };
        Ok(Cell::new(raw))
    }
}

/// One dataset row: column name to cell, in upload column order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    cells: IndexMap<String, Cell>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, raw: impl Into<String>) {
        self.cells.insert(column.into(), Cell::new(raw));
    }

    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.cells.get(column)
    }

    /// Raw text of a column; absent columns read as the empty string.
    pub fn raw(&self, column: &str) -> &str {
        self.get(column).map(Cell::raw).unwrap_or("")
    }

    pub fn number(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(Cell::number)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.cells.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (column, raw) in iter {
            row.insert(column, raw);
        }
        row
    }
}
