//! Index row and extraction rule types.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Value kind an extraction rule produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Token,
    Date,
    Number,
    Reference,
    Quantity,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Token => "token",
            ValueKind::Date => "date",
            ValueKind::Number => "number",
            ValueKind::Reference => "reference",
            ValueKind::Quantity => "quantity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(ValueKind::String),
            "token" => Some(ValueKind::Token),
            "date" => Some(ValueKind::Date),
            "number" => Some(ValueKind::Number),
            "reference" => Some(ValueKind::Reference),
            "quantity" => Some(ValueKind::Quantity),
            _ => None,
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared extraction rule: the element at `path` feeds parameter `param`.
///
/// Paths are dotted element names relative to the resource root. Arrays are
/// traversed transparently and a trailing polymorphic name (`effective`)
/// matches its typed variants (`effectiveDateTime`, `effectivePeriod`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionRule {
    pub param: &'static str,
    pub path: &'static str,
    pub kind: ValueKind,
}

/// One extracted, typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndexValue {
    String {
        /// Lowercased form used for default (prefix) and `:contains` matching
        normalized: String,
        /// Original text used for `:exact` matching
        exact: String,
    },
    Token {
        system: Option<String>,
        code: String,
    },
    Date {
        #[serde(with = "time::serde::rfc3339")]
        start: OffsetDateTime,
        #[serde(with = "time::serde::rfc3339")]
        end: OffsetDateTime,
    },
    Number {
        value: f64,
    },
    Reference {
        target_type: Option<String>,
        target_id: String,
    },
    Quantity {
        value: f64,
        system: Option<String>,
        /// Coded unit (`Quantity.code`) when present, else the display unit
        unit: Option<String>,
    },
}

impl IndexValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            IndexValue::String { .. } => ValueKind::String,
            IndexValue::Token { .. } => ValueKind::Token,
            IndexValue::Date { .. } => ValueKind::Date,
            IndexValue::Number { .. } => ValueKind::Number,
            IndexValue::Reference { .. } => ValueKind::Reference,
            IndexValue::Quantity { .. } => ValueKind::Quantity,
        }
    }
}

/// A `(resource_type, id, version_id, param, value)` tuple for one lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchIndexRow {
    pub resource_type: String,
    pub resource_id: String,
    pub version_id: u64,
    pub param: String,
    pub value: IndexValue,
}
