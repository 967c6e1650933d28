//! Scalar cell value.
//!
//! # Responsibility
//! - Define the closed set of values an attribute cell can hold.
//! - Own the coercion policy applied when text input enters the engine.
//!
//! # Invariants
//! - `Value::Number` never holds NaN or an infinity when built through
//!   `Value::parse` or `Value::number`.
//! - Explicit JSON `null` and missing cells are both `Value::Absent`.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// One cell of an attribute column.
///
/// Serialized untagged: numbers as JSON numbers, text as JSON strings and
/// `Absent` as `null`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
    #[default]
    Absent,
}

impl Value {
    /// Coerces raw text input.
    ///
    /// Text that parses as a finite number becomes `Number`; empty or
    /// whitespace-only input becomes `Absent`; everything else is kept as
    /// `Text` unchanged.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::Absent;
        }
        match trimmed.parse::<f64>() {
            Ok(number) if number.is_finite() => Self::Number(number),
            _ => Self::Text(input.to_string()),
        }
    }

    /// Builds a numeric value, mapping non-finite input to `Absent`.
    pub fn number(value: f64) -> Self {
        if value.is_finite() {
            Self::Number(value)
        } else {
            Self::Absent
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Converts a JSON payload cell into a value.
    ///
    /// Booleans, arrays and objects have no cell representation and yield
    /// `None` so callers can skip the entry.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(Self::Absent),
            serde_json::Value::Number(number) => number.as_f64().map(Self::number),
            serde_json::Value::String(text) => Some(Self::Text(text.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Number(value) => serde_json::Number::from_f64(*value)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(value) => serde_json::Value::String(value.clone()),
            Self::Absent => serde_json::Value::Null,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

/// Text input goes through [`Value::parse`]. Use [`Value::text`] to keep a
/// numeric-looking string as text.
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Absent, Into::into)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
            Self::Absent => Ok(()),
        }
    }
}
