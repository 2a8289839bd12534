// src/schema/types.rs

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::{collections::BTreeMap, fmt};

/// Target type of an output column. Closed set; descriptor names map onto it
/// through [`SemanticType::from_descriptor_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SemanticType {
    Text,
    /// Text where "Não há" / "Não se aplica" mean null.
    CustomText,
    Integer,
    /// Integer exported with ordinal markers or zero padding.
    CustomInteger,
    /// Money and other decimals in Brazilian notation.
    Decimal,
    /// `dd/mm/yyyy`
    Date,
    Boolean,
    /// Tax id (CPF), possibly masked with `*`.
    Cpf,
    /// Synthetic "withheld by law" flag; has no source column.
    Secrecy,
}

impl SemanticType {
    pub fn from_descriptor_name(name: &str) -> Option<Self> {
        let ty = match name.trim().to_ascii_lowercase().as_str() {
            "text" => SemanticType::Text,
            "custom_text" => SemanticType::CustomText,
            "integer" => SemanticType::Integer,
            "custom_integer" => SemanticType::CustomInteger,
            "decimal" | "money" | "money_real" => SemanticType::Decimal,
            "date" | "brazilian_date" => SemanticType::Date,
            "bool" | "boolean" | "brazilian_bool" => SemanticType::Boolean,
            "cpf" => SemanticType::Cpf,
            "secrecy" => SemanticType::Secrecy,
            _ => return None,
        };
        Some(ty)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::Text => "text",
            SemanticType::CustomText => "custom_text",
            SemanticType::Integer => "integer",
            SemanticType::CustomInteger => "custom_integer",
            SemanticType::Decimal => "decimal",
            SemanticType::Date => "date",
            SemanticType::Boolean => "boolean",
            SemanticType::Cpf => "cpf",
            SemanticType::Secrecy => "secrecy",
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a schema descriptor file.
#[derive(Debug, Clone, Deserialize)]
pub struct DescriptorRow {
    #[serde(default)]
    pub original_name: String,
    pub field_name: String,
    pub internal_field_type: String,
}

/// A source column mapped to an output column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub external_name: String,
    pub output_name: String,
    pub semantic_type: SemanticType,
}

impl SchemaField {
    pub fn new(external_name: &str, output_name: &str, semantic_type: SemanticType) -> Self {
        Self {
            external_name: external_name.to_string(),
            output_name: output_name.to_string(),
            semantic_type,
        }
    }

    pub fn is_secrecy_marker(&self) -> bool {
        self.semantic_type == SemanticType::Secrecy
    }
}

/// A typed cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    Date(NaiveDate),
    Boolean(bool),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Canonical rendering used by the CSV sink: ISO dates, dot decimals, empty nulls.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Text(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// An output column and its type, as seen by sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumn {
    pub name: String,
    pub ty: SemanticType,
}

impl OutputColumn {
    pub fn new(name: &str, ty: SemanticType) -> Self {
        Self { name: name.to_string(), ty }
    }
}

/// A typed output record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedRow {
    values: BTreeMap<String, Value>,
    redacted: Option<bool>,
}

impl NormalizedRow {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// `Some` only for datasets that model secrecy.
    pub fn redacted(&self) -> Option<bool> {
        self.redacted
    }

    pub(crate) fn set_redacted(&mut self, redacted: bool) {
        self.redacted = Some(redacted);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
