// src/schema/arrow.rs

use arrow::datatypes::{DataType, Field as ArrowField, Schema as ArrowSchema};
use std::sync::Arc;

use super::types::{OutputColumn, SemanticType};

/// Precision and scale used for every decimal column.
pub const DECIMAL_PRECISION: u8 = 38;
pub const DECIMAL_SCALE: i8 = 4;

/// Map a semantic type onto the Arrow type written to Parquet.
///
/// - text, custom_text, cpf → Utf8
/// - integer, custom_integer → Int64
/// - decimal                 → Decimal128(38, 4)
/// - date                    → Date32
/// - boolean, secrecy        → Boolean
pub fn map_to_arrow_type(ty: SemanticType) -> DataType {
    match ty {
        SemanticType::Text | SemanticType::CustomText | SemanticType::Cpf => DataType::Utf8,
        SemanticType::Integer | SemanticType::CustomInteger => DataType::Int64,
        SemanticType::Decimal => DataType::Decimal128(DECIMAL_PRECISION, DECIMAL_SCALE),
        SemanticType::Date => DataType::Date32,
        SemanticType::Boolean | SemanticType::Secrecy => DataType::Boolean,
    }
}

/// Build an ArrowSchema (inside an Arc) from the output columns. All nullable.
pub fn build_arrow_schema(cols: &[OutputColumn]) -> Arc<ArrowSchema> {
    let fields: Vec<ArrowField> = cols
        .iter()
        .map(|col| ArrowField::new(&col.name, map_to_arrow_type(col.ty), true))
        .collect();

    Arc::new(ArrowSchema::new(fields))
}
