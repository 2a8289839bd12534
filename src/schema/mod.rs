// src/schema/mod.rs

use anyhow::{Context, Result};
use std::{collections::HashSet, fs::File, io::Read, path::Path};
use tracing::debug;

pub mod arrow;
pub mod coerce;
pub mod types;

pub use self::arrow::{build_arrow_schema, map_to_arrow_type};
pub use types::{DescriptorRow, NormalizedRow, OutputColumn, SchemaField, SemanticType, Value};

use crate::error::{Drift, PipelineError, RowError};
use crate::process::RawRecord;

/// Source strings meaning "withheld by law" rather than "absent".
pub const SECRECY_SENTINELS: &[&str] = &[
    "Detalhamento das informações bloqueado.",
    "Informações protegidas por sigilo, nos termos da legislação, para garantia da segurança da sociedade e do Estado",
];

/// Field name that marks a secrecy flag even when typed otherwise in old descriptors.
const SECRECY_FIELD_NAME: &str = "em_sigilo";

pub fn is_secrecy_sentinel(value: &str) -> bool {
    SECRECY_SENTINELS.contains(&value.trim())
}

/// Result of a successful [`Schema::deserialize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Deserialized {
    pub row: NormalizedRow,
    pub drift: Drift,
}

/// Ordered external→output column mapping for one dataset kind.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<SchemaField>,
    secrecy: Option<usize>,
}

impl Schema {
    /// Load a descriptor CSV (`original_name,field_name,internal_field_type`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening schema {}", path.display()))?;
        let schema = Self::from_reader(file).with_context(|| format!("loading schema {}", path.display()))?;
        debug!(path = %path.display(), fields = schema.fields.len(), "loaded schema");
        Ok(schema)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut fields = Vec::new();
        for (idx, row) in rdr.deserialize::<DescriptorRow>().enumerate() {
            let row = row.with_context(|| format!("descriptor row {}", idx + 1))?;
            fields.push(Self::field_from_row(&row)?);
        }
        Ok(Self::from_fields(fields)?)
    }

    fn field_from_row(row: &DescriptorRow) -> Result<SchemaField, PipelineError> {
        let ty = if row.field_name == SECRECY_FIELD_NAME && row.original_name.is_empty() {
            SemanticType::Secrecy
        } else {
            SemanticType::from_descriptor_name(&row.internal_field_type).ok_or_else(|| {
                PipelineError::config(format!(
                    "field `{}` has unknown type {:?}",
                    row.field_name, row.internal_field_type
                ))
            })?
        };
        Ok(SchemaField::new(&row.original_name, &row.field_name, ty))
    }

    /// Validate the field list: one secrecy marker at most, and a bijection
    /// between external and output names for everything else.
    pub fn from_fields(fields: Vec<SchemaField>) -> Result<Self, PipelineError> {
        let mut outputs = HashSet::new();
        let mut externals = HashSet::new();
        let mut secrecy = None;
        for (idx, field) in fields.iter().enumerate() {
            if field.output_name.is_empty() {
                return Err(PipelineError::config(format!("field #{} has no output name", idx + 1)));
            }
            if !outputs.insert(field.output_name.as_str()) {
                return Err(PipelineError::config(format!(
                    "duplicate output field `{}`",
                    field.output_name
                )));
            }
            if field.is_secrecy_marker() {
                if secrecy.replace(idx).is_some() {
                    return Err(PipelineError::config("more than one secrecy marker"));
                }
                continue;
            }
            if field.external_name.is_empty() {
                return Err(PipelineError::config(format!(
                    "field `{}` has no source column",
                    field.output_name
                )));
            }
            if !externals.insert(field.external_name.as_str()) {
                return Err(PipelineError::config(format!(
                    "source column {:?} mapped twice",
                    field.external_name
                )));
            }
        }
        Ok(Self { fields, secrecy })
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn secrecy_field(&self) -> Option<&str> {
        self.secrecy.map(|i| self.fields[i].output_name.as_str())
    }

    /// Output columns in descriptor order, secrecy marker included.
    pub fn output_columns(&self) -> Vec<OutputColumn> {
        self.fields
            .iter()
            .map(|f| {
                let ty = if f.is_secrecy_marker() { SemanticType::Boolean } else { f.semantic_type };
                OutputColumn::new(&f.output_name, ty)
            })
            .collect()
    }

    /// Coerce one raw record. Fails on the first field that does not coerce.
    pub fn deserialize(&self, raw: RawRecord) -> Result<Deserialized, RowError> {
        self.deserialize_with(raw, coerce::coerce)
    }

    /// [`Schema::deserialize`] with a caller-supplied coercion function.
    pub fn deserialize_with<F>(&self, mut raw: RawRecord, mut coerce: F) -> Result<Deserialized, RowError>
    where
        F: FnMut(SemanticType, &str) -> Result<Value, String>,
    {
        let mut row = NormalizedRow::default();
        let mut drift = Drift::default();
        let mut redacted = false;

        for field in &self.fields {
            if field.is_secrecy_marker() {
                continue;
            }
            let raw_value = match raw.remove(&field.external_name) {
                Some(v) => v,
                None => {
                    drift.missing.push(field.external_name.clone());
                    String::new()
                }
            };
            if self.secrecy.is_some() && is_secrecy_sentinel(&raw_value) {
                row.insert(field.output_name.clone(), Value::Null);
                redacted = true;
                continue;
            }
            let value = coerce(field.semantic_type, &raw_value).map_err(|reason| RowError {
                field: field.output_name.clone(),
                ty: field.semantic_type,
                raw: raw_value.clone(),
                reason,
            })?;
            row.insert(field.output_name.clone(), value);
        }

        if let Some(marker) = self.secrecy_field() {
            row.insert(marker, Value::Boolean(redacted));
            row.set_redacted(redacted);
        }

        // a trailing delimiter yields an empty, unnamed column
        drift.extra = raw
            .into_iter()
            .filter(|(k, v)| !(k.is_empty() && v.trim().is_empty()))
            .map(|(k, _)| k)
            .collect();
        drift.extra.sort();

        Ok(Deserialized { row, drift })
    }

    /// Render a row back into source formatting, keyed by external names.
    pub fn to_raw(&self, row: &NormalizedRow) -> RawRecord {
        self.fields
            .iter()
            .filter(|f| !f.is_secrecy_marker())
            .map(|f| {
                let raw = match row.get(&f.output_name).unwrap_or(&Value::Null) {
                    Value::Null => String::new(),
                    Value::Text(s) => s.clone(),
                    Value::Integer(i) => i.to_string(),
                    Value::Decimal(d) => d.to_string().replace('.', ","),
                    Value::Date(d) => d.format("%d/%m/%Y").to_string(),
                    Value::Boolean(true) => "SIM".to_string(),
                    Value::Boolean(false) => "NÃO".to_string(),
                };
                (f.external_name.clone(), raw)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    const DESCRIPTOR: &str = "\
original_name,field_name,internal_field_type
Valor (R$),valor,money_real
Data,data,brazilian_date
CPF,cpf,text
Parcela,parcela,custom_integer
Observação,observacao,custom_text
,em_sigilo,bool
";

    fn raw(pairs: &[(&str, &str)]) -> RawRecord {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn schema() -> Schema {
        Schema::from_reader(DESCRIPTOR.as_bytes()).unwrap()
    }

    #[test]
    fn loads_descriptor_with_secrecy_marker() {
        let schema = schema();
        assert_eq!(schema.fields().len(), 6);
        assert_eq!(schema.secrecy_field(), Some("em_sigilo"));
        assert_eq!(schema.fields()[0].semantic_type, SemanticType::Decimal);
        assert_eq!(
            schema.output_columns().last(),
            Some(&OutputColumn::new("em_sigilo", SemanticType::Boolean))
        );
    }

    #[test]
    fn rejects_unknown_types_and_non_bijective_descriptors() {
        let unknown = "original_name,field_name,internal_field_type\nA,a,float128\n";
        assert!(Schema::from_reader(unknown.as_bytes()).is_err());

        let dup_out = "original_name,field_name,internal_field_type\nA,a,text\nB,a,text\n";
        assert!(Schema::from_reader(dup_out.as_bytes()).is_err());

        let dup_ext = "original_name,field_name,internal_field_type\nA,a,text\nA,b,text\n";
        assert!(Schema::from_reader(dup_ext.as_bytes()).is_err());

        let no_source = "original_name,field_name,internal_field_type\n,a,text\n";
        assert!(Schema::from_reader(no_source.as_bytes()).is_err());
    }

    #[test]
    fn end_to_end_nulls_and_passthrough() {
        let schema = Schema::from_fields(vec![
            SchemaField::new("Valor (R$)", "valor", SemanticType::Decimal),
            SchemaField::new("Data", "data", SemanticType::Date),
            SchemaField::new("CPF", "cpf", SemanticType::Text),
        ])
        .unwrap();
        let out = schema
            .deserialize(raw(&[("Valor (R$)", "0,00"), ("Data", ""), ("CPF", "***.***.***-**")]))
            .unwrap();
        assert_eq!(out.row.get("valor"), Some(&Value::Null));
        assert_eq!(out.row.get("data"), Some(&Value::Null));
        assert_eq!(out.row.get("cpf"), Some(&Value::Text("***.***.***-**".into())));
        assert_eq!(out.row.redacted(), None);
        assert!(out.drift.is_empty());
    }

    #[test]
    fn secrecy_sentinel_nulls_field_and_flags_row() {
        let out = schema()
            .deserialize(raw(&[
                ("Valor (R$)", SECRECY_SENTINELS[1]),
                ("Data", "05/03/2020"),
                ("CPF", "x"),
                ("Parcela", "1ª"),
                ("Observação", SECRECY_SENTINELS[0]),
            ]))
            .unwrap();
        assert_eq!(out.row.get("valor"), Some(&Value::Null));
        assert_eq!(out.row.get("observacao"), Some(&Value::Null));
        assert_eq!(out.row.get("em_sigilo"), Some(&Value::Boolean(true)));
        assert_eq!(out.row.redacted(), Some(true));

        let clear = schema()
            .deserialize(raw(&[("Valor (R$)", "1,00"), ("Data", ""), ("CPF", ""), ("Parcela", ""), ("Observação", "")]))
            .unwrap();
        assert_eq!(clear.row.redacted(), Some(false));
    }

    #[test]
    fn drift_is_reported_not_fatal() {
        let out = schema()
            .deserialize(raw(&[
                ("Valor (R$)", "10,00"),
                ("Data", "01/01/2021"),
                ("CPF", "1"),
                ("Coluna Nova", "?"),
                ("", ""),
            ]))
            .unwrap();
        assert_eq!(out.drift.missing, vec!["Parcela".to_string(), "Observação".to_string()]);
        assert_eq!(out.drift.extra, vec!["Coluna Nova".to_string()]);
        // every output field present, missing ones as null
        for f in schema().fields() {
            assert!(out.row.contains(&f.output_name), "{}", f.output_name);
        }
        assert_eq!(out.row.get("parcela"), Some(&Value::Null));
    }

    #[test]
    fn coercion_failure_rejects_whole_row() {
        let err = schema()
            .deserialize(raw(&[("Valor (R$)", "dez reais"), ("Data", "01/01/2021")]))
            .unwrap_err();
        assert_eq!(err.field, "valor");
        assert_eq!(err.ty, SemanticType::Decimal);
        assert_eq!(err.raw, "dez reais");
    }

    #[test]
    fn deserialize_is_idempotent_through_source_format() {
        let schema = schema();
        let first = schema
            .deserialize(raw(&[
                ("Valor (R$)", "1.234,56"),
                ("Data", "05/03/2020"),
                ("CPF", " ***.123.456-** "),
                ("Parcela", "002"),
                ("Observação", "Não há"),
            ]))
            .unwrap()
            .row;
        assert_eq!(first.get("valor"), Some(&Value::Decimal(Decimal::from_str("1234.56").unwrap())));
        assert_eq!(first.get("data"), Some(&Value::Date(NaiveDate::from_ymd_opt(2020, 3, 5).unwrap())));

        let second = schema.deserialize(schema.to_raw(&first)).unwrap();
        assert_eq!(second.row, first);
        assert!(second.drift.is_empty());
    }
}
