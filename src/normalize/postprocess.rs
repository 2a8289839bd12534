// src/normalize/postprocess.rs

use anyhow::{Context, Result};
use chrono::Datelike;
use serde::Deserialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::debug;

use super::{description::parse_description, RowOrigin};
use crate::schema::{NormalizedRow, OutputColumn, SemanticType, Value};

const MATERIAL_ELEMENT: &str = "MATERIAL DE CONSUMO";
const MINOR_PENSIONER: &str = "PENSIONISTA MENOR DE 16 ANOS";

/// Catalogue form of a post-processing step.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostProcessSpec {
    ItemDescription {
        description_field: String,
        element_field: String,
    },
    MinorPensioner {
        tax_id_field: String,
        flag_field: String,
    },
    ReferencePeriod {
        year_field: String,
        month_field: String,
    },
    MunicipalityNames {
        code_field: String,
        name_field: String,
        lookup: PathBuf,
    },
    Period {
        field: String,
    },
    OriginSystem {
        field: String,
    },
}

/// A dataset-specific fix-up applied to each normalized row, in catalogue order.
#[derive(Debug, Clone)]
pub enum PostProcess {
    ItemDescription {
        description_field: String,
        element_field: String,
    },
    MinorPensioner {
        tax_id_field: String,
        flag_field: String,
    },
    ReferencePeriod {
        year_field: String,
        month_field: String,
    },
    MunicipalityNames {
        code_field: String,
        name_field: String,
        names: Arc<HashMap<String, String>>,
    },
    /// Publication date from the archive address (`YYYYMM` is the first of the month).
    Period { field: String },
    /// Trailing `_`-separated part of the container name,
    /// `202001_Pensionistas_DEFESA.zip` gives `DEFESA`.
    OriginSystem { field: String },
}

/// Output columns added by the item description step, in output order.
pub const ITEM_COLUMNS: [&str; 7] = [
    "quantidade",
    "unidade",
    "item",
    "marca",
    "item_processo",
    "item_material",
    "descricao_restante",
];

impl PostProcess {
    /// Build a step; relative lookup paths resolve against `base_dir`.
    pub fn from_spec(spec: PostProcessSpec, base_dir: &Path) -> Result<Self> {
        Ok(match spec {
            PostProcessSpec::ItemDescription { description_field, element_field } => {
                PostProcess::ItemDescription { description_field, element_field }
            }
            PostProcessSpec::MinorPensioner { tax_id_field, flag_field } => {
                PostProcess::MinorPensioner { tax_id_field, flag_field }
            }
            PostProcessSpec::ReferencePeriod { year_field, month_field } => {
                PostProcess::ReferencePeriod { year_field, month_field }
            }
            PostProcessSpec::MunicipalityNames { code_field, name_field, lookup } => {
                let path = base_dir.join(lookup);
                let file = std::fs::File::open(&path)
                    .with_context(|| format!("opening municipality lookup {}", path.display()))?;
                let names = load_municipalities(file)
                    .with_context(|| format!("reading municipality lookup {}", path.display()))?;
                debug!(path = %path.display(), entries = names.len(), "loaded municipality names");
                PostProcess::MunicipalityNames { code_field, name_field, names: Arc::new(names) }
            }
            PostProcessSpec::Period { field } => PostProcess::Period { field },
            PostProcessSpec::OriginSystem { field } => PostProcess::OriginSystem { field },
        })
    }

    /// Columns this step adds to the output.
    pub fn output_columns(&self) -> Vec<OutputColumn> {
        match self {
            PostProcess::ItemDescription { .. } => ITEM_COLUMNS
                .iter()
                .map(|name| {
                    let ty = if *name == "quantidade" { SemanticType::Decimal } else { SemanticType::Text };
                    OutputColumn::new(name, ty)
                })
                .collect(),
            PostProcess::MinorPensioner { flag_field, .. } => {
                vec![OutputColumn::new(flag_field, SemanticType::Boolean)]
            }
            PostProcess::ReferencePeriod { year_field, month_field } => vec![
                OutputColumn::new(year_field, SemanticType::Integer),
                OutputColumn::new(month_field, SemanticType::Integer),
            ],
            PostProcess::MunicipalityNames { .. } => Vec::new(),
            PostProcess::Period { field } => vec![OutputColumn::new(field, SemanticType::Date)],
            PostProcess::OriginSystem { field } => vec![OutputColumn::new(field, SemanticType::Text)],
        }
    }

    pub fn apply(&self, row: &mut NormalizedRow, origin: &RowOrigin) {
        match self {
            PostProcess::ItemDescription { description_field, element_field } => {
                let is_material = row.get(element_field).and_then(Value::as_text) == Some(MATERIAL_ELEMENT);
                let parsed = match row.get(description_field).and_then(Value::as_text) {
                    Some(text) if is_material => parse_description(text),
                    _ => Default::default(),
                };
                let text = |s: String| if s.is_empty() { Value::Null } else { Value::Text(s) };
                row.insert("quantidade", parsed.quantity.map_or(Value::Null, Value::Decimal));
                row.insert("unidade", text(parsed.unit));
                row.insert("item", text(parsed.item));
                row.insert("marca", text(parsed.brand));
                row.insert("item_processo", text(parsed.process_item));
                row.insert("item_material", text(parsed.material_item));
                row.insert("descricao_restante", text(parsed.remaining));
            }
            PostProcess::MinorPensioner { tax_id_field, flag_field } => {
                let minor = row
                    .get(tax_id_field)
                    .and_then(Value::as_text)
                    .is_some_and(|v| v.contains(MINOR_PENSIONER));
                if minor {
                    row.insert(tax_id_field.as_str(), Value::Null);
                }
                row.insert(flag_field.as_str(), Value::Boolean(minor));
            }
            PostProcess::ReferencePeriod { year_field, month_field } => {
                if row.get(year_field).map_or(true, Value::is_null) {
                    row.insert(year_field.as_str(), Value::Integer(origin.instant.year().into()));
                }
                if row.get(month_field).map_or(true, Value::is_null) {
                    row.insert(month_field.as_str(), Value::Integer(origin.instant.month().into()));
                }
            }
            PostProcess::MunicipalityNames { code_field, name_field, names } => {
                let code = match row.get(code_field) {
                    Some(Value::Null) | None => return,
                    Some(v) => v.to_string(),
                };
                if let Some(name) = names.get(&code) {
                    row.insert(name_field.as_str(), Value::Text(name.clone()));
                }
            }
            PostProcess::Period { field } => {
                row.insert(field.as_str(), origin.period.map_or(Value::Null, Value::Date));
            }
            PostProcess::OriginSystem { field } => {
                let system = origin_system(&origin.container);
                let value = if system.is_empty() { Value::Null } else { Value::Text(system.to_string()) };
                row.insert(field.as_str(), value);
            }
        }
    }
}

/// Last `_` part of an archive name, ignoring directories and the `.zip` suffix.
pub fn origin_system(container: &str) -> &str {
    let name = container.rsplit(['/', '\\']).next().unwrap_or(container);
    let stem = match name.len().checked_sub(4) {
        Some(cut) if name.is_char_boundary(cut) && name[cut..].eq_ignore_ascii_case(".zip") => &name[..cut],
        _ => name,
    };
    stem.rsplit('_').next().unwrap_or(stem)
}

#[derive(Deserialize)]
struct MunicipalityRow {
    city_ibge_code: String,
    city: String,
}

fn load_municipalities<R: std::io::Read>(reader: R) -> Result<HashMap<String, String>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut names = HashMap::new();
    for row in rdr.deserialize::<MunicipalityRow>() {
        let row = row?;
        names.insert(row.city_ibge_code, row.city);
    }
    Ok(names)
}
