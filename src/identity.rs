//! Deterministic person identities.
//!
//! An identity is a UUIDv5 in the URL namespace over
//! `https://id.brasil.io/person/v1/<cpf[3..9]>-<SLUG>/`, so two records share
//! an identity exactly when they share the published middle digits of the
//! tax id and the slug of the name.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::schema::{coerce::normalize_cpf, NormalizedRow, Value};

/// Stands in for a missing tax id.
pub const PLACEHOLDER_TAX_ID: &str = "***********";
const KEY_PREFIX: &str = "https://id.brasil.io/person/v1/";

static NON_SLUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9_]+").expect("static regex"));
static UNDERSCORES: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PersonIdentity(Uuid);

impl fmt::Display for PersonIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// `"José da Silva"` → `"jose_da_silva"`.
pub fn slug(text: &str) -> String {
    let ascii: String = text.nfkd().filter(char::is_ascii).collect::<String>().to_lowercase();
    let replaced = NON_SLUG.replace_all(&ascii, "_");
    UNDERSCORES.replace_all(&replaced, "_").trim_matches('_').to_string()
}

/// Derive the identity of `(tax_id, name)`.
///
/// `tax_id` must have eleven digit-or-`*` characters once `.`, `-` and
/// whitespace are removed; anything else means the export changed shape and
/// is reported as [`PipelineError::IdentityPrecondition`].
pub fn assign(tax_id: Option<&str>, name: &str) -> Result<PersonIdentity, PipelineError> {
    let tax_id = match tax_id {
        None => PLACEHOLDER_TAX_ID.to_string(),
        Some(raw) => normalize_cpf(raw).ok_or_else(|| PipelineError::IdentityPrecondition {
            field: "tax_id".to_string(),
            value: raw.to_string(),
        })?,
    };
    let key = format!(
        "{}{}-{}/",
        KEY_PREFIX,
        &tax_id[3..9],
        slug(name).to_uppercase().replace('_', "-")
    );
    Ok(PersonIdentity(Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())))
}

/// Which row fields feed an identity and where it is written.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySpec {
    pub tax_id_field: String,
    pub name_field: String,
    pub output_field: String,
}

impl IdentitySpec {
    /// Append the identity to `row`. A null name slugs to the empty string.
    pub fn apply(&self, row: &mut NormalizedRow) -> Result<(), PipelineError> {
        let tax_id = match row.get(&self.tax_id_field) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.to_string()),
        };
        let name = row.get(&self.name_field).map(Value::to_string).unwrap_or_default();
        let identity = assign(tax_id.as_deref(), &name).map_err(|err| match err {
            PipelineError::IdentityPrecondition { value, .. } => PipelineError::IdentityPrecondition {
                field: self.tax_id_field.clone(),
                value,
            },
            other => other,
        })?;
        row.insert(self.output_field.as_str(), Value::Text(identity.to_string()));
        Ok(())
    }
}
