// src/normalize/mod.rs

use chrono::NaiveDate;
use std::{collections::HashSet, sync::Arc};
use tracing::{trace, warn};

pub mod cache;
pub mod description;
pub mod postprocess;

pub use cache::LruCache;
pub use description::{parse_description, ItemDescription};
pub use postprocess::{PostProcess, PostProcessSpec};

use crate::error::RowError;
use crate::process::RawRecord;
use crate::schema::{coerce, Deserialized, Schema, SemanticType, Value};

/// Where a record was read from. Post-processing steps may copy parts of it
/// into the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowOrigin {
    /// Cadence instant being converted.
    pub instant: NaiveDate,
    /// Publication date encoded in the archive address.
    pub period: Option<NaiveDate>,
    /// Archive holding the payload: the nested entry name, else the address file name.
    pub container: String,
}

/// Cache capacity used when none is configured.
pub const DEFAULT_CACHE_CAPACITY: usize = 65_536;

/// Turns raw records into typed rows for one dataset.
///
/// Owns a bounded LRU cache of parsed dates, decimals and integers keyed by
/// `(type, raw text)`. Exports repeat the same few hundred dates and amounts
/// across millions of rows.
pub struct RowNormalizer {
    schema: Arc<Schema>,
    steps: Vec<PostProcess>,
    cache: LruCache<(SemanticType, String), Value>,
    reported: HashSet<(bool, String)>,
}

impl RowNormalizer {
    pub fn new(schema: Arc<Schema>, cache_capacity: usize) -> Self {
        Self {
            schema,
            steps: Vec::new(),
            cache: LruCache::new(cache_capacity),
            reported: HashSet::new(),
        }
    }

    pub fn with_steps(mut self, steps: Vec<PostProcess>) -> Self {
        self.steps = steps;
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Deserialize one record and run the post-processing steps over it.
    pub fn normalize(&mut self, raw: RawRecord, origin: &RowOrigin) -> Result<Deserialized, RowError> {
        let cache = &mut self.cache;
        let mut out = self.schema.deserialize_with(raw, |ty, raw| cached_coerce(cache, ty, raw))?;
        for step in &self.steps {
            step.apply(&mut out.row, origin);
        }
        self.report_drift(&out);
        Ok(out)
    }

    fn report_drift(&mut self, out: &Deserialized) {
        for (extra, column) in out
            .drift
            .missing
            .iter()
            .map(|c| (false, c))
            .chain(out.drift.extra.iter().map(|c| (true, c)))
        {
            let kind = if extra { "unexpected" } else { "missing" };
            if self.reported.insert((extra, column.clone())) {
                warn!(column = %column, kind, "schema drift");
            } else {
                trace!(column = %column, kind, "schema drift");
            }
        }
    }

    /// `(hits, misses)` of the coercion cache.
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }
}

fn cached_coerce(
    cache: &mut LruCache<(SemanticType, String), Value>,
    ty: SemanticType,
    raw: &str,
) -> Result<Value, String> {
    let cacheable = matches!(
        ty,
        SemanticType::Date | SemanticType::Decimal | SemanticType::Integer | SemanticType::CustomInteger
    );
    if !cacheable {
        return coerce::coerce(ty, raw);
    }
    let key = (ty, raw.trim().to_string());
    if let Some(hit) = cache.get(&key) {
        return Ok(hit);
    }
    let value = coerce::coerce(ty, raw)?;
    cache.insert(key, value.clone());
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaField;

    fn normalizer(capacity: usize) -> RowNormalizer {
        let schema = Schema::from_fields(vec![
            SchemaField::new("Data", "data", SemanticType::Date),
            SchemaField::new("Valor", "valor", SemanticType::Decimal),
            SchemaField::new("Nome", "nome", SemanticType::Text),
        ])
        .unwrap();
        RowNormalizer::new(Arc::new(schema), capacity)
    }

    fn raw(pairs: &[(&str, &str)]) -> RawRecord {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn origin() -> RowOrigin {
        RowOrigin {
            instant: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            period: None,
            container: "202001_Servidores_SIAPE.zip".into(),
        }
    }

    #[test]
    fn repeated_values_hit_the_cache() {
        let mut n = normalizer(16);
        for name in ["A", "B", "C"] {
            n.normalize(raw(&[("Data", "01/02/2020"), ("Valor", "1,00"), ("Nome", name)]), &origin())
                .unwrap();
        }
        // text is never cached
        assert_eq!(n.cache_stats(), (4, 2));
    }

    #[test]
    fn failures_are_not_cached() {
        let mut n = normalizer(16);
        for _ in 0..2 {
            let err = n
                .normalize(raw(&[("Data", "32/01/2020"), ("Valor", "1"), ("Nome", "")]), &origin())
                .unwrap_err();
            assert_eq!(err.field, "data");
        }
        assert_eq!(n.cache_stats(), (0, 2));
    }

    #[test]
    fn cached_and_uncached_results_agree() {
        let mut cached = normalizer(1);
        let mut uncached = normalizer(0);
        for (d, v) in [("01/01/2020", "1,00"), ("02/01/2020", "2,50"), ("01/01/2020", "1,00")] {
            let r = raw(&[("Data", d), ("Valor", v), ("Nome", "X")]);
            assert_eq!(
                cached.normalize(r.clone(), &origin()).unwrap(),
                uncached.normalize(r, &origin()).unwrap()
            );
        }
    }

    #[test]
    fn steps_run_after_deserialize() {
        let mut n = normalizer(0).with_steps(vec![
            PostProcess::ReferencePeriod { year_field: "ano".into(), month_field: "mes".into() },
            PostProcess::OriginSystem { field: "sistema_origem".into() },
        ]);
        let out = n
            .normalize(raw(&[("Data", ""), ("Valor", ""), ("Nome", "X"), ("Extra", "1")]), &origin())
            .unwrap();
        assert_eq!(out.row.get("ano"), Some(&Value::Integer(2020)));
        assert_eq!(out.row.get("sistema_origem"), Some(&Value::Text("SIAPE".into())));
        assert_eq!(out.drift.extra, vec!["Extra".to_string()]);
    }
}
