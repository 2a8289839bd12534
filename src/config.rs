// src/config.rs

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::{
    env,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tracing::{debug, info};

use crate::dates::{self, Cadence, DateWindow};
use crate::error::PipelineError;
use crate::fetch::{AddressRule, ResourceLocator};
use crate::identity::IdentitySpec;
use crate::normalize::{PostProcess, PostProcessSpec, DEFAULT_CACHE_CAPACITY};
use crate::process::{Encoding, InnerMatch, TextFormat};
use crate::schema::{OutputColumn, Schema, SemanticType};

/// Default end of a dataset's window when none is given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EndDate {
    Relative(RelativeEnd),
    Fixed(NaiveDate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativeEnd {
    Today,
    LastMonth,
}

impl Default for EndDate {
    fn default() -> Self {
        EndDate::Relative(RelativeEnd::Today)
    }
}

impl EndDate {
    pub fn resolve(self) -> NaiveDate {
        match self {
            EndDate::Fixed(date) => date,
            EndDate::Relative(RelativeEnd::Today) => dates::today(),
            EndDate::Relative(RelativeEnd::LastMonth) => dates::last_month(),
        }
    }
}

fn default_delimiter() -> char {
    ';'
}

/// One `datasets.yaml` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    pub cadence: Cadence,
    pub start: NaiveDate,
    #[serde(default)]
    pub end: EndDate,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub rules: Vec<AddressRule>,
    pub inner: InnerMatch,
    #[serde(default)]
    pub nested: Option<InnerMatch>,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    pub schema: PathBuf,
    #[serde(default)]
    pub post_process: Vec<PostProcessSpec>,
    #[serde(default)]
    pub identities: Vec<IdentitySpec>,
}

#[derive(Debug, Deserialize)]
struct CatalogueFile {
    datasets: Vec<DatasetConfig>,
}

/// Every dataset kind the binary knows about.
#[derive(Debug, Clone)]
pub struct Catalogue {
    base_dir: PathBuf,
    datasets: Vec<DatasetConfig>,
}

impl Catalogue {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading dataset catalogue {}", path.display()))?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let catalogue = Self::from_yaml(&text, base_dir)
            .with_context(|| format!("parsing dataset catalogue {}", path.display()))?;
        info!(path = %path.display(), datasets = catalogue.datasets.len(), "loaded catalogue");
        Ok(catalogue)
    }

    /// Relative schema and lookup paths resolve against `base_dir`.
    pub fn from_yaml(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let file: CatalogueFile = serde_yaml::from_str(text)
            .map_err(|e| PipelineError::config(format!("invalid catalogue: {}", e)))?;
        let mut seen = std::collections::HashSet::new();
        for ds in &file.datasets {
            if !seen.insert(ds.name.as_str()) {
                return Err(PipelineError::config(format!("dataset `{}` declared twice", ds.name)).into());
            }
        }
        Ok(Self { base_dir: base_dir.into(), datasets: file.datasets })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.datasets.iter().map(|d| d.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&DatasetConfig> {
        self.datasets.iter().find(|d| d.name == name)
    }

    /// Build the runnable form of `name`, loading its schema and lookups.
    pub fn dataset(&self, name: &str) -> Result<Dataset> {
        let cfg = self.get(name).ok_or_else(|| {
            PipelineError::config(format!(
                "unknown dataset `{}` (known: {})",
                name,
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })?;
        Dataset::from_config(cfg.clone(), &self.base_dir)
    }
}

/// A dataset kind ready to run: the data-driven replacement for one
/// scraper per dataset.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub cadence: Cadence,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub locator: ResourceLocator,
    pub inner: InnerMatch,
    pub nested: Option<InnerMatch>,
    pub format: TextFormat,
    pub schema: Arc<Schema>,
    pub post_process: Vec<PostProcess>,
    pub identities: Vec<IdentitySpec>,
}

impl Dataset {
    pub fn from_config(cfg: DatasetConfig, base_dir: &Path) -> Result<Self> {
        if !cfg.delimiter.is_ascii() {
            bail!(PipelineError::config(format!(
                "dataset `{}`: delimiter {:?} is not a single byte",
                cfg.name, cfg.delimiter
            )));
        }
        let locator = ResourceLocator::new(cfg.rules, cfg.template)
            .with_context(|| format!("dataset `{}`", cfg.name))?;
        let schema = Schema::load(base_dir.join(&cfg.schema))
            .with_context(|| format!("dataset `{}`", cfg.name))?;
        let post_process = cfg
            .post_process
            .into_iter()
            .map(|spec| PostProcess::from_spec(spec, base_dir))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("dataset `{}`", cfg.name))?;
        debug!(dataset = %cfg.name, fields = schema.fields().len(), steps = post_process.len(), "dataset ready");

        Ok(Self {
            name: cfg.name,
            cadence: cfg.cadence,
            start: cfg.start,
            end: cfg.end.resolve(),
            locator,
            inner: cfg.inner,
            nested: cfg.nested,
            format: TextFormat { encoding: cfg.encoding, delimiter: cfg.delimiter as u8 },
            schema: Arc::new(schema),
            post_process,
            identities: cfg.identities,
        })
    }

    /// Schema columns, then columns added by post-processing and identities.
    pub fn output_columns(&self) -> Vec<OutputColumn> {
        let mut cols = self.schema.output_columns();
        let extra = self
            .post_process
            .iter()
            .flat_map(PostProcess::output_columns)
            .chain(
                self.identities
                    .iter()
                    .map(|id| OutputColumn::new(&id.output_field, SemanticType::Text)),
            );
        for col in extra {
            if !cols.iter().any(|c| c.name == col.name) {
                cols.push(col);
            }
        }
        cols
    }

    /// The dataset's window, with either bound optionally overridden.
    pub fn window(&self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<DateWindow, PipelineError> {
        DateWindow::new(start.unwrap_or(self.start), end.unwrap_or(self.end), self.cadence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Parquet,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "parquet" => Ok(OutputFormat::Parquet),
            other => Err(anyhow!("unknown output format {:?}", other)),
        }
    }
}

/// Where archives are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Http,
    Local,
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Source::Http),
            "local" => Ok(Source::Local),
            other => Err(anyhow!("unknown source {:?}", other)),
        }
    }
}

/// Runtime settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub datasets_file: PathBuf,
    pub download_dir: PathBuf,
    pub output_dir: PathBuf,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub concurrency: usize,
    pub output_format: OutputFormat,
    pub source: Source,
    pub download: bool,
    pub cache_capacity: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let date = |key: &str| -> Result<Option<NaiveDate>> {
            var(key)
                .map(|v| {
                    NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d")
                        .with_context(|| format!("{} must be YYYY-MM-DD, got {:?}", key, v))
                })
                .transpose()
        };
        let number = |key: &str, default: usize| -> Result<usize> {
            var(key)
                .map(|v| v.trim().parse().with_context(|| format!("{} must be a number, got {:?}", key, v)))
                .transpose()
                .map(|n| n.unwrap_or(default))
        };

        let concurrency = number("CONCURRENCY", 2)?;
        if concurrency == 0 {
            bail!("CONCURRENCY must be at least 1");
        }
        Ok(Self {
            datasets_file: var("DATASETS_FILE").unwrap_or_else(|| "datasets.yaml".into()).into(),
            download_dir: var("DOWNLOAD_DIR").unwrap_or_else(|| "data/download".into()).into(),
            output_dir: var("OUTPUT_DIR").unwrap_or_else(|| "data/output".into()).into(),
            start: date("START_DATE")?,
            end: date("END_DATE")?,
            concurrency,
            output_format: var("OUTPUT_FORMAT").map_or(Ok(OutputFormat::Csv), |v| v.parse())?,
            source: var("SOURCE").map_or(Ok(Source::Local), |v| v.parse())?,
            download: var("DOWNLOAD").is_some_and(|v| v.trim() == "1"),
            cache_capacity: number("CACHE_CAPACITY", DEFAULT_CACHE_CAPACITY)?,
        })
    }
}
