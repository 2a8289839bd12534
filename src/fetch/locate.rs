// src/fetch/locate.rs

use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::{fmt, path::PathBuf};
use url::Url;

use crate::error::PipelineError;

const SERVIDORES_BASE_URL: &str =
    "https://portaldatransparencia.gov.br/download-de-dados/servidores";

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[^{}]*\}").expect("placeholder regex should compile"));

static LEADING_PERIOD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{8}|\d{6}|\d{4})").expect("period regex should compile"));

/// Where one instant's archive lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceAddress {
    Url(Url),
    Path(PathBuf),
}

impl ResourceAddress {
    /// `http(s)://…` becomes a URL, anything else a local path.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Url::parse(raw)
                .map(ResourceAddress::Url)
                .map_err(|e| PipelineError::config(format!("invalid URL {:?}: {}", raw, e)))
        } else {
            Ok(ResourceAddress::Path(PathBuf::from(raw)))
        }
    }

    fn last_segment(&self) -> String {
        match self {
            ResourceAddress::Url(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or_default()
                .to_string(),
            ResourceAddress::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        }
    }

    /// File name used when mirroring: the last path segment, always ending in `.zip`.
    pub fn file_name(&self) -> String {
        let segment = self.last_segment();
        let segment = if segment.is_empty() { "download".to_string() } else { segment };
        if segment.to_lowercase().ends_with(".zip") {
            segment
        } else {
            format!("{}.zip", segment)
        }
    }

    /// Publication period in the leading `YYYYMMDD`, `YYYYMM` or `YYYY` of the
    /// last segment. Missing month or day parts are the first one.
    pub fn period(&self) -> Option<NaiveDate> {
        let segment = self.last_segment();
        let digits = LEADING_PERIOD.captures(&segment)?.get(1)?.as_str();
        let year = digits[..4].parse().ok()?;
        let month = digits.get(4..6).map_or(Some(1), |m| m.parse().ok())?;
        let day = digits.get(6..8).map_or(Some(1), |d| d.parse().ok())?;
        NaiveDate::from_ymd_opt(year, month, day)
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAddress::Url(url) => write!(f, "{}", url),
            ResourceAddress::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Substitute zero-padded `{year}`, `{month}` and `{day}`.
pub fn fill_template(template: &str, date: NaiveDate) -> String {
    template
        .replace("{year}", &format!("{:04}", date.year()))
        .replace("{month}", &format!("{:02}", date.month()))
        .replace("{day}", &format!("{:02}", date.day()))
}

/// Dataset-specific address rules. A rule may decline a date, in which case
/// the next rule (and finally the generic template) is tried.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AddressRule {
    /// Historical archive published under a different address before `before`.
    Archive { template: String, before: NaiveDate },
    /// Monthly payroll exports, one archive per `dataset` and month.
    Servidores { dataset: String },
}

impl AddressRule {
    fn apply(&self, date: NaiveDate) -> Option<String> {
        match self {
            AddressRule::Archive { template, before } => {
                (date < *before).then(|| fill_template(template, date))
            }
            AddressRule::Servidores { dataset } => Some(format!(
                "{}/{:04}{:02}_{}",
                SERVIDORES_BASE_URL,
                date.year(),
                date.month(),
                dataset
            )),
        }
    }
}

/// Resolves instants to addresses: rules first, then the template.
#[derive(Debug, Clone)]
pub struct ResourceLocator {
    rules: Vec<AddressRule>,
    template: Option<String>,
}

impl ResourceLocator {
    pub fn new(rules: Vec<AddressRule>, template: Option<String>) -> Result<Self, PipelineError> {
        let templates = rules
            .iter()
            .filter_map(|r| match r {
                AddressRule::Archive { template, .. } => Some(template.as_str()),
                AddressRule::Servidores { .. } => None,
            })
            .chain(template.as_deref());
        for t in templates {
            for m in PLACEHOLDER.find_iter(t) {
                if !matches!(m.as_str(), "{year}" | "{month}" | "{day}") {
                    return Err(PipelineError::config(format!(
                        "unknown placeholder {} in template {:?}",
                        m.as_str(),
                        t
                    )));
                }
            }
        }
        if rules.is_empty() && template.is_none() {
            return Err(PipelineError::config("dataset has neither address rules nor a template"));
        }
        Ok(Self { rules, template })
    }

    pub fn locate(&self, date: NaiveDate) -> Result<ResourceAddress, PipelineError> {
        let raw = self
            .rules
            .iter()
            .find_map(|rule| rule.apply(date))
            .or_else(|| self.template.as_deref().map(|t| fill_template(t, date)))
            .ok_or_else(|| {
                PipelineError::config(format!("no address strategy applies to {}", date))
            })?;
        ResourceAddress::parse(&raw)
    }
}
