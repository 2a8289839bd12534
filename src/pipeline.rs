// src/pipeline.rs

use chrono::NaiveDate;
use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    io::Cursor,
};
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::config::Dataset;
use crate::dates::{CadenceIter, DateWindow};
use crate::error::{DropReason, PipelineError};
use crate::fetch::{Fetch, ResourceAddress};
use crate::normalize::{RowNormalizer, RowOrigin, DEFAULT_CACHE_CAPACITY};
use crate::process::{self, RawRows};
use crate::schema::NormalizedRow;

type MemoryArchive = ZipArchive<Cursor<Vec<u8>>>;

/// Counters for one run. Every row that does not come out is counted here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub rows_produced: u64,
    pub rows_dropped: BTreeMap<DropReason, u64>,
    pub instants_visited: u64,
    pub instants_skipped: u64,
    /// Archive (or nested archive) opened but no entry matched.
    pub containers_empty: u64,
    /// Archive (or nested archive) that could not be read to the end.
    pub containers_failed: u64,
    /// Instants that resolved to the previous instant's address.
    pub duplicate_addresses: u64,
    pub rows_missing_columns: u64,
    pub rows_extra_columns: u64,
}

impl RunStats {
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.rows_dropped.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_dropped(&self) -> u64 {
        self.rows_dropped.values().sum()
    }

    fn drop_row(&mut self, reason: DropReason) {
        *self.rows_dropped.entry(reason).or_default() += 1;
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rows produced, {} dropped (coercion {}, malformed {}), {}/{} instants skipped, {} containers without payload, {} failed, {} rows with missing columns, {} with extra columns",
            self.rows_produced,
            self.total_dropped(),
            self.dropped(DropReason::Coercion),
            self.dropped(DropReason::Malformed),
            self.instants_skipped,
            self.instants_visited,
            self.containers_empty,
            self.containers_failed,
            self.rows_missing_columns,
            self.rows_extra_columns,
        )
    }
}

/// Every distinct address a run over `window` would request, in order.
pub fn addresses(dataset: &Dataset, window: &DateWindow) -> Result<Vec<ResourceAddress>, PipelineError> {
    let mut out: Vec<ResourceAddress> = Vec::new();
    for instant in window.dates() {
        let address = dataset.locator.locate(instant)?;
        if out.last() != Some(&address) {
            out.push(address);
        }
    }
    Ok(out)
}

/// Outer archive whose nested archives are still to be read.
struct Bundle {
    origin: RowOrigin,
    archive: MemoryArchive,
    pending: VecDeque<usize>,
}

/// Lazy, single-pass sequence of normalized rows for one dataset and window.
///
/// Yields `Err` only for fatal errors, and only once; the sequence ends after it.
pub struct Pipeline<'a, F: Fetch + ?Sized> {
    dataset: &'a Dataset,
    fetcher: &'a F,
    dates: CadenceIter,
    normalizer: RowNormalizer,
    current: Option<(RowOrigin, RawRows)>,
    bundle: Option<Bundle>,
    last_address: Option<ResourceAddress>,
    stats: RunStats,
    finished: bool,
}

/// Start a run. Nothing is fetched until the first row is requested.
pub fn run<'a, F: Fetch + ?Sized>(dataset: &'a Dataset, window: DateWindow, fetcher: &'a F) -> Pipeline<'a, F> {
    Pipeline {
        dataset,
        fetcher,
        dates: window.dates(),
        normalizer: RowNormalizer::new(dataset.schema.clone(), DEFAULT_CACHE_CAPACITY)
            .with_steps(dataset.post_process.clone()),
        current: None,
        bundle: None,
        last_address: None,
        stats: RunStats::default(),
        finished: false,
    }
}

impl<'a, F: Fetch + ?Sized> Pipeline<'a, F> {
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.normalizer = RowNormalizer::new(self.dataset.schema.clone(), capacity)
            .with_steps(self.dataset.post_process.clone());
        self
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn into_stats(self) -> RunStats {
        self.stats
    }

    /// Move to the next container: the next nested archive of the open bundle,
    /// else the next instant. `Ok(false)` once the window is exhausted.
    fn advance(&mut self) -> Result<bool, PipelineError> {
        if let Some(bundle) = self.bundle.as_mut() {
            if let Some(index) = bundle.pending.pop_front() {
                let origin = bundle.origin.clone();
                let ds = self.dataset;
                let opened = process::open_nested(&mut bundle.archive, index)
                    .and_then(|(name, nested)| Ok((name, process::extract_rows(nested, &ds.inner, ds.format)?)));
                match opened {
                    Ok((container, rows)) => self.start_container(RowOrigin { container, ..origin }, rows),
                    Err(err) => self.container_failed(&origin, err),
                }
                return Ok(true);
            }
            self.bundle = None;
        }

        let Some(instant) = self.dates.next() else {
            return Ok(false);
        };
        self.stats.instants_visited += 1;
        self.open_instant(instant)?;
        Ok(true)
    }

    /// Resolve, fetch and open one instant. Duplicate, unavailable and empty
    /// instants leave nothing to read; only configuration errors fail.
    #[tracing::instrument(level = "debug", skip(self), fields(dataset = %self.dataset.name))]
    fn open_instant(&mut self, instant: NaiveDate) -> Result<(), PipelineError> {
        let address = self.dataset.locator.locate(instant)?;
        if self.last_address.as_ref() == Some(&address) {
            self.stats.duplicate_addresses += 1;
            return Ok(());
        }
        self.last_address = Some(address.clone());

        let mut archive = match self.open_archive(&address) {
            Ok(archive) => archive,
            Err(err) => {
                let err = PipelineError::ResourceUnavailable {
                    address: address.to_string(),
                    reason: format!("{:#}", err),
                };
                warn!(error = %err, "skipping instant");
                self.stats.instants_skipped += 1;
                return Ok(());
            }
        };
        let origin = RowOrigin { instant, period: address.period(), container: address.file_name() };

        let ds = self.dataset;
        match &ds.nested {
            None => match process::extract_rows(archive, &ds.inner, ds.format) {
                Ok(rows) => self.start_container(origin, rows),
                Err(err) => self.container_failed(&origin, err),
            },
            Some(nested) => match process::find_entries(&mut archive, nested) {
                Ok(pending) if pending.is_empty() => {
                    info!(%address, "no nested archive matched");
                    self.stats.containers_empty += 1;
                }
                Ok(pending) => {
                    debug!(%address, nested = pending.len(), "opening bundle");
                    self.bundle = Some(Bundle { origin, archive, pending: pending.into() });
                }
                Err(err) => self.container_failed(&origin, err),
            },
        }
        Ok(())
    }

    fn open_archive(&self, address: &ResourceAddress) -> anyhow::Result<MemoryArchive> {
        let bytes = self.fetcher.fetch(address)?;
        Ok(ZipArchive::new(Cursor::new(bytes))?)
    }

    fn start_container(&mut self, origin: RowOrigin, rows: RawRows) {
        if rows.entry().is_none() {
            info!(container = %origin.container, "no matching entry in archive");
            self.stats.containers_empty += 1;
            return;
        }
        debug!(container = %origin.container, entry = rows.entry().unwrap_or_default(), "reading");
        self.current = Some((origin, rows));
    }

    fn container_failed(&mut self, origin: &RowOrigin, err: anyhow::Error) {
        warn!(container = %origin.container, error = %format!("{:#}", err), "skipping container");
        self.stats.containers_failed += 1;
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.current = None;
            self.bundle = None;
            let (hits, misses) = self.normalizer.cache_stats();
            info!(dataset = %self.dataset.name, cache_hits = hits, cache_misses = misses, "run finished: {}", self.stats);
        }
    }
}

impl<'a, F: Fetch + ?Sized> Iterator for Pipeline<'a, F> {
    type Item = Result<NormalizedRow, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }

            let Some((origin, rows)) = self.current.as_mut() else {
                match self.advance() {
                    Ok(true) => continue,
                    Ok(false) => {
                        self.finish();
                        return None;
                    }
                    Err(err) => {
                        self.finish();
                        return Some(Err(err));
                    }
                }
            };

            match rows.next() {
                Some(Ok(raw)) => match self.normalizer.normalize(raw, origin) {
                    Ok(out) => {
                        if !out.drift.missing.is_empty() {
                            self.stats.rows_missing_columns += 1;
                        }
                        if !out.drift.extra.is_empty() {
                            self.stats.rows_extra_columns += 1;
                        }
                        let mut row = out.row;
                        let dataset = self.dataset;
                        for spec in &dataset.identities {
                            if let Err(err) = spec.apply(&mut row) {
                                self.finish();
                                return Some(Err(err));
                            }
                        }
                        self.stats.rows_produced += 1;
                        return Some(Ok(row));
                    }
                    Err(err) => {
                        debug!(field = %err.field, ty = %err.ty, raw = %err.raw, reason = %err.reason, "row dropped");
                        self.stats.drop_row(DropReason::Coercion);
                    }
                },
                Some(Err(err)) if err.is_io_error() => {
                    warn!(container = %origin.container, error = %err, "payload truncated");
                    self.stats.containers_failed += 1;
                    self.current = None;
                }
                Some(Err(err)) => {
                    debug!(error = %err, "malformed line dropped");
                    self.stats.drop_row(DropReason::Malformed);
                }
                None => self.current = None,
            }
        }
    }
}
