// src/sink/mod.rs

use anyhow::{Context, Result};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

pub mod csv;
pub mod parquet;

pub use self::csv::CsvSink;
pub use self::parquet::ParquetSink;

use crate::config::OutputFormat;
use crate::schema::{NormalizedRow, OutputColumn};

/// Consumer of normalized rows. Output appears at its final path only after `finish`.
pub trait Sink {
    fn write_row(&mut self, row: &NormalizedRow) -> Result<()>;

    /// Flush everything and move the file into place. Returns the final path.
    /// On failure the partial file is removed.
    fn finish(self: Box<Self>) -> Result<PathBuf>;

    /// Abandon the output; nothing appears at the final path.
    fn discard(self: Box<Self>) -> Result<()>;
}

/// Open a sink writing `columns` to `path` in `format`.
pub fn open(format: OutputFormat, path: &Path, columns: Vec<OutputColumn>) -> Result<Box<dyn Sink + Send>> {
    Ok(match format {
        OutputFormat::Csv => Box::new(CsvSink::create(path, columns)?),
        OutputFormat::Parquet => Box::new(ParquetSink::create(path, columns)?),
    })
}

/// Sibling path written to until the sink finishes.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn remove_temp(temp: &Path) -> Result<()> {
    match fs::remove_file(temp) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            Err(e).with_context(|| format!("removing {}", temp.display()))
        }
        _ => Ok(()),
    }
}

/// Remove the partial file after a failed finish, keeping the original error.
fn abandon(temp: &Path, err: anyhow::Error) -> anyhow::Error {
    if let Err(cleanup) = remove_temp(temp) {
        tracing::warn!(error = %format!("{:#}", cleanup), "partial output left behind");
    }
    err
}
