use anyhow::{Context, Result};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};
use tracing::debug;

use super::{abandon, remove_temp, temp_path, Sink};
use crate::schema::{NormalizedRow, OutputColumn};

/// Comma-separated output: ISO dates, dot decimals, empty nulls.
pub struct CsvSink {
    writer: csv::Writer<File>,
    columns: Vec<OutputColumn>,
    temp: PathBuf,
    path: PathBuf,
    rows: u64,
}

impl CsvSink {
    pub fn create(path: &Path, columns: Vec<OutputColumn>) -> Result<Self> {
        let temp = temp_path(path);
        let mut writer = csv::Writer::from_path(&temp)
            .with_context(|| format!("creating {}", temp.display()))?;
        writer
            .write_record(columns.iter().map(|c| c.name.as_str()))
            .context("writing CSV header")?;
        Ok(Self { writer, columns, temp, path: path.to_path_buf(), rows: 0 })
    }
}

impl Sink for CsvSink {
    fn write_row(&mut self, row: &NormalizedRow) -> Result<()> {
        let record: Vec<String> = self
            .columns
            .iter()
            .map(|c| row.get(&c.name).map(ToString::to_string).unwrap_or_default())
            .collect();
        self.writer.write_record(&record).context("writing CSV row")?;
        self.rows += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<PathBuf> {
        let moved = self
            .writer
            .flush()
            .context("flushing CSV")
            .and_then(|()| {
                fs::rename(&self.temp, &self.path)
                    .with_context(|| format!("renaming {} → {}", self.temp.display(), self.path.display()))
            });
        if let Err(e) = moved {
            return Err(abandon(&self.temp, e));
        }
        debug!(path = %self.path.display(), rows = self.rows, "csv written");
        Ok(self.path)
    }

    fn discard(self: Box<Self>) -> Result<()> {
        let CsvSink { writer, temp, rows, .. } = *self;
        drop(writer);
        debug!(path = %temp.display(), rows, "csv discarded");
        remove_temp(&temp)
    }
}
