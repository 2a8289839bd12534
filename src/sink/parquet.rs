// src/sink/parquet.rs

use anyhow::{bail, Context, Result};
use arrow::array::{ArrayRef, BooleanArray, Date32Array, Decimal128Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;
use chrono::Datelike;
use parquet::arrow::ArrowWriter;
use parquet::basic::{BrotliLevel, Compression};
use parquet::file::properties::WriterProperties;
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::debug;

use super::{abandon, remove_temp, temp_path, Sink};
use crate::schema::arrow::{DECIMAL_PRECISION, DECIMAL_SCALE};
use crate::schema::{build_arrow_schema, NormalizedRow, OutputColumn, Value};

/// Rows buffered before a record batch is written.
const BATCH_ROWS: usize = 65_536;

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_FROM_CE: i32 = 719_163;

/// Typed Parquet output, one row group per buffered batch.
pub struct ParquetSink {
    writer: ArrowWriter<File>,
    schema: Arc<ArrowSchema>,
    columns: Vec<OutputColumn>,
    buffer: Vec<NormalizedRow>,
    temp: PathBuf,
    path: PathBuf,
    rows: u64,
}

impl ParquetSink {
    pub fn create(path: &Path, columns: Vec<OutputColumn>) -> Result<Self> {
        let schema = build_arrow_schema(&columns);
        let temp = temp_path(path);
        let file = File::create(&temp).with_context(|| format!("creating {}", temp.display()))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::BROTLI(BrotliLevel::try_new(5)?))
            .set_dictionary_enabled(true)
            .build();
        let writer = ArrowWriter::try_new(file, schema.clone(), Some(props)).context("opening parquet writer")?;
        Ok(Self {
            writer,
            schema,
            columns,
            buffer: Vec::with_capacity(BATCH_ROWS),
            temp,
            path: path.to_path_buf(),
            rows: 0,
        })
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let arrays = self
            .columns
            .iter()
            .zip(self.schema.fields())
            .map(|(col, field)| column_array(&col.name, field.data_type(), &self.buffer))
            .collect::<Result<Vec<_>>>()?;
        let batch = RecordBatch::try_new(self.schema.clone(), arrays).context("assembling record batch")?;
        self.writer.write(&batch).context("writing record batch")?;
        debug!(rows = batch.num_rows(), "wrote batch");
        self.buffer.clear();
        Ok(())
    }
}

fn column_array(name: &str, ty: &DataType, rows: &[NormalizedRow]) -> Result<ArrayRef> {
    let values = rows.iter().map(|r| r.get(name).unwrap_or(&Value::Null));
    let mismatch = |v: &Value| anyhow::anyhow!("column `{}` ({}) cannot hold {:?}", name, ty, v);
    Ok(match ty {
        DataType::Utf8 => Arc::new(
            values
                .map(|v| (!v.is_null()).then(|| v.to_string()))
                .collect::<StringArray>(),
        ),
        DataType::Int64 => Arc::new(Int64Array::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Integer(i) => Ok(Some(*i)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        DataType::Decimal128(_, _) => Arc::new(
            Decimal128Array::from(
                values
                    .map(|v| match v {
                        Value::Null => Ok(None),
                        Value::Decimal(d) => {
                            let mut d = d.round_dp(DECIMAL_SCALE as u32);
                            d.rescale(DECIMAL_SCALE as u32);
                            Ok(Some(d.mantissa()))
                        }
                        other => Err(mismatch(other)),
                    })
                    .collect::<Result<Vec<_>>>()?,
            )
            .with_precision_and_scale(DECIMAL_PRECISION, DECIMAL_SCALE)?,
        ),
        DataType::Date32 => Arc::new(Date32Array::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Date(d) => Ok(Some(d.num_days_from_ce() - UNIX_EPOCH_FROM_CE)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        DataType::Boolean => Arc::new(BooleanArray::from(
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Boolean(b) => Ok(Some(*b)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        other => bail!("unsupported arrow type {} for `{}`", other, name),
    })
}

impl Sink for ParquetSink {
    fn write_row(&mut self, row: &NormalizedRow) -> Result<()> {
        self.buffer.push(row.clone());
        self.rows += 1;
        if self.buffer.len() >= BATCH_ROWS {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<PathBuf> {
        if let Err(e) = self.flush_batch() {
            return Err(abandon(&self.temp, e));
        }
        let ParquetSink { writer, temp, path, rows, .. } = *self;
        let moved = writer.close().context("closing parquet writer").and_then(|_| {
            fs::rename(&temp, &path).with_context(|| format!("renaming {} → {}", temp.display(), path.display()))
        });
        if let Err(e) = moved {
            return Err(abandon(&temp, e));
        }
        debug!(path = %path.display(), rows, "parquet written");
        Ok(path)
    }

    fn discard(self: Box<Self>) -> Result<()> {
        let ParquetSink { writer, temp, rows, .. } = *self;
        drop(writer);
        debug!(path = %temp.display(), rows, "parquet discarded");
        remove_temp(&temp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SemanticType;
    use chrono::NaiveDate;
    use arrow::array::Array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use rust_decimal::Decimal;

    #[test]
    fn writes_typed_columns() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pagamento.parquet");
        let columns = vec![
            OutputColumn::new("data", SemanticType::Date),
            OutputColumn::new("valor", SemanticType::Decimal),
            OutputColumn::new("parcela", SemanticType::Integer),
            OutputColumn::new("em_sigilo", SemanticType::Boolean),
            OutputColumn::new("nome", SemanticType::Text),
        ];
        let mut sink: Box<dyn Sink> = Box::new(ParquetSink::create(&path, columns)?);
        for i in 0..3 {
            let mut row = NormalizedRow::default();
            row.insert("data", Value::Date(NaiveDate::from_ymd_opt(1970, 1, 2 + i).unwrap()));
            row.insert("valor", Value::Decimal(Decimal::new(123456, 2)));
            row.insert("parcela", if i == 0 { Value::Null } else { Value::Integer(i as i64) });
            row.insert("em_sigilo", Value::Boolean(false));
            row.insert("nome", Value::Text("MARIA".into()));
            sink.write_row(&row)?;
        }
        sink.finish()?;

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path)?)?.build()?;
        let batches = reader.collect::<Result<Vec<_>, _>>()?;
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 3);
        let dates = batch.column(0).as_any().downcast_ref::<Date32Array>().unwrap();
        assert_eq!(dates.value(0), 1);
        let valor = batch.column(1).as_any().downcast_ref::<Decimal128Array>().unwrap();
        assert_eq!(valor.value(0), 12_345_600);
        assert_eq!(batch.column(2).null_count(), 1);
        Ok(())
    }

    #[test]
    fn rejects_values_of_the_wrong_type() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("x.parquet");
        let mut sink: Box<dyn Sink> =
            Box::new(ParquetSink::create(&path, vec![OutputColumn::new("n", SemanticType::Integer)])?);
        let mut row = NormalizedRow::default();
        row.insert("n", Value::Text("sete".into()));
        sink.write_row(&row)?;
        assert!(sink.finish().is_err());
        assert!(!temp_path(&path).exists());
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn discard_removes_partial_output() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("x.parquet");
        let sink: Box<dyn Sink> =
            Box::new(ParquetSink::create(&path, vec![OutputColumn::new("n", SemanticType::Integer)])?);
        assert!(temp_path(&path).exists());
        sink.discard()?;
        assert!(!temp_path(&path).exists());
        assert!(!path.exists());
        Ok(())
    }
}
