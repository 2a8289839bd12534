// src/process/mod.rs

use anyhow::{anyhow, Context, Result};
use csv::{ByteRecord, ByteRecordsIntoIter, ReaderBuilder};
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::HashMap,
    io::{Cursor, Read, Seek},
};
use tracing::{debug, trace, warn};
use zip::ZipArchive;

pub mod encoding;
pub mod stream;

pub use encoding::{Encoding, StripNul};
pub use stream::EntryReader;

/// One delimited line keyed by (cleaned) header name.
pub type RawRecord = HashMap<String, String>;

/// Which archive entry holds the payload. The first entry in archive order
/// that matches wins.
///
/// Catalogue form: `{suffix: ...}`, `{pattern: <regex>}` or `only`.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "InnerMatchSpec")]
pub enum InnerMatch {
    Suffix(String),
    Pattern(Regex),
    /// The archive must hold exactly one entry, and that is the payload.
    Only,
}

#[derive(Deserialize)]
#[serde(untagged, deny_unknown_fields)]
enum InnerMatchSpec {
    Keyword(InnerKeyword),
    Suffix { suffix: String },
    Pattern { pattern: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum InnerKeyword {
    Only,
}

impl TryFrom<InnerMatchSpec> for InnerMatch {
    type Error = regex::Error;

    fn try_from(spec: InnerMatchSpec) -> Result<Self, Self::Error> {
        Ok(match spec {
            InnerMatchSpec::Suffix { suffix } => InnerMatch::Suffix(suffix),
            InnerMatchSpec::Pattern { pattern } => InnerMatch::Pattern(Regex::new(&pattern)?),
            InnerMatchSpec::Keyword(InnerKeyword::Only) => InnerMatch::Only,
        })
    }
}

impl InnerMatch {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            InnerMatch::Suffix(suffix) => name.ends_with(suffix.as_str()),
            InnerMatch::Pattern(re) => re.is_match(name),
            InnerMatch::Only => true,
        }
    }
}

/// How the payload text is laid out.
#[derive(Debug, Clone, Copy)]
pub struct TextFormat {
    pub encoding: Encoding,
    pub delimiter: u8,
}

impl Default for TextFormat {
    fn default() -> Self {
        Self { encoding: Encoding::Latin1, delimiter: b';' }
    }
}

/// Index of the payload entry, or `None` when nothing matches.
pub fn find_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    inner: &InnerMatch,
) -> Result<Option<usize>> {
    if let InnerMatch::Only = inner {
        return match archive.len() {
            0 => Ok(None),
            1 => Ok(Some(0)),
            n => Err(anyhow!("expected a single entry in archive, found {}", n)),
        };
    }
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .with_context(|| format!("failed to access ZIP entry #{}", i))?;
        trace!(entry = entry.name(), "listing");
        if entry.is_file() && inner.matches(entry.name()) {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

/// Every matching file entry, in archive order. Bundles hold one nested
/// archive per origin system and all of them are read.
pub fn find_entries<R: Read + Seek>(archive: &mut ZipArchive<R>, inner: &InnerMatch) -> Result<Vec<usize>> {
    if let InnerMatch::Only = inner {
        return Ok(find_entry(archive, inner)?.into_iter().collect());
    }
    let mut found = Vec::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .with_context(|| format!("failed to access ZIP entry #{}", i))?;
        if entry.is_file() && inner.matches(entry.name()) {
            found.push(i);
        }
    }
    Ok(found)
}

/// Unwrap one level of archive-within-archive: the nested archive at `index`
/// is read into memory (it is still compressed) and opened.
pub fn open_nested<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    index: usize,
) -> Result<(String, ZipArchive<Cursor<Vec<u8>>>)> {
    let mut entry = archive
        .by_index(index)
        .with_context(|| format!("failed to access ZIP entry #{}", index))?;
    let name = entry.name().to_string();
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut buf)
        .with_context(|| format!("failed to read nested archive {}", name))?;
    debug!(entry = %name, size = buf.len(), "opening nested archive");
    let nested = ZipArchive::new(Cursor::new(buf))
        .with_context(|| format!("entry {} is not a ZIP archive", name))?;
    Ok((name, nested))
}

/// Locate the payload entry and stream its rows.
///
/// The archive moves into the returned [`RawRows`]; the entry is inflated
/// while rows are read. A missing entry yields an empty [`RawRows`].
#[tracing::instrument(level = "debug", skip(archive, inner, format))]
pub fn extract_rows<R: Read + Seek + Send + 'static>(
    mut archive: ZipArchive<R>,
    inner: &InnerMatch,
    format: TextFormat,
) -> Result<RawRows> {
    let Some(index) = find_entry(&mut archive, inner)? else {
        return Ok(RawRows::empty());
    };
    let name = archive.name_for_index(index).unwrap_or_default().to_string();
    debug!(entry = %name, "streaming payload");
    let reader = EntryReader::spawn(archive, index)?;
    parse_delimited(name, reader, format)
}

/// Read delimited rows with a header line from `reader`. NUL bytes are
/// dropped before parsing and cells are decoded with `format.encoding`.
pub fn parse_delimited<R: Read + 'static>(entry: String, reader: R, format: TextFormat) -> Result<RawRows> {
    let source: Box<dyn Read> = Box::new(StripNul::new(reader));
    let mut rdr = ReaderBuilder::new()
        .delimiter(format.delimiter)
        .flexible(true)
        .has_headers(true)
        .from_reader(source);
    let headers = unique_headers(
        &entry,
        rdr.byte_headers()
            .with_context(|| format!("reading header of {}", entry))?
            .iter()
            .map(|h| clean_header(&format.encoding.decode(h))),
    );
    Ok(RawRows {
        entry: Some(entry),
        encoding: format.encoding,
        headers,
        records: Some(rdr.into_byte_records()),
    })
}

fn clean_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').trim().to_string()
}

/// A repeated header keeps its first name; later copies get `_2`, `_3`, ...
/// so no cell is overwritten and the copies show up as extra columns.
fn unique_headers(entry: &str, names: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    names
        .map(|name| {
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            if *count == 1 || name.is_empty() {
                name
            } else {
                let renamed = format!("{}_{}", name, count);
                warn!(entry, header = %name, renamed = %renamed, "duplicate header");
                renamed
            }
        })
        .collect()
}

/// Key for a cell past the end of the header, 1-based.
pub fn overflow_key(position: usize) -> String {
    format!("column_{}", position)
}

/// Lazy sequence of raw records from one payload entry.
pub struct RawRows {
    entry: Option<String>,
    encoding: Encoding,
    headers: Vec<String>,
    records: Option<ByteRecordsIntoIter<Box<dyn Read>>>,
}

impl RawRows {
    pub fn empty() -> Self {
        Self { entry: None, encoding: Encoding::default(), headers: Vec::new(), records: None }
    }

    /// Name of the entry being read, `None` when no entry matched.
    pub fn entry(&self) -> Option<&str> {
        self.entry.as_deref()
    }

    /// Short rows omit the trailing keys. Non-empty cells past the header are
    /// kept under [`overflow_key`] so they surface as drift.
    fn record(&self, rec: &ByteRecord) -> RawRecord {
        let mut out = HashMap::with_capacity(rec.len());
        for (i, cell) in rec.iter().enumerate() {
            let value = self.encoding.decode(cell);
            match self.headers.get(i) {
                Some(header) => {
                    out.insert(header.clone(), value);
                }
                None if value.trim().is_empty() => {}
                None => {
                    out.insert(overflow_key(i + 1), value);
                }
            }
        }
        out
    }
}

impl Iterator for RawRows {
    type Item = Result<RawRecord, csv::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.as_mut()?.next()?;
        Some(record.map(|rec| self.record(&rec)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::CompressionMethod;

    fn build_zip(entries: &[(&str, &[u8])]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
            for (name, data) in entries {
                zip.start_file(*name, options)?;
                zip.write_all(data)?;
            }
            zip.finish()?;
        }
        Ok(buf)
    }

    fn open(bytes: Vec<u8>) -> Result<ZipArchive<Cursor<Vec<u8>>>> {
        Ok(ZipArchive::new(Cursor::new(bytes))?)
    }

    #[test]
    fn selects_first_suffix_match_only() -> Result<()> {
        let inner = build_zip(&[("x.csv", b"A;B\n1;2\n" as &[u8])])?;
        let payload: &[u8] = b"\"Data\";\"Valor (R$)\"\n\"01/01/2020\";\"10,00\"\n\"02/01/2020\";\"20,00\"\n";
        let other: &[u8] = b"Data;Valor (R$)\n99/99/9999;0\n";
        let bytes = build_zip(&[
            ("a.zip", inner.as_slice()),
            ("20200101_Despesas_Pagamento.csv", payload),
            ("20200101_Despesas_Pagamento.csv.bak_Despesas_Pagamento.csv", other),
        ])?;

        let rows = extract_rows(
            open(bytes)?,
            &InnerMatch::Suffix("_Despesas_Pagamento.csv".into()),
            TextFormat::default(),
        )?;
        assert_eq!(rows.entry(), Some("20200101_Despesas_Pagamento.csv"));
        let rows: Vec<_> = rows.collect::<Result<_, _>>()?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["Data"], "01/01/2020");
        assert_eq!(rows[1]["Valor (R$)"], "20,00");
        Ok(())
    }

    #[test]
    fn no_match_is_empty() -> Result<()> {
        let bytes = build_zip(&[("20200101_Despesas_Empenho.csv", b"A\n1\n" as &[u8])])?;
        let rows = extract_rows(
            open(bytes)?,
            &InnerMatch::Suffix("_Despesas_Pagamento.csv".into()),
            TextFormat::default(),
        )?;
        assert!(rows.entry().is_none());
        assert_eq!(rows.count(), 0);
        Ok(())
    }

    #[test]
    fn decodes_latin1_and_strips_nul_before_parsing() -> Result<()> {
        // "Órgão" in ISO-8859-1, with a stray NUL inside the value
        let payload: &[u8] = b"\xd3rg\xe3o\tValor\nMinist\xe9rio\x00 da Sa\xfade\t1,5\n";
        let bytes = build_zip(&[("201101_Pagamentos.txt", payload)])?;
        let rows: Vec<_> = extract_rows(
            open(bytes)?,
            &InnerMatch::Only,
            TextFormat { encoding: Encoding::Latin1, delimiter: b'\t' },
        )?
        .collect::<Result<_, _>>()?;
        assert_eq!(rows[0]["Órgão"], "Ministério da Saúde");
        assert_eq!(rows[0]["Valor"], "1,5");
        Ok(())
    }

    #[test]
    fn rows_stream_before_the_entry_is_fully_read() -> Result<()> {
        let mut payload = String::from("A;B\n");
        for i in 0..20_000 {
            payload.push_str(&format!("{};x\n", i));
        }
        let mut bytes = build_zip(&[("p.csv", payload.as_bytes())])?;
        let (start, len) = {
            let mut archive = ZipArchive::new(Cursor::new(bytes.as_slice()))?;
            let entry = archive.by_index(0)?;
            (entry.data_start() as usize, entry.compressed_size() as usize)
        };
        // corrupt the last row; the checksum only fails at end of entry
        bytes[start + len - 2] ^= 0x01;

        let mut rows = extract_rows(open(bytes)?, &InnerMatch::Only, TextFormat::default())?;
        let first = rows.next().expect("first row")?;
        assert_eq!(first["A"], "0");
        let failure = rows.find_map(|r| r.err()).expect("checksum failure at end of entry");
        assert!(failure.is_io_error());
        Ok(())
    }

    #[test]
    fn only_rejects_multi_entry_archives() -> Result<()> {
        let bytes = build_zip(&[("a.csv", b"A\n" as &[u8]), ("b.csv", b"B\n" as &[u8])])?;
        let mut archive = open(bytes)?;
        assert!(find_entry(&mut archive, &InnerMatch::Only).is_err());
        assert!(find_entries(&mut archive, &InnerMatch::Only).is_err());
        Ok(())
    }

    #[test]
    fn unwraps_every_nested_archive_by_pattern() -> Result<()> {
        let defesa = build_zip(&[
            ("202001_Remuneracao.csv", b"X\n1\n" as &[u8]),
            ("202001_Cadastro.csv", b"CPF;NOME\n***.123.456-**;MARIA\n" as &[u8]),
        ])?;
        let siape = build_zip(&[("202001_Cadastro.csv", b"CPF;NOME\n***.999.888-**;ANA\n" as &[u8])])?;
        let outer = build_zip(&[
            ("README.txt", b"hi" as &[u8]),
            ("202001_Pensionistas_DEFESA.zip", defesa.as_slice()),
            ("202001_Pensionistas_SIAPE.zip", siape.as_slice()),
        ])?;
        let mut archive = open(outer)?;

        let pattern = InnerMatch::Pattern(Regex::new(r"(?i)pensionistas_\w+\.zip$")?);
        let nested = find_entries(&mut archive, &pattern)?;
        assert_eq!(nested, vec![1, 2]);

        let mut names = Vec::new();
        for index in nested {
            let (container, inner) = open_nested(&mut archive, index)?;
            let rows: Vec<_> = extract_rows(
                inner,
                &InnerMatch::Suffix("_Cadastro.csv".into()),
                TextFormat::default(),
            )?
            .collect::<Result<_, _>>()?;
            assert_eq!(rows.len(), 1, "{}", container);
            names.push(rows[0]["NOME"].clone());
        }
        assert_eq!(names, vec!["MARIA", "ANA"]);
        Ok(())
    }

    #[test]
    fn short_rows_omit_trailing_keys() -> Result<()> {
        let text = "\u{feff}A;B;C\n1;2\n".as_bytes().to_vec();
        let format = TextFormat { encoding: Encoding::Utf8, delimiter: b';' };
        let rows: Vec<_> = parse_delimited("t.csv".into(), Cursor::new(text), format)?.collect::<Result<_, _>>()?;
        assert_eq!(rows[0].len(), 2);
        assert_eq!(rows[0]["A"], "1");
        assert!(!rows[0].contains_key("C"));
        Ok(())
    }

    #[test]
    fn overflow_cells_and_repeated_headers_are_kept() -> Result<()> {
        let text = b"A;B;A;\n1;2;3;;9\n4;5\n".to_vec();
        let rows: Vec<_> =
            parse_delimited("t.csv".into(), Cursor::new(text), TextFormat::default())?.collect::<Result<_, _>>()?;
        assert_eq!(rows[0]["A"], "1");
        assert_eq!(rows[0]["A_2"], "3");
        assert_eq!(rows[0][""], "");
        assert_eq!(rows[0][&overflow_key(5)], "9");
        assert_eq!(rows[0].len(), 5);
        assert_eq!(rows[1].len(), 2);
        Ok(())
    }

    #[test]
    fn inner_match_from_yaml() -> Result<()> {
        let m: InnerMatch = serde_yaml::from_str("suffix: _Cadastro.csv")?;
        assert!(m.matches("202001_Cadastro.csv"));
        let m: InnerMatch = serde_yaml::from_str("pattern: '^\\d{6}_.*\\.zip$'")?;
        assert!(m.matches("202001_Militares.zip"));
        let m: InnerMatch = serde_yaml::from_str("only")?;
        assert!(matches!(m, InnerMatch::Only));

        assert!(serde_yaml::from_str::<InnerMatch>("sufix: _Cadastro.csv").is_err());
        assert!(serde_yaml::from_str::<InnerMatch>("pattern: '('").is_err());
        assert!(serde_yaml::from_str::<InnerMatch>("every").is_err());
        Ok(())
    }
}
