use serde::Deserialize;
use std::{
    borrow::Cow,
    io::{self, Read},
};

/// Text encodings used by the published exports. Fixed per dataset, never sniffed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Encoding {
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    #[default]
    #[serde(rename = "iso-8859-1", alias = "latin1", alias = "latin-1")]
    Latin1,
    #[serde(rename = "iso-8859-15", alias = "latin9")]
    Latin9,
}

impl Encoding {
    /// Decode `bytes` and drop embedded NULs.
    pub fn decode(self, bytes: &[u8]) -> String {
        let text: Cow<'_, str> = match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes),
            Encoding::Latin1 => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
            Encoding::Latin9 => Cow::Owned(bytes.iter().map(|&b| latin9_char(b)).collect()),
        };
        if text.contains('\0') {
            text.replace('\0', "")
        } else {
            text.into_owned()
        }
    }
}

/// Drops NUL bytes from a byte stream before it reaches the row parser.
pub struct StripNul<R> {
    inner: R,
}

impl<R: Read> StripNul<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read> Read for StripNul<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.inner.read(buf)?;
            if n == 0 {
                return Ok(0);
            }
            let mut kept = 0;
            for i in 0..n {
                if buf[i] != 0 {
                    buf[kept] = buf[i];
                    kept += 1;
                }
            }
            // a chunk of nothing but NULs is not end of stream
            if kept > 0 {
                return Ok(kept);
            }
        }
    }
}

// ISO-8859-15 differs from Latin-1 in exactly eight positions.
fn latin9_char(b: u8) -> char {
    match b {
        0xA4 => '€',
        0xA6 => 'Š',
        0xA8 => 'š',
        0xB4 => 'Ž',
        0xB8 => 'ž',
        0xBC => 'Œ',
        0xBD => 'œ',
        0xBE => 'Ÿ',
        _ => b as char,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_maps_bytes_to_code_points() {
        // "ÓRGÃO" in ISO-8859-1
        let bytes = [0xD3, b'R', b'G', 0xC3, b'O'];
        assert_eq!(Encoding::Latin1.decode(&bytes), "ÓRGÃO");
    }

    #[test]
    fn latin9_differs_on_euro() {
        assert_eq!(Encoding::Latin1.decode(&[0xA4]), "¤");
        assert_eq!(Encoding::Latin9.decode(&[0xA4]), "€");
    }

    #[test]
    fn strip_nul_reader_skips_all_nul_chunks() -> std::io::Result<()> {
        let mut out = Vec::new();
        StripNul::new(&b"\0\0\0a;\0b\n"[..]).read_to_end(&mut out)?;
        assert_eq!(out, b"a;b\n");
        Ok(())
    }

    #[test]
    fn strips_nul_bytes() {
        assert_eq!(Encoding::Utf8.decode(b"a\0b;c\0\0"), "ab;c");
        assert_eq!(Encoding::Latin1.decode(b"\0x"), "x");
    }
}
