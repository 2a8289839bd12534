use anyhow::{Context, Result};
use std::{
    io::{self, Read, Seek},
    sync::mpsc::{self, Receiver},
    thread,
};
use tracing::trace;
use zip::ZipArchive;

const CHUNK_SIZE: usize = 256 * 1024;
const CHUNKS_IN_FLIGHT: usize = 4;

/// Decompressed bytes of one archive entry.
///
/// A helper thread owns the archive and inflates the entry chunk by chunk into
/// a bounded channel, so at most `CHUNKS_IN_FLIGHT` chunks are held at once.
/// Dropping the reader stops the thread at its next send.
pub struct EntryReader {
    chunks: Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl EntryReader {
    pub fn spawn<R: Read + Seek + Send + 'static>(mut archive: ZipArchive<R>, index: usize) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(CHUNKS_IN_FLIGHT);
        thread::Builder::new()
            .name(format!("zip-entry-{}", index))
            .spawn(move || {
                let mut entry = match archive.by_index(index) {
                    Ok(entry) => entry,
                    Err(e) => {
                        let _ = tx.send(Err(io::Error::other(e)));
                        return;
                    }
                };
                let mut total = 0usize;
                loop {
                    let mut chunk = vec![0u8; CHUNK_SIZE];
                    match entry.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            total += n;
                            chunk.truncate(n);
                            if tx.send(Ok(chunk)).is_err() {
                                trace!(total, "entry reader dropped early");
                                return;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    }
                }
                trace!(total, "entry fully inflated");
            })
            .context("spawning archive entry reader")?;
        Ok(Self { chunks: rx, chunk: Vec::new(), pos: 0 })
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.chunk.len() {
            match self.chunks.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => return Err(e),
                // sender gone: the entry is exhausted (or already failed)
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
