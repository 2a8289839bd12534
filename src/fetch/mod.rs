// src/fetch/mod.rs

use anyhow::{anyhow, Context, Result};
use std::{fs, path::PathBuf, thread::sleep, time::Duration};
use tracing::{debug, warn};

pub mod locate;
pub mod zips;

pub use locate::{AddressRule, ResourceAddress, ResourceLocator};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// Something that turns an address into archive bytes.
///
/// Retrying is the implementor's business; the pipeline treats any error as
/// "this instant is unavailable" and moves on.
pub trait Fetch {
    fn fetch(&self, address: &ResourceAddress) -> Result<Vec<u8>>;
}

/// Blocking HTTP fetcher with exponential backoff.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    max_retries: u32,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(zips::USER_AGENT)
            .build()
            .context("building HTTP client")?;
        Ok(Self { client, max_retries: MAX_RETRIES })
    }

    fn get_once(&self, url: &url::Url) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("non-success status {}", url))?;
        Ok(resp.bytes().with_context(|| format!("reading body from {}", url))?.to_vec())
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, address: &ResourceAddress) -> Result<Vec<u8>> {
        let url = match address {
            ResourceAddress::Url(url) => url,
            ResourceAddress::Path(path) => {
                return fs::read(path).with_context(|| format!("reading {}", path.display()))
            }
        };

        let mut attempts = 0;
        loop {
            match self.get_once(url) {
                Ok(bytes) => {
                    debug!(%url, size = bytes.len(), "fetched");
                    return Ok(bytes);
                }
                Err(e) if attempts < self.max_retries => {
                    attempts += 1;
                    let backoff = INITIAL_BACKOFF_MS * 2u64.pow(attempts - 1);
                    warn!(%url, attempt = attempts, delay_ms = backoff, error = %e, "retrying");
                    sleep(Duration::from_millis(backoff));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Reads archives previously mirrored under `<download_dir>/<dataset>/`.
pub struct LocalFetcher {
    dir: PathBuf,
}

impl LocalFetcher {
    pub fn new(download_dir: impl Into<PathBuf>, dataset: &str) -> Self {
        Self { dir: download_dir.into().join(dataset) }
    }

    pub fn path_for(&self, address: &ResourceAddress) -> PathBuf {
        match address {
            ResourceAddress::Path(path) => path.clone(),
            ResourceAddress::Url(_) => self.dir.join(address.file_name()),
        }
    }
}

impl Fetch for LocalFetcher {
    fn fetch(&self, address: &ResourceAddress) -> Result<Vec<u8>> {
        let path = self.path_for(address);
        if !path.exists() {
            return Err(anyhow!("file {} not found", path.display()));
        }
        fs::read(&path).with_context(|| format!("reading {}", path.display()))
    }
}
