// src/fetch/zips.rs

use anyhow::{Context, Result};
use futures::{stream, StreamExt};
use reqwest::Client;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{fs, time::sleep};
use tracing::{info, warn};

use super::ResourceAddress;

pub const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/105.0.0.0 Safari/537.36";

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// What happened to one address during a mirror run.
#[derive(Debug)]
pub enum DownloadOutcome {
    Downloaded(PathBuf),
    AlreadyPresent(PathBuf),
    Failed { address: String, error: String },
}

/// Download one archive to `dest_dir/<file_name>`, retrying transient failures.
pub async fn download_zip(
    client: &Client,
    address: &ResourceAddress,
    dest_dir: impl AsRef<Path>,
) -> Result<PathBuf> {
    let dest_path = dest_dir.as_ref().join(address.file_name());
    if let Some(parent) = dest_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let bytes = match address {
        ResourceAddress::Url(url) => {
            let mut attempt = 0;
            loop {
                attempt += 1;
                let result = async {
                    client
                        .get(url.clone())
                        .send()
                        .await?
                        .error_for_status()?
                        .bytes()
                        .await
                }
                .await;
                match result {
                    Ok(bytes) => break bytes.to_vec(),
                    Err(e) if attempt < MAX_RETRIES => {
                        warn!(%url, attempt, error = %e, "download failed, retrying");
                        sleep(RETRY_DELAY * attempt).await;
                    }
                    Err(e) => return Err(e).with_context(|| format!("GET {}", url)),
                }
            }
        }
        ResourceAddress::Path(path) => fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
    };

    // write to a temp name first so an interrupted run never leaves a truncated zip
    let tmp_path = dest_path.with_extension("zip.part");
    fs::write(&tmp_path, &bytes).await?;
    fs::rename(&tmp_path, &dest_path).await?;
    Ok(dest_path)
}

/// Mirror every address into `dest_dir`, at most `concurrency` at a time.
/// Files already on disk are left alone.
pub async fn download_all(
    client: &Client,
    addresses: Vec<ResourceAddress>,
    dest_dir: &Path,
    concurrency: usize,
) -> Vec<DownloadOutcome> {
    stream::iter(addresses)
        .map(|address| async move {
            let existing = dest_dir.join(address.file_name());
            if fs::metadata(&existing).await.is_ok() {
                return DownloadOutcome::AlreadyPresent(existing);
            }
            match download_zip(client, &address, dest_dir).await {
                Ok(path) => {
                    info!(path = %path.display(), "downloaded");
                    DownloadOutcome::Downloaded(path)
                }
                Err(e) => {
                    warn!(%address, error = %e, "download failed");
                    DownloadOutcome::Failed {
                        address: address.to_string(),
                        error: format!("{:#}", e),
                    }
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn mirrors_local_paths_and_skips_present_files() -> Result<()> {
        let src = tempdir()?;
        let dest = tempdir()?;
        let source_file = src.path().join("202001_Pensionistas_DEFESA.zip");
        std::fs::write(&source_file, b"zip bytes")?;
        std::fs::write(dest.path().join("202002.zip"), b"old")?;

        let addresses = vec![
            ResourceAddress::Path(source_file),
            ResourceAddress::Path(src.path().join("202002")),
            ResourceAddress::Path(src.path().join("202003")),
        ];
        let client = Client::new();
        let outcomes = download_all(&client, addresses, dest.path(), 2).await;

        let downloaded = outcomes
            .iter()
            .filter(|o| matches!(o, DownloadOutcome::Downloaded(_)))
            .count();
        let present = outcomes
            .iter()
            .filter(|o| matches!(o, DownloadOutcome::AlreadyPresent(_)))
            .count();
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, DownloadOutcome::Failed { .. }))
            .count();
        assert_eq!((downloaded, present, failed), (1, 1, 1));
        assert_eq!(
            std::fs::read(dest.path().join("202001_Pensionistas_DEFESA.zip"))?,
            b"zip bytes".to_vec()
        );
        Ok(())
    }
}
