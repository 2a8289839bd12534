use anyhow::{bail, Result};
use std::{fs, path::Path, sync::Arc};
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use transparencia::{
    config::{Catalogue, Dataset, Settings, Source},
    dates::DateWindow,
    fetch::{
        self,
        zips::{download_all, DownloadOutcome},
        Fetch, HttpFetcher, LocalFetcher,
    },
    pipeline::{self, RunStats},
    sink,
};

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,transparencia=info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
    info!("startup");

    std::panic::set_hook(Box::new(|info| {
        eprintln!("panic: {:?}", info);
    }));

    // ─── 2) settings & catalogue ─────────────────────────────────────
    let settings = Settings::from_env()?;
    let catalogue = Catalogue::load(&settings.datasets_file)?;
    let names: Vec<String> = std::env::args().skip(1).collect();
    if names.is_empty() {
        bail!(
            "usage: transparencia <dataset>... (known: {})",
            catalogue.names().collect::<Vec<_>>().join(", ")
        );
    }
    fs::create_dir_all(&settings.output_dir)?;

    let mut failed = 0usize;
    for name in names {
        match run_dataset(&catalogue, &settings, &name).await {
            Ok(stats) => {
                if stats.instants_skipped > 0 {
                    warn!(dataset = %name, skipped = stats.instants_skipped, "some instants were unavailable");
                }
                info!(dataset = %name, "{}", stats);
            }
            Err(e) => {
                error!(dataset = %name, "{:#}", e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} dataset(s) failed", failed);
    }
    info!("all done");
    Ok(())
}

async fn run_dataset(catalogue: &Catalogue, settings: &Settings, name: &str) -> Result<RunStats> {
    let dataset = Arc::new(catalogue.dataset(name)?);
    let window = dataset.window(settings.start, settings.end)?;
    info!(dataset = %name, start = %window.start, end = %window.end, "window");

    // ─── 3) optionally mirror archives ───────────────────────────────
    if settings.download {
        let addresses = pipeline::addresses(&dataset, &window)?;
        let total = addresses.len();
        let client = reqwest::Client::builder()
            .user_agent(fetch::zips::USER_AGENT)
            .build()?;
        let mirror_dir = settings.download_dir.join(&dataset.name);
        let start = Instant::now();
        let outcomes = download_all(&client, addresses, &mirror_dir, settings.concurrency).await;
        let missing = outcomes
            .iter()
            .filter(|o| matches!(o, DownloadOutcome::Failed { .. }))
            .count();
        info!(dataset = %name, total, missing, elapsed = ?start.elapsed(), "mirror finished");
    }

    // ─── 4) convert on the blocking pool ─────────────────────────────
    let out_path = settings
        .output_dir
        .join(format!("{}.{}", name, settings.output_format.extension()));
    tokio::task::spawn_blocking({
        let settings = settings.clone();
        move || convert(&dataset, window, &settings, &out_path)
    })
    .await?
}

fn convert(dataset: &Dataset, window: DateWindow, settings: &Settings, out_path: &Path) -> Result<RunStats> {
    let fetcher: Box<dyn Fetch> = match settings.source {
        Source::Http => Box::new(HttpFetcher::new()?),
        Source::Local => Box::new(LocalFetcher::new(&settings.download_dir, &dataset.name)),
    };
    let mut sink = sink::open(settings.output_format, out_path, dataset.output_columns())?;
    let mut rows = pipeline::run(dataset, window, fetcher.as_ref()).with_cache_capacity(settings.cache_capacity);
    let written = rows.by_ref().try_for_each(|row| sink.write_row(&row?));
    if let Err(e) = written {
        if let Err(cleanup) = sink.discard() {
            warn!(error = %format!("{:#}", cleanup), "partial output left behind");
        }
        return Err(e);
    }
    let stats = rows.into_stats();
    let path = sink.finish()?;
    info!(path = %path.display(), rows = stats.rows_produced, "output written");
    Ok(stats)
}
