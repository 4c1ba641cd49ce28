use std::{sync::Arc, time::Duration};

use clap::Parser;
use error::AppError;
use segweave_engine::hls::{HlsVariantSelectionPolicy, save_playlist};
use segweave_engine::{DownloaderConfig, HlsConfigBuilder, HlsDownloader, ProxyConfig};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod cli;
mod error;
mod utils;

use cli::CliArgs;
use utils::progress::IndicatifProgress;
use utils::{format_bytes, parse_headers};

/// Some segments never reached the output
const EXIT_INCOMPLETE: i32 = 2;

fn main() {
    match bootstrap() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            // Log the full error for debugging
            error!(error = ?e, "Application failed");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn bootstrap() -> Result<i32, AppError> {
    // Parse command-line arguments
    let args = CliArgs::parse();

    // Setup logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open("segweave.log")?;

    let multi_writer = MakeWriterExt::and(std::io::stdout, log_file);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(multi_writer)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    info!("segweave {} - concurrent HLS segment downloader", env!("CARGO_PKG_VERSION"));

    let downloader = HlsDownloader::new(build_config(&args)?)?;

    // Ctrl-C stops the job; the sink is still closed.
    let cancel = downloader.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping download");
            cancel.cancel();
        }
    });

    let playlist = downloader.load_playlist(&args.url).await?;
    if let Some(path) = &args.save_playlist {
        save_playlist(path, &playlist.text).await?;
        info!(path = %path.display(), "Saved playlist");
    }

    let progress = Arc::new(if args.show_progress {
        IndicatifProgress::new()
    } else {
        IndicatifProgress::hidden()
    });
    let report = downloader
        .download_playlist_to_path(&playlist, &args.output, progress)
        .await?;

    info!(
        "Wrote {} ({} of {} segments) to {} in {:.1}s",
        format_bytes(report.bytes_written),
        report.succeeded,
        report.total_segments,
        args.output.display(),
        report.elapsed.as_secs_f64()
    );

    if report.is_complete() {
        Ok(0)
    } else {
        warn!(
            failed = ?report.failed_indices,
            skipped = ?report.skipped_indices,
            dropped = ?report.dropped_indices,
            "Output is incomplete"
        );
        Ok(EXIT_INCOMPLETE)
    }
}

fn build_config(args: &CliArgs) -> Result<segweave_engine::HlsConfig, AppError> {
    if args.proxy_user.is_some() != args.proxy_pass.is_some() {
        return Err(AppError::InvalidInput(
            "--proxy-user and --proxy-pass must be given together".to_string(),
        ));
    }

    let proxies: Vec<ProxyConfig> = args
        .proxies
        .iter()
        .map(|url| {
            let proxy = ProxyConfig::new(url.as_str());
            match (&args.proxy_user, &args.proxy_pass) {
                (Some(user), Some(pass)) => proxy.with_auth(user, pass),
                _ => proxy,
            }
        })
        .collect();
    if !proxies.is_empty() {
        info!(count = proxies.len(), "Proxy rotation enabled");
    }

    let base = DownloaderConfig::builder()
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_headers(parse_headers(&args.headers))
        .with_system_proxy(!args.no_proxy)
        .danger_accept_invalid_certs(args.insecure)
        .build();

    let mut builder = HlsConfigBuilder::new()
        .with_base_config(base)
        .download_concurrency(args.workers)
        .submission_interval(Duration::from_millis(args.delay_ms))
        .segment_timeout(Duration::from_secs(args.timeout))
        .segment_retry_count(args.retries)
        .gap_policy(args.gap_policy)
        .max_buffered_segments((args.max_buffered > 0).then_some(args.max_buffered))
        .proxies(proxies);

    if !args.user_agents.is_empty() {
        builder = builder.user_agents(args.user_agents.clone());
    }
    if let Some(bandwidth) = args.bandwidth {
        builder = builder
            .variant_selection_policy(HlsVariantSelectionPolicy::ClosestToBitrate(bandwidth));
    }

    Ok(builder.build()?)
}
