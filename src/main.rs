//! Command-line shell over the download engine.
//!
//! Parses arguments, stands up a [`DownloadManager`], renders per-task
//! progress bars and pauses everything gracefully on Ctrl+C so the
//! downloads can be resumed with `--recover` later.
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use blockfetch::{DownloadManager, ManagerConfig, TaskState};

/// A multi-connection download manager.
///
/// Splits files into byte-range blocks downloaded in parallel, with
/// pause/resume across restarts, a global speed limit and queued downloads.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// URLs to download.
    urls: Vec<String>,

    /// Directory to save files (and resume records) in.
    #[arg(short, long, default_value = "./downloads")]
    dir: PathBuf,

    /// Parallel connections per file (1-32).
    #[arg(short, long, default_value_t = 8)]
    blocks: u32,

    /// Max downloads running at once (1-10).
    #[arg(short, long, default_value_t = 3)]
    concurrent: u32,

    /// Global speed limit in bytes per second (0 = unlimited).
    #[arg(short, long, default_value_t = 0)]
    rate_limit: i64,

    /// Scan the save directory for interrupted downloads and resume them.
    #[arg(long)]
    recover: bool,

    /// Referer header to send with every request.
    #[arg(long)]
    referer: Option<String>,

    /// Cookie header to send with every request.
    #[arg(long)]
    cookie: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    if args.urls.is_empty() && !args.recover {
        eprintln!("Nothing to do: pass at least one URL or --recover.");
        return Ok(());
    }

    let manager = DownloadManager::new(ManagerConfig {
        default_save_dir: args.dir.clone(),
        max_blocks_per_task: args.blocks,
        max_concurrent_tasks: args.concurrent,
        speed_limit: args.rate_limit,
        ..Default::default()
    });

    if args.recover {
        let recovered = manager.recover().await;
        if !recovered.is_empty() {
            println!("Resuming {} interrupted download(s)...", recovered.len());
        }
        for id in recovered {
            manager.resume(id);
        }
    }

    for url in &args.urls {
        manager.add(url, None, args.referer.clone(), args.cookie.clone());
    }

    // Ctrl+C pauses everything; resume records stay on disk.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let failed = render_until_done(&manager, &cancel).await?;

    manager.shutdown().await;
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Poll task snapshots and mirror them into progress bars until every task
/// reaches a resting state (or Ctrl+C pauses the run). Returns the number of
/// failed tasks.
async fn render_until_done(manager: &DownloadManager, cancel: &CancellationToken) -> Result<u64> {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template(
        "{msg:30} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} ({eta})",
    )?
    .progress_chars("=>-");

    let mut bars: HashMap<u64, ProgressBar> = HashMap::new();

    loop {
        if cancel.is_cancelled() {
            let _ = multi.println("Pausing downloads; resume later with --recover.");
            for info in manager.all_tasks() {
                manager.pause(info.task_id).await;
            }
            return Ok(0);
        }

        let snapshots = manager.all_tasks();
        if snapshots.is_empty() {
            return Ok(0);
        }
        let mut failed = 0;
        let mut resting = 0;

        for info in &snapshots {
            let bar = bars.entry(info.task_id).or_insert_with(|| {
                let bar = multi.add(ProgressBar::new(info.file_size.max(0) as u64));
                bar.set_style(style.clone());
                bar
            });

            if info.file_size > 0 && bar.length() != Some(info.file_size as u64) {
                bar.set_length(info.file_size as u64);
            }
            bar.set_position(info.progress.downloaded_bytes.max(0) as u64);
            bar.set_message(format!("{} [{}]", info.file_name, info.state));

            match info.state {
                TaskState::Completed => {
                    resting += 1;
                    if !bar.is_finished() {
                        bar.finish_with_message(format!("{} done", info.file_name));
                    }
                }
                TaskState::Failed => {
                    failed += 1;
                    resting += 1;
                    if !bar.is_finished() {
                        bar.abandon_with_message(format!(
                            "{} failed: {}",
                            info.file_name, info.error_message
                        ));
                    }
                }
                TaskState::Cancelled | TaskState::Paused => resting += 1,
                TaskState::Queued | TaskState::Downloading => {}
            }
        }

        if resting == snapshots.len() {
            return Ok(failed);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
