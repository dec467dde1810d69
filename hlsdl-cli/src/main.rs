mod cli;
mod config;
mod error;
mod progress;

use std::process;

use clap::Parser;
use hlsdl_engine::{JobManager, JobSnapshot, JobStatus};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use url::Url;

use crate::cli::Args;
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::progress::ProgressReporter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = AppConfig::load(args.config.as_deref())?.with_args(&args);
    let engine_config = config.engine_config()?;
    info!(
        output = %engine_config.output_root.display(),
        resolution = %engine_config.preference,
        concurrency = engine_config.concurrency,
        "Starting"
    );

    let manager = JobManager::new(engine_config)?;
    let events = manager.subscribe();

    let mut ids = Vec::new();
    for text in read_inputs(&args.inputs).await? {
        let summary = manager.import(&text)?;
        for skipped in &summary.skipped {
            warn!("Skipped {skipped}");
        }
        ids.extend(summary.added);
    }
    if ids.is_empty() {
        return Err(AppError::InvalidInput("no downloadable URLs found".to_string()));
    }

    let done = CancellationToken::new();
    let reporter = tokio::spawn(ProgressReporter::new(args.quiet).run(
        manager.clone(),
        events,
        done.clone(),
    ));
    watch_ctrl_c(manager.clone());

    manager.start_all_pending();
    let mut snapshots = Vec::with_capacity(ids.len());
    for id in ids {
        snapshots.push(manager.wait(id).await?);
    }

    done.cancel();
    if let Err(e) = reporter.await {
        warn!("Progress reporter ended abnormally: {e}");
    }

    report(&snapshots, args.json)?;
    let failed = snapshots
        .iter()
        .filter(|s| s.status != JobStatus::Completed)
        .count();
    if failed > 0 {
        return Err(AppError::JobsFailed {
            failed,
            total: snapshots.len(),
        });
    }
    Ok(())
}

/// Each input is a URL, a file of links, or `-` for stdin. Bare URLs are imported together.
async fn read_inputs(inputs: &[String]) -> Result<Vec<String>> {
    let mut urls = Vec::new();
    let mut texts = Vec::new();
    for input in inputs {
        if input == "-" {
            let mut text = String::new();
            tokio::io::stdin().read_to_string(&mut text).await?;
            texts.push(text);
        } else if Url::parse(input).is_ok_and(|u| matches!(u.scheme(), "http" | "https")) {
            urls.push(input.clone());
        } else {
            let text = tokio::fs::read_to_string(input)
                .await
                .map_err(|e| AppError::InvalidInput(format!("{input}: {e}")))?;
            texts.push(text);
        }
    }
    if !urls.is_empty() {
        texts.insert(0, urls.join("\n"));
    }
    Ok(texts)
}

/// First Ctrl-C stops every job gracefully; a second one exits immediately.
fn watch_ctrl_c(manager: JobManager) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, stopping jobs (press Ctrl-C again to exit now)");
        manager.stop_all();
        if tokio::signal::ctrl_c().await.is_ok() {
            process::exit(130);
        }
    });
}

fn report(snapshots: &[JobSnapshot], json: bool) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(snapshots)
            .map_err(|e| AppError::InvalidInput(e.to_string()))?;
        println!("{text}");
        return Ok(());
    }

    for snapshot in snapshots {
        match snapshot.status {
            JobStatus::Completed => {
                info!(title = %snapshot.title, "Completed");
                for output in &snapshot.outputs {
                    println!("{}", output.display());
                }
            }
            status => {
                let reason = snapshot.error.as_deref().unwrap_or("no error recorded");
                eprintln!("{}: {status} ({reason})", snapshot.title);
            }
        }
        for warning in &snapshot.warnings {
            eprintln!("{}: warning: {warning}", snapshot.title);
        }
    }
    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::builder()
            .with_default_directive(Level::INFO.into())
            .from_env_lossy()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .with_level(true),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inputs_group_urls_and_read_files() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("links.json");
        std::fs::write(&list, r#"[{"name":"A","url":"http://h/a.m3u8"}]"#).unwrap();

        let texts = read_inputs(&[
            "http://h/1.m3u8".to_string(),
            list.display().to_string(),
            "https://h/2.m3u8".to_string(),
        ])
        .await
        .unwrap();
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[0], "http://h/1.m3u8\nhttps://h/2.m3u8");
        assert!(texts[1].contains("\"A\""));

        let missing = dir.path().join("missing.txt").display().to_string();
        assert!(matches!(
            read_inputs(&[missing]).await,
            Err(AppError::InvalidInput(_))
        ));
    }
}
