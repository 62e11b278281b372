//! The `lumen run` command: upload, process and report in one process.

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use lumen_core::{
    Config, ImageFormat, ImageService, ImageStatus, ImageStatusReport, InputDiscovery, Lumen,
    OperationKind, OperationParams, ParamValue,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Image files or directories to upload
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Operation to apply, as `kind[:key=value,...]`; repeat to chain
    #[arg(long = "op", value_parser = parse_operation)]
    pub operations: Vec<OperationParams>,

    /// Directory to write each processed artifact to
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Number of workers (overrides config)
    #[arg(short, long)]
    pub workers: Option<usize>,
}

/// Parse `kind[:key=value,...]` into operation parameters.
///
/// Values are read as booleans, integers or floats when they look like one,
/// and as text otherwise.
pub fn parse_operation(input: &str) -> Result<OperationParams, String> {
    let (kind, rest) = match input.split_once(':') {
        Some((kind, rest)) => (kind, Some(rest)),
        None => (input, None),
    };
    let kind: OperationKind = kind.trim().parse().map_err(|e| format!("{e}"))?;
    let mut op = OperationParams::new(kind);
    for pair in rest.into_iter().flat_map(|r| r.split(',')).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{pair}'"))?;
        op.parameters
            .insert(key.trim().to_string(), parse_value(value.trim()));
    }
    Ok(op)
}

fn parse_value(raw: &str) -> ParamValue {
    if let Ok(b) = raw.parse::<bool>() {
        ParamValue::Bool(b)
    } else if let Ok(i) = raw.parse::<i64>() {
        ParamValue::Int(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        ParamValue::Float(f)
    } else {
        ParamValue::Text(raw.to_string())
    }
}

#[derive(Serialize)]
struct StatusLine<'a> {
    file: &'a str,
    #[serde(flatten)]
    report: &'a ImageStatusReport,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    artifacts: Vec<String>,
}

struct Pending {
    image_id: String,
    file_name: String,
}

pub async fn execute(args: RunArgs, mut config: Config) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config.worker.num_workers = workers.max(1);
    }
    let output_dir = args
        .output
        .as_ref()
        .map(|p| PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).into_owned()));
    if let Some(dir) = &output_dir {
        std::fs::create_dir_all(dir)?;
    }

    let files = InputDiscovery::new(&config.processing).discover(&args.inputs);
    if files.is_empty() {
        anyhow::bail!("No supported images found in the given inputs");
    }
    tracing::info!(files = files.len(), operations = args.operations.len(), "Starting run");

    let lumen = Lumen::in_memory(config).await?;
    let pool = lumen.worker_pool();
    let cancel = pool.cancel_token();
    let pool_handle = tokio::spawn(pool.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }));

    let service = lumen.service();
    let start = Instant::now();
    let mut pending = Vec::with_capacity(files.len());
    let mut rejected = 0u64;
    for file in &files {
        let bytes = match tokio::fs::read(&file.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                rejected += 1;
                tracing::error!(path = %file.path.display(), error = %e, "Failed to read input");
                continue;
            }
        };
        match service
            .upload_image(
                bytes,
                &file.file_name(),
                file.declared_mime(),
                args.operations.clone(),
            )
            .await
        {
            Ok(image) => pending.push(Pending {
                image_id: image.id,
                file_name: file.file_name(),
            }),
            Err(e) => {
                rejected += 1;
                tracing::error!(path = %file.path.display(), error = %e, "Upload rejected");
            }
        }
    }

    let kinds: BTreeSet<OperationKind> = args
        .operations
        .iter()
        .filter_map(|op| op.operation_kind().ok())
        .collect();
    let progress = create_progress_bar(pending.len() as u64);
    let (mut completed, mut failed) = (0u64, 0u64);

    while !pending.is_empty() && !cancel.is_cancelled() {
        let mut still_pending = Vec::with_capacity(pending.len());
        for item in pending {
            let report = match service.get_image_status(&item.image_id).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!(image_id = %item.image_id, error = %e, "Status lookup failed");
                    still_pending.push(item);
                    continue;
                }
            };
            if !report.status.is_terminal() {
                still_pending.push(item);
                continue;
            }

            let artifacts = match (&output_dir, report.status) {
                (Some(dir), ImageStatus::Completed) => {
                    write_artifacts(&service, &item, &kinds, dir).await
                }
                _ => Vec::new(),
            };
            if report.status == ImageStatus::Completed {
                completed += 1;
            } else {
                failed += 1;
            }
            let line = StatusLine {
                file: &item.file_name,
                report: &report,
                artifacts,
            };
            progress.suspend(|| match serde_json::to_string(&line) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::error!(error = %e, "Failed to serialize status"),
            });
            progress.inc(1);
        }
        pending = still_pending;
        progress.set_message(format!("{completed} completed, {failed} failed"));
        if !pending.is_empty() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
    progress.finish_and_clear();

    let unfinished = pending.len() as u64;
    cancel.cancel();
    let report = pool_handle.await?;
    if report.abandoned > 0 {
        tracing::warn!(abandoned = report.abandoned, "Some workers did not stop in time");
    }

    print_summary(completed, failed, rejected, unfinished, start.elapsed());
    let stats = lumen.stats().detailed_statistics().await?;
    eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Download each requested artifact of a completed image into `dir`.
async fn write_artifacts(
    service: &ImageService,
    item: &Pending,
    kinds: &BTreeSet<OperationKind>,
    dir: &Path,
) -> Vec<String> {
    let mut written = Vec::new();
    for kind in kinds {
        let (bytes, mime) = match service.get_image(&item.image_id, kind.as_str()).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(image_id = %item.image_id, operation = %kind, error = %e, "Artifact missing");
                continue;
            }
        };
        let path = artifact_path(dir, &item.file_name, *kind, &mime);
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => written.push(path.display().to_string()),
            Err(e) => tracing::error!(path = %path.display(), error = %e, "Failed to write artifact"),
        }
    }
    written
}

/// `<dir>/<stem>.<kind>.<ext>`, with the extension taken from the mime type.
fn artifact_path(dir: &Path, file_name: &str, kind: OperationKind, mime: &str) -> PathBuf {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let ext = ImageFormat::from_mime(mime)
        .map(|f| f.extension())
        .unwrap_or("bin");
    dir.join(format!("{stem}.{kind}.{ext}"))
}

fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}",
    ) {
        pb.set_style(style.progress_chars("##-"));
    }
    pb.set_message("waiting for workers...");
    pb
}

fn print_summary(completed: u64, failed: u64, rejected: u64, unfinished: u64, elapsed: Duration) {
    eprintln!();
    eprintln!("  ====================================");
    eprintln!("               Summary");
    eprintln!("  ====================================");
    eprintln!("    Completed:    {:>8}", completed);
    if failed > 0 {
        eprintln!("    Failed:       {:>8}", failed);
    }
    if rejected > 0 {
        eprintln!("    Rejected:     {:>8}", rejected);
    }
    if unfinished > 0 {
        eprintln!("    Unfinished:   {:>8}", unfinished);
    }
    eprintln!("    Elapsed:      {:>7.1}s", elapsed.as_secs_f64());
    eprintln!("  ====================================");
}
