use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clientstore_common::keys::{build_client_prefix, last_segment};
use clientstore_common::{ListOptions, StorageBackend};
use clientstore_sync::archive::ArchiveDownloader;
use clientstore_sync::config::{BackendKind, SyncConfig};
use clientstore_sync::upload::{self, ContentTypePolicy, RemoteKeyContext};
use clientstore_sync::worker::{spawn_job, Job, JobHandle, JobOutcome};
use clientstore_sync::backend;

const DEFAULT_CONFIG_PATH: &str = "clientstore.toml";

const USAGE: &str = "\
usage: clientstore <command> [args]

  prefix <org-id> <tax-id> <company-name> [client-id]
  list <prefix>
  upload <tax-id> <path> [--subfolder NAME] [--org ID --company NAME] [--infer-type]
  download <prefix> [zip-name]
  get <key> [dest]
  purge <prefix>
  ensure-folders <prefix>

Config is read from $CLIENTSTORE_CONFIG or ./clientstore.toml.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    let rest = &args[1..];

    // Pure key computation needs no config or network.
    if command == "prefix" {
        return cmd_prefix(rest);
    }

    let config_path = std::env::var("CLIENTSTORE_CONFIG")
        .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = SyncConfig::load(&PathBuf::from(&config_path))?;
    let storage = backend::from_config(&config)?;
    info!(bucket = %config.bucket, backend = ?config.backend, "Storage configured");

    match command {
        "list" => cmd_list(storage.as_ref(), rest).await,
        "upload" => cmd_upload(storage, rest).await,
        "download" => cmd_download(&config, storage, rest).await,
        "get" => cmd_get(&config, storage.as_ref(), rest).await,
        "purge" => {
            let prefix = required(rest, 0, "prefix")?;
            finish(run(spawn_job(storage, Job::Purge { prefix })).await)
        }
        "ensure-folders" => {
            let prefix = required(rest, 0, "prefix")?;
            if config.mandatory_subfolders.is_empty() {
                warn!("mandatory_subfolders is empty, nothing to do");
            }
            let job = Job::EnsureSubfolders {
                prefix,
                names: config.mandatory_subfolders.clone(),
            };
            finish(run(spawn_job(storage, job)).await)
        }
        other => {
            eprintln!("unknown command {other:?}\n\n{USAGE}");
            std::process::exit(2);
        }
    }
}

fn required(args: &[String], idx: usize, name: &str) -> anyhow::Result<String> {
    args.get(idx)
        .filter(|s| !s.starts_with("--"))
        .cloned()
        .with_context(|| format!("missing <{name}>\n\n{USAGE}"))
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn cmd_prefix(args: &[String]) -> anyhow::Result<()> {
    let org = required(args, 0, "org-id")?;
    let tax_id = required(args, 1, "tax-id")?;
    let name = required(args, 2, "company-name")?;
    let client_id = match args.get(3) {
        Some(v) => Some(v.parse::<u64>().context("client-id must be a number")?),
        None => None,
    };
    println!("{}", build_client_prefix(&org, &tax_id, &name, client_id));
    Ok(())
}

async fn cmd_list(storage: &dyn StorageBackend, args: &[String]) -> anyhow::Result<()> {
    let prefix = args.first().cloned().unwrap_or_default();
    let entries = storage.list(&prefix, ListOptions::default()).await?;
    for entry in entries {
        if entry.is_folder() {
            println!("{}/", entry.full_path);
        } else {
            println!("{}", entry.full_path);
        }
    }
    Ok(())
}

async fn cmd_upload(storage: Arc<dyn StorageBackend>, args: &[String]) -> anyhow::Result<()> {
    let tax_id = required(args, 0, "tax-id")?;
    let path = PathBuf::from(required(args, 1, "path")?);

    let items = if path.is_dir() {
        upload::collect_tree(&path)
    } else if path.is_file() {
        upload::items_from_files(&[path.clone()])
    } else {
        bail!("{} does not exist", path.display());
    };
    if items.is_empty() {
        warn!(path = %path.display(), "Nothing to upload");
        return Ok(());
    }

    let mut ctx = RemoteKeyContext::new(&tax_id);
    ctx.subfolder = flag_value(args, "--subfolder");
    ctx.org_id = flag_value(args, "--org");
    ctx.company_name = flag_value(args, "--company");

    let content_type = if args.iter().any(|a| a == "--infer-type") {
        ContentTypePolicy::Inferred
    } else {
        ContentTypePolicy::default()
    };

    let job = Job::Upload {
        items,
        ctx,
        build_key: Arc::new(upload::default_remote_key),
        content_type,
    };
    let outcome = run(spawn_job(storage, job)).await;
    if let JobOutcome::Uploaded(o) = &outcome {
        for failure in &o.failures {
            eprintln!(
                "  {} ({}): {}",
                failure.item.relative_path,
                failure.kind(),
                failure.error
            );
        }
    }
    finish(outcome)
}

async fn cmd_download(
    config: &SyncConfig,
    storage: Arc<dyn StorageBackend>,
    args: &[String],
) -> anyhow::Result<()> {
    if config.backend != BackendKind::Supabase {
        bail!("folder archives need the supabase backend");
    }
    let prefix = required(args, 0, "prefix")?;
    let downloader = ArchiveDownloader::new(&config.storage_url, &config.api_key)
        .context("Failed to build archive HTTP client")?;

    let job = Job::DownloadZip {
        downloader: Arc::new(downloader),
        prefix,
        zip_name: args.get(1).cloned(),
        out_dir: config.downloads_dir(),
        read_timeout: config.archive_read_timeout(),
    };
    finish(run(spawn_job(storage, job)).await)
}

async fn cmd_get(
    config: &SyncConfig,
    storage: &dyn StorageBackend,
    args: &[String],
) -> anyhow::Result<()> {
    let key = required(args, 0, "key")?;
    let dest = match args.get(1) {
        Some(d) => PathBuf::from(d),
        None => config.downloads_dir().join(last_segment(&key)),
    };
    let written = storage
        .download_to(&key, &dest, !config.storage_only)
        .await
        .with_context(|| format!("Failed to download {key}"))?;
    println!("Saved to {}.", written.display());
    Ok(())
}

/// Drain progress until the job ends. Ctrl-C trips the job's cancel token;
/// the job itself decides when it has stopped.
async fn run(mut handle: JobHandle) -> JobOutcome {
    let mut interrupted = false;
    loop {
        tokio::select! {
            ev = handle.progress.recv() => match ev {
                Some(ev) => match ev.total {
                    Some(total) => eprintln!("[{}/{}] {}", ev.current, total, ev.label),
                    None => eprintln!("[{} bytes] {}", ev.current, ev.label),
                },
                None => break,
            },
            _ = signal::ctrl_c(), if !interrupted => {
                info!("Received interrupt, cancelling");
                interrupted = true;
                handle.cancel.cancel();
            }
        }
    }
    handle.wait().await
}

fn finish(outcome: JobOutcome) -> anyhow::Result<()> {
    let message = outcome.user_message();
    if outcome.is_error() {
        bail!(message);
    }
    println!("{message}");
    Ok(())
}
