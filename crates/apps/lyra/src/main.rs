//! Lyra - Incremental Slack workspace archiver
//!
//! Keeps one local archive per configured workspace up to date.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use chat::config::TOKEN_ENV;
use chat::{Archive, ArchiveConfig, RunOptions};
use clap::Parser;
use log::{error, info};

#[derive(Parser, Debug)]
#[command(name = "lyra", version, about = "Incrementally archive Slack workspaces")]
struct Args {
    /// Archives file (default: archives.json in the Lyra config directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,

    /// Log everything, including HTTP traffic
    #[arg(long)]
    debug: bool,

    /// Re-download every file the archive references that is missing locally
    #[arg(short, long)]
    download_everything: bool,

    /// Actually delete old files (otherwise only report what would be deleted)
    #[arg(short = 'D', long)]
    confirm_delete: bool,

    /// Archives to update, as [TOKEN:]DIR (default: every configured archive)
    #[arg(value_name = "ARCHIVE")]
    archives: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.debug {
        "trace"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Resolve the archives to update from the config file and arguments
fn archives(args: &Args) -> Result<Vec<ArchiveConfig>> {
    let env_token = std::env::var(TOKEN_ENV).ok();
    let file = args.config.clone().or_else(ArchiveConfig::default_file);

    let configured = match &file {
        Some(path) => ArchiveConfig::load_file(path, env_token.as_deref())
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Vec::new(),
    };

    if args.archives.is_empty() {
        return Ok(configured);
    }
    args.archives
        .iter()
        .map(|arg| ArchiveConfig::from_arg(arg, &configured, env_token.as_deref()))
        .collect()
}

/// Update every archive; `false` when any of them failed
fn run(args: &Args) -> Result<bool> {
    let archives = archives(args)?;
    if archives.is_empty() {
        let hint = config::config_path(chat::config::ARCHIVES_FILE)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| chat::config::ARCHIVES_FILE.to_string());
        bail!("No archives configured (add them to {} or pass DIR arguments)", hint);
    }

    let options = RunOptions {
        download_everything: args.download_everything,
        confirm_delete: args.confirm_delete,
        ..Default::default()
    };

    let mut ok = true;
    for config in archives {
        let name = config.name.clone();
        info!("Updating archive {}", name);
        let result = Archive::open(config).and_then(|archive| archive.run(&options));
        match result {
            Ok(stats) => {
                if stats.refresh.failed_conversations > 0 || stats.downloads.pending > 0 {
                    info!(
                        "{}: {} conversations failed, {} downloads left for the next run",
                        name, stats.refresh.failed_conversations, stats.downloads.pending
                    );
                }
            }
            Err(e) => {
                error!("{}: {:#}", name, e);
                ok = false;
            }
        }
    }
    Ok(ok)
}
