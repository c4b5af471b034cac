//! ytstream - command-line host for the audio resolution and cache subsystem.
//!
//! Every subcommand builds a [`StreamCacheManager`] from the on-disk
//! configuration, runs one collaborator-facing operation, and shuts the
//! manager down again.

mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{Level, debug};
use ytstream_core::{
    ConfigManager, CoreConfig, DownloadRequest, FolderIngest, StreamCacheManager, TrackId,
    default_config_file_path,
};

use crate::logging::{LoggingConfig, LoggingError};

#[derive(Parser)]
#[command(
    name = "ytstream",
    version,
    about = "Resolve YouTube tracks to playable audio and manage the local cache"
)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    /// Log debug output to the console
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a track and list its ranked formats
    Resolve(IdArgs),
    /// Print a playable reference (cached file or remote URL)
    Url(IdArgs),
    /// Download a track into the cache, optionally copying it to a library
    Download(DownloadArgs),
    /// Warm the cache for several tracks and wait for completion
    Prefetch(PrefetchArgs),
    /// Run one janitor sweep
    Sweep(SweepArgs),
    /// Show cache occupancy
    Status,
    /// Forget cached metadata and bytes for a track
    Invalidate(IdArgs),
}

#[derive(Args)]
struct IdArgs {
    /// Track id (11-character video id, optionally prefixed)
    id: String,
}

#[derive(Args)]
struct DownloadArgs {
    /// Track id
    id: String,
    /// Track title
    #[arg(long)]
    title: Option<String>,
    /// Artist name
    #[arg(long)]
    artist: Option<String>,
    /// Album name
    #[arg(long)]
    album: Option<String>,
    /// Cover art URL
    #[arg(long)]
    artwork_url: Option<String>,
    /// Copy the finished file into this folder as "<artist> - <title>"
    #[arg(long)]
    library_dir: Option<PathBuf>,
}

#[derive(Args)]
struct PrefetchArgs {
    /// Track ids
    #[arg(required = true)]
    ids: Vec<String>,
}

#[derive(Args)]
struct SweepArgs {
    /// Ids that must survive the sweep
    #[arg(long, num_args = 1..)]
    protect: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] ytstream_core::Error),
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error("Failed to start async runtime: {0}")]
    Runtime(std::io::Error),
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32, CliError> {
    let console_level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    let _guard = logging::init(&LoggingConfig::default().with_console_level(console_level))?;

    let config = load_config(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    runtime.block_on(execute(cli, config))
}

fn load_config(cli: &Cli) -> Result<CoreConfig, CliError> {
    let path = cli.config.clone().unwrap_or_else(default_config_file_path);
    let manager = ConfigManager::open(path)?;
    let mut config = manager.config().clone();
    if let Some(dir) = &cli.cache_dir {
        config = config.with_cache_dir(dir);
    }
    debug!("Using cache directory {}", config.cache_dir.display());
    Ok(config)
}

/// Only `prefetch` runs the worker pool, so other commands must not queue
/// background fills that shutdown would discard.
fn prepare_config(mut config: CoreConfig, command: &Command) -> CoreConfig {
    if !matches!(command, Command::Prefetch(_)) {
        config.prefetch.cache_on_play = false;
    }
    config
}

async fn execute(cli: Cli, config: CoreConfig) -> Result<i32, CliError> {
    let json = cli.json;
    let config = prepare_config(config, &cli.command);

    let manager = match &cli.command {
        Command::Download(DownloadArgs {
            library_dir: Some(dir),
            ..
        }) => StreamCacheManager::new(config)?.with_ingest(Arc::new(FolderIngest::new(dir))),
        _ => StreamCacheManager::new(config)?,
    };

    // Background loops are only needed while prefetching.
    if matches!(cli.command, Command::Prefetch(_)) {
        manager.start();
    }

    let result = dispatch(&manager, cli.command, json).await;
    manager.shutdown().await;
    result
}

async fn dispatch(
    manager: &StreamCacheManager,
    command: Command,
    json: bool,
) -> Result<i32, CliError> {
    match command {
        Command::Resolve(args) => {
            let stream = manager.resolve(&args.id).await?;
            if json {
                print_json(&stream)?;
            } else {
                if let Some(title) = &stream.title {
                    println!("{title}");
                }
                println!("expires at {}", stream.expires_at);
                for format in &stream.formats {
                    println!(
                        "{:>6} kbps  {:<5} {}",
                        format.bitrate_bps / 1000,
                        format.codec,
                        format.mime_type
                    );
                }
            }
            Ok(0)
        }
        Command::Url(args) => match manager.get_stream_url(&args.id).await {
            Some(reference) => {
                if json {
                    print_json(&reference)?;
                } else {
                    println!("{}", reference.location());
                }
                Ok(0)
            }
            None => {
                eprintln!("no playable stream for {}", args.id);
                Ok(1)
            }
        },
        Command::Download(args) => {
            let outcome = manager
                .download(DownloadRequest {
                    id: args.id,
                    title: args.title,
                    artist: args.artist,
                    album: args.album,
                    artwork_url: args.artwork_url,
                })
                .await;
            if json {
                print_json(&outcome)?;
            } else if let Some(path) = &outcome.path {
                println!("{}", path.display());
            } else if let Some(error) = &outcome.error {
                eprintln!("download failed: {error}");
            }
            Ok(i32::from(!outcome.success))
        }
        Command::Prefetch(args) => {
            let queued = manager.prefetch_videos(&args.ids).await;
            debug!("Queued {} of {} ids", queued, args.ids.len());
            manager.wait_for_prefetch().await;

            let status = manager.get_prefetch_status().await;
            let cached = args
                .ids
                .iter()
                .filter_map(|raw| TrackId::parse(raw).ok())
                .filter(|id| manager.byte_cache().has(id))
                .count();
            if json {
                print_json(&status)?;
            } else {
                println!("{cached}/{} cached", args.ids.len());
            }
            Ok(i32::from(cached < args.ids.len()))
        }
        Command::Sweep(args) => {
            manager.update_protected_song_ids(&args.protect);
            let stats = manager.sweep_now().await;
            if json {
                print_json(&stats)?;
            } else {
                println!(
                    "removed {} files ({} bytes), {} protected skipped, {} expired metadata rows",
                    stats.files_removed(),
                    stats.bytes_freed(),
                    stats.protected_skipped,
                    stats.expired_metadata
                );
            }
            Ok(0)
        }
        Command::Status => {
            let summary = manager.cache_summary();
            if json {
                print_json(&summary)?;
            } else {
                println!("cache dir:  {}", manager.config().cache_dir.display());
                println!("files:      {} ({} bytes)", summary.files, summary.bytes);
                println!("metadata:   {} rows", summary.metadata_entries);
            }
            Ok(0)
        }
        Command::Invalidate(args) => {
            let removed = manager.invalidate(&args.id)?;
            if json {
                print_json(&serde_json::json!({ "id": args.id, "removed": removed }))?;
            } else if removed {
                println!("invalidated {}", args.id);
            } else {
                println!("nothing cached for {}", args.id);
            }
            Ok(0)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(value).map_err(ytstream_core::Error::from)?;
    println!("{text}");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use ytstream_core::ProviderChain;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_download_with_tags() {
        let cli = Cli::try_parse_from([
            "ytstream",
            "download",
            "dQw4w9WgXcQ",
            "--title",
            "Song",
            "--artist",
            "Band",
            "--library-dir",
            "/music",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Command::Download(args) => {
                assert_eq!(args.id, "dQw4w9WgXcQ");
                assert_eq!(args.title.as_deref(), Some("Song"));
                assert_eq!(args.library_dir, Some(PathBuf::from("/music")));
            }
            _ => panic!("expected download"),
        }
    }

    #[test]
    fn test_parse_sweep_protect_list() {
        let cli = Cli::try_parse_from([
            "ytstream",
            "--cache-dir",
            "/tmp/c",
            "sweep",
            "--protect",
            "aaaaaaaaaaa",
            "bbbbbbbbbbb",
        ])
        .unwrap();
        assert_eq!(cli.cache_dir, Some(PathBuf::from("/tmp/c")));
        match cli.command {
            Command::Sweep(args) => assert_eq!(args.protect.len(), 2),
            _ => panic!("expected sweep"),
        }
    }

    #[test]
    fn test_prefetch_requires_ids() {
        assert!(Cli::try_parse_from(["ytstream", "prefetch"]).is_err());
    }

    #[test]
    fn test_load_config_applies_cache_dir_override() {
        let temp = tempfile::TempDir::new().unwrap();
        let cli = Cli::try_parse_from([
            "ytstream",
            "--config",
            temp.path().join("config.json").to_str().unwrap(),
            "--cache-dir",
            temp.path().join("cache").to_str().unwrap(),
            "status",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.cache_dir, temp.path().join("cache"));
    }

    #[test]
    fn test_only_prefetch_keeps_cache_on_play() {
        for (args, expected) in [
            (vec!["ytstream", "url", "dQw4w9WgXcQ"], false),
            (vec!["ytstream", "resolve", "dQw4w9WgXcQ"], false),
            (vec!["ytstream", "prefetch", "dQw4w9WgXcQ"], true),
        ] {
            let cli = Cli::try_parse_from(args.iter().copied()).unwrap();
            let config = prepare_config(CoreConfig::default(), &cli.command);
            assert_eq!(config.prefetch.cache_on_play, expected, "{args:?}");
        }
    }

    #[tokio::test]
    async fn test_unplayable_url_exits_with_operation_failure() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = CoreConfig::default().with_cache_dir(temp.path());
        let manager = StreamCacheManager::with_chain(config, ProviderChain::default()).unwrap();

        let cli = Cli::try_parse_from(["ytstream", "url", "dQw4w9WgXcQ"]).unwrap();
        assert_eq!(dispatch(&manager, cli.command, false).await.unwrap(), 1);

        let cli = Cli::try_parse_from(["ytstream", "url", "not an id"]).unwrap();
        assert_eq!(dispatch(&manager, cli.command, true).await.unwrap(), 1);
        manager.shutdown().await;
    }
}
