//! archive-cache - decompressed archive cache for emulator launches

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use archive_cache::config::{policy_key, PolicyStore, CONFIG_FILE};
use archive_cache::extractor::{select_extractor, ToolLocator};
use archive_cache::game::DiscInfo;
use archive_cache::index::{CacheIndex, INDEX_FILE};
use archive_cache::launch::{check_extractor, LaunchRequest, Launcher};
use archive_cache::manager::CacheManager;

#[derive(Parser)]
#[command(name = "archive-cache")]
#[command(version)]
#[command(about = "Extracts game archives once and launches them from a size-bounded cache")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding archive-cache.ini, the selection index and logs
    #[arg(long, global = true, env = "ARCHIVE_CACHE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Directory searched first for chdman, DolphinTool, extract-xiso and 7z
    #[arg(long, global = true)]
    tools_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the cache for a game and print the path to launch
    Launch {
        /// Frontend game id
        #[arg(long)]
        id: String,

        /// Archive (or first disc) to launch
        #[arg(long)]
        archive: String,

        #[arg(long)]
        emulator: String,

        #[arg(long)]
        platform: String,

        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        version: String,

        /// One disc of a multi-disc game, as N=PATH (repeatable)
        #[arg(long = "disc", value_parser = parse_disc)]
        discs: Vec<DiscInfo>,

        /// Disc to launch when the game has several
        #[arg(long)]
        selected_disc: Option<u32>,

        /// The frontend loads multi-disc games through an m3u playlist
        #[arg(long)]
        m3u_enabled: bool,

        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Record which file inside a game's archive to launch
    Select {
        #[arg(long)]
        id: String,

        /// File path inside the archive
        file: String,
    },

    /// List the files inside an archive
    List {
        archive: String,

        #[arg(long, default_value = "All")]
        emulator: String,

        #[arg(long, default_value = "All")]
        platform: String,
    },

    /// Remove cache entries that are incomplete or whose source is gone
    Verify,

    /// Show cache usage and entries, least recently used first
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Clean up after a game exits
    Exit,

    /// Show the effective configuration
    Config,
}

fn parse_disc(value: &str) -> Result<DiscInfo, String> {
    let (disc, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected N=PATH, got {:?}", value))?;
    let disc = disc
        .trim()
        .parse()
        .map_err(|_| format!("invalid disc number {:?}", disc))?;
    Ok(DiscInfo {
        disc,
        archive_path: path.to_string(),
    })
}

fn init_logging(verbose: bool, log_dir: &Path) -> Result<WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(if verbose {
        "archive_cache=debug".parse()?
    } else {
        "archive_cache=info".parse()?
    });

    let appender = Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix("archive-cache")
        .filename_suffix("log")
        .build(log_dir)
        .context("Failed to open log file")?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    Ok(guard)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => dirs::config_dir()
            .context("Could not determine the user config directory")?
            .join("archive-cache"),
    };
    fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create config directory {}", config_dir.display()))?;

    let _guard = init_logging(cli.verbose, &config_dir)?;

    let policy = PolicyStore::load(config_dir.join(CONFIG_FILE));
    let manager = CacheManager::from_policy(&policy);
    let tools = ToolLocator::new(cli.tools_dir);

    if !matches!(cli.command, Commands::Verify | Commands::Config) {
        manager.verify_cache_integrity()?;
    }

    match cli.command {
        Commands::Launch {
            id,
            archive,
            emulator,
            platform,
            title,
            version,
            discs,
            selected_disc,
            m3u_enabled,
            json,
        } => {
            let index = CacheIndex::load(config_dir.join(INDEX_FILE));
            let request = LaunchRequest {
                game_id: id,
                archive_path: archive,
                emulator,
                platform,
                title,
                version,
                discs,
                selected_disc,
                m3u_enabled,
            };

            let outcome = Launcher::new(&policy, &index, &manager, tools).prepare(&request)?;
            if let Some(notice) = &outcome.notice {
                eprintln!("{}", notice);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("{}", outcome.launch_path.display());
            }
        }

        Commands::Select { id, file } => {
            let mut index = CacheIndex::load(config_dir.join(INDEX_FILE));
            index.set_selected_file(&id, &file)?;
            println!("Selected {} for {}", file, id);
        }

        Commands::List {
            archive,
            emulator,
            platform,
        } => {
            let key = policy_key(&emulator, &platform);
            if let Err(e) = check_extractor(&policy, &key, &archive, &tools) {
                warn!("{}", e);
            }
            let extractor = select_extractor(&archive, &key, &policy).build(&tools);

            let files = extractor.list(Path::new(&archive));
            for f in &files {
                println!("{}", f);
            }
            eprintln!("\nTotal: {} files", files.len());
        }

        Commands::Verify => {
            let removed = manager.verify_cache_integrity()?;
            println!("Removed {} invalid cache entries from {}", removed, manager.cache_root().display());
        }

        Commands::Status { json } => {
            let status = manager.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }

            println!("=== Archive Cache ===");
            println!("Location: {}", status.cache_root.display());
            println!("Used:     {} MB of {} MB", to_mb(status.used), to_mb(status.capacity));
            println!("Entries:  {}", status.entries.len());
            println!();
            for entry in &status.entries {
                let title = entry
                    .record
                    .as_ref()
                    .map(|r| r.title.as_str())
                    .filter(|t| !t.is_empty())
                    .unwrap_or("(unknown)");
                println!(
                    "{:>8} MB  {}  {}",
                    to_mb(entry.size),
                    entry.last_used.format("%Y-%m-%d %H:%M"),
                    title
                );
            }
        }

        Commands::Exit => {
            manager.clear_temp()?;
            info!("Game exited.");
        }

        Commands::Config => {
            let g = policy.global();
            println!("=== Configuration ===");
            println!("File:                  {}", policy.path().display());
            println!("Cache path:            {}", policy.cache_root().display());
            println!("Cache size:            {} MB", g.cache_size_mb);
            println!("Minimum archive size:  {} MB", g.min_archive_size_mb);
            println!("Standalone extensions: {}", g.standalone_extensions.join(", "));
            println!("Metadata extensions:   {}", g.metadata_extensions.join(", "));
            println!("Bypass path check:     {}", if g.bypass_path_check { "Yes" } else { "No" });
            println!();
            println!("=== Policies ===");
            for key in policy.policy_keys() {
                let p = policy.get_policy(key);
                println!(
                    "{}: {} (launch path {}, m3u name {}, smart extract {}, multi-disc {})",
                    key,
                    p.action.as_str(),
                    p.launch_path.as_str(),
                    p.m3u_name.as_str(),
                    p.smart_extract,
                    p.multi_disc
                );
            }
        }
    }

    Ok(())
}

fn to_mb(bytes: u64) -> u64 {
    bytes / (1024 * 1024)
}
