//! CLI entry point for GameSaver.
//!
//! This binary provides the `gamesaver` command with subcommands for running
//! an interactive save session and maintaining the profiles on disk.

mod host;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gamesaver_kernel::{Registration, SaveManager, SaveSettings, SharedModule};
use gamesaver_store::FileStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Settings file used when `--config` is not given and the file exists.
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// GameSaver: crash-safe, encrypted profile saves.
#[derive(Parser)]
#[command(
    name = "gamesaver",
    version,
    about = "GameSaver: crash-safe, encrypted profile saves",
    long_about = "Persists game profiles with an atomic replace-and-backup protocol, \
                  optional authenticated encryption, and coalesced save requests."
)]
struct Cli {
    /// Settings file (TOML). Defaults to config/default.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the save root directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive save session.
    Run {
        /// Module key the session state is stored under.
        #[arg(long, default_value = "Session")]
        module: String,
    },

    /// List profiles on disk, most recent first.
    Profiles,

    /// Print the stored contents of a profile.
    Show {
        /// Profile id. Defaults to the most recently used profile.
        profile: Option<String>,
    },

    /// Delete a profile and its backups.
    Delete {
        profile: String,
    },

    /// Discard the local encryption secret. Existing encrypted saves become
    /// unreadable.
    ResetSecret {
        /// Confirm the reset.
        #[arg(long)]
        yes: bool,
    },

    /// Show the effective settings.
    Status,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref(), cli.root)?;

    match cli.command {
        Commands::Run { module } => {
            init_tracing("info", cli.json_logs);
            cmd_run(settings, module).await
        }
        Commands::Profiles => {
            init_tracing("warn", cli.json_logs);
            cmd_profiles(settings).await
        }
        Commands::Show { profile } => {
            init_tracing("warn", cli.json_logs);
            cmd_show(settings, profile).await
        }
        Commands::Delete { profile } => {
            init_tracing("info", cli.json_logs);
            cmd_delete(settings, &profile).await
        }
        Commands::ResetSecret { yes } => {
            init_tracing("info", cli.json_logs);
            cmd_reset_secret(settings, yes)
        }
        Commands::Status => {
            init_tracing("warn", cli.json_logs);
            cmd_status(&settings)
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(settings: SaveSettings, module: String) -> Result<()> {
    info!(root = %settings.root.display(), layout = ?settings.layout, "starting GameSaver");

    // 1. Build the manager and attach the session state. The registration is
    //    deferred until the initial load has run.
    let manager = SaveManager::new(settings);
    let state: Arc<host::HostState> = Arc::new(SharedModule::new(module));
    manager
        .register(Registration::new(state.clone()).on_load_completed(|view| {
            info!(
                profile_id = view.profile_id(),
                module_key = view.key(),
                fresh = view.is_empty(),
                "session state restored"
            );
        }))
        .await
        .context("failed to register session state")?;

    // 2. Initialize: load settings-selected profile, flush registrations,
    //    start autosave.
    manager
        .initialize()
        .await
        .context("save manager failed to start")?;

    // 3. Host loop.
    println!();
    println!("  GameSaver v{}", env!("CARGO_PKG_VERSION"));
    println!("  Active profile: {}", manager.profile_id().await?);
    println!("  Type `help` for commands, `quit` to exit.");
    println!();

    host::run(&manager, &state).await?;

    // 4. Shutdown hook: final immediate save.
    let outcome = manager.shutdown().await?;
    if outcome.success {
        println!("  Saved. Goodbye.");
    } else {
        println!("  Final save FAILED; see the log for details.");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommands: profile maintenance
// ---------------------------------------------------------------------------

async fn cmd_profiles(settings: SaveSettings) -> Result<()> {
    let store = FileStore::new(settings).context("failed to open save root")?;
    let profiles = store.list_profiles().await.context("failed to list profiles")?;

    println!();
    if profiles.is_empty() {
        println!("  No profiles under {}", store.root().display());
    }
    for profile in profiles {
        let modified = profile
            .last_modified
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never saved".to_string());
        println!("  {:<24} {:<24} {} file(s)", profile.id, modified, profile.files);
    }
    println!();
    Ok(())
}

async fn cmd_show(settings: SaveSettings, profile: Option<String>) -> Result<()> {
    let store = FileStore::new(settings).context("failed to open save root")?;
    let profile_id = match profile {
        Some(id) => id,
        None => store
            .most_recently_used_profile()
            .await
            .context("no profiles on disk")?,
    };

    let data = store
        .read_profile(&profile_id)
        .await
        .with_context(|| format!("profile `{profile_id}` is missing or unreadable"))?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

async fn cmd_delete(settings: SaveSettings, profile: &str) -> Result<()> {
    let store = FileStore::new(settings).context("failed to open save root")?;
    if store
        .delete_profile(profile)
        .await
        .with_context(|| format!("failed to delete profile `{profile}`"))?
    {
        println!("  Deleted {profile}");
    } else {
        println!("  No profile named {profile}");
    }
    Ok(())
}

fn cmd_reset_secret(settings: SaveSettings, confirmed: bool) -> Result<()> {
    if !confirmed {
        println!("  This makes every existing encrypted save unreadable.");
        println!("  Re-run with --yes to confirm.");
        return Ok(());
    }

    let store = FileStore::new(settings).context("failed to open save root")?;
    match store.passphrase_source() {
        Some(source) => {
            source.reset().context("failed to reset the local secret")?;
            println!("  Local secret discarded.");
        }
        None => println!("  Encryption is disabled; nothing to reset."),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

fn cmd_status(settings: &SaveSettings) -> Result<()> {
    println!();
    println!("  GameSaver Status");
    println!("  ================");
    println!();

    match settings.validate() {
        Ok(()) => println!("  Settings:         OK"),
        Err(e) => println!("  Settings:         INVALID ({e})"),
    }
    if settings.root.is_dir() {
        println!("  Save root:        OK ({})", settings.root.display());
    } else {
        println!("  Save root:        NOT CREATED ({})", settings.root.display());
    }
    if settings.use_encryption {
        let secret = settings.secret_path();
        let state = if secret.is_file() { "present" } else { "not yet generated" };
        println!("  Local secret:     {state} ({})", secret.display());
    } else {
        println!("  Encryption:       DISABLED");
    }
    match settings.autosave_interval() {
        Some(period) => println!("  Autosave:         every {:.0}s", period.as_secs_f64()),
        None => println!("  Autosave:         OFF"),
    }

    println!();
    println!("{}", toml::to_string_pretty(settings).context("failed to render settings")?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load settings from `--config`, else the default config file if present,
/// else built-in defaults; then apply environment and flag overrides.
fn load_settings(config: Option<&Path>, root: Option<PathBuf>) -> Result<SaveSettings> {
    let settings = match config {
        Some(path) => SaveSettings::load(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_PATH).is_file() => SaveSettings::load(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("failed to load settings from {DEFAULT_CONFIG_PATH}"))?,
        None => SaveSettings::default(),
    };

    let settings = settings
        .with_env_overrides()
        .context("invalid GAMESAVER_* environment override")?;
    Ok(match root {
        Some(root) => settings.with_root(root),
        None => settings,
    })
}

/// Initialize the tracing subscriber with the given default log level.
fn init_tracing(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
