use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use calsync_core::{system_clock, DateRange, JsonFileStore, SyncEngine, SyncOptions, SyncReport};
use calsync_google::{
    AppConfig, AuthConfig, AuthOptions, FileTokenStore, GoogleCalendarClient, TokenManager,
    TokenVault,
};

#[derive(Parser)]
#[command(name = "calsync-cli")]
#[command(about = "Synchronize a local event store with Google Calendar")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the interactive OAuth flow and store the credential
    Auth,
    /// Reconcile local and remote events
    Sync {
        /// Use the incremental change feed instead of a full window scan
        #[arg(long)]
        incremental: bool,

        /// Window start (YYYY-MM-DD); defaults to 90 days ago
        #[arg(long)]
        from: Option<String>,

        /// Window end (YYYY-MM-DD); defaults to one year ahead
        #[arg(long)]
        to: Option<String>,

        /// Pull remote changes only; do not push local ones
        #[arg(long)]
        one_way: bool,

        /// Print the sync report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show sync health for this installation
    Status,
    /// List conflicts awaiting manual resolution
    Conflicts,
    /// Revoke the stored credential
    Revoke,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Auth => cmd_auth().await,
        Commands::Sync {
            incremental,
            from,
            to,
            one_way,
            json,
        } => cmd_sync(incremental, from.as_deref(), to.as_deref(), one_way, json).await,
        Commands::Status => cmd_status().await,
        Commands::Conflicts => cmd_conflicts().await,
        Commands::Revoke => cmd_revoke().await,
    }
}

fn token_manager(config: &AppConfig) -> Result<Arc<TokenManager>> {
    Ok(TokenManager::new(
        AuthConfig::new(&config.client_id, &config.client_secret),
        system_clock(),
        TokenVault::new(&config.token_cache_dir()?, &config.owner_id)?,
        Arc::new(FileTokenStore::new(&config.durable_token_dir()?)?),
        &config.owner_id,
    ))
}

async fn build_engine(config: &AppConfig) -> Result<(Arc<SyncEngine>, Arc<TokenManager>)> {
    let tokens = token_manager(config)?;
    if !tokens.load_stored().await? {
        anyhow::bail!("no stored credential; run `calsync-cli auth` first");
    }

    let store = Arc::new(JsonFileStore::open(&config.store_dir()?)?);
    let remote = Arc::new(
        GoogleCalendarClient::new(tokens.clone(), &config.sync)
            .with_calendar_id(&config.calendar_id),
    );
    let engine = SyncEngine::new(store, remote, system_clock(), config.sync.clone());
    engine.initialize(&config.scope).await?;
    Ok((engine, tokens))
}

async fn cmd_auth() -> Result<()> {
    let config = AppConfig::load()?;
    let tokens = token_manager(&config)?;

    println!("Authenticating with Google...");

    let seen_email: Arc<std::sync::Mutex<Option<String>>> =
        Arc::new(std::sync::Mutex::new(None));
    let seen = Arc::clone(&seen_email);
    let _sub = tokens.on_auth_change(move |event| {
        if let Some(email) = &event.owner_email {
            if let Ok(mut slot) = seen.lock() {
                *slot = Some(email.clone());
            }
        }
    });

    tokens
        .authenticate(&AuthOptions {
            prompt: Some("select_account".to_string()),
            ..AuthOptions::default()
        })
        .await
        .context("authentication failed")?;

    let email = seen_email.lock().ok().and_then(|slot| slot.clone());
    match email {
        Some(email) => println!("\nAuthenticated as: {}", email),
        None => println!("\nAuthenticated."),
    }
    println!("Tokens stored; `calsync-cli sync` will keep them fresh.");
    Ok(())
}

async fn cmd_sync(
    incremental: bool,
    from: Option<&str>,
    to: Option<&str>,
    one_way: bool,
    json: bool,
) -> Result<()> {
    let config = AppConfig::load()?;
    let (engine, _tokens) = build_engine(&config).await?;

    // Replay anything parked while offline before reconciling.
    let replay = engine.process_offline_queue().await?;
    if replay.processed > 0 {
        println!("Replayed {} queued change(s)", replay.processed);
    }

    let report = if incremental {
        engine.perform_incremental_sync().await?
    } else {
        let range = parse_range(from, to)?;
        engine
            .perform_full_sync(&SyncOptions {
                range,
                bidirectional: !one_way,
            })
            .await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    engine.shutdown();
    Ok(())
}

async fn cmd_status() -> Result<()> {
    let config = AppConfig::load()?;
    let (engine, tokens) = build_engine(&config).await?;

    let status = engine.status();
    println!("Scope:            {}", config.scope);
    println!(
        "Credential:       {}",
        if tokens.is_valid() {
            "valid"
        } else {
            "needs refresh"
        }
    );
    match status.last_sync {
        Some(at) => println!("Last sync:        {}", at.to_rfc3339()),
        None => println!("Last sync:        never"),
    }
    if let Some(error) = &status.last_error {
        println!("Last error:       {}", error);
    }
    println!("Pending changes:  {}", status.pending_changes);

    let conflicts = engine.unresolved_conflicts().await?;
    println!("Open conflicts:   {}", conflicts.len());
    engine.shutdown();
    Ok(())
}

async fn cmd_conflicts() -> Result<()> {
    let config = AppConfig::load()?;
    let (engine, _tokens) = build_engine(&config).await?;

    let conflicts = engine.unresolved_conflicts().await?;
    if conflicts.is_empty() {
        println!("No unresolved conflicts.");
    } else {
        for conflict in &conflicts {
            println!(
                "{}  {}  local: \"{}\"  remote: \"{}\"",
                conflict.detected_at.to_rfc3339(),
                conflict.id,
                conflict.local_event.title,
                conflict.remote_event.title,
            );
        }
    }
    engine.shutdown();
    Ok(())
}

async fn cmd_revoke() -> Result<()> {
    let config = AppConfig::load()?;
    let tokens = token_manager(&config)?;
    tokens.load_stored().await?;
    tokens.revoke().await?;
    println!("Credential revoked and cleared.");
    Ok(())
}

fn print_report(report: &SyncReport) {
    if report.is_noop() {
        println!("Already in sync.");
        return;
    }
    println!(
        "From remote: {} created, {} updated, {} deleted, {} conflict(s), {} error(s)",
        report.from_remote.created,
        report.from_remote.updated,
        report.from_remote.deleted,
        report.from_remote.conflicts,
        report.from_remote.errors,
    );
    println!(
        "To remote:   {} created, {} updated, {} error(s)",
        report.to_remote.created, report.to_remote.updated, report.to_remote.errors,
    );
}

fn parse_range(from: Option<&str>, to: Option<&str>) -> Result<Option<DateRange>> {
    if from.is_none() && to.is_none() {
        return Ok(None);
    }
    let default = DateRange::around(Utc::now());
    let start = match from {
        Some(s) => parse_day(s)?,
        None => default.start,
    };
    let end = match to {
        Some(s) => parse_day(s)?,
        None => default.end,
    };
    Ok(Some(DateRange::new(start, end)))
}

/// Parse YYYY-MM-DD as start of day in UTC
fn parse_day(s: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s))?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .context("invalid time of day")?
        .and_utc())
}
