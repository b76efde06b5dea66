// ============================================================================
// fieldsync - CLI for the field technician offline store
// ============================================================================
// Usage:
//   fieldsync stats                               Show local store statistics
//   fieldsync visits [--technician ID]            List cached visits
//   fieldsync pending                             Show queued work
//   fieldsync login --token T [--technician-id]   Store a session
//   fieldsync sync                                Drain the queues now
//   fieldsync refresh                             Refresh the visit list
//   fieldsync watch                               Run the sync loop until Ctrl-C
//   fieldsync tiles download --north ...          Cache map tiles for an area
//   fieldsync export --format json                Export the store as JSON
//   fieldsync prune --older-than 30               Prune old synced reports
// ============================================================================

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use fieldsync_core::{
    Bounds, ConnectivityEvent, DrainOutcome, FieldSync, LocalStore, RefreshOutcome, Session,
    SyncConfig, VisitRecord,
};
use tokio::sync::mpsc;
use tracing::info;

/// Field technician offline store tool
#[derive(Parser)]
#[command(name = "fieldsync", version, about = "Inspect and sync the field technician offline store")]
struct Cli {
    /// Path to the database file (default: ~/.fieldsync/fieldsync.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Base URL of the visit API
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store statistics (visits, ledger, queues, assets)
    Stats,

    /// List cached visits, completed ones excluded
    Visits {
        /// Only visits of this technician
        #[arg(long)]
        technician: Option<String>,
    },

    /// Show work waiting to be synced
    Pending,

    /// List visits completed on this device
    Ledger,

    /// Store a session token
    Login {
        #[arg(long)]
        token: String,

        #[arg(long)]
        technician_id: Option<String>,

        #[arg(long)]
        name: Option<String>,
    },

    /// Forget the stored session
    Logout,

    /// Push queued reports, photos, NAP records and requests
    Sync,

    /// Refresh the visit list from the server
    Refresh,

    /// Keep syncing on a poll interval until Ctrl-C
    Watch,

    /// Map tile cache
    Tiles {
        #[command(subcommand)]
        command: TileCommands,
    },

    /// Export store contents as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Prune synced reports
    Prune {
        /// Delete synced reports older than this many days
        #[arg(long)]
        older_than: Option<u32>,

        /// Show what would be pruned without actually deleting
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum TileCommands {
    /// Cached tile count and estimated size
    Info,

    /// Delete every cached tile
    Clear,

    /// Download the tiles covering an area
    Download {
        #[arg(long, allow_hyphen_values = true)]
        north: f64,
        #[arg(long, allow_hyphen_values = true)]
        south: f64,
        #[arg(long, allow_hyphen_values = true)]
        east: f64,
        #[arg(long, allow_hyphen_values = true)]
        west: f64,
    },
}

fn format_timestamp(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ms))
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fieldsync=info".parse()?)
                .add_directive("fieldsync_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::default();
    if let Some(path) = cli.db_path {
        config.db_path = Some(path);
    }
    if let Some(url) = cli.api_url {
        config.api_url = url;
    }
    if let Commands::Prune {
        older_than: Some(days),
        ..
    } = &cli.command
    {
        config.retention_days = *days;
    }

    let service = FieldSync::open(config)?;

    match cli.command {
        Commands::Stats => cmd_stats(&service).await,
        Commands::Visits { technician } => cmd_visits(&service, technician).await,
        Commands::Pending => cmd_pending(&service).await,
        Commands::Ledger => cmd_ledger(&service).await,
        Commands::Login {
            token,
            technician_id,
            name,
        } => {
            let session = Session {
                token,
                technician_id,
                technician_name: name,
            };
            service.sign_in(&session).await?;
            println!("Session stored");
            Ok(())
        }
        Commands::Logout => {
            if service.sign_out().await? {
                println!("Session cleared");
            } else {
                println!("No session stored");
            }
            Ok(())
        }
        Commands::Sync => cmd_sync(&service).await,
        Commands::Refresh => cmd_refresh(&service).await,
        Commands::Watch => cmd_watch(&service).await,
        Commands::Tiles { command } => cmd_tiles(&service, command).await,
        Commands::Export { format } => cmd_export(&service, &format).await,
        Commands::Prune { dry_run, .. } => cmd_prune(&service, dry_run).await,
    }
}

async fn require_store(service: &FieldSync) -> Result<std::sync::Arc<LocalStore>> {
    service
        .store()
        .await
        .ok_or_else(|| anyhow::anyhow!("Local store unavailable"))
}

async fn cmd_stats(service: &FieldSync) -> Result<()> {
    let store = require_store(service).await?;
    let stats = store.stats()?;

    println!("=== FieldSync Store Stats ===");
    println!("Database: {}", store.path().display());
    println!();
    println!("Visits:    {} cached", stats.visits);
    for (status, count) in &stats.visit_counts {
        println!("  {:12} {}", status, count);
    }
    println!("Completed: {} (ledger)", stats.completed);
    println!(
        "Reports:   {} pending, {} synced",
        stats.pending_reports, stats.synced_reports
    );
    println!("Photos:    {} pending", stats.pending_photos);
    println!("NAP boxes: {} pending", stats.pending_naps);
    println!("Requests:  {} queued", stats.pending_requests);
    println!("PDFs:      {}", stats.pdfs);
    println!("Tiles:     {}", stats.tiles);

    Ok(())
}

fn print_visits(visits: &[VisitRecord]) {
    if visits.is_empty() {
        println!("No visits found.");
        return;
    }

    println!(
        "{:<8}  {:<12}  {:<10}  {:<24}  {}",
        "ID", "STATUS", "TECHNICIAN", "CLIENT", "REASON"
    );
    println!("{}", "-".repeat(90));

    for visit in visits {
        let client = visit.client_name.chars().take(24).collect::<String>();
        let reason = visit.reason.chars().take(30).collect::<String>();
        println!(
            "{:<8}  {:<12}  {:<10}  {:<24}  {}",
            visit.id,
            visit.status.as_str(),
            visit.technician_id.as_deref().unwrap_or("-"),
            client,
            reason
        );
    }

    println!("\nTotal: {} visits", visits.len());
}

async fn cmd_visits(service: &FieldSync, technician: Option<String>) -> Result<()> {
    let visits = match technician {
        Some(id) => {
            let store = require_store(service).await?;
            let exclusions = fieldsync_core::reconcile::ExclusionSets::load(&store)?;
            fieldsync_core::reconcile::filter_visits(store.list_visits(Some(id.as_str()))?, &exclusions)
        }
        None => service.cached_visits().await,
    };
    print_visits(&visits);
    Ok(())
}

async fn cmd_pending(service: &FieldSync) -> Result<()> {
    let summary = service.pending_summary().await?;
    println!("Requests:  {}", summary.requests);
    println!("Reports:   {}", summary.reports);
    println!("Photos:    {}", summary.photos);
    println!("NAP boxes: {}", summary.naps);
    println!("Total:     {}", summary.total());
    Ok(())
}

async fn cmd_ledger(service: &FieldSync) -> Result<()> {
    let store = require_store(service).await?;
    let completed = store.list_completed()?;
    if completed.is_empty() {
        println!("No visits completed on this device.");
        return Ok(());
    }

    println!("{:<8}  {:<22}  {}", "VISIT", "COMPLETED AT", "TECHNICIAN");
    println!("{}", "-".repeat(50));
    for entry in &completed {
        println!(
            "{:<8}  {:<22}  {}",
            entry.visit_id,
            format_timestamp(entry.completed_at),
            entry.technician_id.as_deref().unwrap_or("-")
        );
    }
    println!("\nTotal: {} visits", completed.len());
    Ok(())
}

async fn cmd_sync(service: &FieldSync) -> Result<()> {
    // A one-shot command has no platform events; assume the network is up.
    service.monitor().apply(ConnectivityEvent::Online);

    match service.drain().await {
        DrainOutcome::Completed(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            println!(
                "\nSynced {} items, {} failed",
                report.succeeded(),
                report.failed()
            );
            if report.auth_rejected {
                println!("Session rejected by the server; log in again.");
            }
        }
        DrainOutcome::AlreadyRunning => println!("A sync is already running"),
        DrainOutcome::Offline => println!("Offline, nothing sent"),
        DrainOutcome::StoreUnavailable => anyhow::bail!("Local store unavailable"),
    }
    Ok(())
}

async fn cmd_refresh(service: &FieldSync) -> Result<()> {
    service.monitor().apply(ConnectivityEvent::Online);

    match service.refresh_visits(false).await {
        RefreshOutcome::Updated(visits) => print_visits(&visits),
        RefreshOutcome::Unchanged => {
            println!("Visit list unchanged");
            print_visits(&service.cached_visits().await);
        }
        RefreshOutcome::Cached { visits, reason } => {
            println!("Showing cached visits ({})", reason);
            print_visits(&visits);
        }
        RefreshOutcome::SignedOut => anyhow::bail!("Not logged in; run `fieldsync login` first"),
    }
    Ok(())
}

async fn cmd_watch(service: &FieldSync) -> Result<()> {
    let (events, rx) = mpsc::channel(16);
    events.send(ConnectivityEvent::Online).await?;

    info!(
        "Watching (poll every {}s), Ctrl-C to stop",
        service.config().poll_interval.as_secs()
    );
    service
        .run(rx, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    Ok(())
}

async fn cmd_tiles(service: &FieldSync, command: TileCommands) -> Result<()> {
    let assets = service.assets();
    match command {
        TileCommands::Info => {
            let info = assets.storage_info().await?;
            println!("Tiles: {}", info.tiles);
            println!(
                "Estimated size: {:.1} MB",
                info.estimated_tile_bytes as f64 / (1024.0 * 1024.0)
            );
            println!("PDFs: {}", info.pdfs);
        }
        TileCommands::Clear => {
            let removed = assets.clear_tiles().await?;
            println!("Removed {} tiles", removed);
        }
        TileCommands::Download {
            north,
            south,
            east,
            west,
        } => {
            let bounds = Bounds::new(north, south, east, west)?;
            let (count, bytes) = assets.estimate(&bounds);
            if count > assets.max_tiles() {
                anyhow::bail!(
                    "Area covers {} tiles, more than the limit of {}. Pick a smaller area or raise FIELDSYNC_TILE_MAX.",
                    count,
                    assets.max_tiles()
                );
            }
            println!(
                "Downloading up to {} tiles (~{:.1} MB) for zooms {:?}",
                count,
                bytes as f64 / (1024.0 * 1024.0),
                assets.zooms()
            );
            let tally = assets.download_tiles(&bounds).await?;
            println!("{}", serde_json::to_string_pretty(&tally)?);
        }
    }
    Ok(())
}

async fn cmd_export(service: &FieldSync, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let store = require_store(service).await?;
    let photos: Vec<_> = store
        .list_photos()?
        .into_iter()
        .map(|p| {
            serde_json::json!({
                "local_id": p.local_id,
                "report": p.report,
                "file_name": p.file_name,
                "mime_type": p.mime_type,
                "bytes": p.data.len(),
                "synced": p.synced,
                "created_at": p.created_at,
            })
        })
        .collect();

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": store.stats()?,
        "technician_id": store.session()?.and_then(|s| s.technician_id),
        "visits": store.list_visits(None)?,
        "completed": store.list_completed()?,
        "reports": store.list_reports()?,
        "photos": photos,
        "naps": store.list_naps()?,
        "requests": store.list_requests()?,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

async fn cmd_prune(service: &FieldSync, dry_run: bool) -> Result<()> {
    let days = service.config().retention_days;
    if dry_run {
        println!("=== DRY RUN: no data will be deleted ===\n");

        let store = require_store(service).await?;
        let cutoff = Utc::now().timestamp_millis() - i64::from(days) * 86_400_000;
        let pruneable: Vec<_> = store
            .list_reports()?
            .into_iter()
            .filter(|r| r.synced && r.created_at < cutoff)
            .collect();

        println!(
            "Would prune {} synced reports older than {} days",
            pruneable.len(),
            days
        );
        for report in &pruneable {
            println!(
                "  - report {} for visit {} (created: {})",
                report.local_id,
                report.visit_id,
                format_timestamp(report.created_at)
            );
        }
    } else {
        let pruned = service.prune().await?;
        println!("Pruned {} synced reports (older than {} days)", pruned, days);
    }

    Ok(())
}
