//! copyguard: master/follower trade replication.
//!
//! Replicates master fills proportionally onto follower accounts, serializes
//! and identifies every exchange call per account, and protects every open
//! position with stop-loss, profit-target, trailing and time exits.

mod bot;
mod config;
mod db;
mod error;
mod exchange;
mod metrics;
mod models;
mod shutdown;
mod trading;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal_macros::dec;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::bot::Bot;
use crate::config::EngineConfig;
use crate::db::Database;
use crate::models::PositionState;

/// Copy-trading engine CLI.
#[derive(Parser)]
#[command(name = "copyguard")]
#[command(about = "Replicate master trades onto follower accounts with protective exits", long_about = None)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true, default_value = "copyguard.json", env = "COPYGUARD_CONFIG")]
    config: PathBuf,

    /// Database URL, overriding the configuration file
    #[arg(short, long, global = true)]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine
    Run {
        /// Trade against simulated paper accounts
        #[arg(long)]
        dry_run: bool,

        /// Read master orders and operator commands (reset_health,
        /// emergency_close) as JSON lines from stdin
        #[arg(long)]
        stdin_orders: bool,
    },

    /// Show persisted identifiers, positions and recent replication outcomes
    Status {
        /// Number of recent outcomes to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = EngineConfig::load(&cli.config)?;
    if let Some(database) = cli.database {
        config.database_url = database;
    }

    match cli.command {
        Commands::Run {
            dry_run,
            stdin_orders,
        } => {
            let dry_run = dry_run || config.engine.dry_run;
            info!(
                config = %cli.config.display(),
                accounts = config.accounts.len(),
                dry_run,
                "Starting copyguard"
            );

            let bot = Bot::new(config, dry_run).await?;
            bot.run(stdin_orders).await?;
        }

        Commands::Status { limit } => {
            let db = Database::new(&config.database_url)
                .await
                .with_context(|| format!("Failed to open database {}", config.database_url))?;
            print_status(&db, limit).await?;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);

            println!("\n=== Accounts ===");
            for account in &config.accounts {
                let limits = config.limits_for(&account.exchange);
                println!(
                    "  {:<16} {:<9} {:<12} tier: {:<12} min notional: {}",
                    truncate(&account.id, 16),
                    account.role.as_str(),
                    truncate(&account.exchange, 12),
                    account.tier.map(|t| t.as_str()).unwrap_or("by balance"),
                    limits.min_order_notional
                );
            }

            println!("\nExit Rules:");
            println!("  Stop Loss:            {}%", config.exit.stop_loss_pct * dec!(100));
            for (i, target) in config.exit.profit_targets.iter().enumerate() {
                println!(
                    "  Profit Target {}:      +{}% closes {}%",
                    i + 1,
                    target.gain_pct * dec!(100),
                    target.fraction * dec!(100)
                );
            }
            println!(
                "  Trailing Stop:        arms at +{}%, trails {}%",
                config.exit.trailing_activation_pct * dec!(100),
                config.exit.trailing_distance_pct * dec!(100)
            );
            println!(
                "  Max Hold:             {}h ({}h while losing)",
                config.exit.max_hold_secs / 3600,
                config.exit.loss_max_hold_secs / 3600
            );
        }
    }

    Ok(())
}

async fn print_status(db: &Database, limit: i64) -> Result<()> {
    let nonces = db.all_nonces().await?;
    let positions = db.all_positions().await?;
    let outcomes = db.recent_outcomes(limit).await?;

    println!("\n=== Call Identifiers ===");
    if nonces.is_empty() {
        println!("No calls issued yet.");
    }
    for nonce in &nonces {
        println!(
            "  {:<24} {:>20}   (updated {})",
            truncate(&nonce.account_id, 24),
            nonce.last_nonce,
            nonce.updated_at
        );
    }

    let (failed, open): (Vec<_>, Vec<_>) = positions
        .iter()
        .filter(|p| p.state != PositionState::Closed)
        .partition(|p| p.state == PositionState::ExitFailed);

    println!("\n=== Open Positions ({}) ===", open.len());
    if !open.is_empty() {
        println!(
            "{:<16} {:<12} {:<6} {:>14} {:>12} {:>12} {:<16}",
            "ACCOUNT", "SYMBOL", "SIDE", "QUANTITY", "ENTRY", "STOP", "STATE"
        );
        println!("{}", "-".repeat(94));
    }
    for pos in &open {
        println!(
            "{:<16} {:<12} {:<6} {:>14} {:>12} {:>12} {:<16}",
            truncate(pos.account_id.as_str(), 16),
            truncate(&pos.symbol, 12),
            pos.side.entry_side().as_str(),
            pos.quantity,
            pos.entry_price.round_dp(4),
            pos.stop_price.round_dp(4),
            pos.state.as_str()
        );
    }

    if !failed.is_empty() {
        println!("\n=== EXIT FAILED: operator attention required ({}) ===", failed.len());
        for pos in &failed {
            println!(
                "  {} {} qty {} @ {} : {}",
                pos.account_id,
                pos.symbol,
                pos.quantity,
                pos.entry_price.round_dp(4),
                pos.exit_failure.as_deref().unwrap_or("unknown failure")
            );
        }
    }

    println!("\n=== Recent Replication Outcomes ===");
    if outcomes.is_empty() {
        println!("No signals replicated yet.");
        return Ok(());
    }
    println!(
        "{:<14} {:<20} {:<16} {:<12} {:<5} {:>14} {:<8} {:<24}",
        "TIME", "ORDER", "FOLLOWER", "SYMBOL", "SIDE", "SIZE", "STATUS", "DETAIL"
    );
    println!("{}", "-".repeat(120));
    for outcome in &outcomes {
        let detail = match outcome.result() {
            Some(models::ReplicationResult::Skipped { reason }) => reason.to_string(),
            Some(models::ReplicationResult::Failed { error }) => error,
            Some(models::ReplicationResult::Filled { price, .. }) => format!("@ {}", price.round_dp(4)),
            None => outcome.detail.clone(),
        };
        let at = outcome
            .created()
            .map(|t| t.format("%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "{:<14} {:<20} {:<16} {:<12} {:<5} {:>14} {:<8} {:<24}",
            at,
            truncate(&outcome.order_id, 20),
            truncate(&outcome.follower_id, 16),
            truncate(&outcome.symbol, 12),
            outcome.side,
            outcome.size(),
            outcome.status,
            truncate(&detail, 24)
        );
    }

    Ok(())
}

/// Truncate a string for table display.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
