// =============================================================================
// Meridian — automated trading supervisor for Binance spot + USDT-M futures
// =============================================================================

mod app;
mod config;
mod data;
mod exchange;
mod execution;
mod handler;
mod indicators;
mod llm;
mod loan_guardian;
mod orderflow;
mod reconcile;
mod risk;
mod sink;
mod strategy;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::exchange::futures::FuturesClient;
use crate::exchange::spot::SpotClient;
use crate::llm::client::LlmClient;
use crate::loan_guardian::LoanGuardian;
use crate::sink::Sink;
use crate::types::TradingMode;

#[derive(Parser)]
#[command(name = "meridian-bot", about = "Automated trading supervisor", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the cycle-driven trading supervisor.
    Run {
        /// Config file path (default: config.yaml).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Start the WebSocket-driven async variant.
    RunAsync {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show spot account balances.
    Balance,
    /// Show the futures margin account.
    FuturesBalance {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show ongoing flexible loans.
    Loan,
    /// Monitor loan LTV and rebalance collateral.
    LoanGuard {
        /// Target LTV after rebalancing.
        #[arg(long, default_value_t = 0.65)]
        warn: f64,
        /// Danger LTV — triggers collateral buying.
        #[arg(long, default_value_t = 0.75)]
        danger: f64,
        /// Low LTV — triggers profit-taking.
        #[arg(long, default_value_t = 0.40)]
        low: f64,
        /// Check interval in seconds.
        #[arg(long, default_value_t = 60)]
        interval: u64,
        /// Log intended actions without executing them.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate the configuration and exit.
    Validate {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Push the local config file to the sink as a new version.
    ConfigPush {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Change note stored with the version.
        #[arg(long, default_value = "")]
        note: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match dispatch(cli.command).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run { config } => {
            let mut bot = app::TradingBot::new(config.as_deref()).await?;
            bot.run().await
        }
        Command::RunAsync { config } => app::run_async(config.as_deref()).await,
        Command::Balance => cmd_balance().await,
        Command::FuturesBalance { config } => cmd_futures_balance(config).await,
        Command::Loan => cmd_loan().await,
        Command::LoanGuard {
            warn,
            danger,
            low,
            interval,
            dry_run,
            config,
        } => cmd_loan_guard(warn, danger, low, interval, dry_run, config).await,
        Command::Validate { config } => cmd_validate(config),
        Command::ConfigPush { config, note } => cmd_config_push(config, &note).await,
    }
}

async fn cmd_balance() -> anyhow::Result<()> {
    let settings = Settings::load(None)?;
    let client = SpotClient::new(&settings.exchange, true);
    let balances = client.get_balance().await?;

    let mut rows: Vec<(&String, &f64)> = balances.iter().collect();
    rows.sort_by(|a, b| a.0.cmp(b.0));
    println!("{:<10} {:>18}", "asset", "free");
    for (asset, free) in rows {
        println!("{asset:<10} {free:>18.8}");
    }
    Ok(())
}

async fn cmd_futures_balance(config: Option<PathBuf>) -> anyhow::Result<()> {
    let settings = Settings::load(config.as_deref())?;
    let client = FuturesClient::new(&settings.exchange, &settings.futures);
    let balance = client.get_futures_balance().await?;
    let margin_ratio = client.get_margin_ratio().await?;

    println!("wallet balance:    {:>14.2} USDT", balance.total_wallet_balance);
    println!("available balance: {:>14.2} USDT", balance.available_balance);
    println!("unrealized PnL:    {:>14.2} USDT", balance.total_unrealized_pnl);
    println!("margin balance:    {:>14.2} USDT", balance.total_margin_balance);
    println!("margin ratio:      {:>13.1}%", margin_ratio * 100.0);
    Ok(())
}

async fn cmd_loan() -> anyhow::Result<()> {
    let settings = Settings::load(None)?;
    let client = SpotClient::new(&settings.exchange, true);
    let orders = client.fetch_loan_ongoing_orders(20).await?;
    if orders.is_empty() {
        println!("no ongoing loans");
        return Ok(());
    }
    for o in orders {
        println!(
            "{} -> {}: debt {} | collateral {} | LTV {}",
            o["collateralCoin"].as_str().unwrap_or("?"),
            o["loanCoin"].as_str().unwrap_or("?"),
            o["totalDebt"].as_str().unwrap_or("0"),
            o["collateralAmount"].as_str().unwrap_or("0"),
            o["currentLTV"].as_str().unwrap_or("0"),
        );
    }
    Ok(())
}

async fn cmd_loan_guard(
    warn: f64,
    danger: f64,
    low: f64,
    interval: u64,
    dry_run: bool,
    config: Option<PathBuf>,
) -> anyhow::Result<()> {
    let settings = Settings::load(config.as_deref())?;
    let sink = Arc::new(Sink::from_env());
    let client = Arc::new(SpotClient::new(&settings.exchange, true));

    let guard_config = crate::config::LoanGuardConfig {
        enabled: true,
        target_ltv: warn,
        danger_ltv: danger,
        low_ltv: low,
        dry_run,
    };
    let mut guardian = LoanGuardian::new(
        client,
        sink,
        LlmClient::new(&settings.llm),
        guard_config,
    );

    info!(
        target_ltv = warn,
        danger_ltv = danger,
        low_ltv = low,
        interval,
        dry_run,
        "loan guardian monitoring"
    );
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("loan guardian stopped");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(e) = guardian.check().await {
                    error!(error = %e, "loan check failed");
                }
            }
        }
    }
}

fn cmd_validate(config: Option<PathBuf>) -> anyhow::Result<()> {
    let settings = Settings::load(config.as_deref())?;
    println!("configuration OK");
    println!("  spot pairs:      {:?}", settings.spot.pairs);
    println!("  spot mode:       {}", settings.spot.mode);
    println!("  futures enabled: {}", settings.futures.enabled);
    if settings.futures.enabled {
        println!("  futures pairs:   {:?}", settings.futures.pairs);
        println!("  leverage:        {}x", settings.futures.leverage);
        if settings.futures.mode == TradingMode::Live {
            println!("  WARNING: futures mode is LIVE");
        }
    }
    println!("  strategies:      {:?}", settings
        .strategies
        .iter()
        .map(|s| format!("{} ({})", s.name, s.timeframe))
        .collect::<Vec<_>>());
    println!("  llm enabled:     {}", settings.llm.enabled);
    Ok(())
}

async fn cmd_config_push(config: Option<PathBuf>, note: &str) -> anyhow::Result<()> {
    // Validate before pushing — a broken config must never reach the sink.
    let path = config
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    Settings::load(config.as_deref())?;

    let raw = std::fs::read_to_string(&path)?;
    let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)?;
    let json = serde_json::to_value(&yaml)?;

    let sink = Sink::from_env();
    if !sink.enabled() {
        anyhow::bail!("sink not configured (SINK_URL / SINK_SERVICE_KEY)");
    }
    sink.push_config(json, note).await;
    println!("config pushed ({})", path.display());
    Ok(())
}
