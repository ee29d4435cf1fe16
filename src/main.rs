use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use windtrader::backtest;
use windtrader::config::EngineConfig;
use windtrader::types::{Candle, Signal, Sym, TickStyle};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TickStyleArg {
    Close,
    OhlcPath,
}

impl From<TickStyleArg> for TickStyle {
    fn from(arg: TickStyleArg) -> Self {
        match arg {
            TickStyleArg::Close => TickStyle::Close,
            TickStyleArg::OhlcPath => TickStyle::OhlcPath,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay historical candles and signals through the engine
    Backtest {
        /// Instrument key the candles belong to
        #[arg(long)]
        sym: String,

        /// JSON array of candles: [{"t":..,"o":..,"h":..,"l":..,"c":..}]
        #[arg(long)]
        candles: PathBuf,

        /// JSON array of signals
        #[arg(long)]
        signals: PathBuf,

        /// Engine config JSON; defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured candle→tick conversion
        #[arg(long, value_enum)]
        tick_style: Option<TickStyleArg>,
    },
    /// Evaluate the market-hours gate
    Hours {
        /// RFC3339 timestamp; defaults to now
        #[arg(long)]
        at: Option<String>,

        /// Engine config JSON; defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(EngineConfig::default()),
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("windtrader=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Backtest {
            sym,
            candles,
            signals,
            config,
            tick_style,
        } => run_backtest(sym, candles, signals, config, tick_style),
        Command::Hours { at, config } => run_hours(at, config),
    }
}

fn run_backtest(
    sym: String,
    candles_path: PathBuf,
    signals_path: PathBuf,
    config_path: Option<PathBuf>,
    tick_style: Option<TickStyleArg>,
) -> Result<()> {
    let mut cfg = load_config(config_path.as_ref())?;
    if let Some(style) = tick_style {
        cfg.tick_style = style.into();
    }
    // backtest timestamps are historical, so the gate is evaluated by the
    // virtual clock; signals outside the session are still ignored unless
    // the config allows after-hours trading

    let candles: Vec<Candle> = serde_json::from_str(
        &fs::read_to_string(&candles_path)
            .with_context(|| format!("reading {}", candles_path.display()))?,
    )
    .context("parsing candles")?;
    let signals: Vec<Signal> = serde_json::from_str(
        &fs::read_to_string(&signals_path)
            .with_context(|| format!("reading {}", signals_path.display()))?,
    )
    .context("parsing signals")?;

    let sym = Sym::new(sym);
    info!(%sym, candles = candles.len(), signals = signals.len(), "starting backtest");
    let report = backtest::run(cfg, &sym, &candles, signals)?;

    println!("\n═══════════════════════════════════════════════════════════");
    println!("              BACKTEST RESULTS                              ");
    println!("═══════════════════════════════════════════════════════════\n");
    println!("Ticks Processed:   {}", report.ticks);
    println!("Signals:           {}", report.signals);
    println!("Fills:             {}", report.trades.len());
    println!();
    println!("Realized (gross):  {:.2}", report.pnl.realized_gross);
    println!("Brokerage:         {:.2}", report.pnl.brokerage);
    println!("Realized (net):    {:.2}", report.pnl.realized_net);
    println!("Unrealized:        {:.2}", report.pnl.unrealized);
    println!("Total P&L:         {:.2}", report.pnl.total);

    if !report.trades.is_empty() {
        println!("\n{:<14} {:<5} {:>6} {:>10} {:>12}  TAG", "TS(ms)", "SIDE", "QTY", "PRICE", "REALIZED");
        for trade in &report.trades {
            println!(
                "{:<14} {:<5} {:>6} {:>10.2} {:>12.2}  {}",
                trade.ts_ms, trade.side, trade.qty, trade.price, trade.realized_delta, trade.tag
            );
        }
    }
    Ok(())
}

fn run_hours(at: Option<String>, config_path: Option<PathBuf>) -> Result<()> {
    let cfg = load_config(config_path.as_ref())?;
    let hours = cfg.market_hours()?;
    let at: DateTime<Utc> = match at {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .with_context(|| format!("parsing --at {raw:?}"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    let open = hours.is_open(at);
    println!(
        "{} in {} -> {}",
        at.with_timezone(&hours.tz).format("%Y-%m-%d %H:%M:%S %Z"),
        cfg.market_tz,
        if open { "OPEN" } else { "CLOSED" }
    );
    Ok(())
}
