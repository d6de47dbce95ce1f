use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use swingbot::backtest::{self, monte_carlo, sweep, BacktestConfig};
use swingbot::config::{EngineConfig, PresetRecord, StrategyParams, TrailingTrigger};
use swingbot::data::{self, CandleAggregator};
use swingbot::engine::live::{event_channel, EngineEvent, LiveEngine};
use swingbot::gateway::PaperGateway;
use swingbot::types::Timeframe;

#[derive(Parser, Debug)]
#[command(author, version, about = "W/M reversal trading engine")]
struct Args {
    /// Preset file with strategy and engine configuration
    #[arg(short, long, env = "SWINGBOT_PRESET")]
    preset: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a candle history and print performance
    Backtest {
        /// OHLCV CSV file (timestamp_ms,open,high,low,close,volume)
        #[arg(short, long)]
        data: PathBuf,

        /// Base timeframe of the data
        #[arg(short, long, default_value = "15m")]
        timeframe: String,

        /// Starting capital
        #[arg(short, long, default_value = "10000")]
        capital: f64,

        /// Monte Carlo iterations over the trade sequence (0 disables)
        #[arg(long, default_value = "1000")]
        monte_carlo: usize,
    },
    /// Grid-sweep stop and trailing parameters over a candle history
    Sweep {
        #[arg(short, long)]
        data: PathBuf,

        #[arg(short, long, default_value = "15m")]
        timeframe: String,

        /// How many top results to print
        #[arg(long, default_value = "10")]
        top: usize,
    },
    /// Paper-trade the live engine against a replayed tick feed
    Live {
        /// OHLCV CSV file used as the tick source
        #[arg(short, long)]
        data: PathBuf,

        #[arg(short, long, default_value = "15m")]
        timeframe: String,

        #[arg(short, long, default_value = "10000")]
        capital: f64,

        /// Candles reserved for history seeding before replay starts
        #[arg(long, default_value = "400")]
        seed: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("swingbot=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let (params, mut engine_cfg) = match &args.preset {
        Some(path) => {
            let preset = PresetRecord::load(path)?;
            info!(preset = %preset.name, "preset loaded");
            (preset.params, preset.engine)
        }
        None => (StrategyParams::default(), EngineConfig::default()),
    };

    match args.command {
        Command::Backtest {
            data,
            timeframe,
            capital,
            monte_carlo: mc_iterations,
        } => {
            engine_cfg.timeframe = parse_timeframe(&timeframe)?;
            let series = data::load_csv(&data, engine_cfg.timeframe)?;
            let bt_cfg = BacktestConfig {
                starting_capital: capital,
                ..Default::default()
            };

            let report = backtest::run(&params, &engine_cfg, &bt_cfg, &series)?;
            print_summary(&report.summary, report.final_equity);

            if let Some(position) = &report.open_position {
                warn!(
                    direction = %position.direction,
                    entry = position.entry_price,
                    "position still open at end of data (not counted)"
                );
            }

            if mc_iterations > 0 {
                let pnls: Vec<f64> = report.trades.iter().map(|t| t.pnl_percent).collect();
                if let Some(stats) = monte_carlo::run(&pnls, capital, mc_iterations, 42) {
                    println!(
                        "\nMonte Carlo ({} shuffles): median DD {:.1}% | p95 DD {:.1}% | worst equity ${:.2}",
                        stats.iterations,
                        stats.median_max_drawdown_pct,
                        stats.p95_max_drawdown_pct,
                        stats.worst_final_equity
                    );
                }
            }
        }

        Command::Sweep {
            data,
            timeframe,
            top,
        } => {
            engine_cfg.timeframe = parse_timeframe(&timeframe)?;
            let series = data::load_csv(&data, engine_cfg.timeframe)?;
            let results = sweep::run_sweep(
                &params,
                &engine_cfg,
                &BacktestConfig::default(),
                &series,
                sweep::default_grid(),
            )?;

            println!(
                "{:<10} {:<8} {:<8} {:<8} {:>8} {:>8} {:>10} {:>8}",
                "atr_mult", "start_r", "dist_r", "tol", "trades", "wr%", "pf", "pnl%"
            );
            for result in results.iter().take(top) {
                println!(
                    "{:<10} {:<8} {:<8} {:<8} {:>8} {:>8.1} {:>10.2} {:>8.1}",
                    result.params.atr_mult,
                    result.params.trail_start_r,
                    result.params.trail_dist_r,
                    result.params.pattern_tolerance,
                    result.summary.total_trades,
                    result.summary.win_rate,
                    result.summary.profit_factor,
                    result.summary.net_pnl_pct,
                );
            }
        }

        Command::Live {
            data,
            timeframe,
            capital,
            seed,
        } => {
            engine_cfg.timeframe = parse_timeframe(&timeframe)?;
            run_paper_live(params, engine_cfg, capital, &data, seed).await?;
        }
    }

    Ok(())
}

fn parse_timeframe(s: &str) -> Result<Timeframe> {
    Timeframe::parse(s).with_context(|| format!("unknown timeframe '{}'", s))
}

fn print_summary(summary: &backtest::Summary, final_equity: f64) {
    println!("Trades:        {}", summary.total_trades);
    println!(
        "Win rate:      {:.1}% ({}/{})",
        summary.win_rate, summary.wins, summary.losses
    );
    println!("Profit factor: {:.2}", summary.profit_factor);
    println!(
        "Net PnL:       ${:.2} ({:+.1}%)",
        summary.net_pnl, summary.net_pnl_pct
    );
    println!("Max drawdown:  {:.1}%", summary.max_drawdown_pct);
    println!("Sharpe:        {:.2}", summary.sharpe_ratio);
    println!("Final equity:  ${:.2}", final_equity);
}

/// Drive the live engine from a replayed CSV tick feed against the paper
/// venue. Exercises the exact live path: aggregation, channel delivery,
/// gateway fills, snapshots, reconciliation.
async fn run_paper_live(
    params: StrategyParams,
    engine_cfg: EngineConfig,
    capital: f64,
    data: &PathBuf,
    seed: usize,
) -> Result<()> {
    let series = data::load_csv(data, engine_cfg.timeframe)?;
    anyhow::ensure!(
        series.len() > seed,
        "need more than {} candles for seeding, have {}",
        seed,
        series.len()
    );

    let gateway = Arc::new(PaperGateway::new(capital).with_slippage(0.0006));
    let seed_candles = series.candles()[..seed].to_vec();
    if let Some(last) = seed_candles.last() {
        gateway.set_mark_price(last.close);
    }
    gateway.set_candle_history(seed_candles);

    let (tx, rx) = event_channel(256);
    let mut engine = LiveEngine::new(params, engine_cfg.clone(), capital, gateway.clone(), rx)?;
    engine.startup().await?;

    // Ctrl-C funnels through the same event channel as everything else
    let interrupt_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            let _ = interrupt_tx.send(EngineEvent::Shutdown).await;
        }
    });

    // Replay the remaining candles as ticks through the aggregator
    let replay: Vec<_> = series.candles()[seed..].to_vec();
    let timeframe = engine_cfg.timeframe;
    let per_tick = engine_cfg.trailing_trigger == TrailingTrigger::PerTick;
    let feed_gateway = gateway.clone();
    let feed = tokio::spawn(async move {
        let mut aggregator = CandleAggregator::new(timeframe);
        let step = timeframe.duration().num_seconds() / 4;
        for candle in replay {
            // Each historical candle becomes four ticks: O, H, L, C
            let ticks = [
                (candle.open_time, candle.open),
                (candle.open_time + chrono::Duration::seconds(step), candle.high),
                (candle.open_time + chrono::Duration::seconds(2 * step), candle.low),
                (candle.open_time + chrono::Duration::seconds(3 * step), candle.close),
            ];
            for (time, price) in ticks {
                feed_gateway.set_mark_price(price);
                if per_tick && tx.send(EngineEvent::PriceTick { price, time }).await.is_err() {
                    return;
                }
                if let Some(closed) = aggregator.on_tick(time, price, candle.volume / 4.0) {
                    if tx.send(EngineEvent::CandleClosed(closed)).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = tx.send(EngineEvent::Shutdown).await;
    });

    engine.run().await?;
    feed.abort();

    let core = engine.core();
    info!(
        state = %core.state(),
        realized = core.capital().cumulative_realized_pnl,
        "paper session finished"
    );
    Ok(())
}
