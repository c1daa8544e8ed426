// ===============================
// src/main.rs
// ===============================
/*
 # rules yang aktif
curl -s localhost:9899/metrics | grep '^config_rule'

# aktivitas ledger & kesehatan oracle
curl -s localhost:9899/metrics | egrep '^(trades_|rejections_total|status_transitions_total)'
curl -s localhost:9899/metrics | grep '^oracle_requests_total'

*/
/*
=============================================================================
Project : crucible_ledger — prop-trading challenge ledger & rule engine
Module  : main.rs
Version : 0.1.0
License : MIT

Summary : Tracks simulated challenge accounts (balance, positions, peak
          equity), enforces drawdown / position-size / daily-cap /
          inactivity rules, prices tokens via Jupiter/DexScreener (or mock),
          persists to SQLite, exposes Prometheus metrics, records JSONL
          events.
=============================================================================
*/
mod config;
mod console;
mod domain;
mod ledger;
mod metrics;
mod notifier;
mod oracle;
mod oracle_http;      // Jupiter + DexScreener (live mode)
mod positions;
mod recorder;
mod rules;
mod store;
mod sweeper;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::{sync::mpsc, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::OracleMode;
use crate::domain::{Event, StatusChange};
use crate::ledger::ChallengeLedger;
use crate::oracle::{FallbackOracle, MockOracle, PriceOracle};
use crate::oracle_http::{DexScreenerOracle, JupiterOracle};
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config & rules ----
    let cli = config::Cli::parse();
    let (args, rules) = config::load(&cli);

    // ---- Metrics ----
    metrics::init();
    metrics::export_rules(&rules);
    metrics::serve_metrics(args.metrics_port);

    info!(
        db = %args.db_path,
        oracle_mode = %args.oracle_mode.as_str(),
        max_drawdown_pct = rules.max_drawdown_pct,
        max_position_pct = rules.max_position_pct,
        cash_buffer_pct = rules.cash_buffer_pct,
        max_trades_per_day = rules.max_trades_per_day,
        inactivity_hours = rules.inactivity_timeout.num_hours(),
        buy_cooldown_secs = rules.buy_cooldown.num_seconds(),
        tiers = ?args.tiers.iter().map(|t| t.fee).collect::<Vec<_>>(),
        sweep_every_secs = args.sweep_interval_secs,
        "startup config"
    );

    // ---- Storage ----
    let store = Arc::new(
        Store::open(&args.db_path).with_context(|| format!("open store {}", args.db_path))?,
    );

    // ---- Oracle ----
    let oracle_timeout = Duration::from_millis(args.oracle_timeout_ms);
    let oracle: Arc<dyn PriceOracle> = match args.oracle_mode {
        OracleMode::Mock => Arc::new(MockOracle::random_walk(300)),
        OracleMode::Live => {
            let http = reqwest::Client::builder()
                .timeout(oracle_timeout)
                .build()
                .context("build http client")?;
            Arc::new(FallbackOracle::new(
                vec![
                    // Jupiter duluan: paling cepat untuk token baru
                    Box::new(JupiterOracle::new(http.clone(), args.jupiter_price_url.clone()))
                        as Box<dyn PriceOracle>,
                    Box::new(DexScreenerOracle::new(http, args.dexscreener_url.clone())),
                ],
                oracle_timeout,
            ))
        }
    };

    // ---- Buses ----
    let (notify_tx, notify_rx) = mpsc::channel::<StatusChange>(1024);
    tokio::spawn(notifier::run(notify_rx));

    let mut ledger = ChallengeLedger::new(rules, store, oracle, oracle_timeout)
        .with_tiers(args.tiers.clone())
        .with_notifier(notify_tx);

    // ---- Recorder (optional) ----
    if let Some(path) = args.record_file.clone() {
        let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
        tokio::spawn(recorder::run(rec_rx, path));
        let _ = rec_tx.try_send(Event::Note("ledger started".into()));
        ledger = ledger.with_recorder(rec_tx);
    }
    let ledger = Arc::new(ledger);

    // ---- Inactivity sweep ----
    tokio::spawn(sweeper::run(
        ledger.clone(),
        Duration::from_secs(args.sweep_interval_secs),
    ));

    // ---- Console (optional) / wait for shutdown ----
    if args.console {
        tokio::select! {
            res = console::run(ledger.clone(), args.quick_amounts.clone()) => res?,
            _ = tokio::signal::ctrl_c() => info!("ctrl-c"),
        }
    } else {
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
        info!("ctrl-c");
    }

    info!("shutdown");
    Ok(())
}
