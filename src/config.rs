// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : crucible_ledger — prop-trading challenge ledger & rule engine
Module  : config.rs
Version : 0.1.0
License : MIT

Summary : Tracks simulated challenge accounts (balance, positions, peak
          equity), enforces drawdown / position-size / daily-cap /
          inactivity rules, prices tokens via Jupiter/DexScreener (or mock),
          persists to SQLite, exposes Prometheus metrics, records JSONL
          events.
=============================================================================
*/
use std::env;
use std::str::FromStr;

use clap::Parser;
use dotenvy::dotenv;
use tracing::warn;

use crate::domain::Tier;

/// Sumber harga token
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OracleMode {
    Mock,
    Live,
}

impl OracleMode {
    pub fn from_env(key: &str, default_mode: OracleMode) -> OracleMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" => OracleMode::Mock,
            "live" | "jupiter" => OracleMode::Live,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OracleMode::Mock => "mock",
            OracleMode::Live => "live",
        }
    }
}

/// Flag command line (override nilai dari ENV)
#[derive(Parser, Debug, Default)]
#[command(name = "crucible_ledger", about = "Prop-trading challenge ledger")]
pub struct Cli {
    /// SQLite file (override DB_PATH)
    #[arg(long)]
    pub db: Option<String>,
    /// JSONL event log (override RECORD_FILE)
    #[arg(long)]
    pub record_file: Option<String>,
    /// Jalankan operator console di stdin
    #[arg(long)]
    pub console: bool,
}

#[derive(Clone, Debug)]
pub struct Args {
    // storage / files / metrics
    pub db_path: String,
    pub record_file: Option<String>,
    pub metrics_port: u16,

    // oracle
    pub oracle_mode: OracleMode,
    pub jupiter_price_url: String,
    pub dexscreener_url: String,
    pub oracle_timeout_ms: u64,

    // background
    pub sweep_interval_secs: u64,
    pub console: bool,

    // product
    pub tiers: Vec<Tier>,
    pub quick_amounts: Vec<f64>,
}

/// Aturan challenge. Di-inject sekali ke ledger, bukan hard-code per call site.
#[derive(Clone, Debug, PartialEq)]
pub struct Rules {
    /// Percent (35.0 = 35%), diukur dari peak equity.
    pub max_drawdown_pct: f64,
    /// Fraction of start balance (0.30 = 30%).
    pub max_position_pct: f64,
    /// Fraction of start balance that must stay as cash after a buy.
    pub cash_buffer_pct: f64,
    pub max_trades_per_day: u32,
    pub inactivity_timeout: chrono::Duration,
    /// Jeda minimum antar buy per user (0 = nonaktif).
    pub buy_cooldown: chrono::Duration,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            max_drawdown_pct: 35.0,
            max_position_pct: 0.30,
            cash_buffer_pct: 0.10,
            max_trades_per_day: 10,
            inactivity_timeout: chrono::Duration::hours(168),
            buy_cooldown: chrono::Duration::seconds(8),
        }
    }
}

pub const DEFAULT_TIERS: &str = "20:200:460:140,30:300:690:210,40:400:920:280,50:500:1150:350";

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// `fee:balance:target:bounty` dipisah koma. Entry yang rusak di-skip.
pub fn parse_tiers(s: &str) -> Vec<Tier> {
    let mut out: Vec<Tier> = s
        .split(',')
        .filter_map(|t| {
            let parts: Vec<&str> = t.trim().split(':').map(|x| x.trim()).collect();
            if parts.len() != 4 {
                return None;
            }
            let tier = Tier {
                fee: parts[0].parse().ok()?,
                balance: parts[1].parse().ok()?,
                target: parts[2].parse().ok()?,
                bounty: parts[3].parse().ok()?,
            };
            (tier.balance > 0.0 && tier.target > tier.balance).then_some(tier)
        })
        .collect();
    out.sort_by_key(|t| t.fee);
    out.dedup_by_key(|t| t.fee);
    out
}

pub fn parse_amounts(s: &str) -> Vec<f64> {
    s.split(',')
        .filter_map(|x| x.trim().parse::<f64>().ok())
        .filter(|x| x.is_finite() && *x > 0.0)
        .collect()
}

pub fn load(cli: &Cli) -> (Args, Rules) {
    // Pastikan .env dibaca (agar DB_PATH, TIERS, dll ter-load)
    let _ = dotenv();

    // ===== Storage / files =====
    let db_path = cli
        .db
        .clone()
        .or_else(|| env::var("DB_PATH").ok())
        .unwrap_or_else(|| "crucible.db".to_string());
    let record_file = cli.record_file.clone().or_else(|| env::var("RECORD_FILE").ok());
    let metrics_port = env_or("METRICS_PORT", 9899u16);

    // ===== Oracle =====
    let oracle_mode = OracleMode::from_env("ORACLE_MODE", OracleMode::Mock);
    let jupiter_price_url = env::var("JUPITER_PRICE_URL")
        .unwrap_or_else(|_| "https://quote-api.jup.ag/v6/price".to_string());
    let dexscreener_url =
        env::var("DEXSCREENER_URL").unwrap_or_else(|_| "https://api.dexscreener.com".to_string());
    let oracle_timeout_ms = env_or("ORACLE_TIMEOUT_MS", 6000u64);

    let sweep_interval_secs = env_or("SWEEP_INTERVAL_SECS", 3600u64).max(1);

    // ===== Tiers & quick-buy =====
    //   TIERS=20:200:460:140,50:500:1150:350
    //   QUICK_AMOUNTS=20,50,100,250
    let tiers = env::var("TIERS")
        .ok()
        .map(|s| parse_tiers(&s))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| parse_tiers(DEFAULT_TIERS));
    let quick_amounts = env::var("QUICK_AMOUNTS")
        .ok()
        .map(|s| parse_amounts(&s))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![20.0, 50.0, 100.0, 250.0]);

    let args = Args {
        db_path,
        record_file,
        metrics_port,
        oracle_mode,
        jupiter_price_url,
        dexscreener_url,
        oracle_timeout_ms,
        sweep_interval_secs,
        console: cli.console,
        tiers,
        quick_amounts,
    };

    let rules = rules_from(|k| env::var(k).ok());
    (args, rules)
}

/// Rules dari sumber key/value. Nilai yang tidak valid atau di luar range -> default.
pub fn rules_from(get: impl Fn(&str) -> Option<String>) -> Rules {
    fn pick<T: FromStr>(
        get: &impl Fn(&str) -> Option<String>,
        key: &str,
        ok: impl Fn(&T) -> bool,
    ) -> Option<T> {
        let v = get(key)?.trim().parse::<T>().ok().filter(|v| ok(v));
        if v.is_none() {
            warn!(key, "config: invalid rule value, using default");
        }
        v
    }

    let d = Rules::default();
    Rules {
        max_drawdown_pct: pick(&get, "MAX_DRAWDOWN_PCT", |x: &f64| x.is_finite() && *x > 0.0 && *x <= 100.0)
            .unwrap_or(d.max_drawdown_pct),
        max_position_pct: pick(&get, "MAX_POSITION_PCT", |x: &f64| x.is_finite() && *x > 0.0 && *x <= 1.0)
            .unwrap_or(d.max_position_pct),
        cash_buffer_pct: pick(&get, "CASH_BUFFER_PCT", |x: &f64| x.is_finite() && *x >= 0.0 && *x < 1.0)
            .unwrap_or(d.cash_buffer_pct),
        max_trades_per_day: pick(&get, "MAX_TRADES_PER_DAY", |n: &u32| *n > 0)
            .unwrap_or(d.max_trades_per_day),
        inactivity_timeout: pick(&get, "INACTIVITY_TIMEOUT_HOURS", |h: &i64| *h > 0)
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(d.inactivity_timeout),
        buy_cooldown: pick(&get, "BUY_COOLDOWN_SECS", |s: &i64| *s >= 0)
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(d.buy_cooldown),
    }
}
