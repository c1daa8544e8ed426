// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use crate::config::Rules;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Ledger activity --------
pub static TRADES_OPENED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("trades_opened_total", "positions opened").unwrap());

pub static TRADES_CLOSED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("trades_closed_total", "partial or full closes").unwrap());

pub static CLOSE_FALLBACK_PRICE: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "close_fallback_price_total",
        "closes filled at entry price because the oracle had no quote",
    )
    .unwrap()
});

pub static GRANTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("grants_total", "accounts granted / reset").unwrap());

pub static REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("rejections_total", "rejected operations (labels: op, reason)"),
        &["op", "reason"],
    )
    .unwrap()
});

pub static TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("status_transitions_total", "challenge status transitions"),
        &["status"],
    )
    .unwrap()
});

pub static ACCOUNTS_ACTIVE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("accounts_active", "active accounts seen by last sweep").unwrap());

pub static SWEEPS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("sweeps_total", "inactivity sweeps completed").unwrap());

// -------- Oracle health --------
pub static ORACLE_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("oracle_requests_total", "oracle quotes (labels: source, outcome)"),
        &["source", "outcome"],
    )
    .unwrap()
});

pub static ORACLE_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("oracle_latency_ms", "Oracle quote latency (ms)")
            .buckets(vec![25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]),
    )
    .unwrap()
});

// ---- Config visibility (rules) ----
pub static CONFIG_RULE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("config_rule", "configured challenge rules (label: rule)"), &["rule"])
        .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TRADES_OPENED.clone())),
        REGISTRY.register(Box::new(TRADES_CLOSED.clone())),
        REGISTRY.register(Box::new(CLOSE_FALLBACK_PRICE.clone())),
        REGISTRY.register(Box::new(GRANTS.clone())),
        REGISTRY.register(Box::new(REJECTIONS.clone())),
        REGISTRY.register(Box::new(TRANSITIONS.clone())),
        REGISTRY.register(Box::new(ACCOUNTS_ACTIVE.clone())),
        REGISTRY.register(Box::new(SWEEPS.clone())),
        // Oracle
        REGISTRY.register(Box::new(ORACLE_REQUESTS.clone())),
        REGISTRY.register(Box::new(ORACLE_LATENCY.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_RULE.clone())),
    ] {
        let _ = m;
    }
}

pub fn export_rules(rules: &Rules) {
    CONFIG_RULE.with_label_values(&["max_drawdown_pct"]).set(rules.max_drawdown_pct);
    CONFIG_RULE.with_label_values(&["max_position_pct"]).set(rules.max_position_pct);
    CONFIG_RULE.with_label_values(&["cash_buffer_pct"]).set(rules.cash_buffer_pct);
    CONFIG_RULE
        .with_label_values(&["max_trades_per_day"])
        .set(rules.max_trades_per_day as f64);
    CONFIG_RULE
        .with_label_values(&["inactivity_timeout_hours"])
        .set(rules.inactivity_timeout.num_hours() as f64);
    CONFIG_RULE
        .with_label_values(&["buy_cooldown_secs"])
        .set(rules.buy_cooldown.num_seconds() as f64);
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics): tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Metrics server di OS thread sendiri. Bind gagal -> log error, service tetap jalan.
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(?e, %addr, "metrics bind failed");
                return;
            }
        };
        tracing::info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}
