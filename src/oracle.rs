// ===============================
// src/oracle.rs
// ===============================
//
// PriceOracle adapters:
// - MockOracle      : tabel harga in-memory, opsional random-walk per query
// - FallbackOracle  : coba beberapa sumber berurutan, quote valid pertama menang
// - fetch_quote     : bungkus oracle apa pun dengan timeout + normalisasi
//
// Oracle itu best-effort: timeout, error HTTP, harga <= 0 semuanya = "unavailable".
//
use std::sync::RwLock;
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use crate::domain::Quote;
use crate::metrics::{ORACLE_LATENCY, ORACLE_REQUESTS};

#[async_trait]
pub trait PriceOracle: Send + Sync {
    fn name(&self) -> &'static str;
    async fn get_price(&self, token_id: &str) -> Option<Quote>;
}

/// Simbol default kalau sumber tidak kasih simbol
pub fn short_symbol(token_id: &str) -> String {
    token_id.chars().take(8).collect::<String>().to_uppercase()
}

fn usable(q: &Quote) -> bool {
    q.price.is_finite() && q.price > 0.0
}

/// Bounded oracle call. Timeout dan harga tidak valid dianggap unavailable.
pub async fn fetch_quote(oracle: &dyn PriceOracle, token_id: &str, timeout: Duration) -> Option<Quote> {
    let started = Instant::now();
    let res = tokio::time::timeout(timeout, oracle.get_price(token_id)).await;
    ORACLE_LATENCY.observe(started.elapsed().as_secs_f64() * 1000.0);

    let (outcome, quote) = match res {
        Err(_) => ("timeout", None),
        Ok(None) => ("unavailable", None),
        Ok(Some(q)) if !usable(&q) => ("bad_price", None),
        Ok(Some(q)) => ("ok", Some(q)),
    };
    ORACLE_REQUESTS.with_label_values(&[oracle.name(), outcome]).inc();
    debug!(source = oracle.name(), token = %token_id, outcome, "oracle quote");
    quote
}

pub struct FallbackOracle {
    sources: Vec<Box<dyn PriceOracle>>,
    per_source_timeout: Duration,
}

impl FallbackOracle {
    pub fn new(sources: Vec<Box<dyn PriceOracle>>, per_source_timeout: Duration) -> Self {
        Self { sources, per_source_timeout }
    }
}

#[async_trait]
impl PriceOracle for FallbackOracle {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn get_price(&self, token_id: &str) -> Option<Quote> {
        for src in &self.sources {
            if let Some(q) = fetch_quote(src.as_ref(), token_id, self.per_source_timeout).await {
                return Some(q);
            }
        }
        None
    }
}

/// Oracle in-memory. `jitter_bps` > 0 -> harga random-walk tiap query
/// (mode demo); 0 -> harga statis (tests).
pub struct MockOracle {
    prices: RwLock<HashMap<String, f64>>,
    jitter_bps: u32,
    auto_list: bool,
}

impl MockOracle {
    pub fn new() -> Self {
        Self { prices: RwLock::new(HashMap::new()), jitter_bps: 0, auto_list: false }
    }

    /// Random walk; token yang belum dikenal otomatis listing di 1.0
    pub fn random_walk(jitter_bps: u32) -> Self {
        Self { prices: RwLock::new(HashMap::new()), jitter_bps, auto_list: true }
    }

    pub fn set_price(&self, token_id: &str, price: f64) {
        if let Ok(mut m) = self.prices.write() {
            m.insert(token_id.to_string(), price);
        }
    }

    pub fn remove(&self, token_id: &str) {
        if let Ok(mut m) = self.prices.write() {
            m.remove(token_id);
        }
    }
}

impl Default for MockOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceOracle for MockOracle {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn get_price(&self, token_id: &str) -> Option<Quote> {
        let mut m = self.prices.write().ok()?;
        let price = match m.get(token_id).copied() {
            Some(p) => p,
            None if self.auto_list => 1.0,
            None => return None,
        };
        let price = if self.jitter_bps > 0 {
            // jangan simpan ThreadRng melewati .await (di sini tidak ada await)
            let bps = self.jitter_bps as i64;
            let step = rand::thread_rng().gen_range(-bps..=bps) as f64 / 10_000.0;
            let next = (price * (1.0 + step)).max(1e-12);
            m.insert(token_id.to_string(), next);
            next
        } else {
            if self.auto_list {
                m.entry(token_id.to_string()).or_insert(price);
            }
            price
        };
        Some(Quote { price, symbol: short_symbol(token_id), market_cap_usd: None })
    }
}
