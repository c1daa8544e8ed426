// ===============================
// src/oracle_http.rs
// ===============================
//
// HTTP price sources (read-only, tanpa API key):
// - JupiterOracle     : GET {base}?ids={token}                       -> data[token].price
// - DexScreenerOracle : GET {base}/latest/dex/pairs/solana/{token}   -> pair.priceUsd
//
// Error jaringan / parse cukup di-log debug lalu None; fetch_quote yang
// menghitung outcome di metrics.
//
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::domain::Quote;
use crate::oracle::{short_symbol, PriceOracle};

/// Angka bisa datang sebagai number atau string ("0.0123")
fn num(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub struct JupiterOracle {
    http: reqwest::Client,
    base_url: String,
}

impl JupiterOracle {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }
}

pub fn parse_jupiter(body: &Value, token_id: &str) -> Option<Quote> {
    let entry = body.get("data")?.get(token_id)?;
    let price = num(entry.get("price")?)?;
    let symbol = entry
        .get("mintSymbol")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| short_symbol(token_id));
    Some(Quote { price, symbol, market_cap_usd: None })
}

#[async_trait]
impl PriceOracle for JupiterOracle {
    fn name(&self) -> &'static str {
        "jupiter"
    }

    async fn get_price(&self, token_id: &str) -> Option<Quote> {
        let resp = self
            .http
            .get(&self.base_url)
            .query(&[("ids", token_id)])
            .send()
            .await
            .map_err(|e| debug!(?e, "jupiter request failed"))
            .ok()?;
        if !resp.status().is_success() {
            debug!(code = %resp.status(), "jupiter non-2xx");
            return None;
        }
        let body: Value = resp.json().await.map_err(|e| debug!(?e, "jupiter bad json")).ok()?;
        parse_jupiter(&body, token_id)
    }
}

pub struct DexScreenerOracle {
    http: reqwest::Client,
    base_url: String,
}

impl DexScreenerOracle {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }
}

/// Ambil `pair` (atau `pairs[0]`) dari respons DexScreener
pub fn parse_dexscreener(body: &Value, token_id: &str) -> Option<Quote> {
    let pair = match body.get("pair") {
        Some(p) if !p.is_null() => p,
        _ => body.get("pairs")?.as_array()?.first()?,
    };
    let price = num(pair.get("priceUsd")?)?;
    let symbol = pair
        .get("baseToken")
        .and_then(|b| b.get("symbol"))
        .and_then(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| short_symbol(token_id));
    let market_cap_usd = pair.get("fdv").and_then(num).filter(|x| *x > 0.0);
    Some(Quote { price, symbol, market_cap_usd })
}

#[async_trait]
impl PriceOracle for DexScreenerOracle {
    fn name(&self) -> &'static str {
        "dexscreener"
    }

    async fn get_price(&self, token_id: &str) -> Option<Quote> {
        let url = format!(
            "{}/latest/dex/pairs/solana/{}",
            self.base_url.trim_end_matches('/'),
            token_id
        );
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| debug!(?e, "dexscreener request failed"))
            .ok()?;
        if !resp.status().is_success() {
            debug!(code = %resp.status(), "dexscreener non-2xx");
            return None;
        }
        let body: Value = resp.json().await.map_err(|e| debug!(?e, "dexscreener bad json")).ok()?;
        parse_dexscreener(&body, token_id)
    }
}
