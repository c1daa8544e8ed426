// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type PositionId = i64;

/// Status challenge. Transisi hanya satu arah: Active -> salah satu status terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus { Active, FailedDrawdown, Passed, FailedInactivity }

impl ChallengeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeStatus::Active => "active",
            ChallengeStatus::FailedDrawdown => "failed_drawdown",
            ChallengeStatus::Passed => "passed",
            ChallengeStatus::FailedInactivity => "failed_inactivity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ChallengeStatus::Active),
            "failed_drawdown" => Some(ChallengeStatus::FailedDrawdown),
            "passed" => Some(ChallengeStatus::Passed),
            "failed_inactivity" => Some(ChallengeStatus::FailedInactivity),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool { matches!(self, ChallengeStatus::Active) }
}

impl std::fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// One challenge account per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: UserId,
    pub balance: f64,
    pub start_balance: f64,
    pub peak_equity: f64,
    pub target: f64,
    pub bounty: f64,
    pub status: ChallengeStatus,
    /// Cumulative realized P&L from closes.
    pub realized_pnl: f64,
    /// Raw counter; only meaningful while `trade_day` is today (see `rules::trades_today`).
    pub trades_today: u32,
    pub trade_day: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Waktu buy terakhir (cooldown antar buy).
    pub last_buy_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(user_id: UserId, start_balance: f64, target: f64, bounty: f64, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            balance: start_balance,
            start_balance,
            peak_equity: start_balance,
            target,
            bounty,
            status: ChallengeStatus::Active,
            realized_pnl: 0.0,
            trades_today: 0,
            trade_day: None,
            created_at: now,
            last_activity_at: now,
            last_buy_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub user_id: UserId,
    pub token_id: String,
    pub symbol: String,
    pub cost_basis_usd: f64,
    pub tokens_held: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
}

/// Quote dari PriceOracle (price selalu > 0 setelah lewat `oracle::fetch_quote`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: f64,
    pub symbol: String,
    pub market_cap_usd: Option<f64>,
}

/// Hasil evaluate: angka mark-to-market + status (mungkin berubah).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub equity: f64,
    pub unrealized_pnl: f64,
    pub peak_equity: f64,
    pub drawdown_pct: f64,
    pub status: ChallengeStatus,
    /// `Some(status)` kalau evaluate ini memicu transisi.
    pub transition: Option<ChallengeStatus>,
}

/// Outbound notification untuk chat layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange { pub user_id: UserId, pub new_status: ChallengeStatus, pub equity: f64 }

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tier { pub fee: u32, pub balance: f64, pub target: f64, pub bounty: f64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOutcome {
    pub position: Position,
    pub balance: f64,
    /// None kalau refresh setelah commit gagal; trade tetap tersimpan.
    pub evaluation: Option<Evaluation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseOutcome {
    pub position_id: PositionId,
    pub percent: f64,
    pub fill_price: f64,
    /// true kalau oracle tidak ada harga dan entry price dipakai sebagai fill.
    pub fallback_price: bool,
    pub proceeds: f64,
    pub realized_pnl: f64,
    pub balance: f64,
    /// None kalau posisi sudah ditutup penuh.
    pub remaining: Option<Position>,
    pub evaluation: Option<Evaluation>,
}

// Event untuk recorder (JSONL)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Grant { user_id: UserId, start_balance: f64, target: f64, ts_ms: i64 },
    Open { user_id: UserId, position_id: PositionId, token_id: String, usd: f64, price: f64, ts_ms: i64 },
    Close { user_id: UserId, position_id: PositionId, percent: f64, price: f64, proceeds: f64, pnl: f64, ts_ms: i64 },
    Reject { user_id: UserId, op: String, reason: String, ts_ms: i64 },
    Transition(StatusChange),
    Note(String),
}
