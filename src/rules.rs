// ===============================
// src/rules.rs
// ===============================
use ahash::AHashMap as HashMap;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::config::Rules;
use crate::domain::{Account, ChallengeStatus, Evaluation, Position};

// Toleransi float untuk batas inklusif (60.0 vs 59.99999999999999).
// Tidak dipakai untuk cek balance: cash tidak boleh minus sedikit pun.
const EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("invalid amount: must be a positive number")]
    InvalidAmount,
    #[error("insufficient balance: ${requested:.2} requested, ${available:.2} available")]
    InsufficientBalance { requested: f64, available: f64 },
    #[error("cash buffer: ${left:.2} would remain, at least ${floor:.2} must stay in cash")]
    BelowCashBuffer { left: f64, floor: f64 },
    #[error("position too large: ${requested:.2} exceeds max ${max:.2} per position")]
    PositionTooLarge { requested: f64, max: f64 },
    #[error("daily trade cap reached: {cap} trades per day")]
    DailyTradeCapReached { cap: u32 },
    #[error("buy cooldown: wait {wait_secs}s before the next buy")]
    BuyCooldown { wait_secs: i64 },
    #[error("challenge is not active (status: {status})")]
    ChallengeNotActive { status: ChallengeStatus },
}

impl RuleError {
    /// Label pendek untuk metrics / recorder
    pub fn reason(&self) -> &'static str {
        match self {
            RuleError::InvalidAmount => "invalid_amount",
            RuleError::InsufficientBalance { .. } => "insufficient_balance",
            RuleError::BelowCashBuffer { .. } => "below_cash_buffer",
            RuleError::PositionTooLarge { .. } => "position_too_large",
            RuleError::DailyTradeCapReached { .. } => "daily_trade_cap",
            RuleError::BuyCooldown { .. } => "buy_cooldown",
            RuleError::ChallengeNotActive { .. } => "challenge_not_active",
        }
    }
}

/// Trade count for `today`; the stored counter resets implicitly on a new UTC day.
pub fn trades_today(acc: &Account, today: NaiveDate) -> u32 {
    match acc.trade_day {
        Some(day) if day == today => acc.trades_today,
        _ => 0,
    }
}

pub fn ensure_active(acc: &Account) -> Result<(), RuleError> {
    if acc.status.is_active() {
        Ok(())
    } else {
        Err(RuleError::ChallengeNotActive { status: acc.status })
    }
}

/// Pre-trade checks untuk buy, urutan tetap (first failure wins).
pub fn check_open(acc: &Account, usd: f64, rules: &Rules, now: DateTime<Utc>) -> Result<(), RuleError> {
    // 1) status
    ensure_active(acc)?;

    // 2) amount
    if !usd.is_finite() || usd <= 0.0 {
        return Err(RuleError::InvalidAmount);
    }

    // 3) balance (tanpa EPS)
    if usd > acc.balance {
        return Err(RuleError::InsufficientBalance { requested: usd, available: acc.balance });
    }

    // 4) cash reserve
    let floor = acc.start_balance * rules.cash_buffer_pct;
    let left = acc.balance - usd;
    if left + EPS < floor {
        return Err(RuleError::BelowCashBuffer { left, floor });
    }

    // 5) position size
    let max = acc.start_balance * rules.max_position_pct;
    if usd > max + EPS {
        return Err(RuleError::PositionTooLarge { requested: usd, max });
    }

    // 6) daily cap
    if trades_today(acc, now.date_naive()) >= rules.max_trades_per_day {
        return Err(RuleError::DailyTradeCapReached { cap: rules.max_trades_per_day });
    }

    // 7) jeda antar buy
    if let Some(last) = acc.last_buy_at {
        let ready_at = last + rules.buy_cooldown;
        if now < ready_at {
            let wait_ms = (ready_at - now).num_milliseconds();
            return Err(RuleError::BuyCooldown { wait_secs: (wait_ms + 999) / 1000 });
        }
    }
    Ok(())
}

/// Percent decline from peak; 0 when at/above peak.
pub fn drawdown_pct(peak: f64, equity: f64) -> f64 {
    if peak <= 0.0 {
        return 0.0;
    }
    // kali 100 dulu supaya 1000 -> 650 tepat 35.0
    ((peak - equity) * 100.0 / peak).max(0.0)
}

/// Mark-to-market + transisi status. Mengubah `acc.peak_equity` dan `acc.status`
/// in-place hanya kalau akun masih Active; akun terminal dievaluasi read-only.
///
/// Harga live yang tidak ada di `live` diganti `entry_price` posisi itu.
pub fn evaluate(
    acc: &mut Account,
    positions: &[Position],
    live: &HashMap<String, f64>,
    rules: &Rules,
    now: DateTime<Utc>,
) -> Evaluation {
    let mut unrealized = 0.0;
    let mut cost = 0.0;
    for p in positions {
        let px = live
            .get(&p.token_id)
            .copied()
            .filter(|x| x.is_finite() && *x > 0.0)
            .unwrap_or(p.entry_price);
        unrealized += (px - p.entry_price) * p.tokens_held;
        cost += p.cost_basis_usd;
    }
    let equity = acc.balance + cost + unrealized;

    if !acc.status.is_active() {
        let peak = acc.peak_equity.max(equity);
        return Evaluation {
            equity,
            unrealized_pnl: unrealized,
            peak_equity: acc.peak_equity,
            drawdown_pct: drawdown_pct(peak, equity),
            status: acc.status,
            transition: None,
        };
    }

    // High-water mark: hanya naik
    if equity > acc.peak_equity {
        acc.peak_equity = equity;
    }
    let dd = drawdown_pct(acc.peak_equity, equity);

    // Prioritas: drawdown -> target -> inactivity
    let next = if dd >= rules.max_drawdown_pct {
        Some(ChallengeStatus::FailedDrawdown)
    } else if equity >= acc.target {
        Some(ChallengeStatus::Passed)
    } else if now - acc.last_activity_at > rules.inactivity_timeout {
        Some(ChallengeStatus::FailedInactivity)
    } else {
        None
    };
    if let Some(s) = next {
        acc.status = s;
    }

    Evaluation {
        equity,
        unrealized_pnl: unrealized,
        peak_equity: acc.peak_equity,
        drawdown_pct: dd,
        status: acc.status,
        transition: next,
    }
}
