// ===============================
// src/positions.rs (sizing & partial close)
// ===============================

use crate::domain::Position;

/// Hasil hitung close (belum di-commit ke store)
#[derive(Debug, Clone, PartialEq)]
pub struct CloseFill {
    pub tokens_sold: f64,
    pub proceeds: f64,
    pub cost_released: f64,
    pub realized_pnl: f64,
    /// None -> posisi habis, harus dihapus
    pub remaining: Option<Position>,
}

pub fn tokens_for(usd: f64, price: f64) -> f64 {
    usd / price
}

/// `percent` sudah divalidasi di (0, 100]. Sisa posisi di-scale proporsional,
/// jadi average cost basis sisanya tetap sama.
pub fn close_fill(pos: &Position, percent: f64, price: f64) -> CloseFill {
    let tokens_sold = pos.tokens_held * percent / 100.0;
    let proceeds = tokens_sold * price;
    let cost_released = pos.cost_basis_usd * percent / 100.0;

    let remaining = if percent >= 100.0 {
        None
    } else {
        let keep = 100.0 - percent;
        let tokens_held = pos.tokens_held * keep / 100.0;
        // tokens 0 tidak disimpan
        (tokens_held > 0.0).then(|| Position {
            tokens_held,
            cost_basis_usd: pos.cost_basis_usd * keep / 100.0,
            ..pos.clone()
        })
    };

    // kalau sisa dibuang karena 0, seluruh cost basis ikut terealisasi
    let cost_released = if remaining.is_none() { pos.cost_basis_usd } else { cost_released };

    CloseFill {
        tokens_sold,
        proceeds,
        cost_released,
        realized_pnl: proceeds - cost_released,
        remaining,
    }
}

/// Mark-to-market satu posisi
pub fn market_value(pos: &Position, price: f64) -> f64 {
    pos.cost_basis_usd + (price - pos.entry_price) * pos.tokens_held
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn opened(usd: f64, price: f64) -> Position {
        Position {
            id: 11,
            user_id: 1,
            token_id: "tok".into(),
            symbol: "TOK".into(),
            cost_basis_usd: usd,
            tokens_held: tokens_for(usd, price),
            entry_price: price,
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn partial_close_preserves_ratio() {
        let pos = opened(100.0, 2.0);
        assert_eq!(pos.tokens_held, 50.0);

        let fill = close_fill(&pos, 40.0, 3.0);
        assert_eq!(fill.proceeds, 60.0);
        assert_eq!(fill.realized_pnl, 20.0);
        let rem = fill.remaining.expect("remaining position");
        assert_eq!(rem.tokens_held, 30.0);
        assert_eq!(rem.cost_basis_usd, 60.0);
        assert_eq!(rem.entry_price, 2.0);
    }

    #[test]
    fn full_close_removes_position() {
        let pos = opened(100.0, 2.0);
        let fill = close_fill(&pos, 100.0, 1.5);
        assert!(fill.remaining.is_none());
        assert_eq!(fill.proceeds, 75.0);
        assert_eq!(fill.realized_pnl, -25.0);
    }

    #[test]
    fn market_value_tracks_price() {
        let pos = opened(60.0, 1.0);
        assert_eq!(market_value(&pos, 6.0), 360.0);
        assert_eq!(market_value(&pos, 1.0), 60.0);
    }
}
