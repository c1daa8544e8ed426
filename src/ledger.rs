// ===============================
// src/ledger.rs (ChallengeLedger)
// ===============================
//
// Alur tiap operasi yang mengubah state:
//   1) load akun tanpa lock, cek rule (input salah tidak sampai ke oracle)
//   2) ambil harga dari oracle TANPA memegang lock akun (oracle bisa lambat)
//   3) ambil lock per-akun, reload state, cek ulang rule, commit satu transaksi
//   4) lepas lock, lalu refresh (mark-to-market + transisi status)
//
// Akun saling independen: lock hanya per user_id.
//
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{error, info, warn};

use crate::config::Rules;
use crate::domain::{
    Account, CloseOutcome, Evaluation, Event, OpenOutcome, Position, PositionId, Quote,
    StatusChange, Tier, UserId,
};
use crate::metrics::{
    CLOSE_FALLBACK_PRICE, GRANTS, REJECTIONS, TRADES_CLOSED, TRADES_OPENED, TRANSITIONS,
};
use crate::oracle::{fetch_quote, PriceOracle};
use crate::positions::{close_fill, tokens_for};
use crate::rules::{self, RuleError};
use crate::store::{NewPosition, Store, StoreError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error("position {0} not found")]
    PositionNotFound(PositionId),
    #[error("price unavailable for {0}")]
    PriceUnavailable(String),
    #[error("no challenge account for user {0}")]
    AccountNotFound(UserId),
    #[error("no tier for payment ${0}")]
    UnknownTier(u32),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl LedgerError {
    pub fn reason(&self) -> &'static str {
        match self {
            LedgerError::Rule(r) => r.reason(),
            LedgerError::PositionNotFound(_) => "position_not_found",
            LedgerError::PriceUnavailable(_) => "price_unavailable",
            LedgerError::AccountNotFound(_) => "account_not_found",
            LedgerError::UnknownTier(_) => "unknown_tier",
            LedgerError::Storage(_) => "storage",
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

pub struct ChallengeLedger {
    rules: Rules,
    tiers: Vec<Tier>,
    store: Arc<Store>,
    oracle: Arc<dyn PriceOracle>,
    oracle_timeout: Duration,
    locks: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
    notify_tx: Option<mpsc::Sender<StatusChange>>,
    rec_tx: Option<mpsc::Sender<Event>>,
}

impl ChallengeLedger {
    pub fn new(rules: Rules, store: Arc<Store>, oracle: Arc<dyn PriceOracle>, oracle_timeout: Duration) -> Self {
        Self {
            rules,
            tiers: Vec::new(),
            store,
            oracle,
            oracle_timeout,
            locks: Mutex::new(HashMap::new()),
            notify_tx: None,
            rec_tx: None,
        }
    }

    pub fn with_tiers(mut self, tiers: Vec<Tier>) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_notifier(mut self, tx: mpsc::Sender<StatusChange>) -> Self {
        self.notify_tx = Some(tx);
        self
    }

    pub fn with_recorder(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.rec_tx = Some(tx);
        self
    }

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    fn account_lock(&self, user_id: UserId) -> Arc<AsyncMutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(user_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.rec_tx {
            let _ = tx.try_send(ev);
        }
    }

    /// Log + metrics + recorder untuk operasi yang ditolak
    fn rejected(&self, user_id: UserId, op: &str, err: LedgerError) -> LedgerError {
        warn!(user_id, op, reason = err.reason(), error = %err, "operation rejected");
        REJECTIONS.with_label_values(&[op, err.reason()]).inc();
        self.record(Event::Reject {
            user_id,
            op: op.to_string(),
            reason: err.to_string(),
            ts_ms: Utc::now().timestamp_millis(),
        });
        err
    }

    fn load(&self, user_id: UserId) -> Result<Account> {
        self.store.load_account(user_id)?.ok_or(LedgerError::AccountNotFound(user_id))
    }

    pub fn account(&self, user_id: UserId) -> Result<Account> {
        self.load(user_id)
    }

    pub fn positions(&self, user_id: UserId) -> Result<Vec<Position>> {
        Ok(self.store.load_positions(user_id)?)
    }

    pub fn active_users(&self) -> Result<Vec<UserId>> {
        Ok(self.store.active_users()?)
    }

    pub async fn quote(&self, token_id: &str) -> Option<Quote> {
        fetch_quote(self.oracle.as_ref(), token_id, self.oracle_timeout).await
    }

    // ---------------------------------------------------------------
    // Grant
    // ---------------------------------------------------------------

    /// Idempotent: replaces any prior account and positions for `user_id`.
    pub async fn grant_account(&self, user_id: UserId, start_balance: f64, target: f64) -> Result<Account> {
        self.grant(user_id, start_balance, target, 0.0).await
    }

    /// Grant berdasar nominal pembayaran (tier)
    pub async fn grant_tier(&self, user_id: UserId, fee: u32) -> Result<Account> {
        let Some(tier) = self.tiers.iter().find(|t| t.fee == fee).copied() else {
            return Err(self.rejected(user_id, "grant", LedgerError::UnknownTier(fee)));
        };
        self.grant(user_id, tier.balance, tier.target, tier.bounty).await
    }

    async fn grant(&self, user_id: UserId, start_balance: f64, target: f64, bounty: f64) -> Result<Account> {
        let valid = |x: f64| x.is_finite() && x > 0.0;
        if !valid(start_balance) || !valid(target) {
            return Err(self.rejected(user_id, "grant", RuleError::InvalidAmount.into()));
        }

        let now = Utc::now();
        let acc = Account::new(user_id, start_balance, target, bounty, now);
        let lock = self.account_lock(user_id);
        {
            let _guard = lock.lock().await;
            self.store.replace_account(&acc)?;
        }

        GRANTS.inc();
        info!(user_id, start_balance, target, bounty, "challenge granted");
        self.record(Event::Grant { user_id, start_balance, target, ts_ms: now.timestamp_millis() });
        Ok(acc)
    }

    // ---------------------------------------------------------------
    // Buy
    // ---------------------------------------------------------------

    pub async fn open_position(&self, user_id: UserId, token_id: &str, usd: f64) -> Result<OpenOutcome> {
        let now = Utc::now();

        // 1) pre-check tanpa lock
        let acc = self.load(user_id).map_err(|e| self.rejected(user_id, "open", e))?;
        rules::check_open(&acc, usd, &self.rules, now).map_err(|e| self.rejected(user_id, "open", e.into()))?;

        // 2) harga di luar lock
        let Some(quote) = self.quote(token_id).await else {
            return Err(self.rejected(user_id, "open", LedgerError::PriceUnavailable(token_id.to_string())));
        };

        // 3) lock + re-validate + commit
        let lock = self.account_lock(user_id);
        let (position, balance) = {
            let _guard = lock.lock().await;
            let mut acc = self.load(user_id)?;
            let now = Utc::now();
            rules::check_open(&acc, usd, &self.rules, now)
                .map_err(|e| self.rejected(user_id, "open", e.into()))?;

            let today = now.date_naive();
            acc.trades_today = rules::trades_today(&acc, today) + 1;
            acc.trade_day = Some(today);
            acc.balance -= usd;
            acc.last_activity_at = now;
            acc.last_buy_at = Some(now);

            let new_pos = NewPosition {
                token_id: token_id.to_string(),
                symbol: quote.symbol.clone(),
                cost_basis_usd: usd,
                tokens_held: tokens_for(usd, quote.price),
                entry_price: quote.price,
                opened_at: now,
            };
            let position = self.store.commit_open(&acc, &new_pos)?;
            (position, acc.balance)
        };

        TRADES_OPENED.inc();
        info!(
            user_id,
            position_id = position.id,
            token = %token_id,
            symbol = %position.symbol,
            usd,
            price = quote.price,
            tokens = position.tokens_held,
            balance,
            "position opened"
        );
        self.record(Event::Open {
            user_id,
            position_id: position.id,
            token_id: token_id.to_string(),
            usd,
            price: quote.price,
            ts_ms: now.timestamp_millis(),
        });

        // 4) evaluate setelah perubahan state
        let evaluation = self.settle(user_id, "open").await;
        Ok(OpenOutcome { position, balance, evaluation })
    }

    // ---------------------------------------------------------------
    // Sell
    // ---------------------------------------------------------------

    pub async fn close_position(&self, user_id: UserId, position_id: PositionId, percent: f64) -> Result<CloseOutcome> {
        if !percent.is_finite() || percent <= 0.0 || percent > 100.0 {
            return Err(self.rejected(user_id, "close", RuleError::InvalidAmount.into()));
        }

        let acc = self.load(user_id).map_err(|e| self.rejected(user_id, "close", e))?;
        rules::ensure_active(&acc).map_err(|e| self.rejected(user_id, "close", e.into()))?;
        let Some(pos) = self.store.load_position(user_id, position_id)? else {
            return Err(self.rejected(user_id, "close", LedgerError::PositionNotFound(position_id)));
        };

        // Oracle kosong -> pakai entry price; exit lebih penting dari presisi
        let (fill_price, fallback_price) = match self.quote(&pos.token_id).await {
            Some(q) => (q.price, false),
            None => (pos.entry_price, true),
        };

        let lock = self.account_lock(user_id);
        let (fill, balance) = {
            let _guard = lock.lock().await;
            let mut acc = self.load(user_id)?;
            rules::ensure_active(&acc).map_err(|e| self.rejected(user_id, "close", e.into()))?;
            let Some(pos) = self.store.load_position(user_id, position_id)? else {
                return Err(self.rejected(user_id, "close", LedgerError::PositionNotFound(position_id)));
            };

            let fill = close_fill(&pos, percent, fill_price);
            acc.balance += fill.proceeds;
            acc.realized_pnl += fill.realized_pnl;
            acc.last_activity_at = Utc::now();
            self.store.commit_close(&acc, position_id, fill.remaining.as_ref())?;
            (fill, acc.balance)
        };

        TRADES_CLOSED.inc();
        if fallback_price {
            CLOSE_FALLBACK_PRICE.inc();
            warn!(user_id, position_id, token = %pos.token_id, "no quote, closed at entry price");
        }
        info!(
            user_id,
            position_id,
            percent,
            price = fill_price,
            proceeds = fill.proceeds,
            pnl = fill.realized_pnl,
            balance,
            "position closed"
        );
        self.record(Event::Close {
            user_id,
            position_id,
            percent,
            price: fill_price,
            proceeds: fill.proceeds,
            pnl: fill.realized_pnl,
            ts_ms: Utc::now().timestamp_millis(),
        });

        let evaluation = self.settle(user_id, "close").await;
        Ok(CloseOutcome {
            position_id,
            percent,
            fill_price,
            fallback_price,
            proceeds: fill.proceeds,
            realized_pnl: fill.realized_pnl,
            balance,
            remaining: fill.remaining,
            evaluation,
        })
    }

    // ---------------------------------------------------------------
    // Evaluate / refresh
    // ---------------------------------------------------------------

    /// Refresh setelah commit. Trade sudah tersimpan, error di sini cukup di-log.
    async fn settle(&self, user_id: UserId, op: &str) -> Option<Evaluation> {
        match self.refresh(user_id).await {
            Ok(ev) => Some(ev),
            Err(e) => {
                error!(user_id, op, error = %e, "post-trade refresh failed, trade stays committed");
                None
            }
        }
    }

    pub async fn refresh(&self, user_id: UserId) -> Result<Evaluation> {
        self.refresh_at(user_id, Utc::now()).await
    }

    /// Mark-to-market semua posisi dengan harga live; persist peak/status kalau berubah.
    pub async fn refresh_at(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Evaluation> {
        // harga diambil paralel, tanpa lock
        let mut tokens: Vec<String> = self
            .store
            .load_positions(user_id)?
            .into_iter()
            .map(|p| p.token_id)
            .collect();
        tokens.sort();
        tokens.dedup();
        let quotes = join_all(tokens.iter().map(|t| self.quote(t))).await;
        let live: HashMap<String, f64> = tokens
            .into_iter()
            .zip(quotes)
            .filter_map(|(t, q)| q.map(|q| (t, q.price)))
            .collect();

        let lock = self.account_lock(user_id);
        let ev = {
            let _guard = lock.lock().await;
            let mut acc = self.load(user_id)?;
            // posisi di-reload: bisa berubah selama fetch harga
            let positions = self.store.load_positions(user_id)?;
            let before = (acc.peak_equity, acc.status);
            let ev = rules::evaluate(&mut acc, &positions, &live, &self.rules, now);
            if (acc.peak_equity, acc.status) != before {
                self.store.save_account(&acc)?;
            }
            ev
        };

        if let Some(status) = ev.transition {
            let change = StatusChange { user_id, new_status: status, equity: ev.equity };
            TRANSITIONS.with_label_values(&[status.as_str()]).inc();
            info!(user_id, status = %status, equity = ev.equity, drawdown_pct = ev.drawdown_pct, "status transition");
            self.record(Event::Transition(change.clone()));
            if let Some(tx) = &self.notify_tx {
                let _ = tx.send(change).await;
            }
        }
        Ok(ev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChallengeStatus;
    use crate::oracle::MockOracle;

    const TOK: &str = "So11111111111111111111111111111111111111112";
    const TOK2: &str = "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263";

    struct Fixture {
        ledger: ChallengeLedger,
        oracle: Arc<MockOracle>,
        store: Arc<Store>,
    }

    fn fixture_with(rules: Rules) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let oracle = Arc::new(MockOracle::new());
        let ledger = ChallengeLedger::new(rules, store.clone(), oracle.clone(), Duration::from_secs(1))
            .with_tiers(crate::config::parse_tiers(crate::config::DEFAULT_TIERS));
        Fixture { ledger, oracle, store }
    }

    fn no_cooldown() -> Rules {
        Rules { buy_cooldown: chrono::Duration::zero(), ..Rules::default() }
    }

    fn fixture() -> Fixture {
        fixture_with(no_cooldown())
    }

    fn cash_plus_cost(f: &Fixture, user: UserId) -> f64 {
        let acc = f.ledger.account(user).unwrap();
        acc.balance + f.ledger.positions(user).unwrap().iter().map(|p| p.cost_basis_usd).sum::<f64>()
    }

    #[tokio::test]
    async fn position_size_cap_boundary() {
        let f = fixture();
        f.ledger.grant_account(1, 200.0, 460.0).await.unwrap();
        f.oracle.set_price(TOK, 1.0);

        let err = f.ledger.open_position(1, TOK, 61.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(RuleError::PositionTooLarge { .. })));
        assert_eq!(f.ledger.account(1).unwrap().balance, 200.0);

        let out = f.ledger.open_position(1, TOK, 60.0).await.unwrap();
        assert_eq!(out.balance, 140.0);
        assert_eq!(out.position.tokens_held, 60.0);
    }

    #[tokio::test]
    async fn partial_close_preserves_ratio() {
        let f = fixture();
        f.ledger.grant_account(1, 1000.0, 5000.0).await.unwrap();
        f.oracle.set_price(TOK, 2.0);
        let open = f.ledger.open_position(1, TOK, 100.0).await.unwrap();
        assert_eq!(open.position.tokens_held, 50.0);

        f.oracle.set_price(TOK, 3.0);
        let out = f.ledger.close_position(1, open.position.id, 40.0).await.unwrap();
        assert_eq!(out.proceeds, 60.0);
        assert!(!out.fallback_price);
        let rem = out.remaining.unwrap();
        assert_eq!(rem.tokens_held, 30.0);
        assert_eq!(rem.cost_basis_usd, 60.0);
        assert_eq!(out.balance, 960.0);

        let stored = f.store.load_position(1, open.position.id).unwrap().unwrap();
        assert_eq!(stored.tokens_held, 30.0);
    }

    #[tokio::test]
    async fn end_to_end_pass_emits_notification() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut f = fixture();
        f.ledger = f.ledger.with_notifier(tx);

        f.ledger.grant_account(9, 200.0, 460.0).await.unwrap();
        f.oracle.set_price(TOK, 1.0);
        let open = f.ledger.open_position(9, TOK, 60.0).await.unwrap();
        assert_eq!(open.position.tokens_held, 60.0);
        let ev = open.evaluation.unwrap();
        assert_eq!(ev.equity, 200.0);
        assert_eq!(ev.status, ChallengeStatus::Active);

        f.oracle.set_price(TOK, 6.0);
        let ev = f.ledger.refresh(9).await.unwrap();
        assert_eq!(ev.unrealized_pnl, 300.0);
        assert_eq!(ev.equity, 500.0);
        assert_eq!(ev.status, ChallengeStatus::Passed);

        let change = rx.recv().await.unwrap();
        assert_eq!(change, StatusChange { user_id: 9, new_status: ChallengeStatus::Passed, equity: 500.0 });
        assert_eq!(f.ledger.account(9).unwrap().status, ChallengeStatus::Passed);
        assert_eq!(f.ledger.account(9).unwrap().peak_equity, 500.0);
    }

    #[tokio::test]
    async fn terminal_state_blocks_mutation() {
        let f = fixture();
        f.ledger.grant_account(2, 200.0, 460.0).await.unwrap();
        f.oracle.set_price(TOK, 1.0);
        let open = f.ledger.open_position(2, TOK, 60.0).await.unwrap();
        f.oracle.set_price(TOK, 6.0);
        f.ledger.refresh(2).await.unwrap();

        let before = f.ledger.account(2).unwrap();
        let before_pos = f.ledger.positions(2).unwrap();

        let err = f.ledger.open_position(2, TOK, 10.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(RuleError::ChallengeNotActive { .. })));
        let err = f.ledger.close_position(2, open.position.id, 100.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(RuleError::ChallengeNotActive { .. })));

        // harga jatuh: akun terminal tetap Passed
        f.oracle.set_price(TOK, 0.01);
        let ev = f.ledger.refresh(2).await.unwrap();
        assert_eq!(ev.status, ChallengeStatus::Passed);
        assert_eq!(ev.transition, None);

        assert_eq!(f.ledger.account(2).unwrap(), before);
        assert_eq!(f.ledger.positions(2).unwrap(), before_pos);
    }

    #[tokio::test]
    async fn price_unavailable_leaves_state_untouched() {
        let f = fixture();
        f.ledger.grant_account(3, 200.0, 460.0).await.unwrap();
        let before = f.ledger.account(3).unwrap();

        let err = f.ledger.open_position(3, TOK, 50.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::PriceUnavailable(_)));

        f.oracle.set_price(TOK, 0.0);
        let err = f.ledger.open_position(3, TOK, 50.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::PriceUnavailable(_)));

        assert_eq!(f.ledger.account(3).unwrap(), before);
        assert!(f.ledger.positions(3).unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_input_fails_before_oracle() {
        let f = fixture();
        f.ledger.grant_account(3, 200.0, 460.0).await.unwrap();
        // tidak ada harga sama sekali, tapi error rule yang keluar duluan
        let err = f.ledger.open_position(3, TOK, -5.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(RuleError::InvalidAmount)));
        let err = f.ledger.open_position(3, TOK, 500.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(RuleError::InsufficientBalance { .. })));
    }

    #[tokio::test]
    async fn close_falls_back_to_entry_price() {
        let f = fixture();
        f.ledger.grant_account(4, 1000.0, 5000.0).await.unwrap();
        f.oracle.set_price(TOK, 2.0);
        let open = f.ledger.open_position(4, TOK, 100.0).await.unwrap();

        f.oracle.remove(TOK);
        let out = f.ledger.close_position(4, open.position.id, 100.0).await.unwrap();
        assert!(out.fallback_price);
        assert_eq!(out.fill_price, 2.0);
        assert_eq!(out.proceeds, 100.0);
        assert_eq!(out.realized_pnl, 0.0);
        assert!(out.remaining.is_none());
        assert!(f.ledger.positions(4).unwrap().is_empty());
        assert_eq!(f.ledger.account(4).unwrap().balance, 1000.0);
    }

    #[tokio::test]
    async fn close_rejects_bad_percent_and_foreign_position() {
        let f = fixture();
        f.ledger.grant_account(5, 1000.0, 5000.0).await.unwrap();
        f.ledger.grant_account(6, 1000.0, 5000.0).await.unwrap();
        f.oracle.set_price(TOK, 1.0);
        let open = f.ledger.open_position(5, TOK, 100.0).await.unwrap();

        for pct in [0.0, -10.0, 100.5, f64::NAN] {
            let err = f.ledger.close_position(5, open.position.id, pct).await.unwrap_err();
            assert!(matches!(err, LedgerError::Rule(RuleError::InvalidAmount)));
        }
        let err = f.ledger.close_position(6, open.position.id, 50.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::PositionNotFound(_)));
        let err = f.ledger.close_position(5, 9999, 50.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::PositionNotFound(9999)));
    }

    #[tokio::test]
    async fn conservation_over_open_close_sequence() {
        let f = fixture();
        f.ledger.grant_account(7, 1000.0, 100_000.0).await.unwrap();
        f.oracle.set_price(TOK, 1.0);
        f.oracle.set_price(TOK2, 0.5);

        let a = f.ledger.open_position(7, TOK, 200.0).await.unwrap().position;
        let b = f.ledger.open_position(7, TOK2, 150.0).await.unwrap().position;
        f.oracle.set_price(TOK, 1.2);
        f.ledger.close_position(7, a.id, 25.0).await.unwrap();
        f.oracle.set_price(TOK2, 0.45);
        f.ledger.close_position(7, b.id, 50.0).await.unwrap();
        f.ledger.open_position(7, TOK2, 80.0).await.unwrap();
        f.oracle.set_price(TOK, 1.1);
        f.ledger.close_position(7, a.id, 100.0).await.unwrap();

        let acc = f.ledger.account(7).unwrap();
        let expected = acc.start_balance + acc.realized_pnl;
        assert!((cash_plus_cost(&f, 7) - expected).abs() < 1e-9);
        assert!(acc.balance >= 0.0);
        assert!(acc.peak_equity >= acc.start_balance);
    }

    #[tokio::test]
    async fn constant_price_creates_no_value() {
        let f = fixture();
        f.ledger.grant_account(8, 500.0, 1150.0).await.unwrap();
        f.oracle.set_price(TOK, 0.37);
        let p = f.ledger.open_position(8, TOK, 150.0).await.unwrap().position;
        f.ledger.close_position(8, p.id, 33.0).await.unwrap();
        f.ledger.close_position(8, p.id, 100.0).await.unwrap();

        let acc = f.ledger.account(8).unwrap();
        assert!((acc.balance - 500.0).abs() < 1e-9);
        assert!(acc.realized_pnl.abs() < 1e-9);
    }

    #[tokio::test]
    async fn concurrent_buys_cannot_overspend() {
        let rules = Rules { max_position_pct: 1.0, cash_buffer_pct: 0.0, ..Rules::default() };
        let f = fixture_with(rules);
        f.ledger.grant_account(10, 200.0, 460.0).await.unwrap();
        f.oracle.set_price(TOK, 1.0);

        let (a, b) = tokio::join!(
            f.ledger.open_position(10, TOK, 150.0),
            f.ledger.open_position(10, TOK, 150.0)
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        let err = a.err().or(b.err()).unwrap();
        assert!(matches!(err, LedgerError::Rule(RuleError::InsufficientBalance { .. })));
        assert_eq!(f.ledger.account(10).unwrap().balance, 50.0);
        assert_eq!(f.ledger.positions(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn buy_exactly_to_zero_but_never_below() {
        let rules = Rules { max_position_pct: 1.0, cash_buffer_pct: 0.0, ..no_cooldown() };
        let f = fixture_with(rules);
        f.ledger.grant_account(15, 200.0, 460.0).await.unwrap();
        f.oracle.set_price(TOK, 1.0);

        let err = f.ledger.open_position(15, TOK, 200.0000000005).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(RuleError::InsufficientBalance { .. })));
        assert_eq!(f.ledger.account(15).unwrap().balance, 200.0);

        let out = f.ledger.open_position(15, TOK, 200.0).await.unwrap();
        assert_eq!(out.balance, 0.0);
        assert!(f.ledger.account(15).unwrap().balance >= 0.0);
    }

    #[tokio::test]
    async fn buy_cooldown_is_persisted_per_user() {
        let rules = Rules { buy_cooldown: chrono::Duration::seconds(60), ..Rules::default() };
        let f = fixture_with(rules);
        f.ledger.grant_account(16, 1000.0, 5000.0).await.unwrap();
        f.ledger.grant_account(17, 1000.0, 5000.0).await.unwrap();
        f.oracle.set_price(TOK, 1.0);

        f.ledger.open_position(16, TOK, 10.0).await.unwrap();
        assert!(f.ledger.account(16).unwrap().last_buy_at.is_some());
        let err = f.ledger.open_position(16, TOK2, 10.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(RuleError::BuyCooldown { .. })));
        // user lain tidak kena
        f.ledger.open_position(17, TOK, 10.0).await.unwrap();
        // close tidak dibatasi cooldown
        let p = f.ledger.positions(16).unwrap()[0].clone();
        f.ledger.close_position(16, p.id, 100.0).await.unwrap();
    }

    #[tokio::test]
    async fn trade_is_reported_even_if_refresh_fails() {
        let f = fixture();
        // status update ditolak SQLite -> refresh setelah commit gagal
        f.store
            .exec_batch(
                "CREATE TRIGGER no_status_change BEFORE UPDATE OF status ON accounts
                 WHEN NEW.status <> OLD.status BEGIN SELECT RAISE(ABORT, 'status locked'); END;",
            )
            .unwrap();
        // target di bawah start balance: refresh pertama langsung mau Passed
        f.ledger.grant_account(18, 200.0, 100.0).await.unwrap();
        f.oracle.set_price(TOK, 1.0);

        let open = f.ledger.open_position(18, TOK, 50.0).await.unwrap();
        assert!(open.evaluation.is_none());
        assert_eq!(f.ledger.positions(18).unwrap().len(), 1);
        assert_eq!(f.ledger.account(18).unwrap().balance, 150.0);

        let close = f.ledger.close_position(18, open.position.id, 100.0).await.unwrap();
        assert!(close.evaluation.is_none());
        assert!(f.ledger.positions(18).unwrap().is_empty());
        assert_eq!(f.ledger.account(18).unwrap().balance, 200.0);
    }

    #[tokio::test]
    async fn daily_trade_cap() {
        let rules = Rules { max_trades_per_day: 2, ..no_cooldown() };
        let f = fixture_with(rules);
        f.ledger.grant_account(11, 1000.0, 5000.0).await.unwrap();
        f.oracle.set_price(TOK, 1.0);

        f.ledger.open_position(11, TOK, 10.0).await.unwrap();
        f.ledger.open_position(11, TOK, 10.0).await.unwrap();
        let err = f.ledger.open_position(11, TOK, 10.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rule(RuleError::DailyTradeCapReached { cap: 2 })));
        assert_eq!(f.ledger.account(11).unwrap().trades_today, 2);
    }

    #[tokio::test]
    async fn drawdown_fails_account() {
        let f = fixture();
        f.ledger.grant_account(12, 1000.0, 5000.0).await.unwrap();
        f.oracle.set_price(TOK, 1.0);
        f.oracle.set_price(TOK2, 1.0);
        f.ledger.open_position(12, TOK, 300.0).await.unwrap();
        f.ledger.open_position(12, TOK2, 300.0).await.unwrap();

        f.oracle.set_price(TOK, 0.4);
        f.oracle.set_price(TOK2, 0.4);
        let ev = f.ledger.refresh(12).await.unwrap();
        assert_eq!(ev.equity, 640.0);
        assert_eq!(ev.drawdown_pct, 36.0);
        assert_eq!(ev.status, ChallengeStatus::FailedDrawdown);
        assert_eq!(f.ledger.active_users().unwrap(), Vec::<UserId>::new());
    }

    #[tokio::test]
    async fn inactivity_times_out() {
        let f = fixture();
        f.ledger.grant_account(13, 200.0, 460.0).await.unwrap();
        let ev = f.ledger.refresh(13).await.unwrap();
        assert_eq!(ev.status, ChallengeStatus::Active);

        let later = Utc::now() + f.ledger.rules().inactivity_timeout + chrono::Duration::minutes(1);
        let ev = f.ledger.refresh_at(13, later).await.unwrap();
        assert_eq!(ev.status, ChallengeStatus::FailedInactivity);
        assert_eq!(f.ledger.account(13).unwrap().status, ChallengeStatus::FailedInactivity);
    }

    #[tokio::test]
    async fn grant_replaces_prior_state() {
        let f = fixture();
        f.ledger.grant_account(14, 200.0, 460.0).await.unwrap();
        f.oracle.set_price(TOK, 1.0);
        f.ledger.open_position(14, TOK, 50.0).await.unwrap();

        let acc = f.ledger.grant_tier(14, 50).await.unwrap();
        assert_eq!((acc.start_balance, acc.target, acc.bounty), (500.0, 1150.0, 350.0));
        assert!(f.ledger.positions(14).unwrap().is_empty());
        assert_eq!(f.ledger.account(14).unwrap().balance, 500.0);

        let err = f.ledger.grant_tier(14, 25).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnknownTier(25)));
    }

    #[tokio::test]
    async fn unknown_account_is_reported() {
        let f = fixture();
        let err = f.ledger.open_position(77, TOK, 10.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(77)));
        assert!(matches!(f.ledger.refresh(77).await, Err(LedgerError::AccountNotFound(77))));
    }
}
