// ===============================
// src/store.rs (SQLite)
// ===============================
//
// Satu tabel akun (key user_id) + satu tabel posisi (FK user_id).
// Setiap operasi ledger yang mengubah state = satu transaksi SQLite,
// jadi debit balance tidak pernah tersimpan tanpa posisinya.
//
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::info;

use crate::domain::{Account, ChallengeStatus, Position, PositionId, UserId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    user_id          INTEGER PRIMARY KEY,
    balance          REAL NOT NULL,
    start_balance    REAL NOT NULL,
    peak_equity      REAL NOT NULL,
    target           REAL NOT NULL,
    bounty           REAL NOT NULL DEFAULT 0,
    status           TEXT NOT NULL DEFAULT 'active',
    realized_pnl     REAL NOT NULL DEFAULT 0,
    trades_today     INTEGER NOT NULL DEFAULT 0,
    trade_day        TEXT,
    created_at       INTEGER NOT NULL,
    last_activity_at INTEGER NOT NULL,
    last_buy_at      INTEGER
);
CREATE TABLE IF NOT EXISTS positions (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id        INTEGER NOT NULL REFERENCES accounts(user_id),
    token_id       TEXT NOT NULL,
    symbol         TEXT NOT NULL,
    cost_basis_usd REAL NOT NULL,
    tokens_held    REAL NOT NULL,
    entry_price    REAL NOT NULL,
    opened_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_positions_user ON positions(user_id);
";

const ACCOUNT_COLS: &str = "user_id, balance, start_balance, peak_equity, target, bounty, status, \
     realized_pnl, trades_today, trade_day, created_at, last_activity_at, last_buy_at";
const POSITION_COLS: &str =
    "id, user_id, token_id, symbol, cost_basis_usd, tokens_held, entry_price, opened_at";

/// Posisi baru sebelum dapat id dari SQLite
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub token_id: String,
    pub symbol: String,
    pub cost_basis_usd: f64,
    pub tokens_held: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms}")))
}

// Raw row -> Account (status/tanggal divalidasi setelah query)
struct AccountRow {
    user_id: i64,
    balance: f64,
    start_balance: f64,
    peak_equity: f64,
    target: f64,
    bounty: f64,
    status: String,
    realized_pnl: f64,
    trades_today: i64,
    trade_day: Option<String>,
    created_at: i64,
    last_activity_at: i64,
    last_buy_at: Option<i64>,
}

impl AccountRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: r.get(0)?,
            balance: r.get(1)?,
            start_balance: r.get(2)?,
            peak_equity: r.get(3)?,
            target: r.get(4)?,
            bounty: r.get(5)?,
            status: r.get(6)?,
            realized_pnl: r.get(7)?,
            trades_today: r.get(8)?,
            trade_day: r.get(9)?,
            created_at: r.get(10)?,
            last_activity_at: r.get(11)?,
            last_buy_at: r.get(12)?,
        })
    }

    fn into_account(self) -> Result<Account> {
        let status = ChallengeStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("status {}", self.status)))?;
        let trade_day = match self.trade_day {
            Some(d) => Some(
                NaiveDate::parse_from_str(&d, "%Y-%m-%d")
                    .map_err(|_| StoreError::Corrupt(format!("trade_day {d}")))?,
            ),
            None => None,
        };
        Ok(Account {
            user_id: self.user_id,
            balance: self.balance,
            start_balance: self.start_balance,
            peak_equity: self.peak_equity,
            target: self.target,
            bounty: self.bounty,
            status,
            realized_pnl: self.realized_pnl,
            trades_today: self.trades_today.max(0) as u32,
            trade_day,
            created_at: ms_to_dt(self.created_at)?,
            last_activity_at: ms_to_dt(self.last_activity_at)?,
            last_buy_at: self.last_buy_at.map(ms_to_dt).transpose()?,
        })
    }
}

struct PositionRow {
    id: i64,
    user_id: i64,
    token_id: String,
    symbol: String,
    cost_basis_usd: f64,
    tokens_held: f64,
    entry_price: f64,
    opened_at: i64,
}

impl PositionRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            user_id: r.get(1)?,
            token_id: r.get(2)?,
            symbol: r.get(3)?,
            cost_basis_usd: r.get(4)?,
            tokens_held: r.get(5)?,
            entry_price: r.get(6)?,
            opened_at: r.get(7)?,
        })
    }

    fn into_position(self) -> Result<Position> {
        Ok(Position {
            id: self.id,
            user_id: self.user_id,
            token_id: self.token_id,
            symbol: self.symbol,
            cost_basis_usd: self.cost_basis_usd,
            tokens_held: self.tokens_held,
            entry_price: self.entry_price,
            opened_at: ms_to_dt(self.opened_at)?,
        })
    }
}

fn update_account(conn: &Connection, a: &Account) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE accounts SET balance = ?2, peak_equity = ?3, status = ?4, realized_pnl = ?5,
             trades_today = ?6, trade_day = ?7, last_activity_at = ?8, last_buy_at = ?9
         WHERE user_id = ?1",
        params![
            a.user_id,
            a.balance,
            a.peak_equity,
            a.status.as_str(),
            a.realized_pnl,
            a.trades_today as i64,
            a.trade_day.map(|d| d.format("%Y-%m-%d").to_string()),
            a.last_activity_at.timestamp_millis(),
            a.last_buy_at.map(|t| t.timestamp_millis()),
        ],
    )
}

impl Store {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        // Pastikan parent directory ada (kalau ada)
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory database (testing)
    pub fn open_in_memory() -> Result<Self> {
        let store = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        // DB lama (sebelum kolom last_buy_at ada)
        let columns: Vec<String> = conn
            .prepare("PRAGMA table_info(accounts)")?
            .query_map([], |r| r.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if !columns.iter().any(|c| c == "last_buy_at") {
            conn.execute("ALTER TABLE accounts ADD COLUMN last_buy_at INTEGER", [])?;
            info!("store: migration added accounts.last_buy_at");
        }
        info!("store: schema ready");
        Ok(())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut conn)
    }

    pub fn load_account(&self, user_id: UserId) -> Result<Option<Account>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE user_id = ?1"),
                    [user_id],
                    AccountRow::from_row,
                )
                .optional()?;
            row.map(AccountRow::into_account).transpose()
        })
    }

    pub fn active_users(&self) -> Result<Vec<UserId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT user_id FROM accounts WHERE status = 'active' ORDER BY user_id")?;
            let ids = stmt
                .query_map([], |r| r.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    pub fn load_positions(&self, user_id: UserId) -> Result<Vec<Position>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {POSITION_COLS} FROM positions WHERE user_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map([user_id], PositionRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(PositionRow::into_position).collect()
        })
    }

    /// Posisi milik `user_id` saja; posisi user lain dianggap tidak ada.
    pub fn load_position(&self, user_id: UserId, id: PositionId) -> Result<Option<Position>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {POSITION_COLS} FROM positions WHERE id = ?1 AND user_id = ?2"),
                    params![id, user_id],
                    PositionRow::from_row,
                )
                .optional()?;
            row.map(PositionRow::into_position).transpose()
        })
    }

    /// Grant: hapus posisi lama + replace akun, satu transaksi.
    pub fn replace_account(&self, a: &Account) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM positions WHERE user_id = ?1", [a.user_id])?;
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO accounts ({ACCOUNT_COLS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    a.user_id,
                    a.balance,
                    a.start_balance,
                    a.peak_equity,
                    a.target,
                    a.bounty,
                    a.status.as_str(),
                    a.realized_pnl,
                    a.trades_today as i64,
                    a.trade_day.map(|d| d.format("%Y-%m-%d").to_string()),
                    a.created_at.timestamp_millis(),
                    a.last_activity_at.timestamp_millis(),
                    a.last_buy_at.map(|t| t.timestamp_millis()),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Buy: insert posisi + update akun (balance, trade count, activity), satu transaksi.
    pub fn commit_open(&self, a: &Account, p: &NewPosition) -> Result<Position> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO positions (user_id, token_id, symbol, cost_basis_usd, tokens_held, entry_price, opened_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    a.user_id,
                    p.token_id,
                    p.symbol,
                    p.cost_basis_usd,
                    p.tokens_held,
                    p.entry_price,
                    p.opened_at.timestamp_millis(),
                ],
            )?;
            let id = tx.last_insert_rowid();
            if update_account(&tx, a)? != 1 {
                return Err(StoreError::Corrupt(format!("account {} missing", a.user_id)));
            }
            tx.commit()?;
            Ok(Position {
                id,
                user_id: a.user_id,
                token_id: p.token_id.clone(),
                symbol: p.symbol.clone(),
                cost_basis_usd: p.cost_basis_usd,
                tokens_held: p.tokens_held,
                entry_price: p.entry_price,
                opened_at: p.opened_at,
            })
        })
    }

    /// Sell: update akun + update/hapus posisi, satu transaksi.
    pub fn commit_close(&self, a: &Account, id: PositionId, remaining: Option<&Position>) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if update_account(&tx, a)? != 1 {
                return Err(StoreError::Corrupt(format!("account {} missing", a.user_id)));
            }
            match remaining {
                Some(p) => {
                    tx.execute(
                        "UPDATE positions SET tokens_held = ?2, cost_basis_usd = ?3 WHERE id = ?1",
                        params![id, p.tokens_held, p.cost_basis_usd],
                    )?;
                }
                None => {
                    tx.execute("DELETE FROM positions WHERE id = ?1", [id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    #[cfg(test)]
    pub(crate) fn exec_batch(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch(sql)?))
    }

    /// Simpan peak / status hasil evaluate
    pub fn save_account(&self, a: &Account) -> Result<()> {
        self.with_conn(|conn| {
            if update_account(conn, a)? != 1 {
                return Err(StoreError::Corrupt(format!("account {} missing", a.user_id)));
            }
            Ok(())
        })
    }
}
