// ===============================
// src/console.rs (operator console di stdin)
// ===============================
//
// Pengganti chat layer untuk operator / demo. Satu command per baris:
//   grant <user> <fee>                 -> grant sesuai tier (fee 20/30/40/50)
//   grant_custom <user> <start> <tgt>  -> grant langsung
//   quick <user> <token> <n>           -> buy nominal preset ke-n (QUICK_AMOUNTS)
//   buy <user> <token> <usd>           -> buy nominal custom
//   sell <user> <position_id> <pct>    -> jual sebagian / semua
//   pos <user>                         -> refresh + daftar posisi
//   quote <token>
//   help | quit
//
// quick & buy sama-sama jadi Command::Buy -> ledger.open_position (satu jalur).
//
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::domain::{Evaluation, PositionId, UserId};
use crate::ledger::ChallengeLedger;
use crate::positions::market_value;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Grant { user: UserId, fee: u32 },
    GrantCustom { user: UserId, start: f64, target: f64 },
    Buy { user: UserId, token: String, usd: f64 },
    Sell { user: UserId, position: PositionId, percent: f64 },
    Positions { user: UserId },
    Quote { token: String },
    Help,
    Quit,
}

const HELP: &str = "commands: grant <user> <fee> | grant_custom <user> <start> <target> | \
quick <user> <token> <n> | buy <user> <token> <usd> | sell <user> <position_id> <pct> | \
pos <user> | quote <token> | help | quit";

/// Filter alamat token Solana: base58, 32..=48 karakter
pub fn is_token_address(s: &str) -> bool {
    (32..=48).contains(&s.len())
        && s.chars().all(|c| c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l'))
}

fn arg<T: std::str::FromStr>(parts: &[&str], i: usize, what: &str) -> std::result::Result<T, String> {
    parts
        .get(i)
        .ok_or_else(|| format!("missing {what}"))?
        .parse()
        .map_err(|_| format!("invalid {what}: {}", parts[i]))
}

fn token_arg(parts: &[&str], i: usize) -> std::result::Result<String, String> {
    let t = parts.get(i).ok_or("missing token")?;
    if is_token_address(t) {
        Ok(t.to_string())
    } else {
        Err(format!("not a token address: {t}"))
    }
}

pub fn parse(line: &str, quick_amounts: &[f64]) -> std::result::Result<Command, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(cmd) = parts.first() else {
        return Err("empty command".into());
    };
    match cmd.to_ascii_lowercase().as_str() {
        "grant" => Ok(Command::Grant { user: arg(&parts, 1, "user")?, fee: arg(&parts, 2, "fee")? }),
        "grant_custom" => Ok(Command::GrantCustom {
            user: arg(&parts, 1, "user")?,
            start: arg(&parts, 2, "start balance")?,
            target: arg(&parts, 3, "target")?,
        }),
        "quick" => {
            let n: usize = arg(&parts, 3, "preset")?;
            let usd = n
                .checked_sub(1)
                .and_then(|i| quick_amounts.get(i))
                .copied()
                .ok_or_else(|| format!("preset must be 1..={}", quick_amounts.len()))?;
            Ok(Command::Buy { user: arg(&parts, 1, "user")?, token: token_arg(&parts, 2)?, usd })
        }
        "buy" => Ok(Command::Buy {
            user: arg(&parts, 1, "user")?,
            token: token_arg(&parts, 2)?,
            usd: arg(&parts, 3, "amount")?,
        }),
        "sell" => Ok(Command::Sell {
            user: arg(&parts, 1, "user")?,
            position: arg(&parts, 2, "position id")?,
            percent: arg(&parts, 3, "percent")?,
        }),
        "pos" | "positions" => Ok(Command::Positions { user: arg(&parts, 1, "user")? }),
        "quote" => Ok(Command::Quote { token: token_arg(&parts, 1)? }),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command: {other}")),
    }
}

/// Jalankan satu command, hasilnya teks untuk operator. Rejection -> alasan spesifik.
pub async fn execute(ledger: &ChallengeLedger, cmd: Command) -> String {
    match cmd {
        Command::Grant { user, fee } => match ledger.grant_tier(user, fee).await {
            Ok(a) => format!(
                "CHALLENGE STARTED user={} capital=${:.2} target=${:.2} bounty=${:.2} max_dd={}%",
                a.user_id, a.start_balance, a.target, a.bounty, ledger.rules().max_drawdown_pct
            ),
            Err(e) => format!("REJECTED: {e}"),
        },
        Command::GrantCustom { user, start, target } => match ledger.grant_account(user, start, target).await {
            Ok(a) => format!("CHALLENGE STARTED user={} capital=${:.2} target=${:.2}", a.user_id, a.start_balance, a.target),
            Err(e) => format!("REJECTED: {e}"),
        },
        Command::Buy { user, token, usd } => match ledger.open_position(user, &token, usd).await {
            Ok(o) => format!(
                "BUY #{} {} size=${:.2} tokens={:.4} entry=${} remaining=${:.2} {}",
                o.position.id,
                o.position.symbol,
                usd,
                o.position.tokens_held,
                o.position.entry_price,
                o.balance,
                eval_summary(o.evaluation.as_ref())
            ),
            Err(e) => format!("REJECTED: {e}"),
        },
        Command::Sell { user, position, percent } => match ledger.close_position(user, position, percent).await {
            Ok(c) => format!(
                "SELL {}% #{} price=${}{} proceeds=${:.2} pnl={:+.2} balance=${:.2} {}",
                c.percent,
                c.position_id,
                c.fill_price,
                if c.fallback_price { " (entry, no quote)" } else { "" },
                c.proceeds,
                c.realized_pnl,
                c.balance,
                eval_summary(c.evaluation.as_ref())
            ),
            Err(e) => format!("REJECTED: {e}"),
        },
        Command::Positions { user } => match positions_report(ledger, user).await {
            Ok(s) => s,
            Err(e) => format!("REJECTED: {e}"),
        },
        Command::Quote { token } => match ledger.quote(&token).await {
            Some(q) => format!(
                "{} ${} mc={}",
                q.symbol,
                q.price,
                q.market_cap_usd.map(|m| format!("${:.2}M", m / 1_000_000.0)).unwrap_or_else(|| "n/a".into())
            ),
            None => format!("no price for {token}"),
        },
        Command::Help => HELP.to_string(),
        Command::Quit => "bye".to_string(),
    }
}

// Refresh gagal setelah commit: trade tetap jalan, status menyusul di `pos`
fn eval_summary(ev: Option<&Evaluation>) -> String {
    match ev {
        Some(e) => format!("equity=${:.2} status={}", e.equity, e.status),
        None => "status=pending (refresh failed)".to_string(),
    }
}

async fn positions_report(ledger: &ChallengeLedger, user: UserId) -> crate::ledger::Result<String> {
    let ev = ledger.refresh(user).await?;
    let acc = ledger.account(user)?;
    let positions = ledger.positions(user)?;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "user={} status={} equity=${:.2} cash=${:.2} unrealized={:+.2} drawdown={:.2}% (max {}%) peak=${:.2} target=${:.2}",
        user,
        ev.status,
        ev.equity,
        acc.balance,
        ev.unrealized_pnl,
        ev.drawdown_pct,
        ledger.rules().max_drawdown_pct,
        ev.peak_equity,
        acc.target
    );
    if positions.is_empty() {
        out.push_str("no open positions");
    }
    for p in &positions {
        let px = ledger.quote(&p.token_id).await.map(|q| q.price).unwrap_or(p.entry_price);
        let value = market_value(p, px);
        let _ = writeln!(
            out,
            "  #{} {} tokens={:.4} cost=${:.2} value=${:.2} pnl={:+.2}",
            p.id,
            p.symbol,
            p.tokens_held,
            p.cost_basis_usd,
            value,
            value - p.cost_basis_usd
        );
    }
    Ok(out.trim_end().to_string())
}

pub async fn run(ledger: Arc<ChallengeLedger>, quick_amounts: Vec<f64>) -> Result<()> {
    info!("console: ready (type `help`)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse(&line, &quick_amounts) {
            Ok(Command::Quit) => break,
            Ok(cmd) => println!("{}", execute(&ledger, cmd).await),
            Err(e) => println!("ERROR: {e} ({HELP})"),
        }
    }
    info!("console: stdin closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Rules;
    use crate::oracle::MockOracle;
    use crate::store::Store;
    use std::time::Duration;

    const TOK: &str = "So11111111111111111111111111111111111111112";
    const PRESETS: [f64; 4] = [20.0, 50.0, 100.0, 250.0];

    #[test]
    fn token_filter() {
        assert!(is_token_address(TOK));
        assert!(!is_token_address("short"));
        assert!(!is_token_address("0o11111111111111111111111111111111111111112"));
    }

    #[test]
    fn quick_and_custom_buy_parse_to_same_command() {
        let quick = parse(&format!("quick 5 {TOK} 2"), &PRESETS).unwrap();
        let custom = parse(&format!("buy 5 {TOK} 50"), &PRESETS).unwrap();
        assert_eq!(quick, custom);
        assert_eq!(custom, Command::Buy { user: 5, token: TOK.into(), usd: 50.0 });
    }

    #[test]
    fn parse_errors_are_specific() {
        assert_eq!(parse(&format!("quick 5 {TOK} 9"), &PRESETS), Err("preset must be 1..=4".into()));
        assert_eq!(parse("sell 5 x 50", &PRESETS), Err("invalid position id: x".into()));
        assert_eq!(parse("buy 5", &PRESETS), Err("missing token".into()));
        assert!(parse("dance", &PRESETS).is_err());
        assert_eq!(parse("SELL 1 2 25", &PRESETS), Ok(Command::Sell { user: 1, position: 2, percent: 25.0 }));
    }

    #[tokio::test]
    async fn rejection_names_the_rule() {
        let oracle = Arc::new(MockOracle::new());
        oracle.set_price(TOK, 1.0);
        let ledger = ChallengeLedger::new(
            Rules::default(),
            Arc::new(Store::open_in_memory().unwrap()),
            oracle,
            Duration::from_secs(1),
        )
        .with_tiers(crate::config::parse_tiers(crate::config::DEFAULT_TIERS));

        let out = execute(&ledger, Command::Grant { user: 1, fee: 20 }).await;
        assert!(out.starts_with("CHALLENGE STARTED"));
        let out = execute(&ledger, Command::Buy { user: 1, token: TOK.into(), usd: 100.0 }).await;
        assert!(out.contains("position too large"), "{out}");
        let out = execute(&ledger, Command::Buy { user: 1, token: TOK.into(), usd: 50.0 }).await;
        assert!(out.starts_with("BUY #"), "{out}");
        assert!(out.contains("status=active"), "{out}");
        let out = execute(&ledger, Command::Buy { user: 1, token: TOK.into(), usd: 20.0 }).await;
        assert!(out.contains("buy cooldown"), "{out}");
        let out = execute(&ledger, Command::Positions { user: 1 }).await;
        assert!(out.contains("status=active"), "{out}");
    }
}
