// ===============================
// src/sweeper.rs
// ===============================
//
// Inactivity sweep: tiap interval, refresh semua akun Active supaya akun
// yang tidak pernah disentuh tetap bisa kena FailedInactivity (atau drawdown).
// Idempotent; aman jalan bareng operasi per-akun (lock per-akun di ledger).
//
use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::ledger::ChallengeLedger;
use crate::metrics::{ACCOUNTS_ACTIVE, SWEEPS};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub transitioned: usize,
    pub errors: usize,
}

/// Satu putaran sweep. Error satu akun tidak menghentikan sweep.
pub async fn sweep_once(ledger: &ChallengeLedger) -> SweepReport {
    let users = match ledger.active_users() {
        Ok(u) => u,
        Err(e) => {
            error!(?e, "sweep: list active accounts failed");
            return SweepReport { errors: 1, ..SweepReport::default() };
        }
    };

    let mut report = SweepReport { scanned: users.len(), ..SweepReport::default() };
    for user_id in users {
        match ledger.refresh(user_id).await {
            Ok(ev) if ev.transition.is_some() => report.transitioned += 1,
            Ok(_) => {}
            Err(e) => {
                warn!(user_id, error = %e, "sweep: refresh failed");
                report.errors += 1;
            }
        }
    }

    ACCOUNTS_ACTIVE.set((report.scanned - report.transitioned) as i64);
    SWEEPS.inc();
    report
}

pub async fn run(ledger: Arc<ChallengeLedger>, every: Duration) {
    info!(every_secs = every.as_secs(), "sweeper: started");
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tick.tick().await;
        let r = sweep_once(&ledger).await;
        info!(scanned = r.scanned, transitioned = r.transitioned, errors = r.errors, "sweep done");
    }
}
