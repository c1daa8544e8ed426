// ===============================
// src/notifier.rs
// ===============================
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::{ChallengeStatus, StatusChange};

/// Konsumsi notifikasi transisi status. Formatting/delivery ke chat ada di luar service ini.
pub async fn run(mut rx: mpsc::Receiver<StatusChange>) {
    while let Some(c) = rx.recv().await {
        match c.new_status {
            ChallengeStatus::Passed => {
                info!(user_id = c.user_id, equity = c.equity, "PASSED")
            }
            ChallengeStatus::FailedDrawdown | ChallengeStatus::FailedInactivity => {
                warn!(user_id = c.user_id, equity = c.equity, status = %c.new_status, "FAILED")
            }
            ChallengeStatus::Active => {}
        }
    }
    info!("notifier: channel closed, stopped");
}
