// ===============================
// src/recorder.rs
// ===============================
//
// Audit log JSONL untuk event ledger (grant / open / close / reject / transition):
// - Satu Event per baris, append.
// - BufWriter, flush tiap 1s atau tiap 1000 event.
// - Parent directory dibuat otomatis.
// - Tulis gagal -> reopen file sekali, kalau masih gagal event di-drop.
//
// ENV: `RECORD_FILE=/path/to/ledger.jsonl` (atau `--record-file`).
//
use std::path::Path;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 1000;

async fn open_writer(path: &str) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, recording disabled");
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    // Channel closed: flush dan keluar
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };

                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(w) => writer = w,
                        Err(e2) => {
                            error!(?e2, "recorder: reopen failed, drop event");
                            continue;
                        }
                    }
                    if let Err(e2) = write_line(&mut writer, &line).await {
                        error!(?e2, "recorder: write failed again after reopen, drop event");
                        continue;
                    }
                }

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChallengeStatus, StatusChange};

    #[tokio::test]
    async fn writes_one_json_line_per_event() {
        let dir = std::env::temp_dir().join(format!("crucible-rec-{}", std::process::id()));
        let path = dir.join("nested").join("events.jsonl");
        let path_str = path.to_string_lossy().to_string();
        let _ = std::fs::remove_dir_all(&dir);

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run(rx, path_str.clone()));
        tx.send(Event::Grant { user_id: 1, start_balance: 200.0, target: 460.0, ts_ms: 1 }).await.unwrap();
        tx.send(Event::Transition(StatusChange {
            user_id: 1,
            new_status: ChallengeStatus::Passed,
            equity: 500.0,
        }))
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: Event = serde_json::from_str(lines[1]).unwrap();
        assert!(matches!(second, Event::Transition(StatusChange { new_status: ChallengeStatus::Passed, .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
