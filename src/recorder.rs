// ===============================
// src/recorder.rs
// ===============================
//
// Snapshot journal (JSONL):
// - Setiap snapshot sukses & setiap siklus gagal = satu baris JSON.
// - BufWriter, flush tiap 1s dan tiap N event.
// - Parent directory dibuat otomatis.
// - Tulis gagal -> reopen file sekali, kalau masih gagal event dibuang.
//
// ENV: `RECORD_FILE=/path/to/pnl.jsonl` untuk mengaktifkan.
//
use std::path::Path;

use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 100;

async fn open_writer(path: &str) -> std::io::Result<BufWriter<fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<fs::File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "journal: open failed, journaling disabled");
            // drain supaya pengirim tidak pernah penuh
            while rx.recv().await.is_some() {}
            return;
        }
    };
    info!(%path, "journal: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;
    let mut written: u64 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!(written, "journal: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "journal: serialize error, skip event");
                        continue;
                    }
                };

                if let Err(e) = write_line(&mut writer, &line).await {
                    warn!(?e, "journal: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(w) => writer = w,
                        Err(e2) => {
                            error!(?e2, "journal: reopen failed, drop event");
                            continue;
                        }
                    }
                    if let Err(e2) = write_line(&mut writer, &line).await {
                        error!(?e2, "journal: write failed again after reopen, drop event");
                        continue;
                    }
                }
                written += 1;

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
    use crate::domain::{now_iso, PnLMetrics};

    #[tokio::test]
    async fn writes_one_line_per_event_and_flushes_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal").join("pnl.jsonl");
        let path_s = path.to_string_lossy().to_string();

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run(rx, path_s));
        tx.send(Event::Snapshot(PnLMetrics::zeroed())).await.unwrap();
        tx.send(Event::CycleFailed { message: "boom".into(), timestamp: now_iso() })
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let kinds: Vec<String> = body
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["kind"].to_string())
            .collect();
        assert_eq!(kinds, vec!["\"snapshot\"", "\"cycle_failed\""]);
    }
}
