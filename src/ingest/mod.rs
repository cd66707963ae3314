//! Sensor Log Ingest
//!
//! Tails the append-only JSON-lines files written by the intrusion sensor and
//! the honeypot, surviving rotation (new inode) and truncation (size shrinks
//! below the current offset), and normalizes each surviving record into an
//! [`Event`](crate::types::Event).
//!
//! The tailer never fails: a missing file or an I/O error just means "sleep
//! and retry". Malformed lines are dropped by the normalizers.

mod canary;
mod suricata;

pub use canary::parse_canary_line;
pub use suricata::SuricataNormalizer;

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Poll period between reads once the file exists.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Back-off while the file is absent.
const ABSENT_RETRY: Duration = Duration::from_secs(1);

/// Follows one append-only log file and emits raw text lines.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    skip_existing: bool,
}

impl LogTailer {
    pub fn new(path: PathBuf, skip_existing: bool) -> Self {
        Self { path, skip_existing }
    }

    /// Run until the stop signal flips or the receiver side goes away.
    ///
    /// Emits only complete newline-terminated lines; a partial trailing line
    /// is left unconsumed until its newline arrives.
    pub async fn run(&self, tx: mpsc::Sender<String>, mut stop: watch::Receiver<bool>) {
        let mut offset: Option<u64> = None;

        info!("📜 Tailing {:?} (skip_existing={})", self.path, self.skip_existing);

        loop {
            if *stop.borrow() {
                return;
            }

            let size = match tokio::fs::metadata(&self.path).await {
                Ok(meta) => meta.len(),
                Err(_) => {
                    if sleep_or_stop(ABSENT_RETRY, &mut stop).await {
                        return;
                    }
                    continue;
                }
            };

            // First sighting: start at EOF unless the backlog was requested.
            let pos = match offset {
                Some(pos) if size < pos => {
                    debug!("Log {:?} truncated/rotated, resetting offset", self.path);
                    0
                }
                Some(pos) => pos,
                None => {
                    if self.skip_existing {
                        size
                    } else {
                        0
                    }
                }
            };

            match self.read_from(pos).await {
                Ok((lines, new_pos)) => {
                    offset = Some(new_pos);
                    for line in lines {
                        if tx.send(line).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    // Transient I/O: keep the offset, retry on the next poll
                    debug!("Read error on {:?}: {}", self.path, e);
                }
            }

            if sleep_or_stop(POLL_INTERVAL, &mut stop).await {
                return;
            }
        }
    }

    /// Read complete lines from `pos` to EOF; returns them with the new offset.
    async fn read_from(&self, pos: u64) -> std::io::Result<(Vec<String>, u64)> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(pos)).await?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        // Only consume up to the last newline; the remainder is not yet a line.
        let consumed = match buf.iter().rposition(|&b| b == b'\n') {
            Some(idx) => idx + 1,
            None => return Ok((Vec::new(), pos)),
        };

        let lines = String::from_utf8_lossy(&buf[..consumed])
            .lines()
            .map(|l| l.to_string())
            .collect();

        Ok((lines, pos + consumed as u64))
    }
}

/// Sleep for `duration`, returning true if the stop signal fired meanwhile.
async fn sleep_or_stop(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *stop.borrow(),
        res = stop.changed() => res.is_err() || *stop.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn collect_lines(
        tailer: LogTailer,
        expect: usize,
        timeout: Duration,
    ) -> (Vec<String>, watch::Sender<bool>) {
        let (tx, mut rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move { tailer.run(tx, stop_rx).await });

        let mut lines = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        while lines.len() < expect {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(line)) => lines.push(line),
                _ => break,
            }
        }
        (lines, stop_tx)
    }

    #[tokio::test]
    async fn test_tailer_reads_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eve.json");
        std::fs::write(&path, "old line\n").unwrap();

        let tailer = LogTailer::new(path.clone(), true);
        let (tx, mut rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move { tailer.run(tx, stop_rx).await });

        // Give the tailer a chance to position itself at EOF
        tokio::time::sleep(Duration::from_millis(700)).await;

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "new line").unwrap();
        drop(f);

        let line = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("tailer produced no line")
            .unwrap();
        assert_eq!(line, "new line");
        let _ = stop_tx.send(true);
    }

    #[tokio::test]
    async fn test_tailer_reads_backlog_without_skip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eve.json");
        std::fs::write(&path, "first\nsecond\n").unwrap();

        let tailer = LogTailer::new(path, false);
        let (lines, stop_tx) = collect_lines(tailer, 2, Duration::from_secs(3)).await;
        assert_eq!(lines, vec!["first".to_string(), "second".to_string()]);
        let _ = stop_tx.send(true);
    }

    #[tokio::test]
    async fn test_tailer_survives_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eve.json");
        std::fs::write(&path, "aaaa\nbbbb\ncccc\n").unwrap();

        let tailer = LogTailer::new(path.clone(), true);
        let (tx, mut rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move { tailer.run(tx, stop_rx).await });

        tokio::time::sleep(Duration::from_millis(700)).await;

        // Rotation: the file is replaced by a shorter one
        std::fs::write(&path, "after\n").unwrap();

        let line = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("tailer produced no line after truncation")
            .unwrap();
        assert_eq!(line, "after");
        let _ = stop_tx.send(true);
    }

    #[tokio::test]
    async fn test_partial_line_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eve.json");
        std::fs::write(&path, "complete\npartial-without-newline").unwrap();

        let tailer = LogTailer::new(path.clone(), false);
        let (lines, stop_tx) = collect_lines(tailer, 1, Duration::from_secs(2)).await;
        assert_eq!(lines, vec!["complete".to_string()]);
        let _ = stop_tx.send(true);
    }
}
