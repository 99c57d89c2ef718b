//! Child process supervision shared by the transcoder and the output process.

use std::io;

use process_utils::ExitReport;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::transcode::parse_progress;

/// Spawn a task that waits for `child` to exit and reports how it ended.
///
/// If `cancellation_token` fires first the child is killed and the report
/// reflects the kill.
pub fn spawn_exit_waiter(
    mut child: Child,
    label: &'static str,
    cancellation_token: CancellationToken,
) -> oneshot::Receiver<ExitReport> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let status = tokio::select! {
            _ = cancellation_token.cancelled() => {
                debug!(process = label, "Stop requested, killing process");
                let _ = child.kill().await;
                child.wait().await
            }
            status = child.wait() => status,
        };

        let report = match status {
            Ok(status) => ExitReport::from_status(status),
            Err(e) => {
                error!(process = label, error = %e, "Error waiting for process");
                ExitReport::default()
            }
        };
        if !report.success() {
            warn!(process = label, exit = %report, "Process exited unsuccessfully");
        }
        let _ = tx.send(report);
    });

    rx
}

/// Log every record of an ffmpeg-style stderr stream.
///
/// Progress lines go to trace, lines mentioning errors to warn, everything
/// else to debug.
pub async fn log_stderr<R>(stderr: R, label: &'static str, source_id: String)
where
    R: AsyncRead + Unpin,
{
    let mut records = StderrRecords::new(stderr);
    loop {
        match records.next_record().await {
            Ok(Some(line)) => {
                if let Some(progress) = parse_progress(&line) {
                    trace!(
                        process = label,
                        source_id = %source_id,
                        time_secs = progress.time_secs,
                        speed = progress.speed,
                        "Progress"
                    );
                } else if line.to_ascii_lowercase().contains("error") {
                    warn!(process = label, source_id = %source_id, "{line}");
                } else {
                    debug!(process = label, source_id = %source_id, "{line}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(process = label, error = %e, "Stopped reading stderr");
                break;
            }
        }
    }
}

/// Splits an ffmpeg stderr stream into records at `\r` or `\n`.
///
/// Progress updates end in a bare `\r`; line-based reading would hold them
/// back until the next newline.
pub struct StderrRecords<R> {
    reader: BufReader<R>,
    record: Vec<u8>,
}

impl<R> StderrRecords<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            record: Vec::new(),
        }
    }

    /// Next non-blank record, or `None` once the stream has ended.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(take_record(&mut self.record));
            }

            match buf.iter().position(|b| matches!(b, b'\n' | b'\r')) {
                Some(end) => {
                    self.record.extend_from_slice(&buf[..end]);
                    self.reader.consume(end + 1);
                    if let Some(record) = take_record(&mut self.record) {
                        return Ok(Some(record));
                    }
                }
                None => {
                    let len = buf.len();
                    self.record.extend_from_slice(buf);
                    self.reader.consume(len);
                }
            }
        }
    }
}

fn take_record(bytes: &mut Vec<u8>) -> Option<String> {
    let text = String::from_utf8_lossy(bytes).trim().to_string();
    bytes.clear();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn progress_records_end_at_carriage_returns() {
        let (mut tx, rx) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let _ = tx
                .write_all(b"Input #0\rframe=1 time=00:00:01.00 speed=1x\r\n  \r\nlast")
                .await;
        });

        let mut reader = StderrRecords::new(rx);
        let mut records = Vec::new();
        while let Some(line) = reader.next_record().await.unwrap() {
            records.push(line);
        }

        assert_eq!(
            records,
            vec!["Input #0", "frame=1 time=00:00:01.00 speed=1x", "last"]
        );
    }

    #[tokio::test]
    async fn waiter_reports_exit_code() {
        let child = process_utils::tokio_command("sh")
            .args(["-c", "exit 4"])
            .stdout(Stdio::null())
            .spawn()
            .unwrap();

        let report = spawn_exit_waiter(child, "test", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report, ExitReport::exited(4));
    }

    #[tokio::test]
    async fn waiter_kills_on_cancel() {
        let child = process_utils::tokio_command("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let token = CancellationToken::new();

        let rx = spawn_exit_waiter(child, "test", token.clone());
        token.cancel();

        let report = rx.await.unwrap();
        assert!(!report.success());
        assert_eq!(report.signal, Some(9));
    }
}
