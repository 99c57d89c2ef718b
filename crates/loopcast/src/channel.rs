//! Named-pipe implementation of the shared output channel.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::net::unix::pipe;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::buffer::OutputChannel;

/// How often to retry opening a FIFO that has no reader yet.
const READER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Open the write side of a FIFO, waiting for a reader to attach.
///
/// Opening a FIFO for writing fails with `ENXIO` while nobody has it open for
/// reading; that case is retried until `timeout` elapses (forever when
/// `None`). Other errors are returned immediately.
pub async fn open_fifo_writer(path: &Path, timeout: Option<Duration>) -> io::Result<pipe::Sender> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(sender),
            Err(e) if process_utils::is_fifo_without_reader(&e) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no reader attached to {}", path.display()),
                    ));
                }
                tokio::time::sleep(READER_POLL_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Non-blocking writer for the run-long FIFO the output process reads.
///
/// Bytes the pipe cannot take right away are kept in an internal queue; the
/// channel reports itself ready while that queue is below the high-water
/// mark.
pub struct FifoChannel {
    path: PathBuf,
    sender: pipe::Sender,
    pending: BytesMut,
    high_water_mark: usize,
    delivered: u64,
}

impl FifoChannel {
    /// Attach to the FIFO at `path`, waiting up to `timeout` for its reader.
    pub async fn open(path: &Path, high_water_mark: usize, timeout: Duration) -> io::Result<Self> {
        let sender = open_fifo_writer(path, Some(timeout)).await?;
        info!(path = %path.display(), "Output channel attached");
        Ok(Self::from_sender(path, sender, high_water_mark))
    }

    pub fn from_sender(path: &Path, sender: pipe::Sender, high_water_mark: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            sender,
            pending: BytesMut::new(),
            high_water_mark: high_water_mark.max(1),
            delivered: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes that reached the pipe so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Bytes accepted but not yet taken by the pipe.
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    fn try_drain(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            match self.sender.try_write(&self.pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending.advance(n);
                    self.delivered += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OutputChannel for FifoChannel {
    fn is_ready(&self) -> bool {
        self.pending.len() < self.high_water_mark
    }

    async fn write_batch(&mut self, batch: Bytes) -> io::Result<bool> {
        self.pending.extend_from_slice(&batch);
        self.try_drain()?;
        Ok(self.is_ready())
    }

    async fn ready(&mut self) -> io::Result<()> {
        while !self.is_ready() {
            self.sender.writable().await?;
            self.try_drain()?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            self.sender.writable().await?;
            self.try_drain()?;
        }
        debug!(delivered = self.delivered, "Output channel flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    /// Upper bound for any single FIFO operation in these tests.
    const STEP_TIMEOUT: Duration = Duration::from_secs(5);

    async fn within<F: Future>(fut: F) -> F::Output {
        tokio::time::timeout(STEP_TIMEOUT, fut)
            .await
            .expect("fifo operation timed out")
    }

    fn fifo_in(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("stream.fifo");
        process_utils::ensure_fifo(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn writes_reach_the_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_in(&dir);
        let mut reader = pipe::OpenOptions::new().open_receiver(&path).unwrap();

        let mut channel = within(FifoChannel::open(&path, 64 * 1024, Duration::from_secs(1)))
            .await
            .unwrap();
        within(channel.write_batch(Bytes::from_static(b"hello fifo")))
            .await
            .unwrap();
        within(channel.flush()).await.unwrap();

        let mut buf = [0u8; 10];
        within(reader.read_exact(&mut buf)).await.unwrap();
        assert_eq!(&buf, b"hello fifo");
        assert_eq!(channel.delivered(), 10);
    }

    #[tokio::test]
    async fn slow_reader_causes_backpressure_without_loss() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_in(&dir);
        let mut reader = pipe::OpenOptions::new().open_receiver(&path).unwrap();

        let mut channel = within(FifoChannel::open(&path, 16 * 1024, Duration::from_secs(1)))
            .await
            .unwrap();

        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let still_ready = within(channel.write_batch(Bytes::from(payload.clone())))
            .await
            .unwrap();
        assert!(!still_ready, "1 MiB cannot fit in a pipe buffer");
        assert!(!channel.is_ready());

        let read_all = tokio::spawn(async move {
            let mut out = vec![0u8; 1024 * 1024];
            reader.read_exact(&mut out).await.unwrap();
            out
        });

        within(channel.ready()).await.unwrap();
        assert!(channel.is_ready());
        within(channel.flush()).await.unwrap();
        assert_eq!(channel.queued(), 0);

        assert_eq!(within(read_all).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn open_times_out_without_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_in(&dir);

        let err = within(FifoChannel::open(&path, 1024, Duration::from_millis(150)))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn nothing_is_delivered_once_reader_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo_in(&dir);
        let reader = pipe::OpenOptions::new().open_receiver(&path).unwrap();

        let mut channel = within(FifoChannel::open(&path, 1024, Duration::from_secs(1)))
            .await
            .unwrap();
        drop(reader);

        // More than any pipe buffer holds, so it can never be fully taken.
        let payload = Bytes::from(vec![7u8; 1024 * 1024]);
        let delivered = match within(channel.write_batch(payload)).await {
            // Linux reports EPIPE on the first write.
            Err(e) => {
                assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);
                false
            }
            // Otherwise draining must fail or never complete.
            Ok(_) => matches!(
                tokio::time::timeout(Duration::from_millis(500), channel.flush()).await,
                Ok(Ok(()))
            ),
        };
        assert!(!delivered, "a gone reader must never take the whole batch");
        assert!(channel.delivered() < 1024 * 1024);
    }
}
