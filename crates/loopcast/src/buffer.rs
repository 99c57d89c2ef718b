//! Backpressure-aware batching between the transcoder and the shared output
//! channel.
//!
//! Transcoder output is accumulated and written in batches of at least
//! `flush_threshold` bytes. When the channel reports that it is full, the
//! session's [`FlowGate`] is closed so both upstream sources stop reading;
//! once the channel drains the gate opens again for both at once.

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Default batch size: large enough to amortize write overhead, small enough
/// to keep added latency negligible at streaming bitrates.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Write side of the shared output channel, with explicit flow control.
#[async_trait]
pub trait OutputChannel: Send {
    /// Whether the channel can take another batch without queueing further.
    fn is_ready(&self) -> bool;

    /// Write one batch. Returns whether the channel is still ready afterwards.
    ///
    /// The batch is always accepted in full; a `false` return only asks the
    /// caller to hold off until [`OutputChannel::ready`] resolves.
    async fn write_batch(&mut self, batch: Bytes) -> io::Result<bool>;

    /// Resolve once the channel has drained and is ready again.
    async fn ready(&mut self) -> io::Result<()>;

    /// Push everything queued inside the channel to the reader.
    async fn flush(&mut self) -> io::Result<()>;
}

/// Pause switch shared by both upstream sources of one session.
///
/// There is a single flag for the pair, so the sources are always paused and
/// resumed together.
#[derive(Debug, Clone)]
pub struct FlowGate {
    paused: std::sync::Arc<watch::Sender<bool>>,
}

impl Default for FlowGate {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            paused: std::sync::Arc::new(tx),
        }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// A handle for one upstream source to wait on.
    pub fn permit(&self) -> FlowPermit {
        FlowPermit {
            paused: self.paused.subscribe(),
        }
    }
}

/// Source-side view of a [`FlowGate`].
#[derive(Debug)]
pub struct FlowPermit {
    paused: watch::Receiver<bool>,
}

impl FlowPermit {
    /// Wait until the gate is open.
    ///
    /// Returns immediately when the gate has been dropped, so a source never
    /// hangs on a finished session.
    pub async fn acquire(&mut self) {
        let _ = self.paused.wait_for(|paused| !*paused).await;
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

/// Byte accounting for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    /// Bytes received from the transcoder.
    pub bytes_accepted: u64,
    /// Bytes handed to the output channel.
    pub bytes_written: u64,
    /// Number of channel writes.
    pub batches: u64,
    /// Number of times the upstream sources were paused.
    pub pauses: u64,
}

/// Accumulates transcoder output and writes it to the shared channel.
pub struct BackpressureBuffer<C> {
    channel: C,
    pending: Vec<Bytes>,
    pending_len: usize,
    flush_threshold: usize,
    channel_ready: bool,
    gate: FlowGate,
    stats: SessionStats,
}

impl<C: OutputChannel> BackpressureBuffer<C> {
    pub fn new(channel: C) -> Self {
        Self::with_threshold(channel, DEFAULT_FLUSH_THRESHOLD)
    }

    pub fn with_threshold(channel: C, flush_threshold: usize) -> Self {
        let channel_ready = channel.is_ready();
        Self {
            channel,
            pending: Vec::new(),
            pending_len: 0,
            flush_threshold: flush_threshold.max(1),
            channel_ready,
            gate: FlowGate::new(),
            stats: SessionStats::default(),
        }
    }

    /// Begin a new session and return the gate its sources must observe.
    pub fn start_session(&mut self) -> FlowGate {
        self.stats = SessionStats::default();
        self.gate = FlowGate::new();
        if !self.channel_ready {
            self.gate.pause();
        }
        self.gate.clone()
    }

    /// Queue one chunk of transcoder output.
    pub fn accept(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.pending_len += chunk.len();
        self.stats.bytes_accepted += chunk.len() as u64;
        self.pending.push(chunk);
    }

    /// Write the accumulated batch if it is large enough and the channel is
    /// ready. Returns whether a write happened.
    pub async fn flush_if_ready(&mut self) -> Result<bool> {
        if self.pending_len < self.flush_threshold || !self.channel_ready {
            return Ok(false);
        }
        self.write_pending().await?;
        Ok(true)
    }

    /// Wait for the channel to drain, then resume both sources.
    ///
    /// Cancel safe: if the future is dropped, the buffer stays not-ready and
    /// the call can be retried.
    pub async fn wait_drained(&mut self) -> Result<()> {
        if self.channel_ready {
            return Ok(());
        }
        self.channel.ready().await.map_err(Error::ChannelWrite)?;
        self.channel_ready = true;
        self.gate.resume();
        trace!("Output channel drained, sources resumed");
        Ok(())
    }

    /// End the session: write any residual bytes regardless of readiness,
    /// then wait for the channel to hand them to the reader.
    pub async fn finish(&mut self) -> Result<SessionStats> {
        if self.pending_len > 0 {
            self.write_pending().await?;
        }
        self.channel.flush().await.map_err(Error::ChannelWrite)?;
        self.channel_ready = true;
        // The next session starts from a clean gate; no source is left paused.
        self.gate.resume();
        debug!(
            bytes = self.stats.bytes_written,
            batches = self.stats.batches,
            pauses = self.stats.pauses,
            "Session flushed"
        );
        Ok(self.stats)
    }

    pub fn is_channel_ready(&self) -> bool {
        self.channel_ready
    }

    pub fn pending_len(&self) -> usize {
        self.pending_len
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    async fn write_pending(&mut self) -> Result<()> {
        let batch = if self.pending.len() == 1 {
            self.pending.pop().unwrap_or_default()
        } else {
            let mut joined = BytesMut::with_capacity(self.pending_len);
            for chunk in self.pending.drain(..) {
                joined.extend_from_slice(&chunk);
            }
            joined.freeze()
        };
        self.pending.clear();
        self.pending_len = 0;

        let len = batch.len() as u64;
        let still_ready = self
            .channel
            .write_batch(batch)
            .await
            .map_err(Error::ChannelWrite)?;
        self.stats.bytes_written += len;
        self.stats.batches += 1;

        if !still_ready && self.channel_ready {
            self.channel_ready = false;
            self.gate.pause();
            self.stats.pauses += 1;
            trace!("Output channel full, sources paused");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// In-memory channel that randomly reports back-pressure.
    pub struct RandomChannel {
        pub received: Vec<u8>,
        pub writes: usize,
        ready: bool,
        rng: StdRng,
        busy_probability: f64,
    }

    impl RandomChannel {
        pub fn new(seed: u64, busy_probability: f64) -> Self {
            Self {
                received: Vec::new(),
                writes: 0,
                ready: true,
                rng: StdRng::seed_from_u64(seed),
                busy_probability,
            }
        }
    }

    #[async_trait]
    impl OutputChannel for RandomChannel {
        fn is_ready(&self) -> bool {
            self.ready
        }

        async fn write_batch(&mut self, batch: Bytes) -> io::Result<bool> {
            self.received.extend_from_slice(&batch);
            self.writes += 1;
            self.ready = !self.rng.random_bool(self.busy_probability);
            Ok(self.ready)
        }

        async fn ready(&mut self) -> io::Result<()> {
            tokio::task::yield_now().await;
            self.ready = true;
            Ok(())
        }

        async fn flush(&mut self) -> io::Result<()> {
            self.ready = true;
            Ok(())
        }
    }
}
