//! Playlist loop controller.
//!
//! Drives the per-item pipeline over the playlist forever, one entry at a
//! time, while a separate ticker persists the running time. The loop only
//! ends on a fatal error, on output process exit or when cancelled.

use std::sync::Arc;
use std::time::Duration;

use process_utils::ExitReport;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BackpressureBuffer, OutputChannel};
use crate::pipeline::ItemRunner;
use crate::playlist::{Playlist, PlaylistPosition};
use crate::status::{StatusRecord, StatusStore};
use crate::{Error, Result};

/// Backoff applied when a whole pass over the playlist failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// First delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for any delay in milliseconds.
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt.min(64) as i32);
        Duration::from_millis(base.min(self.max_delay_ms as f64) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Start from the persisted running time instead of the first entry.
    pub resume: bool,
    /// How often the running time is advanced and persisted.
    pub status_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            resume: false,
            status_interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Streaming { index: usize },
}

/// Runs the playlist into the shared output channel forever.
pub struct PlaylistLoop<R, C> {
    playlist: Arc<Playlist>,
    runner: R,
    buffer: BackpressureBuffer<C>,
    store: StatusStore,
    config: LoopConfig,
    state: watch::Sender<LoopState>,
}

impl<R, C> PlaylistLoop<R, C>
where
    R: ItemRunner<C>,
    C: OutputChannel + 'static,
{
    pub fn new(
        playlist: Arc<Playlist>,
        runner: R,
        buffer: BackpressureBuffer<C>,
        store: StatusStore,
        config: LoopConfig,
    ) -> Result<Self> {
        if config.status_interval.is_zero() {
            return Err(Error::config("status interval must be positive"));
        }
        let (state, _) = watch::channel(LoopState::Starting);
        Ok(Self {
            playlist,
            runner,
            buffer,
            store,
            config,
            state,
        })
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Running time the loop starts from: the persisted value when resuming,
    /// zero otherwise.
    pub fn start_time_ms(&self) -> u64 {
        if self.config.resume {
            self.store.read().running_time_ms
        } else {
            0
        }
    }

    /// Stream until a fatal error, output process exit or cancellation.
    ///
    /// Cancellation is a clean stop and returns `Ok(())`.
    pub async fn run(
        mut self,
        mut output_exit: oneshot::Receiver<ExitReport>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let seed_ms = self.start_time_ms();
        let start = self.playlist.locate(seed_ms);
        info!(
            entries = self.playlist.len(),
            loop_secs = self.playlist.total_ms() / 1000,
            running_time_ms = seed_ms,
            index = start.index,
            offset_ms = start.offset_ms,
            "Starting playlist loop"
        );

        let ticker_stop = cancel.child_token();
        let ticker = tokio::spawn(run_status_ticker(
            self.store.clone(),
            seed_ms,
            self.config.status_interval,
            ticker_stop.clone(),
        ));

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Stop requested");
                Ok(())
            }
            exit = &mut output_exit => {
                let report = exit.unwrap_or_default();
                error!(exit = %report, "Output process exited, stopping");
                Err(Error::OutputProcessExit(report))
            }
            err = self.stream_forever(start) => Err(err),
        };

        ticker_stop.cancel();
        if let Err(e) = ticker.await {
            warn!(error = %e, "Status ticker task failed");
        }
        result
    }

    /// Returns only with a fatal error.
    async fn stream_forever(&mut self, start: PlaylistPosition) -> Error {
        let playlist = Arc::clone(&self.playlist);
        let mut index = start.index;
        let mut offset_ms = start.offset_ms;
        let mut failures_in_a_row = 0usize;
        let mut backoff_attempt = 0u32;

        loop {
            let entry = &playlist[index];
            self.state.send_replace(LoopState::Streaming { index });
            info!(index, source_id = %entry.source_id, title = %entry.title, "Now playing");

            match self.runner.run_item(entry, offset_ms, &mut self.buffer).await {
                Ok(outcome) => {
                    debug!(index, bytes = outcome.stats.bytes_written, "Item completed");
                    failures_in_a_row = 0;
                    backoff_attempt = 0;
                }
                Err(e) if e.is_item_failure() => {
                    warn!(index, source_id = %entry.source_id, error = %e, "Item failed, skipping");
                    failures_in_a_row += 1;
                    if failures_in_a_row >= playlist.len() {
                        let delay = self.config.retry.delay_for_attempt(backoff_attempt);
                        warn!(
                            delay_ms = delay.as_millis() as u64,
                            "Every entry failed in a row, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        backoff_attempt = backoff_attempt.saturating_add(1);
                        failures_in_a_row = 0;
                    }
                }
                Err(e) => {
                    error!(index, source_id = %entry.source_id, error = %e, "Fatal error, stopping");
                    return e;
                }
            }

            offset_ms = 0;
            index = playlist.next_index(index);
        }
    }
}

/// Advance the running time on a fixed period and persist it.
///
/// The first tick fires one period after start. On stop a final record
/// including the partial period is written.
async fn run_status_ticker(store: StatusStore, seed_ms: u64, period: Duration, stop: CancellationToken) {
    let mut running_ms = seed_ms;
    let mut last_tick = Instant::now();
    let mut ticker = tokio::time::interval_at(last_tick + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                running_ms += period.as_millis() as u64;
                last_tick = Instant::now();
                persist(&store, running_ms).await;
            }
        }
    }

    running_ms += last_tick.elapsed().as_millis() as u64;
    persist(&store, running_ms).await;
    debug!(running_time_ms = running_ms, "Status ticker stopped");
}

async fn persist(store: &StatusStore, running_ms: u64) {
    if let Err(e) = store.write(&StatusRecord::new(running_ms)).await {
        warn!(error = %e, "Failed to persist running time, retrying next tick");
    }
}
