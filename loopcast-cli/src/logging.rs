//! Console and rolling-file logging with local timestamps.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Days, Local, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "loopcast=info,loopcast_engine=info";

const LOG_FILE_PREFIX: &str = "loopcast.log";

/// Log retention period in days.
const LOG_RETENTION_DAYS: u64 = 7;

/// Timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

fn build_filter(verbose: bool, quiet: bool) -> EnvFilter {
    if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("loopcast=debug,loopcast_engine=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

/// Initialize console logging, plus a daily rolling file under `log_dir`
/// when given.
///
/// Keep the returned guard alive for the whole run or buffered file output
/// is lost.
pub fn init_logging(log_dir: Option<&Path>, verbose: bool, quiet: bool) -> Result<Option<WorkerGuard>> {
    let console = fmt::layer().with_target(verbose).with_timer(LocalTimer);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(build_filter(verbose, quiet))
            .with(console)
            .try_init()
            .context("Failed to set global default subscriber")?;
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(build_filter(verbose, quiet))
        .with(console)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .context("Failed to set global default subscriber")?;

    Ok(Some(guard))
}

/// Delete rotated log files older than the retention period, once at start
/// and then daily.
pub fn start_retention_cleanup(log_dir: PathBuf, cancel: CancellationToken) {
    tokio::spawn(async move {
        let cleanup_interval = Duration::from_secs(24 * 60 * 60);

        loop {
            if let Err(e) = cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                warn!(error = %e, "Failed to cleanup old logs");
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Log retention cleanup task shutting down");
                    break;
                }
                _ = tokio::time::sleep(cleanup_interval) => {}
            }
        }
    });
}

/// Whether `file_name` is a daily rotation of the loopcast log dated before
/// `cutoff`.
fn is_expired_rotation(file_name: &str, cutoff: NaiveDate) -> bool {
    file_name
        .strip_prefix(LOG_FILE_PREFIX)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
        .is_some_and(|date| date < cutoff)
}

/// Remove rotations older than `retention_days`. Rotation dates are UTC.
async fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> std::io::Result<usize> {
    let cutoff = Utc::now().date_naive() - Days::new(retention_days);
    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_expired_rotation(name, cutoff) || !entry.file_type().await?.is_file() {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                removed += 1;
                debug!(file = name, "Removed expired log");
            }
            Err(e) => warn!(file = name, error = %e, "Failed to remove expired log"),
        }
    }

    if removed > 0 {
        info!(count = removed, retention_days, "Expired logs removed");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_follows_the_rotation_date() {
        let cutoff = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        assert!(is_expired_rotation("loopcast.log.2026-03-09", cutoff));
        assert!(!is_expired_rotation("loopcast.log.2026-03-10", cutoff));
        assert!(!is_expired_rotation("loopcast.log", cutoff));
        assert!(!is_expired_rotation("loopcast.log.backup", cutoff));
        assert!(!is_expired_rotation("loopcast.log2026-03-01", cutoff));
        assert!(!is_expired_rotation("ffmpeg.log.2020-01-01", cutoff));
    }

    #[tokio::test]
    async fn removes_only_expired_rotations() {
        let dir = tempfile::tempdir().unwrap();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let old = dir.path().join("loopcast.log.2020-01-01");
        let current = dir.path().join(format!("loopcast.log.{today}"));
        let unrelated = dir.path().join("ffmpeg.log");
        for path in [&old, &current, &unrelated] {
            std::fs::write(path, "x").unwrap();
        }
        // A directory with a rotation name is left alone.
        std::fs::create_dir(dir.path().join("loopcast.log.2019-01-01")).unwrap();

        let removed = cleanup_old_logs(dir.path(), LOG_RETENTION_DAYS).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(current.exists());
        assert!(unrelated.exists());
        assert!(dir.path().join("loopcast.log.2019-01-01").is_dir());
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cleanup_old_logs(&dir.path().join("nope"), 7).await.is_err());
    }
}
