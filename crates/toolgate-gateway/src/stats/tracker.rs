//! Per-tool latency history used for progress estimates.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use toolgate_core::clock::unix_timestamp_millis;

use crate::store::write_atomic;

/// Samples shorter than this are recorded as this.
pub const MIN_SAMPLE: Duration = Duration::from_micros(1);

/// Progress never reports completion while the call is still running.
pub const MAX_RUNNING_FRACTION: f64 = 0.99;

/// Latency history for one `(server, tool)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStatEntry {
    pub server: String,
    pub tool: String,
    pub count: u64,
    /// Running arithmetic mean of all samples, in milliseconds.
    pub mean_ms: f64,
    pub updated_at: i64,
}

impl CallStatEntry {
    /// `None` when `mean_ms` is negative, not finite or too large for a
    /// [`Duration`].
    pub fn mean(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.mean_ms / 1000.0).ok()
    }
}

/// Handle for an in-flight call. Pass it back to [`CallStatsTracker::record_end`].
#[derive(Debug)]
pub struct CallToken {
    id: u64,
    server: String,
    tool: String,
    started: Instant,
}

impl CallToken {
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Snapshot of a running call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub elapsed: Duration,
    /// `None` when the tool has no history yet.
    pub estimate: Option<Duration>,
    /// `elapsed / estimate`, capped at [`MAX_RUNNING_FRACTION`].
    pub fraction: Option<f64>,
}

type StatKey = (String, String);

/// Records call durations and serves estimates.
///
/// History is persisted to a JSON file after every completed call. A missing
/// or unreadable file means no history; persistence problems are logged and
/// never fail a call.
pub struct CallStatsTracker {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<StatKey, CallStatEntry>>,
    next_token: AtomicU64,
    persist_lock: tokio::sync::Mutex<()>,
}

impl CallStatsTracker {
    /// Tracker without persistence.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load history from `path` (if readable) and persist back to it.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = read_history(&path).await;
        debug!(path = %path.display(), tools = entries.len(), "Loaded call statistics");
        Self {
            path: Some(path),
            entries: Mutex::new(entries),
            next_token: AtomicU64::new(1),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn record_start(&self, server: &str, tool: &str) -> CallToken {
        CallToken {
            id: self.next_token.fetch_add(1, Ordering::Relaxed),
            server: server.to_string(),
            tool: tool.to_string(),
            started: Instant::now(),
        }
    }

    /// Finish a call, fold its duration into the mean and persist.
    /// Returns the recorded sample.
    pub async fn record_end(&self, token: CallToken) -> Duration {
        let sample = token.elapsed().max(MIN_SAMPLE);
        self.record_sample(&token.server, &token.tool, sample);

        #[cfg(feature = "metrics")]
        toolgate_core::metrics::record_tool_call(&token.server, &token.tool, sample);

        self.persist().await;
        sample
    }

    /// Fold one externally measured sample into the mean without persisting.
    pub fn record_sample(&self, server: &str, tool: &str, sample: Duration) {
        let sample_ms = sample.max(MIN_SAMPLE).as_secs_f64() * 1000.0;
        let now = unix_timestamp_millis();
        let Ok(mut entries) = self.entries.lock() else {
            warn!("Call statistics lock poisoned, dropping sample");
            return;
        };
        let entry = entries
            .entry((server.to_string(), tool.to_string()))
            .or_insert_with(|| CallStatEntry {
                server: server.to_string(),
                tool: tool.to_string(),
                count: 0,
                mean_ms: 0.0,
                updated_at: now,
            });
        entry.count += 1;
        #[allow(clippy::cast_precision_loss)]
        let count = entry.count as f64;
        entry.mean_ms += (sample_ms - entry.mean_ms) / count;
        entry.updated_at = now;
        debug!(
            server,
            tool,
            count = entry.count,
            mean_ms = entry.mean_ms,
            "Recorded call duration"
        );
    }

    /// Expected duration, or `None` when the tool has never completed.
    pub fn estimate(&self, server: &str, tool: &str) -> Option<Duration> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(&(server.to_string(), tool.to_string()))
            .and_then(CallStatEntry::mean)
    }

    pub fn progress(&self, token: &CallToken) -> Progress {
        let elapsed = token.elapsed();
        let estimate = self.estimate(&token.server, &token.tool);
        let fraction = estimate
            .filter(|e| !e.is_zero())
            .map(|e| (elapsed.as_secs_f64() / e.as_secs_f64()).min(MAX_RUNNING_FRACTION));
        Progress {
            elapsed,
            estimate,
            fraction,
        }
    }

    /// All entries, sorted by server then tool.
    pub fn snapshot(&self) -> Vec<CallStatEntry> {
        let mut entries: Vec<_> = self
            .entries
            .lock()
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| (&a.server, &a.tool).cmp(&(&b.server, &b.tool)));
        entries
    }

    async fn persist(&self) {
        let Some(path) = self.path.clone() else {
            return;
        };
        // Snapshots are taken in lock order so the last write wins with the
        // newest data.
        let _guard = self.persist_lock.lock().await;
        let bytes = match serde_json::to_vec_pretty(&self.snapshot()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to serialize call statistics");
                return;
            }
        };
        if let Err(e) = write_atomic(path.clone(), bytes, false).await {
            warn!(path = %path.display(), error = %e, "Failed to persist call statistics");
        }
    }
}

async fn read_history(path: &std::path::Path) -> HashMap<StatKey, CallStatEntry> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read call statistics, starting empty");
            return HashMap::new();
        }
    };
    match serde_json::from_str::<Vec<CallStatEntry>>(&content) {
        Ok(entries) => entries
            .into_iter()
            .filter(|e| {
                let usable = e.count > 0 && e.mean().is_some();
                if !usable {
                    warn!(
                        server = %e.server,
                        tool = %e.tool,
                        count = e.count,
                        mean_ms = e.mean_ms,
                        "Dropping unusable call statistics entry"
                    );
                }
                usable
            })
            .map(|e| ((e.server.clone(), e.tool.clone()), e))
            .collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt call statistics, starting empty");
            HashMap::new()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn unknown_until_first_sample_then_positive() {
        let tracker = CallStatsTracker::in_memory();
        assert_eq!(tracker.estimate("fs", "read_file"), None);

        let token = tracker.record_start("fs", "read_file");
        let sample = tracker.record_end(token).await;
        assert!(sample >= MIN_SAMPLE);

        let estimate = tracker.estimate("fs", "read_file").unwrap();
        assert!(estimate > Duration::ZERO);
    }

    #[test]
    fn mean_is_arithmetic() {
        let tracker = CallStatsTracker::in_memory();
        tracker.record_sample("s", "t", Duration::from_millis(100));
        tracker.record_sample("s", "t", Duration::from_millis(300));
        tracker.record_sample("s", "t", Duration::from_millis(200));

        let entry = &tracker.snapshot()[0];
        assert_eq!(entry.count, 3);
        assert!((entry.mean_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn zero_sample_is_clamped() {
        let tracker = CallStatsTracker::in_memory();
        tracker.record_sample("s", "t", Duration::ZERO);
        let estimate = tracker.estimate("s", "t").unwrap();
        assert!(estimate > Duration::ZERO);
        assert!(estimate <= Duration::from_micros(2));
    }

    #[test]
    fn progress_fraction_is_capped() {
        let tracker = CallStatsTracker::in_memory();
        let token = tracker.record_start("s", "slow");
        assert_eq!(tracker.progress(&token).fraction, None);

        tracker.record_sample("s", "slow", MIN_SAMPLE);
        std::thread::sleep(Duration::from_millis(2));
        let progress = tracker.progress(&token);
        assert_eq!(progress.fraction, Some(MAX_RUNNING_FRACTION));
        assert!(progress.elapsed >= Duration::from_millis(2));
    }

    #[tokio::test]
    async fn history_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats/call-stats.json");

        let tracker = CallStatsTracker::load(&path).await;
        let token = tracker.record_start("github", "create_issue");
        tracker.record_end(token).await;
        assert!(path.exists());

        let reloaded = CallStatsTracker::load(&path).await;
        assert!(reloaded.estimate("github", "create_issue").is_some());
        assert_eq!(reloaded.snapshot()[0].count, 1);
    }

    #[tokio::test]
    async fn corrupt_file_means_no_history() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("call-stats.json");
        std::fs::write(&path, "{{{").unwrap();

        let tracker = CallStatsTracker::load(&path).await;
        assert!(tracker.snapshot().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_mean_is_dropped_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("call-stats.json");
        std::fs::write(
            &path,
            r#"[{"server":"s","tool":"t","count":1,"mean_ms":1e300,"updated_at":0},
                {"server":"s","tool":"neg","count":1,"mean_ms":-5.0,"updated_at":0},
                {"server":"s","tool":"ok","count":2,"mean_ms":40.0,"updated_at":0}]"#,
        )
        .unwrap();

        let tracker = CallStatsTracker::load(&path).await;
        assert_eq!(tracker.estimate("s", "t"), None);
        assert_eq!(tracker.estimate("s", "neg"), None);
        assert_eq!(tracker.estimate("s", "ok"), Some(Duration::from_millis(40)));

        let token = tracker.record_start("s", "t");
        assert_eq!(tracker.progress(&token).fraction, None);
    }

    #[test]
    fn unrepresentable_mean_has_no_duration() {
        let entry = CallStatEntry {
            server: "s".into(),
            tool: "t".into(),
            count: 1,
            mean_ms: 1e300,
            updated_at: 0,
        };
        assert_eq!(entry.mean(), None);
    }

    #[tokio::test]
    async fn persist_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let tracker = CallStatsTracker::load(blocker.join("call-stats.json")).await;
        let token = tracker.record_start("s", "t");
        tracker.record_end(token).await;
        assert!(tracker.estimate("s", "t").is_some());
    }
}
