//! Progress reporting and cooperative cancellation, shared by every engine.
//!
//! The teacher (`flashthing`) hand-rolls a running average inline inside
//! `write_large_memory_to_disk` and `restore_partition`. This generalizes
//! that into one rolling-window throughput tracker (spec §4.2/§4.7: "report
//! at most every 256 KiB sent... throughput computed over a sliding window
//! of >= 200ms") and a shared cancellation primitive (spec §4.8).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// A shared flag a caller can set to cooperatively abort a long-running
/// operation. Checked at I/O suspension points and at least once per 64 KiB
/// inside hot loops, per spec §4.8.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self(Arc::new(AtomicBool::new(false)))
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  /// Returns `Err(Error::Cancelled)` if cancellation has been requested.
  /// Call this at every suspension point and at least once per 64 KiB of
  /// I/O inside hot loops.
  pub fn check(&self) -> Result<()> {
    if self.is_cancelled() {
      Err(Error::Cancelled)
    } else {
      Ok(())
    }
  }
}

/// Events emitted during a flashing or extraction operation.
///
/// Listeners are called synchronously on the session's task and must not
/// block, per spec §5 ("Shared-resource policy").
#[derive(Debug, Clone)]
pub enum Event {
  FindingDevice,
  Connecting,
  Connected,
  Disconnected,
  Progress(Progress),
  Step(String),
  Log(String),
}

/// Callback type for receiving [`Event`]s.
pub type Callback = Arc<dyn Fn(Event) + Send + Sync>;

/// `(bytes_done, total_bytes, instantaneous_throughput_bytes_per_sec)`,
/// reported at most every 256 KiB transferred and at the end of every
/// sub-block, per spec §4.2.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
  pub bytes_done: u64,
  pub total_bytes: u64,
  pub bytes_per_sec: f64,
  pub elapsed: Duration,
}

impl Progress {
  pub fn percent(&self) -> f64 {
    if self.total_bytes == 0 {
      100.0
    } else {
      (self.bytes_done as f64 / self.total_bytes as f64) * 100.0
    }
  }

  pub fn eta(&self) -> Duration {
    if self.bytes_per_sec <= 0.0 {
      return Duration::ZERO;
    }
    let remaining = self.total_bytes.saturating_sub(self.bytes_done) as f64;
    Duration::from_secs_f64(remaining / self.bytes_per_sec)
  }
}

const REPORT_INTERVAL_BYTES: u64 = 256 * 1024;
const MIN_WINDOW: Duration = Duration::from_millis(200);

/// Tracks cumulative bytes transferred and reports throughput over a
/// sliding window of at least 200ms, falling back to the rolling average
/// since start while the window has not yet elapsed (spec §4.2).
pub struct ProgressTracker {
  started_at: Instant,
  total_bytes: u64,
  bytes_done: u64,
  last_report_at_bytes: u64,
  window_start: Instant,
  window_start_bytes: u64,
}

impl ProgressTracker {
  pub fn new(total_bytes: u64) -> Self {
    let now = Instant::now();
    Self {
      started_at: now,
      total_bytes,
      bytes_done: 0,
      last_report_at_bytes: 0,
      window_start: now,
      window_start_bytes: 0,
    }
  }

  /// Record `n` additional bytes transferred. Returns a [`Progress`]
  /// snapshot when a report is due (every 256 KiB, or when `force` is set
  /// for the final sub-block), `None` otherwise.
  pub fn advance(&mut self, n: u64, force: bool) -> Option<Progress> {
    self.bytes_done += n;

    let since_last_report = self.bytes_done - self.last_report_at_bytes;
    if !force && since_last_report < REPORT_INTERVAL_BYTES {
      return None;
    }
    self.last_report_at_bytes = self.bytes_done;

    let now = Instant::now();
    let window_elapsed = now.duration_since(self.window_start);
    let bytes_per_sec = if window_elapsed >= MIN_WINDOW {
      let window_bytes = self.bytes_done - self.window_start_bytes;
      let rate = window_bytes as f64 / window_elapsed.as_secs_f64();
      // slide the window forward so the next report is fresh
      self.window_start = now;
      self.window_start_bytes = self.bytes_done;
      rate
    } else {
      let total_elapsed = now.duration_since(self.started_at).as_secs_f64();
      if total_elapsed > 0.0 {
        self.bytes_done as f64 / total_elapsed
      } else {
        0.0
      }
    };

    Some(Progress {
      bytes_done: self.bytes_done,
      total_bytes: self.total_bytes,
      bytes_per_sec,
      elapsed: now.duration_since(self.started_at),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cancel_token_starts_uncancelled() {
    let token = CancelToken::new();
    assert!(token.check().is_ok());
    token.cancel();
    assert!(matches!(token.check(), Err(Error::Cancelled)));
  }

  #[test]
  fn progress_reports_only_every_256kib_unless_forced() {
    let mut tracker = ProgressTracker::new(1024 * 1024);
    assert!(tracker.advance(1024, false).is_none());
    assert!(tracker.advance(1024, true).is_some());
  }

  #[test]
  fn progress_percent_and_eta() {
    let p = Progress {
      bytes_done: 50,
      total_bytes: 100,
      bytes_per_sec: 50.0,
      elapsed: Duration::from_secs(1),
    };
    assert_eq!(p.percent(), 50.0);
    assert_eq!(p.eta(), Duration::from_secs(1));
  }
}
