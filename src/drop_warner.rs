use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default interval between dropped-record warnings.
pub const DEFAULT_WARN_INTERVAL: Duration = Duration::from_secs(5);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Rate limits dropped-record warnings on the hot logging path.
///
/// Producers increment the counter via [`record_drop`](Self::record_drop);
/// [`warn_if_due`](Self::warn_if_due) invokes the callback with the count
/// accumulated since the last emission once the interval has elapsed, and
/// [`flush`](Self::flush) reports immediately. A lifetime total is kept
/// separately so callers can observe overall loss.
pub struct DropWarner {
    interval_secs: u64,
    last_warn: AtomicU64,
    pending: AtomicU64,
    total: AtomicU64,
}

impl DropWarner {
    /// Create a warner; the first warning may fire immediately.
    pub fn new(interval: Duration) -> Self {
        let interval_secs = interval.as_secs().max(1);
        Self {
            interval_secs,
            last_warn: AtomicU64::new(now_secs().saturating_sub(interval_secs)),
            pending: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    /// Count one dropped record.
    pub fn record_drop(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Total records dropped over the warner's lifetime.
    pub fn total_dropped(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Emit a warning when the rate-limit interval has elapsed.
    pub fn warn_if_due(&self, mut warn: impl FnMut(u64)) {
        let now = now_secs();
        let prev = self.last_warn.load(Ordering::Relaxed);
        if now.saturating_sub(prev) >= self.interval_secs {
            let count = self.pending.swap(0, Ordering::Relaxed);
            if count > 0 {
                warn(count);
            }
            self.last_warn.store(now, Ordering::Relaxed);
        }
    }

    /// Report any pending drops immediately.
    pub fn flush(&self, mut warn: impl FnMut(u64)) {
        let count = self.pending.swap(0, Ordering::Relaxed);
        if count > 0 {
            warn(count);
            self.last_warn.store(now_secs(), Ordering::Relaxed);
        }
    }
}

impl Default for DropWarner {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_INTERVAL)
    }
}
