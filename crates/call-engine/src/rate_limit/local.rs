use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    expires_at: Instant,
}

/// In-process fixed-window counters
///
/// Used when no shared store is configured and as the fallback whenever the
/// shared store fails.
#[derive(Debug, Default)]
pub struct LocalWindowCounter {
    windows: Mutex<HashMap<String, Window>>,
}

impl LocalWindowCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one hit against `key`, opening a new window if none is live
    pub fn hit(&self, key: &str, window: Duration) -> u64 {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let entry = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            expires_at: now + window,
        });
        if entry.expires_at <= now {
            *entry = Window {
                count: 0,
                expires_at: now + window,
            };
        }
        entry.count += 1;
        entry.count
    }

    /// Remove closed windows, returning how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| w.expires_at > now);
        before - windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_expiry() {
        let counter = LocalWindowCounter::new();
        let window = Duration::from_secs(60);
        assert_eq!(counter.hit("k", window), 1);
        assert_eq!(counter.hit("k", window), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(counter.hit("k", window), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_drops_closed_windows() {
        let counter = LocalWindowCounter::new();
        counter.hit("short", Duration::from_secs(1));
        counter.hit("long", Duration::from_secs(120));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(counter.cleanup_expired(), 1);
        assert_eq!(counter.len(), 1);
    }
}
