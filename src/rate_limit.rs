use std::time::Duration;
use tokio::time::Instant;
use tokio::sync::Mutex;

/// Spaces calls at least `60s / calls` apart.
pub struct SimpleRateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl SimpleRateLimiter {
    pub fn per_minute(calls: u32) -> Self {
        let per = if calls == 0 { 60_000 } else { 60_000 / calls as u64 };
        Self { min_interval: Duration::from_millis(per), last: Mutex::new(None) }
    }

    /// `None` when no pacing is configured.
    pub fn optional(rate_per_min: Option<u32>) -> Option<Self> {
        rate_per_min.filter(|r| *r > 0).map(Self::per_minute)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let next_ok = prev + self.min_interval;
            let now = Instant::now();
            if now < next_ok {
                tokio::time::sleep(next_ok - now).await;
            }
        }
        *last = Some(Instant::now());
    }
}
