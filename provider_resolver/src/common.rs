use reqwest::StatusCode;
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let value = value?.to_str().ok()?.trim();
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

pub fn truncate_for_log(text: &str) -> String {
    let trimmed = text.trim();
    let max_len = 300usize;
    if trimmed.len() <= max_len {
        return trimmed.to_string();
    }
    let mut cut = max_len;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &trimmed[..cut])
}

/// Minimum spacing between request starts, shared by every clone of a client.
#[derive(Debug, Clone)]
pub struct RateSlot {
    next_slot: Arc<Mutex<Instant>>,
    min_interval: Duration,
}

impl RateSlot {
    pub fn per_second(requests_per_second: u32) -> Self {
        let min_interval = if requests_per_second == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / requests_per_second as f64)
        };
        Self {
            next_slot: Arc::new(Mutex::new(Instant::now())),
            min_interval,
        }
    }

    pub async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut guard = self.next_slot.lock().await;
        let now = Instant::now();
        if *guard > now {
            sleep(*guard - now).await;
        }
        *guard = Instant::now() + self.min_interval;
    }
}

pub fn next_backoff(current: Duration) -> Duration {
    (current + current).min(Duration::from_secs(60))
}

pub fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Trims a value and maps empty strings to `None`.
pub fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}
