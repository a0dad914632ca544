//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff applied to transient submission failures.
///
/// The delay before retry `n` (1-based) is `base_delay * multiplier^(n-1)`,
/// capped at `max_delay`. Once an operation has failed transiently more than
/// `max_retries` times it is marked failed and surfaced to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    pub multiplier: f64,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay to wait after the `retry`-th transient failure.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay.as_millis() as f64;
        let exponent = (retry - 1).min(i32::MAX as u32) as i32;
        let delay = base * self.multiplier.max(1.0).powi(exponent);
        let capped = delay.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `retry_count` transient failures.
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count <= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

/// Configuration for a [`SyncCoordinator`](crate::SyncCoordinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Identifier of this device, sent with every submission.
    pub device_id: String,
    /// How long connectivity must be stable before reporting online.
    #[serde(with = "duration_ms")]
    pub debounce: Duration,
    /// Upper bound for a single network request.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Optional periodic drain while online.
    #[serde(with = "opt_duration_ms")]
    pub periodic_sync: Option<Duration>,
    /// Trigger a drain right after an enqueue when online.
    pub sync_on_enqueue: bool,
}

impl SyncConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_periodic_sync(mut self, interval: Duration) -> Self {
        self.periodic_sync = Some(interval);
        self
    }

    pub fn with_sync_on_enqueue(mut self, enabled: bool) -> Self {
        self.sync_on_enqueue = enabled;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            debounce: Duration::from_secs(3),
            request_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            periodic_sync: None,
            sync_on_enqueue: false,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
    }
}
