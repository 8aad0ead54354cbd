use std::time::Duration;

/// Configures per-attempt HTTP behavior of [`ApiClient`](crate::ApiClient).
#[derive(Clone, Debug, PartialEq)]
pub struct ClientOptions {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Policy used by the typed API helpers.
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Bounded retry with exponential backoff for one fetch call.
///
/// The delay slept after failed attempt `i` (zero-based) is
/// `min(initial_delay * backoff_multiplier^i, max_delay)`.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 are treated as 1.
    pub max_attempts: usize,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Growth factor applied each time a delay is used.
    pub backoff_multiplier: f64,
    /// Optional cap on a single delay.
    pub max_delay: Option<Duration>,
    /// HTTP statuses retried like transport failures. Empty by default:
    /// server-reported errors are terminal unless listed here.
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: None,
            retry_statuses: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// A policy that performs exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Marks the given HTTP statuses as retryable.
    pub fn retry_on_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retry_statuses.extend(statuses);
        self
    }

    /// Marks 429 and the common gateway/server 5xx statuses as retryable.
    pub fn retry_on_server_errors(self) -> Self {
        self.retry_on_statuses([429, 500, 502, 503, 504])
    }

    /// Number of attempts actually performed, never below one.
    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    /// Delay slept after failed attempt `attempt` (zero-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = attempt.min(64) as i32;
        let delay = scale(self.initial_delay, self.backoff_multiplier.powi(exp));
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    pub(crate) fn retries_status(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }
}

/// Reconnect backoff for [`EventChannel`](crate::EventChannel).
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect and after every successful open.
    pub initial_delay: Duration,
    /// Growth factor applied after each scheduled reconnect.
    pub multiplier: f64,
    /// Upper bound for a single reconnect delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Endpoint and reconnect behavior of an [`EventChannel`](crate::EventChannel).
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelConfig {
    /// Push endpoint, e.g. `ws://pos.local/ws`.
    pub url: String,
    pub reconnect: ReconnectPolicy,
    /// Keepalive ping period while open. `None` disables pings; a failed
    /// ping counts as a dropped connection.
    pub ping_interval: Option<Duration>,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim().to_owned(),
            reconnect: ReconnectPolicy::default(),
            ping_interval: None,
        }
    }

    /// Reads the endpoint from `POS_WS_URL`.
    pub fn from_env() -> std::result::Result<Self, String> {
        let url = std::env::var("POS_WS_URL")
            .map_err(|_| "missing POS_WS_URL environment variable".to_owned())?;
        if url.trim().is_empty() {
            return Err("POS_WS_URL is set but empty".to_owned());
        }
        Ok(Self::new(url))
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_ping_interval(mut self, period: Duration) -> Self {
        self.ping_interval = (!period.is_zero()).then_some(period);
        self
    }
}

/// Tracks the delay before the next reconnect attempt.
#[derive(Clone, Debug)]
pub(crate) struct ReconnectTimer {
    policy: ReconnectPolicy,
    current: Duration,
}

impl ReconnectTimer {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        let current = policy.initial_delay.min(policy.max_delay);
        Self { policy, current }
    }

    #[cfg(test)]
    pub(crate) fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay to wait now and grows the timer for the next failure.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = scale(self.current, self.policy.multiplier).min(self.policy.max_delay);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.policy.initial_delay.min(self.policy.max_delay);
    }
}

/// Multiplies a duration, saturating instead of panicking on overflow.
fn scale(base: Duration, factor: f64) -> Duration {
    let secs = base.as_secs_f64() * factor;
    if !secs.is_finite() || secs < 0.0 {
        return Duration::MAX;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
