use std::collections::BTreeSet;
use std::time::Duration;

use http::Method;
use rand::Rng;

use crate::error::{TimeoutPhase, TransportErrorKind};

/// Everything the retry policy is allowed to look at when classifying a
/// failed attempt.
#[derive(Clone, Debug)]
pub struct RetryDecision {
    pub attempt: usize,
    pub max_attempts: usize,
    pub method: Method,
    pub url: String,
    pub kind: Option<TransportErrorKind>,
    pub timeout_phase: Option<TimeoutPhase>,
    /// True once any response byte was received. Such failures are never
    /// retried: the request may have had side effects on the server.
    pub response_started: bool,
}

/// Stateless retry policy value. Constructed per agent from the
/// configured retry count; no shared mutable state.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_retries: usize,
    base_backoff: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
    retryable_kinds: BTreeSet<TransportErrorKind>,
    retryable_timeout_phases: BTreeSet<TimeoutPhase>,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn disabled() -> Self {
        Self::with_retries(0)
    }

    pub fn with_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            jitter_ratio: 0.2,
            retryable_kinds: default_retryable_kinds(),
            retryable_timeout_phases: default_retryable_timeout_phases(),
        }
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff.max(Duration::from_millis(1));
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn retryable_kinds(mut self, kinds: impl IntoIterator<Item = TransportErrorKind>) -> Self {
        self.retryable_kinds = kinds.into_iter().collect();
        self
    }

    pub(crate) fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    /// Retry iff the attempt budget allows another try and the failure
    /// was transport-transient with no response bytes received.
    pub(crate) fn should_retry(&self, decision: &RetryDecision) -> bool {
        if decision.attempt >= decision.max_attempts {
            return false;
        }
        if decision.response_started {
            return false;
        }
        if let Some(kind) = decision.kind {
            return self.retryable_kinds.contains(&kind);
        }
        if let Some(phase) = decision.timeout_phase {
            return self.retryable_timeout_phases.contains(&phase);
        }
        false
    }

    pub(crate) fn backoff_for_retry(&self, retry_index: usize) -> Duration {
        let capped_exponent = retry_index.saturating_sub(1).min(31) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.base_backoff.as_millis().max(1);
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }

        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let mut rng = rand::rng();
        let sampled_ms = rng.random_range(low..=high).min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

fn default_retryable_kinds() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::Dns,
        TransportErrorKind::Connect,
        TransportErrorKind::Tls,
        TransportErrorKind::NoResponse,
    ]
    .into_iter()
    .collect()
}

fn default_retryable_timeout_phases() -> BTreeSet<TimeoutPhase> {
    [TimeoutPhase::Connect].into_iter().collect()
}

/// Decides how long a released connection may sit idle before eviction.
#[derive(Clone, Copy, Debug)]
pub(crate) struct KeepAlivePolicy {
    keep_alive: Duration,
}

impl KeepAlivePolicy {
    pub(crate) fn new(keep_alive: Duration) -> Self {
        Self { keep_alive }
    }

    /// `None` means the connection must be closed after this call. A
    /// server `Keep-Alive: timeout=N` hint wins over the configured
    /// fallback, matching the original agent's keep-alive strategy.
    pub(crate) fn idle_allowance(&self, response_headers: &[(String, String)]) -> Option<Duration> {
        if self.keep_alive.is_zero() {
            return None;
        }
        Some(parse_keep_alive_timeout(response_headers).unwrap_or(self.keep_alive))
    }
}

fn parse_keep_alive_timeout(headers: &[(String, String)]) -> Option<Duration> {
    let value = crate::util::header_value(headers, "keep-alive")?;
    value.split(',').find_map(|part| {
        let (name, seconds) = part.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("timeout") {
            seconds.trim().parse::<u64>().ok().map(Duration::from_secs)
        } else {
            None
        }
    })
}
