//! Restart delays after agent crashes.
//!
//! Scheduled runs double a base delay per crash and give up after a fixed
//! number of attempts. Manual runs back off linearly without a cap on
//! attempts. Crashes that look like provider rate limits use a separate
//! exponential schedule, or the provider's own retry hint when one is found
//! in the agent output.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;

/// Longest delay used for rate limits and retry hints.
pub const MAX_RATE_LIMIT_DELAY: Duration = Duration::from_secs(3600);

/// Longest delay for ordinary crashes in manual runs.
pub const MAX_ERROR_DELAY: Duration = Duration::from_secs(300);

const ERROR_STEP: Duration = Duration::from_secs(30);
const RATE_LIMIT_BASE: Duration = Duration::from_secs(15);

#[allow(clippy::expect_used)]
static RATE_LIMIT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)\brate[_\s]?limit",
        r"|\btoo\s+many\s+requests",
        r"|\bhttp\s*429\b",
        r"|\bstatus\s*429\b",
        r"|\berror\s*429\b",
        r"|\b429\s+too\s+many",
        r"|\b(?:server|api|system)\s+(?:is\s+)?overloaded\b",
        r"|\bquota\s*exceeded\b",
    ))
    .expect("valid rate limit regex (verified by tests)")
});

#[allow(clippy::expect_used)]
static RETRY_AFTER_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)retry.?after[:\s]+(\d+)\s*(?:seconds?|s\b)",
        r"(?i)retry.?after[:\s]+(\d+)(?:\s*$|\s*[,.])",
        r"(?i)try again in\s+(\d+)\s*(?:seconds?|s\b)",
        r"(?i)try again in\s+(\d+)(?:\s*$|\s*[,.])",
        r"(?i)(\d+)\s*seconds?\s*(?:remaining|left|until)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid retry-after regex (verified by tests)"))
    .collect()
});

/// Whether a line of agent output reports a rate limit.
pub fn is_rate_limit(text: &str) -> bool {
    RATE_LIMIT_REGEX.is_match(text)
}

/// Seconds from hints like `Retry-After: 60` or `try again in 5 seconds`.
/// Other units are not recognized.
pub fn parse_retry_after(text: &str) -> Option<u64> {
    RETRY_AFTER_REGEXES
        .iter()
        .find_map(|re| re.captures(text)?.get(1)?.as_str().parse().ok())
}

/// Rate limit seen in an agent's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitSignal {
    pub retry_after_secs: Option<u64>,
}

/// Scan one output line for a rate limit.
pub fn detect_rate_limit(line: &str) -> Option<RateLimitSignal> {
    is_rate_limit(line).then(|| RateLimitSignal {
        retry_after_secs: parse_retry_after(line),
    })
}

/// `base * 2^(attempt - 1)` for 1-based `attempt`.
pub fn scheduled_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// `min(30s * attempt, 300s)`, at least one second.
pub fn error_backoff(attempt: u32) -> Duration {
    ERROR_STEP
        .saturating_mul(attempt)
        .clamp(Duration::from_secs(1), MAX_ERROR_DELAY)
}

/// `min(15s * 2^retries, 3600s)` for 0-based `retries`.
pub fn rate_limit_backoff(retries: u32) -> Duration {
    let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
    RATE_LIMIT_BASE
        .saturating_mul(factor)
        .clamp(Duration::from_secs(1), MAX_RATE_LIMIT_DELAY)
}

/// Clamp a provider hint to `1..=3600` seconds.
pub fn clamp_retry_after(secs: u64) -> Duration {
    Duration::from_secs(secs).clamp(Duration::from_secs(1), MAX_RATE_LIMIT_DELAY)
}

/// Add up to 30% random jitter so agents that hit a limit together do not
/// retry together.
pub fn with_jitter(delay: Duration) -> Duration {
    delay.mul_f64(1.0 + rand::random::<f64>() * 0.3)
}

/// How a run reacts to crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    Manual,
    Scheduled {
        base_delay: Duration,
        max_attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Wait `delay` before spawning again.
    Retry {
        attempt: u32,
        delay: Duration,
        rate_limited: bool,
    },
    /// Too many crashes in this scheduled occurrence.
    Exhausted { attempts: u32 },
}

/// Per-run crash bookkeeping and restart gate.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    mode: RestartMode,
    crashes: u32,
    consecutive_errors: u32,
    rate_limits: u32,
    gate: Option<Instant>,
}

impl RestartTracker {
    pub const fn new(mode: RestartMode) -> Self {
        Self {
            mode,
            crashes: 0,
            consecutive_errors: 0,
            rate_limits: 0,
            gate: None,
        }
    }

    pub const fn mode(&self) -> RestartMode {
        self.mode
    }

    /// Crashes recorded in this run.
    pub const fn crashes(&self) -> u32 {
        self.crashes
    }

    /// Record a crash and close the restart gate for the chosen delay.
    pub fn record_crash(
        &mut self,
        rate_limit: Option<RateLimitSignal>,
        now: Instant,
    ) -> RestartDecision {
        self.crashes = self.crashes.saturating_add(1);
        let attempt = self.crashes;

        if let RestartMode::Scheduled { max_attempts, .. } = self.mode
            && attempt > max_attempts
        {
            return RestartDecision::Exhausted { attempts: attempt };
        }

        let delay = if let Some(signal) = rate_limit {
            let delay = signal.retry_after_secs.map_or_else(
                || with_jitter(rate_limit_backoff(self.rate_limits)),
                clamp_retry_after,
            );
            self.rate_limits = self.rate_limits.saturating_add(1);
            delay
        } else {
            self.consecutive_errors = self.consecutive_errors.saturating_add(1);
            match self.mode {
                RestartMode::Manual => error_backoff(self.consecutive_errors),
                RestartMode::Scheduled { base_delay, .. } => scheduled_delay(base_delay, attempt),
            }
        };

        self.gate = Some(now + delay);
        RestartDecision::Retry {
            attempt,
            delay,
            rate_limited: rate_limit.is_some(),
        }
    }

    /// A clean agent exit resets the consecutive counters. Scheduled attempt
    /// counts stay for the whole occurrence.
    pub const fn record_success(&mut self) {
        self.consecutive_errors = 0;
        self.rate_limits = 0;
    }

    /// Time left before spawning is allowed again.
    pub fn gate_remaining(&self, now: Instant) -> Option<Duration> {
        self.gate
            .and_then(|gate| gate.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }
}
