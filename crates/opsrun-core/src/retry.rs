//! Bounded retries for remote calls.
//!
//! A [`RetryExecutor`] owns a client and a declared set of method names.
//! Each call through it is classified, retried with backoff when the failure
//! is transient, and counted per method.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottled",
    "RequestThrottledException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "BandwidthLimitExceeded",
    "SlowDown",
    "TransactionInProgressException",
];

/// A local resource held by someone else for a moment.
const CONTENTION_CODES: &[&str] = &["LedgerBusy"];

const TRANSIENT_STATUS: &[u16] = &[500, 502, 503, 504];

const TRANSIENT_MESSAGES: &[&str] = &["read timed out", "connection reset by peer"];

// ---------------------------------------------------------------------------
// Errors and classification
// ---------------------------------------------------------------------------

/// An error reported by a remote service.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError {
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    NotFound,
    Fatal,
}

pub fn classify(err: &RemoteError) -> ErrorClass {
    if THROTTLING_CODES.contains(&err.code.as_str()) || CONTENTION_CODES.contains(&err.code.as_str()) {
        return ErrorClass::Transient;
    }
    if err.status.is_some_and(|s| TRANSIENT_STATUS.contains(&s)) {
        return ErrorClass::Transient;
    }
    let message = err.message.to_ascii_lowercase();
    if TRANSIENT_MESSAGES.iter().any(|m| message.contains(m)) {
        return ErrorClass::Transient;
    }
    if err.status == Some(404) || err.code.ends_with("NotFound") || err.code.ends_with("NotFoundException")
    {
        return ErrorClass::NotFound;
    }
    ErrorClass::Fatal
}

/// Result of a call that was allowed to come back empty.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    Success(T),
    /// The call failed with one of the codes the caller declared as expected.
    NotFound(RemoteError),
}

impl<T> CallOutcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            CallOutcome::Success(v) => Some(v),
            CallOutcome::NotFound(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("{method} failed after {attempts} attempt(s): {source}")]
    Transient {
        method: String,
        attempts: u32,
        source: RemoteError,
    },

    #[error("{method} failed: {source}")]
    Fatal { method: String, source: RemoteError },

    #[error("{method} gave up after {attempts} attempt(s), out of time: {source}")]
    TimedOut {
        method: String,
        attempts: u32,
        source: RemoteError,
    },

    #[error("method '{0}' is not declared on this executor")]
    Undeclared(String),
}

impl CallError {
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            CallError::Transient { source, .. }
            | CallError::Fatal { source, .. }
            | CallError::TimedOut { source, .. } => Some(source),
            CallError::Undeclared(_) => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CallError::Transient { .. } | CallError::TimedOut { .. })
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitStrategy {
    Constant {
        secs: f64,
    },
    Linear {
        start_secs: f64,
        increment_secs: f64,
        max_secs: f64,
    },
    Multiply {
        start_secs: f64,
        factor: f64,
        max_secs: f64,
        #[serde(default)]
        random_factor: f64,
    },
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::Multiply {
            start_secs: 10.0,
            factor: 2.0,
            max_secs: 60.0,
            random_factor: 0.25,
        }
    }
}

impl WaitStrategy {
    /// Wait before retry number `retry` (0-based).
    pub fn wait(&self, retry: u32) -> Duration {
        let secs = match *self {
            WaitStrategy::Constant { secs } => secs,
            WaitStrategy::Linear {
                start_secs,
                increment_secs,
                max_secs,
            } => (start_secs + increment_secs * retry as f64).min(max_secs),
            WaitStrategy::Multiply {
                start_secs,
                factor,
                max_secs,
                random_factor,
            } => {
                let base = (start_secs * factor.powi(retry as i32)).min(max_secs);
                let spread = if random_factor.is_finite() { random_factor.min(1.0) } else { 0.0 };
                if spread > 0.0 && base.is_finite() {
                    let jitter = rand::thread_rng().gen_range(-spread..=spread);
                    base + base * jitter
                } else {
                    base
                }
            }
        };
        // NaN and negatives wait nothing; anything too large waits forever.
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Parameters `wait` cannot work with: every one must be a finite,
    /// non-negative number.
    pub fn problems(&self) -> Vec<String> {
        let params: Vec<(&str, f64)> = match *self {
            WaitStrategy::Constant { secs } => vec![("secs", secs)],
            WaitStrategy::Linear {
                start_secs,
                increment_secs,
                max_secs,
            } => vec![
                ("start_secs", start_secs),
                ("increment_secs", increment_secs),
                ("max_secs", max_secs),
            ],
            WaitStrategy::Multiply {
                start_secs,
                factor,
                max_secs,
                random_factor,
            } => vec![
                ("start_secs", start_secs),
                ("factor", factor),
                ("max_secs", max_secs),
                ("random_factor", random_factor),
            ],
        };
        params
            .into_iter()
            .filter(|(_, value)| !value.is_finite() || *value < 0.0)
            .map(|(name, value)| format!("retry wait {name} must be a finite non-negative number, got {value}"))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default)]
    pub wait: WaitStrategy,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_call_timeout_secs() -> u64 {
    300
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: default_max_attempts(),
            call_timeout_secs: default_call_timeout_secs(),
            wait: WaitStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; for callers that must not block.
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            call_timeout_secs: default_call_timeout_secs(),
            wait: WaitStrategy::Constant { secs: 0.0 },
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallStats {
    pub calls: u64,
    pub retries: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub latency_ms: u64,
}

impl CallStats {
    fn absorb(&mut self, other: &CallStats) {
        self.calls += other.calls;
        self.retries += other.retries;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.latency_ms += other.latency_ms;
    }
}

// ---------------------------------------------------------------------------
// RetryExecutor
// ---------------------------------------------------------------------------

pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

pub struct RetryExecutor<C> {
    client: C,
    methods: BTreeSet<String>,
    policy: RetryPolicy,
    stats: Mutex<BTreeMap<String, CallStats>>,
    deadline: Mutex<Option<Instant>>,
    sleeper: Sleeper,
}

impl<C> RetryExecutor<C> {
    pub fn new<I, S>(client: C, methods: I, policy: RetryPolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RetryExecutor {
            client,
            methods: methods.into_iter().map(Into::into).collect(),
            policy,
            stats: Mutex::new(BTreeMap::new()),
            deadline: Mutex::new(None),
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_declared(&self, method: &str) -> bool {
        self.methods.contains(method)
    }

    /// Stop retrying once the next wait would run past `deadline`.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        if let Ok(mut d) = self.deadline.lock() {
            *d = deadline;
        }
    }

    /// Call `method`, retrying transient failures. Every failure that is not
    /// retried surfaces as an error.
    pub fn call<T, F>(&self, method: &str, op: F) -> Result<T, CallError>
    where
        F: FnMut(&C) -> Result<T, RemoteError>,
    {
        match self.call_expecting(method, &[], op)? {
            CallOutcome::Success(v) => Ok(v),
            CallOutcome::NotFound(source) => Err(CallError::Fatal {
                method: method.to_string(),
                source,
            }),
        }
    }

    /// Like [`call`](Self::call), but errors whose code is listed in
    /// `expected` come back as [`CallOutcome::NotFound`] without retrying.
    pub fn call_expecting<T, F>(
        &self,
        method: &str,
        expected: &[&str],
        mut op: F,
    ) -> Result<CallOutcome<T>, CallError>
    where
        F: FnMut(&C) -> Result<T, RemoteError>,
    {
        if !self.is_declared(method) {
            return Err(CallError::Undeclared(method.to_string()));
        }

        let started = Instant::now();
        let call_timeout = Duration::from_secs(self.policy.call_timeout_secs);
        let deadline = self.deadline.lock().ok().and_then(|d| *d);
        let mut attempts = 0u32;
        let mut slept = Duration::ZERO;

        loop {
            attempts += 1;
            let err = match op(&self.client) {
                Ok(value) => {
                    self.record(method, attempts, started, |_| {});
                    return Ok(CallOutcome::Success(value));
                }
                Err(err) => err,
            };

            if expected.contains(&err.code.as_str()) {
                self.record(method, attempts, started, |_| {});
                return Ok(CallOutcome::NotFound(err));
            }

            match classify(&err) {
                ErrorClass::Transient if attempts < self.policy.max_attempts => {
                    let wait = self.policy.wait.wait(attempts - 1);
                    let out_of_time = started.elapsed().max(slept).saturating_add(wait) > call_timeout
                        || deadline.is_some_and(|d| Instant::now().checked_add(wait).map_or(true, |end| end > d));
                    if out_of_time {
                        self.record(method, attempts, started, |s| s.timed_out += 1);
                        return Err(CallError::TimedOut {
                            method: method.to_string(),
                            attempts,
                            source: err,
                        });
                    }
                    tracing::debug!(
                        method,
                        attempt = attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "retrying remote call"
                    );
                    (self.sleeper)(wait);
                    slept = slept.saturating_add(wait);
                }
                ErrorClass::Transient => {
                    self.record(method, attempts, started, |s| s.failed += 1);
                    return Err(CallError::Transient {
                        method: method.to_string(),
                        attempts,
                        source: err,
                    });
                }
                ErrorClass::NotFound | ErrorClass::Fatal => {
                    self.record(method, attempts, started, |s| s.failed += 1);
                    return Err(CallError::Fatal {
                        method: method.to_string(),
                        source: err,
                    });
                }
            }
        }
    }

    fn record(&self, method: &str, attempts: u32, started: Instant, extra: impl FnOnce(&mut CallStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            let entry = stats.entry(method.to_string()).or_default();
            entry.calls += 1;
            entry.retries += u64::from(attempts.saturating_sub(1));
            entry.latency_ms += started.elapsed().as_millis() as u64;
            extra(entry);
        }
    }

    pub fn stats(&self) -> BTreeMap<String, CallStats> {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn totals(&self) -> CallStats {
        let mut total = CallStats::default();
        for s in self.stats().values() {
            total.absorb(s);
        }
        total
    }

    pub fn reset_stats(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn executor() -> RetryExecutor<()> {
        RetryExecutor::new((), ["describe", "delete"], RetryPolicy::immediate(4))
    }

    fn throttled() -> RemoteError {
        RemoteError::new("ThrottlingException", "Rate exceeded")
    }

    #[test]
    fn classification() {
        assert_eq!(classify(&throttled()), ErrorClass::Transient);
        assert_eq!(
            classify(&RemoteError::new("InternalError", "boom").with_status(503)),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&RemoteError::new("Unknown", "Connection reset by peer")),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&RemoteError::new("ResourceNotFoundException", "gone")),
            ErrorClass::NotFound
        );
        assert_eq!(
            classify(&RemoteError::new("ValidationError", "bad").with_status(400)),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn transient_failures_then_success_records_retries() {
        let exec = executor();
        let attempts = Cell::new(0);
        let result = exec.call("describe", |_| {
            attempts.set(attempts.get() + 1);
            if attempts.get() <= 2 {
                Err(throttled())
            } else {
                Ok("volume-1")
            }
        });
        assert_eq!(result.unwrap(), "volume-1");
        assert_eq!(attempts.get(), 3);
        let stats = &exec.stats()["describe"];
        assert_eq!(stats.calls, 1);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn fatal_errors_are_attempted_once() {
        let exec = executor();
        let attempts = Cell::new(0);
        let result: Result<(), _> = exec.call("delete", |_| {
            attempts.set(attempts.get() + 1);
            Err(RemoteError::new("AccessDenied", "no").with_status(403))
        });
        assert!(matches!(result, Err(CallError::Fatal { .. })));
        assert_eq!(attempts.get(), 1);
        assert_eq!(exec.stats()["delete"].failed, 1);
    }

    #[test]
    fn retries_stop_at_the_attempt_ceiling() {
        let exec = executor();
        let attempts = Cell::new(0);
        let result: Result<(), _> = exec.call("describe", |_| {
            attempts.set(attempts.get() + 1);
            Err(throttled())
        });
        assert!(matches!(result, Err(CallError::Transient { attempts: 4, .. })));
        assert_eq!(attempts.get(), 4);
        assert_eq!(exec.stats()["describe"].retries, 3);
    }

    #[test]
    fn expected_codes_become_not_found() {
        let exec = executor();
        let outcome: CallOutcome<()> = exec
            .call_expecting("describe", &["InvalidVolume.NotFound"], |_| {
                Err(RemoteError::new("InvalidVolume.NotFound", "missing"))
            })
            .unwrap();
        assert!(matches!(outcome, CallOutcome::NotFound(_)));
        assert_eq!(outcome.ok(), None);

        let unexpected: Result<(), _> = exec.call("describe", |_| {
            Err(RemoteError::new("InvalidVolume.NotFound", "missing"))
        });
        assert!(matches!(unexpected, Err(CallError::Fatal { .. })));
    }

    #[test]
    fn undeclared_methods_are_refused() {
        let exec = executor();
        let result: Result<(), _> = exec.call("terminate", |_| Ok(()));
        assert!(matches!(result, Err(CallError::Undeclared(m)) if m == "terminate"));
    }

    #[test]
    fn waits_are_slept_and_bounded_by_call_timeout() {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let log = slept.clone();
        let policy = RetryPolicy {
            max_attempts: 10,
            call_timeout_secs: 25,
            wait: WaitStrategy::Multiply {
                start_secs: 5.0,
                factor: 2.0,
                max_secs: 60.0,
                random_factor: 0.0,
            },
        };
        let exec = RetryExecutor::new((), ["describe"], policy)
            .with_sleeper(Arc::new(move |d| log.lock().unwrap().push(d)));
        let result: Result<(), _> = exec.call("describe", |_| Err(throttled()));
        // 5s and 10s fit in 25s; the 20s wait would not.
        assert_eq!(
            *slept.lock().unwrap(),
            vec![Duration::from_secs(5), Duration::from_secs(10)]
        );
        assert!(matches!(result, Err(CallError::TimedOut { attempts: 3, .. })));
        assert_eq!(exec.stats()["describe"].timed_out, 1);
    }

    #[test]
    fn deadline_stops_retries() {
        let exec = RetryExecutor::new(
            (),
            ["describe"],
            RetryPolicy {
                max_attempts: 5,
                call_timeout_secs: 300,
                wait: WaitStrategy::Constant { secs: 30.0 },
            },
        )
        .with_sleeper(Arc::new(|_| {}));
        exec.set_deadline(Some(Instant::now() + Duration::from_secs(10)));
        let result: Result<(), _> = exec.call("describe", |_| Err(throttled()));
        assert!(matches!(result, Err(CallError::TimedOut { attempts: 1, .. })));
    }

    #[test]
    fn wait_strategies() {
        let linear = WaitStrategy::Linear {
            start_secs: 1.0,
            increment_secs: 2.0,
            max_secs: 4.0,
        };
        assert_eq!(linear.wait(0), Duration::from_secs(1));
        assert_eq!(linear.wait(1), Duration::from_secs(3));
        assert_eq!(linear.wait(5), Duration::from_secs(4));

        let jittered = WaitStrategy::default();
        for retry in 0..6 {
            let base = (10.0 * 2f64.powi(retry)).min(60.0);
            let w = jittered.wait(retry as u32).as_secs_f64();
            assert!(w >= base * 0.75 - 1e-9 && w <= base * 1.25 + 1e-9);
        }
    }

    #[test]
    fn unbounded_wait_parameters_do_not_panic() {
        let wild = WaitStrategy::Multiply {
            start_secs: 10.0,
            factor: 2.0,
            max_secs: 60.0,
            random_factor: f64::INFINITY,
        };
        assert_eq!(wild.wait(0), Duration::from_secs(10));

        let endless = WaitStrategy::Multiply {
            start_secs: 10.0,
            factor: 2.0,
            max_secs: f64::INFINITY,
            random_factor: 0.0,
        };
        assert_eq!(endless.wait(2000), Duration::MAX);
        assert_eq!(WaitStrategy::Constant { secs: f64::NAN }.wait(0), Duration::ZERO);
        assert_eq!(WaitStrategy::Constant { secs: -3.0 }.wait(0), Duration::ZERO);

        let problems = wild.problems();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("random_factor"));
        assert_eq!(endless.problems().len(), 1);
        assert!(WaitStrategy::default().problems().is_empty());
    }

    #[test]
    fn endless_waits_time_out_instead_of_overflowing() {
        let exec = RetryExecutor::new(
            (),
            ["describe"],
            RetryPolicy {
                max_attempts: 5,
                call_timeout_secs: 300,
                wait: WaitStrategy::Constant { secs: f64::INFINITY },
            },
        )
        .with_sleeper(Arc::new(|_: Duration| panic!("must not sleep")));
        exec.set_deadline(Some(Instant::now() + Duration::from_secs(10)));
        let result: Result<(), _> = exec.call("describe", |_| Err(throttled()));
        assert!(matches!(result, Err(CallError::TimedOut { attempts: 1, .. })));
    }

    #[test]
    fn stats_reset_between_ticks() {
        let exec = executor();
        let _ = exec.call("describe", |_| Ok::<_, RemoteError>(()));
        let _ = exec.call("delete", |_| Ok::<_, RemoteError>(()));
        assert_eq!(exec.totals().calls, 2);
        exec.reset_stats();
        assert!(exec.stats().is_empty());
    }
}
