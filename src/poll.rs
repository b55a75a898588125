//! Convergence poller
//!
//! [`eventually`] re-evaluates an async predicate on a fixed interval until
//! the observed value is accepted or the timeout elapses. Transient
//! attempt errors count as "not yet"; anything else aborts the poll.
//! The result is always a concrete [`Outcome`] carrying the last value
//! and last error observed, so callers can assert on it however they like.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Interval and timeout for one kind of poll
///
/// `attempt_timeout` bounds a single predicate evaluation and defaults to
/// `interval`, which keeps total wall time below `timeout + interval`.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PollSpec {
    #[serde(deserialize_with = "deserialize_secs")]
    pub interval: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub timeout: Duration,
    #[serde(default, deserialize_with = "deserialize_opt_secs")]
    pub attempt_timeout: Option<Duration>,
}

impl PollSpec {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            attempt_timeout: None,
        }
    }

    /// Allow a single attempt to run longer (or shorter) than one interval
    pub const fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = Some(attempt_timeout);
        self
    }

    /// Budget for a single predicate evaluation
    pub fn attempt_budget(&self) -> Duration {
        self.attempt_timeout.unwrap_or(self.interval)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.interval.is_zero() {
            return Err("interval must be non-zero".into());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be non-zero".into());
        }
        if self.interval > self.timeout {
            return Err(format!(
                "interval {:?} exceeds timeout {:?}",
                self.interval, self.timeout
            ));
        }
        if self.attempt_timeout.is_some_and(|t| t.is_zero()) {
            return Err("attemptTimeout must be non-zero".into());
        }
        Ok(())
    }
}

fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

fn deserialize_opt_secs<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
}

/// How a poll ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// An observed value was accepted
    Converged,
    /// The timeout elapsed without an accepted value
    TimedOut,
    /// An attempt failed with a non-transient error
    Aborted,
}

/// Final state of a poll
#[derive(Debug)]
pub struct Outcome<T> {
    pub step: String,
    pub termination: Termination,
    /// Most recent value the predicate produced (the accepted one on success)
    pub last_value: Option<T>,
    /// Most recent error an attempt produced
    pub last_error: Option<Error>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl<T: Debug> Outcome<T> {
    pub fn matched(&self) -> bool {
        self.termination == Termination::Converged
    }

    /// Accepted value, or the error explaining why there is none
    pub fn into_result(self) -> Result<T> {
        match self.termination {
            Termination::Converged => self.last_value.ok_or_else(|| Error::ConvergenceTimeout {
                step: self.step,
                last_value: "none".into(),
                last_error: None,
                elapsed: self.elapsed,
            }),
            Termination::Aborted => Err(self.last_error.unwrap_or_else(|| {
                Error::InvalidConfig("poll aborted without an error".into())
            })),
            Termination::TimedOut => Err(Error::ConvergenceTimeout {
                last_value: self
                    .last_value
                    .as_ref()
                    .map(|v| format!("{:?}", v))
                    .unwrap_or_else(|| "none".into()),
                last_error: self.last_error.map(|e| e.to_string()),
                step: self.step,
                elapsed: self.elapsed,
            }),
        }
    }
}

impl Outcome<i64> {
    /// Last observed count, or `-1` if no attempt produced one
    pub fn count_or_sentinel(&self) -> i64 {
        self.last_value.unwrap_or(-1)
    }
}

/// Poll `predicate` until `accept` holds on its value or `spec.timeout` elapses.
///
/// The first attempt runs immediately. Between attempts the poller sleeps
/// for `spec.interval`, shortened so no attempt starts after the deadline.
pub async fn eventually<T, F, Fut, A>(
    step: &str,
    spec: PollSpec,
    mut predicate: F,
    accept: A,
) -> Outcome<T>
where
    T: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    A: Fn(&T) -> bool,
{
    let start = Instant::now();
    let deadline = start + spec.timeout;
    let budget = spec.attempt_budget();

    let mut attempts = 0;
    let mut last_value = None;
    let mut last_error = None;

    loop {
        attempts += 1;

        match tokio::time::timeout(budget, predicate()).await {
            Ok(Ok(value)) if accept(&value) => {
                info!(step, attempts, elapsed = ?start.elapsed(), "Converged");
                return Outcome {
                    step: step.to_string(),
                    termination: Termination::Converged,
                    last_value: Some(value),
                    last_error,
                    attempts,
                    elapsed: start.elapsed(),
                };
            }
            Ok(Ok(value)) => {
                debug!(step, attempts, value = ?value, "Not converged yet");
                last_value = Some(value);
            }
            Ok(Err(e)) if !e.is_transient() => {
                warn!(step, attempts, error = %e, "Aborting poll on non-transient error");
                return Outcome {
                    step: step.to_string(),
                    termination: Termination::Aborted,
                    last_value,
                    last_error: Some(e),
                    attempts,
                    elapsed: start.elapsed(),
                };
            }
            Ok(Err(e)) => {
                debug!(step, attempts, error = %e, "Attempt failed, retrying");
                last_error = Some(e);
            }
            Err(_) => {
                debug!(step, attempts, budget = ?budget, "Attempt exceeded its budget");
                last_error = Some(Error::AttemptTimeout(budget));
            }
        }

        let now = Instant::now();
        if now >= deadline {
            info!(
                step,
                attempts,
                last_value = ?last_value,
                last_error = ?last_error.as_ref().map(|e| e.to_string()),
                "Timed out waiting for convergence"
            );
            return Outcome {
                step: step.to_string(),
                termination: Termination::TimedOut,
                last_value,
                last_error,
                attempts,
                elapsed: start.elapsed(),
            };
        }

        tokio::time::sleep(spec.interval.min(deadline - now)).await;
    }
}

/// Poll a boolean predicate until it reports `true`
pub async fn eventually_true<F, Fut>(step: &str, spec: PollSpec, predicate: F) -> Outcome<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    eventually(step, spec, predicate, |ok| *ok).await
}

/// Poll until the observed value equals `expected` exactly.
///
/// There is no ">=" reading: observing more than expected is a mismatch.
pub async fn eventually_equals<T, F, Fut>(
    step: &str,
    spec: PollSpec,
    expected: T,
    predicate: F,
) -> Outcome<T>
where
    T: Debug + PartialEq,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    eventually(step, spec, predicate, move |v| *v == expected).await
}
