//! Poll-until-condition retry primitive
//!
//! A failing check is treated as "not yet true" rather than fatal. The runner
//! retries it on a fixed interval until it passes or the budget is spent, and
//! then hands back the last failure it observed so the caller sees the actual
//! unmet condition instead of a generic timeout.

use std::fmt::Display;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised when building a poll policy
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollError {
    #[error("Poll interval must be greater than zero")]
    ZeroInterval,

    #[error("Attempt cap must be at least one")]
    ZeroAttempts,
}

/// Budget for a poll-until run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    timeout: Duration,
    interval: Duration,
    max_attempts: Option<u32>,
}

impl PollPolicy {
    /// Create a policy with a total wall-clock budget and a sleep interval
    pub fn new(timeout: Duration, interval: Duration) -> Result<Self, PollError> {
        if interval.is_zero() {
            return Err(PollError::ZeroInterval);
        }

        Ok(Self {
            timeout,
            interval,
            max_attempts: None,
        })
    }

    /// Create a policy from whole seconds
    pub fn from_secs(timeout: u64, interval: u64) -> Result<Self, PollError> {
        Self::new(Duration::from_secs(timeout), Duration::from_secs(interval))
    }

    /// Cap the number of invocations in addition to the time budget
    pub fn with_max_attempts(mut self, attempts: u32) -> Result<Self, PollError> {
        if attempts == 0 {
            return Err(PollError::ZeroAttempts);
        }
        self.max_attempts = Some(attempts);
        Ok(self)
    }

    /// 30 seconds, retrying every 3 seconds (log and topic checks)
    pub const fn short() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(3),
            max_attempts: None,
        }
    }

    /// 100 seconds, retrying every 5 seconds (cluster rollouts)
    pub const fn cluster() -> Self {
        Self {
            timeout: Duration::from_secs(100),
            interval: Duration::from_secs(5),
            max_attempts: None,
        }
    }

    /// 180 seconds, retrying every 10 seconds (swarm service metrics)
    pub const fn swarm_metrics() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            interval: Duration::from_secs(10),
            max_attempts: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Number of sleeps that fit in the budget: `floor(timeout / interval)`
    pub fn max_sleeps(&self) -> u64 {
        let sleeps = self.timeout.as_nanos() / self.interval.as_nanos();
        u64::try_from(sleeps).unwrap_or(u64::MAX)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::short()
    }
}

/// Invoke `check` until it succeeds or the policy budget is spent
///
/// Blocks the calling thread between attempts. At least one attempt is always
/// made, even when the timeout is shorter than the interval. On exhaustion the
/// error from the last attempt is returned.
pub fn wait_until<T, E, F>(policy: &PollPolicy, check: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: Display,
{
    wait_until_with_sleep(policy, std::thread::sleep, check)
}

/// [`wait_until`] with an injectable sleep function
pub fn wait_until_with_sleep<T, E, F, S>(
    policy: &PollPolicy,
    mut sleep: S,
    mut check: F,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    S: FnMut(Duration),
    E: Display,
{
    let start = Instant::now();
    let max_sleeps = policy.max_sleeps();
    let mut sleeps = 0u64;
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);

        match check() {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Check passed after retrying");
                }
                return Ok(value);
            }
            Err(e) => {
                let attempts_exhausted = policy.max_attempts.is_some_and(|max| attempt >= max);

                if sleeps >= max_sleeps || start.elapsed() >= policy.timeout || attempts_exhausted {
                    warn!(
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        error = %e,
                        "Check still failing, giving up"
                    );
                    return Err(e);
                }

                debug!(
                    attempt,
                    error = %e,
                    delay_ms = policy.interval.as_millis() as u64,
                    "Check failed, retrying"
                );
                sleep(policy.interval);
                sleeps += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    fn recorded_run(
        policy: &PollPolicy,
        fail_times: u32,
    ) -> (Result<u32, String>, u32, Vec<Duration>) {
        let calls = Cell::new(0u32);
        let slept = RefCell::new(Vec::new());

        let result = wait_until_with_sleep(
            policy,
            |d| slept.borrow_mut().push(d),
            || {
                let n = calls.get() + 1;
                calls.set(n);
                if n <= fail_times {
                    Err(format!("attempt {} not ready", n))
                } else {
                    Ok(n)
                }
            },
        );

        (result, calls.get(), slept.into_inner())
    }

    #[test]
    fn test_rejects_zero_interval() {
        assert_eq!(
            PollPolicy::new(Duration::from_secs(10), Duration::ZERO),
            Err(PollError::ZeroInterval)
        );
    }

    #[test]
    fn test_rejects_zero_attempt_cap() {
        let policy = PollPolicy::from_secs(10, 1).unwrap();
        assert_eq!(policy.with_max_attempts(0), Err(PollError::ZeroAttempts));
    }

    #[test]
    fn test_immediate_success_does_not_sleep() {
        let policy = PollPolicy::from_secs(30, 3).unwrap();
        let (result, calls, slept) = recorded_run(&policy, 0);

        assert_eq!(result, Ok(1));
        assert_eq!(calls, 1);
        assert!(slept.is_empty());
    }

    #[test]
    fn test_always_failing_surfaces_last_failure() {
        let policy = PollPolicy::from_secs(30, 3).unwrap();
        let (result, calls, slept) = recorded_run(&policy, u32::MAX);

        assert_eq!(result, Err("attempt 11 not ready".to_string()));
        assert_eq!(calls, 11);
        assert_eq!(slept, vec![Duration::from_secs(3); 10]);
    }

    #[test]
    fn test_timeout_shorter_than_interval_still_attempts_once() {
        let policy = PollPolicy::from_secs(1, 5).unwrap();
        let (result, calls, slept) = recorded_run(&policy, u32::MAX);

        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert!(slept.is_empty());
    }

    #[test]
    fn test_zero_timeout_attempts_once() {
        let policy = PollPolicy::new(Duration::ZERO, Duration::from_millis(10)).unwrap();
        let (result, calls, _) = recorded_run(&policy, 0);

        assert_eq!(result, Ok(1));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_attempt_cap_stops_before_time_budget() {
        let policy = PollPolicy::from_secs(100, 1)
            .unwrap()
            .with_max_attempts(3)
            .unwrap();
        let (result, calls, slept) = recorded_run(&policy, u32::MAX);

        assert_eq!(result, Err("attempt 3 not ready".to_string()));
        assert_eq!(calls, 3);
        assert_eq!(slept.len(), 2);
    }

    #[test]
    fn test_real_sleep_respects_wall_clock() {
        let policy = PollPolicy::new(Duration::from_millis(50), Duration::from_millis(10)).unwrap();
        let start = Instant::now();
        let result: Result<(), &str> = wait_until(&policy, || Err("never"));

        assert_eq!(result, Err("never"));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test_case(PollPolicy::short(), 30, 3 ; "short")]
    #[test_case(PollPolicy::cluster(), 100, 5 ; "cluster")]
    #[test_case(PollPolicy::swarm_metrics(), 180, 10 ; "swarm metrics")]
    fn test_presets(policy: PollPolicy, timeout: u64, interval: u64) {
        assert_eq!(policy, PollPolicy::from_secs(timeout, interval).unwrap());
        assert_eq!(policy.max_sleeps(), timeout / interval);
    }

    proptest! {
        #[test]
        fn prop_fails_k_times_then_succeeds(
            interval in 1u64..20,
            sleeps_budget in 0u64..20,
            k_ratio in 0.0f64..=1.0,
        ) {
            let policy = PollPolicy::from_secs(interval * sleeps_budget, interval).unwrap();
            let k = (sleeps_budget as f64 * k_ratio).floor() as u32;
            let (result, calls, slept) = recorded_run(&policy, k);

            prop_assert_eq!(result, Ok(k + 1));
            prop_assert_eq!(calls, k + 1);
            prop_assert_eq!(slept.len(), k as usize);
        }

        #[test]
        fn prop_always_failing_sleeps_floor_intervals(
            timeout in 0u64..5_000,
            interval in 1u64..1_000,
        ) {
            let policy = PollPolicy::from_secs(timeout, interval).unwrap();
            let (result, calls, slept) = recorded_run(&policy, u32::MAX);
            let expected_sleeps = timeout / interval;

            prop_assert!(result.is_err());
            prop_assert_eq!(slept.len() as u64, expected_sleeps);
            prop_assert_eq!(calls as u64, expected_sleeps + 1);
        }
    }
}
