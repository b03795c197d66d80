//! Bounded polling for wait-type actions.

use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::config::MIN_POLL_INTERVAL;
use crate::error::{StepError, StepResult};
use crate::runner::CancelToken;

/// Result of a single polling attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<T> {
    Found(T),
    /// Not there yet; `score` is the best confidence this attempt saw, if any
    Missed { score: Option<f64> },
}

/// How a polling loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    Found(T),
    TimedOut { elapsed: Duration, best: Option<f64> },
}

/// Deadline and interval for a polling loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Poll {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Poll {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval: interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Call `attempt` until it finds something or the deadline passes.
    ///
    /// Always attempts at least once. Sleeps `min(interval, remaining)` between
    /// attempts, and skips an attempt that would end more than one interval past
    /// the deadline (judged by the slowest attempt so far), waiting out the
    /// deadline instead. A miss is therefore reported no earlier than `timeout`
    /// and less than one interval after it, unless the first attempt alone takes
    /// longer than that or an attempt runs slower than every earlier one.
    /// Cancellation is checked between attempts and while waiting; errors from
    /// `attempt` end the loop immediately.
    pub fn run<T>(
        &self,
        cancel: &CancelToken,
        mut attempt: impl FnMut() -> StepResult<Attempt<T>>,
    ) -> StepResult<PollOutcome<T>> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut best: Option<f64> = None;
        let mut attempts = 0u32;
        let mut slowest = Duration::ZERO;

        loop {
            attempts += 1;
            let began = Instant::now();
            let result = attempt()?;
            slowest = slowest.max(began.elapsed());
            match result {
                Attempt::Found(value) => return Ok(PollOutcome::Found(value)),
                Attempt::Missed { score } => {
                    best = match (best, score) {
                        (Some(b), Some(s)) => Some(b.max(s)),
                        (b, s) => b.or(s),
                    };
                }
            }

            let now = Instant::now();
            if now >= deadline {
                trace!(attempts, "polling deadline reached");
                return Ok(PollOutcome::TimedOut {
                    elapsed: now - start,
                    best,
                });
            }
            if cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }

            let pause = self.interval.min(deadline - now);
            if now + pause + slowest >= deadline + self.interval {
                trace!(attempts, slowest_ms = slowest.as_millis() as u64, "no time for another attempt");
                self.wait_until(deadline, cancel)?;
                return Ok(PollOutcome::TimedOut {
                    elapsed: start.elapsed(),
                    best,
                });
            }
            thread::sleep(pause);
        }
    }

    /// Sleep until `deadline`, one interval at a time
    fn wait_until(&self, deadline: Instant, cancel: &CancelToken) -> StepResult<()> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            thread::sleep(self.interval.min(deadline - now));
        }
    }
}
