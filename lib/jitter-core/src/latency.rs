//! Simulated latency.

use std::time::Duration;

use rand::Rng;
use snafu::Snafu;
use tokio::{
    select,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;

/// A latency error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum LatencyError {
    /// The range to draw a delay from is empty.
    #[snafu(display("cannot draw a delay from an empty range (maximum delay is {}ms)", max_millis))]
    EmptyRange {
        /// The configured upper bound, in milliseconds.
        max_millis: u64,
    },
}

/// How a simulated wait ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    /// The full delay elapsed.
    Completed,

    /// The wait was cancelled before the delay elapsed.
    Cancelled {
        /// How long was actually spent waiting.
        elapsed: Duration,
    },
}

impl WaitOutcome {
    /// Returns `true` if the wait was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns how long was actually spent waiting, given the delay that was requested.
    pub fn waited(&self, requested: Duration) -> Duration {
        match self {
            Self::Completed => requested,
            Self::Cancelled { elapsed } => (*elapsed).min(requested),
        }
    }
}

/// Draws random delays from a bounded range, and waits them out.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LatencySimulator {
    max_millis: u64,
}

impl LatencySimulator {
    /// Creates a new `LatencySimulator` that draws delays from `[0, max_millis)` milliseconds.
    pub const fn from_max_millis(max_millis: u64) -> Self {
        Self { max_millis }
    }

    /// Returns the exclusive upper bound of generated delays, in milliseconds.
    pub const fn max_millis(&self) -> u64 {
        self.max_millis
    }

    /// Draws a delay uniformly from `[0, max_millis)` milliseconds.
    ///
    /// # Errors
    ///
    /// If the upper bound is zero, the range is empty and an error is returned.
    pub fn sample_delay<R>(&self, rng: &mut R) -> Result<Duration, LatencyError>
    where
        R: Rng + ?Sized,
    {
        if self.max_millis == 0 {
            return Err(LatencyError::EmptyRange {
                max_millis: self.max_millis,
            });
        }

        Ok(Duration::from_millis(rng.random_range(0..self.max_millis)))
    }

    /// Waits for the given delay, or until `cancel_token` is cancelled, whichever comes first.
    ///
    /// The wait is cooperative: the calling task is suspended, not spinning. If the token is already cancelled, this
    /// returns immediately.
    pub async fn wait(delay: Duration, cancel_token: &CancellationToken) -> WaitOutcome {
        let started = Instant::now();

        select! {
            biased;

            _ = cancel_token.cancelled() => WaitOutcome::Cancelled {
                elapsed: started.elapsed(),
            },
            _ = sleep(delay) => WaitOutcome::Completed,
        }
    }
}
