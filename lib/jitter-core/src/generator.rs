//! Per-request outcome generation.

use std::{sync::Arc, time::Duration};

use tracing::error;

use crate::{
    distribution::{Distribution, DistributionError},
    entropy::EntropySource,
    latency::LatencySimulator,
};

/// The simulated result of a single request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SampleResult {
    /// Status code to respond with.
    pub code: u16,

    /// How long to delay before responding.
    pub delay: Duration,
}

/// Generates simulated request outcomes.
///
/// Each call to [`sample`][Self::sample] forks a fresh generator from the shared entropy source, so concurrent callers
/// draw independent, identically distributed results.
#[derive(Clone)]
pub struct ResponseGenerator {
    distribution: Arc<Distribution>,
    latency: LatencySimulator,
    entropy: EntropySource,
}

impl ResponseGenerator {
    /// Creates a new `ResponseGenerator`.
    pub fn new(distribution: Distribution, latency: LatencySimulator, entropy: EntropySource) -> Self {
        Self {
            distribution: Arc::new(distribution),
            latency,
            entropy,
        }
    }

    /// Samples a status code and a delay.
    ///
    /// A delay that cannot be drawn is logged and replaced with no delay at all: a bad latency configuration is not a
    /// reason to fail the request.
    ///
    /// # Errors
    ///
    /// If a status code cannot be drawn from the distribution, an error is returned.
    pub fn sample(&self) -> Result<SampleResult, DistributionError> {
        let mut rng = self.entropy.fork();

        let code = self.distribution.sample(&mut rng)?.code();
        let delay = match self.latency.sample_delay(&mut rng) {
            Ok(delay) => delay,
            Err(e) => {
                error!(error = %e, "Failed to compute simulated delay. Proceeding without delay.");
                Duration::ZERO
            }
        };

        Ok(SampleResult { code, delay })
    }
}
