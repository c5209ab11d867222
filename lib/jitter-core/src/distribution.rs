//! Weighted selection of response outcomes.

use rand::Rng;
use serde::Deserialize;
use snafu::Snafu;

/// A distribution error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum DistributionError {
    /// The distribution cannot be sampled from.
    #[snafu(display("invalid distribution: {}", reason))]
    InvalidDistribution {
        /// Why the distribution is invalid.
        reason: &'static str,
    },

    /// Weighted selection walked every outcome without finding the drawn value.
    ///
    /// This cannot happen for a distribution whose total weight was computed from the same outcomes being walked, and
    /// indicates a bug rather than bad input.
    #[snafu(display(
        "weighted selection exhausted all outcomes: draw {} not covered by total weight {}",
        draw,
        total_weight
    ))]
    UnreachableState {
        /// The value that was drawn.
        draw: u64,

        /// The total weight that the value was drawn against.
        total_weight: u64,
    },
}

/// A response outcome, and its relative likelihood of being selected.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub struct Outcome {
    code: u16,
    weight: u32,
}

impl Outcome {
    /// Creates a new `Outcome` with the given status code and weight.
    pub const fn new(code: u16, weight: u32) -> Self {
        Self { code, weight }
    }

    /// Returns the status code of this outcome.
    pub const fn code(&self) -> u16 {
        self.code
    }

    /// Returns the weight of this outcome.
    pub const fn weight(&self) -> u32 {
        self.weight
    }
}

/// A validated set of weighted outcomes.
///
/// Outcomes are kept in the order they were configured in, which determines how the range of possible draws is
/// partitioned. Sampling with an identically-seeded generator therefore always yields the same sequence of outcomes.
///
/// A `Distribution` always has at least one outcome with a positive weight, so sampling from it cannot fail in
/// practice. Validation happens when the distribution is constructed (or deserialized), which keeps invalid
/// configurations a startup problem rather than a request-time problem.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(try_from = "Vec<Outcome>")]
pub struct Distribution {
    outcomes: Vec<Outcome>,
    total_weight: u64,
}

impl Distribution {
    /// Creates a new `Distribution` from the given outcomes.
    ///
    /// # Errors
    ///
    /// If there are no outcomes, or the weights of all outcomes sum to zero, an error is returned.
    pub fn try_from_outcomes(outcomes: Vec<Outcome>) -> Result<Self, DistributionError> {
        if outcomes.is_empty() {
            return Err(DistributionError::InvalidDistribution {
                reason: "at least one outcome must be configured",
            });
        }

        let total_weight = total_weight(&outcomes);
        if total_weight == 0 {
            return Err(DistributionError::InvalidDistribution {
                reason: "total weight of all outcomes must be greater than zero",
            });
        }

        Ok(Self { outcomes, total_weight })
    }

    /// Returns the outcomes of this distribution, in their configured order.
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    /// Returns the sum of all outcome weights.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Samples an outcome from this distribution.
    ///
    /// # Errors
    ///
    /// Sampling a validated distribution does not fail. See [`weighted_choice`] for the conditions under which an
    /// error would otherwise be returned.
    pub fn sample<R>(&self, rng: &mut R) -> Result<&Outcome, DistributionError>
    where
        R: Rng + ?Sized,
    {
        weighted_choice(&self.outcomes, rng)
    }
}

impl Default for Distribution {
    fn default() -> Self {
        Self {
            outcomes: vec![Outcome::new(200, 70), Outcome::new(400, 20), Outcome::new(500, 10)],
            total_weight: 100,
        }
    }
}

impl TryFrom<Vec<Outcome>> for Distribution {
    type Error = DistributionError;

    fn try_from(outcomes: Vec<Outcome>) -> Result<Self, Self::Error> {
        Self::try_from_outcomes(outcomes)
    }
}

/// Selects an outcome at random, with each outcome's likelihood proportional to its weight.
///
/// A value is drawn uniformly from `[0, total)`, where `total` is the sum of all weights. Outcomes are then walked in
/// order, accumulating their weights, and the first outcome whose cumulative weight exceeds the drawn value is
/// selected. Outcomes with a weight of zero are never selected.
///
/// # Errors
///
/// If the weights of all outcomes sum to zero (including when there are no outcomes at all), an error is returned.
pub fn weighted_choice<'a, R>(outcomes: &'a [Outcome], rng: &mut R) -> Result<&'a Outcome, DistributionError>
where
    R: Rng + ?Sized,
{
    let total_weight = total_weight(outcomes);
    if total_weight == 0 {
        return Err(DistributionError::InvalidDistribution {
            reason: "total weight of all outcomes must be greater than zero",
        });
    }

    let draw = rng.random_range(0..total_weight);
    select_outcome(outcomes, draw, total_weight)
}

fn select_outcome(outcomes: &[Outcome], draw: u64, total_weight: u64) -> Result<&Outcome, DistributionError> {
    let mut cumulative = 0u64;
    for outcome in outcomes {
        cumulative += u64::from(outcome.weight);
        if draw < cumulative {
            return Ok(outcome);
        }
    }

    Err(DistributionError::UnreachableState { draw, total_weight })
}

fn total_weight(outcomes: &[Outcome]) -> u64 {
    outcomes.iter().map(|o| u64::from(o.weight)).sum()
}
