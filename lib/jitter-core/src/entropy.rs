//! Process-wide source of randomness.

use std::sync::{Arc, Mutex, PoisonError};

use rand::{rngs::StdRng, SeedableRng as _};

/// A shared, seeded source of randomness.
///
/// `EntropySource` holds a single master generator which is seeded exactly once, when the source is created. Callers
/// never draw from the master generator directly: instead, they [`fork`][Self::fork] an independent generator from it,
/// which they then own outright. This keeps the lock on the master generator held only for the duration of the fork,
/// and ensures that concurrent callers never share generator state.
///
/// When created from a fixed seed, the sequence of forked generators (and so everything drawn from them) is
/// reproducible, provided forks happen in the same order.
#[derive(Clone)]
pub struct EntropySource {
    master: Arc<Mutex<StdRng>>,
}

impl EntropySource {
    /// Creates a new `EntropySource` seeded from the operating system's random data source.
    pub fn from_os_rng() -> Self {
        Self::from_rng(StdRng::from_os_rng())
    }

    /// Creates a new `EntropySource` seeded from the given value.
    pub fn from_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            master: Arc::new(Mutex::new(rng)),
        }
    }

    /// Forks a new, independent generator from the master generator.
    pub fn fork(&self) -> StdRng {
        // Nothing can leave the generator in an inconsistent state mid-draw, so a poisoned lock is still usable.
        let mut master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        StdRng::from_rng(&mut *master)
    }
}
