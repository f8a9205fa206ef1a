use crate::error::{RecError, RecResult};
use rand::Rng;
use std::collections::HashSet;

pub const DEFAULT_MAX_ATTEMPTS: usize = 100;

/// Uniform negative sampling with rejection of items the user already rated.
#[derive(Debug, Clone)]
pub struct NegativeSampler {
    num_items: usize,
    max_attempts: usize,
}

impl NegativeSampler {
    pub fn new(num_items: usize, max_attempts: usize) -> Self {
        Self {
            num_items,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Draws one item in `0..num_items` that is not in `rated`.
    ///
    /// Fails with `SamplingExhausted` after `max_attempts` collisions, or
    /// immediately when `rated` already covers the whole catalog.
    pub fn sample<R: Rng>(
        &self,
        user: usize,
        rated: &HashSet<usize>,
        rng: &mut R,
    ) -> RecResult<usize> {
        let exhausted = RecError::SamplingExhausted {
            user,
            attempts: self.max_attempts,
        };
        let catalog_covered =
            rated.len() >= self.num_items && (0..self.num_items).all(|i| rated.contains(&i));
        if self.num_items == 0 || catalog_covered {
            return Err(exhausted);
        }

        for _ in 0..self.max_attempts {
            let candidate = rng.gen_range(0..self.num_items);
            if !rated.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_never_returns_rated_items() {
        let sampler = NegativeSampler::new(20, DEFAULT_MAX_ATTEMPTS);
        let rated: HashSet<usize> = (0..15).collect();
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..2000 {
            let item = sampler.sample(0, &rated, &mut rng).unwrap();
            assert!(item < 20);
            assert!(!rated.contains(&item));
        }
    }

    #[test]
    fn test_fully_rated_user_is_exhausted() {
        let sampler = NegativeSampler::new(4, DEFAULT_MAX_ATTEMPTS);
        let rated: HashSet<usize> = (0..4).collect();
        let err = sampler.sample(3, &rated, &mut StdRng::seed_from_u64(1)).unwrap_err();
        assert!(matches!(err, RecError::SamplingExhausted { user: 3, .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_single_free_item_is_found_or_exhausted() {
        let sampler = NegativeSampler::new(1000, 3);
        let rated: HashSet<usize> = (1..1000).collect();
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..50 {
            match sampler.sample(0, &rated, &mut rng) {
                Ok(item) => assert_eq!(item, 0),
                Err(RecError::SamplingExhausted { attempts: 3, .. }) => {}
                Err(other) => panic!("unexpected {other}"),
            }
        }
    }
}
