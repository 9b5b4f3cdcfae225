//! Train/test splitting and minibatch index sampling.
use crate::error::WorldModelError;
use anyhow::Result;
use rand::{seq::SliceRandom, Rng};

/// Disjoint train and test episode indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainTestSplit {
    /// Training indices.
    pub train: Vec<usize>,

    /// Held-out indices.
    pub test: Vec<usize>,
}

/// Number of held-out episodes out of `n`.
///
/// `round(ratio * n)`, clamped to `1..=n - 1` so that both partitions are
/// non-empty. Requires `n >= 2`.
pub fn test_size(n: usize, ratio: f32) -> Result<usize> {
    if n < 2 {
        return Err(WorldModelError::InsufficientData(format!(
            "need at least 2 episodes to split, got {}",
            n
        ))
        .into());
    }
    let k = (ratio.clamp(0.0, 1.0) * n as f32).round() as usize;
    Ok(k.clamp(1, n - 1))
}

/// Shuffles `0..n` and splits it into train and test indices.
pub fn train_test_split<R: Rng + ?Sized>(
    n: usize,
    ratio: f32,
    rng: &mut R,
) -> Result<TrainTestSplit> {
    let k = test_size(n, ratio)?;
    let mut ixs: Vec<usize> = (0..n).collect();
    ixs.shuffle(rng);
    let train = ixs.split_off(k);
    Ok(TrainTestSplit { train, test: ixs })
}

/// Draws `min(batch_size, available.len())` distinct indices from `available`.
pub fn sample_indices<R: Rng + ?Sized>(
    available: &[usize],
    batch_size: usize,
    rng: &mut R,
) -> Result<Vec<usize>> {
    let n = batch_size.min(available.len());
    if n == 0 {
        return Err(WorldModelError::InsufficientData(format!(
            "cannot sample a minibatch of {} from {} episodes",
            batch_size,
            available.len()
        ))
        .into());
    }
    Ok(available.choose_multiple(rng, n).copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, SeedableRng};
    use std::collections::HashSet;

    #[test]
    fn test_test_size() -> Result<()> {
        assert_eq!(test_size(10, 0.1)?, 1);
        assert_eq!(test_size(10, 0.25)?, 3);
        assert_eq!(test_size(3, 0.0)?, 1);
        assert_eq!(test_size(3, 1.0)?, 2);
        assert!(test_size(1, 0.1).is_err());
        Ok(())
    }

    #[test]
    fn test_split_partitions_indices() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(42);
        let split = train_test_split(20, 0.2, &mut rng)?;
        assert_eq!(split.test.len(), 4);
        assert_eq!(split.train.len(), 16);

        let all: HashSet<usize> = split.train.iter().chain(split.test.iter()).copied().collect();
        assert_eq!(all.len(), 20);
        assert!(split.test.iter().all(|i| !split.train.contains(i)));
        Ok(())
    }

    #[test]
    fn test_sample_indices() -> Result<()> {
        let mut rng = SmallRng::seed_from_u64(0);
        let available = vec![3, 5, 7];
        let ixs = sample_indices(&available, 8, &mut rng)?;
        assert_eq!(ixs.len(), 3);
        assert!(ixs.iter().all(|i| available.contains(i)));

        let ixs = sample_indices(&available, 2, &mut rng)?;
        assert_eq!(ixs.len(), 2);
        assert_ne!(ixs[0], ixs[1]);

        assert!(sample_indices(&[], 2, &mut rng).is_err());
        Ok(())
    }
}
