use super::EpisodeReplayBufferConfig;
use crate::{error::WorldModelError, EpisodeBatch, EpisodeBufferBase, EpisodeScheme};
use anyhow::Result;
use ndarray::s;
use rand::{seq::index::sample, RngCore};

/// A ring buffer of padded episodes.
///
/// Once full, inserting an episode overwrites the oldest one. Episode
/// indices address the stored episodes in insertion order, so index 0 is
/// always the oldest surviving episode.
pub struct EpisodeReplayBuffer {
    scheme: EpisodeScheme,
    max_seq_length: usize,
    capacity: usize,
    i: usize,
    episodes: Vec<EpisodeBatch>,
}

impl EpisodeReplayBuffer {
    /// Constructs an empty buffer.
    pub fn build(
        config: &EpisodeReplayBufferConfig,
        scheme: EpisodeScheme,
        max_seq_length: usize,
    ) -> Self {
        Self {
            scheme,
            max_seq_length,
            capacity: config.capacity.max(1),
            i: 0,
            episodes: Vec::new(),
        }
    }

    /// Maximum number of stored episodes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends every episode of `batch`.
    ///
    /// Batches shorter than the padded length are padded with zeros.
    pub fn insert_episode_batch(&mut self, batch: &EpisodeBatch) -> Result<()> {
        if batch.scheme() != &self.scheme || batch.max_seq_length() > self.max_seq_length {
            return Err(WorldModelError::shape_mismatch(
                "replay_buffer",
                (self.scheme, self.max_seq_length),
                (*batch.scheme(), batch.max_seq_length()),
            )
            .into());
        }

        for b in 0..batch.batch_size() {
            let episode = self.pad(batch.episode(b)?);
            if self.episodes.len() < self.capacity {
                self.episodes.push(episode);
            } else {
                self.episodes[self.i] = episode;
            }
            self.i = (self.i + 1) % self.capacity;
        }
        Ok(())
    }

    /// Returns `true` if at least `batch_size` episodes are stored.
    pub fn can_sample(&self, batch_size: usize) -> bool {
        self.episodes.len() >= batch_size
    }

    fn pad(&self, episode: EpisodeBatch) -> EpisodeBatch {
        let len = episode.max_seq_length();
        if len == self.max_seq_length {
            return episode;
        }
        let mut padded = EpisodeBatch::new(self.scheme, 1, self.max_seq_length);
        padded.state.slice_mut(s![.., ..len, ..]).assign(&episode.state);
        padded.obs.slice_mut(s![.., ..len, .., ..]).assign(&episode.obs);
        padded.actions.slice_mut(s![.., ..len, ..]).assign(&episode.actions);
        padded
            .actions_onehot
            .slice_mut(s![.., ..len, .., ..])
            .assign(&episode.actions_onehot);
        padded
            .avail_actions
            .slice_mut(s![.., ..len, .., ..])
            .assign(&episode.avail_actions);
        padded.reward.slice_mut(s![.., ..len]).assign(&episode.reward);
        padded.terminated.slice_mut(s![.., ..len]).assign(&episode.terminated);
        padded.filled.slice_mut(s![.., ..len]).assign(&episode.filled);
        padded
    }

    // Physical slot of the episode with logical index `ix`.
    fn slot(&self, ix: usize) -> usize {
        if self.episodes.len() < self.capacity {
            ix
        } else {
            (self.i + ix) % self.capacity
        }
    }
}

impl EpisodeBufferBase for EpisodeReplayBuffer {
    fn scheme(&self) -> &EpisodeScheme {
        &self.scheme
    }

    fn max_seq_length(&self) -> usize {
        self.max_seq_length
    }

    fn episodes_in_buffer(&self) -> usize {
        self.episodes.len()
    }

    fn episode(&self, ix: usize) -> Result<EpisodeBatch> {
        if ix >= self.episodes.len() {
            return Err(WorldModelError::InsufficientData(format!(
                "episode index {} out of range, {} episodes in buffer",
                ix,
                self.episodes.len()
            ))
            .into());
        }
        Ok(self.episodes[self.slot(ix)].clone())
    }

    fn sample(&self, n: usize, rng: &mut dyn RngCore) -> Result<EpisodeBatch> {
        if n == 0 || !self.can_sample(n) {
            return Err(WorldModelError::InsufficientData(format!(
                "cannot sample {} episodes, {} in buffer",
                n,
                self.episodes.len()
            ))
            .into());
        }
        let ixs = sample(rng, self.episodes.len(), n).into_vec();
        self.episodes(&ixs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, SeedableRng};

    fn scheme() -> EpisodeScheme {
        EpisodeScheme {
            state_shape: 2,
            obs_shape: 1,
            n_agents: 1,
            n_actions: 2,
        }
    }

    fn episode_with_reward(r: f32) -> EpisodeBatch {
        let mut e = EpisodeBatch::new(scheme(), 1, 4);
        e.reward[[0, 0]] = r;
        e
    }

    #[test]
    fn test_fifo_overwrites_oldest() -> Result<()> {
        let config = EpisodeReplayBufferConfig::default().capacity(3);
        let mut buffer = EpisodeReplayBuffer::build(&config, scheme(), 4);
        for r in 0..5 {
            buffer.insert_episode_batch(&episode_with_reward(r as f32))?;
        }
        assert_eq!(buffer.episodes_in_buffer(), 3);
        let rewards: Vec<f32> = (0..3)
            .map(|ix| buffer.episode(ix).map(|e| e.reward[[0, 0]]))
            .collect::<Result<_>>()?;
        assert_eq!(rewards, vec![2.0, 3.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_pads_short_episodes() -> Result<()> {
        let config = EpisodeReplayBufferConfig::default();
        let mut buffer = EpisodeReplayBuffer::build(&config, scheme(), 6);
        buffer.insert_episode_batch(&episode_with_reward(1.0))?;
        let e = buffer.episode(0)?;
        assert_eq!(e.max_seq_length(), 6);
        assert_eq!(e.reward[[0, 0]], 1.0);
        Ok(())
    }

    #[test]
    fn test_sample_distinct() -> Result<()> {
        let config = EpisodeReplayBufferConfig::default();
        let mut buffer = EpisodeReplayBuffer::build(&config, scheme(), 4);
        for r in 0..10 {
            buffer.insert_episode_batch(&episode_with_reward(r as f32))?;
        }
        let mut rng = SmallRng::seed_from_u64(42);
        let batch = buffer.sample(10, &mut rng)?;
        let mut rewards: Vec<f32> = batch.reward.column(0).to_vec();
        rewards.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(rewards, (0..10).map(|r| r as f32).collect::<Vec<_>>());
        assert!(buffer.sample(11, &mut rng).is_err());
        Ok(())
    }
}
