//! Interface of episode stores.
use super::{EpisodeBatch, EpisodeScheme};
use anyhow::Result;
use rand::RngCore;

/// A store of padded episodes that the world model learns from.
///
/// Every stored episode has the same [`EpisodeScheme`] and padded length
/// [`max_seq_length`](EpisodeBufferBase::max_seq_length).
pub trait EpisodeBufferBase {
    /// Field layout of stored episodes.
    fn scheme(&self) -> &EpisodeScheme;

    /// Padded length of the time axis of stored episodes.
    fn max_seq_length(&self) -> usize;

    /// Number of stored episodes.
    fn episodes_in_buffer(&self) -> usize;

    /// Returns the episode at index `ix` as a batch of one.
    fn episode(&self, ix: usize) -> Result<EpisodeBatch>;

    /// Returns the episodes at the given indices, in order.
    fn episodes(&self, ixs: &[usize]) -> Result<EpisodeBatch> {
        let batches = ixs
            .iter()
            .map(|&ix| self.episode(ix))
            .collect::<Result<Vec<_>>>()?;
        EpisodeBatch::concat(&batches.iter().collect::<Vec<_>>())
    }

    /// Samples `n` distinct episodes uniformly at random.
    fn sample(&self, n: usize, rng: &mut dyn RngCore) -> Result<EpisodeBatch>;
}
