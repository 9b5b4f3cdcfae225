//! A FIFO replay buffer of padded episodes.
mod base;
mod config;
pub use base::EpisodeReplayBuffer;
pub use config::EpisodeReplayBufferConfig;
