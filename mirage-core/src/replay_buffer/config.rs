//! Configuration of [EpisodeReplayBuffer](super::EpisodeReplayBuffer).
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    default::Default,
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of [EpisodeReplayBuffer](super::EpisodeReplayBuffer).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EpisodeReplayBufferConfig {
    /// Maximum number of stored episodes.
    pub capacity: usize,
}

impl Default for EpisodeReplayBufferConfig {
    fn default() -> Self {
        Self { capacity: 5000 }
    }
}

impl EpisodeReplayBufferConfig {
    /// Sets the capacity of the replay buffer.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Constructs [`EpisodeReplayBufferConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`EpisodeReplayBufferConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
