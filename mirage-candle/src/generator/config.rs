//! Configuration of [`RolloutGenerator`](super::RolloutGenerator).
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Raw availabilities strictly above this value mark an action available.
pub const AVAIL_THRESHOLD: f32 = 0.2;

/// Raw termination signals strictly above this value end an episode.
pub const TERM_THRESHOLD: f32 = 0.9;

/// Action forced available for every agent at every step.
pub const FALLBACK_ACTION: usize = 1;

/// Configuration of [`RolloutGenerator`](super::RolloutGenerator).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct GeneratorConfig {
    /// Maximum number of episodes generated at once.
    ///
    /// Capped by the number of episodes in the buffer the initial states
    /// are sampled from.
    pub batch_size: usize,

    /// Availability threshold.
    #[serde(default = "default_avail_threshold")]
    pub avail_threshold: f32,

    /// Termination threshold.
    #[serde(default = "default_term_threshold")]
    pub term_threshold: f32,

    /// Action that is always available.
    #[serde(default = "default_fallback_action")]
    pub fallback_action: usize,
}

fn default_avail_threshold() -> f32 {
    AVAIL_THRESHOLD
}

fn default_term_threshold() -> f32 {
    TERM_THRESHOLD
}

fn default_fallback_action() -> usize {
    FALLBACK_ACTION
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            avail_threshold: AVAIL_THRESHOLD,
            term_threshold: TERM_THRESHOLD,
            fallback_action: FALLBACK_ACTION,
        }
    }
}

impl GeneratorConfig {
    /// Sets the rollout batch size.
    pub fn batch_size(mut self, v: usize) -> Self {
        self.batch_size = v;
        self
    }

    /// Sets the availability threshold.
    pub fn avail_threshold(mut self, v: f32) -> Self {
        self.avail_threshold = v;
        self
    }

    /// Sets the termination threshold.
    pub fn term_threshold(mut self, v: f32) -> Self {
        self.term_threshold = v;
        self
    }

    /// Sets the fallback action.
    pub fn fallback_action(mut self, v: usize) -> Self {
        self.fallback_action = v;
        self
    }

    /// Constructs [`GeneratorConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`GeneratorConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
