//! Configuration of [`WorldModel`](super::WorldModel).
use crate::{Device, GeneratorConfig, RecurrentModelConfig, TrainerConfig};
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    default::Default,
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of [`WorldModel`](super::WorldModel).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct WorldModelConfig {
    /// Configuration of the state-transition model.
    pub state_model_config: RecurrentModelConfig,

    /// Configuration of the observation model.
    pub obs_model_config: RecurrentModelConfig,

    /// Training schedule of the state-transition model.
    pub state_trainer_config: TrainerConfig,

    /// Training schedule of the observation model.
    pub obs_trainer_config: TrainerConfig,

    /// If `true`, observation-model minibatches are truncated to their live steps.
    pub obs_model_use_mask: bool,

    /// If `true`, the observation model takes the previous joint action as input.
    pub obs_model_include_last_action: bool,

    /// Fraction of episodes held out for validation.
    pub test_ratio: f32,

    /// Configuration of rollouts.
    pub generator_config: GeneratorConfig,

    /// Device on which the models live. CPU if `None`.
    pub device: Option<Device>,

    /// Verbosity of training records.
    ///
    /// `1` adds per-feature validation errors, `2` also adds parameter statistics.
    pub record_verbose_level: usize,
}

impl Default for WorldModelConfig {
    fn default() -> Self {
        Self {
            state_model_config: RecurrentModelConfig::default(),
            obs_model_config: RecurrentModelConfig::default(),
            state_trainer_config: TrainerConfig::default(),
            obs_trainer_config: TrainerConfig::default(),
            obs_model_use_mask: false,
            obs_model_include_last_action: true,
            test_ratio: 0.1,
            generator_config: GeneratorConfig::default(),
            device: None,
            record_verbose_level: 0,
        }
    }
}

impl WorldModelConfig {
    /// Sets the configuration of the state-transition model.
    pub fn state_model_config(mut self, v: RecurrentModelConfig) -> Self {
        self.state_model_config = v;
        self
    }

    /// Sets the configuration of the observation model.
    pub fn obs_model_config(mut self, v: RecurrentModelConfig) -> Self {
        self.obs_model_config = v;
        self
    }

    /// Sets the training schedule of the state-transition model.
    pub fn state_trainer_config(mut self, v: TrainerConfig) -> Self {
        self.state_trainer_config = v;
        self
    }

    /// Sets the training schedule of the observation model.
    pub fn obs_trainer_config(mut self, v: TrainerConfig) -> Self {
        self.obs_trainer_config = v;
        self
    }

    /// Sets whether observation-model minibatches are truncated.
    pub fn obs_model_use_mask(mut self, v: bool) -> Self {
        self.obs_model_use_mask = v;
        self
    }

    /// Sets whether the observation model takes the previous joint action.
    pub fn obs_model_include_last_action(mut self, v: bool) -> Self {
        self.obs_model_include_last_action = v;
        self
    }

    /// Sets the test ratio.
    pub fn test_ratio(mut self, v: f32) -> Self {
        self.test_ratio = v;
        self
    }

    /// Sets the configuration of rollouts.
    pub fn generator_config(mut self, v: GeneratorConfig) -> Self {
        self.generator_config = v;
        self
    }

    /// Sets device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Sets the verbosity of training records.
    pub fn record_verbose_level(mut self, v: usize) -> Self {
        self.record_verbose_level = v;
        self
    }

    /// Loads [`WorldModelConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ = path.as_ref().to_owned();
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        info!("Load config of world model from {:?}", path_);
        Ok(b)
    }

    /// Saves [`WorldModelConfig`] to YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path_ = path.as_ref().to_owned();
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        info!("Save config of world model into {:?}", path_);
        Ok(())
    }
}
