//! Environment metadata.
use super::EpisodeScheme;
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Metadata of a multi-agent environment.
///
/// Supplied by the environment collaborator and used only to size the inputs
/// and outputs of the learned models, and to build the diagnostic
/// feature-name scheme of the global state.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EnvInfo {
    /// Number of controlled agents.
    pub n_agents: usize,

    /// Number of discrete actions per agent.
    pub n_actions: usize,

    /// Number of opponent units, used by the state-feature scheme only.
    #[serde(default)]
    pub n_enemies: usize,

    /// Width of a single agent's observation vector.
    pub obs_shape: usize,

    /// Width of the global state vector as stored in episodes.
    pub state_shape: usize,

    /// Maximum episode length. Episodes are padded to `episode_limit + 1` steps.
    pub episode_limit: usize,

    /// If `true`, the global state ends with the one-hot joint action of the
    /// previous step.
    #[serde(default)]
    pub state_last_action: bool,

    /// If `true`, the global state carries a timestep feature.
    #[serde(default)]
    pub state_timestep_number: bool,

    /// Number of shield bits of an ally unit in the global state.
    #[serde(default)]
    pub shield_bits_ally: usize,

    /// Number of shield bits of an enemy unit in the global state.
    #[serde(default)]
    pub shield_bits_enemy: usize,

    /// Number of unit-type bits per unit in the global state.
    #[serde(default)]
    pub unit_type_bits: usize,
}

impl EnvInfo {
    /// Constructs metadata with the sizes required by the learned models.
    pub fn new(
        n_agents: usize,
        n_actions: usize,
        obs_shape: usize,
        state_shape: usize,
        episode_limit: usize,
    ) -> Self {
        Self {
            n_agents,
            n_actions,
            n_enemies: 0,
            obs_shape,
            state_shape,
            episode_limit,
            state_last_action: false,
            state_timestep_number: false,
            shield_bits_ally: 0,
            shield_bits_enemy: 0,
            unit_type_bits: 0,
        }
    }

    /// Sets whether the global state embeds the last joint action.
    pub fn state_last_action(mut self, v: bool) -> Self {
        self.state_last_action = v;
        self
    }

    /// Sets the number of opponent units.
    pub fn n_enemies(mut self, v: usize) -> Self {
        self.n_enemies = v;
        self
    }

    /// Sets shield and unit-type bit counts.
    pub fn unit_bits(
        mut self,
        shield_bits_ally: usize,
        shield_bits_enemy: usize,
        unit_type_bits: usize,
    ) -> Self {
        self.shield_bits_ally = shield_bits_ally;
        self.shield_bits_enemy = shield_bits_enemy;
        self.unit_type_bits = unit_type_bits;
        self
    }

    /// Width of the flattened one-hot joint action.
    pub fn action_size(&self) -> usize {
        self.n_agents * self.n_actions
    }

    /// Width of the state modelled by the world model.
    ///
    /// When the stored state embeds the last joint action, that block is
    /// excluded.
    pub fn state_size(&self) -> usize {
        match self.state_last_action {
            true => self.state_shape.saturating_sub(self.action_size()),
            false => self.state_shape,
        }
    }

    /// Width of the flattened joint observation.
    pub fn joint_obs_size(&self) -> usize {
        self.n_agents * self.obs_shape
    }

    /// Padded episode length, `episode_limit + 1`.
    pub fn max_seq_length(&self) -> usize {
        self.episode_limit + 1
    }

    /// Field layout of stored episodes.
    pub fn scheme(&self) -> EpisodeScheme {
        EpisodeScheme {
            state_shape: self.state_shape,
            obs_shape: self.obs_shape,
            n_agents: self.n_agents,
            n_actions: self.n_actions,
        }
    }

    /// Returns the diagnostic name-to-index scheme of the global state.
    ///
    /// Ally features come first (`ally_{i}_{name}`), then enemy features
    /// (`enemy_{i}_{name}`). With `other_features`, the embedded last action
    /// and timestep features follow. With `custom_features`, `reward` and
    /// `term_signal` are appended, matching the layout of the state-model
    /// output.
    pub fn state_feature_scheme(
        &self,
        other_features: bool,
        custom_features: bool,
    ) -> Vec<(String, usize)> {
        let nf_ally = 4 + self.shield_bits_ally + self.unit_type_bits;
        let nf_enemy = 3 + self.shield_bits_enemy + self.unit_type_bits;

        let mut ally = vec!["health", "cooldown", "x", "y"];
        if self.shield_bits_ally > 0 {
            ally.push("shield");
        }
        if self.unit_type_bits > 0 {
            ally.push("type");
        }

        let mut enemy = vec!["health", "x", "y"];
        if self.shield_bits_enemy > 0 {
            enemy.push("shield");
        }
        if self.unit_type_bits > 0 {
            enemy.push("type");
        }

        let mut scheme = Vec::new();
        for a in 0..self.n_agents {
            for (j, name) in ally.iter().enumerate() {
                scheme.push((format!("ally_{}_{}", a, name), a * nf_ally + j));
            }
        }
        let offset = self.n_agents * nf_ally;
        for e in 0..self.n_enemies {
            for (j, name) in enemy.iter().enumerate() {
                scheme.push((format!("enemy_{}_{}", e, name), offset + e * nf_enemy + j));
            }
        }

        if other_features {
            let offset = offset + self.n_enemies * nf_enemy;
            let mut n_other = 0;
            if self.state_last_action {
                for i in 0..self.n_agents {
                    for j in 0..self.n_actions {
                        scheme.push((format!("agent_{}_action_{}", i, j), offset + n_other));
                        n_other += 1;
                    }
                }
            }
            if self.state_timestep_number {
                scheme.push(("timestep".to_string(), offset + n_other));
            }
        }

        if custom_features {
            let n = scheme.len();
            scheme.push(("reward".to_string(), n));
            scheme.push(("term_signal".to_string(), n + 1));
        }

        scheme
    }

    /// Returns the diagnostic name-to-index scheme of the observation-model output.
    ///
    /// Per-agent observation features (`agent_{i}_obs_{j}`) come first, then
    /// per-agent action availabilities (`agent_{i}_action_{j}_available`).
    pub fn obs_feature_scheme(&self) -> Vec<(String, usize)> {
        let mut scheme = Vec::with_capacity(self.joint_obs_size() + self.action_size());
        for i in 0..self.n_agents {
            for j in 0..self.obs_shape {
                scheme.push((format!("agent_{}_obs_{}", i, j), i * self.obs_shape + j));
            }
        }
        let offset = self.joint_obs_size();
        for i in 0..self.n_agents {
            for j in 0..self.n_actions {
                let name = format!("agent_{}_action_{}_available", i, j);
                scheme.push((name, offset + i * self.n_actions + j));
            }
        }
        scheme
    }

    /// Constructs [`EnvInfo`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ = path.as_ref().to_owned();
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        info!("Load env info from {:?}", path_);
        Ok(b)
    }

    /// Saves [`EnvInfo`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
