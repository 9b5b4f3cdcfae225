//! Conversion of padded episodes into model inputs and targets.
use crate::util::array_to_tensor;
use anyhow::Result;
use candle_core::{Device, Tensor};
use log::trace;
use mirage_core::{error::WorldModelError, EnvInfo, EpisodeBatch};
use ndarray::{s, Array3, ArrayView1, Axis};

/// Per-episode tensors derived from an [`EpisodeBatch`].
///
/// Every field is `[batch_size, steps, *]` with `steps` one less than the
/// padded length. All fields but `term_signal` are zero after the
/// termination index of their episode; `term_signal` is 0 before and 1
/// from the termination index onward.
#[derive(Debug, Clone)]
pub struct TrainingEpisodeVars {
    /// Global state without the embedded last action, `[B, T, state_size]`.
    pub state: Tensor,

    /// Flattened one-hot joint action, `[B, T, n_agents * n_actions]`.
    pub action: Tensor,

    /// Reward, `[B, T, 1]`.
    pub reward: Tensor,

    /// Termination signal, `[B, T, 1]`.
    pub term_signal: Tensor,

    /// Flattened observations, `[B, T, n_agents * obs_shape]`.
    pub obs: Tensor,

    /// Flattened availabilities, `[B, T, n_agents * n_actions]`.
    pub avail_actions: Tensor,

    /// 1 at and before the termination index, `[B, T, 1]`.
    pub mask: Tensor,
}

impl TrainingEpisodeVars {
    /// Number of episodes.
    pub fn batch_size(&self) -> usize {
        self.mask.dims()[0]
    }

    /// Number of timesteps.
    pub fn n_steps(&self) -> usize {
        self.mask.dims()[1]
    }

    /// Concatenates along the episode axis.
    pub fn cat(vars: &[&TrainingEpisodeVars]) -> Result<Self> {
        if vars.is_empty() {
            let msg = "no episodes to concatenate".to_string();
            return Err(WorldModelError::InsufficientData(msg).into());
        }
        macro_rules! cat {
            ($field:ident) => {
                Tensor::cat(&vars.iter().map(|v| &v.$field).collect::<Vec<_>>(), 0)?
            };
        }
        Ok(Self {
            state: cat!(state),
            action: cat!(action),
            reward: cat!(reward),
            term_signal: cat!(term_signal),
            obs: cat!(obs),
            avail_actions: cat!(avail_actions),
            mask: cat!(mask),
        })
    }

    /// Keeps the first `len` timesteps, never fewer than one.
    pub fn truncate(&self, len: usize) -> Result<Self> {
        let len = len.clamp(1, self.n_steps());
        Ok(Self {
            state: self.state.narrow(1, 0, len)?,
            action: self.action.narrow(1, 0, len)?,
            reward: self.reward.narrow(1, 0, len)?,
            term_signal: self.term_signal.narrow(1, 0, len)?,
            obs: self.obs.narrow(1, 0, len)?,
            avail_actions: self.avail_actions.narrow(1, 0, len)?,
            mask: self.mask.narrow(1, 0, len)?,
        })
    }

    /// Maximum number of live (mask = 1) steps over the batch, at least one.
    pub fn live_steps(&self) -> Result<usize> {
        let n = self.mask.sum((1, 2))?.max(0)?.to_scalar::<f32>()?;
        Ok((n.round() as usize).max(1))
    }
}

/// Builds [`TrainingEpisodeVars`] from padded episodes.
pub struct EpisodePreprocessor {
    state_size: usize,
    device: Device,
}

impl EpisodePreprocessor {
    /// Constructs [`EpisodePreprocessor`].
    pub fn new(env_info: &EnvInfo, device: Device) -> Self {
        Self {
            state_size: env_info.state_size(),
            device,
        }
    }

    /// Index of the first step whose termination flag is set.
    ///
    /// The last step of `terminated` if the episode never terminates.
    pub fn termination_index(terminated: ArrayView1<f32>) -> usize {
        terminated
            .iter()
            .position(|&v| v > 0.0)
            .unwrap_or(terminated.len().saturating_sub(1))
    }

    /// Drops the final padding step and applies termination-aware masking,
    /// independently for every episode of `batch`.
    pub fn process(&self, batch: &EpisodeBatch) -> Result<TrainingEpisodeVars> {
        let (b, l) = (batch.batch_size(), batch.max_seq_length());
        if l < 2 {
            return Err(WorldModelError::InsufficientData(format!(
                "episodes of padded length {} have no transition",
                l
            ))
            .into());
        }
        let t = l - 1;
        let scheme = batch.scheme();
        if self.state_size > scheme.state_shape {
            return Err(WorldModelError::shape_mismatch(
                "preprocessor",
                self.state_size,
                scheme.state_shape,
            )
            .into());
        }
        let joint_obs = scheme.n_agents * scheme.obs_shape;
        let joint_action = scheme.n_agents * scheme.n_actions;

        let mut state = batch.state.slice(s![.., ..t, ..self.state_size]).to_owned();
        let mut obs = batch
            .obs
            .slice(s![.., ..t, .., ..])
            .to_owned()
            .into_shape((b, t, joint_obs))?;
        let mut avail = batch
            .avail_actions
            .slice(s![.., ..t, .., ..])
            .to_owned()
            .into_shape((b, t, joint_action))?;
        let mut action = batch
            .actions_onehot
            .slice(s![.., ..t, .., ..])
            .to_owned()
            .into_shape((b, t, joint_action))?;
        let mut reward = batch.reward.slice(s![.., ..t]).to_owned().insert_axis(Axis(2));
        let mut term_signal = Array3::<f32>::zeros((b, t, 1));
        let mut mask = Array3::<f32>::ones((b, t, 1));

        for i in 0..b {
            let ix = Self::termination_index(batch.terminated.slice(s![i, ..t]));
            trace!("episode {}: termination index {}", i, ix);
            term_signal.slice_mut(s![i, ix.., ..]).fill(1.0);
            let cut = ix + 1;
            mask.slice_mut(s![i, cut.., ..]).fill(0.0);
            state.slice_mut(s![i, cut.., ..]).fill(0.0);
            obs.slice_mut(s![i, cut.., ..]).fill(0.0);
            avail.slice_mut(s![i, cut.., ..]).fill(0.0);
            action.slice_mut(s![i, cut.., ..]).fill(0.0);
            reward.slice_mut(s![i, cut.., ..]).fill(0.0);
        }

        let device = &self.device;
        Ok(TrainingEpisodeVars {
            state: array_to_tensor(&state, device)?,
            action: array_to_tensor(&action, device)?,
            reward: array_to_tensor(&reward, device)?,
            term_signal: array_to_tensor(&term_signal, device)?,
            obs: array_to_tensor(&obs, device)?,
            avail_actions: array_to_tensor(&avail, device)?,
            mask: array_to_tensor(&mask, device)?,
        })
    }
}
