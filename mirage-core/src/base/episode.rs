//! Padded multi-agent episodes.
use crate::error::WorldModelError;
use anyhow::Result;
use ndarray::{concatenate, s, Array2, Array3, Array4, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Field layout shared by every episode of a buffer.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct EpisodeScheme {
    /// Width of the stored global state.
    pub state_shape: usize,

    /// Width of a single agent's observation.
    pub obs_shape: usize,

    /// Number of agents.
    pub n_agents: usize,

    /// Number of discrete actions per agent.
    pub n_actions: usize,
}

/// A batch of fixed-length, padded episodes.
///
/// Axis 0 indexes episodes and axis 1 indexes timesteps; the time axis has
/// `max_seq_length` entries, one more than the longest episode, so that
/// the state following the last transition is well-defined.
///
/// The reward and termination flag stored at step `t` are the outcome of the
/// joint action taken at step `t`.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeBatch {
    scheme: EpisodeScheme,

    /// Global state, `[B, L, state_shape]`.
    pub state: Array3<f32>,

    /// Per-agent observations, `[B, L, n_agents, obs_shape]`.
    pub obs: Array4<f32>,

    /// Per-agent action indices, `[B, L, n_agents]`.
    pub actions: Array3<i64>,

    /// Per-agent one-hot actions, `[B, L, n_agents, n_actions]`.
    pub actions_onehot: Array4<f32>,

    /// Per-agent available-action flags (0 or 1), `[B, L, n_agents, n_actions]`.
    pub avail_actions: Array4<f32>,

    /// Scalar reward, `[B, L]`.
    pub reward: Array2<f32>,

    /// Termination flag (0 or 1), `[B, L]`.
    pub terminated: Array2<f32>,

    /// 1 where the step was written, `[B, L]`.
    pub filled: Array2<f32>,
}

impl EpisodeBatch {
    /// Constructs a zero-filled batch.
    pub fn new(scheme: EpisodeScheme, batch_size: usize, max_seq_length: usize) -> Self {
        let (b, l) = (batch_size, max_seq_length);
        let (n, na) = (scheme.n_agents, scheme.n_actions);
        Self {
            scheme,
            state: Array3::zeros((b, l, scheme.state_shape)),
            obs: Array4::zeros((b, l, n, scheme.obs_shape)),
            actions: Array3::zeros((b, l, n)),
            actions_onehot: Array4::zeros((b, l, n, na)),
            avail_actions: Array4::zeros((b, l, n, na)),
            reward: Array2::zeros((b, l)),
            terminated: Array2::zeros((b, l)),
            filled: Array2::zeros((b, l)),
        }
    }

    /// Field layout of the batch.
    pub fn scheme(&self) -> &EpisodeScheme {
        &self.scheme
    }

    /// Number of episodes.
    pub fn batch_size(&self) -> usize {
        self.reward.shape()[0]
    }

    /// Padded length of the time axis.
    pub fn max_seq_length(&self) -> usize {
        self.reward.shape()[1]
    }

    /// Returns the episodes at the given indices, in order.
    pub fn select(&self, ixs: &[usize]) -> Self {
        Self {
            scheme: self.scheme,
            state: self.state.select(Axis(0), ixs),
            obs: self.obs.select(Axis(0), ixs),
            actions: self.actions.select(Axis(0), ixs),
            actions_onehot: self.actions_onehot.select(Axis(0), ixs),
            avail_actions: self.avail_actions.select(Axis(0), ixs),
            reward: self.reward.select(Axis(0), ixs),
            terminated: self.terminated.select(Axis(0), ixs),
            filled: self.filled.select(Axis(0), ixs),
        }
    }

    /// Returns the single episode at index `ix` as a batch of one.
    pub fn episode(&self, ix: usize) -> Result<Self> {
        if ix >= self.batch_size() {
            return Err(WorldModelError::InsufficientData(format!(
                "episode index {} out of range for a batch of {}",
                ix,
                self.batch_size()
            ))
            .into());
        }
        Ok(self.select(&[ix]))
    }

    /// Concatenates batches along the episode axis.
    pub fn concat(batches: &[&EpisodeBatch]) -> Result<Self> {
        let first = batches.first().ok_or_else(|| {
            WorldModelError::InsufficientData("cannot concatenate zero episode batches".into())
        })?;
        for b in batches.iter() {
            if b.scheme != first.scheme || b.max_seq_length() != first.max_seq_length() {
                return Err(WorldModelError::shape_mismatch(
                    "episode_batch",
                    (first.scheme, first.max_seq_length()),
                    (b.scheme, b.max_seq_length()),
                )
                .into());
            }
        }

        macro_rules! cat {
            ($field:ident) => {
                concatenate(
                    Axis(0),
                    &batches.iter().map(|b| b.$field.view()).collect::<Vec<_>>(),
                )?
            };
        }

        Ok(Self {
            scheme: first.scheme,
            state: cat!(state),
            obs: cat!(obs),
            actions: cat!(actions),
            actions_onehot: cat!(actions_onehot),
            avail_actions: cat!(avail_actions),
            reward: cat!(reward),
            terminated: cat!(terminated),
            filled: cat!(filled),
        })
    }

    /// Number of leading timesteps written in at least one episode.
    pub fn max_t_filled(&self) -> usize {
        self.filled
            .axis_iter(Axis(0))
            .map(|row| row.iter().filter(|&&f| f > 0.0).count())
            .max()
            .unwrap_or(0)
    }

    /// Keeps the first `len` timesteps of every episode.
    pub fn truncate(&self, len: usize) -> Self {
        let len = len.min(self.max_seq_length());
        Self {
            scheme: self.scheme,
            state: self.state.slice(s![.., ..len, ..]).to_owned(),
            obs: self.obs.slice(s![.., ..len, .., ..]).to_owned(),
            actions: self.actions.slice(s![.., ..len, ..]).to_owned(),
            actions_onehot: self.actions_onehot.slice(s![.., ..len, .., ..]).to_owned(),
            avail_actions: self.avail_actions.slice(s![.., ..len, .., ..]).to_owned(),
            reward: self.reward.slice(s![.., ..len]).to_owned(),
            terminated: self.terminated.slice(s![.., ..len]).to_owned(),
            filled: self.filled.slice(s![.., ..len]).to_owned(),
        }
    }

    /// Writes the data observed before acting at step `t` of episode `b`.
    ///
    /// `obs` is `[n_agents, obs_shape]` and `avail_actions` is
    /// `[n_agents, n_actions]`. Marks the step as filled.
    pub fn set_pre_transition(
        &mut self,
        b: usize,
        t: usize,
        state: ArrayView1<f32>,
        obs: ArrayView2<f32>,
        avail_actions: ArrayView2<f32>,
    ) -> Result<()> {
        self.check_index(b, t)?;
        if state.len() != self.scheme.state_shape {
            return Err(WorldModelError::shape_mismatch(
                "episode_batch.state",
                self.scheme.state_shape,
                state.len(),
            )
            .into());
        }
        if obs.dim() != (self.scheme.n_agents, self.scheme.obs_shape) {
            return Err(WorldModelError::shape_mismatch(
                "episode_batch.obs",
                (self.scheme.n_agents, self.scheme.obs_shape),
                obs.dim(),
            )
            .into());
        }
        if avail_actions.dim() != (self.scheme.n_agents, self.scheme.n_actions) {
            return Err(WorldModelError::shape_mismatch(
                "episode_batch.avail_actions",
                (self.scheme.n_agents, self.scheme.n_actions),
                avail_actions.dim(),
            )
            .into());
        }

        self.state.slice_mut(s![b, t, ..]).assign(&state);
        self.obs.slice_mut(s![b, t, .., ..]).assign(&obs);
        self.avail_actions.slice_mut(s![b, t, .., ..]).assign(&avail_actions);
        self.filled[[b, t]] = 1.0;
        Ok(())
    }

    /// Writes the joint action of episode `b` at step `t`, with its one-hot encoding.
    pub fn set_actions(&mut self, b: usize, t: usize, actions: ArrayView1<i64>) -> Result<()> {
        self.check_index(b, t)?;
        let n_actions = self.scheme.n_actions;
        if actions.len() != self.scheme.n_agents {
            return Err(WorldModelError::shape_mismatch(
                "episode_batch.actions",
                self.scheme.n_agents,
                actions.len(),
            )
            .into());
        }

        let mut onehot = self.actions_onehot.slice_mut(s![b, t, .., ..]);
        onehot.fill(0.0);
        for (agent, &a) in actions.iter().enumerate() {
            if a < 0 || a as usize >= n_actions {
                return Err(WorldModelError::InvalidAction {
                    agent,
                    action: a,
                    n_actions,
                    t,
                }
                .into());
            }
            onehot[[agent, a as usize]] = 1.0;
            self.actions[[b, t, agent]] = a;
        }
        Ok(())
    }

    /// Writes the outcome of the transition taken at step `t` of episode `b`.
    pub fn set_post_transition(
        &mut self,
        b: usize,
        t: usize,
        reward: f32,
        terminated: bool,
    ) -> Result<()> {
        self.check_index(b, t)?;
        self.reward[[b, t]] = reward;
        self.terminated[[b, t]] = if terminated { 1.0 } else { 0.0 };
        Ok(())
    }

    fn check_index(&self, b: usize, t: usize) -> Result<()> {
        if b >= self.batch_size() || t >= self.max_seq_length() {
            return Err(WorldModelError::shape_mismatch(
                "episode_batch.index",
                (self.batch_size(), self.max_seq_length()),
                (b, t),
            )
            .into());
        }
        Ok(())
    }
}
