//! Observation model.
use crate::{
    cell::{HiddenState, LstmCell, RecurrentCell},
    model::{ObservationPredictor, RecurrentModel, RecurrentModelConfig},
};
use anyhow::Result;
use candle_core::{Device, Tensor, D};
use mirage_core::{
    error::{ModelKind, WorldModelError},
    record::Record,
    EnvInfo,
};
use std::path::Path;

/// Output of one step of the [`ObservationModel`].
#[derive(Debug, Clone)]
pub struct ObsPrediction {
    /// Flattened per-agent observations, `[batch_size, n_agents * obs_shape]`.
    pub obs: Tensor,

    /// Flattened raw availabilities, `[batch_size, n_agents * n_actions]`.
    pub avail_actions: Tensor,
}

/// Recurrent predictor of observations and availabilities.
///
/// Inputs are `(state, last joint action, termination signal)`.
///
/// The input at every step is `state ++ last_action ++ term_signal` when
/// the last action is included, `state ++ term_signal` otherwise.
pub struct ObservationModel<C: RecurrentCell = LstmCell> {
    model: RecurrentModel<C>,
    state_size: usize,
    action_size: usize,
    joint_obs_size: usize,
    include_last_action: bool,
}

impl<C: RecurrentCell> ObservationModel<C> {
    /// Constructs [`ObservationModel`].
    pub fn build(
        env_info: &EnvInfo,
        include_last_action: bool,
        config: &RecurrentModelConfig,
        device: Device,
    ) -> Result<Self> {
        let state_size = env_info.state_size();
        let action_size = env_info.action_size();
        let joint_obs_size = env_info.joint_obs_size();
        let in_dim = match include_last_action {
            true => state_size + action_size + 1,
            false => state_size + 1,
        };
        let model = RecurrentModel::build(
            ModelKind::ObsModel,
            in_dim,
            joint_obs_size + action_size,
            config,
            device,
        )?;

        Ok(Self {
            model,
            state_size,
            action_size,
            joint_obs_size,
            include_last_action,
        })
    }

    /// Width of the output vector.
    pub fn output_size(&self) -> usize {
        self.joint_obs_size + self.action_size
    }

    /// Returns `true` if the last joint action is part of the input.
    pub fn include_last_action(&self) -> bool {
        self.include_last_action
    }

    fn check_state_width(&self, state: &Tensor) -> Result<()> {
        let s = state.dim(D::Minus1)?;
        if s != self.state_size {
            return Err(WorldModelError::shape_mismatch(
                ModelKind::ObsModel.to_string(),
                self.state_size,
                s,
            )
            .into());
        }
        Ok(())
    }

    fn input(
        &self,
        state: &Tensor,
        last_action: Option<&Tensor>,
        term_signal: &Tensor,
    ) -> Result<Tensor> {
        self.check_state_width(state)?;
        let x = match self.include_last_action {
            true => {
                let zeros;
                let last_action = match last_action {
                    Some(a) => a,
                    None => {
                        let mut dims = state.dims().to_vec();
                        if let Some(last) = dims.last_mut() {
                            *last = self.action_size;
                        }
                        zeros = Tensor::zeros(dims, state.dtype(), state.device())?;
                        &zeros
                    }
                };
                Tensor::cat(&[state, last_action, term_signal], D::Minus1)?
            }
            false => Tensor::cat(&[state, term_signal], D::Minus1)?,
        };
        Ok(x)
    }

    /// Runs the model over a sequence.
    ///
    /// `states` is `[batch_size, steps, state_size]`, `last_actions` is
    /// `[batch_size, steps, action_size]` and `term_signal` is
    /// `[batch_size, steps, 1]`. Returns the raw outputs and the final hidden
    /// state.
    pub fn predict_sequence(
        &self,
        states: &Tensor,
        last_actions: &Tensor,
        term_signal: &Tensor,
        hidden: Option<&HiddenState>,
    ) -> Result<(Tensor, HiddenState)> {
        let xs = self.input(states, Some(last_actions), term_signal)?;
        self.model.forward_seq(&xs, hidden)
    }

    /// Splits raw outputs along the last axis.
    pub fn split_output(&self, y: &Tensor) -> Result<ObsPrediction> {
        Ok(ObsPrediction {
            obs: y.narrow(D::Minus1, 0, self.joint_obs_size)?,
            avail_actions: y.narrow(D::Minus1, self.joint_obs_size, self.action_size)?,
        })
    }

    /// Clips gradients and takes an optimizer step.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<f32> {
        self.model.backward_step(loss)
    }

    /// The underlying recurrent predictor.
    pub fn model(&self) -> &RecurrentModel<C> {
        &self.model
    }

    /// Saves parameters.
    pub fn save<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        self.model.save(path)
    }

    /// Loads parameters.
    pub fn load<T: AsRef<Path>>(&mut self, path: T) -> Result<()> {
        self.model.load(path)
    }

    /// Mean and standard deviation of each parameter.
    pub fn param_stats(&self) -> Result<Record> {
        self.model.param_stats()
    }
}

impl<C: RecurrentCell> ObservationPredictor for ObservationModel<C> {
    fn predict_step(
        &self,
        state: &Tensor,
        last_action: Option<&Tensor>,
        term_signal: &Tensor,
        hidden: Option<&HiddenState>,
    ) -> Result<(ObsPrediction, HiddenState)> {
        let x = self.input(state, last_action, term_signal)?;
        let (y, hidden) = self.model.forward(&x, hidden)?;
        Ok((self.split_output(&y)?, hidden))
    }
}
