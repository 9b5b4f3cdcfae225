//! State-transition model.
use crate::{
    cell::{HiddenState, LstmCell, RecurrentCell},
    model::{RecurrentModel, RecurrentModelConfig, TransitionPredictor},
};
use anyhow::Result;
use candle_core::{Device, Tensor, D};
use mirage_core::{
    error::{ModelKind, WorldModelError},
    record::Record,
};
use std::path::Path;

/// Output of one step of the [`StateTransitionModel`].
#[derive(Debug, Clone)]
pub struct StatePrediction {
    /// Predicted next state, `[batch_size, state_size]`.
    pub next_state: Tensor,

    /// Predicted reward, `[batch_size, 1]`.
    pub reward: Tensor,

    /// Raw termination signal, `[batch_size, 1]`.
    pub term_signal: Tensor,
}

/// Recurrent predictor of `(state, joint action) -> (next state, reward, termination signal)`.
///
/// The output vector is `next_state ++ reward ++ term_signal`, of width
/// `state_size + 2`.
pub struct StateTransitionModel<C: RecurrentCell = LstmCell> {
    model: RecurrentModel<C>,
    state_size: usize,
    action_size: usize,
}

impl<C: RecurrentCell> StateTransitionModel<C> {
    /// Constructs [`StateTransitionModel`].
    pub fn build(
        state_size: usize,
        action_size: usize,
        config: &RecurrentModelConfig,
        device: Device,
    ) -> Result<Self> {
        let model = RecurrentModel::build(
            ModelKind::StateModel,
            state_size + action_size,
            state_size + 2,
            config,
            device,
        )?;
        Ok(Self {
            model,
            state_size,
            action_size,
        })
    }

    /// Width of the output vector.
    pub fn output_size(&self) -> usize {
        self.state_size + 2
    }

    fn check_widths(&self, state: &Tensor, action: &Tensor) -> Result<()> {
        let s = state.dim(D::Minus1)?;
        let a = action.dim(D::Minus1)?;
        if s != self.state_size || a != self.action_size {
            return Err(WorldModelError::shape_mismatch(
                ModelKind::StateModel.to_string(),
                (self.state_size, self.action_size),
                (s, a),
            )
            .into());
        }
        Ok(())
    }

    /// Runs the model over a sequence of recorded states.
    ///
    /// `states` is `[batch_size, steps, state_size]` and `actions` is
    /// `[batch_size, steps, action_size]`; the input at every step is the
    /// recorded state, never a previous prediction. Returns the raw outputs,
    /// `[batch_size, steps, state_size + 2]`, and the final hidden state.
    pub fn predict_sequence(
        &self,
        states: &Tensor,
        actions: &Tensor,
        hidden: Option<&HiddenState>,
    ) -> Result<(Tensor, HiddenState)> {
        self.check_widths(states, actions)?;
        let xs = Tensor::cat(&[states, actions], D::Minus1)?;
        self.model.forward_seq(&xs, hidden)
    }

    /// Splits raw outputs along the last axis.
    pub fn split_output(&self, y: &Tensor) -> Result<StatePrediction> {
        let s = self.state_size;
        Ok(StatePrediction {
            next_state: y.narrow(D::Minus1, 0, s)?,
            reward: y.narrow(D::Minus1, s, 1)?,
            term_signal: y.narrow(D::Minus1, s + 1, 1)?,
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

impl<C: RecurrentCell> TransitionPredictor for StateTransitionModel<C> {
    fn state_size(&self) -> usize {
        self.state_size
    }

    fn action_size(&self) -> usize {
        self.action_size
    }

    fn predict_step(
        &self,
        state: &Tensor,
        action: &Tensor,
        hidden: Option<&HiddenState>,
    ) -> Result<(StatePrediction, HiddenState)> {
        self.check_widths(state, action)?;
        let x = Tensor::cat(&[state, action], D::Minus1)?;
        let (y, hidden) = self.model.forward(&x, hidden)?;
        Ok((self.split_output(&y)?, hidden))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_predict_step_split() -> Result<()> {
        let model: StateTransitionModel =
            StateTransitionModel::build(5, 6, &RecurrentModelConfig::default(), Device::Cpu)?;
        let state = Tensor::zeros((3, 5), DType::F32, &Device::Cpu)?;
        let action = Tensor::zeros((3, 6), DType::F32, &Device::Cpu)?;
        let (pred, _) = model.predict_step(&state, &action, None)?;
        assert_eq!(pred.next_state.dims(), &[3, 5]);
        assert_eq!(pred.reward.dims(), &[3, 1]);
        assert_eq!(pred.term_signal.dims(), &[3, 1]);
        Ok(())
    }

    #[test]
    fn test_predict_sequence_uses_recorded_states() -> Result<()> {
        let model: StateTransitionModel =
            StateTransitionModel::build(2, 2, &RecurrentModelConfig::default(), Device::Cpu)?;
        let states = Tensor::randn(0f32, 1., (1, 4, 2), &Device::Cpu)?;
        let actions = Tensor::randn(0f32, 1., (1, 4, 2), &Device::Cpu)?;
        let (ys, _) = model.predict_sequence(&states, &actions, None)?;

        // Feeding the recorded states step by step gives the same outputs.
        let mut hidden = None;
        for t in 0..4 {
            let s = states.narrow(1, t, 1)?.squeeze(1)?;
            let a = actions.narrow(1, t, 1)?.squeeze(1)?;
            let (pred, h) = model.predict_step(&s, &a, hidden.as_ref())?;
            let y = model.split_output(&ys.narrow(1, t, 1)?.squeeze(1)?)?;
            let diff = (pred.next_state - y.next_state)?.abs()?.max_all()?;
            assert!(diff.to_scalar::<f32>()? < 1e-6);
            hidden = Some(h);
        }
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_action_width() -> Result<()> {
        let model: StateTransitionModel =
            StateTransitionModel::build(5, 6, &RecurrentModelConfig::default(), Device::Cpu)?;
        let state = Tensor::zeros((3, 5), DType::F32, &Device::Cpu)?;
        let action = Tensor::zeros((3, 4), DType::F32, &Device::Cpu)?;
        let err = model.predict_step(&state, &action, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorldModelError>(),
            Some(WorldModelError::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
