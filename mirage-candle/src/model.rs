//! Recurrent predictor shared by the state-transition and observation models.
use crate::{
    cell::{HiddenState, RecurrentCell},
    obs_model::ObsPrediction,
    opt::{Optimizer, OptimizerConfig},
    state_model::StatePrediction,
};
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};
use log::{info, trace};
use mirage_core::{
    error::{ModelKind, WorldModelError},
    record::Record,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
/// Configuration of [`RecurrentModel`].
pub struct RecurrentModelConfig {
    /// Width of the projected input and of the hidden state.
    pub hidden_dim: usize,

    /// Optimizer.
    #[serde(default)]
    pub opt_config: OptimizerConfig,

    /// Maximum global L2 norm of the gradients.
    pub grad_clip_norm: f64,
}

impl Default for RecurrentModelConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 64,
            opt_config: OptimizerConfig::default(),
            grad_clip_norm: 10.0,
        }
    }
}

impl RecurrentModelConfig {
    /// Sets the hidden width.
    pub fn hidden_dim(mut self, v: usize) -> Self {
        self.hidden_dim = v;
        self
    }

    /// Sets optimizer configuration.
    pub fn opt_config(mut self, v: OptimizerConfig) -> Self {
        self.opt_config = v;
        self
    }

    /// Sets the learning rate.
    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.opt_config = self.opt_config.learning_rate(lr);
        self
    }

    /// Sets the gradient clipping norm.
    pub fn grad_clip_norm(mut self, v: f64) -> Self {
        self.grad_clip_norm = v;
        self
    }

    /// Constructs [`RecurrentModelConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`RecurrentModelConfig`] as YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

/// One-step recurrent predictor.
///
/// `x -> relu(fc1(x)) -> cell -> fc2(h)`. The model owns its [`VarMap`] and
/// optimizer, so each instance is trained independently.
pub struct RecurrentModel<C: RecurrentCell> {
    kind: ModelKind,
    device: Device,
    varmap: VarMap,
    in_dim: usize,
    out_dim: usize,
    fc1: Linear,
    cell: C,
    fc2: Linear,
    opt: Optimizer,
    grad_clip_norm: f64,
}

impl<C: RecurrentCell> RecurrentModel<C> {
    /// Constructs [`RecurrentModel`].
    pub fn build(
        kind: ModelKind,
        in_dim: usize,
        out_dim: usize,
        config: &RecurrentModelConfig,
        device: Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let (fc1, cell, fc2) = {
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let hidden_dim = config.hidden_dim;
            let fc1 = linear(in_dim, hidden_dim, vb.pp("fc1"))?;
            let cell = C::build(vb.pp("cell"), hidden_dim, hidden_dim)?;
            let fc2 = linear(hidden_dim, out_dim, vb.pp("fc2"))?;
            (fc1, cell, fc2)
        };
        let opt = config.opt_config.build(varmap.all_vars())?;

        Ok(Self {
            kind,
            device,
            varmap,
            in_dim,
            out_dim,
            fc1,
            cell,
            fc2,
            opt,
            grad_clip_norm: config.grad_clip_norm,
        })
    }

    /// Input width.
    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    /// Output width.
    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Which model this predictor implements.
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Device on which the parameters live.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Zero hidden state for `batch_size` sequences.
    pub fn init_hidden(&self, batch_size: usize) -> Result<HiddenState> {
        self.cell.zero_state(batch_size)
    }

    fn check_in_dim(&self, dim: usize) -> Result<()> {
        if dim != self.in_dim {
            return Err(
                WorldModelError::shape_mismatch(self.kind.to_string(), self.in_dim, dim).into(),
            );
        }
        Ok(())
    }

    /// Runs one step on `x` of shape `[batch_size, in_dim]`.
    ///
    /// Starts from a zero hidden state when `hidden` is `None`.
    pub fn forward(
        &self,
        x: &Tensor,
        hidden: Option<&HiddenState>,
    ) -> Result<(Tensor, HiddenState)> {
        let (batch_size, dim) = x.dims2()?;
        self.check_in_dim(dim)?;
        let hidden = match hidden {
            Some(hidden) => hidden.clone(),
            None => self.init_hidden(batch_size)?,
        };

        let xt = self.fc1.forward(x)?.relu()?;
        let hidden = self.cell.step(&xt, &hidden)?;
        let yt = self.fc2.forward(hidden.h())?;
        Ok((yt, hidden))
    }

    /// Runs the model over `xs` of shape `[batch_size, steps, in_dim]`.
    ///
    /// Returns the outputs, `[batch_size, steps, out_dim]`, and the final
    /// hidden state.
    pub fn forward_seq(
        &self,
        xs: &Tensor,
        hidden: Option<&HiddenState>,
    ) -> Result<(Tensor, HiddenState)> {
        let (batch_size, steps, dim) = xs.dims3()?;
        self.check_in_dim(dim)?;
        if steps == 0 {
            return Err(WorldModelError::InsufficientData(format!(
                "{} received a sequence of length 0",
                self.kind
            ))
            .into());
        }

        let mut hidden = match hidden {
            Some(hidden) => hidden.clone(),
            None => self.init_hidden(batch_size)?,
        };
        let mut ys = Vec::with_capacity(steps);
        for t in 0..steps {
            let xt = xs.narrow(1, t, 1)?.squeeze(1)?;
            let (yt, h) = self.forward(&xt, Some(&hidden))?;
            ys.push(yt);
            hidden = h;
        }

        Ok((Tensor::stack(&ys, 1)?, hidden))
    }

    /// Clips the gradients of `loss` by global norm, then takes an optimizer step.
    ///
    /// Returns the gradient norm before clipping.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<f32> {
        let mut grads = loss.backward()?;
        let norm = crate::util::clip_grad_norm(&self.varmap, &mut grads, self.grad_clip_norm)?;
        trace!("{} grad norm: {}", self.kind, norm);
        self.opt.step(&grads)?;
        Ok(norm)
    }

    /// Saves parameters in the safetensors format.
    pub fn save<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        self.varmap.save(&path)?;
        info!("Save {} to {:?}", self.kind, path.as_ref());
        Ok(())
    }

    /// Loads parameters saved with [`RecurrentModel::save`].
    pub fn load<T: AsRef<Path>>(&mut self, path: T) -> Result<()> {
        self.varmap.load(&path)?;
        info!("Load {} from {:?}", self.kind, path.as_ref());
        Ok(())
    }

    /// Mean and standard deviation of each parameter.
    pub fn param_stats(&self) -> Result<Record> {
        crate::util::param_stats(&self.varmap, &self.kind.to_string())
    }
}

/// One-step state-transition predictor driven by the rollout generator.
pub trait TransitionPredictor {
    /// Width of the modelled state.
    fn state_size(&self) -> usize;

    /// Width of the flattened one-hot joint action.
    fn action_size(&self) -> usize;

    /// Predicts the outcome of taking `action` in `state`.
    ///
    /// `state` is `[batch_size, state_size]` and `action` is
    /// `[batch_size, action_size]`.
    fn predict_step(
        &self,
        state: &Tensor,
        action: &Tensor,
        hidden: Option<&HiddenState>,
    ) -> Result<(StatePrediction, HiddenState)>;
}

/// One-step observation predictor driven by the rollout generator.
pub trait ObservationPredictor {
    /// Predicts per-agent observations and raw availabilities.
    ///
    /// `state` is `[batch_size, state_size]`, `last_action` is
    /// `[batch_size, action_size]` and `term_signal` is `[batch_size, 1]`.
    fn predict_step(
        &self,
        state: &Tensor,
        last_action: Option<&Tensor>,
        term_signal: &Tensor,
        hidden: Option<&HiddenState>,
    ) -> Result<(ObsPrediction, HiddenState)>;
}
