//! Training loops of the state-transition and observation models.
use super::TrainerConfig;
use crate::{
    cell::RecurrentCell, model::TransitionPredictor, obs_model::ObservationModel,
    preprocess::TrainingEpisodeVars, state_model::StateTransitionModel,
};
use anyhow::{Context, Result};
use candle_core::{Tensor, D};
use candle_nn::loss::mse;
use chrono::Local;
use log::info;
use mirage_core::{
    error::{ModelKind, Phase, WorldModelError},
    record::{LossStats, Record, RecordValue, Recorder},
    split::sample_indices,
};
use rand::Rng;
use std::time::Instant;

/// Samples a minibatch of episodes without replacement and concatenates them.
///
/// With `use_mask`, every tensor is truncated along the time axis to the
/// largest number of live steps in the minibatch.
pub fn sample_batch<R: Rng + ?Sized>(
    episodes: &[TrainingEpisodeVars],
    batch_size: usize,
    use_mask: bool,
    rng: &mut R,
) -> Result<TrainingEpisodeVars> {
    let available = (0..episodes.len()).collect::<Vec<_>>();
    let ixs = sample_indices(&available, batch_size, rng)?;
    let batch = TrainingEpisodeVars::cat(&ixs.iter().map(|&i| &episodes[i]).collect::<Vec<_>>())?;
    match use_mask {
        true => batch.truncate(batch.live_steps()?),
        false => Ok(batch),
    }
}

/// Inputs and target of the state-transition model.
pub struct StateModelIo {
    /// `state[t]`, `[B, T - 1, state_size]`.
    pub state: Tensor,

    /// `action[t]`, `[B, T - 1, action_size]`.
    pub action: Tensor,

    /// `state[t + 1] ++ reward[t] ++ term_signal[t]`, `[B, T - 1, state_size + 2]`.
    pub target: Tensor,
}

/// Builds the inputs and targets of the state-transition model from recorded steps.
///
/// The reward and termination signal stored at `t` are the outcome of the
/// action taken at `t`, so they pair with the state at `t + 1`.
pub fn state_model_io(vars: &TrainingEpisodeVars) -> Result<StateModelIo> {
    let steps = vars.n_steps();
    if steps < 2 {
        return Err(WorldModelError::InsufficientData(format!(
            "state model needs at least 2 steps, got {}",
            steps
        ))
        .into());
    }
    let n = steps - 1;
    let target = Tensor::cat(
        &[
            &vars.state.narrow(1, 1, n)?,
            &vars.reward.narrow(1, 0, n)?,
            &vars.term_signal.narrow(1, 0, n)?,
        ],
        D::Minus1,
    )?;

    Ok(StateModelIo {
        state: vars.state.narrow(1, 0, n)?,
        action: vars.action.narrow(1, 0, n)?,
        target,
    })
}

/// Shifts `t` of shape `[B, T, K]` by `n` steps along time, filling with zeros.
pub fn shift_time(t: &Tensor, n: usize) -> Result<Tensor> {
    let (b, steps, k) = t.dims3()?;
    let n = n.min(steps);
    if n == 0 {
        return Ok(t.clone());
    }
    let pad = Tensor::zeros((b, n, k), t.dtype(), t.device())?;
    if n == steps {
        return Ok(pad);
    }
    Ok(Tensor::cat(&[&pad, &t.narrow(1, 0, steps - n)?], 1)?)
}

/// Inputs and target of the observation model.
pub struct ObsModelIo {
    /// Real initial state followed by states predicted from the real actions.
    pub state: Tensor,

    /// Joint action of the previous step, zero at the first step.
    pub last_action: Tensor,

    /// Termination signal.
    pub term_signal: Tensor,

    /// `obs ++ avail_actions`.
    pub target: Tensor,
}

/// Builds the inputs and targets of the observation model.
///
/// The input states are not the recorded ones: the state-transition model
/// is run on the recorded actions and its predicted next states, preceded
/// by the real initial state, are used instead. The observation model thus
/// learns on the states it receives during rollouts. No gradient flows back
/// into the state-transition model.
pub fn obs_model_io<C: RecurrentCell>(
    state_model: &StateTransitionModel<C>,
    vars: &TrainingEpisodeVars,
) -> Result<ObsModelIo> {
    let steps = vars.n_steps();
    let s0 = vars.state.narrow(1, 0, 1)?;
    let state = match steps {
        1 => s0,
        _ => {
            let (y, _) = state_model.predict_sequence(
                &vars.state.narrow(1, 0, steps - 1)?,
                &vars.action.narrow(1, 0, steps - 1)?,
                None,
            )?;
            let m_state = y.narrow(D::Minus1, 0, state_model.state_size())?.detach();
            Tensor::cat(&[&s0, &m_state], 1)?
        }
    };

    Ok(ObsModelIo {
        state,
        last_action: shift_time(&vars.action, 1)?,
        term_signal: vars.term_signal.clone(),
        target: Tensor::cat(&[&vars.obs, &vars.avail_actions], D::Minus1)?,
    })
}

// Mean squared error of every output column named in `scheme`, averaged
// over episodes and steps. Entries beyond the output width are skipped.
fn scheme_errors(
    y: &Tensor,
    target: &Tensor,
    scheme: &[(String, usize)],
) -> Result<Vec<(String, f32)>> {
    let err: Vec<f32> = (y.detach() - target)?.sqr()?.mean((0, 1))?.to_vec1()?;
    Ok(scheme
        .iter()
        .filter(|(_, ix)| *ix < err.len())
        .map(|(name, ix)| (name.clone(), err[*ix]))
        .collect())
}

// Raw outputs of the observation model on the inputs built by `obs_model_io`.
fn obs_model_forward<C1: RecurrentCell, C2: RecurrentCell>(
    model: &ObservationModel<C2>,
    state_model: &StateTransitionModel<C1>,
    vars: &TrainingEpisodeVars,
) -> Result<(Tensor, ObsModelIo)> {
    let io = obs_model_io(state_model, vars)?;
    let (y, _) = model.predict_sequence(&io.state, &io.last_action, &io.term_signal, None)?;
    Ok((y, io))
}

/// Per-feature mean squared error of the state-transition model on a test minibatch.
///
/// `scheme` maps feature names to indices of the model output; entries
/// beyond the output width are skipped.
pub fn state_model_feature_errors<C, R>(
    model: &StateTransitionModel<C>,
    episodes: &[TrainingEpisodeVars],
    scheme: &[(String, usize)],
    batch_size: usize,
    rng: &mut R,
) -> Result<Vec<(String, f32)>>
where
    C: RecurrentCell,
    R: Rng + ?Sized,
{
    let batch = sample_batch(episodes, batch_size, false, rng)?;
    let io = state_model_io(&batch)?;
    let (y, _) = model.predict_sequence(&io.state, &io.action, None)?;
    scheme_errors(&y, &io.target, scheme)
}

/// Per-feature mean squared error of the observation model on a test minibatch.
///
/// Inputs are built with [`obs_model_io`], so the errors include those of
/// the states predicted by `state_model`. `scheme` indexes the output
/// `obs ++ avail_actions`, as returned by
/// [`EnvInfo::obs_feature_scheme`](mirage_core::EnvInfo::obs_feature_scheme).
pub fn obs_model_feature_errors<C1, C2, R>(
    model: &ObservationModel<C2>,
    state_model: &StateTransitionModel<C1>,
    episodes: &[TrainingEpisodeVars],
    scheme: &[(String, usize)],
    batch_size: usize,
    use_mask: bool,
    rng: &mut R,
) -> Result<Vec<(String, f32)>>
where
    C1: RecurrentCell,
    C2: RecurrentCell,
    R: Rng + ?Sized,
{
    let batch = sample_batch(episodes, batch_size, use_mask, rng)?;
    let (y, io) = obs_model_forward(model, state_model, &batch)?;
    scheme_errors(&y, &io.target, scheme)
}

/// Trains a model for a fixed number of epochs.
///
/// Every epoch takes one gradient step on a training minibatch, then
/// evaluates the loss on a minibatch of held-out episodes. Every
/// `log_epochs` epochs the mean and standard deviation of both losses are
/// logged and written to a [`Recorder`] with the keys
/// `<model>_train_loss_mean`, `<model>_train_loss_std`,
/// `<model>_val_loss_mean`, `<model>_val_loss_std`, `<model>_epoch` and
/// `<model>_epoch_time`, then the accumulated losses are cleared.
///
/// A non-finite loss aborts training with
/// [`WorldModelError::Divergence`] before any parameter is updated.
pub struct Trainer {
    config: TrainerConfig,
    record_verbose_level: usize,
}

impl Trainer {
    /// Constructs [`Trainer`].
    pub fn new(config: TrainerConfig) -> Self {
        Self {
            config,
            record_verbose_level: 0,
        }
    }

    /// Sets the verbosity of records. With 2 or more, parameter statistics
    /// are written after the last epoch.
    pub fn record_verbose_level(mut self, v: usize) -> Self {
        self.record_verbose_level = v;
        self
    }

    /// Configuration.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    fn check_finite(model: ModelKind, phase: Phase, epoch: usize, loss: f32) -> Result<()> {
        if !loss.is_finite() {
            return Err(WorldModelError::Divergence {
                model,
                phase,
                epoch,
                loss,
            }
            .into());
        }
        Ok(())
    }

    fn context(kind: ModelKind, phase: Phase, epoch: usize) -> String {
        format!("{} of {} at epoch {}", phase, kind, epoch)
    }

    fn is_report_epoch(&self, epoch: usize) -> bool {
        (epoch + 1) % self.config.log_epochs.max(1) == 0
    }

    fn report(
        model: ModelKind,
        epoch: usize,
        train_loss: &mut LossStats,
        val_loss: &mut LossStats,
        epoch_time: f32,
        recorder: &mut dyn Recorder,
    ) {
        info!(
            "epoch: {:<3}  train: mean {:.5}, std {:.5}  val: mean {:.5}, std {:.5}  {:.2} s",
            epoch + 1,
            train_loss.mean(),
            train_loss.std(),
            val_loss.mean(),
            val_loss.std(),
            epoch_time
        );

        let mut record = Record::from_slice(&[
            (format!("{}_epoch", model), RecordValue::Scalar((epoch + 1) as f32)),
            (format!("{}_epoch_time", model), RecordValue::Scalar(epoch_time)),
            ("datetime".to_string(), RecordValue::DateTime(Local::now())),
        ]);
        record.merge_inplace(train_loss.report(&format!("{}_train_loss", model)));
        record.merge_inplace(val_loss.report(&format!("{}_val_loss", model)));
        recorder.write(record);
    }

    /// Trains the state-transition model.
    ///
    /// Minibatches are never truncated: the termination signal is learned
    /// from the padded steps that follow termination.
    pub fn train_state_model<C, R>(
        &self,
        model: &mut StateTransitionModel<C>,
        train: &[TrainingEpisodeVars],
        test: &[TrainingEpisodeVars],
        rng: &mut R,
        recorder: &mut dyn Recorder,
    ) -> Result<()>
    where
        C: RecurrentCell,
        R: Rng + ?Sized,
    {
        info!("State Model Training ...");
        let kind = ModelKind::StateModel;
        let batch_size = self.config.batch_size;
        let mut train_loss = LossStats::default();
        let mut val_loss = LossStats::default();

        for epoch in 0..self.config.epochs {
            let t_start = Instant::now();

            let batch = sample_batch(train, batch_size, false, rng)?;
            let io = state_model_io(&batch)?;
            let (y, _) = model
                .predict_sequence(&io.state, &io.action, None)
                .with_context(|| Self::context(kind, Phase::Training, epoch))?;
            let loss = mse(&y, &io.target)?;
            let v = loss.to_scalar::<f32>()?;
            Self::check_finite(kind, Phase::Training, epoch, v)?;
            model.backward_step(&loss)?;
            train_loss.push(v);

            let batch = sample_batch(test, batch_size, false, rng)?;
            let io = state_model_io(&batch)?;
            let (y, _) = model
                .predict_sequence(&io.state, &io.action, None)
                .with_context(|| Self::context(kind, Phase::Validation, epoch))?;
            let v = mse(&y.detach(), &io.target)?.to_scalar::<f32>()?;
            Self::check_finite(kind, Phase::Validation, epoch, v)?;
            val_loss.push(v);

            if self.is_report_epoch(epoch) {
                let epoch_time = t_start.elapsed().as_secs_f32();
                Self::report(
                    kind,
                    epoch,
                    &mut train_loss,
                    &mut val_loss,
                    epoch_time,
                    recorder,
                );
            }
        }

        if self.record_verbose_level >= 2 {
            recorder.write(model.param_stats()?);
        }
        Ok(())
    }

    /// Trains the observation model on states generated by `state_model`.
    pub fn train_obs_model<C1, C2, R>(
        &self,
        model: &mut ObservationModel<C2>,
        state_model: &StateTransitionModel<C1>,
        use_mask: bool,
        train: &[TrainingEpisodeVars],
        test: &[TrainingEpisodeVars],
        rng: &mut R,
        recorder: &mut dyn Recorder,
    ) -> Result<()>
    where
        C1: RecurrentCell,
        C2: RecurrentCell,
        R: Rng + ?Sized,
    {
        info!("Observation Model Training ...");
        let kind = ModelKind::ObsModel;
        let batch_size = self.config.batch_size;
        let mut train_loss = LossStats::default();
        let mut val_loss = LossStats::default();

        for epoch in 0..self.config.epochs {
            let t_start = Instant::now();

            let batch = sample_batch(train, batch_size, use_mask, rng)?;
            let (y, io) = obs_model_forward(model, state_model, &batch)
                .with_context(|| Self::context(kind, Phase::Training, epoch))?;
            let loss = mse(&y, &io.target)?;
            let v = loss.to_scalar::<f32>()?;
            Self::check_finite(kind, Phase::Training, epoch, v)?;
            model.backward_step(&loss)?;
            train_loss.push(v);

            let batch = sample_batch(test, batch_size, use_mask, rng)?;
            let (y, io) = obs_model_forward(model, state_model, &batch)
                .with_context(|| Self::context(kind, Phase::Validation, epoch))?;
            let v = mse(&y.detach(), &io.target)?.to_scalar::<f32>()?;
            Self::check_finite(kind, Phase::Validation, epoch, v)?;
            val_loss.push(v);

            if self.is_report_epoch(epoch) {
                let epoch_time = t_start.elapsed().as_secs_f32();
                Self::report(
                    kind,
                    epoch,
                    &mut train_loss,
                    &mut val_loss,
                    epoch_time,
                    recorder,
                );
            }
        }

        if self.record_verbose_level >= 2 {
            recorder.write(model.param_stats()?);
        }
        Ok(())
    }
}
