//! World model.
use super::WorldModelConfig;
use crate::{
    cell::{LstmCell, RecurrentCell},
    generator::RolloutGenerator,
    obs_model::ObservationModel,
    preprocess::{EpisodePreprocessor, TrainingEpisodeVars},
    state_model::StateTransitionModel,
    trainer::{obs_model_feature_errors, state_model_feature_errors, Trainer},
};
use anyhow::Result;
use candle_core::Device;
use log::{debug, info, log_enabled, Level};
use mirage_core::{
    record::{Record, RecordValue, Recorder},
    split::train_test_split,
    EnvInfo, EpisodeBatch, EpisodeBufferBase, PolicyController,
};
use rand::Rng;
use std::{fs, path::Path};

const STATE_MODEL_FILE: &str = "state_model.safetensors";
const OBS_MODEL_FILE: &str = "obs_model.safetensors";

#[cfg_attr(doc, aquamarine::aquamarine)]
/// Learned model of a multi-agent environment.
///
/// [`WorldModel::train`] fits both models on the episodes of a buffer and
/// [`WorldModel::generate_batch`] uses them to synthesize new episodes.
///
/// ```mermaid
/// flowchart LR
///   Buffer --> Preprocessor[EpisodePreprocessor]
///   Preprocessor --> StateModel[StateTransitionModel]
///   Preprocessor --> ObsModel[ObservationModel]
///   StateModel -- predicted states --> ObsModel
///   StateModel --> Generator[RolloutGenerator]
///   ObsModel --> Generator
///   Policy[PolicyController] --> Generator
///   Generator --> Batch[EpisodeBatch]
/// ```
pub struct WorldModel<C: RecurrentCell = LstmCell> {
    env_info: EnvInfo,
    config: WorldModelConfig,
    preprocessor: EpisodePreprocessor,
    state_model: StateTransitionModel<C>,
    obs_model: ObservationModel<C>,
    state_trainer: Trainer,
    obs_trainer: Trainer,
    training_iterations: usize,
    device: Device,
}

impl<C: RecurrentCell> WorldModel<C> {
    /// Constructs [`WorldModel`] with freshly initialized models.
    pub fn build(env_info: EnvInfo, config: WorldModelConfig) -> Result<Self> {
        let device: Device = config.device.unwrap_or_default().try_into()?;
        let state_model = StateTransitionModel::build(
            env_info.state_size(),
            env_info.action_size(),
            &config.state_model_config,
            device.clone(),
        )?;
        let obs_model = ObservationModel::build(
            &env_info,
            config.obs_model_include_last_action,
            &config.obs_model_config,
            device.clone(),
        )?;
        let state_trainer = Trainer::new(config.state_trainer_config.clone())
            .record_verbose_level(config.record_verbose_level);
        let obs_trainer = Trainer::new(config.obs_trainer_config.clone())
            .record_verbose_level(config.record_verbose_level);

        Ok(Self {
            preprocessor: EpisodePreprocessor::new(&env_info, device.clone()),
            env_info,
            config,
            state_model,
            obs_model,
            state_trainer,
            obs_trainer,
            training_iterations: 0,
            device,
        })
    }

    fn preprocess<B: EpisodeBufferBase + ?Sized>(
        &self,
        buffer: &B,
        ixs: &[usize],
    ) -> Result<Vec<TrainingEpisodeVars>> {
        ixs.iter()
            .map(|&ix| self.preprocessor.process(&buffer.episode(ix)?))
            .collect()
    }

    fn feature_errors<R: Rng + ?Sized>(
        &self,
        test: &[TrainingEpisodeVars],
        rng: &mut R,
    ) -> Result<(Vec<(String, f32)>, Vec<(String, f32)>)> {
        let state_size = self.env_info.state_size();
        let mut state_scheme = self.env_info.state_feature_scheme(false, false);
        state_scheme.push(("reward".to_string(), state_size));
        state_scheme.push(("term_signal".to_string(), state_size + 1));
        let state_errors = state_model_feature_errors(
            &self.state_model,
            test,
            &state_scheme,
            self.config.state_trainer_config.batch_size,
            rng,
        )?;

        let obs_errors = obs_model_feature_errors(
            &self.obs_model,
            &self.state_model,
            test,
            &self.env_info.obs_feature_scheme(),
            self.config.obs_trainer_config.batch_size,
            self.config.obs_model_use_mask,
            rng,
        )?;
        Ok((state_errors, obs_errors))
    }

    // Per-feature validation errors, logged at debug level and recorded in scheme order.
    fn report_feature_errors<R: Rng + ?Sized>(
        &self,
        test: &[TrainingEpisodeVars],
        rng: &mut R,
        recorder: &mut dyn Recorder,
    ) -> Result<()> {
        let write_record = self.config.record_verbose_level >= 1;
        if !write_record && !log_enabled!(Level::Debug) {
            return Ok(());
        }

        let (state_errors, obs_errors) = self.feature_errors(test, rng)?;
        for (name, err) in state_errors.iter() {
            debug!("state model validation error of {}: {:.5}", name, err);
        }
        for (name, err) in obs_errors.iter() {
            debug!("obs model validation error of {}: {:.5}", name, err);
        }

        if write_record {
            let values = |errors: &[(String, f32)]| {
                RecordValue::Array1(errors.iter().map(|(_, e)| *e).collect())
            };
            recorder.write(Record::from_slice(&[
                ("state_model_feature_errors", values(&state_errors)),
                ("obs_model_feature_errors", values(&obs_errors)),
            ]));
        }
        Ok(())
    }

    /// Trains the state-transition model, then the observation model.
    ///
    /// The episodes in `buffer` are split into training and test episodes
    /// with [`WorldModelConfig::test_ratio`]. Loss statistics are written to
    /// `recorder`. With `record_verbose_level >= 1` a last record holds the
    /// per-feature validation errors of both models. Fails with
    /// [`InsufficientData`](mirage_core::error::WorldModelError::InsufficientData)
    /// if the buffer holds fewer than two episodes.
    pub fn train<B, R>(
        &mut self,
        buffer: &B,
        rng: &mut R,
        recorder: &mut dyn Recorder,
    ) -> Result<()>
    where
        B: EpisodeBufferBase + ?Sized,
        R: Rng,
    {
        let n = buffer.episodes_in_buffer();
        info!("Training with {} episodes", n);
        let split = train_test_split(n, self.config.test_ratio, rng)?;
        let train = self.preprocess(buffer, &split.train)?;
        let test = self.preprocess(buffer, &split.test)?;

        self.state_trainer
            .train_state_model(&mut self.state_model, &train, &test, rng, recorder)?;
        self.obs_trainer.train_obs_model(
            &mut self.obs_model,
            &self.state_model,
            self.config.obs_model_use_mask,
            &train,
            &test,
            rng,
            recorder,
        )?;
        self.report_feature_errors(&test, rng, recorder)?;

        self.training_iterations += 1;
        Ok(())
    }

    /// Generates a batch of synthetic episodes with `policy`.
    ///
    /// Initial states are sampled from `buffer`. See [`RolloutGenerator`].
    pub fn generate_batch<B, P, R>(
        &self,
        buffer: &B,
        policy: &mut P,
        t_env: usize,
        rng: &mut R,
    ) -> Result<EpisodeBatch>
    where
        B: EpisodeBufferBase + ?Sized,
        P: PolicyController + ?Sized,
        R: Rng,
    {
        let generator = RolloutGenerator::new(
            &self.state_model,
            &self.obs_model,
            &self.env_info,
            &self.config.generator_config,
            self.device.clone(),
        );
        generator.generate(buffer, policy, t_env, rng)
    }

    /// Number of completed calls of [`WorldModel::train`].
    pub fn training_iterations(&self) -> usize {
        self.training_iterations
    }

    /// Environment metadata.
    pub fn env_info(&self) -> &EnvInfo {
        &self.env_info
    }

    /// Configuration.
    pub fn config(&self) -> &WorldModelConfig {
        &self.config
    }

    /// State-transition model.
    pub fn state_model(&self) -> &StateTransitionModel<C> {
        &self.state_model
    }

    /// Observation model.
    pub fn obs_model(&self) -> &ObservationModel<C> {
        &self.obs_model
    }

    /// Saves the parameters of both models in directory `path`.
    pub fn save_params<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        fs::create_dir_all(&path)?;
        self.state_model.save(path.as_ref().join(STATE_MODEL_FILE))?;
        self.obs_model.save(path.as_ref().join(OBS_MODEL_FILE))?;
        info!("Save world model parameters into {:?}", path.as_ref());
        Ok(())
    }

    /// Loads the parameters of both models from directory `path`.
    pub fn load_params<T: AsRef<Path>>(&mut self, path: T) -> Result<()> {
        self.state_model.load(path.as_ref().join(STATE_MODEL_FILE))?;
        self.obs_model.load(path.as_ref().join(OBS_MODEL_FILE))?;
        info!("Load world model parameters from {:?}", path.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GeneratorConfig, RecurrentModelConfig, TrainerConfig};
    use candle_core::Tensor;
    use mirage_core::{
        error::WorldModelError,
        record::{BufferedRecorder, NullRecorder},
        replay_buffer::{EpisodeReplayBuffer, EpisodeReplayBufferConfig},
    };
    use ndarray::{Array1, Array2};
    use rand::{rngs::SmallRng, SeedableRng};
    use tempdir::TempDir;

    fn env_info() -> EnvInfo {
        EnvInfo::new(2, 3, 2, 4, 5)
    }

    fn config() -> WorldModelConfig {
        let model = RecurrentModelConfig::default().hidden_dim(8);
        let trainer = TrainerConfig::default().batch_size(4).epochs(2).log_epochs(1);
        WorldModelConfig::default()
            .state_model_config(model.clone())
            .obs_model_config(model)
            .state_trainer_config(trainer.clone())
            .obs_trainer_config(trainer)
            .test_ratio(0.25)
            .generator_config(GeneratorConfig::default().batch_size(3))
    }

    // Episodes of a deterministic counter that terminate after `len` steps.
    fn buffer(n: usize) -> Result<EpisodeReplayBuffer> {
        let info = env_info();
        let config = EpisodeReplayBufferConfig::default();
        let mut buffer = EpisodeReplayBuffer::build(&config, info.scheme(), info.max_seq_length());
        for i in 0..n {
            let mut batch = EpisodeBatch::new(info.scheme(), 1, info.max_seq_length());
            let len = 2 + i % 3;
            for t in 0..len {
                let v = t as f32 / len as f32;
                let state = Array1::from_elem(4, v);
                let obs = Array2::from_elem((2, 2), v);
                let avail = Array2::ones((2, 3));
                batch.set_pre_transition(0, t, state.view(), obs.view(), avail.view())?;
                batch.set_actions(0, t, Array1::from(vec![(t % 3) as i64, 1]).view())?;
                batch.set_post_transition(0, t, v, t + 1 == len)?;
            }
            buffer.insert_episode_batch(&batch)?;
        }
        Ok(buffer)
    }

    struct FirstActionPolicy;

    impl PolicyController for FirstActionPolicy {
        fn init_hidden(&mut self, _batch_size: usize) {}

        fn select_actions(
            &mut self,
            batch: &EpisodeBatch,
            _t_ep: usize,
            _t_env: usize,
            active: &[usize],
        ) -> Result<Array2<i64>> {
            Ok(Array2::from_elem((active.len(), batch.scheme().n_agents), 1))
        }
    }

    #[test]
    fn test_train_writes_reports_for_both_models() -> Result<()> {
        let mut model = WorldModel::<LstmCell>::build(env_info(), config())?;
        let buffer = buffer(8)?;
        let mut rng = SmallRng::seed_from_u64(42);
        let mut recorder = BufferedRecorder::new();

        model.train(&buffer, &mut rng, &mut recorder)?;
        assert_eq!(model.training_iterations(), 1);
        let records = recorder.drain();
        assert_eq!(records.len(), 4);
        assert!(records[0].get_scalar("state_model_train_loss_mean").is_ok());
        assert!(records[3].get_scalar("obs_model_val_loss_mean").is_ok());

        let batch = model.generate_batch(&buffer, &mut FirstActionPolicy, 0, &mut rng)?;
        assert_eq!(batch.batch_size(), 3);
        assert_eq!(batch.filled.column(0).sum(), 3.0);
        Ok(())
    }

    #[test]
    fn test_train_records_feature_errors() -> Result<()> {
        let config = config().record_verbose_level(1);
        let mut model = WorldModel::<LstmCell>::build(env_info(), config)?;
        let buffer = buffer(8)?;
        let mut rng = SmallRng::seed_from_u64(7);
        let mut recorder = BufferedRecorder::new();

        model.train(&buffer, &mut rng, &mut recorder)?;
        let records = recorder.drain();
        assert_eq!(records.len(), 5);
        let state_errors = records[4].get_array1("state_model_feature_errors")?;
        let obs_errors = records[4].get_array1("obs_model_feature_errors")?;
        assert!(state_errors.len() >= 2);
        assert_eq!(obs_errors.len(), env_info().obs_feature_scheme().len());
        assert!(state_errors.iter().chain(obs_errors.iter()).all(|e| e.is_finite() && *e >= 0.0));
        Ok(())
    }

    #[test]
    fn test_train_needs_two_episodes() -> Result<()> {
        let mut model = WorldModel::<LstmCell>::build(env_info(), config())?;
        let buffer = buffer(1)?;
        let mut rng = SmallRng::seed_from_u64(0);
        let err = model.train(&buffer, &mut rng, &mut NullRecorder::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorldModelError>(),
            Some(WorldModelError::InsufficientData(_))
        ));
        assert_eq!(model.training_iterations(), 0);
        Ok(())
    }

    #[test]
    fn test_save_load_params() -> Result<()> {
        let info = env_info();
        let model1 = WorldModel::<LstmCell>::build(info.clone(), config())?;
        let mut model2 = WorldModel::<LstmCell>::build(info, config())?;
        let dir = TempDir::new("world_model")?;
        model1.save_params(dir.path())?;
        model2.load_params(dir.path())?;

        let dev = &Device::Cpu;
        let state = Tensor::ones((1, 3, 4), candle_core::DType::F32, dev)?;
        let action = Tensor::zeros((1, 3, 6), candle_core::DType::F32, dev)?;
        let (y1, _) = model1.state_model().predict_sequence(&state, &action, None)?;
        let (y2, _) = model2.state_model().predict_sequence(&state, &action, None)?;
        let diff = (y1 - y2)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
