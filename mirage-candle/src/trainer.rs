//! Supervised training of the state-transition and observation models.
mod base;
mod config;
pub use base::{
    obs_model_feature_errors, obs_model_io, sample_batch, shift_time, state_model_feature_errors,
    state_model_io, ObsModelIo, StateModelIo, Trainer,
};
pub use config::TrainerConfig;
