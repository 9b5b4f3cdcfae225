//! World-model engine for multi-agent environments implemented with
//! [candle](https://crates.io/crates/candle-core).
//!
//! A [`WorldModel`] learns two recurrent predictors from episodes stored in
//! a replay buffer: a [`StateTransitionModel`] mapping a global state and a
//! joint action to the next state, reward and termination signal, and an
//! [`ObservationModel`] mapping a state to per-agent observations and
//! action availabilities. Once trained, the [`RolloutGenerator`] alternates
//! both models with an external policy controller to synthesize episodes
//! without calling the real environment.
pub mod cell;
pub mod generator;
pub mod model;
pub mod obs_model;
pub mod opt;
pub mod preprocess;
pub mod state_model;
pub mod trainer;
pub mod util;
pub mod world_model;
pub use cell::{GruCell, HiddenState, LstmCell, RecurrentCell};
pub use generator::{GeneratorConfig, RolloutGenerator};
pub use model::{ObservationPredictor, RecurrentModel, RecurrentModelConfig, TransitionPredictor};
pub use obs_model::{ObsPrediction, ObservationModel};
pub use preprocess::{EpisodePreprocessor, TrainingEpisodeVars};
pub use state_model::{StatePrediction, StateTransitionModel};
pub use trainer::{Trainer, TrainerConfig};
pub use world_model::{WorldModel, WorldModelConfig};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
/// Device for using candle.
///
/// This enum is added because [`candle_core::Device`] does not support serialization.
pub enum Device {
    /// The main CPU device.
    #[default]
    Cpu,

    /// The GPU device with the given ordinal.
    Cuda(usize),
}

impl TryFrom<Device> for candle_core::Device {
    type Error = candle_core::Error;

    fn try_from(device: Device) -> Result<Self, Self::Error> {
        match device {
            Device::Cpu => Ok(candle_core::Device::Cpu),
            Device::Cuda(n) => candle_core::Device::new_cuda(n),
        }
    }
}
