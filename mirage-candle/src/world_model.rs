//! World model combining preprocessing, training and rollout generation.
mod base;
mod config;
pub use base::WorldModel;
pub use config::WorldModelConfig;
