//! Core data model and collaborator interfaces.
mod env_info;
mod episode;
mod episode_buffer;
mod policy;
pub use env_info::EnvInfo;
pub use episode::{EpisodeBatch, EpisodeScheme};
pub use episode_buffer::EpisodeBufferBase;
pub use policy::PolicyController;
