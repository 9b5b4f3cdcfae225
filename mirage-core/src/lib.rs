#![warn(missing_docs)]
//! Core data model of a learned multi-agent world model.
//!
//! This crate holds what the learning backend and the surrounding
//! reinforcement-learning system share: padded multi-agent episodes
//! ([`EpisodeBatch`]), the interfaces of episode stores and policy
//! controllers, a FIFO replay buffer, train/test splitting, error types and
//! records for reporting training statistics.
pub mod error;
pub mod record;
pub mod replay_buffer;
pub mod split;

mod base;
pub use base::{EnvInfo, EpisodeBatch, EpisodeBufferBase, EpisodeScheme, PolicyController};
