//! Errors in the library.
use std::fmt;
use thiserror::Error;

/// Identifies which learned model an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// The state-transition model.
    StateModel,

    /// The observation model.
    ObsModel,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateModel => write!(f, "state_model"),
            Self::ObsModel => write!(f, "obs_model"),
        }
    }
}

/// Phase of the engine in which an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Gradient step on a training minibatch.
    Training,

    /// Forward pass on a test minibatch.
    Validation,

    /// Autoregressive generation of synthetic episodes.
    Rollout,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Training => write!(f, "training"),
            Self::Validation => write!(f, "validation"),
            Self::Rollout => write!(f, "rollout"),
        }
    }
}

/// Errors in the library.
///
/// Public operations return [`anyhow::Result`]; these variants can be recovered
/// with [`anyhow::Error::downcast_ref`].
#[derive(Error, Debug)]
pub enum WorldModelError {
    /// Not enough episodes to split, sample or train on.
    ///
    /// Callers are expected to defer training until more data is collected.
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// Feature width of an input does not match the configured size.
    #[error("Shape mismatch in {model}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// The model (or component) that rejected the input.
        model: String,
        /// Expected feature width or shape.
        expected: String,
        /// Actual feature width or shape.
        actual: String,
    },

    /// A non-finite loss was produced.
    #[error("Non-finite loss {loss} in {model} during {phase} at epoch {epoch}")]
    Divergence {
        /// Model being trained.
        model: ModelKind,
        /// Training or validation.
        phase: Phase,
        /// Zero-based epoch index.
        epoch: usize,
        /// The offending loss value.
        loss: f32,
    },

    /// A policy controller returned an action outside of `0..n_actions`.
    #[error("Invalid action {action} for agent {agent} at timestep {t} (n_actions = {n_actions})")]
    InvalidAction {
        /// Agent index.
        agent: usize,
        /// The returned action.
        action: i64,
        /// Number of actions of the environment.
        n_actions: usize,
        /// Timestep of the rollout.
        t: usize,
    },

    /// Record key error.
    #[error("Record key error: {0}")]
    RecordKeyError(String),

    /// Record value type error.
    #[error("Record value type error: {0}")]
    RecordValueTypeError(String),
}

impl WorldModelError {
    /// Shorthand for [`WorldModelError::ShapeMismatch`].
    pub fn shape_mismatch(
        model: impl Into<String>,
        expected: impl fmt::Debug,
        actual: impl fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            model: model.into(),
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}
