//! Recurrent cells.
//!
//! A cell is a single recurrent update `(input, hidden) -> hidden'`. The
//! recurrent predictors only depend on [`RecurrentCell`], so the gated cell
//! used by default ([`LstmCell`]) can be swapped for a lighter one
//! ([`GruCell`]) without touching the trainer or the rollout generator.
use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{
    gru, lstm,
    rnn::{GRUState, LSTMState},
    GRUConfig, LSTMConfig, VarBuilder, GRU, LSTM, RNN,
};

/// Memory carried between steps of a recurrent cell.
///
/// `h` is the short-term memory emitted at every step. `c` is the carry of
/// cells that keep one, such as [`LstmCell`].
#[derive(Debug, Clone)]
pub struct HiddenState {
    /// Short-term memory, `[batch_size, hidden_dim]`.
    pub h: Tensor,

    /// Carry, `[batch_size, hidden_dim]`.
    pub c: Option<Tensor>,
}

impl HiddenState {
    /// Hidden state without a carry.
    pub fn new(h: Tensor) -> Self {
        Self { h, c: None }
    }

    /// Hidden state with a carry.
    pub fn with_carry(h: Tensor, c: Tensor) -> Self {
        Self { h, c: Some(c) }
    }

    /// Short-term memory.
    pub fn h(&self) -> &Tensor {
        &self.h
    }

    /// Batch size.
    pub fn batch_size(&self) -> usize {
        self.h.dims().first().copied().unwrap_or(0)
    }

    /// Returns a copy detached from the computation graph.
    pub fn detach(&self) -> Self {
        Self {
            h: self.h.detach(),
            c: self.c.as_ref().map(|c| c.detach()),
        }
    }
}

/// A recurrent update whose parameters live in a [`VarBuilder`].
pub trait RecurrentCell: Sized {
    /// Builds the cell under the prefix of `vb`.
    fn build(vb: VarBuilder, in_dim: usize, hidden_dim: usize) -> Result<Self>;

    /// Width of the hidden state.
    fn hidden_dim(&self) -> usize;

    /// Zero hidden state for `batch_size` sequences.
    fn zero_state(&self, batch_size: usize) -> Result<HiddenState>;

    /// Advances the hidden state by one step.
    ///
    /// `input` is `[batch_size, in_dim]`.
    fn step(&self, input: &Tensor, hidden: &HiddenState) -> Result<HiddenState>;
}

/// Long short-term memory cell.
pub struct LstmCell {
    lstm: LSTM,
    hidden_dim: usize,
}

impl RecurrentCell for LstmCell {
    fn build(vb: VarBuilder, in_dim: usize, hidden_dim: usize) -> Result<Self> {
        let lstm = lstm(in_dim, hidden_dim, LSTMConfig::default(), vb)?;
        Ok(Self { lstm, hidden_dim })
    }

    fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    fn zero_state(&self, batch_size: usize) -> Result<HiddenState> {
        let state = self.lstm.zero_state(batch_size)?;
        Ok(HiddenState::with_carry(state.h, state.c))
    }

    fn step(&self, input: &Tensor, hidden: &HiddenState) -> Result<HiddenState> {
        // A hidden state without a carry starts from a zero carry.
        let c = match &hidden.c {
            Some(c) => c.clone(),
            None => hidden.h.zeros_like()?,
        };
        let state = LSTMState {
            h: hidden.h.clone(),
            c,
        };
        let state = self.lstm.step(input, &state)?;
        Ok(HiddenState::with_carry(state.h, state.c))
    }
}

/// Gated recurrent unit.
pub struct GruCell {
    gru: GRU,
    hidden_dim: usize,
}

impl RecurrentCell for GruCell {
    fn build(vb: VarBuilder, in_dim: usize, hidden_dim: usize) -> Result<Self> {
        let gru = gru(in_dim, hidden_dim, GRUConfig::default(), vb)?;
        Ok(Self { gru, hidden_dim })
    }

    fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    fn zero_state(&self, batch_size: usize) -> Result<HiddenState> {
        let state = self.gru.zero_state(batch_size)?;
        Ok(HiddenState::new(state.h))
    }

    fn step(&self, input: &Tensor, hidden: &HiddenState) -> Result<HiddenState> {
        let state = GRUState {
            h: hidden.h.clone(),
        };
        let state = self.gru.step(input, &state)?;
        Ok(HiddenState::new(state.h))
    }
}
