//! Policy controller.
use super::EpisodeBatch;
use anyhow::Result;
use ndarray::Array2;

/// A multi-agent policy that acts inside generated episodes.
///
/// The rollout generator calls [`init_hidden`](PolicyController::init_hidden)
/// once per generated batch and then
/// [`select_actions`](PolicyController::select_actions) once per timestep.
pub trait PolicyController {
    /// Resets recurrent policy state for a batch of `batch_size` episodes.
    fn init_hidden(&mut self, batch_size: usize);

    /// Selects joint actions for the episodes in `active` at timestep `t_ep`.
    ///
    /// `batch` holds all data written so far, including the state,
    /// observations and available actions of step `t_ep`. The returned
    /// array has shape `[active.len(), n_agents]`, row `i` being the joint
    /// action of episode `active[i]`. Actions must lie in `0..n_actions`.
    fn select_actions(
        &mut self,
        batch: &EpisodeBatch,
        t_ep: usize,
        t_env: usize,
        active: &[usize],
    ) -> Result<Array2<i64>>;
}
