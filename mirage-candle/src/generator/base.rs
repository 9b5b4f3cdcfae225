//! Rollout generator.
use super::GeneratorConfig;
use crate::{
    cell::HiddenState,
    model::{ObservationPredictor, TransitionPredictor},
    util::{array_to_tensor, tensor_to_array2},
};
use anyhow::{Context, Result};
use candle_core::Device;
use log::{debug, trace};
use mirage_core::{
    error::{ModelKind, Phase, WorldModelError},
    EnvInfo, EpisodeBatch, EpisodeBufferBase, PolicyController,
};
use ndarray::{concatenate, s, Array2, Axis};
use rand::Rng;

/// Status of a generated episode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpisodeStatus {
    /// The episode receives further transitions.
    Active,

    /// The episode ended; no further step is written.
    Terminated,
}

/// Binarizes raw availabilities of shape `[batch_size, n_agents * n_actions]`.
///
/// Values strictly greater than `threshold` become 1, others 0. The
/// `fallback_action` of every agent is then set to 1, so no agent is left
/// without an available action.
pub fn binarize_availability(
    raw: &Array2<f32>,
    n_actions: usize,
    threshold: f32,
    fallback_action: usize,
) -> Array2<f32> {
    let mut avail = raw.mapv(|v| if v > threshold { 1.0 } else { 0.0 });
    if n_actions == 0 {
        return avail;
    }
    for mut row in avail.rows_mut() {
        for agent in 0..row.len() / n_actions {
            if let Some(v) = row.get_mut(agent * n_actions + fallback_action) {
                *v = 1.0;
            }
        }
    }
    avail
}

fn rollout_context(kind: ModelKind, t: usize) -> String {
    format!("{} of {} at timestep {}", Phase::Rollout, kind, t)
}

/// Returns `true` if a raw termination signal ends the episode.
pub fn is_terminal(term_signal: f32, threshold: f32) -> bool {
    term_signal > threshold
}

#[cfg_attr(doc, aquamarine::aquamarine)]
/// Synthesizes a batch of episodes with the learned models and a policy.
///
/// Initial states are taken from episodes sampled from a buffer. Every
/// timestep `t` then proceeds as follows for the episodes that are still
/// active:
///
/// 1. The observation model maps the current state, the previous joint
///    action (zero at `t = 0`) and the current termination signal to
///    per-agent observations and raw availabilities.
/// 2. Availabilities are binarized with [`binarize_availability`].
/// 3. State, observations and availabilities are written at `t`, then the
///    [`PolicyController`] selects one joint action per active episode.
/// 4. The state-transition model maps the current state and the selected
///    joint action to the next state, a reward and a raw termination signal.
/// 5. Reward and termination flag are written at `t`; an episode whose
///    termination signal passes [`is_terminal`] becomes terminated.
///
/// Generation stops when no episode is active or the padded length is
/// reached. Hidden states of both models span the whole batch for the
/// whole rollout; rows of terminated episodes keep being computed, with a
/// zero action, but nothing is written for them.
///
/// ```mermaid
/// stateDiagram-v2
///     [*] --> Active
///     Active --> Active: term_signal <= term_threshold
///     Active --> Terminated: term_signal > term_threshold
///     Terminated --> [*]
/// ```
///
/// The generator only reads model parameters.
pub struct RolloutGenerator<'a, S, O> {
    state_model: &'a S,
    obs_model: &'a O,
    env_info: &'a EnvInfo,
    config: &'a GeneratorConfig,
    device: Device,
}

impl<'a, S, O> RolloutGenerator<'a, S, O>
where
    S: TransitionPredictor,
    O: ObservationPredictor,
{
    /// Constructs [`RolloutGenerator`].
    pub fn new(
        state_model: &'a S,
        obs_model: &'a O,
        env_info: &'a EnvInfo,
        config: &'a GeneratorConfig,
        device: Device,
    ) -> Self {
        Self {
            state_model,
            obs_model,
            env_info,
            config,
            device,
        }
    }

    fn check_shapes<B: EpisodeBufferBase + ?Sized>(&self, buffer: &B) -> Result<()> {
        let info = self.env_info;
        if self.config.fallback_action >= info.n_actions {
            return Err(WorldModelError::shape_mismatch(
                "generator.fallback_action",
                format!("< {}", info.n_actions),
                self.config.fallback_action,
            )
            .into());
        }
        if info.scheme() != *buffer.scheme() {
            return Err(WorldModelError::shape_mismatch(
                "generator.buffer",
                info.scheme(),
                buffer.scheme(),
            )
            .into());
        }
        let sizes = (self.state_model.state_size(), self.state_model.action_size());
        if sizes != (info.state_size(), info.action_size()) {
            return Err(WorldModelError::shape_mismatch(
                ModelKind::StateModel.to_string(),
                (info.state_size(), info.action_size()),
                sizes,
            )
            .into());
        }
        Ok(())
    }

    /// Generates `min(batch_size, episodes_in_buffer)` episodes.
    ///
    /// The returned batch has the scheme and padded length of `buffer`.
    /// `t_env` is forwarded to the policy controller.
    pub fn generate<B, P, R>(
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
        self.check_shapes(buffer)?;
        let info = self.env_info;
        let config = self.config;
        let (n_agents, n_actions, obs_shape) = (info.n_agents, info.n_actions, info.obs_shape);
        let (state_size, action_size) = (info.state_size(), info.action_size());

        let batch_size = buffer.episodes_in_buffer().min(config.batch_size);
        if batch_size == 0 {
            return Err(WorldModelError::InsufficientData(
                "no episode to take initial states from".to_string(),
            )
            .into());
        }
        let starts = buffer.sample(batch_size, rng)?;
        let max_seq_length = buffer.max_seq_length();
        let mut batch = EpisodeBatch::new(*buffer.scheme(), batch_size, max_seq_length);
        debug!("Generating {} model based episodes", batch_size);

        let device = &self.device;
        let state0 = starts.state.slice(s![.., 0, ..state_size]).to_owned();
        let term0 = starts.terminated.slice(s![.., 0..1]).to_owned();
        let mut state = array_to_tensor(&state0, device)?;
        let mut term_signal = array_to_tensor(&term0, device)?;
        let mut prev_action = Array2::<f32>::zeros((batch_size, action_size));
        let mut status = vec![EpisodeStatus::Active; batch_size];
        let mut obs_hidden: Option<HiddenState> = None;
        let mut state_hidden: Option<HiddenState> = None;
        policy.init_hidden(batch_size);

        for t in 0..max_seq_length {
            let active = status
                .iter()
                .enumerate()
                .filter(|(_, s)| **s == EpisodeStatus::Active)
                .map(|(i, _)| i)
                .collect::<Vec<_>>();
            if active.is_empty() {
                break;
            }

            // Observations and availabilities of the current state
            let last_action = array_to_tensor(&prev_action, device)?;
            let (pred, hidden) = self
                .obs_model
                .predict_step(&state, Some(&last_action), &term_signal, obs_hidden.as_ref())
                .with_context(|| rollout_context(ModelKind::ObsModel, t))?;
            obs_hidden = Some(hidden.detach());
            let obs = tensor_to_array2::<f32>(&pred.obs)?;
            let avail = binarize_availability(
                &tensor_to_array2::<f32>(&pred.avail_actions)?,
                n_actions,
                config.avail_threshold,
                config.fallback_action,
            );
            let state_arr = tensor_to_array2::<f32>(&state)?;

            for &b in active.iter() {
                let batch_state = match info.state_last_action {
                    true => concatenate(Axis(0), &[state_arr.row(b), prev_action.row(b)])?,
                    false => state_arr.row(b).to_owned(),
                };
                let obs_b = obs.row(b).to_owned().into_shape((n_agents, obs_shape))?;
                let avail_b = avail.row(b).to_owned().into_shape((n_agents, n_actions))?;
                batch.set_pre_transition(b, t, batch_state.view(), obs_b.view(), avail_b.view())?;
            }

            // Joint actions of the active episodes
            let actions = policy.select_actions(&batch, t, t_env, &active)?;
            if actions.dim() != (active.len(), n_agents) {
                return Err(WorldModelError::shape_mismatch(
                    "policy_controller",
                    (active.len(), n_agents),
                    actions.dim(),
                )
                .into());
            }
            let mut action_onehot = Array2::<f32>::zeros((batch_size, action_size));
            for (i, &b) in active.iter().enumerate() {
                batch.set_actions(b, t, actions.row(i))?;
                let onehot = batch.actions_onehot.slice(s![b, t, .., ..]);
                for (dst, src) in action_onehot.row_mut(b).iter_mut().zip(onehot.iter()) {
                    *dst = *src;
                }
            }

            // Transition
            let action = array_to_tensor(&action_onehot, device)?;
            let (pred, hidden) = self
                .state_model
                .predict_step(&state, &action, state_hidden.as_ref())
                .with_context(|| rollout_context(ModelKind::StateModel, t))?;
            state_hidden = Some(hidden.detach());
            let reward = tensor_to_array2::<f32>(&pred.reward)?;
            let term = tensor_to_array2::<f32>(&pred.term_signal)?;

            for &b in active.iter() {
                let done = is_terminal(term[[b, 0]], config.term_threshold);
                batch.set_post_transition(b, t, reward[[b, 0]], done)?;
                if done {
                    trace!("episode {} terminated at timestep {}", b, t);
                    status[b] = EpisodeStatus::Terminated;
                }
            }
            debug!(
                "t = {}: {} active, {} terminated",
                t,
                active.len(),
                status.iter().filter(|s| **s == EpisodeStatus::Terminated).count()
            );

            state = pred.next_state.detach();
            term_signal = pred.term_signal.detach();
            prev_action = action_onehot;
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{AVAIL_THRESHOLD, TERM_THRESHOLD};
    use crate::obs_model::ObsPrediction;
    use crate::state_model::StatePrediction;
    use candle_core::{DType, Tensor, Var};
    use mirage_core::replay_buffer::{EpisodeReplayBuffer, EpisodeReplayBufferConfig};
    use ndarray::{arr1, arr2, Array1};
    use rand::{rngs::SmallRng, SeedableRng};
    use std::cell::{Cell, RefCell};

    type StateFn = Box<dyn Fn(usize, usize) -> (Vec<f32>, f32, f32)>;
    type ObsFn = Box<dyn Fn(usize, usize) -> (Vec<f32>, Vec<f32>)>;
    type ActFn = Box<dyn Fn(usize, usize) -> Vec<i64>>;

    // Returns (next_state, reward, term_signal) for (t, row).
    struct MockStateModel {
        state_size: usize,
        action_size: usize,
        f: StateFn,
        calls: Cell<usize>,
        actions: RefCell<Vec<Array2<f32>>>,
    }

    impl TransitionPredictor for MockStateModel {
        fn state_size(&self) -> usize {
            self.state_size
        }

        fn action_size(&self) -> usize {
            self.action_size
        }

        fn predict_step(
            &self,
            state: &Tensor,
            action: &Tensor,
            _hidden: Option<&HiddenState>,
        ) -> Result<(StatePrediction, HiddenState)> {
            let t = self.calls.get();
            self.calls.set(t + 1);
            self.actions.borrow_mut().push(tensor_to_array2(action)?);

            let bs = state.dims()[0];
            let (mut s, mut r, mut d) = (vec![], vec![], vec![]);
            for b in 0..bs {
                let (s_, r_, d_) = (self.f)(t, b);
                s.extend(s_);
                r.push(r_);
                d.push(d_);
            }
            let dev = &Device::Cpu;
            let pred = StatePrediction {
                next_state: Tensor::from_vec(s, (bs, self.state_size), dev)?,
                reward: Tensor::from_vec(r, (bs, 1), dev)?,
                term_signal: Tensor::from_vec(d, (bs, 1), dev)?,
            };
            let hidden = Tensor::zeros((bs, 1), DType::F32, dev)?;
            Ok((pred, HiddenState::new(hidden)))
        }
    }

    // Returns (obs, raw availability) for (t, row).
    struct MockObsModel {
        joint_obs_size: usize,
        action_size: usize,
        f: ObsFn,
        calls: Cell<usize>,
        last_actions: RefCell<Vec<Array2<f32>>>,
        tracked_inputs: RefCell<Vec<bool>>,
    }

    impl ObservationPredictor for MockObsModel {
        fn predict_step(
            &self,
            state: &Tensor,
            last_action: Option<&Tensor>,
            term_signal: &Tensor,
            _hidden: Option<&HiddenState>,
        ) -> Result<(ObsPrediction, HiddenState)> {
            let t = self.calls.get();
            self.calls.set(t + 1);
            let tracked = state.track_op() || term_signal.track_op();
            self.tracked_inputs.borrow_mut().push(tracked);
            if let Some(a) = last_action {
                self.last_actions.borrow_mut().push(tensor_to_array2(a)?);
            }

            let bs = state.dims()[0];
            let (mut o, mut a) = (vec![], vec![]);
            for b in 0..bs {
                let (o_, a_) = (self.f)(t, b);
                o.extend(o_);
                a.extend(a_);
            }
            let dev = &Device::Cpu;
            let pred = ObsPrediction {
                obs: Tensor::from_vec(o, (bs, self.joint_obs_size), dev)?,
                avail_actions: Tensor::from_vec(a, (bs, self.action_size), dev)?,
            };
            let hidden = Tensor::zeros((bs, 1), DType::F32, dev)?;
            Ok((pred, HiddenState::new(hidden)))
        }
    }

    // Returns the joint action for (t, episode index).
    struct ScriptedPolicy {
        f: ActFn,
        init: Option<usize>,
        calls: Vec<(usize, Vec<usize>)>,
        seen_obs: Vec<Array2<f32>>,
    }

    impl PolicyController for ScriptedPolicy {
        fn init_hidden(&mut self, batch_size: usize) {
            self.init = Some(batch_size);
        }

        fn select_actions(
            &mut self,
            batch: &EpisodeBatch,
            t_ep: usize,
            _t_env: usize,
            active: &[usize],
        ) -> Result<Array2<i64>> {
            self.calls.push((t_ep, active.to_vec()));
            if let Some(&b) = active.first() {
                self.seen_obs.push(batch.obs.slice(s![b, t_ep, .., ..]).to_owned());
            }
            let n_agents = batch.scheme().n_agents;
            let mut actions = Array2::zeros((active.len(), n_agents));
            for (i, &b) in active.iter().enumerate() {
                actions.row_mut(i).assign(&Array1::from((self.f)(t_ep, b)));
            }
            Ok(actions)
        }
    }

    // Wraps a mock state model so that its outputs carry a computation graph.
    struct GraphStateModel {
        inner: MockStateModel,
        tracked_inputs: RefCell<Vec<bool>>,
    }

    impl TransitionPredictor for GraphStateModel {
        fn state_size(&self) -> usize {
            self.inner.state_size
        }

        fn action_size(&self) -> usize {
            self.inner.action_size
        }

        fn predict_step(
            &self,
            state: &Tensor,
            action: &Tensor,
            hidden: Option<&HiddenState>,
        ) -> Result<(StatePrediction, HiddenState)> {
            let tracked = state.track_op() || hidden.map_or(false, |h| h.h().track_op());
            self.tracked_inputs.borrow_mut().push(tracked);

            let (pred, hidden) = self.inner.predict_step(state, action, hidden)?;
            let dev = &Device::Cpu;
            let w = Var::ones(pred.next_state.dims(), DType::F32, dev)?;
            let v = Var::ones(pred.term_signal.dims(), DType::F32, dev)?;
            let pred = StatePrediction {
                next_state: pred.next_state.mul(w.as_tensor())?,
                reward: pred.reward,
                term_signal: pred.term_signal.mul(v.as_tensor())?,
            };
            Ok((pred, HiddenState::new(hidden.h().mul(v.as_tensor())?)))
        }
    }

    // Answers with a single column whatever the number of agents.
    struct NarrowPolicy;

    impl PolicyController for NarrowPolicy {
        fn init_hidden(&mut self, _batch_size: usize) {}

        fn select_actions(
            &mut self,
            _batch: &EpisodeBatch,
            _t_ep: usize,
            _t_env: usize,
            active: &[usize],
        ) -> Result<Array2<i64>> {
            Ok(Array2::zeros((active.len(), 1)))
        }
    }

    fn mismatched_component(err: &anyhow::Error) -> Option<(&str, &str, &str)> {
        match err.downcast_ref::<WorldModelError>() {
            Some(WorldModelError::ShapeMismatch {
                model,
                expected,
                actual,
            }) => Some((model.as_str(), expected.as_str(), actual.as_str())),
            _ => None,
        }
    }

    fn policy(f: ActFn) -> ScriptedPolicy {
        ScriptedPolicy {
            f,
            init: None,
            calls: vec![],
            seen_obs: vec![],
        }
    }

    fn env_info() -> EnvInfo {
        EnvInfo::new(2, 3, 2, 3, 5)
    }

    fn buffer_with(episodes: &[EpisodeBatch]) -> Result<EpisodeReplayBuffer> {
        let info = env_info();
        let config = EpisodeReplayBufferConfig::default();
        let mut buffer = EpisodeReplayBuffer::build(&config, info.scheme(), info.max_seq_length());
        for e in episodes {
            buffer.insert_episode_batch(e)?;
        }
        Ok(buffer)
    }

    fn state_model(f: StateFn) -> MockStateModel {
        MockStateModel {
            state_size: 3,
            action_size: 6,
            f,
            calls: Cell::new(0),
            actions: RefCell::new(vec![]),
        }
    }

    fn obs_model(f: ObsFn) -> MockObsModel {
        MockObsModel {
            joint_obs_size: 4,
            action_size: 6,
            f,
            calls: Cell::new(0),
            last_actions: RefCell::new(vec![]),
            tracked_inputs: RefCell::new(vec![]),
        }
    }

    #[test]
    fn test_threshold_semantics() {
        let raw = arr2(&[[0.2f32, 0.2000001, 0.0, 0.5, -1.0, 0.2]]);
        let avail = binarize_availability(&raw, 3, AVAIL_THRESHOLD, 1);
        assert_eq!(avail, arr2(&[[0., 1., 0., 1., 1., 0.]]));

        assert!(!is_terminal(0.9, TERM_THRESHOLD));
        assert!(is_terminal(0.9000001, TERM_THRESHOLD));
        assert!(!is_terminal(f32::NAN, TERM_THRESHOLD));
    }

    #[test]
    fn test_fallback_action_is_always_available() {
        let raw = Array2::<f32>::zeros((2, 6));
        let avail = binarize_availability(&raw, 3, AVAIL_THRESHOLD, 1);
        assert_eq!(avail.row(0).to_vec(), vec![0., 1., 0., 0., 1., 0.]);
        assert_eq!(avail.row(1).to_vec(), vec![0., 1., 0., 0., 1., 0.]);
    }

    #[test]
    fn test_immediate_termination_fills_first_step_only() -> Result<()> {
        let info = env_info();
        let empty = EpisodeBatch::new(info.scheme(), 1, info.max_seq_length());
        let buffer = buffer_with(&[empty.clone(), empty.clone(), empty])?;
        let sm = state_model(Box::new(|_, _| (vec![0.; 3], 0.0, 1.0)));
        let om = obs_model(Box::new(|_, _| (vec![0.; 4], vec![0.; 6])));
        let mut pc = policy(Box::new(|_, _| vec![1, 1]));
        let config = GeneratorConfig::default().batch_size(8);

        let generator = RolloutGenerator::new(&sm, &om, &info, &config, Device::Cpu);
        let mut rng = SmallRng::seed_from_u64(42);
        let batch = generator.generate(&buffer, &mut pc, 0, &mut rng)?;

        assert_eq!(batch.batch_size(), 3);
        assert_eq!(pc.init, Some(3));
        assert_eq!(sm.calls.get(), 1);
        assert_eq!(pc.calls, vec![(0, vec![0, 1, 2])]);
        assert_eq!(batch.max_t_filled(), 1);
        for b in 0..3 {
            assert_eq!(batch.filled[[b, 0]], 1.0);
            assert_eq!(batch.terminated[[b, 0]], 1.0);
            assert_eq!(batch.avail_actions[[b, 0, 0, 1]], 1.0);
        }
        Ok(())
    }

    #[test]
    fn test_termination_is_sticky() -> Result<()> {
        let info = env_info();
        let empty = EpisodeBatch::new(info.scheme(), 1, info.max_seq_length());
        let buffer = buffer_with(&[empty.clone(), empty])?;
        // row 0 crosses the threshold at t = 0 only, row 1 never does
        let sm = state_model(Box::new(|t, b| {
            let term = if b == 0 && t == 0 { 0.95 } else { 0.1 };
            (vec![0.; 3], 1.0, term)
        }));
        let om = obs_model(Box::new(|_, _| (vec![0.; 4], vec![1.; 6])));
        let mut pc = policy(Box::new(|_, _| vec![0, 2]));
        let config = GeneratorConfig::default();

        let generator = RolloutGenerator::new(&sm, &om, &info, &config, Device::Cpu);
        let mut rng = SmallRng::seed_from_u64(0);
        let batch = generator.generate(&buffer, &mut pc, 0, &mut rng)?;

        let filled: Vec<Vec<f32>> = batch.filled.outer_iter().map(|r| r.to_vec()).collect();
        let (short, long) = match filled[0][1] == 0.0 {
            true => (&filled[0], &filled[1]),
            false => (&filled[1], &filled[0]),
        };
        assert_eq!(short, &vec![1., 0., 0., 0., 0., 0.]);
        assert_eq!(long, &vec![1.; 6]);
        assert_eq!(sm.calls.get(), 6);
        assert!(pc.calls[1..].iter().all(|(_, active)| active.len() == 1));

        // terminated rows are advanced with a zero action
        let actions = sm.actions.borrow();
        let row = pc.calls[1].1[0];
        assert_eq!(actions[1].row(1 - row).sum(), 0.0);
        assert_eq!(actions[1].row(row).sum(), 2.0);
        Ok(())
    }

    // Round trip: with models that replay a recorded episode and a policy that
    // replays its recorded actions, the generated episode equals the recording.
    #[test]
    fn test_round_trip_with_replaying_models() -> Result<()> {
        let info = env_info();
        let mut real = EpisodeBatch::new(info.scheme(), 1, info.max_seq_length());
        for t in 0..=3 {
            let tf = t as f32;
            let obs = arr2(&[[tf, 0.1], [tf + 1.0, 0.2]]);
            let avail = Array2::<f32>::ones((2, 3));
            let state = arr1(&[tf, tf + 0.5, -tf]);
            real.set_pre_transition(0, t, state.view(), obs.view(), avail.view())?;
            real.set_actions(0, t, arr1(&[(t % 3) as i64, ((t + 1) % 3) as i64]).view())?;
            real.set_post_transition(0, t, 0.5 * tf, t == 3)?;
        }
        let buffer = buffer_with(&[real.clone()])?;

        let r1 = real.clone();
        let sm = state_model(Box::new(move |t, _| {
            let next = r1.state.slice(s![0, t + 1, ..]).to_vec();
            (next, r1.reward[[0, t]], r1.terminated[[0, t]])
        }));
        let r2 = real.clone();
        let om = obs_model(Box::new(move |t, _| {
            let obs = r2.obs.slice(s![0, t, .., ..]).iter().copied().collect();
            (obs, vec![1.; 6])
        }));
        let r3 = real.clone();
        let mut pc = policy(Box::new(move |t, _| r3.actions.slice(s![0, t, ..]).to_vec()));
        let config = GeneratorConfig::default();

        let generator = RolloutGenerator::new(&sm, &om, &info, &config, Device::Cpu);
        let mut rng = SmallRng::seed_from_u64(7);
        let batch = generator.generate(&buffer, &mut pc, 100, &mut rng)?;

        assert_eq!(batch.actions, real.actions);
        assert_eq!(batch.actions_onehot, real.actions_onehot);
        assert_eq!(batch.reward, real.reward);
        assert_eq!(batch.terminated, real.terminated);
        assert_eq!(batch.filled, real.filled);
        assert_eq!(batch.state.slice(s![.., ..4, ..]), real.state.slice(s![.., ..4, ..]));
        for (t, obs) in pc.seen_obs.iter().enumerate() {
            assert_eq!(obs, &real.obs.slice(s![0, t, .., ..]));
        }

        // The state model receives the action selected at the same step and
        // the observation model the one selected at the previous step.
        let sm_actions = sm.actions.borrow();
        let om_actions = om.last_actions.borrow();
        for t in 0..4 {
            let onehot = real.actions_onehot.slice(s![0, t, .., ..]);
            let onehot = onehot.iter().copied().collect::<Vec<_>>();
            assert_eq!(sm_actions[t].row(0).to_vec(), onehot);
            if t < 3 {
                assert_eq!(om_actions[t + 1].row(0).to_vec(), onehot);
            }
        }
        assert_eq!(om_actions[0].sum(), 0.0);
        Ok(())
    }

    #[test]
    fn test_invalid_action_is_rejected() -> Result<()> {
        let info = env_info();
        let buffer = buffer_with(&[EpisodeBatch::new(info.scheme(), 1, info.max_seq_length())])?;
        let sm = state_model(Box::new(|_, _| (vec![0.; 3], 0.0, 0.0)));
        let om = obs_model(Box::new(|_, _| (vec![0.; 4], vec![1.; 6])));
        let mut pc = policy(Box::new(|_, _| vec![0, 7]));
        let config = GeneratorConfig::default();

        let generator = RolloutGenerator::new(&sm, &om, &info, &config, Device::Cpu);
        let mut rng = SmallRng::seed_from_u64(0);
        let err = generator.generate(&buffer, &mut pc, 0, &mut rng).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorldModelError>(),
            Some(WorldModelError::InvalidAction {
                agent: 1,
                action: 7,
                t: 0,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_empty_buffer_is_insufficient_data() -> Result<()> {
        let info = env_info();
        let buffer = buffer_with(&[])?;
        let sm = state_model(Box::new(|_, _| (vec![0.; 3], 0.0, 0.0)));
        let om = obs_model(Box::new(|_, _| (vec![0.; 4], vec![1.; 6])));
        let mut pc = policy(Box::new(|_, _| vec![0, 0]));
        let config = GeneratorConfig::default();

        let generator = RolloutGenerator::new(&sm, &om, &info, &config, Device::Cpu);
        let mut rng = SmallRng::seed_from_u64(0);
        let err = generator.generate(&buffer, &mut pc, 0, &mut rng).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorldModelError>(),
            Some(WorldModelError::InsufficientData(_))
        ));
        Ok(())
    }

    #[test]
    fn test_policy_output_shape_is_checked() -> Result<()> {
        let info = env_info();
        let buffer = buffer_with(&[EpisodeBatch::new(info.scheme(), 1, info.max_seq_length())])?;
        let sm = state_model(Box::new(|_, _| (vec![0.; 3], 0.0, 0.0)));
        let om = obs_model(Box::new(|_, _| (vec![0.; 4], vec![1.; 6])));
        let config = GeneratorConfig::default();

        let generator = RolloutGenerator::new(&sm, &om, &info, &config, Device::Cpu);
        let mut rng = SmallRng::seed_from_u64(0);
        let err = generator.generate(&buffer, &mut NarrowPolicy, 0, &mut rng).unwrap_err();
        assert_eq!(
            mismatched_component(&err),
            Some(("policy_controller", "(1, 2)", "(1, 1)"))
        );
        assert_eq!(sm.calls.get(), 0);
        Ok(())
    }

    #[test]
    fn test_fallback_action_must_be_an_action() -> Result<()> {
        let info = env_info();
        let buffer = buffer_with(&[EpisodeBatch::new(info.scheme(), 1, info.max_seq_length())])?;
        let sm = state_model(Box::new(|_, _| (vec![0.; 3], 0.0, 0.0)));
        let om = obs_model(Box::new(|_, _| (vec![0.; 4], vec![1.; 6])));
        let mut pc = policy(Box::new(|_, _| vec![0, 0]));
        let config = GeneratorConfig::default().fallback_action(info.n_actions);

        let generator = RolloutGenerator::new(&sm, &om, &info, &config, Device::Cpu);
        let mut rng = SmallRng::seed_from_u64(0);
        let err = generator.generate(&buffer, &mut pc, 0, &mut rng).unwrap_err();
        let (model, _, actual) = mismatched_component(&err).unwrap();
        assert_eq!(model, "generator.fallback_action");
        assert_eq!(actual, "3");
        assert_eq!(om.calls.get(), 0);
        assert!(pc.init.is_none());
        Ok(())
    }

    #[test]
    fn test_buffer_scheme_must_match_env_info() -> Result<()> {
        let info = env_info();
        let other = EnvInfo::new(2, 3, 5, 3, 5);
        let (scheme, len) = (other.scheme(), other.max_seq_length());
        let buffer_config = EpisodeReplayBufferConfig::default();
        let mut buffer = EpisodeReplayBuffer::build(&buffer_config, scheme, len);
        buffer.insert_episode_batch(&EpisodeBatch::new(scheme, 1, len))?;
        let sm = state_model(Box::new(|_, _| (vec![0.; 3], 0.0, 0.0)));
        let om = obs_model(Box::new(|_, _| (vec![0.; 4], vec![1.; 6])));
        let mut pc = policy(Box::new(|_, _| vec![0, 0]));
        let config = GeneratorConfig::default();

        let generator = RolloutGenerator::new(&sm, &om, &info, &config, Device::Cpu);
        let mut rng = SmallRng::seed_from_u64(0);
        let err = generator.generate(&buffer, &mut pc, 0, &mut rng).unwrap_err();
        let (model, _, _) = mismatched_component(&err).unwrap();
        assert_eq!(model, "generator.buffer");
        Ok(())
    }

    #[test]
    fn test_rollout_inputs_are_detached() -> Result<()> {
        let info = env_info();
        let buffer = buffer_with(&[EpisodeBatch::new(info.scheme(), 1, info.max_seq_length())])?;
        let sm = GraphStateModel {
            inner: state_model(Box::new(|_, _| (vec![0.5; 3], 0.0, 0.1))),
            tracked_inputs: RefCell::new(vec![]),
        };
        let om = obs_model(Box::new(|_, _| (vec![0.; 4], vec![1.; 6])));
        let mut pc = policy(Box::new(|_, _| vec![0, 1]));
        let config = GeneratorConfig::default();

        let generator = RolloutGenerator::new(&sm, &om, &info, &config, Device::Cpu);
        let mut rng = SmallRng::seed_from_u64(3);
        let batch = generator.generate(&buffer, &mut pc, 0, &mut rng)?;

        assert_eq!(batch.filled.row(0).sum(), 6.0);
        assert_eq!(sm.tracked_inputs.borrow().len(), 6);
        assert_eq!(om.tracked_inputs.borrow().len(), 6);
        assert!(sm.tracked_inputs.borrow().iter().all(|tracked| !tracked));
        assert!(om.tracked_inputs.borrow().iter().all(|tracked| !tracked));
        Ok(())
    }
}
