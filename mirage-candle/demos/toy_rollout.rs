//! Learns a world model of a toy two-agent environment, then generates
//! episodes with it.
//!
//! Two agents move on the unit interval towards a target. Each step an agent
//! moves left, stays or moves right; moving beyond the interval is not
//! available. The episode ends when both agents are close to the target.
use anyhow::Result;
use clap::Parser;
use log::info;
use mirage_candle::{
    Device, GeneratorConfig, RecurrentModelConfig, TrainerConfig, WorldModel, WorldModelConfig,
};
use mirage_core::{
    record::{BufferedRecorder, RecordValue},
    replay_buffer::{EpisodeReplayBuffer, EpisodeReplayBufferConfig},
    EnvInfo, EpisodeBatch, EpisodeBufferBase, PolicyController,
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::{rngs::SmallRng, Rng, SeedableRng};

const N_AGENTS: usize = 2;
const N_ACTIONS: usize = 3;
const EPISODE_LIMIT: usize = 20;
const STEP_SIZE: f32 = 0.1;
const GOAL_RADIUS: f32 = 0.1;
const HIDDEN_DIM: usize = 64;
const LR: f64 = 1e-3;
const BATCH_SIZE: usize = 16;
const LOG_EPOCHS: usize = 10;
const MODEL_DIR: &str = "./model/candle/toy_rollout";

/// Train a world model on a toy environment and generate episodes with it
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Number of episodes collected from the environment
    #[arg(long, default_value_t = 64)]
    episodes: usize,

    /// Number of training epochs of each model
    #[arg(long, default_value_t = 100)]
    epochs: usize,

    /// Number of generated episodes
    #[arg(long, default_value_t = 8)]
    generate: usize,

    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Configuration of the world model as YAML file
    #[arg(long)]
    config: Option<String>,

    /// Save model parameters
    #[arg(short, long, default_value_t = false)]
    save: bool,
}

struct LineEnv {
    pos: [f32; N_AGENTS],
    target: f32,
}

impl LineEnv {
    fn env_info() -> EnvInfo {
        // state: agent positions and target, observation: own position and offset to target
        EnvInfo::new(N_AGENTS, N_ACTIONS, 2, N_AGENTS + 1, EPISODE_LIMIT)
    }

    fn reset<R: Rng>(rng: &mut R) -> Self {
        Self {
            pos: [rng.gen(), rng.gen()],
            target: rng.gen(),
        }
    }

    fn state(&self) -> Array1<f32> {
        let mut v = self.pos.to_vec();
        v.push(self.target);
        Array1::from(v)
    }

    fn obs(&self) -> Array2<f32> {
        Array2::from_shape_fn((N_AGENTS, 2), |(i, j)| match j {
            0 => self.pos[i],
            _ => self.target - self.pos[i],
        })
    }

    fn avail_actions(&self) -> Array2<f32> {
        Array2::from_shape_fn((N_AGENTS, N_ACTIONS), |(i, a)| match a {
            0 if self.pos[i] - STEP_SIZE < 0.0 => 0.0,
            2 if self.pos[i] + STEP_SIZE > 1.0 => 0.0,
            _ => 1.0,
        })
    }

    fn step(&mut self, actions: ArrayView1<i64>) -> (f32, bool) {
        for (p, &a) in self.pos.iter_mut().zip(actions.iter()) {
            *p = (*p + STEP_SIZE * (a as f32 - 1.0)).clamp(0.0, 1.0);
        }
        let dist = self.pos.iter().map(|p| (p - self.target).abs()).sum::<f32>() / N_AGENTS as f32;
        (-dist, dist < GOAL_RADIUS)
    }
}

/// Picks an available action uniformly at random for each agent.
fn sample_available<R: Rng>(avail: ArrayView2<f32>, rng: &mut R) -> Array1<i64> {
    avail
        .outer_iter()
        .map(|row| {
            let ixs = row
                .iter()
                .enumerate()
                .filter(|&(_, &v)| v > 0.0)
                .map(|(i, _)| i as i64)
                .collect::<Vec<_>>();
            match ixs.is_empty() {
                true => 1,
                false => ixs[rng.gen_range(0..ixs.len())],
            }
        })
        .collect()
}

fn collect_episode<R: Rng>(info: &EnvInfo, rng: &mut R) -> Result<EpisodeBatch> {
    let mut batch = EpisodeBatch::new(info.scheme(), 1, info.max_seq_length());
    let mut env = LineEnv::reset(rng);
    for t in 0..info.episode_limit {
        let avail = env.avail_actions();
        batch.set_pre_transition(0, t, env.state().view(), env.obs().view(), avail.view())?;
        let actions = sample_available(avail.view(), rng);
        batch.set_actions(0, t, actions.view())?;
        let (reward, done) = env.step(actions.view());
        let done = done || t + 1 == info.episode_limit;
        batch.set_post_transition(0, t, reward, done)?;
        if done {
            break;
        }
    }
    Ok(batch)
}

struct RandomPolicy {
    rng: SmallRng,
}

impl PolicyController for RandomPolicy {
    fn init_hidden(&mut self, _batch_size: usize) {}

    fn select_actions(
        &mut self,
        batch: &EpisodeBatch,
        t_ep: usize,
        _t_env: usize,
        active: &[usize],
    ) -> Result<Array2<i64>> {
        let mut actions = Array2::zeros((active.len(), batch.scheme().n_agents));
        for (i, &b) in active.iter().enumerate() {
            let avail = batch.avail_actions.slice(ndarray::s![b, t_ep, .., ..]);
            actions.row_mut(i).assign(&sample_available(avail, &mut self.rng));
        }
        Ok(actions)
    }
}

fn create_config(args: &Args) -> Result<WorldModelConfig> {
    if let Some(path) = &args.config {
        return WorldModelConfig::load(path);
    }
    let model_config = RecurrentModelConfig::default()
        .hidden_dim(HIDDEN_DIM)
        .learning_rate(LR);
    let trainer_config = TrainerConfig::default()
        .batch_size(BATCH_SIZE)
        .epochs(args.epochs)
        .log_epochs(LOG_EPOCHS);
    Ok(WorldModelConfig::default()
        .state_model_config(model_config.clone())
        .obs_model_config(model_config)
        .state_trainer_config(trainer_config.clone())
        .obs_trainer_config(trainer_config)
        .generator_config(GeneratorConfig::default().batch_size(args.generate))
        .device(Device::Cpu))
}

fn run(args: &Args) -> Result<()> {
    let mut rng = SmallRng::seed_from_u64(args.seed);
    let info = LineEnv::env_info();

    let buffer_config = EpisodeReplayBufferConfig::default().capacity(args.episodes);
    let mut buffer =
        EpisodeReplayBuffer::build(&buffer_config, info.scheme(), info.max_seq_length());
    for _ in 0..args.episodes {
        buffer.insert_episode_batch(&collect_episode(&info, &mut rng)?)?;
    }
    info!("Collected {} episodes", buffer.episodes_in_buffer());

    let mut world_model = WorldModel::<mirage_candle::LstmCell>::build(info, create_config(args)?)?;
    let mut recorder = BufferedRecorder::new();
    world_model.train(&buffer, &mut rng, &mut recorder)?;
    for record in recorder.drain() {
        let epoch = record.get("state_model_epoch").or(record.get("obs_model_epoch"));
        if let Some(RecordValue::Scalar(epoch)) = epoch {
            info!("epoch {} recorded with {} entries", epoch, record.len());
        }
    }
    if args.save {
        world_model.save_params(MODEL_DIR)?;
    }

    let mut policy = RandomPolicy {
        rng: SmallRng::seed_from_u64(args.seed + 1),
    };
    let batch = world_model.generate_batch(&buffer, &mut policy, 0, &mut rng)?;
    let batch = batch.truncate(batch.max_t_filled());
    let lengths: Array1<f32> = batch.filled.sum_axis(ndarray::Axis(1));
    info!(
        "Generated {} episodes, lengths {}, mean return {:.3}",
        batch.batch_size(),
        lengths,
        batch.reward.sum() / batch.batch_size() as f32
    );
    info!("Actions of agent 0 in episode 0: {}", batch.actions.slice(ndarray::s![0, .., 0]));

    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    run(&args)
}
