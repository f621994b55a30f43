use std::f64::consts::PI;
use std::fmt;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{LearningConfig, RewardConfig, RunReset, SlotCarConfig};
use crate::error::{Result, SlotCarError};
use crate::space::{Action, State};
use crate::table::ActionValueTable;

/// Cosine decay of the exploration probability.
///
/// p(n) = 0.5 cos(pi n / N) + 0.5 for n <= N, and 0 afterwards. Exploration stays high
/// for most of the schedule and falls off sharply near the end.
#[derive(Debug, Clone, Copy)]
pub struct ExplorationSchedule {
    max_exploring_iterations: u64,
}

impl ExplorationSchedule {
    pub fn new(max_exploring_iterations: u64) -> Result<ExplorationSchedule> {
        if max_exploring_iterations == 0 {
            return Err(SlotCarError::ConfigInvalid {
                field: "learning.max_exploring_iterations",
                reason: String::from("must be > 0"),
            });
        }
        Ok(ExplorationSchedule { max_exploring_iterations })
    }

    pub fn probability(&self, iterations: u64) -> f64 {
        if iterations > self.max_exploring_iterations {
            return 0.0;
        }
        let progress = iterations as f64 / self.max_exploring_iterations as f64;
        // Clamp away rounding below zero at n == N.
        (0.5 * (PI * progress).cos() + 0.5).max(0.0)
    }
}

/// Running reward total. The change of the total after each step is the reward signal.
#[derive(Debug, Clone)]
pub struct RewardAccumulator {
    total: f64,
    params: RewardConfig,
}

impl RewardAccumulator {
    pub fn new(params: RewardConfig) -> RewardAccumulator {
        RewardAccumulator { total: params.initial_total, params }
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    /// Updates the total for one step and returns how much it changed.
    ///
    /// A deslot scales the whole total by the deslot factor, so the penalty grows with the
    /// reward collected so far. Otherwise speed and completed laps are added.
    pub fn update(&mut self, speed: f64, laps_completed: u32, deslotted: bool) -> f64 {
        let previous = self.total;
        if deslotted {
            self.total *= self.params.deslot_factor;
        } else {
            self.total +=
                speed * self.params.speed_weight + f64::from(laps_completed) * self.params.lap_weight;
        }
        self.total - previous
    }

    pub fn reset(&mut self) {
        self.total = self.params.initial_total;
    }
}

/// Lifecycle of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Running,
    Deslotted,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    /// Start or continue training
    Resume,
    /// User pause
    Stop,
    /// Car left the track
    Deslot,
    /// Car is back on the track
    Reset,
}

impl RunState {
    pub fn on(self, event: RunEvent) -> Result<RunState> {
        use RunEvent::*;
        use RunState::*;
        match (self, event) {
            (Idle | Stopped, Resume) => Ok(Running),
            (Running, Stop) => Ok(Stopped),
            (Running, Deslot) => Ok(Deslotted),
            (Deslotted, Reset) => Ok(Idle),
            (from, event) => Err(SlotCarError::InvalidTransition {
                from: from.name(),
                event: event.name(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Deslotted => "deslotted",
            RunState::Stopped => "stopped",
        }
    }
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Resume => "resume",
            RunEvent::Stop => "stop",
            RunEvent::Deslot => "deslot",
            RunEvent::Reset => "reset",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Values the user interface shows while training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AgentDiagnostics {
    pub total_reward: f64,
    pub training_iterations: u64,
    pub probability_to_explore: f64,
}

/// Epsilon-greedy Q-learning agent. Sole owner of the action-value table.
#[derive(Debug)]
pub struct Agent {
    table: ActionValueTable,
    learning_rate: f64,
    discount_factor: f64,
    schedule: ExplorationSchedule,
    reward: RewardAccumulator,
    training_iterations: u64,
    probability_to_explore: f64,
    run_reset: RunReset,
    rng: StdRng,
}

impl Agent {
    pub fn new(
        table: ActionValueTable,
        learning: &LearningConfig,
        reward: RewardConfig,
    ) -> Result<Agent> {
        let schedule = ExplorationSchedule::new(learning.max_exploring_iterations)?;
        let rng = match learning.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Agent {
            table,
            learning_rate: learning.learning_rate,
            discount_factor: learning.discount_factor,
            schedule,
            reward: RewardAccumulator::new(reward),
            training_iterations: 0,
            probability_to_explore: schedule.probability(0),
            run_reset: learning.run_reset,
            rng,
        })
    }

    /// Validates the configuration and builds the table and the agent on top of it.
    pub fn from_config(config: &SlotCarConfig) -> Result<Agent> {
        config.validate()?;
        let table = ActionValueTable::new(&config.state_shape, &config.action_shape)?;
        Agent::new(table, &config.learning, config.reward.clone())
    }

    pub fn table(&self) -> &ActionValueTable {
        &self.table
    }

    pub fn is_valid_state(&self, state: &State) -> bool {
        self.table.encoder().is_valid_state(state)
    }

    /// Explores with probability p(n), otherwise takes the best known action.
    pub fn decide_action(&mut self, state: &State) -> Result<Action> {
        if !self.is_valid_state(state) {
            return Err(SlotCarError::StateInvalid(state.to_string()));
        }
        if self.rng.gen::<f64>() < self.probability_to_explore {
            Ok(self.table.random_action(&mut self.rng))
        } else {
            Ok(self.table.argmax_action(state))
        }
    }

    /// Reward signal for the step just taken.
    pub fn update_reward(&mut self, speed: f64, laps_completed: u32, deslotted: bool) -> f64 {
        self.reward.update(speed, laps_completed, deslotted)
    }

    /// Bellman update of Q(current, action).
    ///
    /// Nothing is written unless both states and the action are valid.
    pub fn train(&mut self, current: &State, next: &State, action: Action, reward: f64) -> Result<()> {
        for state in [current, next] {
            if !self.is_valid_state(state) {
                return Err(SlotCarError::StateInvalid(state.to_string()));
            }
        }
        if !self.table.encoder().is_valid_action(action) {
            return Err(SlotCarError::ActionInvalid(action.0));
        }

        let old_value = (1.0 - self.learning_rate) * self.table.get(current, action);
        let future_value = self.discount_factor * self.table.max_value(next);
        let new_value = old_value + self.learning_rate * (reward + future_value);
        self.table.set(current, action, new_value);

        self.training_iterations += 1;
        self.probability_to_explore = self.schedule.probability(self.training_iterations);
        debug!(
            state = %current,
            action = %action,
            next = %next,
            reward,
            value = new_value,
            "trained"
        );
        Ok(())
    }

    /// Starts a new run. The reward total goes back to its initial value. With
    /// `RunReset::Full` the iteration count and exploration restart too. Learned values
    /// always carry over.
    pub fn reset_run(&mut self) {
        self.reward.reset();
        if self.run_reset == RunReset::Full {
            self.training_iterations = 0;
            self.probability_to_explore = self.schedule.probability(0);
        }
        info!(iterations = self.training_iterations, reset = ?self.run_reset, "new training run");
    }

    /// Forget all learned values and restart exploration.
    pub fn reset_table(&mut self) {
        self.table.reset();
        self.training_iterations = 0;
        self.probability_to_explore = self.schedule.probability(0);
    }

    pub fn total_reward(&self) -> f64 {
        self.reward.total()
    }

    pub fn training_iterations(&self) -> u64 {
        self.training_iterations
    }

    pub fn probability_to_explore(&self) -> f64 {
        self.probability_to_explore
    }

    pub fn diagnostics(&self) -> AgentDiagnostics {
        AgentDiagnostics {
            total_reward: self.reward.total(),
            training_iterations: self.training_iterations,
            probability_to_explore: self.probability_to_explore,
        }
    }

    pub fn save_table(&self, path: &Path) -> Result<()> {
        self.table.save_dump(path)
    }
}
