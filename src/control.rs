use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::actuator::Actuator;
use crate::agent::{Agent, AgentDiagnostics, RunEvent, RunState};
use crate::config::{ControlConfig, HallConfig};
use crate::error::{Result, SlotCarError};
use crate::sensors::{cross_validate_speed, HallSensor, PositionPair};
use crate::space::{Action, SpaceEncoder, State};
use crate::track::TrackFeatures;

/// What the control loop learns about the car at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub state: State,
    /// cm/s
    pub speed: f64,
    /// Laps since the last deslot
    pub laps_completed: u32,
    pub deslotted: bool,
}

/// The car and track as seen by the control loop.
pub trait Track {
    /// Non-blocking sample of the car's current state.
    fn measure(&mut self) -> Result<Measurement>;
    fn apply(&mut self, action: Action) -> Result<()>;
    /// Bring the car to a halt.
    fn halt(&mut self) -> Result<()>;
    /// Called once the car is back in its slot after a deslot.
    fn reset(&mut self) -> Result<()>;
}

/// Requests from the user interface, observed between control steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Resume,
    Stop,
    /// The user saw the car leave the track.
    Deslot,
    Shutdown,
}

/// Sending side of the command channel.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    commands: mpsc::UnboundedSender<ControlCommand>,
}

impl ControlHandle {
    /// False once the loop has finished.
    pub fn send(&self, command: ControlCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// One trained step, as written to the training log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub iteration: u64,
    pub state: String,
    pub action: i32,
    pub next_state: String,
    pub speed: f64,
    pub laps: u32,
    pub deslotted: bool,
    pub reward: f64,
    pub total_reward: f64,
    pub probability_to_explore: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RunSummary {
    /// Steps started, including skipped ones
    pub steps: u64,
    pub trained: u64,
    pub skipped: u64,
    pub deslots: u64,
}

/// Drives training: measure, act, dwell, measure, reward, train.
///
/// The loop owns the agent, so the table only ever has one writer.
pub struct ControlLoop<T: Track> {
    agent: Agent,
    track: T,
    dwell: Duration,
    auto_resume: bool,
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    queued: VecDeque<ControlCommand>,
    run_state: RunState,
    pending_deslot: bool,
    shutdown: bool,
    step_limit: Option<u64>,
    log: Option<csv::Writer<Box<dyn io::Write + Send>>>,
    summary: RunSummary,
}

impl<T: Track> ControlLoop<T> {
    pub fn new(agent: Agent, track: T, config: &ControlConfig) -> (ControlLoop<T>, ControlHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let control = ControlLoop {
            agent,
            track,
            dwell: config.dwell(),
            auto_resume: config.auto_resume,
            commands: rx,
            queued: VecDeque::new(),
            run_state: RunState::Idle,
            pending_deslot: false,
            shutdown: false,
            step_limit: None,
            log: None,
            summary: RunSummary::default(),
        };
        (control, ControlHandle { commands: tx })
    }

    /// Stop after this many steps (trained or skipped).
    pub fn with_step_limit(mut self, steps: u64) -> Self {
        self.step_limit = Some(steps);
        self
    }

    pub fn with_dwell(mut self, dwell: Duration) -> Self {
        self.dwell = dwell;
        self
    }

    /// Write a CSV record for every trained step.
    pub fn with_log<W: io::Write + Send + 'static>(mut self, writer: W) -> Self {
        let writer: Box<dyn io::Write + Send> = Box::new(writer);
        self.log = Some(csv::Writer::from_writer(writer));
        self
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn into_agent(self) -> Agent {
        self.agent
    }

    pub fn track(&self) -> &T {
        &self.track
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn diagnostics(&self) -> AgentDiagnostics {
        self.agent.diagnostics()
    }

    /// Runs until shutdown, the step limit, or a fatal error.
    ///
    /// Recoverable step errors skip the tick. The car is halted before returning.
    pub async fn run(&mut self) -> Result<RunSummary> {
        info!(dwell_ms = self.dwell.as_millis() as u64, "control loop started");
        let outcome = self.run_until_done().await;
        let halted = self.track.halt();
        let flushed = match self.log.as_mut() {
            Some(log) => log.flush(),
            None => Ok(()),
        };
        outcome?;
        halted?;
        flushed?;
        info!(
            steps = self.summary.steps,
            trained = self.summary.trained,
            skipped = self.summary.skipped,
            deslots = self.summary.deslots,
            "control loop finished"
        );
        Ok(self.summary)
    }

    async fn run_until_done(&mut self) -> Result<()> {
        loop {
            self.poll_commands();
            while let Some(command) = self.queued.pop_front() {
                self.handle(command)?;
            }
            if self.shutdown || self.limit_reached() {
                return Ok(());
            }
            match self.run_state {
                RunState::Running => {
                    self.summary.steps += 1;
                    match self.step().await {
                        Ok(()) => self.summary.trained += 1,
                        Err(e) if e.is_recoverable() => {
                            warn!(error = %e, "skipping control step");
                            self.summary.skipped += 1;
                        }
                        Err(e) => return Err(e),
                    }
                    if std::mem::take(&mut self.pending_deslot) {
                        self.summary.deslots += 1;
                        warn!(total_reward = self.agent.total_reward(), "car deslotted");
                        self.transition(RunEvent::Deslot)?;
                    }
                }
                RunState::Deslotted => self.recover()?,
                RunState::Idle | RunState::Stopped => match self.commands.recv().await {
                    Some(command) => self.handle(command)?,
                    None => return Ok(()),
                },
            }
        }
    }

    fn limit_reached(&self) -> bool {
        self.step_limit.is_some_and(|limit| self.summary.steps >= limit)
    }

    /// Moves waiting commands into the queue. Deslot reports attach to the current step.
    fn poll_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            if command == ControlCommand::Deslot && self.run_state == RunState::Running {
                self.pending_deslot = true;
            } else {
                self.queued.push_back(command);
            }
        }
    }

    fn handle(&mut self, command: ControlCommand) -> Result<()> {
        let event = match command {
            ControlCommand::Shutdown => {
                self.shutdown = true;
                return Ok(());
            }
            ControlCommand::Deslot if self.run_state == RunState::Running => {
                self.pending_deslot = true;
                return Ok(());
            }
            ControlCommand::Resume => RunEvent::Resume,
            ControlCommand::Stop => RunEvent::Stop,
            ControlCommand::Deslot => RunEvent::Deslot,
        };
        match self.run_state.on(event) {
            Ok(next) => {
                self.enter(next)?;
            }
            Err(e) => warn!(error = %e, "ignoring command"),
        }
        Ok(())
    }

    fn enter(&mut self, next: RunState) -> Result<()> {
        info!(from = %self.run_state, to = %next, "run state changed");
        self.run_state = next;
        if next == RunState::Stopped {
            self.track.halt()?;
        }
        Ok(())
    }

    fn transition(&mut self, event: RunEvent) -> Result<()> {
        let next = self.run_state.on(event)?;
        self.enter(next)
    }

    /// Car is back on the track: start a new run.
    fn recover(&mut self) -> Result<()> {
        self.track.reset()?;
        self.agent.reset_run();
        self.transition(RunEvent::Reset)?;
        if self.auto_resume {
            self.transition(RunEvent::Resume)?;
        }
        Ok(())
    }

    /// One tick. A deslot seen during the tick is left in `pending_deslot`, even when the
    /// tick fails. Reward and table change only when every check passes.
    async fn step(&mut self) -> Result<()> {
        let before = self.track.measure()?;
        let action = self.agent.decide_action(&before.state)?;
        self.track.apply(action)?;

        tokio::time::sleep(self.dwell).await;
        self.poll_commands();

        let after = self.track.measure()?;
        self.pending_deslot |= after.deslotted;
        if !self.agent.is_valid_state(&after.state) {
            return Err(SlotCarError::StateInvalid(after.state.to_string()));
        }
        let deslotted = self.pending_deslot;
        let speed = (before.speed + after.speed) / 2.0;
        let reward = self.agent.update_reward(speed, after.laps_completed, deslotted);
        self.agent.train(&before.state, &after.state, action, reward)?;

        let diagnostics = self.agent.diagnostics();
        let record = StepRecord {
            iteration: diagnostics.training_iterations,
            state: before.state.to_string(),
            action: action.0,
            next_state: after.state.to_string(),
            speed,
            laps: after.laps_completed,
            deslotted,
            reward,
            total_reward: diagnostics.total_reward,
            probability_to_explore: diagnostics.probability_to_explore,
        };
        debug!(?record, "step complete");
        if let Some(log) = self.log.as_mut() {
            log.serialize(&record)?;
        }
        Ok(())
    }
}

/// The physical track: camera positions, hall sensors and the throttle servo.
pub struct CameraTrack<H: HallSensor, A: Actuator> {
    positions: watch::Receiver<PositionPair>,
    features: TrackFeatures,
    hall: H,
    actuator: A,
    hall_config: HallConfig,
    encoder: SpaceEncoder,
}

impl<H: HallSensor, A: Actuator> CameraTrack<H, A> {
    pub fn new(
        positions: watch::Receiver<PositionPair>,
        features: TrackFeatures,
        hall: H,
        actuator: A,
        hall_config: HallConfig,
        encoder: SpaceEncoder,
    ) -> CameraTrack<H, A> {
        CameraTrack { positions, features, hall, actuator, hall_config, encoder }
    }
}

impl<H: HallSensor, A: Actuator> Track for CameraTrack<H, A> {
    fn measure(&mut self) -> Result<Measurement> {
        match self.positions.has_changed() {
            Ok(true) => {}
            Ok(false) => {
                return Err(SlotCarError::MeasurementUnavailable(String::from("no new camera frame")))
            }
            Err(_) => {
                return Err(SlotCarError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "camera sampler stopped",
                )))
            }
        }
        let (earlier, later) = *self.positions.borrow_and_update();
        let observation = self.features.observe(earlier, later)?;
        let speed_mm_s = cross_validate_speed(
            observation.speed_mm_s,
            observation.time,
            self.hall.latest(),
            &self.hall_config,
        )?;
        let state = self.encoder.clamp_state(
            observation.next.feature.kind.severity(),
            observation.next.distance_mm / 10.0,
            speed_mm_s / 10.0,
        );
        Ok(Measurement {
            state,
            speed: speed_mm_s / 10.0,
            laps_completed: self.hall.laps_completed(),
            deslotted: false,
        })
    }

    fn apply(&mut self, action: Action) -> Result<()> {
        self.actuator.apply(action)
    }

    fn halt(&mut self) -> Result<()> {
        self.actuator.stop()
    }

    fn reset(&mut self) -> Result<()> {
        self.hall.reset_laps();
        self.actuator.stop()
    }
}
