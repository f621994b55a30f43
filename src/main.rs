use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use slotcar::agent::{Agent, ExplorationSchedule};
use slotcar::config::{ControlConfig, SlotCarConfig};
use slotcar::control::{ControlCommand, ControlLoop};
use slotcar::logging;
use slotcar::sim::SimulatedTrack;
use slotcar::space::{SpaceEncoder, State};
use slotcar::Result;

/// Command line argument parser.
#[derive(Parser, Debug)]
#[command(about = "Train a Q-learning throttle controller for a slot car", long_about = None)]
pub struct Args {
    /// Path to slot car configuration TOML file.
    config_path: PathBuf,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print state and action counts and the table size.
    Shape,
    /// Print the table column of a six digit state label.
    Index { state: String },
    /// Print the exploration probability after n training iterations.
    Explore { n: u64 },
    /// Train on the simulated track.
    Train {
        #[arg(long)]
        steps: u64,
        /// Wall clock wait per step; the simulation always advances by its own time step.
        #[arg(long)]
        dwell_ms: Option<u64>,
        /// Write the action-value table here when training ends.
        #[arg(long)]
        dump: Option<PathBuf>,
        /// CSV log with one record per trained step.
        #[arg(long)]
        log: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init_logging(args.verbose);
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "slotcar failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = SlotCarConfig::load(&args.config_path)?;

    match args.command {
        Commands::Shape => {
            let encoder = SpaceEncoder::new(&config.state_shape, &config.action_shape)?;
            println!("States: {}", encoder.num_states());
            println!("Actions: {}", encoder.num_actions());
            println!("Table entries: {}", encoder.num_states() * encoder.num_actions());
        }
        Commands::Index { state } => {
            let encoder = SpaceEncoder::new(&config.state_shape, &config.action_shape)?;
            let state: State = state.parse()?;
            println!("{}", encoder.checked_state_index(&state)?);
        }
        Commands::Explore { n } => {
            let schedule = ExplorationSchedule::new(config.learning.max_exploring_iterations)?;
            println!("{:.4}", schedule.probability(n));
        }
        Commands::Train { steps, dwell_ms, dump, log } => {
            train(&config, steps, dwell_ms, dump, log).await?;
        }
    }
    Ok(())
}

async fn train(
    config: &SlotCarConfig,
    steps: u64,
    dwell_ms: Option<u64>,
    dump: Option<PathBuf>,
    log: Option<PathBuf>,
) -> Result<()> {
    let agent = Agent::from_config(config)?;
    let encoder = agent.table().encoder().clone();
    let seed = config.learning.seed.map(|s| s.wrapping_add(1));
    let track = SimulatedTrack::new(config.simulation.clone(), &config.servo, encoder, seed)?;
    let control_config = ControlConfig {
        dwell_ms: dwell_ms.unwrap_or(0),
        auto_resume: true,
    };

    let (control, handle) = ControlLoop::new(agent, track, &control_config);
    let mut control = control.with_step_limit(steps);
    if let Some(path) = &log {
        info!(path = %path.display(), "writing training log");
        control = control.with_log(File::create(path)?);
    }
    handle.send(ControlCommand::Resume);

    let summary = control.run().await?;
    let diagnostics = control.diagnostics();
    println!(
        "Steps: {}  trained: {}  skipped: {}  deslots: {}",
        summary.steps, summary.trained, summary.skipped, summary.deslots
    );
    println!(
        "Total reward: {:.1}  iterations: {}  exploration: {:.4}",
        diagnostics.total_reward, diagnostics.training_iterations, diagnostics.probability_to_explore
    );

    if let Some(path) = &dump {
        info!(path = %path.display(), "writing action-value table");
        control.agent().save_table(path)?;
    }
    Ok(())
}
