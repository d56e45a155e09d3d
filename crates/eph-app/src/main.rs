use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use eph_app::{ModelChoice, Preset, RunOptions, Scenario, run};
use eph_core::EphConfig;
use eph_core::controller::{BaselineAction, ControlMode};
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "eph",
    version,
    about = "Run EPH swarm simulations headless"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scenario for a fixed number of ticks.
    Run(RunArgs),
    /// Print a built-in scenario as JSON.
    Scenario {
        #[arg(value_enum)]
        name: Preset,
        /// Seed for presets with a random layout.
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Free-energy gradient descent.
    FreeEnergy,
    /// Walk straight along the preferred direction at full force.
    Baseline,
    /// Apply no force at all.
    BaselineZero,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Preset name (scramble, corridor, random) or path to a scenario JSON file.
    #[arg(long, default_value = "scramble")]
    scenario: String,
    #[arg(long, default_value_t = 1000)]
    ticks: u64,
    /// RNG seed; drawn from entropy and logged when absent.
    #[arg(long, env = "EPH_SEED")]
    seed: Option<u64>,
    #[arg(long, value_enum, default_value_t = Mode::FreeEnergy)]
    mode: Mode,
    #[arg(long, value_enum, default_value_t = ModelChoice::None)]
    model: ModelChoice,
    /// Optional EphConfig JSON; missing sections use defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Write JSON-lines telemetry to this file.
    #[arg(long)]
    telemetry: Option<PathBuf>,
    #[arg(long, default_value_t = 10)]
    telemetry_interval: u32,
    #[arg(long, default_value_t = 64)]
    broadcast_capacity: usize,
    /// Print the final report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_command(args),
        Command::Scenario { name, seed } => {
            let scenario = Scenario::preset(name, seed);
            let pretty = serde_json::to_string_pretty(&scenario)
                .context("failed to format scenario JSON")?;
            println!("{pretty}");
            Ok(())
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&PathBuf>) -> Result<EphConfig> {
    let Some(path) = path else {
        return Ok(EphConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse config {}", path.display()))
}

fn run_command(args: RunArgs) -> Result<()> {
    let seed = args.seed.unwrap_or_else(rand::random);
    let mut config = load_config(args.config.as_ref())?;
    config.rng_seed = Some(seed);
    config.telemetry_interval = args.telemetry_interval;
    config.controller.mode = match args.mode {
        Mode::FreeEnergy => ControlMode::FreeEnergy,
        Mode::Baseline => ControlMode::Baseline {
            action: BaselineAction::GoalAligned,
        },
        Mode::BaselineZero => ControlMode::Baseline {
            action: BaselineAction::Zero,
        },
    };
    let scenario = Scenario::resolve(&args.scenario, seed)
        .with_context(|| format!("failed to resolve scenario '{}'", args.scenario))?;
    info!(seed, scenario = %scenario.name, "resolved scenario");

    let report = run(RunOptions {
        scenario,
        config,
        ticks: args.ticks,
        model: args.model,
        telemetry_path: args.telemetry,
        broadcast_capacity: args.broadcast_capacity,
        log_every: 100,
    })?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to format run report")?
        );
    }
    Ok(())
}
