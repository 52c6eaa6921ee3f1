use carbon_tracker::parser::aggregate_consumption;
use carbon_tracker::utils::logger::setup_logger;
use carbon_tracker::{EpochLimit, Tracker, TrackerConfig, TrackerError};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::{Command, ExitCode};
use std::time::Duration;

/// Measure the energy use and carbon footprint of a command.
#[derive(Parser, Debug)]
#[command(name = "carbon-tracker", version, about)]
struct Cli {
    /// Directory for the run logs
    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,

    /// Components to monitor: `all` or a comma-separated list
    #[arg(long, default_value = "all")]
    components: String,

    /// Seconds between power samples
    #[arg(long, default_value_t = 10.0)]
    interval: f64,

    /// Print the aggregate of all runs logged in DIR and exit
    #[arg(long, value_name = "DIR", conflicts_with = "command")]
    parse: Option<PathBuf>,

    /// Command to run, after `--`
    #[arg(last = true, required_unless_present = "parse")]
    command: Vec<String>,
}

fn run_command(cli: &Cli) -> Result<ExitCode, TrackerError> {
    let interval = Duration::try_from_secs_f64(cli.interval)
        .map_err(|e| TrackerError::InvalidConfig(format!("invalid interval {}: {}", cli.interval, e)))?;
    let (program, args) = cli
        .command
        .split_first()
        .ok_or_else(|| TrackerError::InvalidConfig("no command given".to_string()))?;

    let mut child = Command::new(program).args(args).spawn()?;
    info!("Started {} as pid {}", program, child.id());

    let config = TrackerConfig::new(1)
        .with_epochs_before_pred(EpochLimit::All)
        .with_monitor_epochs(EpochLimit::All)
        .with_update_interval(interval)
        .with_components(cli.components.as_str())
        .with_pids(vec![std::process::id(), child.id()])
        .with_log_dir(&cli.log_dir);
    let mut tracker = match Tracker::new(config) {
        Ok(tracker) => tracker,
        Err(e) => {
            let _ = child.kill();
            return Err(e);
        }
    };

    if let Err(e) = tracker.epoch_start() {
        error!("Monitoring could not start: {}", e);
        let status = child.wait()?;
        return Ok(exit_code(status.code()));
    }
    let status = child.wait()?;
    if let Err(e) = tracker.epoch_end() {
        error!("{}", e);
    }
    tracker.stop();
    Ok(exit_code(status.code()))
}

fn exit_code(code: Option<i32>) -> ExitCode {
    match code {
        Some(0) => ExitCode::SUCCESS,
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    }
}

fn main() -> ExitCode {
    setup_logger();
    let cli = Cli::parse();

    if let Some(dir) = &cli.parse {
        return match aggregate_consumption(dir) {
            Ok(aggregate) => {
                println!("{aggregate}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    match run_command(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
