//! `simulate` command implementation.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{info, warn};

use crate::cli::SimulateArgs;
use crate::error::CliError;
use crate::simulation::{generated_course, Simulation, SimulationConfig, SimulationStats};
use contracts::StartType;
use transport::NetworkConditions;

/// Execute the `simulate` command
pub async fn run_simulate(args: &SimulateArgs) -> Result<()> {
    let config = simulation_config(args)?;
    let bp = &config.blueprint;
    info!(
        session = %bp.session.session_id,
        gates = bp.gates.len(),
        distance_m = bp.total_distance_m(),
        start_type = ?bp.session.start_type,
        runs = config.runs,
        drop_rate = config.conditions.drop_rate,
        "Starting simulation"
    );

    let simulation = Simulation::new(config);
    let shutdown_signal = setup_shutdown_signal();

    let stats = tokio::select! {
        result = simulation.run() => result.context("Simulation failed")?,
        _ = shutdown_signal => {
            warn!("Received shutdown signal, stopping simulation...");
            return Ok(());
        }
    };

    if args.json {
        for run in &stats.runs {
            let line = serde_json::to_string(&run.record).context("Failed to serialize run")?;
            println!("{line}");
        }
    } else {
        stats.print_summary();
    }
    check_accuracy(&stats)?;

    info!(
        runs = stats.runs.len(),
        cancelled = stats.runs_cancelled,
        max_error_ms = format!("{:.2}", stats.max_error_ms()),
        "Simulation finished"
    );
    Ok(())
}

fn simulation_config(args: &SimulateArgs) -> Result<SimulationConfig> {
    if args.speed <= 0.0 {
        return Err(CliError::config_validation("speed must be positive").into());
    }
    if !(0.0..1.0).contains(&args.drop_rate) || !(0.0..=1.0).contains(&args.duplicate_rate) {
        return Err(CliError::config_validation("drop rate must lie in [0, 1) and duplicate rate in [0, 1]").into());
    }

    let mut blueprint = match &args.config {
        Some(path) => super::load_blueprint(path)?,
        None => generated_course(args.gates, args.distance, StartType::Flying),
    };
    if let Some(start_type) = args.start_type {
        blueprint.session.start_type = start_type.into();
    }

    Ok(SimulationConfig {
        blueprint,
        runs: args.runs,
        speed_mps: args.speed,
        fps: args.fps,
        conditions: NetworkConditions {
            drop_rate: args.drop_rate,
            duplicate_rate: args.duplicate_rate,
        },
        max_skew_ms: args.max_skew_ms,
        max_drift_ppm: args.max_drift_ppm,
        seed: args.seed,
        timeout: Duration::from_secs(args.timeout),
    })
}

/// Allowance on top of a run's own uncertainty (ms)
const FRAME_TOLERANCE_MS: f64 = 25.0;

/// Fail when a run misses the scripted split by more than its uncertainty allows.
fn check_accuracy(stats: &SimulationStats) -> Result<()> {
    let bad = stats
        .runs
        .iter()
        .filter(|r| r.error_ms().abs() > r.record.uncertainty_ms + FRAME_TOLERANCE_MS)
        .count();
    if bad > 0 {
        return Err(CliError::InaccurateRuns {
            runs: bad,
            total: stats.runs.len(),
            tolerance_ms: FRAME_TOLERANCE_MS,
        }
        .into());
    }
    Ok(())
}

/// Setup Ctrl+C and SIGTERM signal handlers
async fn setup_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    fn args(extra: &[&str]) -> SimulateArgs {
        let mut argv = vec!["sprint-timer", "simulate"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Simulate(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_generated_config() {
        let config = simulation_config(&args(&["--gates", "4", "--start-type", "countdown"])).unwrap();
        assert_eq!(config.blueprint.gates.len(), 4);
        assert_eq!(config.blueprint.session.start_type, StartType::Countdown);
        assert_eq!(config.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_rejects_bad_rates() {
        assert!(simulation_config(&args(&["--drop-rate", "1.0"])).is_err());
        assert!(simulation_config(&args(&["--speed", "0"])).is_err());
    }

    #[test]
    fn test_config_file_overrides_course() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("course.toml");
        let bp = generated_course(2, 60.0, StartType::Manual);
        std::fs::write(&path, config_loader::ConfigLoader::to_toml(&bp).unwrap()).unwrap();

        let config = simulation_config(&args(&["-c", path.to_str().unwrap()])).unwrap();
        assert_eq!(config.blueprint.total_distance_m(), 60.0);
        assert_eq!(config.blueprint.session.start_type, StartType::Manual);
    }

    #[test]
    fn test_missing_config_file() {
        let err = simulation_config(&args(&["-c", "/nonexistent/course.toml"])).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
