//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Sprint Timer - multi-device photo-finish timing
#[derive(Parser, Debug)]
#[command(
    name = "sprint-timer",
    author,
    version,
    about = "Multi-device sprint timing",
    long_about = "Times sprints with a host and several camera gates.\n\n\
                  Each gate detects athlete crossings, the devices align their \n\
                  clocks over a lossy network and the host computes segment splits."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "SPRINT_TIMER_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "SPRINT_TIMER_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a host and N gate devices in process and time K sprints
    Simulate(SimulateArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display configuration information
    Info(InfoArgs),
}

/// Arguments for the `simulate` command
#[derive(Parser, Debug, Clone)]
pub struct SimulateArgs {
    /// Session blueprint (TOML or JSON); a generated course is used when absent
    #[arg(short, long, env = "SPRINT_TIMER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of gates on the generated course (start, laps, finish)
    #[arg(long, default_value = "3", value_parser = clap::value_parser!(u32).range(2..=16))]
    pub gates: u32,

    /// Length of the generated course (m)
    #[arg(long, default_value = "30")]
    pub distance: f64,

    /// Override the blueprint start type
    #[arg(long, value_enum)]
    pub start_type: Option<StartTypeArg>,

    /// Number of sprints to time
    #[arg(long, default_value = "3", env = "SPRINT_TIMER_RUNS")]
    pub runs: u32,

    /// Athlete speed (m/s)
    #[arg(long, default_value = "8.0")]
    pub speed: f64,

    /// Camera frame rate (frames/s)
    #[arg(long, default_value = "120")]
    pub fps: u32,

    /// Probability a datagram is lost
    #[arg(long, default_value = "0.05")]
    pub drop_rate: f64,

    /// Probability a delivered datagram arrives twice
    #[arg(long, default_value = "0.02")]
    pub duplicate_rate: f64,

    /// Largest device clock offset from the host (ms)
    #[arg(long, default_value = "250")]
    pub max_skew_ms: u64,

    /// Largest device clock drift (ppm)
    #[arg(long, default_value = "20")]
    pub max_drift_ppm: f64,

    /// Seed for the network and clock skew
    #[arg(long, default_value = "7", env = "SPRINT_TIMER_SEED")]
    pub seed: u64,

    /// Give up on the session after this many seconds
    #[arg(long, default_value = "120", env = "SPRINT_TIMER_TIMEOUT")]
    pub timeout: u64,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "0", env = "SPRINT_TIMER_METRICS_PORT")]
    pub metrics_port: u16,

    /// Print completed runs as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "session.toml", env = "SPRINT_TIMER_CONFIG")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "session.toml", env = "SPRINT_TIMER_CONFIG")]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Show detector thresholds
    #[arg(long)]
    pub detector: bool,

    /// Show sink configuration
    #[arg(long)]
    pub sinks: bool,
}

/// Log output format
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

impl From<LogFormat> for observability::LogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Json => observability::LogFormat::Json,
            LogFormat::Pretty => observability::LogFormat::Pretty,
            LogFormat::Compact => observability::LogFormat::Compact,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartTypeArg {
    Flying,
    Countdown,
    Manual,
}

impl From<StartTypeArg> for contracts::StartType {
    fn from(arg: StartTypeArg) -> Self {
        match arg {
            StartTypeArg::Flying => contracts::StartType::Flying,
            StartTypeArg::Countdown => contracts::StartType::Countdown,
            StartTypeArg::Manual => contracts::StartType::Manual,
        }
    }
}
