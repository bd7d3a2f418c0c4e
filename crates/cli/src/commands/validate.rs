//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{GateRole, TimingBlueprint};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    session_id: String,
    start_type: String,
    gate_count: usize,
    distance_m: f64,
    sink_count: usize,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    match super::load_blueprint(&args.config) {
        Ok(blueprint) => {
            let warnings = collect_warnings(&blueprint);
            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: if warnings.is_empty() {
                    None
                } else {
                    Some(warnings)
                },
                summary: Some(ConfigSummary {
                    version: format!("{:?}", blueprint.version),
                    session_id: blueprint.session.session_id.clone(),
                    start_type: format!("{:?}", blueprint.session.start_type),
                    gate_count: blueprint.gates.len(),
                    distance_m: blueprint.total_distance_m(),
                    sink_count: blueprint.sinks.len(),
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("{e:#}")),
            warnings: None,
            summary: None,
        },
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(blueprint: &TimingBlueprint) -> Vec<String> {
    let mut warnings = Vec::new();

    if blueprint.sinks.is_empty() {
        warnings.push("No sinks configured - completed runs will not be stored".to_string());
    }

    let unbound: Vec<&str> = blueprint
        .gates
        .iter()
        .filter(|g| g.role.is_timing() && g.device_id.is_none())
        .map(|g| g.id.as_str())
        .collect();
    if !unbound.is_empty() {
        warnings.push(format!(
            "Gates without a device are assigned on role request: {}",
            unbound.join(", ")
        ));
    }

    if !blueprint.gates.iter().any(|g| g.role == GateRole::Lap) {
        warnings.push("No lap gates - results have a single segment".to_string());
    }

    let clock_sync = &blueprint.clock_sync;
    if clock_sync.min_samples > clock_sync.burst_size as usize {
        warnings.push(format!(
            "clock_sync.min_samples ({}) exceeds burst_size ({}) - one burst cannot sync a gate",
            clock_sync.min_samples, clock_sync.burst_size
        ));
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Version: {}", summary.version);
            println!("  Session: {}", summary.session_id);
            println!("  Start type: {}", summary.start_type);
            println!("  Gates: {}", summary.gate_count);
            println!("  Distance: {} m", summary.distance_m);
            println!("  Sinks: {}", summary.sink_count);
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}
