//! Nightfall: autonomous observation scheduling
//!
//! Main binary with subcommands:
//! - `plan`: One scheduling pass over a plan file
//! - `night`: Simulate a night of scheduling ticks over a plan file
//! - `prepare`: Run a capture preparation cycle against a simulated device

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use miette::Result;
use nightfall_capture::PreparationConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod night;
mod plan;
mod prepare;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "nightfall")]
#[command(about = "Autonomous observation scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Preparation tolerances.
#[derive(Args, Debug, Clone, PartialEq)]
struct ToleranceArgs {
    /// Temperature band around the target that counts as reached, in °C
    #[arg(long, env = "NIGHTFALL_MAX_TEMPERATURE_DIFF", default_value = "1.0")]
    max_temperature_diff: f64,

    /// Rotator band around the target that counts as reached, in arc-minutes
    #[arg(long, env = "NIGHTFALL_ROTATOR_THRESHOLD_ARCMIN", default_value = "30.0")]
    rotator_threshold_arcmin: f64,

    /// Smallest temperature change the device reports, in °C
    #[arg(long, env = "NIGHTFALL_TEMPERATURE_CHANGE_THRESHOLD", default_value = "0.1")]
    temperature_change_threshold: f64,

    /// Smallest rotator change the device reports, in degrees
    #[arg(long, env = "NIGHTFALL_ROTATOR_CHANGE_THRESHOLD", default_value = "0.1")]
    rotator_change_threshold: f64,
}

impl From<ToleranceArgs> for PreparationConfig {
    fn from(args: ToleranceArgs) -> Self {
        Self {
            max_temperature_diff: args.max_temperature_diff,
            rotator_threshold_arcmin: args.rotator_threshold_arcmin,
            temperature_change_threshold: args.temperature_change_threshold,
            rotator_change_threshold: args.rotator_change_threshold,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scheduling pass and print the schedule
    Plan {
        /// Plan file (JSON)
        #[arg(value_name = "FILE", env = "NIGHTFALL_PLAN")]
        file: PathBuf,

        /// Evaluation time (RFC 3339); defaults to the file's `now`, then the clock
        #[arg(long, env = "NIGHTFALL_NOW")]
        now: Option<DateTime<Utc>>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Simulate a night: tick the scheduler and start, stop and complete jobs
    Night {
        /// Plan file (JSON)
        #[arg(value_name = "FILE", env = "NIGHTFALL_PLAN")]
        file: PathBuf,

        /// Start of the simulated night (RFC 3339)
        #[arg(long, env = "NIGHTFALL_NOW")]
        now: Option<DateTime<Utc>>,

        /// Length of the simulated night in hours
        #[arg(long, env = "NIGHTFALL_NIGHT_HOURS", default_value = "12")]
        hours: u32,

        /// Scheduler tick in seconds
        #[arg(long, env = "NIGHTFALL_TICK_SECONDS", default_value = "60")]
        tick_seconds: u32,
    },

    /// Prepare a light frame capture on a simulated camera and rotator
    Prepare {
        /// Target CCD temperature in °C
        #[arg(long, env = "NIGHTFALL_TARGET_TEMPERATURE", allow_hyphen_values = true)]
        target_temperature: Option<f64>,

        /// Target rotator angle in degrees
        #[arg(long, env = "NIGHTFALL_TARGET_ANGLE")]
        target_angle: Option<f64>,

        /// Initial simulated CCD temperature in °C
        #[arg(long, default_value = "20", allow_hyphen_values = true)]
        temperature: f64,

        /// Initial simulated rotator angle in degrees
        #[arg(long, default_value = "0")]
        angle: f64,

        /// Enforce the target temperature.
        /// Accepts 1/true/yes/on or 0/false/no/off (case-insensitive).
        #[arg(long, env = "NIGHTFALL_ENFORCE_TEMPERATURE", value_parser = parse_bool_env, default_value = "true")]
        enforce_temperature: bool,

        /// Prepare a preview frame instead of a sequence capture
        #[arg(long, env = "NIGHTFALL_PREVIEW", value_parser = parse_bool_env, default_value = "false")]
        preview: bool,

        /// Cooler speed in °C per simulation step
        #[arg(long, default_value = "1.0")]
        cooling_rate: f64,

        /// Rotator speed in degrees per simulation step
        #[arg(long, default_value = "5.0")]
        rotator_rate: f64,

        /// Simulation step in milliseconds
        #[arg(long, default_value = "100")]
        step_ms: u64,

        /// Give up after this many seconds
        #[arg(long, env = "NIGHTFALL_PREPARE_TIMEOUT", default_value = "600")]
        timeout_seconds: u64,

        #[command(flatten)]
        tolerances: ToleranceArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "nightfall=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { file, now, json } => plan::run(&file, now, json).await,

        Commands::Night {
            file,
            now,
            hours,
            tick_seconds,
        } => night::run(&file, now, hours, tick_seconds).await,

        Commands::Prepare {
            target_temperature,
            target_angle,
            temperature,
            angle,
            enforce_temperature,
            preview,
            cooling_rate,
            rotator_rate,
            step_ms,
            timeout_seconds,
            tolerances,
        } => {
            prepare::run(prepare::PrepareOptions {
                config: tolerances.into(),
                target_temperature,
                target_angle,
                temperature,
                angle,
                enforce_temperature,
                preview,
                cooling_rate,
                rotator_rate,
                step_ms,
                timeout_seconds,
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_env() {
        assert_eq!(parse_bool_env("YES"), Ok(true));
        assert_eq!(parse_bool_env("off"), Ok(false));
        assert_eq!(parse_bool_env(""), Ok(false));
        assert!(parse_bool_env("maybe").is_err());
    }

    #[test]
    fn test_cli_parses_plan() {
        let cli = Cli::try_parse_from([
            "nightfall",
            "plan",
            "tonight.json",
            "--now",
            "2026-03-01T20:00:00Z",
            "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Plan { file, now, json } => {
                assert_eq!(file, PathBuf::from("tonight.json"));
                assert_eq!(now.map(|t| t.to_rfc3339()), Some("2026-03-01T20:00:00+00:00".to_string()));
                assert!(json);
            }
            _ => panic!("expected plan command"),
        }
    }

    #[test]
    fn test_cli_parses_prepare_tolerances() {
        let cli = Cli::try_parse_from([
            "nightfall",
            "prepare",
            "--target-temperature",
            "-10",
            "--max-temperature-diff",
            "0.5",
            "--rotator-threshold-arcmin",
            "6",
        ])
        .unwrap();
        match cli.command {
            Commands::Prepare {
                target_temperature,
                tolerances,
                ..
            } => {
                assert_eq!(target_temperature, Some(-10.0));
                let config = PreparationConfig::from(tolerances);
                assert_eq!(config.max_temperature_diff, 0.5);
                assert_eq!(config.rotator_threshold_arcmin, 6.0);
                assert_eq!(
                    config.temperature_change_threshold,
                    PreparationConfig::default().temperature_change_threshold
                );
            }
            _ => panic!("expected prepare command"),
        }
    }
}
