//! The `prepare` command: one preparation cycle against a simulated device.

use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tracing::{debug, info};

use nightfall_capture::{
    CaptureError, DeviceCommand, PreparationConfig, PreparationDriver, PreparationHandle,
    SimulatedDevice,
};

pub struct PrepareOptions {
    pub config: PreparationConfig,
    pub target_temperature: Option<f64>,
    pub target_angle: Option<f64>,
    pub temperature: f64,
    pub angle: f64,
    pub enforce_temperature: bool,
    pub preview: bool,
    pub cooling_rate: f64,
    pub rotator_rate: f64,
    pub step_ms: u64,
    pub timeout_seconds: u64,
}

/// Outcome of a simulated preparation.
#[derive(Debug)]
pub struct PrepareOutcome {
    pub generation: u64,
    pub temperature: f64,
    pub angle: f64,
    pub commands: Vec<DeviceCommand>,
}

/// Step the device and forward its notifications until the driver goes away.
fn spawn_device_loop(device: Arc<SimulatedDevice>, handle: PreparationHandle, step: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(step);
        loop {
            interval.tick().await;
            for update in device.step() {
                if handle.device_update(update).is_err() {
                    debug!("preparation driver gone, stopping device loop");
                    return;
                }
            }
        }
    });
}

pub async fn prepare(options: &PrepareOptions) -> Result<PrepareOutcome, CaptureError> {
    let config = options.config.clone();
    config.validate()?;

    let device = Arc::new(
        SimulatedDevice::new(config.clone(), options.temperature, options.angle)
            .with_rates(options.cooling_rate, options.rotator_rate),
    );
    let handle = PreparationDriver::spawn(config, device.clone(), device.clone());
    handle.set_target_temperature(options.target_temperature)?;
    handle.set_target_rotator_angle(options.target_angle)?;
    spawn_device_loop(
        device.clone(),
        handle.clone(),
        Duration::from_millis(options.step_ms.max(1)),
    );

    let generation = handle
        .prepare_with_timeout(
            options.enforce_temperature,
            options.preview,
            Duration::from_secs(options.timeout_seconds),
        )
        .await?;

    let (angle, _) = device.rotator_angle();
    Ok(PrepareOutcome {
        generation,
        temperature: device.temperature(),
        angle,
        commands: device.commands(),
    })
}

pub async fn run(options: PrepareOptions) -> Result<()> {
    info!(
        target_temperature = ?options.target_temperature,
        target_angle = ?options.target_angle,
        enforce_temperature = options.enforce_temperature,
        preview = options.preview,
        "preparing simulated capture"
    );

    let outcome = prepare(&options)
        .await
        .map_err(|e| miette::miette!("preparation failed: {}", e))?;

    println!(
        "prepared (cycle {}): temperature {:.1} °C, rotator {:.2}°",
        outcome.generation, outcome.temperature, outcome.angle
    );
    for command in &outcome.commands {
        println!("  {command:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> PrepareOptions {
        PrepareOptions {
            config: PreparationConfig::default(),
            target_temperature: Some(-10.0),
            target_angle: Some(45.0),
            temperature: 10.0,
            angle: 0.0,
            enforce_temperature: true,
            preview: false,
            cooling_rate: 2.0,
            rotator_rate: 5.0,
            step_ms: 100,
            timeout_seconds: 600,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_reaches_targets() {
        let outcome = prepare(&options()).await.unwrap();

        assert_eq!(outcome.generation, 1);
        assert!(outcome.temperature <= -9.0);
        assert!((outcome.angle - 45.0).abs() <= 0.5);
        assert!(outcome.commands.contains(&DeviceCommand::Temperature(-10.0)));
        assert!(outcome.commands.contains(&DeviceCommand::RotatorAngle(45.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_without_enforcement_skips_cooling() {
        let outcome = prepare(&PrepareOptions {
            enforce_temperature: false,
            target_angle: None,
            ..options()
        })
        .await
        .unwrap();

        assert_eq!(outcome.temperature, 10.0);
        assert!(
            !outcome
                .commands
                .iter()
                .any(|c| matches!(c, DeviceCommand::Temperature(_)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_honours_tighter_tolerance() {
        let outcome = prepare(&PrepareOptions {
            config: PreparationConfig {
                max_temperature_diff: 0.2,
                ..PreparationConfig::default()
            },
            cooling_rate: 0.5,
            target_angle: None,
            ..options()
        })
        .await
        .unwrap();

        assert!((outcome.temperature + 10.0).abs() <= 0.2);
    }

    #[tokio::test]
    async fn test_prepare_rejects_invalid_tolerances() {
        let result = prepare(&PrepareOptions {
            config: PreparationConfig {
                rotator_threshold_arcmin: -1.0,
                ..PreparationConfig::default()
            },
            ..options()
        })
        .await;

        assert!(matches!(result, Err(CaptureError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_times_out_on_stalled_cooler() {
        let result = prepare(&PrepareOptions {
            cooling_rate: 0.0,
            timeout_seconds: 30,
            ..options()
        })
        .await;

        assert_eq!(result.unwrap_err(), CaptureError::Timeout(Duration::from_secs(30)));
    }
}
