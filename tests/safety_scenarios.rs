// Safety behavior against the simulated device, with the monitor loop running
// on virtual time.

use std::sync::Arc;
use std::time::Duration;

use robot_hw_runtime::channel::{Channel, ChannelSettings, SimHandle, SimulatedDevice};
use robot_hw_runtime::config::{LedConfig, MotorConfig, SafetyConfig, SensorConfig};
use robot_hw_runtime::led::{LedController, LedExpression};
use robot_hw_runtime::motor::{Direction, MotorDriver, MotorError};
use robot_hw_runtime::safety::{SafetyAlert, SafetyLevel, SafetyMonitor, emergency_asserted};
use robot_hw_runtime::sensor::{ChannelSensor, DistanceSource};

const PERIOD: Duration = Duration::from_millis(50);

struct Rig {
    handle: SimHandle,
    channel: Channel,
    motor: Arc<MotorDriver>,
    led: Arc<LedController>,
    sensor: Arc<ChannelSensor>,
    monitor: Arc<SafetyMonitor>,
}

async fn rig(safety: SafetyConfig) -> Rig {
    let device = SimulatedDevice::new();
    let handle = device.handle();
    let settings = ChannelSettings {
        boot_settle: Duration::from_millis(10),
        handshake_timeout: Duration::from_millis(500),
        queue_depth: 64,
    };
    let channel = Channel::open_simulated(device, settings).await.unwrap();
    let motor = Arc::new(MotorDriver::new(
        channel.clone(),
        MotorConfig::default(),
        Duration::from_millis(200),
    ));
    let led = Arc::new(LedController::new(channel.clone(), &LedConfig::default()));
    let sensor = Arc::new(ChannelSensor::new(channel.clone(), SensorConfig::default()));
    let monitor = Arc::new(SafetyMonitor::new(safety, motor.clone(), sensor.clone()));
    Rig {
        handle,
        channel,
        motor,
        led,
        sensor,
        monitor,
    }
}

#[tokio::test(start_paused = true)]
async fn test_close_obstacle_triggers_emergency() {
    let rig = rig(SafetyConfig::default()).await;
    rig.monitor.start().unwrap();
    rig.motor.drive(Direction::Forward, 40).await.unwrap();

    rig.handle.set_distance(Some(5.0));
    tokio::time::sleep(PERIOD + Duration::from_millis(5)).await;

    let status = rig.monitor.status();
    assert!(status.active_alerts.contains(&SafetyAlert::ObstacleTooClose));
    assert_eq!(status.level, SafetyLevel::Emergency);
    assert!(rig.motor.status().emergency_stopped);
    assert!(!rig.motor.is_moving());
    rig.monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_obstacle_in_warning_band() {
    let safety = SafetyConfig {
        min_obstacle_distance: 30.0,
        ..SafetyConfig::default()
    };
    let rig = rig(safety).await;
    rig.handle.set_distance(Some(25.0));
    rig.monitor.start().unwrap();

    tokio::time::sleep(PERIOD * 2).await;

    assert_eq!(rig.monitor.level(), SafetyLevel::Warning);
    assert!(!rig.motor.is_emergency_stopped());
    rig.monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_readings_become_communication_lost() {
    let rig = rig(SafetyConfig::default()).await;
    rig.monitor.start().unwrap();
    tokio::time::sleep(PERIOD).await;

    rig.handle.set_distance(None);
    tokio::time::sleep(Duration::from_millis(2200)).await;

    let status = rig.monitor.status();
    assert!(status.active_alerts.contains(&SafetyAlert::CommunicationLost));
    assert_eq!(status.level, SafetyLevel::Danger);
    rig.monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_emergency_counts_once() {
    let rig = rig(SafetyConfig::default()).await;
    rig.monitor.start().unwrap();
    tokio::time::sleep(PERIOD).await;
    let before = rig.monitor.status().emergency_stop_count;

    rig.monitor.manual_emergency_stop().await;

    let status = rig.monitor.status();
    assert!(status.active_alerts.contains(&SafetyAlert::ManualEmergency));
    assert_eq!(status.emergency_stop_count, before + 1);
    rig.monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_resume_refused_while_obstacle_remains() {
    let rig = rig(SafetyConfig::default()).await;
    rig.monitor.start().unwrap();
    rig.handle.set_distance(Some(5.0));
    tokio::time::sleep(PERIOD * 2).await;
    assert_eq!(rig.monitor.level(), SafetyLevel::Emergency);

    assert!(!rig.monitor.resume().await);

    assert_eq!(rig.monitor.level(), SafetyLevel::Emergency);
    assert!(rig.motor.is_emergency_stopped());

    rig.handle.set_distance(Some(120.0));
    assert!(rig.monitor.resume().await);
    assert_eq!(rig.monitor.level(), SafetyLevel::Safe);
    rig.monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_move_while_latched_issues_no_command() {
    let rig = rig(SafetyConfig::default()).await;
    rig.monitor.manual_emergency_stop().await;
    let writes = rig.channel.write_count();

    let result = rig.motor.drive(Direction::Forward, 40).await;

    assert!(matches!(result, Err(MotorError::EmergencyStopped)));
    assert_eq!(rig.channel.write_count(), writes);
}

#[tokio::test(start_paused = true)]
async fn test_detection_within_one_period() {
    let rig = rig(SafetyConfig::default()).await;
    let mut levels = rig.monitor.subscribe();
    rig.monitor.start().unwrap();
    tokio::time::sleep(Duration::from_millis(70)).await;

    rig.handle.set_distance(Some(4.0));
    tokio::time::timeout(PERIOD + Duration::from_millis(5), emergency_asserted(&mut levels))
        .await
        .expect("emergency not asserted within one period");
    assert!(rig.motor.is_emergency_stopped());
    rig.monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_level_never_drops_without_resume() {
    let rig = rig(SafetyConfig::default()).await;
    rig.monitor.start().unwrap();

    // Latch must already be set whenever Emergency is visible
    let observer = {
        let monitor = rig.monitor.clone();
        let motor = rig.motor.clone();
        let mut levels = rig.monitor.subscribe();
        tokio::spawn(async move {
            while levels.changed().await.is_ok() {
                if monitor.status().level == SafetyLevel::Emergency {
                    assert!(motor.is_emergency_stopped());
                }
            }
        })
    };

    let feed = [
        Some(100.0),
        Some(14.0),
        Some(100.0),
        None,
        Some(100.0),
        Some(6.0),
        Some(100.0),
        Some(100.0),
    ];
    let mut previous = SafetyLevel::Safe;
    for distance in feed {
        rig.handle.set_distance(distance);
        tokio::time::sleep(PERIOD + Duration::from_millis(5)).await;
        let level = rig.monitor.level();
        assert!(level >= previous, "{:?} dropped to {:?}", previous, level);
        previous = level;
    }
    assert_eq!(previous, SafetyLevel::Emergency);

    assert!(rig.monitor.resume().await);
    assert_eq!(rig.monitor.level(), SafetyLevel::Safe);

    rig.monitor.stop().await;
    assert!(!observer.is_finished(), "latch observer failed");
    observer.abort();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_channel_in_order() {
    let rig = rig(SafetyConfig::default()).await;
    let before = rig.handle.write_count();

    let mut expected = Vec::new();
    let mut tasks = Vec::new();
    for i in 0..12u8 {
        match i % 3 {
            0 => {
                let motor = rig.motor.clone();
                expected.push(format!("SET_SPEED:{}", 10 + i));
                tasks.push(tokio::spawn(async move {
                    motor.set_speed(10 + i).await.unwrap();
                }));
            }
            1 => {
                let led = rig.led.clone();
                let expression = if i % 2 == 0 {
                    LedExpression::Happy
                } else {
                    LedExpression::Curious
                };
                expected.push(format!("LED_PATTERN:{}", expression.pattern()));
                tasks.push(tokio::spawn(async move {
                    assert!(led.set(expression).await.unwrap());
                }));
            }
            _ => {
                let sensor = rig.sensor.clone();
                expected.push("READ_SENSORS".to_string());
                tasks.push(tokio::spawn(async move {
                    assert_eq!(sensor.read_distance().await.unwrap(), Some(150.0));
                }));
            }
        }
    }
    for task in tasks {
        task.await.unwrap();
    }

    let written = rig.handle.written();
    assert_eq!(written.len() - before, expected.len());
    assert_eq!(written[before..], expected[..]);
}
