// Motor control for the two-wheel differential base
//
// Provides:
// - Direction/speed intents mapped onto the device command set
// - Authoritative motor state with the emergency-stop latch
// - Device telemetry queries over the shared channel

mod driver;

pub use driver::{Direction, MotorDriver, MotorError, MotorState};
