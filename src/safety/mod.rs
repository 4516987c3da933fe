// Safety monitoring
//
// - Fixed-cadence scheduler with drift compensation
// - Hazard evaluation, alert bookkeeping and emergency-stop escalation

mod cadence;
mod monitor;

pub use cadence::Cadence;
pub use monitor::{
    SafetyAlert, SafetyError, SafetyLevel, SafetyMonitor, SafetyStats, SafetyStatus,
    emergency_asserted,
};
