pub mod channel;
pub mod config;
pub mod led;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod safety;
pub mod sensor;
