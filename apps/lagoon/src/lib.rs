pub mod config;
pub mod engine;
pub mod media;
pub mod room;
pub mod session;
pub mod signaling;
pub mod telemetry;
