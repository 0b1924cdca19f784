pub mod command_spec;
pub mod log_store;
pub mod signals;
pub mod telemetry;
