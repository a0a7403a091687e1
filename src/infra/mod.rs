pub mod btp;
pub mod chain;
pub mod cli;
pub mod config;
pub mod keys;
pub mod metrics;
pub mod store;
pub mod telemetry;
