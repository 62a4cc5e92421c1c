#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate pingu_telemetry;

pub mod agent;
pub mod config;
pub mod heartbeat;
pub mod worker;
