#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate pingu_telemetry;

pub mod analyze;
pub mod corpus_pruning;
pub mod crash;
pub mod engine;
pub mod error;
pub mod fuzz;
pub mod impact;
pub mod minimize;
pub mod regression;
pub mod revision;
pub mod setup;
pub mod symbolize;
pub mod tasks;
pub mod unpack;
pub mod upload_reports;
pub mod variant;
