// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate anyhow;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate pingu_telemetry;

pub mod archive;
pub mod asan;
pub mod env;
pub mod expand;
pub mod fs;
pub mod gestures;
pub mod heartbeat;
pub mod http;
pub mod input_tester;
pub mod jitter;
pub mod machine_id;
pub mod monitor;
pub mod process;
pub mod sanitizer;
pub mod sha256;

#[cfg(target_os = "linux")]
pub mod memory;
pub mod stats;
pub mod storage;
pub mod syncdir;
pub mod system;
pub mod utils;

#[cfg(target_os = "linux")]
pub mod triage;
