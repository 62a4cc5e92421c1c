// Structured event/metric plumbing for the bot.
//
// The task dispatcher and every task handler emit the same small vocabulary
// of structured events regardless of which binary (worker, supervisor,
// heartbeat) is running. This crate only ever talks to the `log` facade: it
// is the caller's `main()` that decides which backend (env_logger,
// flexi_logger, ...) actually renders the lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast::{self, Receiver, Sender};
use uuid::Uuid;

#[macro_use]
extern crate lazy_static;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct InstanceTelemetryKey(Uuid);

impl InstanceTelemetryKey {
    pub fn new(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for InstanceTelemetryKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Worker,
    Supervisor,
    Heartbeat,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Supervisor => "supervisor",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// The structured event vocabulary emitted across the task lifecycle.
/// Named after what fires them (`spec.md` §4.8-§4.16), not after any
/// particular backend.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    task_start,
    task_lease_extended,
    task_status_changed,
    new_crashing_input,
    no_repro_crashing_input,
    new_report,
    new_unique_report,
    new_regression_report,
    corpus_synced,
    bisect_step,
    group_created,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::task_start => "task_start",
            Self::task_lease_extended => "task_lease_extended",
            Self::task_status_changed => "task_status_changed",
            Self::new_crashing_input => "new_crashing_input",
            Self::no_repro_crashing_input => "no_repro_crashing_input",
            Self::new_report => "new_report",
            Self::new_unique_report => "new_unique_report",
            Self::new_regression_report => "new_regression_report",
            Self::corpus_synced => "corpus_synced",
            Self::bisect_step => "bisect_step",
            Self::group_created => "group_created",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventData {
    InstanceId(Uuid),
    JobId(Uuid),
    TaskId(Uuid),
    TestcaseId(Uuid),
    MachineId(Uuid),
    BotName(String),
    Version(String),
    Type(String),
    Command(String),
    Path(String),
    Status(String),
    Count(u64),
    Revision(u64),
    ReturnCode(i32),
    ToolName(String),
    Role(Role),
}

impl EventData {
    pub fn as_values(&self) -> (&str, String) {
        match self {
            Self::InstanceId(x) => ("instance_id", x.to_string()),
            Self::JobId(x) => ("job_id", x.to_string()),
            Self::TaskId(x) => ("task_id", x.to_string()),
            Self::TestcaseId(x) => ("testcase_id", x.to_string()),
            Self::MachineId(x) => ("machine_id", x.to_string()),
            Self::BotName(x) => ("bot_name", x.clone()),
            Self::Version(x) => ("version", x.clone()),
            Self::Type(x) => ("event_type", x.clone()),
            Self::Command(x) => ("command", x.clone()),
            Self::Path(x) => ("path", x.clone()),
            Self::Status(x) => ("status", x.clone()),
            Self::Count(x) => ("count", x.to_string()),
            Self::Revision(x) => ("revision", x.to_string()),
            Self::ReturnCode(x) => ("return_code", x.to_string()),
            Self::ToolName(x) => ("tool_name", x.clone()),
            Self::Role(x) => ("role", x.as_str().to_owned()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub event: Event,
    pub data: Vec<EventData>,
}

lazy_static! {
    static ref EVENT_SOURCE: Sender<LogEvent> = {
        let (tx, _) = broadcast::channel(256);
        tx
    };
}

/// Subscribe to the in-process event stream; used by the metrics/stats
/// uploader to turn structured events into `JobRun`/`TestcaseRun` rows
/// without every call site knowing about the stats sink.
pub fn subscribe_to_events() -> Receiver<LogEvent> {
    EVENT_SOURCE.subscribe()
}

pub fn format_events(events: &[EventData]) -> String {
    events
        .iter()
        .map(|x| x.as_values())
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn track_event(event: &Event, data: &[EventData]) {
    // Ignore send errors: they just mean nobody is currently subscribed.
    let _ = EVENT_SOURCE.send(LogEvent {
        timestamp: Utc::now(),
        event: event.clone(),
        data: data.to_vec(),
    });
}

#[macro_export]
macro_rules! event {
    ($name: expr ; $($k: path = $v: expr),*) => {{
        let mut data = Vec::new();
        $(data.push($k(From::from($v)));)*
        $crate::track_event(&$name, &data);
        log::info!("{} {}", $name.as_str(), $crate::format_events(&data));
    }};
}

/// `metric!` mirrors `event!` so call sites read the same way the teacher's
/// do; in this bot both simply feed the structured-event stream, and it is
/// the stats task (`spec.md` §4.8 step 5) that turns a subset of events into
/// numeric `TestcaseRun`/`JobRun` fields.
#[macro_export]
macro_rules! metric {
    ($name: expr ; $value: expr ; $($k: path = $v: expr),*) => {{
        $crate::event!($name ; $($k = $v),*);
        let _ = $value;
    }};
}

#[macro_export]
macro_rules! verbose {
    ($($arg: tt)+) => {{ log::debug!($($arg)+); }}
}

// `debug!`/`info!`/`warn!`/`error!` shadow `log`'s macros of the same name
// at every call site that does `#[macro_use] extern crate pingu_telemetry`,
// so a future backend change (e.g. adding a hosted trace sink) only touches
// this crate.

#[macro_export]
macro_rules! debug {
    ($($arg: tt)+) => {{ log::debug!($($arg)+); }}
}

#[macro_export]
macro_rules! info {
    ($($arg: tt)+) => {{ log::info!($($arg)+); }}
}

#[macro_export]
macro_rules! warn {
    ($($arg: tt)+) => {{ log::warn!($($arg)+); }}
}

#[macro_export]
macro_rules! error {
    ($($arg: tt)+) => {{ log::error!($($arg)+); }}
}
