// Wire types for the control-plane HTTP API. These mirror the rows the
// service itself persists; the bot only ever sees them through this crate.

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use pingu_core::gestures::GestureSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskCommand {
    Analyze,
    Minimize,
    Progression,
    Regression,
    Symbolize,
    Fuzz,
    CorpusPruning,
    Impact,
    Variant,
    Unpack,
    UploadReports,
}

impl TaskCommand {
    /// Single-writer enforcement (`spec.md` §4.3) is waived for these two:
    /// many bots may hold a `fuzz`/`corpus_pruning` task on the same target
    /// at once by design.
    pub fn is_multi_instance(&self) -> bool {
        matches!(self, Self::Fuzz | Self::CorpusPruning)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Started,
    Wip,
    Finished,
    Error,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Task {
    pub id: Uuid,
    pub command: TaskCommand,
    pub argument: String,
    pub job_id: Uuid,
    pub status: TaskStatus,
    pub lease_deadline: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub platform: String,
    pub project_id: Uuid,
    /// Multi-line `KEY = VALUE` pairs the worker overlays onto its own
    /// environment for the duration of a task.
    pub environment_string: String,
}

impl Job {
    /// Parses `environment_string` into a `KEY -> VALUE` map, ignoring blank
    /// lines and lines without a separating `=`.
    pub fn environment(&self) -> HashMap<String, String> {
        self.environment_string
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() {
                    return None;
                }
                let (k, v) = line.split_once('=')?;
                Some((k.trim().to_owned(), v.trim().to_owned()))
            })
            .collect()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    /// YAML configuration written to `config/project.yaml` before the task
    /// runs; kept as the raw document since its schema is project-defined.
    pub yaml_config: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Fuzzer {
    pub id: Uuid,
    pub name: String,
    pub filename: String,
    pub blobstore_path: String,
    pub executable_path: String,
    pub launcher_script: Option<String>,
    pub install_script: Option<String>,
    pub timeout: u64,
    pub max_testcases: u64,
    pub revision: u64,
    pub builtin: bool,
    pub differential: bool,
    pub has_large_testcases: bool,
    pub data_bundle_name: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct FuzzTarget {
    pub fuzzer_id: Uuid,
    pub binary: String,
    pub project_id: Uuid,
}

impl FuzzTarget {
    pub fn qualified_name(&self, project_name: &str) -> String {
        format!("{project_name}/{}", self.binary)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FuzzTargetJob {
    pub fuzz_target: FuzzTarget,
    pub job_id: Uuid,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DataBundle {
    pub id: Uuid,
    pub name: String,
    pub blobstore_path: String,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ArchiveState: u32 {
        const FUZZED = 0b01;
        const MINIMIZED = 0b10;
    }
}

impl Serialize for ArchiveState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for ArchiveState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Ok(ArchiveState::from_bits_truncate(bits))
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestcaseStatus {
    Processed,
    Unreproducible,
    Duplicate,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Testcase {
    pub id: Uuid,
    pub fuzzer_id: Uuid,
    pub job_id: Uuid,
    pub status: TestcaseStatus,
    pub absolute_path: String,
    pub archive_state: ArchiveState,
    pub fuzzed_keys: Vec<String>,
    pub minimized_keys: Vec<String>,
    pub minimized_arguments: String,
    pub one_time_crasher_flag: bool,
    pub timeout_multiplier: f64,
    pub redzone: u32,
    pub gestures: GestureSet,
    pub timestamp: DateTime<Utc>,
    /// `"min:max"` once a regression range is known, else `"NA"`.
    pub regression: String,
    /// `"min:max"` once a progression (fix) range is known, else `"NA"`.
    pub fixed: String,
    pub bug_information: Option<String>,
    pub additional_metadata: serde_json::Value,
    pub open: bool,
}

impl Testcase {
    /// `spec.md` §3/§8 invariant 2: a one-time crasher never carries
    /// bisection/minimization results.
    pub fn is_consistent(&self) -> bool {
        if self.one_time_crasher_flag {
            self.minimized_keys.is_empty() && self.fixed == "NA" && self.regression == "NA"
        } else {
            true
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Crash {
    pub testcase_id: Uuid,
    pub crash_type: String,
    pub crash_state: String,
    pub crash_address: String,
    pub crash_stacktrace: String,
    pub unsymbolized_crash_stacktrace: String,
    pub security_flag: bool,
    pub security_severity: Option<String>,
    pub crash_revision: u64,
    pub gestures: GestureSet,
    pub provenance: Option<String>,
}

impl Crash {
    /// The `(crash_type, crash_state, security_flag)` key grouping and
    /// deduplication are defined against (`spec.md` §4.10/§8 invariant 3).
    pub fn dedup_key(&self) -> (String, String, bool) {
        (
            self.crash_type.clone(),
            self.crash_state.clone(),
            self.security_flag,
        )
    }

    pub fn is_valid(&self, search_excludes: &[regex::Regex]) -> bool {
        if self.crash_state.is_empty() || self.crash_type.is_empty() {
            return false;
        }
        !search_excludes
            .iter()
            .any(|re| re.is_match(&self.unsymbolized_crash_stacktrace))
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestcaseVariantStatus {
    Pending,
    Reproducible,
    Flaky,
    Unreproducible,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TestcaseVariant {
    pub id: Uuid,
    pub testcase_id: Uuid,
    pub job_id: Uuid,
    pub status: TestcaseVariantStatus,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorpusKind {
    Corpus,
    Quarantine,
    Shared,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Trial {
    pub app_name: String,
    pub additional_required_app_args: Vec<String>,
}

/// The supervisor's view of its own registration (`spec.md` §4.1).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Bot {
    pub id: Uuid,
    pub name: String,
    pub pool_name: String,
    /// Set by the control plane once this bot's total allotted run time has
    /// elapsed; the supervisor polls this after every worker exit and shuts
    /// down once it is `true`.
    pub run_timed_out: bool,
}

/// Per-target corpus size snapshot, recorded once per `corpus_pruning` run
/// (`spec.md` §4.15 step 7).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CoverageInformation {
    pub fuzzer_id: Uuid,
    pub date: DateTime<Utc>,
    pub corpus_size_units: u64,
    pub corpus_size_bytes: u64,
    pub quarantine_size_units: u64,
    pub quarantine_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_environment_parses_pairs() {
        let job = Job {
            id: Uuid::nil(),
            name: "job".into(),
            platform: "linux".into(),
            project_id: Uuid::nil(),
            environment_string: "FOO = bar\nBAZ=qux\n\n  \nmalformed-line".into(),
        };
        let env = job.environment();
        assert_eq!(env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(env.get("BAZ").map(String::as_str), Some("qux"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_testcase_consistency() {
        let mut testcase = Testcase {
            id: Uuid::nil(),
            fuzzer_id: Uuid::nil(),
            job_id: Uuid::nil(),
            status: TestcaseStatus::Processed,
            absolute_path: String::new(),
            archive_state: ArchiveState::FUZZED,
            fuzzed_keys: vec!["a".into()],
            minimized_keys: vec![],
            minimized_arguments: String::new(),
            one_time_crasher_flag: true,
            timeout_multiplier: 1.0,
            redzone: 16,
            gestures: GestureSet::default(),
            timestamp: Utc::now(),
            regression: "NA".into(),
            fixed: "NA".into(),
            bug_information: None,
            additional_metadata: serde_json::Value::Null,
            open: true,
        };
        assert!(testcase.is_consistent());

        testcase.fixed = "1:2".into();
        assert!(!testcase.is_consistent());
    }

    #[test]
    fn test_crash_dedup_key() {
        let crash = Crash {
            testcase_id: Uuid::nil(),
            crash_type: "Heap-buffer-overflow".into(),
            crash_state: "frame0\nframe1\n".into(),
            crash_address: "0x0".into(),
            crash_stacktrace: String::new(),
            unsymbolized_crash_stacktrace: String::new(),
            security_flag: true,
            security_severity: None,
            crash_revision: 1,
            gestures: GestureSet::default(),
            provenance: None,
        };
        assert_eq!(
            crash.dedup_key(),
            ("Heap-buffer-overflow".into(), "frame0\nframe1\n".into(), true)
        );
    }
}
