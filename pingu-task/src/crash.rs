// Crash grouping and creation (`spec.md` §4.10). Grounded on the shape of
// the teacher's `tasks/report/generic.rs` `test_input`/`CrashReport`
// pipeline, generalized from "one input, one report" into the full
// group-then-elect-main-crash algorithm the spec calls for.

use crate::engine::FuzzCrash;
use crate::tasks::config::CommonConfig;
use anyhow::Result;
use chrono::Utc;
use pingu_api::model::{Crash, Task, TaskCommand, TaskStatus, Testcase, TestcaseVariantStatus};
use regex::Regex;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

pub type DedupKey = (String, String, bool);

/// One `(crash_type, crash_state, security_flag)` group awaiting
/// main-crash election (`spec.md` §4.10).
#[derive(Debug, Default)]
pub struct CrashGroup {
    pub crashes: Vec<Crash>,
}

/// `test_for_reproducibility`'s result for one candidate crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reproducibility {
    Reproducible,
    OneTimeCrasher,
}

/// Sorts raw crashes into `(crash_type, crash_state, security_flag)` groups,
/// in first-seen order, dropping crashes a `SEARCH_EXCLUDES`-style filter
/// marks invalid (`spec.md` §4.10).
pub fn group_crashes(crashes: Vec<Crash>, search_excludes: &[Regex]) -> Vec<CrashGroup> {
    let mut groups: BTreeMap<DedupKey, CrashGroup> = BTreeMap::new();
    let mut order: Vec<DedupKey> = Vec::new();

    for crash in crashes {
        if !crash.is_valid(search_excludes) {
            continue;
        }
        let key = crash.dedup_key();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().crashes.push(crash);
    }

    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect()
}

/// Elects the main crash of a group (`spec.md` §4.10 step 1): the first
/// crash for which `reproduce` confirms reproducibility, or — if none
/// reproduce — the first crash in the group, marked a one-time crasher.
/// `reproduce` should retry internally per the `CRASH_RETRIES` budget.
pub async fn elect_main_crash<F, Fut>(
    group: &CrashGroup,
    mut reproduce: F,
) -> Result<Option<(Crash, Reproducibility)>>
where
    F: FnMut(&Crash) -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    for crash in &group.crashes {
        if reproduce(crash).await? {
            return Ok(Some((crash.clone(), Reproducibility::Reproducible)));
        }
    }
    Ok(group
        .crashes
        .first()
        .cloned()
        .map(|crash| (crash, Reproducibility::OneTimeCrasher)))
}

/// The `no existing / existing reproducible / existing flaky` decision
/// matrix of `spec.md` §4.10 step 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDecision {
    Create,
    UpdateVariantOnly,
    Skip,
}

pub fn decide_group_action(
    existing: Option<TestcaseVariantStatus>,
    current: Reproducibility,
) -> GroupDecision {
    use GroupDecision::*;
    use Reproducibility::*;
    match (existing, current) {
        (None, _) => Create,
        (Some(TestcaseVariantStatus::Reproducible), _) => UpdateVariantOnly,
        (Some(TestcaseVariantStatus::Flaky), Reproducible) => Create,
        (Some(TestcaseVariantStatus::Flaky), OneTimeCrasher) => Skip,
        (Some(TestcaseVariantStatus::Pending), _) => Create,
        (Some(TestcaseVariantStatus::Unreproducible), _) => Create,
    }
}

/// `spec.md` §4.11: on a new (non-one-time-crasher) testcase, the
/// dispatcher enqueues these four follow-up commands, in order, plus one
/// `variant` per compatible job.
pub const NEW_TESTCASE_FOLLOW_UPS: &[pingu_api::model::TaskCommand] = &[
    pingu_api::model::TaskCommand::Minimize,
    pingu_api::model::TaskCommand::Regression,
    pingu_api::model::TaskCommand::Impact,
    pingu_api::model::TaskCommand::Progression,
];

pub fn follow_up_commands(testcase: &Testcase) -> &'static [pingu_api::model::TaskCommand] {
    if testcase.one_time_crasher_flag {
        &[pingu_api::model::TaskCommand::Impact]
    } else {
        NEW_TESTCASE_FOLLOW_UPS
    }
}

/// Builds the `Task` row for one follow-up command. The task starts
/// unclaimed: `lease_deadline` in the past means the next `get_next_task`
/// poll is free to pick it up immediately.
pub fn build_follow_up_task(command: TaskCommand, job_id: Uuid, argument: String) -> Task {
    Task {
        id: Uuid::new_v4(),
        command,
        argument,
        job_id,
        status: TaskStatus::Started,
        lease_deadline: Utc::now(),
    }
}

/// `spec.md` §4.11: enqueues the new-testcase follow-up commands, plus one
/// `variant` task per other job the testcase's fuzzer is attached to.
pub async fn enqueue_follow_ups(common: &CommonConfig, testcase: &Testcase) -> Result<()> {
    for command in follow_up_commands(testcase) {
        let task = build_follow_up_task(*command, testcase.job_id, testcase.id.to_string());
        common.api.add_task(&task).await?;
    }

    if !testcase.one_time_crasher_flag {
        for fuzz_target_job in common.api.list_jobs_for_fuzzer(testcase.fuzzer_id).await? {
            if fuzz_target_job.job_id == testcase.job_id {
                continue;
            }
            let task = build_follow_up_task(TaskCommand::Variant, fuzz_target_job.job_id, testcase.id.to_string());
            common.api.add_task(&task).await?;
        }
    }

    Ok(())
}

/// `spec.md` §4.10 step 4: "Sleep 1 s between groups to smooth API
/// pressure."
pub async fn smooth_api_pressure() {
    sleep(Duration::from_secs(1)).await;
}

/// Builds a `Crash` from a raw engine-reported crash plus the stack
/// analyzer's output, the way `archive_testcase_in_blobstore` composes one
/// from a crashing file (`spec.md` §4.10).
pub fn build_crash(
    testcase_id: uuid::Uuid,
    raw: &FuzzCrash,
    crash_type: String,
    crash_address: String,
    crash_state: String,
    symbolized_stacktrace: String,
    security_flag: bool,
    crash_revision: u64,
    gestures: pingu_core::gestures::GestureSet,
) -> Crash {
    Crash {
        testcase_id,
        crash_type,
        crash_state,
        crash_address,
        crash_stacktrace: base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            symbolized_stacktrace.as_bytes(),
        ),
        unsymbolized_crash_stacktrace: raw.unsymbolized_stacktrace.clone(),
        security_flag,
        security_severity: None,
        crash_revision,
        gestures,
        provenance: raw.return_code.map(|rc| format!("return_code={rc}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pingu_core::gestures::GestureSet;
    use uuid::Uuid;

    fn crash(crash_type: &str, crash_state: &str, security_flag: bool) -> Crash {
        Crash {
            testcase_id: Uuid::new_v4(),
            crash_type: crash_type.into(),
            crash_state: crash_state.into(),
            crash_address: "0x0".into(),
            crash_stacktrace: String::new(),
            unsymbolized_crash_stacktrace: String::new(),
            security_flag,
            security_severity: None,
            crash_revision: 1,
            gestures: GestureSet::default(),
            provenance: None,
        }
    }

    #[test]
    fn test_group_crashes_by_dedup_key() {
        let crashes = vec![
            crash("Heap-buffer-overflow", "f0\nf1\n", true),
            crash("Heap-buffer-overflow", "f0\nf1\n", true),
            crash("Null-dereference", "g0\n", false),
        ];
        let groups = group_crashes(crashes, &[]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].crashes.len(), 2);
        assert_eq!(groups[1].crashes.len(), 1);
    }

    #[test]
    fn test_group_crashes_drops_excluded() {
        let mut c = crash("Heap-buffer-overflow", "f0\n", true);
        c.unsymbolized_crash_stacktrace = "ignore_this_frame".into();
        let excludes = vec![Regex::new("ignore_this_frame").unwrap()];
        let groups = group_crashes(vec![c], &excludes);
        assert!(groups.is_empty());
    }

    #[test]
    fn test_group_crashes_drops_empty_state_or_type() {
        let crashes = vec![crash("", "f0\n", true), crash("Type", "", true)];
        assert!(group_crashes(crashes, &[]).is_empty());
    }

    #[tokio::test]
    async fn test_elect_main_crash_first_reproducible_wins() {
        let group = CrashGroup {
            crashes: vec![
                crash("T", "S", true),
                crash("T", "S", true),
            ],
        };
        let mut calls = 0;
        let (elected, repro) = elect_main_crash(&group, |_| {
            calls += 1;
            let reproducible = calls == 2;
            async move { Ok(reproducible) }
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(repro, Reproducibility::Reproducible);
        assert_eq!(elected.crash_type, "T");
    }

    #[tokio::test]
    async fn test_elect_main_crash_falls_back_to_one_time_crasher() {
        let group = CrashGroup {
            crashes: vec![crash("T", "S", true)],
        };
        let (_, repro) = elect_main_crash(&group, |_| async { Ok(false) })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(repro, Reproducibility::OneTimeCrasher);
    }

    #[test]
    fn test_decide_group_action_matrix() {
        assert_eq!(
            decide_group_action(None, Reproducibility::Reproducible),
            GroupDecision::Create
        );
        assert_eq!(
            decide_group_action(
                Some(TestcaseVariantStatus::Reproducible),
                Reproducibility::OneTimeCrasher
            ),
            GroupDecision::UpdateVariantOnly
        );
        assert_eq!(
            decide_group_action(
                Some(TestcaseVariantStatus::Flaky),
                Reproducibility::Reproducible
            ),
            GroupDecision::Create
        );
        assert_eq!(
            decide_group_action(
                Some(TestcaseVariantStatus::Flaky),
                Reproducibility::OneTimeCrasher
            ),
            GroupDecision::Skip
        );
    }
}
