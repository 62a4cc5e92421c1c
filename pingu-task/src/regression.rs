// Regression/progression bisection tasks (`spec.md` §4.13). Grounded on the
// teacher's `tasks/regression/generic.rs` `RegressionHandler`/`common::run`
// split, generalized so one driver serves both directions via the shared
// `crate::revision::bisect` binary search.

use crate::crash::build_follow_up_task;
use crate::error::BotError;
use crate::revision::{bisect, BisectionCheckpoint, BisectionOutcome, RevisionList};
use crate::tasks::config::CommonConfig;
use crate::tasks::heartbeat::{HeartbeatData, HeartbeatSender};
use anyhow::{Context, Result};
use pingu_api::model::{TaskCommand, Testcase};
use pingu_core::input_tester::Tester;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(3600);
/// `spec.md` §4.13 step 4: how many of the oldest revisions to probe
/// upfront, regression-only, to drop unusable builds before bisecting.
const EXTREME_REVISIONS_TO_TEST: usize = 3;
/// `spec.md` §4.13 step 6: how many revisions older than the bisected
/// boundary to re-check before committing a regression range.
const REVISIONS_TO_TEST_FOR_VALIDATION: usize = 2;

/// `progression = false` runs a regression search, `true` runs progression.
pub async fn run(common: CommonConfig, progression: bool) -> Result<()> {
    let testcase_id = common.testcase_id()?;
    let mut testcase = common.api.get_testcase(testcase_id).await?;
    let job = common.api.get_job(testcase.job_id).await?;
    let project = common.api.get_project(job.project_id).await?;

    let mut revisions = RevisionList::new(common.api.list_revisions(project.id).await?);
    if revisions.is_empty() {
        return Err(BotError::BuildNotFound {
            revision: 0,
            job: job.id,
        }
        .into());
    }

    let (min_key, max_key) = checkpoint_keys(progression);
    let checkpoint = resume_checkpoint(&testcase, min_key, max_key, revisions.len());
    let fresh_run = checkpoint.is_none();
    let (mut min_index, mut max_index) = checkpoint.unwrap_or((0, revisions.len() - 1));

    // Step 4: regression-only sanity pass over the oldest few revisions,
    // dropping unusable builds before the binary search has to discover the
    // same thing mid-probe. Only on a fresh run: a resumed search already
    // bisected around whatever revisions survived its first pass.
    if !progression && fresh_run {
        prune_bad_extreme_revisions(&common, &testcase, &mut revisions, min_index, EXTREME_REVISIONS_TO_TEST).await;
        max_index = revisions.len() - 1;
    }

    // Step 3: verify the bisection precondition (crash present at the newer
    // bound, absent at the older one), retrying once before giving up.
    if !verify_bounds(&common, &testcase, &revisions, min_index, max_index, progression).await?
        && !verify_bounds(&common, &testcase, &revisions, min_index, max_index, progression).await?
    {
        mark_invalid(&common, &mut testcase, progression).await?;
        return Ok(());
    }

    let deadline = Instant::now() + DEADLINE;
    let revisions_snapshot = revisions.clone();
    let probe = |index: usize| {
        let revisions_snapshot = revisions_snapshot.clone();
        let common = common.clone();
        let testcase = testcase.clone();
        async move {
            let revision = revisions_snapshot
                .get(index)
                .ok_or_else(|| anyhow::anyhow!("revision index out of range"))?;
            probe_revision(&common, &testcase, revision, progression).await
        }
    };

    let outcome = bisect(&mut revisions, min_index, max_index, || Instant::now() >= deadline, probe)
        .await
        .context("bisection failed")?;

    match outcome {
        BisectionOutcome::Converged { min_index, max_index } => {
            // Step 6: regression-only validation pass before committing the
            // range — make sure the crash doesn't already reproduce further
            // back than the bisected boundary.
            if !progression
                && !validate_range(&common, &testcase, &revisions, min_index, REVISIONS_TO_TEST_FOR_VALIDATION).await
            {
                warn!(
                    "regression range for testcase {} failed validation, marking NA",
                    testcase_id
                );
                mark_invalid(&common, &mut testcase, progression).await?;
                return Ok(());
            }

            let min = revisions.get(min_index).unwrap_or(0);
            let max = revisions.get(max_index).unwrap_or(min);
            let range = format!("{min}:{max}");
            if progression {
                testcase.fixed = range;
            } else {
                testcase.regression = range;
            }
            clear_checkpoint(&mut testcase, min_key, max_key);
            common.api.update_testcase(&testcase).await?;
            common.heartbeat.send(HeartbeatData::NewRegressionReport)?;

            // Writing the range triggers impact task creation.
            let impact_task = build_follow_up_task(TaskCommand::Impact, testcase.job_id, testcase.id.to_string());
            common.api.add_task(&impact_task).await?;
        }
        BisectionOutcome::Invalid => {
            mark_invalid(&common, &mut testcase, progression).await?;
        }
        BisectionOutcome::Requeued(checkpoint) => {
            save_checkpoint(&mut testcase, min_key, max_key, checkpoint);
            common.api.update_testcase(&testcase).await?;
            warn!(
                "bisection for testcase {} deadline exceeded, will retry on next lease",
                testcase_id
            );
        }
    }

    Ok(())
}

/// The `additional_metadata` keys a checkpoint for this direction is stored
/// under (`spec.md` §4.13 step 2).
fn checkpoint_keys(progression: bool) -> (&'static str, &'static str) {
    if progression {
        ("last_progression_min", "last_progression_max")
    } else {
        ("last_regression_min", "last_regression_max")
    }
}

fn resume_checkpoint(testcase: &Testcase, min_key: &str, max_key: &str, revision_count: usize) -> Option<(usize, usize)> {
    let min = testcase.additional_metadata.get(min_key)?.as_u64()? as usize;
    let max = testcase.additional_metadata.get(max_key)?.as_u64()? as usize;
    if min < max && max < revision_count {
        Some((min, max))
    } else {
        None
    }
}

fn save_checkpoint(testcase: &mut Testcase, min_key: &str, max_key: &str, checkpoint: BisectionCheckpoint) {
    let mut map = testcase.additional_metadata.as_object().cloned().unwrap_or_default();
    map.insert(min_key.to_owned(), serde_json::json!(checkpoint.min_index));
    map.insert(max_key.to_owned(), serde_json::json!(checkpoint.max_index));
    testcase.additional_metadata = serde_json::Value::Object(map);
}

fn clear_checkpoint(testcase: &mut Testcase, min_key: &str, max_key: &str) {
    if let Some(map) = testcase.additional_metadata.as_object_mut() {
        map.remove(min_key);
        map.remove(max_key);
    }
}

async fn mark_invalid(common: &CommonConfig, testcase: &mut Testcase, progression: bool) -> Result<()> {
    if progression {
        testcase.fixed = "NA".to_owned();
    } else {
        testcase.regression = "NA".to_owned();
    }
    common.api.update_testcase(testcase).await?;
    Ok(())
}

/// `spec.md` §4.13 step 3: the newer bound must reproduce and the older one
/// must not, under the same `probe_revision` transformation the binary
/// search itself uses.
async fn verify_bounds(
    common: &CommonConfig,
    testcase: &Testcase,
    revisions: &RevisionList,
    min_index: usize,
    max_index: usize,
    progression: bool,
) -> Result<bool> {
    let (Some(min_rev), Some(max_rev)) = (revisions.get(min_index), revisions.get(max_index)) else {
        return Ok(false);
    };
    let high = probe_revision(common, testcase, max_rev, progression).await.unwrap_or(false);
    let low = probe_revision(common, testcase, min_rev, progression).await.unwrap_or(true);
    Ok(high && !low)
}

/// `spec.md` §4.13 step 4.
async fn prune_bad_extreme_revisions(
    common: &CommonConfig,
    testcase: &Testcase,
    revisions: &mut RevisionList,
    anchor: usize,
    count: usize,
) {
    let mut bad_indices: Vec<usize> = Vec::new();
    for idx in revisions.nearest(anchor, count) {
        let Some(revision) = revisions.get(idx) else {
            continue;
        };
        if let Err(err) = probe_revision(common, testcase, revision, false).await {
            if matches!(err.downcast_ref::<BotError>(), Some(BotError::BadBuild { .. })) {
                bad_indices.push(idx);
            }
        }
    }
    bad_indices.sort_unstable_by(|a, b| b.cmp(a));
    for idx in bad_indices {
        revisions.remove(idx);
    }
}

/// `spec.md` §4.13 step 6.
async fn validate_range(
    common: &CommonConfig,
    testcase: &Testcase,
    revisions: &RevisionList,
    min_index: usize,
    count: usize,
) -> bool {
    for idx in revisions.nearest(min_index, count) {
        if idx >= min_index {
            continue;
        }
        let Some(revision) = revisions.get(idx) else {
            continue;
        };
        if matches!(probe_revision(common, testcase, revision, false).await, Ok(true)) {
            return false;
        }
    }
    true
}

/// Sets up the build for `revision` and checks whether the testcase
/// reproduces against it, returning `BotError::BadBuild` when the revision
/// itself can't be used (`spec.md` §4.13: "each per-revision test ... is
/// bracketed by a build setup whose output `APP_PATH` must exist").
async fn probe_revision(
    common: &CommonConfig,
    testcase: &pingu_api::model::Testcase,
    revision: u64,
    progression: bool,
) -> Result<bool> {
    let build_dir = common.environment.root_dir.join("builds").join(revision.to_string());
    let fuzz_target = testcase
        .additional_metadata
        .get("fuzzer_binary_name")
        .and_then(|v| v.as_str())
        .unwrap_or("target");
    let target_exe = build_dir.join(fuzz_target);

    if !target_exe.exists() {
        return Err(BotError::BadBuild {
            revision,
            job: testcase.job_id,
            reason: format!("missing executable at {}", target_exe.display()),
        }
        .into());
    }

    let app_args: Vec<String> = testcase
        .minimized_arguments
        .split_whitespace()
        .map(str::to_owned)
        .collect();
    let env: HashMap<String, String> = HashMap::new();
    let mut tester = Tester::new(&build_dir, &target_exe, &app_args, &env);
    tester.check_asan_log(true);

    let testcase_dir = common.environment.root_dir.join("analyze").join(testcase.id.to_string());
    let input_path = testcase_dir.join("inputs").join("testcase");
    let result = tester.test_input(&input_path).await?;
    let reproduces = result.crash.is_some() || result.asan_log.is_some();

    Ok(if progression { !reproduces } else { reproduces })
}
