// Fuzzing session (`spec.md` §4.8). Grounded on `pingu_core::syncdir::SyncedDir`
// for corpus sync and `crate::engine::Engine` for the fuzz loop itself;
// blackbox/two-stage differential fuzzing (`spec.md` §4.8 steps 6-7) is out
// of scope for this crate — only the engine path (builtin engines registered
// in `EngineRegistry`) is implemented, the way the teacher's `libfuzzer`/
// `coverage` modules were the engine-backed half of its own fuzz task.

use crate::crash::{
    build_crash, decide_group_action, elect_main_crash, enqueue_follow_ups, group_crashes,
    smooth_api_pressure, GroupDecision, Reproducibility,
};
use crate::engine::{EngineRegistry, FuzzOptions};
use crate::error::BotError;
use crate::tasks::config::CommonConfig;
use crate::tasks::heartbeat::{HeartbeatData, HeartbeatSender};
use anyhow::{Context, Result};
use pingu_api::model::{
    ArchiveState, Crash, Testcase, TestcaseStatus, TestcaseVariant, TestcaseVariantStatus,
};
use pingu_core::gestures::GestureSet;
use pingu_core::input_tester::Tester;
use pingu_core::storage::StoragePath;
use pingu_core::syncdir::SyncedDir;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

const MAX_TESTCASES: usize = 5;
const FAIL_WAIT: Duration = Duration::from_secs(60);
const REDZONES: &[u32] = &[16, 32, 64, 128, 256, 512];
const TIMEOUT_MULTIPLIERS: &[f64] = &[0.5, 1.0, 1.5, 2.0, 3.0];
const CRASH_RETRIES: u64 = 3;

struct SessionParams {
    redzone: u32,
    timeout_multiplier: f64,
    ubsan_disabled: bool,
}

fn randomize_session_params() -> SessionParams {
    let mut rng = rand::thread_rng();
    SessionParams {
        redzone: *REDZONES.choose(&mut rng).unwrap(),
        timeout_multiplier: *TIMEOUT_MULTIPLIERS.choose(&mut rng).unwrap(),
        ubsan_disabled: rng.gen_bool(0.10),
    }
}

pub async fn run(common: CommonConfig, engines: EngineRegistry) -> Result<()> {
    let params = randomize_session_params();
    let (fuzzer_name, binary) = common.fuzz_target_ref()?;

    let fuzzer = common
        .api
        .list_fuzz_target_jobs(common.job_id)
        .await?
        .into_iter()
        .find(|ftj| ftj.fuzz_target.binary == binary)
        .map(|ftj| ftj.fuzz_target)
        .ok_or_else(|| BotError::InvalidFuzzer(common.job_id))?;

    let engine = match engines.get(&fuzzer_name) {
        Some(engine) => engine,
        None => {
            warn!("fuzz: no engine registered for {}, sleeping", fuzzer_name);
            tokio::time::sleep(FAIL_WAIT).await;
            return Ok(());
        }
    };

    let job = common.api.get_job(common.job_id).await?;

    let work_dir = common.environment.root_dir.join("fuzz").join(common.task_id.to_string());
    let corpus_dir = work_dir.join("corpus");
    let testcase_dir = work_dir.join("testcases");
    let artifacts_dir = work_dir.join("artifacts");
    for dir in [&corpus_dir, &testcase_dir, &artifacts_dir] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let corpus_remote = StoragePath::new(
        "corpus",
        format!("{}/{}/CORPUS", job.project_id, fuzzer.binary),
    )?;
    let synced_corpus = SyncedDir {
        path: corpus_dir.clone(),
        remote: corpus_remote,
    };
    synced_corpus.init_pull(common.storage.as_ref()).await?;

    let build_dir = common.environment.root_dir.join("builds").join("latest");
    let target_path = build_dir.join(&fuzzer.binary);

    let mut options = engine
        .prepare(&corpus_dir, &target_path, &build_dir, job.project_id, common.task_id)
        .await
        .context("engine prepare failed")?;
    options.arguments.push(format!("-rss_limit_mb={}", 2560));
    if params.ubsan_disabled {
        options.arguments.push("-ubsan=0".to_owned());
    }

    let max_time = engine.fuzz_additional_processing_timeout(&options);
    let mut raw_crashes: Vec<(Crash, PathBuf)> = Vec::new();

    for round in 0..MAX_TESTCASES {
        common.heartbeat.send(HeartbeatData::TaskAlive)?;

        let result = engine
            .fuzz(&target_path, &options, &testcase_dir, &artifacts_dir, max_time)
            .await
            .with_context(|| format!("engine fuzz round {round} failed"))?;

        let empty_env: HashMap<String, String> = HashMap::new();
        for crash in &result.crashes {
            common.heartbeat.send(HeartbeatData::NewCrashingInput)?;

            let mut tester = Tester::new(&build_dir, &target_path, &options.arguments, &empty_env);
            tester.check_asan_log(true);
            let test_result = tester
                .test_input(&crash.input_path)
                .await
                .context("re-testing engine-reported crash")?;

            let (crash_type, crash_address, crash_state, stacktrace) =
                match (&test_result.crash, &test_result.asan_log) {
                    (Some(tc), _) => (
                        tc.crash_type.clone(),
                        tc.crash_site.clone(),
                        tc.call_stack.join("\n"),
                        tc.call_stack.join("\n"),
                    ),
                    (None, Some(asan)) => (
                        asan.fault_type.clone(),
                        String::new(),
                        asan.minimized_stack.join("\n"),
                        asan.call_stack.join("\n"),
                    ),
                    (None, None) => continue,
                };

            let built = build_crash(
                Uuid::nil(),
                crash,
                crash_type,
                crash_address,
                crash_state,
                stacktrace,
                false,
                0,
                GestureSet::default(),
            );
            raw_crashes.push((built, crash.input_path.clone()));
        }

        synced_corpus.sync_push(common.storage.as_ref()).await?;
    }

    process_crashes(
        &common,
        job.project_id,
        fuzzer.fuzzer_id,
        &fuzzer.binary,
        &build_dir,
        &target_path,
        &options.arguments,
        raw_crashes,
    )
    .await?;

    let _ = params.redzone;
    let _ = params.timeout_multiplier;
    let _ = FuzzOptions::default();
    Ok(())
}

/// Re-runs one candidate crash's input against the target to confirm it
/// still reproduces (`spec.md` §4.10 step 1's `test_for_reproducibility`).
async fn test_for_reproducibility(
    build_dir: &Path,
    target_path: &Path,
    arguments: &[String],
    input_path: &Path,
) -> Result<bool> {
    let env: HashMap<String, String> = HashMap::new();
    let mut tester = Tester::new(build_dir, target_path, arguments, &env);
    tester.check_asan_log(true).check_retry_count(CRASH_RETRIES);
    let result = tester
        .test_input(input_path)
        .await
        .context("re-testing crash candidate for reproducibility")?;
    Ok(result.crash.is_some() || result.asan_log.is_some())
}

/// Groups this round's crashes, elects the main crash of each, applies the
/// no-existing/reproducible/flaky decision matrix, and creates a fresh
/// `Testcase`/`Crash` pair (plus follow-up tasks) for newly-seen groups
/// (`spec.md` §4.10).
#[allow(clippy::too_many_arguments)]
async fn process_crashes(
    common: &CommonConfig,
    project_id: Uuid,
    fuzzer_id: Uuid,
    binary: &str,
    build_dir: &Path,
    target_path: &Path,
    arguments: &[String],
    raw_crashes: Vec<(Crash, PathBuf)>,
) -> Result<()> {
    let crashes: Vec<Crash> = raw_crashes.iter().map(|(crash, _)| crash.clone()).collect();
    let input_by_dedup: HashMap<(String, String, bool), PathBuf> = raw_crashes
        .into_iter()
        .map(|(crash, path)| (crash.dedup_key(), path))
        .collect();

    let groups = group_crashes(crashes, &[]);

    for group in groups {
        let elected = elect_main_crash(&group, |candidate| {
            let input_path = input_by_dedup.get(&candidate.dedup_key()).cloned();
            async move {
                match input_path {
                    Some(input_path) => {
                        test_for_reproducibility(build_dir, target_path, arguments, &input_path).await
                    }
                    None => Ok(false),
                }
            }
        })
        .await?;
        let Some((mut crash, reproducibility)) = elected else {
            continue;
        };

        let existing = common
            .api
            .find_testcase(project_id, &crash.crash_type, &crash.crash_state, crash.security_flag)
            .await?;
        let existing_variant_status = match &existing {
            Some(existing_testcase) => common
                .api
                .get_testcase_variant(existing_testcase.id, common.job_id)
                .await?
                .map(|variant| variant.status),
            None => None,
        };

        match decide_group_action(existing_variant_status, reproducibility) {
            GroupDecision::Skip => {}
            GroupDecision::UpdateVariantOnly => {
                if let Some(existing_testcase) = &existing {
                    if let Some(mut variant) = common
                        .api
                        .get_testcase_variant(existing_testcase.id, common.job_id)
                        .await?
                    {
                        variant.status = TestcaseVariantStatus::Reproducible;
                        common.api.update_testcase_variant(&variant).await?;
                    }
                }
            }
            GroupDecision::Create => {
                if let Some(input_path) = input_by_dedup.get(&crash.dedup_key()) {
                    let key = upload_crash_input(common, project_id, binary, input_path).await?;
                    crash.provenance = Some(key);
                }

                let testcase = Testcase {
                    id: Uuid::new_v4(),
                    fuzzer_id,
                    job_id: common.job_id,
                    status: TestcaseStatus::Processed,
                    absolute_path: String::new(),
                    archive_state: ArchiveState::FUZZED,
                    fuzzed_keys: crash.provenance.clone().into_iter().collect(),
                    minimized_keys: Vec::new(),
                    minimized_arguments: String::new(),
                    one_time_crasher_flag: reproducibility == Reproducibility::OneTimeCrasher,
                    timeout_multiplier: 1.0,
                    redzone: 16,
                    gestures: crash.gestures.clone(),
                    timestamp: chrono::Utc::now(),
                    regression: "NA".to_owned(),
                    fixed: "NA".to_owned(),
                    bug_information: None,
                    additional_metadata: serde_json::json!({}),
                    open: true,
                };
                let testcase = common.api.add_testcase(&testcase).await?;
                crash.testcase_id = testcase.id;

                common.api.add_crash(&crash).await?;
                common.heartbeat.send(HeartbeatData::NewUniqueReport)?;

                let variant = TestcaseVariant {
                    id: Uuid::new_v4(),
                    testcase_id: testcase.id,
                    job_id: common.job_id,
                    status: if reproducibility == Reproducibility::Reproducible {
                        TestcaseVariantStatus::Reproducible
                    } else {
                        TestcaseVariantStatus::Flaky
                    },
                };
                common.api.add_testcase_variant(&variant).await?;

                enqueue_follow_ups(common, &testcase).await?;
            }
        }

        smooth_api_pressure().await;
    }

    Ok(())
}

async fn upload_crash_input(
    common: &CommonConfig,
    project_id: Uuid,
    binary: &str,
    input_path: &PathBuf,
) -> Result<String> {
    let contents = tokio::fs::read(input_path).await?;
    let key = format!("{project_id}/{binary}/crashes/{}", Uuid::new_v4());
    let path = StoragePath::new("blobs", &key)?;
    common.storage.write_data(&path, contents).await?;
    Ok(key)
}
