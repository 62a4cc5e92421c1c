// Analyze task (`spec.md` §4.12): reproduce a user-uploaded testcase against
// the nearest known-good build, fill in the crash row, and schedule
// follow-ups. Grounded on the teacher's `tasks/report/generic.rs`
// `test_input`/`CrashReport` pipeline, generalized from "report on an input
// from a queue" into "analyze one already-known testcase".

use crate::crash::{build_crash, elect_main_crash, enqueue_follow_ups, CrashGroup, Reproducibility};
use crate::engine::FuzzCrash;
use crate::error::BotError;
use crate::revision::RevisionList;
use crate::setup::setup_testcase;
use crate::tasks::config::CommonConfig;
use crate::tasks::heartbeat::{HeartbeatData, HeartbeatSender};
use anyhow::{Context, Result};
use pingu_core::input_tester::Tester;
use std::collections::HashMap;

const CRASH_RETRIES: u64 = 3;
const DEFAULT_TEST_TIMEOUT: u64 = 10;

pub async fn run(common: CommonConfig) -> Result<()> {
    let testcase_id = common.testcase_id()?;
    let mut testcase = common.api.get_testcase(testcase_id).await?;

    let job = common.api.get_job(testcase.job_id).await?;
    let project = common.api.get_project(job.project_id).await?;

    let test_timeout = job
        .environment()
        .get("TEST_TIMEOUT")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TEST_TIMEOUT);

    let work_dir = common
        .environment
        .root_dir
        .join("analyze")
        .join(testcase_id.to_string());
    let fuzz_inputs_dir = work_dir.join("inputs");
    tokio::fs::create_dir_all(&fuzz_inputs_dir).await?;

    let materialized = setup_testcase(
        common.storage.as_ref(),
        &testcase,
        &fuzz_inputs_dir,
        &common.environment.root_dir,
        Some(test_timeout),
        &[],
        false,
    )
    .await
    .context("materializing testcase")?;

    let revisions = RevisionList::new(common.api.list_revisions(project.id).await?);
    if revisions.is_empty() {
        return Err(BotError::BuildNotFound {
            revision: 0,
            job: job.id,
        }
        .into());
    }
    // No prior crash row to read a requested `crash_revision` off of yet, so
    // analyze always sets up against the newest known release build.
    let build_revision = revisions.get(revisions.len() - 1).unwrap();

    let build_dir = common
        .environment
        .root_dir
        .join("builds")
        .join(build_revision.to_string());
    let target_exe = materialized
        .fuzz_target
        .as_ref()
        .map(|name| build_dir.join(name))
        .unwrap_or_else(|| build_dir.join("target"));

    if !target_exe.exists() {
        return Err(BotError::BuildSetup {
            revision: build_revision,
            job: job.id,
            reason: format!("missing executable at {}", target_exe.display()),
        }
        .into());
    }

    let timeout = materialized.test_timeout.unwrap_or(test_timeout);
    let env: HashMap<String, String> = HashMap::new();
    let mut tester = Tester::new(&build_dir, &target_exe, &materialized.app_args, &env);
    tester
        .timeout(timeout)
        .check_asan_log(true)
        .check_retry_count(CRASH_RETRIES);

    let test_result = tester
        .test_input(&materialized.path)
        .await
        .context("running testcase against build")?;

    let crash = match &test_result.crash {
        Some(_) => true,
        None => test_result.asan_log.is_some(),
    };

    if !crash {
        testcase.status = pingu_api::model::TestcaseStatus::Unreproducible;
        common.api.update_testcase(&testcase).await?;
        common.heartbeat.send(HeartbeatData::NoReproCrashingInput)?;
        return Ok(());
    }

    let (crash_type, crash_address, crash_state, stacktrace) = match (&test_result.crash, &test_result.asan_log) {
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
        (None, None) => unreachable!("crash flag implies one of crash/asan_log is set"),
    };

    let security_flag = !crash_type.is_empty();
    let security_severity = if security_flag {
        Some("High".to_owned())
    } else {
        None
    };

    let raw = FuzzCrash {
        input_path: materialized.path.clone(),
        crash_time: Some(chrono::Utc::now()),
        return_code: None,
        resource_paths: Vec::new(),
        unsymbolized_stacktrace: stacktrace.clone(),
    };

    let built = build_crash(
        testcase_id,
        &raw,
        crash_type,
        crash_address,
        crash_state,
        stacktrace,
        security_flag,
        build_revision,
        testcase.gestures.clone(),
    );

    let group = CrashGroup {
        crashes: vec![built.clone()],
    };

    let (_elected, reproducibility) = elect_main_crash(&group, |_candidate| {
        let build_dir = build_dir.clone();
        let target_exe = target_exe.clone();
        let app_args = materialized.app_args.clone();
        let env = env.clone();
        let input_path = materialized.path.clone();
        async move {
            let mut t = Tester::new(&build_dir, &target_exe, &app_args, &env);
            t.timeout(timeout).check_asan_log(true);
            let result = t.test_input(&input_path).await?;
            Ok(result.crash.is_some() || result.asan_log.is_some())
        }
    })
    .await?
    .ok_or(BotError::InvalidTestcase(testcase_id))?;

    testcase.one_time_crasher_flag = reproducibility == Reproducibility::OneTimeCrasher;
    testcase.status = pingu_api::model::TestcaseStatus::Processed;

    if security_flag {
        crate::setup::lsan::update_global_blacklist(
            &common.environment.root_dir,
            testcase_id,
            &built.crash_state,
        )
        .await?;
    }

    if let Some(existing) = common
        .api
        .find_testcase(
            project.id,
            &built.crash_type,
            &built.crash_state,
            built.security_flag,
        )
        .await?
    {
        if existing.id != testcase_id {
            testcase.status = pingu_api::model::TestcaseStatus::Duplicate;
        }
    }

    common.api.update_testcase(&testcase).await?;
    let mut crash_row = built;
    crash_row.security_severity = security_severity;
    common.api.add_crash(&crash_row).await?;

    common.heartbeat.send(HeartbeatData::NewReport)?;

    enqueue_follow_ups(&common, &testcase).await?;

    Ok(())
}
