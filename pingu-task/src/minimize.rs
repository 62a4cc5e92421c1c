// Minimize task: shrink a testcase's reproducer down to a smaller input
// that still reproduces the crash (`spec.md` §4.11 follow-up). Grounded on
// `Engine::minimize_corpus` (the only minimization primitive the engine
// abstraction exposes, `spec.md` §4.7) — one testcase is treated as a
// one-file corpus to minimize.

use crate::engine::EngineRegistry;
use crate::error::BotError;
use crate::setup::setup_testcase;
use crate::tasks::config::CommonConfig;
use anyhow::{Context, Result};
use pingu_core::storage::StoragePath;
use std::time::Duration;

const MINIMIZE_TIMEOUT: Duration = Duration::from_secs(3600);

pub async fn run(common: CommonConfig, engines: EngineRegistry) -> Result<()> {
    let testcase_id = common.testcase_id()?;
    let mut testcase = common.api.get_testcase(testcase_id).await?;
    let fuzzer = common.api.get_fuzzer(testcase.fuzzer_id).await?;

    let engine = engines
        .get(&fuzzer.name)
        .ok_or_else(|| BotError::InvalidFuzzer(testcase.fuzzer_id))?;

    let work_dir = common
        .environment
        .root_dir
        .join("minimize")
        .join(testcase_id.to_string());
    let fuzz_inputs_dir = work_dir.join("inputs");
    let output_dir = work_dir.join("minimized");
    let reproducers_dir = work_dir.join("reproducers");
    tokio::fs::create_dir_all(&fuzz_inputs_dir).await?;
    tokio::fs::create_dir_all(&output_dir).await?;
    tokio::fs::create_dir_all(&reproducers_dir).await?;

    let materialized = setup_testcase(
        common.storage.as_ref(),
        &testcase,
        &fuzz_inputs_dir,
        &common.environment.root_dir,
        None,
        &[],
        false,
    )
    .await
    .context("materializing testcase for minimization")?;

    let build_dir = common.environment.root_dir.join("builds").join("latest");
    let fuzz_target_name = materialized
        .fuzz_target
        .clone()
        .unwrap_or_else(|| "target".to_owned());
    let target_exe = build_dir.join(&fuzz_target_name);

    let input_dir = materialized
        .path
        .parent()
        .unwrap_or(&fuzz_inputs_dir)
        .to_path_buf();

    let result = engine
        .minimize_corpus(
            &target_exe,
            &materialized.app_args,
            &[input_dir],
            &output_dir,
            &reproducers_dir,
            MINIMIZE_TIMEOUT,
        )
        .await
        .context("engine minimize_corpus failed")?;

    let mut entries = tokio::fs::read_dir(&output_dir).await?;
    let minimized_file = match entries.next_entry().await? {
        Some(entry) => entry.path(),
        None => {
            warn!("minimize: engine produced no output for testcase {}", testcase_id);
            return Ok(());
        }
    };

    let contents = tokio::fs::read(&minimized_file).await?;
    let key = format!("{testcase_id}/minimized");
    let blob_path = StoragePath::new("blobs", &key)?;
    common.storage.write_data(&blob_path, contents).await?;

    testcase.minimized_keys = vec![key];
    testcase.archive_state |= pingu_api::model::ArchiveState::MINIMIZED;
    common.api.update_testcase(&testcase).await?;

    debug!(
        "minimize: testcase {} minimized ({} log bytes)",
        testcase_id,
        result.logs.len()
    );

    Ok(())
}
