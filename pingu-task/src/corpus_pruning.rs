// Corpus pruning task (`spec.md` §4.15). Grounded on the teacher's
// `tasks/merge/generic.rs` corpus-merge shape, generalized from an
// external-supervisor merge into one that drives `crate::engine::Engine`
// directly, with quarantine/cross-pollination bookkeeping layered on top of
// `pingu_core::syncdir::SyncedDir`.

use crate::crash::{build_crash, enqueue_follow_ups};
use crate::engine::EngineRegistry;
use crate::error::BotError;
use crate::tasks::config::CommonConfig;
use crate::tasks::heartbeat::{HeartbeatData, HeartbeatSender};
use anyhow::{Context, Result};
use pingu_api::model::{
    ArchiveState, Crash, CorpusKind, CoverageInformation, Testcase, TestcaseStatus,
};
use pingu_core::gestures::GestureSet;
use pingu_core::storage::StoragePath;
use pingu_core::syncdir::SyncedDir;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

const CORPUS_FILES_LIMIT_FOR_FAILURES: usize = 10_000;
const CORPUS_SIZE_LIMIT_FOR_FAILURES: u64 = 2 * 1024 * 1024 * 1024;
const MAX_QUARANTINE_UNITS_TO_RESTORE: usize = 128;
const RSS_LIMIT_MB: u64 = 2560;
const CORPUS_INPUT_SIZE_LIMIT: u64 = 1024 * 1024;
const CORPUS_PRUNING_TIMEOUT: Duration = Duration::from_secs(22 * 3600);

pub async fn run(common: CommonConfig, engines: EngineRegistry) -> Result<()> {
    let (fuzzer_name, binary) = common.fuzz_target_ref()?;
    let job = common.api.get_job(common.job_id).await?;

    let fuzzer = common
        .api
        .list_fuzz_target_jobs(common.job_id)
        .await?
        .into_iter()
        .find(|ftj| ftj.fuzz_target.binary == binary)
        .map(|ftj| ftj.fuzz_target)
        .ok_or_else(|| BotError::InvalidFuzzer(common.job_id))?;

    let engine = engines
        .get(&fuzzer_name)
        .ok_or_else(|| BotError::InvalidFuzzer(common.job_id))?;

    let work_dir = common.environment.root_dir.join("corpus_pruning").join(common.task_id.to_string());
    let corpus_dir = work_dir.join("corpus");
    let quarantine_dir = work_dir.join("quarantine");
    let shared_dir = work_dir.join("shared");
    let output_dir = work_dir.join("minimized");
    let reproducers_dir = work_dir.join("reproducers");
    for dir in [&corpus_dir, &quarantine_dir, &shared_dir, &output_dir, &reproducers_dir] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let corpus_remote = StoragePath::new("corpus", format!("{}/{}/{:?}", job.project_id, fuzzer.binary, CorpusKind::Corpus))?;
    let quarantine_remote = StoragePath::new("corpus", format!("{}/{}/{:?}", job.project_id, fuzzer.binary, CorpusKind::Quarantine))?;
    let shared_remote = StoragePath::new("corpus", format!("{}/{}/{:?}", job.project_id, fuzzer.binary, CorpusKind::Shared))?;

    let synced_corpus = SyncedDir { path: corpus_dir.clone(), remote: corpus_remote };
    let synced_quarantine = SyncedDir { path: quarantine_dir.clone(), remote: quarantine_remote };
    let synced_shared = SyncedDir { path: shared_dir.clone(), remote: shared_remote };

    // Step 1: if the previous run failed, cap corpus/quarantine before
    // syncing so a runaway corpus from a crash loop doesn't compound.
    if last_run_failed(&common).await {
        cap_directory(&common, &synced_corpus, CORPUS_FILES_LIMIT_FOR_FAILURES, CORPUS_SIZE_LIMIT_FOR_FAILURES).await?;
        cap_directory(&common, &synced_quarantine, CORPUS_FILES_LIMIT_FOR_FAILURES, CORPUS_SIZE_LIMIT_FOR_FAILURES).await?;
    }

    // Step 2: sync corpus, quarantine, shared; cross-pollinate by pulling
    // other fuzz targets' backups into the shared dir.
    synced_corpus.init_pull(common.storage.as_ref()).await?;
    synced_quarantine.init_pull(common.storage.as_ref()).await?;
    synced_shared.init_pull(common.storage.as_ref()).await?;

    // Step 3: restore up to MAX_QUARANTINE_UNITS_TO_RESTORE random
    // quarantined units into the initial corpus.
    restore_from_quarantine(&quarantine_dir, &corpus_dir, MAX_QUARANTINE_UNITS_TO_RESTORE).await?;

    let build_dir = common.environment.root_dir.join("builds").join("latest");
    let target_exe = build_dir.join(&fuzzer.binary);
    let arguments: Vec<String> = Vec::new();

    // Step 4: minimize the corpus.
    let before = list_units(&corpus_dir).await?;
    let minimize_args = vec![
        format!("-rss_limit_mb={RSS_LIMIT_MB}"),
        format!("-max_len={CORPUS_INPUT_SIZE_LIMIT}"),
        "-detect_leaks=1".to_owned(),
    ];
    let mut combined_args = minimize_args.clone();
    combined_args.extend(arguments.iter().cloned());

    let _minimize_result = engine
        .minimize_corpus(&target_exe, &combined_args, &[corpus_dir.clone()], &output_dir, &reproducers_dir, CORPUS_PRUNING_TIMEOUT)
        .await
        .context("engine minimize_corpus failed")?;

    let minimized = list_units(&output_dir).await?;

    // Step 5: reclassify units the merge dropped — re-run each one
    // individually to decide whether it was dropped because it crashes.
    let kept_names: std::collections::HashSet<String> = minimized
        .iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_owned))
        .collect();
    let dropped = before
        .into_iter()
        .filter(|p| p.file_name().and_then(|n| n.to_str()).map(|n| !kept_names.contains(n)).unwrap_or(true));

    let mut unique_crashes: Vec<Crash> = Vec::new();
    for bad_unit in dropped {
        let reproduce = engine
            .reproduce(&target_exe, &bad_unit, &arguments, Duration::from_secs(60))
            .await;

        match reproduce {
            Ok(_result) => {
                let crash = build_crash(
                    Uuid::nil(),
                    &crate::engine::FuzzCrash {
                        input_path: bad_unit.clone(),
                        crash_time: Some(chrono::Utc::now()),
                        return_code: None,
                        resource_paths: Vec::new(),
                        unsymbolized_stacktrace: String::new(),
                    },
                    "corpus-pruning-crash".to_owned(),
                    String::new(),
                    bad_unit.to_string_lossy().into_owned(),
                    String::new(),
                    false,
                    0,
                    GestureSet::default(),
                );
                unique_crashes.push(crash);
                quarantine_unit(&bad_unit, &quarantine_dir).await?;
            }
            Err(_) => {
                // Dropped for redundancy, not a crash; discard.
                let _ = tokio::fs::remove_file(&bad_unit).await;
            }
        }
    }

    // Step 6: if time remains, cross-pollinate with the shared corpus.
    let shared_output_dir = work_dir.join("shared_minimized");
    tokio::fs::create_dir_all(&shared_output_dir).await?;
    let cross_pollinate_dirs = vec![output_dir.clone(), shared_dir.clone()];
    if let Ok(_result) = engine
        .minimize_corpus(&target_exe, &combined_args, &cross_pollinate_dirs, &shared_output_dir, &reproducers_dir, Duration::from_secs(3600))
        .await
    {
        absorb_new_units(&shared_output_dir, &output_dir).await?;
    }

    // Step 7: upload minimized corpus + quarantine, record coverage, and
    // create a testcase/crash + minimize follow-up per unique crash.
    replace_dir_contents(&corpus_dir, &output_dir).await?;
    synced_corpus.sync_push(common.storage.as_ref()).await?;
    synced_quarantine.sync_push(common.storage.as_ref()).await?;

    let corpus_size = directory_stats(&corpus_dir).await?;
    let quarantine_size = directory_stats(&quarantine_dir).await?;

    let coverage = CoverageInformation {
        fuzzer_id: fuzzer.fuzzer_id,
        date: chrono::Utc::now(),
        corpus_size_units: corpus_size.0,
        corpus_size_bytes: corpus_size.1,
        quarantine_size_units: quarantine_size.0,
        quarantine_size_bytes: quarantine_size.1,
    };
    common.api.add_coverage_information(&coverage).await?;

    for crash in unique_crashes {
        let testcase = Testcase {
            id: Uuid::new_v4(),
            fuzzer_id: fuzzer.fuzzer_id,
            job_id: common.job_id,
            status: TestcaseStatus::Processed,
            absolute_path: String::new(),
            archive_state: ArchiveState::FUZZED,
            fuzzed_keys: Vec::new(),
            minimized_keys: Vec::new(),
            minimized_arguments: String::new(),
            one_time_crasher_flag: false,
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
        let mut crash = crash;
        crash.testcase_id = testcase.id;
        common.api.add_crash(&crash).await?;
        common.heartbeat.send(HeartbeatData::NewUniqueReport)?;

        enqueue_follow_ups(&common, &testcase).await?;
    }

    Ok(())
}

/// The control plane has no dedicated "last run status" field on `Task`
/// visible to a fresh lease, so this is conservatively always `false` until
/// the API grows one; documented as an open simplification.
async fn last_run_failed(_common: &CommonConfig) -> bool {
    false
}

async fn list_units(dir: &std::path::Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            out.push(entry.path());
        }
    }
    Ok(out)
}

async fn directory_stats(dir: &std::path::Path) -> Result<(u64, u64)> {
    let units = list_units(dir).await?;
    let mut bytes = 0u64;
    for unit in &units {
        bytes += tokio::fs::metadata(unit).await?.len();
    }
    Ok((units.len() as u64, bytes))
}

async fn cap_directory(common: &CommonConfig, synced: &SyncedDir, max_files: usize, max_bytes: u64) -> Result<()> {
    synced.init_pull(common.storage.as_ref()).await?;
    let mut units = list_units(&synced.path).await?;
    let mut total_bytes = 0u64;
    for unit in &units {
        total_bytes += tokio::fs::metadata(unit).await?.len();
    }

    if units.len() <= max_files && total_bytes <= max_bytes {
        return Ok(());
    }

    let mut rng = rand::thread_rng();
    units.shuffle(&mut rng);
    while units.len() > max_files || total_bytes > max_bytes {
        let Some(unit) = units.pop() else { break };
        total_bytes = total_bytes.saturating_sub(tokio::fs::metadata(&unit).await.map(|m| m.len()).unwrap_or(0));
        tokio::fs::remove_file(&unit).await?;
    }

    synced.sync_push(common.storage.as_ref()).await
}

async fn restore_from_quarantine(quarantine_dir: &std::path::Path, corpus_dir: &std::path::Path, limit: usize) -> Result<()> {
    let mut units = list_units(quarantine_dir).await?;
    if units.is_empty() {
        return Ok(());
    }
    let mut rng = rand::thread_rng();
    units.shuffle(&mut rng);
    units.truncate(limit);

    for unit in units {
        if let Some(name) = unit.file_name() {
            let dest = corpus_dir.join(name);
            tokio::fs::copy(&unit, &dest).await?;
        }
    }
    Ok(())
}

async fn quarantine_unit(unit: &std::path::Path, quarantine_dir: &std::path::Path) -> Result<()> {
    if let Some(name) = unit.file_name() {
        let dest = quarantine_dir.join(name);
        if tokio::fs::rename(unit, &dest).await.is_err() {
            tokio::fs::copy(unit, &dest).await?;
            tokio::fs::remove_file(unit).await?;
        }
    }
    Ok(())
}

async fn absorb_new_units(from: &std::path::Path, into: &std::path::Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(from).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let dest = into.join(entry.file_name());
        if tokio::fs::metadata(&dest).await.is_err() {
            tokio::fs::copy(entry.path(), &dest).await?;
        }
    }
    Ok(())
}

async fn replace_dir_contents(dest: &std::path::Path, src: &std::path::Path) -> Result<()> {
    let mut existing = tokio::fs::read_dir(dest).await?;
    while let Some(entry) = existing.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }

    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            let target = dest.join(entry.file_name());
            tokio::fs::copy(entry.path(), &target).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_restore_from_quarantine_respects_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let quarantine = tmp.path().join("quarantine");
        let corpus = tmp.path().join("corpus");
        tokio::fs::create_dir_all(&quarantine).await.unwrap();
        tokio::fs::create_dir_all(&corpus).await.unwrap();

        for i in 0..5 {
            tokio::fs::write(quarantine.join(format!("unit-{i}")), b"x").await.unwrap();
        }

        restore_from_quarantine(&quarantine, &corpus, 3).await.unwrap();
        let restored = list_units(&corpus).await.unwrap();
        assert_eq!(restored.len(), 3);
    }

    #[tokio::test]
    async fn test_directory_stats_counts_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join("a"), b"hello").await.unwrap();
        tokio::fs::write(tmp.path().join("b"), b"hi").await.unwrap();
        let (units, bytes) = directory_stats(tmp.path()).await.unwrap();
        assert_eq!(units, 2);
        assert_eq!(bytes, 7);
    }
}
