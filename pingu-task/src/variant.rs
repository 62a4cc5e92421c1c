// Variant task (`spec.md` §4.11 follow-up): re-tests an existing testcase
// against a different, compatible job, recording a `TestcaseVariant` row.
// Grounded on `crate::setup::setup_testcase`'s `is_variant` flag (prepend the
// variant job's own app args rather than replacing them) and
// `crate::crash::decide_group_action`'s reproducibility vocabulary.

use crate::setup::setup_testcase;
use crate::tasks::config::CommonConfig;
use anyhow::{Context, Result};
use pingu_api::model::{TestcaseVariant, TestcaseVariantStatus};
use pingu_core::input_tester::Tester;
use std::collections::HashMap;

pub async fn run(common: CommonConfig) -> Result<()> {
    let testcase_id = common.testcase_id()?;
    let testcase = common.api.get_testcase(testcase_id).await?;
    let variant_job = common.api.get_job(common.job_id).await?;

    let work_dir = common
        .environment
        .root_dir
        .join("variant")
        .join(testcase_id.to_string())
        .join(variant_job.id.to_string());
    let fuzz_inputs_dir = work_dir.join("inputs");
    tokio::fs::create_dir_all(&fuzz_inputs_dir).await?;

    let job_app_args: Vec<String> = variant_job
        .environment()
        .get("APP_ARGS")
        .map(|v| v.split_whitespace().map(str::to_owned).collect())
        .unwrap_or_default();

    let materialized = setup_testcase(
        common.storage.as_ref(),
        &testcase,
        &fuzz_inputs_dir,
        &common.environment.root_dir,
        None,
        &job_app_args,
        true,
    )
    .await
    .context("materializing testcase for variant")?;

    let build_dir = common.environment.root_dir.join("builds").join("latest");
    let target_exe = build_dir.join(materialized.fuzz_target.unwrap_or_else(|| "target".to_owned()));

    let env: HashMap<String, String> = HashMap::new();
    let mut tester = Tester::new(&build_dir, &target_exe, &materialized.app_args, &env);
    tester.check_asan_log(true);
    let result = tester
        .test_input(&materialized.path)
        .await
        .context("running testcase under variant job")?;

    let reproduces = result.crash.is_some() || result.asan_log.is_some();

    let status = if reproduces {
        TestcaseVariantStatus::Reproducible
    } else {
        TestcaseVariantStatus::Unreproducible
    };

    match common
        .api
        .get_testcase_variant(testcase_id, variant_job.id)
        .await?
    {
        Some(mut existing) => {
            existing.status = status;
            common.api.update_testcase_variant(&existing).await?;
        }
        None => {
            let variant = TestcaseVariant {
                id: uuid::Uuid::new_v4(),
                testcase_id,
                job_id: variant_job.id,
                status,
            };
            common.api.add_testcase_variant(&variant).await?;
        }
    }

    Ok(())
}
