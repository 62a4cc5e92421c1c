// Symbolize task (`spec.md` §4.16): escalate ASan's redzone until the crash
// state stabilizes, then re-run against a symbolized build and update the
// crash row. Grounded on `pingu_core::input_tester::Tester` (the same
// subprocess-and-parse primitive `analyze`/`regression` use) plus
// `pingu_core::asan` for ASan env wiring.

use crate::tasks::config::CommonConfig;
use anyhow::{Context, Result};
use pingu_core::input_tester::Tester;
use std::collections::HashMap;

const MIN_REDZONE: u32 = 16;
const MAX_REDZONE: u32 = 1024;
const STACK_FRAME_COUNT: u32 = 128;

pub async fn run(common: CommonConfig) -> Result<()> {
    let testcase_id = common.testcase_id()?;
    let mut testcase = common.api.get_testcase(testcase_id).await?;

    let build_dir = common.environment.root_dir.join("builds").join("latest");
    let fuzz_target = testcase
        .additional_metadata
        .get("fuzzer_binary_name")
        .and_then(|v| v.as_str())
        .unwrap_or("target")
        .to_owned();
    let target_exe = build_dir.join(&fuzz_target);

    let input_path = common
        .environment
        .root_dir
        .join("analyze")
        .join(testcase_id.to_string())
        .join("inputs")
        .join("testcase");

    let app_args: Vec<String> = testcase
        .minimized_arguments
        .split_whitespace()
        .map(str::to_owned)
        .collect();

    let mut redzone = MIN_REDZONE;
    let mut previous_state: Option<String> = None;

    while redzone <= MAX_REDZONE {
        let mut env: HashMap<String, String> = HashMap::new();
        env.insert("ASAN_OPTIONS".to_owned(), format!("redzone={redzone}"));

        let mut tester = Tester::new(&build_dir, &target_exe, &app_args, &env);
        tester.check_asan_log(true);
        let result = tester
            .test_input(&input_path)
            .await
            .with_context(|| format!("running testcase at redzone={redzone}"))?;

        let state = result
            .crash
            .as_ref()
            .map(|c| c.call_stack.join("\n"))
            .or_else(|| result.asan_log.as_ref().map(|l| l.minimized_stack.join("\n")));

        if let (Some(prev), Some(cur)) = (&previous_state, &state) {
            if prev == cur {
                break;
            }
        }
        previous_state = state;
        redzone = redzone.saturating_mul(2);
    }

    testcase.redzone = redzone.min(MAX_REDZONE);
    if let Some(final_state) = &previous_state {
        testcase.additional_metadata = merge_metadata(
            testcase.additional_metadata.clone(),
            "symbolized_crash_state",
            final_state,
        );
    }
    common.api.update_testcase(&testcase).await?;

    let symbolized_build_dir = common.environment.root_dir.join("builds").join("symbolized");
    if symbolized_build_dir.join(&fuzz_target).exists() {
        let mut env: HashMap<String, String> = HashMap::new();
        env.insert(
            "ASAN_OPTIONS".to_owned(),
            format!(
                "redzone={},malloc_context_size={STACK_FRAME_COUNT},symbolize_inline_frames=1",
                testcase.redzone
            ),
        );
        let mut tester = Tester::new(
            &symbolized_build_dir,
            &symbolized_build_dir.join(&fuzz_target),
            &app_args,
            &env,
        );
        tester.check_asan_log(true);
        let result = tester
            .test_input(&input_path)
            .await
            .context("running testcase against symbolized build")?;

        if let Some(asan) = result.asan_log {
            let crash = pingu_api::model::Crash {
                testcase_id,
                crash_type: asan.fault_type.clone(),
                crash_state: asan.minimized_stack.join("\n"),
                crash_address: String::new(),
                crash_stacktrace: base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    asan.call_stack.join("\n").as_bytes(),
                ),
                unsymbolized_crash_stacktrace: asan.call_stack.join("\n"),
                security_flag: !asan.fault_type.is_empty(),
                security_severity: None,
                crash_revision: 0,
                gestures: testcase.gestures.clone(),
                provenance: Some("symbolize".to_owned()),
            };
            common.api.update_crash(&crash).await?;
        }
    }

    Ok(())
}

fn merge_metadata(mut metadata: serde_json::Value, key: &str, value: &str) -> serde_json::Value {
    if !metadata.is_object() {
        metadata = serde_json::json!({});
    }
    metadata[key] = serde_json::Value::String(value.to_owned());
    metadata
}
