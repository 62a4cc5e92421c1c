// The uniform fuzzing-engine interface (`spec.md` §4.7). Concrete engines
// (libFuzzer, AFL, syzkaller, ...) are out of scope; this crate only defines
// the trait and the registry callers use to look one up by name, the way
// `onefuzz-task`'s coverage/libfuzzer modules were concrete implementations
// of a narrower, engine-specific API.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Debug, Default)]
pub struct FuzzOptions {
    pub arguments: Vec<String>,
    pub strategies: Vec<String>,
    pub corpus_dir: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub struct FuzzCrash {
    pub input_path: PathBuf,
    pub crash_time: Option<chrono::DateTime<chrono::Utc>>,
    pub return_code: Option<i32>,
    pub resource_paths: Vec<PathBuf>,
    pub unsymbolized_stacktrace: String,
}

#[derive(Clone, Debug, Default)]
pub struct FuzzResult {
    pub logs: String,
    pub command: String,
    pub crashes: Vec<FuzzCrash>,
    pub stats: HashMap<String, f64>,
    pub time_executed: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct ReproduceResult {
    pub output: String,
    pub time_executed: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct MinimizeResult {
    pub logs: String,
    pub stats: HashMap<String, f64>,
}

#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn prepare(
        &self,
        corpus_dir: &Path,
        target_path: &Path,
        build_dir: &Path,
        project_id: Uuid,
        fuzz_target_id: Uuid,
    ) -> Result<FuzzOptions>;

    async fn fuzz(
        &self,
        target_path: &Path,
        options: &FuzzOptions,
        testcase_dir: &Path,
        artifacts_dir: &Path,
        max_time: Duration,
    ) -> Result<FuzzResult>;

    async fn reproduce(
        &self,
        target_path: &Path,
        input_path: &Path,
        arguments: &[String],
        max_time: Duration,
    ) -> Result<ReproduceResult>;

    async fn minimize_corpus(
        &self,
        target_path: &Path,
        arguments: &[String],
        input_dirs: &[PathBuf],
        output_dir: &Path,
        reproducers_dir: &Path,
        max_time: Duration,
    ) -> Result<MinimizeResult>;

    /// Time the engine itself needs beyond the raw fuzz call (warmup,
    /// shutdown); deducted from `FUZZ_TEST_TIMEOUT` before it runs
    /// (`spec.md` §4.7).
    fn fuzz_additional_processing_timeout(&self, _options: &FuzzOptions) -> Duration {
        Duration::ZERO
    }
}

/// Engines register themselves here at bot startup (`spec.md` §4.7: "engines
/// are discovered by name via a global registry").
#[derive(Default, Clone)]
pub struct EngineRegistry {
    engines: Arc<RwLock<HashMap<String, Arc<dyn Engine>>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, engine: Arc<dyn Engine>) {
        self.engines
            .write()
            .expect("engine registry lock poisoned")
            .insert(engine.name().to_owned(), engine);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Engine>> {
        self.engines
            .read()
            .expect("engine registry lock poisoned")
            .get(name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopEngine;

    #[async_trait]
    impl Engine for NoopEngine {
        fn name(&self) -> &'static str {
            "noop"
        }

        async fn prepare(
            &self,
            corpus_dir: &Path,
            _target_path: &Path,
            _build_dir: &Path,
            _project_id: Uuid,
            _fuzz_target_id: Uuid,
        ) -> Result<FuzzOptions> {
            Ok(FuzzOptions {
                corpus_dir: corpus_dir.to_path_buf(),
                ..Default::default()
            })
        }

        async fn fuzz(
            &self,
            _target_path: &Path,
            _options: &FuzzOptions,
            _testcase_dir: &Path,
            _artifacts_dir: &Path,
            _max_time: Duration,
        ) -> Result<FuzzResult> {
            Ok(FuzzResult::default())
        }

        async fn reproduce(
            &self,
            _target_path: &Path,
            _input_path: &Path,
            _arguments: &[String],
            _max_time: Duration,
        ) -> Result<ReproduceResult> {
            Ok(ReproduceResult::default())
        }

        async fn minimize_corpus(
            &self,
            _target_path: &Path,
            _arguments: &[String],
            _input_dirs: &[PathBuf],
            _output_dir: &Path,
            _reproducers_dir: &Path,
            _max_time: Duration,
        ) -> Result<MinimizeResult> {
            Ok(MinimizeResult::default())
        }
    }

    #[test]
    fn test_registry_round_trip() {
        let registry = EngineRegistry::new();
        registry.register(Arc::new(NoopEngine));
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
    }
}
