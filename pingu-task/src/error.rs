// The closed error taxonomy the task loop matches on (`spec.md` §7). Every
// other failure stays an ad hoc `anyhow::Error` with `.context(...)`
// annotations; only the kinds a caller actually needs to branch on are
// lifted into this enum.

use pingu_api::PinguApiError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("testcase {0} no longer exists")]
    InvalidTestcase(Uuid),

    #[error("fuzzer {0} no longer exists")]
    InvalidFuzzer(Uuid),

    #[error("build not found for revision {revision} of job {job}")]
    BuildNotFound { revision: u64, job: Uuid },

    #[error("failed to set up build for revision {revision} of job {job}: {reason}")]
    BuildSetup {
        revision: u64,
        job: Uuid,
        reason: String,
    },

    #[error("build for revision {revision} of job {job} is bad: {reason}")]
    BadBuild {
        revision: u64,
        job: Uuid,
        reason: String,
    },

    #[error("invariant violated: {0}")]
    BadState(String),

    #[error("bad config at {path}: {reason}")]
    BadConfig { path: String, reason: String },

    #[error("failed to parse config {path}: {source}")]
    ConfigParseError {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config key {0}")]
    InvalidConfigKey(String),

    #[error("another bot already holds task {0}")]
    AlreadyRunning(Uuid),

    #[error(transparent)]
    PinguApiError(#[from] PinguApiError),

    #[error("failed to tokenize input: {0}")]
    TokenizationFailure(String),

    #[error("minimization deadline exceeded after {0} rounds")]
    MinimizationDeadlineExceeded(usize),

    #[error("no command given")]
    NoCommand,
}

impl BotError {
    /// Bad-build handling during bisection (`spec.md` §4.13 step 5): drop
    /// the offending revision and keep going rather than aborting the task.
    pub fn is_bad_build(&self) -> bool {
        matches!(self, Self::BadBuild { .. })
    }

    /// `spec.md` §4.3: the task loop matches the *formatted* error against
    /// `BOT_ERROR_TERMINATION_LIST`/`BOT_ERROR_HANG_LIST` regex sets loaded
    /// from bot config; this only decides whether the error is otherwise
    /// retryable within the handler itself.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BuildNotFound { .. } | Self::BuildSetup { .. } | Self::PinguApiError(_)
        )
    }
}
