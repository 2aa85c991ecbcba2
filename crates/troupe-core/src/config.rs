//! Engine-wide configuration and default constants.

use std::path::PathBuf;
use std::time::Duration;

/// Retry budget per step when `execution.retry_on_failure` is set.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Fixed backoff between step retries.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

/// Parallel groups settle or die within this window.
pub const DEFAULT_GROUP_TIMEOUT_SECS: u64 = 900;

/// Fixed interval for pause and feedback-resolution polling.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long `wait_for_resolution` blocks before escalating.
pub const DEFAULT_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Escalations per feedback loop before the workflow is paused for
/// manual intervention.
pub const DEFAULT_MAX_ESCALATIONS: u32 = 3;

/// Knobs shared by the executor and the feedback engine.
///
/// Workflow YAML can still override the retry fields per run via its
/// `execution:` block; this struct carries the engine-level defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root for session state, traces, gate records, and metrics.
    /// `None` resolves to `.troupe/` via [`crate::storage::SessionStorage`].
    pub storage_root: Option<PathBuf>,

    /// Context change-history cap (FIFO eviction past this).
    pub history_limit: usize,

    pub poll_interval: Duration,

    pub resolution_timeout: Duration,

    pub max_escalations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_root: None,
            history_limit: crate::context::DEFAULT_HISTORY_LIMIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            resolution_timeout: DEFAULT_RESOLUTION_TIMEOUT,
            max_escalations: DEFAULT_MAX_ESCALATIONS,
        }
    }
}

impl EngineConfig {
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_resolution_timeout(mut self, timeout: Duration) -> Self {
        self.resolution_timeout = timeout;
        self
    }

    pub fn with_max_escalations(mut self, max: u32) -> Self {
        self.max_escalations = max;
        self
    }
}
