use std::path::Path;

use ensemble_core::{EnsembleError, EnsembleResult};
use serde::{Deserialize, Serialize};

/// Configures retry behaviour for transient step failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries per step before the failure is recorded.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl RetryPolicy {
    /// Computes the backoff delay for a given attempt, capped at
    /// `backoff_max_ms`.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        delay.min(self.backoff_max_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Tunables for the capability router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// How many memory records to retrieve as routing context.
    #[serde(default = "default_memory_top_k")]
    pub memory_top_k: usize,
    /// How far the top keyword score must exceed the runner-up before the
    /// request routes to that agent alone instead of fanning out.
    #[serde(default = "default_dominance_margin")]
    pub dominance_margin: usize,
    /// Agent name to fall back to when keyword scoring finds no signal.
    #[serde(default)]
    pub default_agent: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            memory_top_k: default_memory_top_k(),
            dominance_margin: default_dominance_margin(),
            default_agent: None,
        }
    }
}

/// Tunables for workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-step invocation timeout in milliseconds.
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    /// Wall-clock budget in milliseconds for the whole execution phase.
    /// Time spent suspended in `AwaitingApproval` does not count against it.
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    /// Upper bound on concurrently executing steps; the effective pool is
    /// the smaller of this and the number of planned steps.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Number of discussion rounds for round-robin runs.
    #[serde(default = "default_rounds")]
    pub rounds: usize,
    /// How many approval rejections a human-in-loop run tolerates before
    /// it fails with `ApprovalTimeout`.
    #[serde(default = "default_approval_max_retries")]
    pub approval_max_retries: u32,
    /// When set, a failed sequential step is replaced by an error marker
    /// and the chain continues instead of failing the run.
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout_ms(),
            run_timeout_ms: default_run_timeout_ms(),
            max_workers: default_max_workers(),
            rounds: default_rounds(),
            approval_max_retries: default_approval_max_retries(),
            continue_on_error: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Tunables for the default in-process memory backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Ring-buffer capacity for the ephemeral backend.
    #[serde(default = "default_memory_capacity")]
    pub capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_memory_capacity(),
        }
    }
}

/// Top-level orchestrator configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl OrchestratorConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> EnsembleResult<Self> {
        toml::from_str(raw).map_err(|e| EnsembleError::Config(e.to_string()))
    }

    /// Reads and parses a TOML configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> EnsembleResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }
}

fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_memory_top_k() -> usize {
    5
}
fn default_dominance_margin() -> usize {
    2
}
fn default_step_timeout_ms() -> u64 {
    60_000
}
fn default_run_timeout_ms() -> u64 {
    300_000
}
fn default_max_workers() -> usize {
    16
}
fn default_rounds() -> usize {
    3
}
fn default_approval_max_retries() -> u32 {
    2
}
fn default_memory_capacity() -> usize {
    10_000
}
