use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Complete configuration for the rollout-and-tune loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub sampling: SamplingConfig,
    pub governor: GovernorConfig,
    pub early_stop: EarlyStopConfig,
    pub packing: PackingConfig,
    pub tune: TuneConfig,
    pub run: LoopConfig,
}

/// Inference backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL for the inference server (e.g. "http://localhost:8000/v1").
    pub api_base: String,
    /// API key for bearer authentication (may be filled from the environment).
    pub api_key: String,
    /// Model identifier sent with every request.
    pub model_id: String,
    /// Path or hub id of the base model; used until the first checkpoint lands.
    pub base_checkpoint: String,
    /// Maximum concurrent token throughput the backend advertises. Sizes the
    /// rate governor together with the calibrated completion-length estimate.
    pub token_capacity: u64,
}

/// Sampling options applied to every generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Candidate completions per task (the GRPO group size G, default: 8).
    pub group_size: usize,
    /// Sampling temperature (default: 1.0).
    pub temperature: f64,
    /// Hard cap on completion length in tokens (default: 4096).
    pub max_tokens: usize,
    /// Request per-token log-probabilities (needed for early stopping and
    /// per-token loss weighting; default: true).
    pub logprobs: bool,
    /// Per-request timeout in seconds (default: 600).
    pub request_timeout_secs: u64,
}

/// Rate governor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Headroom multiplier k > 1 applied to the backend token capacity so the
    /// server stays saturated while completions drain unevenly (default: 1.33).
    pub headroom: f64,
    /// Completion-length estimate used before the first iteration has produced
    /// an observed average (default: 1024).
    pub initial_expected_completion_tokens: u64,
}

/// Early-stop monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStopConfig {
    /// EMA smoothing factor alpha in (0, 1) (default: 0.992).
    pub alpha: f64,
    /// EMA threshold below which a stream is abandoned (default: -3.0).
    pub threshold: f64,
    /// Minimum observed tokens before the monitor may trigger (default: 64).
    pub min_tokens: usize,
    /// Whether an early-stopped partial completion is still handed to the
    /// grader. When false the sample is excluded with zero reward and counted
    /// as an early-stop exclusion (default: false).
    pub grade_truncated: bool,
}

/// Sequence packing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackingConfig {
    /// Fixed length of every packed training buffer (default: 8192).
    pub seq_len: usize,
    /// Token id used to fill trailing buffer capacity (default: 0).
    pub pad_token_id: u32,
}

/// Training configuration forwarded to the external fine-tuning step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneConfig {
    /// Learning rate (default: 1e-6).
    pub learning_rate: f64,
    /// PPO-style clipping epsilon (default: 0.2).
    pub clip_epsilon: f64,
    /// Entropy bonus coefficient (default: 0.0).
    pub entropy_coeff: f64,
    /// KL divergence coefficient (default: 0.0).
    pub kl_coeff: f64,
    /// Packed sequences per optimizer step (default: 1).
    pub batch_size: usize,
}

/// Iteration loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Run-scoped output root; iteration directories are created beneath it.
    pub output_dir: PathBuf,
    /// Tasks sampled into each training round (default: 32).
    pub train_batch_size: usize,
    /// Tasks sampled into each validation round (default: 16).
    pub val_batch_size: usize,
    /// Choices per validation task; 1 is enough for a mean-reward signal
    /// (default: 1).
    pub val_group_size: usize,
    /// Optional remote storage target for fire-and-forget sync.
    pub sync_target: Option<String>,
    /// Optional shell command the bundled fine-tuner runs after writing the
    /// packed buffers (the external training step). With no command the
    /// buffers are only written out.
    pub tune_command: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                api_base: "http://localhost:8000/v1".into(),
                api_key: String::new(),
                model_id: "Qwen/Qwen2.5-7B-Instruct".into(),
                base_checkpoint: "Qwen/Qwen2.5-7B-Instruct".into(),
                token_capacity: 131_072,
            },
            sampling: SamplingConfig {
                group_size: 8,
                temperature: 1.0,
                max_tokens: 4096,
                logprobs: true,
                request_timeout_secs: 600,
            },
            governor: GovernorConfig {
                headroom: 1.33,
                initial_expected_completion_tokens: 1024,
            },
            early_stop: EarlyStopConfig {
                alpha: 0.992,
                threshold: -3.0,
                min_tokens: 64,
                grade_truncated: false,
            },
            packing: PackingConfig {
                seq_len: 8192,
                pad_token_id: 0,
            },
            tune: TuneConfig {
                learning_rate: 1e-6,
                clip_epsilon: 0.2,
                entropy_coeff: 0.0,
                kl_coeff: 0.0,
                batch_size: 1,
            },
            run: LoopConfig {
                output_dir: PathBuf::from("runs/default"),
                train_batch_size: 32,
                val_batch_size: 16,
                val_group_size: 1,
                sync_target: None,
                tune_command: None,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Run context
// ---------------------------------------------------------------------------

/// Immutable per-run state threaded through the loop instead of living in
/// process-wide globals. Created once when the run starts.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Random id naming this run in logs and metrics records.
    pub run_id: String,
    /// The run-scoped output root (same as `LoopConfig::output_dir`).
    pub output_dir: PathBuf,
}

impl RunContext {
    /// Create a fresh context with a random run id.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            output_dir: output_dir.into(),
        }
    }
}
