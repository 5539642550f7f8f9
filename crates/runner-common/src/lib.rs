pub type Result<T> = core::result::Result<T, RunnerError>;

#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("not implemented")]
    NotImplemented,
    #[error("{0}")]
    Message(String),
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("unknown request id: {0}")]
    UnknownRequest(String),
    #[error("scheduler protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("forward pass failed: {0}")]
    Forward(String),
}

pub mod config {
    use serde::Deserialize;
    use std::env;
    use std::path::PathBuf;

    #[derive(Debug, Clone, Deserialize)]
    pub struct RunnerConfig {
        pub model_dir: PathBuf,
        pub context_size: Option<usize>,
        pub gpu_layers: Option<usize>,
        pub scheduler_tick_ms: Option<u64>,
        pub max_batch_tokens: Option<usize>,
        /// Maximum number of concurrently batched sequences (slots in the runner's SequenceBuffer).
        pub max_num_seqs: Option<usize>,
        /// KV-cache page size in tokens.
        pub page_size: Option<usize>,
        /// Maximum tokens (prompt + output) a single request may occupy.
        pub max_model_len: Option<usize>,
        /// Maximum total scheduled tokens across all requests in a single step.
        pub max_num_batched_tokens: Option<usize>,
        /// Model vocabulary size; used to size the sampler's allowed-token bitmask and top_k default.
        pub vocab_size: Option<usize>,
        /// Gap (in tokens) between padding buckets beyond the initial power-of-two ramp; 0 means pure doubling.
        pub token_padding_gap: Option<usize>,
    }

    impl Default for RunnerConfig {
        fn default() -> Self {
            Self {
                model_dir: PathBuf::from("models"),
                context_size: Some(2048),
                gpu_layers: None,
                scheduler_tick_ms: Some(2),
                max_batch_tokens: Some(1024),
                max_num_seqs: Some(8),
                page_size: Some(128),
                max_model_len: Some(8192),
                max_num_batched_tokens: Some(2048),
                vocab_size: Some(32000),
                token_padding_gap: Some(0),
            }
        }
    }

    impl RunnerConfig {
        pub fn load() -> Self {
            if let Ok(path) = env::var("RUNNER_CONFIG") {
                let Ok(text) = std::fs::read_to_string(path) else { return Self::default() };
                let Ok(cfg) = serde_yaml::from_str::<RunnerConfig>(&text) else { return Self::default() };
                return cfg;
            }
            let mut cfg = Self::default();
            if let Ok(dir) = env::var("RUNNER_MODEL_DIR") {
                cfg.model_dir = PathBuf::from(dir);
            }
            if let Some(v) = env::var("RUNNER_CONTEXT_SIZE").ok().and_then(|v| v.parse().ok()) { cfg.context_size = Some(v); }
            if let Some(v) = env::var("RUNNER_GPU_LAYERS").ok().and_then(|v| v.parse().ok()) { cfg.gpu_layers = Some(v); }
            if let Some(v) = env::var("RUNNER_TICK_MS").ok().and_then(|v| v.parse().ok()) { cfg.scheduler_tick_ms = Some(v); }
            if let Some(v) = env::var("RUNNER_MAX_BATCH_TOKENS").ok().and_then(|v| v.parse().ok()) { cfg.max_batch_tokens = Some(v); }
            if let Some(v) = env::var("RUNNER_MAX_NUM_SEQS").ok().and_then(|v| v.parse().ok()) { cfg.max_num_seqs = Some(v); }
            if let Some(v) = env::var("RUNNER_PAGE_SIZE").ok().and_then(|v| v.parse().ok()) { cfg.page_size = Some(v); }
            if let Some(v) = env::var("RUNNER_MAX_MODEL_LEN").ok().and_then(|v| v.parse().ok()) { cfg.max_model_len = Some(v); }
            if let Some(v) = env::var("RUNNER_VOCAB_SIZE").ok().and_then(|v| v.parse().ok()) { cfg.vocab_size = Some(v); }
            cfg
        }
    }
}
