//! Wire-level types exchanged between the scheduler and the runner.
//!
//! These mirror `SchedulerOutput` / `ModelRunnerOutput` / `SamplingParams` from
//! the spec: concrete, serde-free structs rather than duck-typed records, so
//! every field the runner reads is checked at compile time.

use std::collections::{HashMap, HashSet};

/// Greedy sampling is flagged by `temperature == GREEDY_TEMPERATURE` in the
/// dense per-slot array; preserved exactly because the vectorized sampler
/// branches on this sentinel instead of a separate per-row mask.
pub const GREEDY_TEMPERATURE: f32 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingType {
    Greedy,
    Random,
}

/// Immutable sampling policy attached to a request.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub sampling_type: SamplingType,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub min_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub repetition_penalty: f32,
    pub min_tokens: u32,
    pub all_stop_token_ids: HashSet<u32>,
    pub logit_bias: Option<HashMap<u32, f32>>,
    pub allowed_token_ids: Option<Vec<u32>>,
    pub bad_words_token_ids: Option<Vec<Vec<u32>>>,
    pub generator_seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            sampling_type: SamplingType::Greedy,
            temperature: GREEDY_TEMPERATURE,
            top_p: 1.0,
            top_k: 0,
            min_p: 0.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            repetition_penalty: 1.0,
            min_tokens: 0,
            all_stop_token_ids: HashSet::new(),
            logit_bias: None,
            allowed_token_ids: None,
            bad_words_token_ids: None,
            generator_seed: None,
        }
    }
}

/// Persistent, per-`req_id` state the runner owns across steps.
///
/// Corresponds to `CachedRequestState` in the original runner: prompt tokens
/// never change, output tokens are append-only, and `page_ids` tracks the
/// physical pages this request currently owns per KV-cache group.
#[derive(Debug, Clone)]
pub struct CachedRequestState {
    pub req_id: String,
    pub prompt_token_ids: Vec<u32>,
    pub output_token_ids: Vec<u32>,
    pub sampling_params: SamplingParams,
    pub num_computed_tokens: usize,
    pub page_ids: Vec<Vec<u32>>,
}

impl CachedRequestState {
    pub fn new(
        req_id: String,
        prompt_token_ids: Vec<u32>,
        sampling_params: SamplingParams,
        page_ids: Vec<Vec<u32>>,
        num_computed_tokens: usize,
    ) -> Self {
        Self {
            req_id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            sampling_params,
            num_computed_tokens,
            page_ids,
        }
    }

    /// `len(prompt) + len(output)` — total tokens this request will have
    /// computed K/V for once fully processed.
    pub fn num_tokens(&self) -> usize {
        self.prompt_token_ids.len() + self.output_token_ids.len()
    }
}

/// A newly admitted request the scheduler wants the runner to start tracking
/// this step.
#[derive(Debug, Clone)]
pub struct NewRequestData {
    pub req_id: String,
    pub prompt_token_ids: Vec<u32>,
    pub sampling_params: SamplingParams,
    /// Per cache-group physical page ids already allocated for this request.
    pub page_ids: Vec<Vec<u32>>,
    pub num_computed_tokens: usize,
}

/// Incremental update for a request the runner already knows about.
#[derive(Debug, Clone)]
pub struct CachedRequestUpdate {
    pub req_id: String,
    pub num_computed_tokens: usize,
    /// Per cache-group page ids: appended pages if continuing normally, or
    /// the complete replacement set if `resumed_from_preemption`.
    pub new_page_ids: Vec<Vec<u32>>,
    pub resumed_from_preemption: bool,
}

/// Everything the scheduler decided for this step.
#[derive(Debug, Clone, Default)]
pub struct SchedulerOutput {
    pub finished_req_ids: HashSet<String>,
    pub scheduled_new_reqs: Vec<NewRequestData>,
    pub scheduled_cached_reqs: Vec<CachedRequestUpdate>,
    pub num_scheduled_tokens: HashMap<String, usize>,
}

impl SchedulerOutput {
    pub fn total_num_scheduled_tokens(&self) -> usize {
        self.num_scheduled_tokens.values().sum()
    }
}

/// What the runner reports back after a step.
#[derive(Debug, Clone, Default)]
pub struct ModelRunnerOutput {
    /// Slot-ordered list of active request ids this step.
    pub req_ids: Vec<String>,
    pub req_id_to_index: HashMap<String, usize>,
    /// One entry per slot in `req_ids`; empty when the request's prompt had
    /// not yet finished computing this step (a discarded prefill-chunk sample).
    pub sampled_token_ids: Vec<Vec<u32>>,
}

impl ModelRunnerOutput {
    pub fn empty() -> Self {
        Self::default()
    }
}
