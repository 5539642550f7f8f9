//! A minimal continuous-batching front door: an admission queue plus a
//! background tick loop that feeds [`Runner::execute_model`] and reports
//! finished generations back to callers.
//!
//! This is deliberately *not* the scheduler spec.md treats as an external
//! collaborator — it has no priority policy, no preemption, and no
//! prefill chunking (every admitted request's whole prompt is scheduled in
//! a single step, the S1 pattern the runner's own tests exercise). It is
//! the simplest admission policy that can drive the real `Runner` instead
//! of bypassing it, so the HTTP surface and CLI exercise the same
//! continuous-batching core the tests do.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use runner_backend::InferenceBackend;
use runner_common::config::RunnerConfig;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use crate::forward_adapter::BackendForwardPass;
use crate::padding::PaddingPolicy;
use crate::runner::Runner;
use crate::types::{CachedRequestUpdate, NewRequestData, SamplingParams, SchedulerOutput};

/// Derived, concrete sizing the engine and its `Runner` agree on. Built from
/// `RunnerConfig`'s `Option<T>` fields, falling back to their defaults.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub max_num_seqs: usize,
    pub max_model_len: usize,
    pub vocab_size: usize,
    pub page_size: usize,
    pub max_num_pages_per_req: usize,
    pub token_padding_gap: usize,
    pub tick: Duration,
}

impl EngineConfig {
    pub fn from_runner_config(cfg: &RunnerConfig) -> Self {
        let max_num_seqs = cfg.max_num_seqs.unwrap_or(8);
        let max_model_len = cfg.max_model_len.unwrap_or(8192);
        let page_size = cfg.page_size.unwrap_or(128);
        Self {
            max_num_seqs,
            max_model_len,
            vocab_size: cfg.vocab_size.unwrap_or(32000),
            page_size,
            max_num_pages_per_req: max_model_len.div_ceil(page_size),
            token_padding_gap: cfg.token_padding_gap.unwrap_or(0),
            tick: Duration::from_millis(cfg.scheduler_tick_ms.unwrap_or(2)),
        }
    }
}

/// A finite pool of physical page ids, handed out to admitted requests and
/// returned once a request finishes. Not a real KV-cache allocator (no
/// spill, no defragmentation) — it exists so the engine can hand `Runner`
/// concrete `page_ids` without a real device-backed cache behind it.
struct PagePool {
    free: Vec<u32>,
}

impl PagePool {
    fn new(total_pages: u32) -> Self {
        Self { free: (0..total_pages).rev().collect() }
    }

    fn try_reserve(&mut self, n: usize) -> Option<Vec<u32>> {
        if self.free.len() < n {
            return None;
        }
        Some((0..n).map(|_| self.free.pop().unwrap()).collect())
    }

    fn release(&mut self, pages: Vec<u32>) {
        self.free.extend(pages);
    }
}

struct QueuedRequest {
    req_id: String,
    prompt_tokens: Vec<u32>,
    sampling_params: SamplingParams,
    max_new_tokens: usize,
    respond: oneshot::Sender<String>,
}

struct InFlight {
    pages: Vec<u32>,
    max_new_tokens: usize,
    respond: Option<oneshot::Sender<String>>,
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<QueuedRequest>,
    backend: Arc<dyn InferenceBackend>,
    next_id: Arc<AtomicUsize>,
    pub queue_depth: Arc<AtomicUsize>,
    pub last_batch_size: Arc<AtomicUsize>,
    pub pages_in_use: Arc<AtomicUsize>,
    pub pages_total: usize,
}

impl EngineHandle {
    /// Tokenizes `prompt`, enqueues it for admission, and waits for the
    /// engine to either finish generating or reject it for lack of
    /// capacity. Returns the detokenized completion text.
    pub async fn generate(&self, prompt: &str, sampling_params: SamplingParams, max_new_tokens: usize) -> String {
        let prompt_tokens = match self.backend.tokenize(prompt) {
            Ok(tokens) => tokens,
            Err(_) => return String::new(),
        };
        let req_id = format!("req-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let queued = QueuedRequest { req_id, prompt_tokens, sampling_params, max_new_tokens, respond: tx };
        if self.tx.send(queued).await.is_err() {
            return String::from("ENGINE_UNAVAILABLE");
        }
        rx.await.unwrap_or_else(|_| String::from("ENGINE_DROPPED"))
    }
}

/// Owns the `Runner` and drives it on a fixed tick from a background task.
/// `Runner` itself is the single-threaded cooperative driver the spec
/// describes (§5); the tick task is that one driver, never entered
/// concurrently from two places.
pub struct BatchingEngine;

impl BatchingEngine {
    pub fn start(backend: Arc<dyn InferenceBackend>, engine_cfg: EngineConfig) -> EngineHandle {
        let (tx, mut rx) = mpsc::channel::<QueuedRequest>(1024);
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let last_batch_size = Arc::new(AtomicUsize::new(0));
        let pages_total = engine_cfg.max_num_seqs * engine_cfg.max_num_pages_per_req;
        let pages_in_use = Arc::new(AtomicUsize::new(0));

        let qd = queue_depth.clone();
        let lbs = last_batch_size.clone();
        let piu = pages_in_use.clone();
        let detok_backend = backend.clone();
        let forward_backend = backend.clone();

        tokio::spawn(async move {
            let padding = PaddingPolicy::new(16, engine_cfg.max_model_len.next_power_of_two(), engine_cfg.token_padding_gap, engine_cfg.max_num_seqs);
            let mut runner = Runner::new(
                engine_cfg.max_num_seqs,
                engine_cfg.max_model_len,
                engine_cfg.vocab_size,
                engine_cfg.max_num_pages_per_req,
                1,
                engine_cfg.page_size,
                8,
                padding,
            );
            let mut forward = BackendForwardPass::new(forward_backend, engine_cfg.vocab_size);
            let mut pages = PagePool::new(pages_total as u32);
            let mut in_flight: HashMap<String, InFlight> = HashMap::new();
            let mut finished_last_tick: Vec<String> = Vec::new();

            let mut ticker = time::interval(engine_cfg.tick);
            loop {
                ticker.tick().await;
                qd.store(rx.len(), Ordering::Relaxed);

                let mut scheduler_output = SchedulerOutput::default();
                for req_id in finished_last_tick.drain(..) {
                    scheduler_output.finished_req_ids.insert(req_id);
                }

                // Admit as many queued requests as page capacity allows.
                let mut admitted = Vec::new();
                while in_flight.len() < engine_cfg.max_num_seqs {
                    let Ok(queued) = rx.try_recv() else { break };
                    let total_len = (queued.prompt_tokens.len() + queued.max_new_tokens).min(engine_cfg.max_model_len);
                    let needed_pages = total_len.div_ceil(engine_cfg.page_size).max(1);
                    let Some(reserved) = pages.try_reserve(needed_pages) else {
                        let _ = queued.respond.send(String::from("SERVER_BUSY: insufficient KV capacity"));
                        continue;
                    };
                    scheduler_output.num_scheduled_tokens.insert(queued.req_id.clone(), queued.prompt_tokens.len());
                    scheduler_output.scheduled_new_reqs.push(NewRequestData {
                        req_id: queued.req_id.clone(),
                        prompt_token_ids: queued.prompt_tokens.clone(),
                        sampling_params: queued.sampling_params.clone(),
                        page_ids: vec![reserved.clone()],
                        num_computed_tokens: 0,
                    });
                    in_flight.insert(
                        queued.req_id.clone(),
                        InFlight { pages: reserved, max_new_tokens: queued.max_new_tokens, respond: Some(queued.respond) },
                    );
                    admitted.push(queued.req_id);
                }
                piu.store(pages_total - pages.free.len(), Ordering::Relaxed);

                // Everything else still tracked gets one decode token this step.
                for (req_id, _) in in_flight.iter() {
                    if admitted.contains(req_id) || scheduler_output.finished_req_ids.contains(req_id) {
                        continue;
                    }
                    if let Some(state) = runner.request(req_id) {
                        scheduler_output.scheduled_cached_reqs.push(CachedRequestUpdate {
                            req_id: req_id.clone(),
                            num_computed_tokens: state.num_computed_tokens,
                            new_page_ids: vec![vec![]],
                            resumed_from_preemption: false,
                        });
                        scheduler_output.num_scheduled_tokens.insert(req_id.clone(), 1);
                    }
                }

                if scheduler_output.total_num_scheduled_tokens() == 0 && scheduler_output.finished_req_ids.is_empty() {
                    continue;
                }

                let output = match runner.execute_model(&scheduler_output, &mut forward) {
                    Ok(output) => output,
                    Err(err) => {
                        for (_, inflight) in in_flight.drain() {
                            if let Some(tx) = inflight.respond {
                                let _ = tx.send(format!("RUNNER_ERROR: {err}"));
                            }
                        }
                        continue;
                    }
                };
                lbs.store(output.req_ids.len(), Ordering::Relaxed);

                for req_id in &output.req_ids {
                    let Some(state) = runner.request(req_id) else { continue };
                    let Some(meta) = in_flight.get(req_id) else { continue };

                    let generated = state.output_token_ids.len();
                    let hit_stop = state
                        .output_token_ids
                        .last()
                        .is_some_and(|tok| state.sampling_params.all_stop_token_ids.contains(tok));
                    if generated >= meta.max_new_tokens || hit_stop {
                        let text = detok_backend.detokenize(&state.output_token_ids).unwrap_or_default();
                        let Some(mut meta) = in_flight.remove(req_id) else { continue };
                        pages.release(std::mem::take(&mut meta.pages));
                        if let Some(tx) = meta.respond.take() {
                            let _ = tx.send(text);
                        }
                        finished_last_tick.push(req_id.clone());
                    }
                }
            }
        });

        EngineHandle { tx, backend, next_id: Arc::new(AtomicUsize::new(0)), queue_depth, last_batch_size, pages_in_use, pages_total }
    }
}
