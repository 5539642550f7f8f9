//! The outer step-loop driver: reconciles scheduler decisions into the
//! dense [`SequenceBuffer`], assembles one forward pass, samples, and
//! reports back which tokens actually committed.
//!
//! Ported from `eSurgeRunner.execute_model` and `_update_states`.

use std::collections::HashMap;

use runner_common::{Result, RunnerError};

use crate::batch_sampler::Sampler;
use crate::input_assembler::{CacheMetadata, InputAssembler};
use crate::padding::PaddingPolicy;
use crate::sequence_buffer::SequenceBuffer;
use crate::types::{CachedRequestState, ModelRunnerOutput, SchedulerOutput};

/// The seam between the runner and whatever actually holds model weights.
/// Narrower than `runner_backend::InferenceBackend`: no tokenizer or model
/// loading here, just the numeric forward contract the spec describes.
pub trait ForwardPass {
    /// Returns one logits row (length `vocab_size`) per *token* in
    /// `input_ids`, including the padding tail.
    fn forward(
        &mut self,
        input_ids: &[u32],
        position_ids: &[u32],
        cache_metadata: &CacheMetadata,
        seq_lens: &[u32],
    ) -> Result<Vec<Vec<f32>>>;
}

pub struct Runner {
    buffer: SequenceBuffer,
    requests: HashMap<String, CachedRequestState>,
    input_assembler: InputAssembler,
    padding: PaddingPolicy,
    /// Caps how many requests go into a single `forward()` call. `None`
    /// means the whole dense prefix is submitted as one sub-batch.
    max_num_reqs_per_forward: Option<usize>,
}

impl Runner {
    pub fn new(
        max_num_reqs: usize,
        max_model_len: usize,
        vocab_size: usize,
        max_num_pages_per_req: usize,
        num_page_groups: usize,
        page_size: usize,
        slices_per_page: usize,
        padding: PaddingPolicy,
    ) -> Self {
        Self {
            buffer: SequenceBuffer::new(max_num_reqs, max_model_len, vocab_size, max_num_pages_per_req, num_page_groups),
            requests: HashMap::new(),
            input_assembler: InputAssembler::new(page_size, slices_per_page),
            padding,
            max_num_reqs_per_forward: None,
        }
    }

    /// Bounds each `forward()` call to at most `n` requests; an oversize
    /// step is then split into several disjoint, slot-ordered sub-batches.
    pub fn with_max_num_reqs_per_forward(mut self, n: usize) -> Self {
        self.max_num_reqs_per_forward = Some(n);
        self
    }

    pub fn buffer(&self) -> &SequenceBuffer {
        &self.buffer
    }

    /// Persistent state for a request the runner is currently tracking
    /// (`None` once it has been reported in `finished_req_ids` and removed).
    pub fn request(&self, req_id: &str) -> Option<&CachedRequestState> {
        self.requests.get(req_id)
    }

    pub fn is_tracking(&self, req_id: &str) -> bool {
        self.requests.contains_key(req_id)
    }

    /// Runs one full step: reconcile, then loop sub-batches of assemble,
    /// forward, sample, commit until every scheduled slot is processed.
    pub fn execute_model(
        &mut self,
        scheduler_output: &SchedulerOutput,
        forward: &mut dyn ForwardPass,
    ) -> Result<ModelRunnerOutput> {
        self.reconcile_state(scheduler_output)?;

        let num_reqs = self.buffer.num_reqs();
        if num_reqs == 0 {
            return Ok(ModelRunnerOutput::empty());
        }

        let mut num_scheduled_tokens = vec![0usize; num_reqs];
        for slot in 0..num_reqs {
            let req_id = self.buffer.req_id_at(slot).expect("dense prefix has no holes").to_string();
            let scheduled = scheduler_output
                .num_scheduled_tokens
                .get(&req_id)
                .copied()
                .ok_or_else(|| RunnerError::ProtocolViolation(format!("missing scheduled token count for {req_id}")))?;
            num_scheduled_tokens[slot] = scheduled;
        }

        let chunk_size = self.max_num_reqs_per_forward.unwrap_or(num_reqs).max(1);
        if chunk_size < num_reqs {
            tracing::debug!(num_reqs, chunk_size, "step exceeds max_num_reqs_per_forward, splitting into sub-batches");
        }

        let mut req_ids = Vec::with_capacity(num_reqs);
        let mut req_id_to_index = HashMap::with_capacity(num_reqs);
        let mut sampled_token_ids = Vec::with_capacity(num_reqs);

        let mut slot_offset = 0;
        while slot_offset < num_reqs {
            let count = chunk_size.min(num_reqs - slot_offset);
            let scheduled_chunk = &num_scheduled_tokens[slot_offset..slot_offset + count];

            let prepared = self
                .input_assembler
                .prepare_slice(&self.buffer, slot_offset, scheduled_chunk, &self.padding)
                .map_err(|err| {
                    tracing::warn!(slot_offset, count, %err, "failed to prepare sub-batch inputs");
                    err
                })?;

            let logits_by_token = forward.forward(
                &prepared.input_ids,
                &prepared.position_ids,
                &prepared.cache_metadata,
                &prepared.seq_lens,
            )?;

            let mut request_logits = Vec::with_capacity(count);
            for &idx in &prepared.logits_indices {
                let row = logits_by_token
                    .get(idx as usize)
                    .ok_or_else(|| RunnerError::Forward(format!("forward pass returned no logits at index {idx}")))?;
                request_logits.push(row.clone());
            }

            let sampler_output = Sampler::sample(&mut self.buffer, slot_offset, &request_logits);

            for row in 0..count {
                let slot = slot_offset + row;
                let req_id = self.buffer.req_id_at(slot).expect("dense prefix has no holes").to_string();
                req_ids.push(req_id.clone());
                req_id_to_index.insert(req_id.clone(), slot);

                let scheduled = scheduled_chunk[row];
                self.buffer.num_computed_tokens[slot] += scheduled;

                let still_prefilling = self.buffer.num_computed_tokens[slot] < self.buffer.num_prompt_tokens[slot];
                if still_prefilling {
                    self.buffer.rewind_generator(slot);
                    sampled_token_ids.push(Vec::new());
                    continue;
                }

                let token = sampler_output.sampled_token_ids[row];
                let num_tokens = self.buffer.num_tokens[slot];
                self.buffer.token_ids[slot][num_tokens] = token;
                self.buffer.num_tokens[slot] += 1;
                if let Some(req) = self.requests.get_mut(&req_id) {
                    req.output_token_ids.push(token);
                }
                sampled_token_ids.push(vec![token]);
            }

            slot_offset += count;
        }

        Ok(ModelRunnerOutput { req_ids, req_id_to_index, sampled_token_ids })
    }

    /// Applies finished-request removal, cached-request updates, and new
    /// admissions, then restores the dense-prefix invariant.
    fn reconcile_state(&mut self, scheduler_output: &SchedulerOutput) -> Result<()> {
        let mut empty_slots = Vec::new();
        for req_id in &scheduler_output.finished_req_ids {
            self.requests.remove(req_id);
            if let Some(slot) = self.buffer.remove_request(req_id) {
                empty_slots.push(slot);
            }
        }

        let unscheduled: Vec<String> = self
            .buffer
            .req_id_to_index
            .keys()
            .filter(|req_id| !scheduler_output.num_scheduled_tokens.contains_key(*req_id))
            .cloned()
            .collect();
        for req_id in unscheduled {
            if let Some(slot) = self.buffer.remove_request(&req_id) {
                empty_slots.push(slot);
            }
        }

        // Requests whose cached update arrives while they're not currently
        // batched (unscheduled last step, or resuming from preemption) are
        // re-admitted below, after `condense`, rather than rejected.
        let mut reqs_to_readmit: Vec<String> = Vec::new();

        for update in &scheduler_output.scheduled_cached_reqs {
            let Some(req) = self.requests.get_mut(&update.req_id) else {
                return Err(RunnerError::UnknownRequest(update.req_id.clone()));
            };
            req.num_computed_tokens = update.num_computed_tokens;
            if update.resumed_from_preemption {
                req.page_ids = update.new_page_ids.clone();
            } else if !update.new_page_ids.is_empty() {
                for (group, ids) in req.page_ids.iter_mut().zip(update.new_page_ids.iter()) {
                    group.extend_from_slice(ids);
                }
            }

            let Some(&slot) = self.buffer.req_id_to_index.get(&update.req_id) else {
                tracing::debug!(req_id = %update.req_id, resumed = update.resumed_from_preemption, "cached request not currently batched, re-admitting");
                reqs_to_readmit.push(update.req_id.clone());
                continue;
            };

            self.buffer.num_computed_tokens[slot] = update.num_computed_tokens;
            if update.resumed_from_preemption {
                self.buffer.page_table.add_row(&update.new_page_ids, slot).map_err(|err| {
                    tracing::warn!(req_id = %update.req_id, %err, "failed to install resumed page table row");
                    err
                })?;
            } else if !update.new_page_ids.is_empty() {
                self.buffer.page_table.append_row(&update.new_page_ids, slot).map_err(|err| {
                    tracing::warn!(req_id = %update.req_id, %err, "failed to append new page table row");
                    err
                })?;
            }
        }

        if !empty_slots.is_empty() {
            tracing::debug!(holes = empty_slots.len(), "condensing sequence buffer");
            self.buffer.condense(&empty_slots);
        }

        for new_req in &scheduler_output.scheduled_new_reqs {
            let state = CachedRequestState::new(
                new_req.req_id.clone(),
                new_req.prompt_token_ids.clone(),
                new_req.sampling_params.clone(),
                new_req.page_ids.clone(),
                new_req.num_computed_tokens,
            );
            self.buffer.add_request(&state, None).map_err(|err| {
                tracing::warn!(req_id = %new_req.req_id, %err, "failed to admit new request");
                err
            })?;
            self.requests.insert(new_req.req_id.clone(), state);
        }

        for req_id in reqs_to_readmit {
            let state = self.requests.get(&req_id).expect("updated above").clone();
            self.buffer.add_request(&state, None).map_err(|err| {
                tracing::warn!(req_id = %req_id, %err, "failed to re-admit cached request");
                err
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewRequestData, SamplingParams};

    struct EchoForward {
        vocab_size: usize,
    }

    impl ForwardPass for EchoForward {
        fn forward(
            &mut self,
            input_ids: &[u32],
            _position_ids: &[u32],
            _cache_metadata: &CacheMetadata,
            _seq_lens: &[u32],
        ) -> Result<Vec<Vec<f32>>> {
            Ok(input_ids
                .iter()
                .map(|&tok| {
                    let mut row = vec![0.0f32; self.vocab_size];
                    row[(tok as usize + 1) % self.vocab_size] = 10.0;
                    row
                })
                .collect())
        }
    }

    fn make_runner() -> Runner {
        let padding = PaddingPolicy::new(16, 256, 0, 8);
        Runner::new(8, 64, 32, 4, 1, 128, 8, padding)
    }

    #[test]
    fn single_request_full_prefill_samples_one_token() {
        let mut runner = make_runner();
        let mut forward = EchoForward { vocab_size: 32 };

        let mut scheduler_output = SchedulerOutput::default();
        scheduler_output.scheduled_new_reqs.push(NewRequestData {
            req_id: "A".into(),
            prompt_token_ids: vec![1, 2, 3],
            sampling_params: SamplingParams::default(),
            page_ids: vec![vec![0]],
            num_computed_tokens: 0,
        });
        scheduler_output.num_scheduled_tokens.insert("A".into(), 3);

        let output = runner.execute_model(&scheduler_output, &mut forward).unwrap();
        assert_eq!(output.req_ids, vec!["A"]);
        assert_eq!(output.sampled_token_ids[0].len(), 1);
        assert_eq!(output.sampled_token_ids[0][0], 4); // echo(3) + 1
    }

    #[test]
    fn chunked_prefill_discards_mid_prompt_sample() {
        let mut runner = make_runner();
        let mut forward = EchoForward { vocab_size: 32 };

        let mut scheduler_output = SchedulerOutput::default();
        scheduler_output.scheduled_new_reqs.push(NewRequestData {
            req_id: "A".into(),
            prompt_token_ids: vec![1, 2, 3, 4, 5],
            sampling_params: SamplingParams::default(),
            page_ids: vec![vec![0]],
            num_computed_tokens: 0,
        });
        scheduler_output.num_scheduled_tokens.insert("A".into(), 2);

        let output = runner.execute_model(&scheduler_output, &mut forward).unwrap();
        assert_eq!(output.sampled_token_ids[0].len(), 0, "mid-prefill sample must be discarded");
    }

    #[test]
    fn finished_request_is_removed_and_prefix_condensed() {
        let mut runner = make_runner();
        let mut forward = EchoForward { vocab_size: 32 };

        let mut scheduler_output = SchedulerOutput::default();
        scheduler_output.scheduled_new_reqs.push(NewRequestData {
            req_id: "A".into(),
            prompt_token_ids: vec![1],
            sampling_params: SamplingParams::default(),
            page_ids: vec![vec![0]],
            num_computed_tokens: 0,
        });
        scheduler_output.scheduled_new_reqs.push(NewRequestData {
            req_id: "B".into(),
            prompt_token_ids: vec![2],
            sampling_params: SamplingParams::default(),
            page_ids: vec![vec![1]],
            num_computed_tokens: 0,
        });
        scheduler_output.num_scheduled_tokens.insert("A".into(), 1);
        scheduler_output.num_scheduled_tokens.insert("B".into(), 1);
        runner.execute_model(&scheduler_output, &mut forward).unwrap();

        let mut second = SchedulerOutput::default();
        second.finished_req_ids.insert("A".into());
        second.num_scheduled_tokens.insert("B".into(), 1);
        let output = runner.execute_model(&second, &mut forward).unwrap();

        assert_eq!(output.req_ids, vec!["B"]);
        assert_eq!(runner.buffer().num_reqs(), 1);
    }

    struct CountingForward {
        inner: EchoForward,
        calls: std::cell::RefCell<Vec<usize>>,
    }

    impl ForwardPass for CountingForward {
        fn forward(
            &mut self,
            input_ids: &[u32],
            position_ids: &[u32],
            cache_metadata: &CacheMetadata,
            seq_lens: &[u32],
        ) -> Result<Vec<Vec<f32>>> {
            self.calls.borrow_mut().push(seq_lens.len());
            self.inner.forward(input_ids, position_ids, cache_metadata, seq_lens)
        }
    }

    #[test]
    fn oversize_step_splits_into_disjoint_sub_batches() {
        let padding = PaddingPolicy::new(16, 256, 0, 8);
        let mut runner = Runner::new(8, 64, 32, 4, 1, 128, 8, padding).with_max_num_reqs_per_forward(2);
        let mut forward = CountingForward { inner: EchoForward { vocab_size: 32 }, calls: std::cell::RefCell::new(vec![]) };

        let mut scheduler_output = SchedulerOutput::default();
        for (id, tok) in [("A", 1u32), ("B", 2), ("C", 3)] {
            scheduler_output.scheduled_new_reqs.push(NewRequestData {
                req_id: id.into(),
                prompt_token_ids: vec![tok],
                sampling_params: SamplingParams::default(),
                page_ids: vec![vec![tok]],
                num_computed_tokens: 0,
            });
            scheduler_output.num_scheduled_tokens.insert(id.into(), 1);
        }

        let output = runner.execute_model(&scheduler_output, &mut forward).unwrap();
        assert_eq!(forward.calls.borrow().len(), 2, "3 reqs with a cap of 2 must take exactly two forward calls");
        assert_eq!(output.req_ids, vec!["A", "B", "C"], "output stays in slot order across sub-batches");
    }

    #[test]
    fn preemption_resume_replaces_page_ids_rather_than_appending() {
        let mut runner = make_runner();
        let mut forward = EchoForward { vocab_size: 32 };

        let mut scheduler_output = SchedulerOutput::default();
        scheduler_output.scheduled_new_reqs.push(NewRequestData {
            req_id: "A".into(),
            prompt_token_ids: vec![1, 2, 3],
            sampling_params: SamplingParams::default(),
            page_ids: vec![vec![1, 2, 3]],
            num_computed_tokens: 0,
        });
        scheduler_output.num_scheduled_tokens.insert("A".into(), 3);
        runner.execute_model(&scheduler_output, &mut forward).unwrap();

        let mut second = SchedulerOutput::default();
        second.scheduled_cached_reqs.push(crate::types::CachedRequestUpdate {
            req_id: "A".into(),
            num_computed_tokens: 3,
            new_page_ids: vec![vec![7, 8, 9, 10]],
            resumed_from_preemption: true,
        });
        second.num_scheduled_tokens.insert("A".into(), 1);
        runner.execute_model(&second, &mut forward).unwrap();

        let slot = *runner.buffer().req_id_to_index.get("A").unwrap();
        let row = runner.buffer().page_table.group(0).get_array(slot + 1)[slot];
        assert_eq!(&row[..4], &[7, 8, 9, 10]);
        assert_eq!(runner.requests.get("A").unwrap().page_ids, vec![vec![7, 8, 9, 10]]);
    }

    /// S5, exercised across an actual preemption: A is dropped from the
    /// buffer (unscheduled for a step, as the scheduler does while a request
    /// waits preempted) and only resumes via `scheduled_cached_reqs` with
    /// `resumed_from_preemption = true` and no prior slot. This must
    /// re-admit rather than error.
    #[test]
    fn resumed_request_with_no_current_slot_is_readmitted() {
        let mut runner = make_runner();
        let mut forward = EchoForward { vocab_size: 32 };

        let mut first = SchedulerOutput::default();
        first.scheduled_new_reqs.push(NewRequestData {
            req_id: "A".into(),
            prompt_token_ids: vec![1, 2, 3],
            sampling_params: SamplingParams::default(),
            page_ids: vec![vec![1, 2, 3]],
            num_computed_tokens: 0,
        });
        first.num_scheduled_tokens.insert("A".into(), 3);
        runner.execute_model(&first, &mut forward).unwrap();
        assert!(runner.buffer().req_id_to_index.contains_key("A"));

        // A step where A is preempted: absent from num_scheduled_tokens, so
        // reconcile_state drops it from the buffer (but keeps `self.requests`).
        let preempt_step = SchedulerOutput::default();
        runner.execute_model(&preempt_step, &mut forward).unwrap();
        assert!(
            !runner.buffer().req_id_to_index.contains_key("A"),
            "A must have left the buffer while preempted"
        );
        assert!(runner.is_tracking("A"), "runner still tracks A's persistent state while preempted");

        let mut resume = SchedulerOutput::default();
        resume.scheduled_cached_reqs.push(crate::types::CachedRequestUpdate {
            req_id: "A".into(),
            num_computed_tokens: 3,
            new_page_ids: vec![vec![7, 8, 9, 10]],
            resumed_from_preemption: true,
        });
        resume.num_scheduled_tokens.insert("A".into(), 1);
        let output = runner.execute_model(&resume, &mut forward).unwrap();

        assert_eq!(output.req_ids, vec!["A"]);
        let slot = *runner.buffer().req_id_to_index.get("A").unwrap();
        let row = runner.buffer().page_table.group(0).get_array(slot + 1)[slot];
        assert_eq!(&row[..4], &[7, 8, 9, 10]);
    }

    #[test]
    fn mixed_sampling_applies_per_slot_policy() {
        let mut runner = make_runner();
        let mut forward = EchoForward { vocab_size: 32 };

        let mut scheduler_output = SchedulerOutput::default();
        scheduler_output.scheduled_new_reqs.push(NewRequestData {
            req_id: "A".into(),
            prompt_token_ids: vec![1],
            sampling_params: SamplingParams::default(),
            page_ids: vec![vec![0]],
            num_computed_tokens: 0,
        });
        let mut b_params = SamplingParams::default();
        b_params.sampling_type = crate::types::SamplingType::Random;
        b_params.temperature = 0.7;
        b_params.top_p = 0.9;
        b_params.generator_seed = Some(1);
        scheduler_output.scheduled_new_reqs.push(NewRequestData {
            req_id: "B".into(),
            prompt_token_ids: vec![2],
            sampling_params: b_params,
            page_ids: vec![vec![1]],
            num_computed_tokens: 0,
        });
        let mut c_params = SamplingParams::default();
        c_params.sampling_type = crate::types::SamplingType::Random;
        c_params.temperature = 1.0;
        c_params.top_k = 50;
        c_params.generator_seed = Some(2);
        scheduler_output.scheduled_new_reqs.push(NewRequestData {
            req_id: "C".into(),
            prompt_token_ids: vec![3],
            sampling_params: c_params,
            page_ids: vec![vec![2]],
            num_computed_tokens: 0,
        });
        for id in ["A", "B", "C"] {
            scheduler_output.num_scheduled_tokens.insert(id.into(), 1);
        }

        let output = runner.execute_model(&scheduler_output, &mut forward).unwrap();

        assert!(runner.buffer().greedy.contains("A"));
        assert_eq!(
            runner.buffer().random,
            ["B".to_string(), "C".to_string()].into_iter().collect::<std::collections::HashSet<_>>()
        );
        // A is greedy: echo(1)+1 == 2 is the deterministic argmax.
        assert_eq!(output.sampled_token_ids[0], vec![2]);
        assert_eq!(output.sampled_token_ids[1].len(), 1);
        assert_eq!(output.sampled_token_ids[2].len(), 1);
    }
}
