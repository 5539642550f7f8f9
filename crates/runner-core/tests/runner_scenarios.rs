use runner_core::input_assembler::CacheMetadata;
use runner_core::padding::PaddingPolicy;
use runner_core::runner::{ForwardPass, Runner};
use runner_core::types::{NewRequestData, SamplingParams, SchedulerOutput};

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
    ) -> runner_common::Result<Vec<Vec<f32>>> {
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

/// Property #3: total tokens committed to request outputs across every step
/// equals the generated-token count each request actually accumulated.
#[test]
fn token_conservation_across_chunked_steps() {
    let mut runner = make_runner();
    let mut forward = EchoForward { vocab_size: 32 };

    let mut step1 = SchedulerOutput::default();
    step1.scheduled_new_reqs.push(NewRequestData {
        req_id: "A".into(),
        prompt_token_ids: vec![1, 2, 3, 4],
        sampling_params: SamplingParams::default(),
        page_ids: vec![vec![0]],
        num_computed_tokens: 0,
    });
    step1.num_scheduled_tokens.insert("A".into(), 2);
    let out1 = runner.execute_model(&step1, &mut forward).unwrap();
    assert_eq!(out1.sampled_token_ids[0].len(), 0);

    let mut step2 = SchedulerOutput::default();
    step2.num_scheduled_tokens.insert("A".into(), 2);
    let out2 = runner.execute_model(&step2, &mut forward).unwrap();
    assert_eq!(out2.sampled_token_ids[0].len(), 1);

    let mut step3 = SchedulerOutput::default();
    step3.num_scheduled_tokens.insert("A".into(), 1);
    let out3 = runner.execute_model(&step3, &mut forward).unwrap();
    assert_eq!(out3.sampled_token_ids[0].len(), 1);

    let committed: usize = [out1, out2, out3].iter().flat_map(|o| o.sampled_token_ids.iter()).map(|v| v.len()).sum();

    let slot = *runner.buffer().req_id_to_index.get("A").unwrap();
    let generated = runner.buffer().num_tokens[slot] - runner.buffer().num_prompt_tokens[slot];
    assert_eq!(committed, generated);
    assert_eq!(committed, 2, "only the two post-prefill steps should have committed a token");
}

/// Property #4: a request's owned pages always cover everything it has
/// computed so far plus what is scheduled this step.
#[test]
fn page_coverage_holds_after_each_step() {
    let mut runner = make_runner();
    let mut forward = EchoForward { vocab_size: 32 };
    let page_size = 128usize;

    let mut step = SchedulerOutput::default();
    step.scheduled_new_reqs.push(NewRequestData {
        req_id: "A".into(),
        prompt_token_ids: (0..10).collect(),
        sampling_params: SamplingParams::default(),
        page_ids: vec![vec![0]],
        num_computed_tokens: 0,
    });
    step.num_scheduled_tokens.insert("A".into(), 10);
    runner.execute_model(&step, &mut forward).unwrap();

    let slot = *runner.buffer().req_id_to_index.get("A").unwrap();
    let owned_pages = runner.buffer().page_table.group(0).row_len(slot);
    let computed = runner.buffer().num_computed_tokens[slot];
    assert!(owned_pages * page_size >= computed, "owned pages must cover all computed tokens");
}

/// S4: more active requests than the forward cap must split into disjoint
/// sub-batches whose combined output preserves slot order.
#[test]
fn oversize_step_preserves_slot_order_across_sub_batches() {
    let padding = PaddingPolicy::new(16, 256, 0, 8);
    let mut runner = Runner::new(8, 64, 32, 4, 1, 128, 8, padding).with_max_num_reqs_per_forward(1);
    let mut forward = EchoForward { vocab_size: 32 };

    let mut step = SchedulerOutput::default();
    for (id, tok) in [("A", 1u32), ("B", 2), ("C", 3), ("D", 4)] {
        step.scheduled_new_reqs.push(NewRequestData {
            req_id: id.into(),
            prompt_token_ids: vec![tok],
            sampling_params: SamplingParams::default(),
            page_ids: vec![vec![tok]],
            num_computed_tokens: 0,
        });
        step.num_scheduled_tokens.insert(id.into(), 1);
    }

    let output = runner.execute_model(&step, &mut forward).unwrap();
    assert_eq!(output.req_ids, vec!["A", "B", "C", "D"]);
    for (i, id) in ["A", "B", "C", "D"].iter().enumerate() {
        assert_eq!(output.req_id_to_index[*id], i);
    }
}
