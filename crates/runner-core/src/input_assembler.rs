//! Builds the dense, padded forward-pass inputs for one step from the
//! current [`SequenceBuffer`](crate::sequence_buffer::SequenceBuffer) and the
//! scheduler's token-count decisions.
//!
//! Ported from `eSurgeRunner._prepare_inputs`. The `num_reqs_most_model_len`
//! short path in the original (selected only when a flag that is never set
//! chooses it) is not ported; only the `use_max_model_len` path is.

use crate::padding::PaddingPolicy;
use crate::sequence_buffer::SequenceBuffer;
use crate::slot_mapper::SlotMapper;

/// Slot-mapping arrays plus the physical page table view the forward pass
/// needs to address the paged KV cache for this step.
#[derive(Debug, Clone)]
pub struct CacheMetadata {
    pub kv_cache_start_indices: Vec<u32>,
    pub new_kv_start_indices: Vec<u32>,
    pub slice_lens: Vec<u32>,
    pub num_slices: usize,
    /// `[num_groups][padded_num_reqs, max_num_pages_per_req]` page table rows.
    pub page_table_rows: Vec<Vec<Vec<u32>>>,
}

/// Everything batched and padded for one `forward()` call.
#[derive(Debug, Clone)]
pub struct PreparedInputs {
    pub num_reqs: usize,
    pub padded_num_reqs: usize,
    pub padded_num_tokens: usize,

    /// Concatenated, padded token ids for every scheduled token this step.
    pub input_ids: Vec<u32>,
    /// Logical position of each token within its own sequence.
    pub position_ids: Vec<u32>,
    /// `num_reqs + 1` cumulative offsets into `input_ids`/`position_ids`.
    pub query_start_loc: Vec<u32>,
    /// Total sequence length (computed + scheduled) per request, dense prefix.
    pub seq_lens: Vec<u32>,
    /// Index into `input_ids` holding each request's last scheduled token,
    /// i.e. where the sampler should read logits from.
    pub logits_indices: Vec<u32>,

    pub cache_metadata: CacheMetadata,
}

pub struct InputAssembler {
    page_size: usize,
    slices_per_page: usize,
}

impl InputAssembler {
    pub fn new(page_size: usize, slices_per_page: usize) -> Self {
        Self { page_size, slices_per_page }
    }

    /// `num_scheduled_tokens[i]` is the per-slot count for the whole dense
    /// prefix `0..buffer.num_reqs()`. Convenience wrapper over
    /// [`Self::prepare_slice`] for the common single-sub-batch case.
    pub fn prepare(
        &self,
        buffer: &SequenceBuffer,
        num_scheduled_tokens: &[usize],
        padding: &PaddingPolicy,
    ) -> runner_common::Result<PreparedInputs> {
        self.prepare_slice(buffer, 0, num_scheduled_tokens, padding)
    }

    /// Builds inputs for a contiguous window `[slot_offset, slot_offset +
    /// num_scheduled_tokens.len())` of the dense prefix. Letting the Runner
    /// call this per sub-batch is what makes an oversize step (more active
    /// requests than `max_num_reqs_per_forward`) resolve into several
    /// disjoint forward calls instead of one.
    pub fn prepare_slice(
        &self,
        buffer: &SequenceBuffer,
        slot_offset: usize,
        num_scheduled_tokens: &[usize],
        padding: &PaddingPolicy,
    ) -> runner_common::Result<PreparedInputs> {
        let num_reqs = num_scheduled_tokens.len();
        assert!(slot_offset + num_reqs <= buffer.num_reqs());

        let total_scheduled: usize = num_scheduled_tokens.iter().sum();

        let padded_num_tokens = padding.pad_num_tokens(total_scheduled.max(1))?;
        let padded_num_reqs = padding.pad_num_reqs(num_reqs);

        let mut input_ids = Vec::with_capacity(padded_num_tokens);
        let mut position_ids = Vec::with_capacity(padded_num_tokens);
        let mut query_start_loc = Vec::with_capacity(num_reqs + 1);
        let mut seq_lens = Vec::with_capacity(num_reqs);
        let mut logits_indices = Vec::with_capacity(num_reqs);
        let mut num_computed_local = Vec::with_capacity(num_reqs);

        let mut cursor = 0u32;
        query_start_loc.push(0);
        for i in 0..num_reqs {
            let abs = slot_offset + i;
            let start = buffer.num_computed_tokens[abs];
            let scheduled = num_scheduled_tokens[i];
            let end = start + scheduled;

            input_ids.extend_from_slice(&buffer.token_ids[abs][start..end]);
            position_ids.extend((start as u32)..(end as u32));

            cursor += scheduled as u32;
            query_start_loc.push(cursor);
            seq_lens.push(end as u32);
            logits_indices.push(cursor - 1);
            num_computed_local.push(start);
        }

        input_ids.resize(padded_num_tokens, 0);
        position_ids.resize(padded_num_tokens, 0);

        let page_table = &buffer.page_table;
        let triples = SlotMapper::compute(
            page_table.group(0),
            self.page_size,
            slot_offset,
            &num_computed_local,
            num_scheduled_tokens,
        );
        let padded_num_slices =
            padding.pad_num_slices(padded_num_tokens, padded_num_reqs, self.page_size, self.slices_per_page);
        let [kv_cache_start_indices, new_kv_start_indices, slice_lens] =
            SlotMapper::pad_and_transpose(&triples, padded_num_slices);

        let page_table_rows: Vec<Vec<Vec<u32>>> = (0..page_table.num_groups())
            .map(|g| {
                page_table
                    .group(g)
                    .get_array(buffer.max_num_reqs)
                    .into_iter()
                    .skip(slot_offset)
                    .take(padded_num_reqs.min(buffer.max_num_reqs - slot_offset))
                    .map(|row| row.to_vec())
                    .collect()
            })
            .collect();

        Ok(PreparedInputs {
            num_reqs,
            padded_num_reqs,
            padded_num_tokens,
            input_ids,
            position_ids,
            query_start_loc,
            seq_lens,
            logits_indices,
            cache_metadata: CacheMetadata {
                kv_cache_start_indices,
                new_kv_start_indices,
                slice_lens,
                num_slices: triples.len(),
                page_table_rows,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CachedRequestState, SamplingParams};

    #[test]
    fn single_request_prefill_produces_contiguous_query_range() {
        let mut buf = SequenceBuffer::new(4, 64, 100, 4, 1);
        let mut r = CachedRequestState::new("A".into(), vec![10, 11, 12, 13, 14], SamplingParams::default(), vec![vec![0]], 0);
        r.sampling_params = SamplingParams::default();
        buf.add_request(&r, None).unwrap();

        let assembler = InputAssembler::new(128, 8);
        let padding = PaddingPolicy::new(16, 8192, 0, 8);
        let prepared = assembler.prepare(&buf, &[5], &padding).unwrap();

        assert_eq!(prepared.num_reqs, 1);
        assert_eq!(&prepared.input_ids[..5], &[10, 11, 12, 13, 14]);
        assert_eq!(&prepared.position_ids[..5], &[0, 1, 2, 3, 4]);
        assert_eq!(prepared.query_start_loc, vec![0, 5]);
        assert_eq!(prepared.seq_lens, vec![5]);
        assert_eq!(prepared.logits_indices, vec![4]);
    }

    #[test]
    fn two_requests_share_one_padded_batch() {
        let mut buf = SequenceBuffer::new(4, 64, 100, 4, 1);
        let a = CachedRequestState::new("A".into(), vec![1, 2, 3], SamplingParams::default(), vec![vec![0]], 0);
        let b = CachedRequestState::new("B".into(), vec![4, 5], SamplingParams::default(), vec![vec![1]], 0);
        buf.add_request(&a, None).unwrap();
        buf.add_request(&b, None).unwrap();

        let assembler = InputAssembler::new(128, 8);
        let padding = PaddingPolicy::new(16, 8192, 0, 8);
        let prepared = assembler.prepare(&buf, &[3, 2], &padding).unwrap();

        assert_eq!(prepared.query_start_loc, vec![0, 3, 5]);
        assert_eq!(prepared.logits_indices, vec![2, 4]);
        assert_eq!(&prepared.input_ids[..5], &[1, 2, 3, 4, 5]);
    }
}
