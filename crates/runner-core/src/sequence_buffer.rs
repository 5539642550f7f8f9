//! Dense, compacted batch state for every live request: token ids, lengths,
//! sampling parameters, and the page-table rows, indexed by *slot*.
//!
//! Ported from `easydel/inference/esurge/runners/sequence_buffer.py`'s
//! `SequenceBuffer`. The filled slots always form a contiguous prefix
//! `0..num_reqs`; `condense` restores that invariant after removals.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::page_table::MultiGroupPageTable;
use crate::types::{CachedRequestState, SamplingType, GREEDY_TEMPERATURE};

/// Lazily-allocated dense bitmask over `[max_num_reqs, vocab_size]`, packed
/// into `u64` words. A set bit means the token is *disallowed* for that slot
/// (mirrors the `True == masked out` convention of the original numpy mask).
#[derive(Debug, Clone)]
pub struct AllowedTokenMask {
    vocab_size: usize,
    words_per_row: usize,
    words: Vec<u64>,
}

impl AllowedTokenMask {
    fn new(max_num_reqs: usize, vocab_size: usize) -> Self {
        let words_per_row = vocab_size.div_ceil(64);
        Self { vocab_size, words_per_row, words: vec![0u64; words_per_row * max_num_reqs] }
    }

    fn row(&self, slot: usize) -> &[u64] {
        &self.words[slot * self.words_per_row..(slot + 1) * self.words_per_row]
    }

    fn row_mut(&mut self, slot: usize) -> &mut [u64] {
        let wpr = self.words_per_row;
        &mut self.words[slot * wpr..(slot + 1) * wpr]
    }

    fn set_all_disallowed(&mut self, slot: usize) {
        for w in self.row_mut(slot) {
            *w = u64::MAX;
        }
    }

    fn allow(&mut self, slot: usize, token_id: u32) {
        let (word, bit) = (token_id as usize / 64, token_id as usize % 64);
        self.row_mut(slot)[word] &= !(1u64 << bit);
    }

    fn clear(&mut self, slot: usize) {
        for w in self.row_mut(slot) {
            *w = 0;
        }
    }

    pub fn is_disallowed(&self, slot: usize, token_id: u32) -> bool {
        if (token_id as usize) >= self.vocab_size {
            return true;
        }
        let (word, bit) = (token_id as usize / 64, token_id as usize % 64);
        self.row(slot)[word] & (1u64 << bit) != 0
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        let wpr = self.words_per_row;
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (left, right) = self.words.split_at_mut(hi * wpr);
        left[lo * wpr..(lo + 1) * wpr].swap_with_slice(&mut right[..wpr]);
    }

    fn move_row(&mut self, src: usize, dst: usize) {
        if src == dst {
            return;
        }
        let wpr = self.words_per_row;
        let src_row: Vec<u64> = self.row(src).to_vec();
        self.row_mut(dst).copy_from_slice(&src_row);
        self.row_mut(src).iter_mut().for_each(|w| *w = 0);
        let _ = wpr;
    }
}

pub struct SequenceBuffer {
    pub max_num_reqs: usize,
    pub max_model_len: usize,
    pub vocab_size: usize,

    req_ids: Vec<Option<String>>,
    pub req_id_to_index: HashMap<String, usize>,

    pub token_ids: Vec<Vec<u32>>,
    pub num_tokens: Vec<usize>,
    pub num_prompt_tokens: Vec<usize>,
    pub num_computed_tokens: Vec<usize>,

    pub temperature: Vec<f32>,
    pub top_p: Vec<f32>,
    pub top_k: Vec<i32>,
    pub min_p: Vec<f32>,
    pub frequency_penalty: Vec<f32>,
    pub presence_penalty: Vec<f32>,
    pub repetition_penalty: Vec<f32>,

    pub greedy: HashSet<String>,
    pub random: HashSet<String>,
    pub needs_top_p: HashSet<String>,
    pub needs_top_k: HashSet<String>,
    pub needs_min_p: HashSet<String>,
    pub has_freq_penalty: HashSet<String>,
    pub has_pres_penalty: HashSet<String>,
    pub has_rep_penalty: HashSet<String>,
    pub has_allowed_token_ids: HashSet<String>,

    pub min_tokens: HashMap<usize, (u32, HashSet<u32>)>,
    pub generator_seed: HashMap<usize, u64>,
    pub generators: HashMap<usize, StdRng>,
    pub bad_words_token_ids: HashMap<usize, Vec<Vec<u32>>>,
    pub logit_bias: Vec<Option<HashMap<u32, f32>>>,
    pub allowed_token_ids_mask: Option<AllowedTokenMask>,
    /// Number of times a slot's sampled token has been discarded (mid-prefill
    /// chunk boundary) since its generator was seeded. Used to re-derive a
    /// fresh, deterministic RNG state instead of committing the discarded
    /// draw, since `StdRng` exposes no public stream-offset/rewind API.
    rewind_counter: HashMap<usize, u64>,

    pub page_table: MultiGroupPageTable,
}

impl SequenceBuffer {
    pub fn new(
        max_num_reqs: usize,
        max_model_len: usize,
        vocab_size: usize,
        max_num_pages_per_req: usize,
        num_page_groups: usize,
    ) -> Self {
        Self {
            max_num_reqs,
            max_model_len,
            vocab_size,
            req_ids: vec![None; 0],
            req_id_to_index: HashMap::new(),
            token_ids: vec![vec![0u32; max_model_len]; max_num_reqs],
            num_tokens: vec![0; max_num_reqs],
            num_prompt_tokens: vec![0; max_num_reqs],
            num_computed_tokens: vec![0; max_num_reqs],
            temperature: vec![GREEDY_TEMPERATURE; max_num_reqs],
            top_p: vec![1.0; max_num_reqs],
            top_k: vec![vocab_size as i32; max_num_reqs],
            min_p: vec![0.0; max_num_reqs],
            frequency_penalty: vec![0.0; max_num_reqs],
            presence_penalty: vec![0.0; max_num_reqs],
            repetition_penalty: vec![1.0; max_num_reqs],
            greedy: HashSet::new(),
            random: HashSet::new(),
            needs_top_p: HashSet::new(),
            needs_top_k: HashSet::new(),
            needs_min_p: HashSet::new(),
            has_freq_penalty: HashSet::new(),
            has_pres_penalty: HashSet::new(),
            has_rep_penalty: HashSet::new(),
            has_allowed_token_ids: HashSet::new(),
            min_tokens: HashMap::new(),
            generator_seed: HashMap::new(),
            generators: HashMap::new(),
            bad_words_token_ids: HashMap::new(),
            logit_bias: vec![None; max_num_reqs],
            allowed_token_ids_mask: None,
            rewind_counter: HashMap::new(),
            page_table: MultiGroupPageTable::new(max_num_reqs, max_num_pages_per_req, num_page_groups),
        }
    }

    /// A discarded prefill-chunk sample still consumed RNG state; re-seed the
    /// slot's generator deterministically so a later, real sample from the
    /// same logical position is reproducible across runs given the same
    /// initial seed and discard history.
    pub fn rewind_generator(&mut self, slot: usize) {
        let Some(&seed) = self.generator_seed.get(&slot) else { return };
        let count = self.rewind_counter.entry(slot).or_insert(0);
        *count += 1;
        self.generators.insert(slot, StdRng::seed_from_u64(seed.wrapping_add(*count)));
    }

    pub fn num_reqs(&self) -> usize {
        self.req_id_to_index.len()
    }

    pub fn req_ids(&self) -> &[Option<String>] {
        &self.req_ids
    }

    pub fn req_id_at(&self, slot: usize) -> Option<&str> {
        self.req_ids[slot].as_deref()
    }

    pub fn all_greedy(&self) -> bool {
        self.random.is_empty()
    }

    pub fn all_random(&self) -> bool {
        self.greedy.is_empty()
    }

    pub fn no_top_p(&self) -> bool {
        self.needs_top_p.is_empty()
    }

    pub fn no_top_k(&self) -> bool {
        self.needs_top_k.is_empty()
    }

    pub fn no_min_p(&self) -> bool {
        self.needs_min_p.is_empty()
    }

    pub fn no_penalties(&self) -> bool {
        self.has_freq_penalty.is_empty() && self.has_pres_penalty.is_empty() && self.has_rep_penalty.is_empty()
    }

    pub fn no_allowed_token_ids(&self) -> bool {
        self.has_allowed_token_ids.is_empty()
    }

    /// Add (or overwrite) a request at `slot`, defaulting to appending at
    /// `num_reqs` when `slot` is `None`. Mirrors `SequenceBuffer.add_request`.
    pub fn add_request(&mut self, request: &CachedRequestState, slot: Option<usize>) -> runner_common::Result<()> {
        let slot = slot.unwrap_or_else(|| self.num_reqs());
        assert!(slot < self.max_num_reqs, "slot {slot} exceeds max_num_reqs");

        if slot == self.req_ids.len() {
            self.req_ids.push(Some(request.req_id.clone()));
        } else {
            self.req_ids[slot] = Some(request.req_id.clone());
        }
        self.req_id_to_index.insert(request.req_id.clone(), slot);

        let num_prompt = request.prompt_token_ids.len();
        self.num_prompt_tokens[slot] = num_prompt;
        self.token_ids[slot][..num_prompt].copy_from_slice(&request.prompt_token_ids);
        if !request.output_token_ids.is_empty() {
            let end = num_prompt + request.output_token_ids.len();
            self.token_ids[slot][num_prompt..end].copy_from_slice(&request.output_token_ids);
        }

        self.num_tokens[slot] = request.num_tokens();
        self.num_computed_tokens[slot] = request.num_computed_tokens;

        self.page_table.add_row(&request.page_ids, slot)?;

        self.process_sampling_params(request, slot);
        Ok(())
    }

    fn process_sampling_params(&mut self, request: &CachedRequestState, slot: usize) {
        let req_id = request.req_id.clone();
        let sp = &request.sampling_params;

        match sp.sampling_type {
            SamplingType::Greedy => {
                self.temperature[slot] = GREEDY_TEMPERATURE;
                self.greedy.insert(req_id.clone());
            }
            SamplingType::Random => {
                self.temperature[slot] = sp.temperature;
                self.random.insert(req_id.clone());
            }
        }

        self.top_p[slot] = sp.top_p;
        if sp.top_p < 1.0 {
            self.needs_top_p.insert(req_id.clone());
        }

        if sp.top_k > 0 && (sp.top_k as usize) < self.vocab_size {
            self.needs_top_k.insert(req_id.clone());
            self.top_k[slot] = sp.top_k;
        } else {
            self.top_k[slot] = self.vocab_size as i32;
        }

        self.min_p[slot] = sp.min_p;
        if sp.min_p > 1e-5 {
            self.needs_min_p.insert(req_id.clone());
        }

        if sp.frequency_penalty != 0.0 {
            self.frequency_penalty[slot] = sp.frequency_penalty;
            self.has_freq_penalty.insert(req_id.clone());
        }
        if sp.presence_penalty != 0.0 {
            self.presence_penalty[slot] = sp.presence_penalty;
            self.has_pres_penalty.insert(req_id.clone());
        }
        if sp.repetition_penalty != 1.0 {
            self.repetition_penalty[slot] = sp.repetition_penalty;
            self.has_rep_penalty.insert(req_id.clone());
        }

        if sp.min_tokens > 0 {
            self.min_tokens.insert(slot, (sp.min_tokens, sp.all_stop_token_ids.clone()));
        }
        if let Some(seed) = sp.generator_seed {
            self.generator_seed.insert(slot, seed);
            self.generators.insert(slot, StdRng::seed_from_u64(seed));
        }
        if let Some(bias) = sp.logit_bias.clone() {
            self.logit_bias[slot] = Some(bias);
        }
        if let Some(allowed) = &sp.allowed_token_ids {
            self.has_allowed_token_ids.insert(req_id.clone());
            if self.allowed_token_ids_mask.is_none() {
                self.allowed_token_ids_mask = Some(AllowedTokenMask::new(self.max_num_reqs, self.vocab_size));
            }
            let mask = self.allowed_token_ids_mask.as_mut().unwrap();
            mask.set_all_disallowed(slot);
            for &tok in allowed {
                mask.allow(slot, tok);
            }
        }
        if let Some(bad) = sp.bad_words_token_ids.clone() {
            self.bad_words_token_ids.insert(slot, bad);
        }
    }

    /// Drop all state for `req_id`, leaving an *empty* slot to be condensed
    /// later. Returns the freed slot, if the request was present.
    pub fn remove_request(&mut self, req_id: &str) -> Option<usize> {
        let slot = self.req_id_to_index.remove(req_id)?;
        self.req_ids[slot] = None;

        for set in [
            &mut self.greedy,
            &mut self.random,
            &mut self.needs_top_p,
            &mut self.needs_top_k,
            &mut self.needs_min_p,
            &mut self.has_freq_penalty,
            &mut self.has_pres_penalty,
            &mut self.has_rep_penalty,
            &mut self.has_allowed_token_ids,
        ] {
            set.remove(req_id);
        }

        self.min_tokens.remove(&slot);
        self.generator_seed.remove(&slot);
        self.generators.remove(&slot);
        self.rewind_counter.remove(&slot);
        self.bad_words_token_ids.remove(&slot);
        self.logit_bias[slot] = None;
        if let Some(mask) = &mut self.allowed_token_ids_mask {
            mask.clear(slot);
        }

        Some(slot)
    }

    /// Symmetrical exchange of two slots' entire state.
    pub fn swap_states(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        self.req_ids.swap(i, j);
        if let Some(id) = self.req_ids[i].clone() {
            self.req_id_to_index.insert(id, i);
        }
        if let Some(id) = self.req_ids[j].clone() {
            self.req_id_to_index.insert(id, j);
        }

        self.token_ids.swap(i, j);
        for array in [
            &mut self.num_tokens,
            &mut self.num_prompt_tokens,
            &mut self.num_computed_tokens,
        ] {
            array.swap(i, j);
        }
        for array in [
            &mut self.temperature,
            &mut self.top_p,
            &mut self.min_p,
            &mut self.frequency_penalty,
            &mut self.presence_penalty,
            &mut self.repetition_penalty,
        ] {
            array.swap(i, j);
        }
        self.top_k.swap(i, j);
        self.logit_bias.swap(i, j);

        swap_sparse(&mut self.generator_seed, i, j);
        swap_sparse(&mut self.min_tokens, i, j);
        swap_sparse(&mut self.bad_words_token_ids, i, j);
        swap_sparse(&mut self.rewind_counter, i, j);
        swap_rng(&mut self.generators, i, j);

        if let Some(mask) = &mut self.allowed_token_ids_mask {
            mask.swap(i, j);
        }
        self.page_table.swap_row(i, j);
    }

    /// Restore the filled-prefix invariant by moving the highest-index
    /// filled slots into the lowest-index empty slots.
    pub fn condense(&mut self, empty_slots: &[usize]) {
        let num_reqs = self.num_reqs();
        if num_reqs == 0 {
            self.req_ids.clear();
            return;
        }

        let mut empty_slots: Vec<usize> = empty_slots.to_vec();
        empty_slots.sort_unstable();

        let mut last_req_index = num_reqs + empty_slots.len() - 1;
        for &empty_index in empty_slots.iter().rev() {
            while empty_slots.contains(&last_req_index) && last_req_index > empty_index {
                last_req_index -= 1;
            }
            if empty_index >= last_req_index {
                continue;
            }
            self.move_request(last_req_index, empty_index);
            last_req_index -= 1;
        }

        self.req_ids.truncate(num_reqs);
    }

    fn move_request(&mut self, from: usize, to: usize) {
        let req_id = self.req_ids[from].take().expect("move_request source slot must be filled");
        self.req_ids[to] = Some(req_id.clone());
        self.req_id_to_index.insert(req_id, to);

        let num_tokens = self.num_tokens[from];
        let (head, tail) = if from < to { self.token_ids.split_at_mut(to) } else { self.token_ids.split_at_mut(from) };
        if from < to {
            tail[0][..num_tokens].copy_from_slice(&head[from][..num_tokens]);
        } else {
            head[to][..num_tokens].copy_from_slice(&tail[0][..num_tokens]);
        }

        for array in [
            &mut self.num_tokens,
            &mut self.num_prompt_tokens,
            &mut self.num_computed_tokens,
        ] {
            array[to] = array[from];
        }
        for array in [
            &mut self.temperature,
            &mut self.top_p,
            &mut self.min_p,
            &mut self.frequency_penalty,
            &mut self.presence_penalty,
            &mut self.repetition_penalty,
        ] {
            array[to] = array[from];
        }
        self.top_k[to] = self.top_k[from];

        self.page_table.move_row(from, to);
        self.move_sparse_data(from, to);
    }

    fn move_sparse_data(&mut self, from: usize, to: usize) {
        if let Some(v) = self.generator_seed.remove(&from) {
            self.generator_seed.insert(to, v);
        }
        if let Some(v) = self.generators.remove(&from) {
            self.generators.insert(to, v);
        }
        if let Some(v) = self.min_tokens.remove(&from) {
            self.min_tokens.insert(to, v);
        }
        if let Some(v) = self.bad_words_token_ids.remove(&from) {
            self.bad_words_token_ids.insert(to, v);
        }
        if let Some(v) = self.rewind_counter.remove(&from) {
            self.rewind_counter.insert(to, v);
        }
        self.logit_bias[to] = self.logit_bias[from].take();
        if let Some(mask) = &mut self.allowed_token_ids_mask {
            mask.move_row(from, to);
        }
    }

    pub fn clear(&mut self) {
        self.req_ids.clear();
        self.req_id_to_index.clear();

        for row in &mut self.token_ids {
            row.iter_mut().for_each(|t| *t = 0);
        }
        for array in [&mut self.num_tokens, &mut self.num_prompt_tokens, &mut self.num_computed_tokens] {
            array.iter_mut().for_each(|v| *v = 0);
        }
        self.temperature.iter_mut().for_each(|v| *v = GREEDY_TEMPERATURE);
        self.top_p.iter_mut().for_each(|v| *v = 1.0);
        self.top_k.iter_mut().for_each(|v| *v = self.vocab_size as i32);
        self.min_p.iter_mut().for_each(|v| *v = 0.0);
        self.frequency_penalty.iter_mut().for_each(|v| *v = 0.0);
        self.presence_penalty.iter_mut().for_each(|v| *v = 0.0);
        self.repetition_penalty.iter_mut().for_each(|v| *v = 1.0);

        for set in [
            &mut self.greedy,
            &mut self.random,
            &mut self.needs_top_p,
            &mut self.needs_top_k,
            &mut self.needs_min_p,
            &mut self.has_freq_penalty,
            &mut self.has_pres_penalty,
            &mut self.has_rep_penalty,
            &mut self.has_allowed_token_ids,
        ] {
            set.clear();
        }

        self.min_tokens.clear();
        self.generator_seed.clear();
        self.generators.clear();
        self.rewind_counter.clear();
        self.bad_words_token_ids.clear();
        self.logit_bias.iter_mut().for_each(|b| *b = None);
        if let Some(mask) = &mut self.allowed_token_ids_mask {
            for w in &mut mask.words {
                *w = 0;
            }
        }
    }
}

fn swap_sparse<V>(map: &mut HashMap<usize, V>, i: usize, j: usize) {
    let a = map.remove(&i);
    let b = map.remove(&j);
    if let Some(b) = b {
        map.insert(i, b);
    }
    if let Some(a) = a {
        map.insert(j, a);
    }
}

fn swap_rng(map: &mut HashMap<usize, StdRng>, i: usize, j: usize) {
    swap_sparse(map, i, j);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CachedRequestState, SamplingParams, SamplingType};

    fn req(id: &str, prompt_len: usize) -> CachedRequestState {
        CachedRequestState::new(
            id.to_string(),
            (0..prompt_len as u32).collect(),
            SamplingParams::default(),
            vec![vec![]],
            0,
        )
    }

    #[test]
    fn dense_prefix_invariant_after_remove_and_condense() {
        let mut buf = SequenceBuffer::new(8, 64, 100, 4, 1);
        buf.add_request(&req("A", 4), None).unwrap();
        buf.add_request(&req("B", 4), None).unwrap();
        buf.add_request(&req("C", 4), None).unwrap();

        let freed = buf.remove_request("B").unwrap();
        buf.condense(&[freed]);

        assert_eq!(buf.num_reqs(), 2);
        assert_eq!(buf.req_id_at(0), Some("A"));
        assert_eq!(buf.req_id_at(1), Some("C"));
        assert_eq!(buf.req_id_to_index.get("A"), Some(&0));
        assert_eq!(buf.req_id_to_index.get("C"), Some(&1));
    }

    #[test]
    fn bijection_holds_after_mutations() {
        let mut buf = SequenceBuffer::new(8, 64, 100, 4, 1);
        for id in ["A", "B", "C", "D"] {
            buf.add_request(&req(id, 2), None).unwrap();
        }
        let freed = buf.remove_request("A").unwrap();
        buf.condense(&[freed]);
        for (id, slot) in buf.req_id_to_index.clone() {
            assert_eq!(buf.req_id_at(slot), Some(id.as_str()));
        }
        assert_eq!(buf.req_id_to_index.len(), buf.num_reqs());
    }

    #[test]
    fn greedy_membership_reflects_sampling_type() {
        let mut buf = SequenceBuffer::new(4, 64, 100, 4, 1);
        let mut greedy_req = req("A", 2);
        greedy_req.sampling_params.sampling_type = SamplingType::Greedy;
        buf.add_request(&greedy_req, None).unwrap();
        assert!(buf.all_greedy());

        let mut random_req = req("B", 2);
        random_req.sampling_params.sampling_type = SamplingType::Random;
        random_req.sampling_params.temperature = 0.7;
        buf.add_request(&random_req, None).unwrap();
        assert!(!buf.all_greedy());
        assert!(buf.random.contains("B"));
    }

    #[test]
    fn swap_then_move_keeps_sparse_maps_in_sync() {
        let mut buf = SequenceBuffer::new(8, 64, 100, 4, 1);
        let mut a = req("A", 2);
        a.sampling_params.generator_seed = Some(7);
        buf.add_request(&a, None).unwrap();
        buf.add_request(&req("B", 2), None).unwrap();
        buf.add_request(&req("C", 2), None).unwrap();

        buf.swap_states(0, 2);
        assert_eq!(buf.req_id_at(2), Some("A"));
        assert!(buf.generator_seed.contains_key(&2));
        assert!(!buf.generator_seed.contains_key(&0));

        let freed = buf.remove_request("B").unwrap();
        buf.condense(&[freed]);
        // C was at slot 0, A at slot 2; after removing B(slot1) and condensing,
        // the highest filled slot (2, holding A) moves into the hole at 1.
        assert_eq!(buf.req_id_to_index.get("A"), Some(&1));
        assert!(buf.generator_seed.contains_key(&1));
    }

    #[test]
    fn allowed_token_mask_lazily_allocates() {
        let mut buf = SequenceBuffer::new(4, 64, 8, 4, 1);
        assert!(buf.allowed_token_ids_mask.is_none());
        let mut a = req("A", 2);
        a.sampling_params.allowed_token_ids = Some(vec![1, 3]);
        buf.add_request(&a, None).unwrap();
        let mask = buf.allowed_token_ids_mask.as_ref().unwrap();
        assert!(!mask.is_disallowed(0, 1));
        assert!(!mask.is_disallowed(0, 3));
        assert!(mask.is_disallowed(0, 2));
    }
}
