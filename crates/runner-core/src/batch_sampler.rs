//! Vectorized per-step sampling over the dense batch held by a
//! [`SequenceBuffer`](crate::sequence_buffer::SequenceBuffer).
//!
//! Operates on one logits row per active slot and applies the full policy
//! stack (allowed-token mask, bad words, logit bias, repetition/frequency/
//! presence penalties, min-tokens stop suppression, then greedy or
//! temperature/top-k/top-p/min-p random sampling) in the order the batch
//! runner applies them.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::sequence_buffer::SequenceBuffer;
use crate::types::GREEDY_TEMPERATURE;

#[derive(Debug, Clone, Default)]
pub struct SamplerOutput {
    /// One sampled token id per row in the input `logits`, in the same order.
    pub sampled_token_ids: Vec<u32>,
}

pub struct Sampler;

impl Sampler {
    /// `logits[row]` corresponds to absolute buffer slot `slot_offset + row`;
    /// passing `slot_offset != 0` samples one sub-batch of a larger step
    /// (see `Runner`'s oversize-step splitting) without disturbing the rest
    /// of the buffer's per-slot state.
    pub fn sample(buffer: &mut SequenceBuffer, slot_offset: usize, logits: &[Vec<f32>]) -> SamplerOutput {
        let mut sampled = Vec::with_capacity(logits.len());
        for (row, logits_row) in logits.iter().enumerate() {
            let slot = slot_offset + row;
            let mut scores = logits_row.clone();

            Self::apply_allowed_token_mask(buffer, slot, &mut scores);
            Self::apply_bad_words(buffer, slot, &mut scores);
            Self::apply_logit_bias(buffer, slot, &mut scores);
            Self::apply_penalties(buffer, slot, &mut scores);
            Self::apply_min_tokens(buffer, slot, &mut scores);

            let token = if buffer.temperature[slot] == GREEDY_TEMPERATURE {
                argmax(&scores)
            } else {
                Self::sample_random(buffer, slot, &scores)
            };
            sampled.push(token as u32);
        }
        SamplerOutput { sampled_token_ids: sampled }
    }

    fn apply_allowed_token_mask(buffer: &SequenceBuffer, slot: usize, scores: &mut [f32]) {
        let Some(mask) = &buffer.allowed_token_ids_mask else { return };
        if !buffer.has_allowed_token_ids.contains(buffer.req_id_at(slot).unwrap_or_default()) {
            return;
        }
        for (tok, score) in scores.iter_mut().enumerate() {
            if mask.is_disallowed(slot, tok as u32) {
                *score = f32::NEG_INFINITY;
            }
        }
    }

    fn apply_bad_words(buffer: &SequenceBuffer, slot: usize, scores: &mut [f32]) {
        let Some(bad_sequences) = buffer.bad_words_token_ids.get(&slot) else { return };
        let history = &buffer.token_ids[slot][..buffer.num_tokens[slot]];
        for seq in bad_sequences {
            if seq.is_empty() {
                continue;
            }
            let (last, prefix) = seq.split_last().unwrap();
            if history.ends_with(prefix) {
                if let Some(score) = scores.get_mut(*last as usize) {
                    *score = f32::NEG_INFINITY;
                }
            }
        }
    }

    fn apply_logit_bias(buffer: &SequenceBuffer, slot: usize, scores: &mut [f32]) {
        let Some(Some(bias)) = buffer.logit_bias.get(slot) else { return };
        for (&tok, &delta) in bias {
            if let Some(score) = scores.get_mut(tok as usize) {
                *score += delta;
            }
        }
    }

    fn apply_penalties(buffer: &SequenceBuffer, slot: usize, scores: &mut [f32]) {
        if buffer.no_penalties() {
            return;
        }
        let history = &buffer.token_ids[slot][..buffer.num_tokens[slot]];
        let mut counts: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();
        for &tok in history {
            *counts.entry(tok).or_insert(0) += 1;
        }

        let freq = buffer.frequency_penalty[slot];
        let pres = buffer.presence_penalty[slot];
        let rep = buffer.repetition_penalty[slot];

        for (&tok, &count) in &counts {
            let Some(score) = scores.get_mut(tok as usize) else { continue };
            if rep != 1.0 {
                *score = if *score > 0.0 { *score / rep } else { *score * rep };
            }
            *score -= freq * count as f32;
            if count > 0 {
                *score -= pres;
            }
        }
    }

    fn apply_min_tokens(buffer: &SequenceBuffer, slot: usize, scores: &mut [f32]) {
        let Some((min_tokens, stop_ids)) = buffer.min_tokens.get(&slot) else { return };
        let generated = buffer.num_tokens[slot].saturating_sub(buffer.num_prompt_tokens[slot]) as u32;
        if generated >= *min_tokens {
            return;
        }
        for &tok in stop_ids {
            if let Some(score) = scores.get_mut(tok as usize) {
                *score = f32::NEG_INFINITY;
            }
        }
    }

    fn sample_random(buffer: &mut SequenceBuffer, slot: usize, scores: &[f32]) -> usize {
        let temperature = buffer.temperature[slot].max(1e-5);
        let mut pairs: Vec<(usize, f32)> = scores.iter().enumerate().map(|(i, &l)| (i, l / temperature)).collect();
        pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let top_k = buffer.top_k[slot];
        let mut cutoff = pairs.len();
        if top_k > 0 && (top_k as usize) < cutoff {
            cutoff = top_k as usize;
        }
        pairs.truncate(cutoff);

        let max_logit = pairs.first().map(|p| p.1).unwrap_or(0.0);
        let mut probs: Vec<(usize, f32)> = pairs.iter().map(|&(i, l)| (i, (l - max_logit).exp())).collect();
        let sum: f32 = probs.iter().map(|p| p.1).sum();
        probs.iter_mut().for_each(|p| p.1 /= sum.max(1e-9));

        let top_p = buffer.top_p[slot];
        if top_p < 1.0 {
            let mut acc = 0.0f32;
            let mut keep = 0;
            for &(_, p) in &probs {
                acc += p;
                keep += 1;
                if acc >= top_p {
                    break;
                }
            }
            probs.truncate(keep.max(1));
        }

        let min_p = buffer.min_p[slot];
        if min_p > 1e-5 {
            let top = probs.iter().map(|p| p.1).fold(0.0f32, f32::max);
            let threshold = top * min_p;
            probs.retain(|&(_, p)| p >= threshold);
            if probs.is_empty() {
                return pairs[0].0;
            }
        }

        let z: f32 = probs.iter().map(|p| p.1).sum();
        probs.iter_mut().for_each(|p| p.1 /= z.max(1e-9));

        let r: f32 = match buffer.generators.get_mut(&slot) {
            Some(rng) => rng.gen(),
            None => {
                let mut rng = StdRng::from_entropy();
                rng.gen()
            }
        };
        let mut acc = 0.0f32;
        for (i, p) in &probs {
            acc += p;
            if r <= acc {
                return *i;
            }
        }
        probs.last().map(|p| p.0).unwrap_or(pairs[0].0)
    }
}

fn argmax(scores: &[f32]) -> usize {
    let mut best_i = 0;
    let mut best_v = f32::NEG_INFINITY;
    for (i, &v) in scores.iter().enumerate() {
        if v > best_v {
            best_v = v;
            best_i = i;
        }
    }
    best_i
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CachedRequestState, SamplingParams, SamplingType};

    fn buffer_with_one(sp: SamplingParams) -> SequenceBuffer {
        let mut buf = SequenceBuffer::new(4, 64, 8, 4, 1);
        let r = CachedRequestState::new("A".into(), vec![0, 1, 2], sp, vec![vec![0]], 0);
        buf.add_request(&r, None).unwrap();
        buf
    }

    #[test]
    fn greedy_picks_argmax() {
        let mut buf = buffer_with_one(SamplingParams::default());
        let logits = vec![vec![0.1, 5.0, 0.2, -1.0, 0.0, 0.0, 0.0, 0.0]];
        let out = Sampler::sample(&mut buf, 0, &logits);
        assert_eq!(out.sampled_token_ids, vec![1]);
    }

    #[test]
    fn allowed_token_mask_restricts_choice() {
        let mut sp = SamplingParams::default();
        sp.allowed_token_ids = Some(vec![3]);
        let mut buf = buffer_with_one(sp);
        let logits = vec![vec![9.0, 9.0, 9.0, 1.0, 9.0, 9.0, 9.0, 9.0]];
        let out = Sampler::sample(&mut buf, 0, &logits);
        assert_eq!(out.sampled_token_ids, vec![3]);
    }

    #[test]
    fn min_tokens_suppresses_stop_token() {
        let mut sp = SamplingParams::default();
        sp.min_tokens = 5;
        sp.all_stop_token_ids = [2].into_iter().collect();
        let mut buf = buffer_with_one(sp);
        let logits = vec![vec![0.0, 0.0, 9.0, 0.0, 0.0, 0.0, 0.0, 0.0]];
        let out = Sampler::sample(&mut buf, 0, &logits);
        assert_ne!(out.sampled_token_ids, vec![2]);
    }

    #[test]
    fn seeded_random_sampling_is_deterministic() {
        let mut sp = SamplingParams::default();
        sp.sampling_type = SamplingType::Random;
        sp.temperature = 1.0;
        sp.generator_seed = Some(42);
        let mut buf_a = buffer_with_one(sp.clone());
        let mut sp_b = sp.clone();
        sp_b.generator_seed = Some(42);
        let mut buf_b = buffer_with_one(sp_b);

        let logits = vec![vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]];
        let out_a = Sampler::sample(&mut buf_a, 0, &logits);
        let out_b = Sampler::sample(&mut buf_b, 0, &logits);
        assert_eq!(out_a.sampled_token_ids, out_b.sampled_token_ids);
    }
}
