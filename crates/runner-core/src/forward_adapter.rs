//! Bridges `runner_backend::InferenceBackend` (one sequence at a time, text
//! in/out) into the batched, logits-per-token contract
//! [`crate::runner::ForwardPass`] expects.
//!
//! No backend in this workspace currently exposes a real per-token vocab
//! distribution: `MockBackend::forward` always returns
//! `ForwardOutput::default()` (`logits: None`), and the llama.cpp FFI path
//! samples internally rather than handing back logits. Rows with no
//! backend-supplied logits fall back to the same deterministic
//! "peaked at token + 1" distribution the unit tests' `EchoForward` fixture
//! uses, so the continuous-batching step loop has something concrete to
//! drive end to end ahead of a real model integration.

use std::sync::Arc;

use runner_backend::{InferenceBackend, SequenceState};
use runner_common::Result;

use crate::input_assembler::CacheMetadata;
use crate::runner::ForwardPass;

pub struct BackendForwardPass {
    backend: Arc<dyn InferenceBackend>,
    vocab_size: usize,
}

impl BackendForwardPass {
    pub fn new(backend: Arc<dyn InferenceBackend>, vocab_size: usize) -> Self {
        Self { backend, vocab_size }
    }

    fn placeholder_row(&self, last_token: u32) -> Vec<f32> {
        let mut row = vec![0.0f32; self.vocab_size];
        row[(last_token as usize + 1) % self.vocab_size] = 10.0;
        row
    }
}

impl ForwardPass for BackendForwardPass {
    fn forward(
        &mut self,
        input_ids: &[u32],
        _position_ids: &[u32],
        _cache_metadata: &CacheMetadata,
        _seq_lens: &[u32],
    ) -> Result<Vec<Vec<f32>>> {
        let mut rows = Vec::with_capacity(input_ids.len());
        for &token in input_ids {
            let mut state = SequenceState { tokens: vec![token], max_new_tokens: 1 };
            let out = self.backend.forward(std::slice::from_mut(&mut state))?;
            let row = match out.logits {
                Some(logits) if logits.len() == self.vocab_size => logits,
                _ => self.placeholder_row(token),
            };
            rows.push(row);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_backend::mock::MockBackend;

    #[test]
    fn falls_back_to_placeholder_when_backend_gives_no_logits() {
        let backend: Arc<dyn InferenceBackend> = Arc::new(MockBackend::new());
        let mut pass = BackendForwardPass::new(backend, 8);
        let meta = CacheMetadata {
            kv_cache_start_indices: vec![],
            new_kv_start_indices: vec![],
            slice_lens: vec![],
            num_slices: 0,
            page_table_rows: vec![],
        };
        let rows = pass.forward(&[3], &[0], &meta, &[1]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][4], 10.0);
    }
}
