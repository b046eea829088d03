//! Sequence packing: variable-length rollouts into fixed-length buffers.
//!
//! Greedy first-fit bin packing. Each tokenized result occupies one
//! contiguous segment (prompt + completion) in exactly one buffer; trailing
//! capacity is padding. Results are never split across buffers: splitting a
//! completion would separate tokens from the causal context their loss is
//! computed against, so the cost is some wasted padding instead.
//!
//! Per buffer the packer emits parallel per-token arrays: token ids, loss
//! weights (the sample's advantage broadcast over its completion positions,
//! zero over prompt and padding), sampling log-probabilities (NaN where
//! unknown), and segment metadata recording which sample owns which token
//! range.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// A graded, advantage-weighted rollout ready for packing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizedResult {
    pub task_id: String,
    pub choice_index: usize,
    /// Full prompt token ids.
    pub prompt_tokens: Vec<u32>,
    /// Completion token ids.
    pub completion_tokens: Vec<u32>,
    /// Per-token log-probabilities, parallel to `completion_tokens`.
    pub logprobs: Option<Vec<f64>>,
    pub reward: f64,
    /// Group-relative advantage; the training weight of every completion
    /// token.
    pub advantage: f64,
}

impl TokenizedResult {
    /// Total packed length: prompt plus completion.
    pub fn total_len(&self) -> usize {
        self.prompt_tokens.len() + self.completion_tokens.len()
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Provenance for one packed sample: which token range it occupies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub task_id: String,
    pub choice_index: usize,
    /// Offset of the segment's first token within the buffer.
    pub start: usize,
    /// Number of leading prompt tokens (they carry zero weight).
    pub prompt_len: usize,
    /// Total segment length including the prompt.
    pub len: usize,
}

/// One fixed-length training buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackedBuffer {
    /// Token ids; exactly `seq_len` long.
    pub tokens: Vec<u32>,
    /// Per-token loss weights, parallel to `tokens`.
    pub weights: Vec<f32>,
    /// Per-token sampling log-probabilities, parallel to `tokens`; NaN where
    /// unknown (prompt tokens, padding, samples without logprobs).
    pub logprobs: Vec<f32>,
    /// Which sample occupies which token range.
    pub segments: Vec<Segment>,
}

impl PackedBuffer {
    fn with_capacity(seq_len: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(seq_len),
            weights: Vec::with_capacity(seq_len),
            logprobs: Vec::with_capacity(seq_len),
            segments: Vec::new(),
        }
    }

    /// Tokens currently occupied by segments.
    pub fn used(&self) -> usize {
        self.tokens.len()
    }

    fn place(&mut self, result: &TokenizedResult) {
        let start = self.tokens.len();
        self.segments.push(Segment {
            task_id: result.task_id.clone(),
            choice_index: result.choice_index,
            start,
            prompt_len: result.prompt_tokens.len(),
            len: result.total_len(),
        });

        self.tokens.extend_from_slice(&result.prompt_tokens);
        self.weights
            .extend(std::iter::repeat(0.0).take(result.prompt_tokens.len()));
        self.logprobs
            .extend(std::iter::repeat(f32::NAN).take(result.prompt_tokens.len()));

        self.tokens.extend_from_slice(&result.completion_tokens);
        self.weights.extend(
            std::iter::repeat(result.advantage as f32).take(result.completion_tokens.len()),
        );
        match &result.logprobs {
            Some(logprobs) => self.logprobs.extend(logprobs.iter().map(|lp| *lp as f32)),
            None => self
                .logprobs
                .extend(std::iter::repeat(f32::NAN).take(result.completion_tokens.len())),
        }
    }

    fn pad_to(&mut self, seq_len: usize, pad_token_id: u32) {
        self.tokens.resize(seq_len, pad_token_id);
        self.weights.resize(seq_len, 0.0);
        self.logprobs.resize(seq_len, f32::NAN);
    }
}

/// A result that cannot fit into any buffer. Indicates a configuration
/// mismatch between sampling limits and packing capacity; surfaced distinctly
/// and never silently truncated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OversizedResult {
    pub task_id: String,
    pub choice_index: usize,
    pub len: usize,
    pub seq_len: usize,
}

/// The outcome of one packing pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackOutput {
    pub buffers: Vec<PackedBuffer>,
    /// Results rejected because `prompt + completion` exceeded `seq_len`.
    pub oversized: Vec<OversizedResult>,
}

#[derive(Debug, Error)]
pub enum PackError {
    #[error("sequence length must be positive")]
    ZeroSeqLen,
}

// ---------------------------------------------------------------------------
// Packing
// ---------------------------------------------------------------------------

/// Pack tokenized results into `seq_len`-token buffers.
///
/// First fit in arrival order: each result lands in the first open buffer
/// with enough remaining capacity, or opens a new one. Every returned buffer
/// is exactly `seq_len` tokens (segments end to end, then padding).
pub fn pack(
    results: &[TokenizedResult],
    seq_len: usize,
    pad_token_id: u32,
) -> Result<PackOutput, PackError> {
    if seq_len == 0 {
        return Err(PackError::ZeroSeqLen);
    }

    let mut buffers: Vec<PackedBuffer> = Vec::new();
    let mut oversized = Vec::new();

    for result in results {
        let len = result.total_len();
        if len > seq_len {
            warn!(
                task = %result.task_id,
                choice = result.choice_index,
                len,
                seq_len,
                "tokenized result exceeds the sequence length"
            );
            oversized.push(OversizedResult {
                task_id: result.task_id.clone(),
                choice_index: result.choice_index,
                len,
                seq_len,
            });
            continue;
        }

        let slot = buffers
            .iter_mut()
            .find(|buffer| seq_len - buffer.used() >= len);
        match slot {
            Some(buffer) => buffer.place(result),
            None => {
                let mut buffer = PackedBuffer::with_capacity(seq_len);
                buffer.place(result);
                buffers.push(buffer);
            }
        }
    }

    for buffer in &mut buffers {
        buffer.pad_to(seq_len, pad_token_id);
    }

    debug!(
        results = results.len(),
        buffers = buffers.len(),
        oversized = oversized.len(),
        "packing complete"
    );
    Ok(PackOutput { buffers, oversized })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(task_id: &str, prompt_len: usize, completion_len: usize) -> TokenizedResult {
        TokenizedResult {
            task_id: task_id.to_string(),
            choice_index: 0,
            prompt_tokens: vec![1; prompt_len],
            completion_tokens: vec![2; completion_len],
            logprobs: None,
            reward: 1.0,
            advantage: 0.5,
        }
    }

    #[test]
    fn buffers_are_exactly_seq_len() {
        let results = vec![result("a", 10, 20), result("b", 5, 5)];
        let output = pack(&results, 64, 9).unwrap();

        assert_eq!(output.buffers.len(), 1);
        let buffer = &output.buffers[0];
        assert_eq!(buffer.tokens.len(), 64);
        assert_eq!(buffer.weights.len(), 64);
        assert_eq!(buffer.logprobs.len(), 64);

        // Non-padding tokens equal the sum of segment lengths.
        let segment_total: usize = buffer.segments.iter().map(|s| s.len).sum();
        assert_eq!(segment_total, 40);
        assert!(buffer.tokens[40..].iter().all(|&t| t == 9));
    }

    #[test]
    fn first_fit_never_splits_a_result() {
        // Five 40-token results into 100-token buffers: 1-2 share a buffer,
        // 3-4 share the next, 5 opens a third. No segment crosses a buffer.
        let results: Vec<TokenizedResult> = (0..5)
            .map(|i| result(&format!("r{i}"), 15, 25))
            .collect();
        let output = pack(&results, 100, 0).unwrap();

        assert_eq!(output.buffers.len(), 3);
        let counts: Vec<usize> = output
            .buffers
            .iter()
            .map(|buffer| buffer.segments.len())
            .collect();
        assert_eq!(counts, vec![2, 2, 1]);

        for buffer in &output.buffers {
            for segment in &buffer.segments {
                assert!(segment.start + segment.len <= 100);
                assert_eq!(segment.len, 40);
            }
        }
    }

    #[test]
    fn first_fit_reuses_earlier_buffers() {
        // 60 + 60 open two buffers; the following 30 fits back into the first.
        let results = vec![result("a", 0, 60), result("b", 0, 60), result("c", 0, 30)];
        let output = pack(&results, 100, 0).unwrap();

        assert_eq!(output.buffers.len(), 2);
        assert_eq!(output.buffers[0].segments.len(), 2);
        assert_eq!(output.buffers[0].segments[1].task_id, "c");
        assert_eq!(output.buffers[0].segments[1].start, 60);
    }

    #[test]
    fn oversized_results_are_reported_not_truncated() {
        let results = vec![result("big", 50, 80), result("ok", 10, 10)];
        let output = pack(&results, 100, 0).unwrap();

        assert_eq!(output.oversized.len(), 1);
        assert_eq!(output.oversized[0].task_id, "big");
        assert_eq!(output.oversized[0].len, 130);

        // The fitting result still packs normally.
        assert_eq!(output.buffers.len(), 1);
        assert_eq!(output.buffers[0].segments.len(), 1);
        assert_eq!(output.buffers[0].segments[0].task_id, "ok");
    }

    #[test]
    fn weights_cover_completions_only() {
        let mut r = result("a", 3, 4);
        r.advantage = -0.75;
        r.logprobs = Some(vec![-0.1, -0.2, -0.3, -0.4]);
        let output = pack(&[r], 10, 0).unwrap();
        let buffer = &output.buffers[0];

        // Prompt positions carry zero weight and NaN logprobs.
        assert_eq!(&buffer.weights[..3], &[0.0, 0.0, 0.0]);
        assert!(buffer.logprobs[..3].iter().all(|lp| lp.is_nan()));

        // Completion positions carry the advantage and the logprobs.
        assert!(buffer.weights[3..7].iter().all(|&w| (w + 0.75).abs() < 1e-6));
        assert!((buffer.logprobs[4] + 0.2).abs() < 1e-6);

        // Padding carries zero weight and NaN logprobs.
        assert!(buffer.weights[7..].iter().all(|&w| w == 0.0));
        assert!(buffer.logprobs[7..].iter().all(|lp| lp.is_nan()));
    }

    #[test]
    fn exact_fit_leaves_no_padding() {
        let output = pack(&[result("a", 50, 50)], 100, 7).unwrap();
        let buffer = &output.buffers[0];
        assert_eq!(buffer.used(), 100);
        assert!(!buffer.tokens.contains(&7));
    }

    #[test]
    fn zero_seq_len_is_rejected() {
        assert!(matches!(
            pack(&[result("a", 1, 1)], 0, 0),
            Err(PackError::ZeroSeqLen)
        ));
    }

    #[test]
    fn empty_input_packs_to_nothing() {
        let output = pack(&[], 128, 0).unwrap();
        assert!(output.buffers.is_empty());
        assert!(output.oversized.is_empty());
    }
}
