//! Streaming completion primitives.
//!
//! A generation request fans out into one [`ChoiceStream`] per requested
//! candidate. Each stream is a bounded mpsc channel: the producer side is
//! driven by the backend (an HTTP reader task or a mock script) and the
//! consumer side is pulled by the rollout collector. Cancellation is
//! cooperative and channel-shaped: the consumer closes its receiver, the
//! producer's next send fails, and the producer stops doing work for that
//! choice. No exceptions are used for control flow.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Chunks buffered per choice before the producer awaits the consumer.
pub const CHUNK_CHANNEL_CAPACITY: usize = 256;

/// Token usage totals reported by the backend on the final chunk of a stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u64,
    /// Tokens generated in the completion.
    pub completion_tokens: u64,
    /// Total tokens (prompt + completion).
    pub total_tokens: u64,
}

/// One streamed token chunk of a candidate completion.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// Token id, when the backend reports ids (see
    /// [`super::api::HttpBackend`] for the wire encoding). Absent ids are
    /// tolerated but make the resulting sample unusable for packing.
    pub token_id: Option<u32>,
    /// Decoded token text.
    pub text: String,
    /// Log-probability of this token under the sampling policy.
    pub logprob: Option<f64>,
    /// Usage totals; set on the final chunk only.
    pub usage: Option<Usage>,
}

/// A single generation request: one prompt, `n` candidate completions.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Number of candidate completions to sample. Always >= 1.
    pub n: usize,
    pub temperature: f64,
    pub max_tokens: usize,
    pub logprobs: bool,
}

impl GenerationRequest {
    /// Build a request, clamping `n` to at least one choice.
    pub fn new(prompt: impl Into<String>, n: usize) -> Self {
        Self {
            prompt: prompt.into(),
            n: n.max(1),
            temperature: 1.0,
            max_tokens: 4096,
            logprobs: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Choice stream
// ---------------------------------------------------------------------------

/// The consumer half of one candidate completion's chunk channel.
#[derive(Debug)]
pub struct ChoiceStream {
    /// Zero-based index of this choice within its generation request.
    pub index: usize,
    rx: mpsc::Receiver<StreamChunk>,
}

impl ChoiceStream {
    /// Create a channel pair for one choice. The sender goes to the producer,
    /// the returned stream to the consumer.
    pub fn channel(index: usize) -> (mpsc::Sender<StreamChunk>, Self) {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        (tx, Self { index, rx })
    }

    /// Receive the next chunk, or `None` once the producer is done.
    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        self.rx.recv().await
    }

    /// Stop consuming this stream. The producer observes the closed channel
    /// on its next send and abandons the choice; chunks already buffered are
    /// discarded.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_arrive_in_emission_order() {
        let (tx, mut stream) = ChoiceStream::channel(0);
        for i in 0..5u32 {
            tx.send(StreamChunk {
                token_id: Some(i),
                text: format!("t{i}"),
                logprob: Some(-0.1),
                usage: None,
            })
            .await
            .unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(chunk) = stream.next_chunk().await {
            seen.push(chunk.token_id.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn closing_the_stream_stops_the_producer() {
        let (tx, mut stream) = ChoiceStream::channel(0);
        stream.close();

        let sent = tx
            .send(StreamChunk {
                token_id: Some(1),
                text: "x".into(),
                logprob: None,
                usage: None,
            })
            .await;
        assert!(sent.is_err());
    }

    #[test]
    fn request_clamps_n_to_one() {
        let request = GenerationRequest::new("prompt", 0);
        assert_eq!(request.n, 1);
    }
}
