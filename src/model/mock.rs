//! Scripted mock backend.
//!
//! Replays canned token streams so the collector, the iteration loop, and the
//! CLI `--mock` mode can run without an inference server. Streams are driven
//! through real channels by spawned producer tasks, so consumer-side
//! cancellation behaves exactly as it does against the HTTP backend.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::stream::{ChoiceStream, GenerationRequest, StreamChunk, Usage};
use super::CompletionBackend;

/// One scripted candidate completion.
#[derive(Debug, Clone)]
pub struct ScriptedChoice {
    /// The token text emitted per chunk; joined, this is the candidate text.
    pub texts: Vec<String>,
    /// Token ids, parallel to `texts`.
    pub token_ids: Vec<u32>,
    /// Per-token log-probabilities, parallel to `texts` (empty = none).
    pub logprobs: Vec<f64>,
    /// Whether a usage chunk is emitted at the end of the stream.
    pub include_usage: bool,
}

impl ScriptedChoice {
    /// A choice that spells out `text` one word per chunk with a constant
    /// log-probability and sequential token ids.
    pub fn from_text(text: &str, logprob: f64) -> Self {
        let texts: Vec<String> = text
            .split_whitespace()
            .map(|word| format!("{word} "))
            .collect();
        let token_ids = (0..texts.len() as u32).collect();
        let logprobs = vec![logprob; texts.len()];
        Self {
            texts,
            token_ids,
            logprobs,
            include_usage: true,
        }
    }

    /// A choice emitting `len` identical filler tokens at `logprob`, for
    /// exercising the early-stop monitor.
    pub fn filler(len: usize, logprob: f64) -> Self {
        Self {
            texts: vec!["x ".to_string(); len],
            token_ids: (0..len as u32).collect(),
            logprobs: vec![logprob; len],
            include_usage: true,
        }
    }
}

/// One scripted reply to a generation request.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Stream the given choices.
    Choices(Vec<ScriptedChoice>),
    /// Fail the request up front.
    Failure(String),
}

/// A backend that replays scripts keyed by prompt, with a deterministic
/// default for prompts that have no script.
#[derive(Debug)]
pub struct MockBackend {
    scripts: Mutex<HashMap<String, VecDeque<MockReply>>>,
    token_capacity: u64,
}

impl MockBackend {
    pub fn new(token_capacity: u64) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            token_capacity,
        }
    }

    /// Queue a scripted reply for `prompt`. Replies are consumed in order;
    /// once the queue is empty the default behavior takes over again.
    pub fn script(&self, prompt: &str, reply: MockReply) {
        self.scripts
            .lock()
            .expect("mock script lock poisoned")
            .entry(prompt.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Default reply: alternate between a "correct" and an "incorrect"
    /// answer by choice parity, so every even-sized group has reward
    /// variance under a keyword grader.
    fn default_reply(n: usize) -> Vec<ScriptedChoice> {
        (0..n)
            .map(|index| {
                if index % 2 == 0 {
                    ScriptedChoice::from_text("the answer is 42", -0.25)
                } else {
                    ScriptedChoice::from_text("i am not sure", -1.5)
                }
            })
            .collect()
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<Vec<ChoiceStream>> {
        let reply = self
            .scripts
            .lock()
            .expect("mock script lock poisoned")
            .get_mut(&request.prompt)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| MockReply::Choices(Self::default_reply(request.n)));

        let choices = match reply {
            MockReply::Failure(message) => anyhow::bail!("mock backend failure: {message}"),
            MockReply::Choices(choices) => choices,
        };

        let prompt_tokens = (request.prompt.len() / 4) as u64;
        let mut streams = Vec::with_capacity(choices.len());
        for (index, choice) in choices.into_iter().enumerate() {
            let (tx, stream) = ChoiceStream::channel(index);
            streams.push(stream);
            tokio::spawn(async move {
                for (position, text) in choice.texts.iter().enumerate() {
                    let chunk = StreamChunk {
                        token_id: choice.token_ids.get(position).copied(),
                        text: text.clone(),
                        logprob: choice.logprobs.get(position).copied(),
                        usage: None,
                    };
                    if tx.send(chunk).await.is_err() {
                        // Consumer cancelled; stop producing.
                        return;
                    }
                }
                if choice.include_usage {
                    let completion_tokens = choice.texts.len() as u64;
                    let _ = tx
                        .send(StreamChunk {
                            token_id: None,
                            text: String::new(),
                            logprob: None,
                            usage: Some(Usage {
                                prompt_tokens,
                                completion_tokens,
                                total_tokens: prompt_tokens + completion_tokens,
                            }),
                        })
                        .await;
                }
            });
        }

        Ok(streams)
    }

    fn token_capacity(&self) -> u64 {
        self.token_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_reply_is_streamed() {
        let backend = MockBackend::new(1024);
        backend.script(
            "p",
            MockReply::Choices(vec![ScriptedChoice::from_text("a b c", -0.5)]),
        );

        let mut streams = backend
            .generate(GenerationRequest::new("p", 1))
            .await
            .unwrap();
        let mut stream = streams.pop().unwrap();

        let mut tokens = 0;
        let mut usage = None;
        while let Some(chunk) = stream.next_chunk().await {
            if chunk.usage.is_some() {
                usage = chunk.usage;
            } else {
                tokens += 1;
            }
        }
        assert_eq!(tokens, 3);
        assert_eq!(usage.unwrap().completion_tokens, 3);
    }

    #[tokio::test]
    async fn scripted_failure_propagates() {
        let backend = MockBackend::new(1024);
        backend.script("p", MockReply::Failure("boom".into()));

        let result = backend.generate(GenerationRequest::new("p", 2)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn default_reply_alternates_by_parity() {
        let backend = MockBackend::new(1024);
        let streams = backend
            .generate(GenerationRequest::new("anything", 4))
            .await
            .unwrap();
        assert_eq!(streams.len(), 4);

        let mut texts = Vec::new();
        for mut stream in streams {
            let mut text = String::new();
            while let Some(chunk) = stream.next_chunk().await {
                text.push_str(&chunk.text);
            }
            texts.push(text);
        }
        assert!(texts[0].contains("42"));
        assert!(!texts[1].contains("42"));
        assert!(texts[2].contains("42"));
    }
}
