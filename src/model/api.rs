//! OpenAI-compatible streaming completion client.
//!
//! Issues `POST {base_url}/chat/completions` with `stream: true` and fans the
//! server-sent-event chunks out into one channel per requested choice. Token
//! ids ride in the logprob token strings using the `token_id:<id>` encoding
//! that vLLM emits when `return_tokens_as_token_ids` is set; usage totals
//! arrive on the final event when `stream_options.include_usage` is set.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::stream::{ChoiceStream, GenerationRequest, StreamChunk, Usage};
use super::CompletionBackend;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Token-level log-probability entry inside a streamed delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLogProb {
    /// The token string (or `token_id:<id>` when ids are requested).
    pub token: String,
    /// The log probability of this token.
    pub logprob: f64,
}

/// Log-probability payload attached to a streamed choice delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaLogProbs {
    #[serde(default)]
    pub content: Option<Vec<TokenLogProb>>,
}

/// The incremental message content of one streamed choice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
}

/// One choice entry within a streamed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: usize,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub logprobs: Option<DeltaLogProbs>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Usage totals as reported on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WireUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A single server-sent event payload from the completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// HTTP client for an OpenAI-compatible streaming completions API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    /// The base URL for API requests (e.g. `"http://localhost:8000/v1"`).
    pub api_base: String,
    /// The API key used for bearer authentication.
    pub api_key: String,
    /// Model identifier sent with every request.
    pub model_id: String,
    /// Advertised maximum concurrent token throughput.
    pub token_capacity: u64,
    http: reqwest::Client,
}

impl HttpBackend {
    /// Create a new backend client pointing at `base_url`.
    ///
    /// No whole-request timeout is set on the HTTP client: streamed
    /// generations legitimately run for minutes and the collector bounds each
    /// request separately.
    pub fn new(base_url: &str, api_key: &str, model_id: &str, token_capacity: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            api_base: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model_id: model_id.to_string(),
            token_capacity,
            http,
        })
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<Vec<ChoiceStream>> {
        let url = format!("{}/chat/completions", self.api_base);
        debug!(
            model = %self.model_id,
            n = request.n,
            temperature = request.temperature,
            max_tokens = request.max_tokens,
            "sending streaming completion request"
        );

        let body = serde_json::json!({
            "model": self.model_id,
            "messages": [{"role": "user", "content": request.prompt}],
            "n": request.n,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "logprobs": request.logprobs,
            "return_tokens_as_token_ids": true,
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to send completion request")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("completion API returned {status}: {text}");
        }

        let mut senders = Vec::with_capacity(request.n);
        let mut streams = Vec::with_capacity(request.n);
        for index in 0..request.n {
            let (tx, stream) = ChoiceStream::channel(index);
            senders.push(Some(tx));
            streams.push(stream);
        }

        // The reader task owns the HTTP response. It exits when the server
        // finishes or when every consumer has closed its channel, which drops
        // the response and aborts the underlying request.
        tokio::spawn(route_stream(response, senders));

        Ok(streams)
    }

    fn token_capacity(&self) -> u64 {
        self.token_capacity
    }
}

/// Read the SSE byte stream and route parsed chunks to per-choice channels.
async fn route_stream(
    response: reqwest::Response,
    mut senders: Vec<Option<mpsc::Sender<StreamChunk>>>,
) {
    let mut bytes = response.bytes_stream();
    let mut buffer = String::new();

    'read: while let Some(piece) = bytes.next().await {
        let piece = match piece {
            Ok(piece) => piece,
            Err(error) => {
                warn!(error = %error, "completion stream ended with transport error");
                break;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&piece));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim().to_string();
            buffer.drain(..=newline);

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break 'read;
            }

            let event: StreamEvent = match serde_json::from_str(data) {
                Ok(event) => event,
                Err(error) => {
                    warn!(error = %error, "skipping malformed stream event");
                    continue;
                }
            };

            if deliver_event(&event, &mut senders).await.is_err() {
                // Every consumer is gone; stop reading and drop the request.
                break 'read;
            }
        }
    }
}

/// Fan one parsed event out to the choice channels it addresses.
///
/// Returns `Err(())` once all channels are closed.
async fn deliver_event(
    event: &StreamEvent,
    senders: &mut [Option<mpsc::Sender<StreamChunk>>],
) -> std::result::Result<(), ()> {
    for choice in &event.choices {
        let Some(slot) = senders.get_mut(choice.index) else {
            warn!(index = choice.index, "stream event for unknown choice index");
            continue;
        };
        let Some(tx) = slot.clone() else { continue };

        for chunk in chunks_for_choice(choice) {
            if tx.send(chunk).await.is_err() {
                // Consumer closed this choice; abandon it.
                *slot = None;
                break;
            }
        }
    }

    // The usage-bearing final event has an empty choice list; report totals
    // to every consumer still listening.
    if let Some(usage) = event.usage {
        let usage = Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        };
        for slot in senders.iter_mut() {
            let Some(tx) = slot.clone() else { continue };
            let chunk = StreamChunk {
                token_id: None,
                text: String::new(),
                logprob: None,
                usage: Some(usage),
            };
            if tx.send(chunk).await.is_err() {
                *slot = None;
            }
        }
    }

    if senders.iter().all(Option::is_none) {
        Err(())
    } else {
        Ok(())
    }
}

/// Expand one choice delta into per-token chunks.
///
/// When log-probabilities are present each entry becomes its own chunk with
/// an id parsed from the `token_id:<id>` encoding; the event's readable text
/// delta rides on the first chunk (the encoded token strings are not text).
/// Without log-probabilities the text delta is forwarded as a single id-less
/// chunk.
fn chunks_for_choice(choice: &StreamChoice) -> Vec<StreamChunk> {
    if let Some(entries) = choice.logprobs.as_ref().and_then(|lp| lp.content.as_ref()) {
        let mut text = choice.delta.content.clone().unwrap_or_default();
        entries
            .iter()
            .map(|entry| StreamChunk {
                token_id: parse_token_id(&entry.token),
                text: std::mem::take(&mut text),
                logprob: Some(entry.logprob),
                usage: None,
            })
            .collect()
    } else if let Some(content) = &choice.delta.content {
        if content.is_empty() {
            Vec::new()
        } else {
            vec![StreamChunk {
                token_id: None,
                text: content.clone(),
                logprob: None,
                usage: None,
            }]
        }
    } else {
        Vec::new()
    }
}

/// Parse the `token_id:<id>` wire encoding.
fn parse_token_id(token: &str) -> Option<u32> {
    token.strip_prefix("token_id:")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_token_id_encoding() {
        assert_eq!(parse_token_id("token_id:1234"), Some(1234));
        assert_eq!(parse_token_id("token_id:"), None);
        assert_eq!(parse_token_id("hello"), None);
    }

    #[test]
    fn expands_logprob_entries_into_chunks() {
        let choice = StreamChoice {
            index: 0,
            delta: Delta {
                content: Some("he llo".into()),
            },
            logprobs: Some(DeltaLogProbs {
                content: Some(vec![
                    TokenLogProb {
                        token: "token_id:5".into(),
                        logprob: -0.5,
                    },
                    TokenLogProb {
                        token: "token_id:9".into(),
                        logprob: -1.25,
                    },
                ]),
            }),
            finish_reason: None,
        };

        let chunks = chunks_for_choice(&choice);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].token_id, Some(5));
        assert_eq!(chunks[0].text, "he llo");
        assert!(chunks[1].text.is_empty());
        assert!((chunks[1].logprob.unwrap() - (-1.25)).abs() < 1e-9);
    }

    #[test]
    fn parses_stream_event_with_usage_only() {
        let data = r#"{"choices": [], "usage": {"prompt_tokens": 12, "completion_tokens": 34, "total_tokens": 46}}"#;
        let event: StreamEvent = serde_json::from_str(data).unwrap();
        assert!(event.choices.is_empty());
        assert_eq!(event.usage.unwrap().completion_tokens, 34);
    }

    #[tokio::test]
    async fn deliver_event_reports_all_closed() {
        let (tx, mut stream) = ChoiceStream::channel(0);
        stream.close();
        let mut senders = vec![Some(tx)];

        let event = StreamEvent {
            choices: vec![StreamChoice {
                index: 0,
                delta: Delta {
                    content: Some("hi".into()),
                },
                logprobs: None,
                finish_reason: None,
            }],
            usage: None,
        };

        assert!(deliver_event(&event, &mut senders).await.is_err());
    }
}
