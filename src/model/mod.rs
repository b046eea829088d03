//! Inference backend abstractions.
//!
//! This module provides:
//! - [`stream`] -- chunk and choice-stream types shared by every backend;
//!   streams are cancellable mpsc channels.
//! - [`api::HttpBackend`] -- OpenAI-compatible streaming completions client.
//! - [`mock::MockBackend`] -- scripted backend for tests and `--mock` runs.

pub mod api;
pub mod mock;
pub mod stream;

use anyhow::Result;
use async_trait::async_trait;

pub use api::HttpBackend;
pub use mock::{MockBackend, MockReply, ScriptedChoice};
pub use stream::{ChoiceStream, GenerationRequest, StreamChunk, Usage};

/// The generation capability the rollout collector depends on.
///
/// One call produces `request.n` candidate completions, each as an
/// independently cancellable chunk stream. Implementations must tolerate a
/// consumer abandoning any subset of streams at any time.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Issue one generation request and return one stream per choice.
    async fn generate(&self, request: GenerationRequest) -> Result<Vec<ChoiceStream>>;

    /// The backend's maximum concurrent token throughput. Used to size the
    /// rate governor.
    fn token_capacity(&self) -> u64;
}
