//! The completion provider capability consumed by the dispatcher.

use crate::error::CompletionError;
use crate::job::RequestSettings;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;

/// A lazy, finite, non-restartable sequence of generated text chunks.
///
/// The stream ends (yields `None`) when generation is complete; a chunk-level
/// error terminates it early.
pub type CompletionStream = BoxStream<'static, Result<String, CompletionError>>;

/// Counts tokens in a string, pluggable per connector (exact tokenizer or a
/// cheap approximation).
pub type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Whitespace-word token approximation, the default when a connector has no
/// exact tokenizer.
pub fn whitespace_token_counter() -> TokenCounter {
    Arc::new(|text: &str| text.split_whitespace().count())
}

/// A backend capable of generating text completions for a prompt.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Generates the full completion for `prompt`.
    async fn complete(
        &self,
        prompt: &str,
        settings: &RequestSettings,
    ) -> Result<String, CompletionError>;

    /// Streaming variant. The default wraps [`complete`](Self::complete) in
    /// a single-chunk stream for providers without native streaming.
    async fn complete_stream(
        &self,
        prompt: &str,
        settings: &RequestSettings,
    ) -> Result<CompletionStream, CompletionError> {
        let text = self.complete(prompt, settings).await?;
        Ok(futures::stream::once(async move { Ok(text) }).boxed())
    }
}
