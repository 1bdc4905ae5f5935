use tiktoken_rs::{CoreBPE, o200k_base};
use tracing::warn;

use crate::protocol::{ChatCompletionRequest, ChatMessageContent};

/// Texts longer than this are estimated instead of encoded so a huge prompt
/// cannot stall the async worker
const MAX_ENCODED_BYTES: usize = 64 * 1024;

/// Advisory prompt token estimate, used for request logging only
pub struct TokenCounter {
    bpe: Option<CoreBPE>,
}

impl TokenCounter {
    /// Falls back to a character heuristic if the encoder cannot be built
    pub fn new() -> Self {
        let bpe = o200k_base()
            .inspect_err(|e| warn!(error = %e, "token encoder unavailable, using estimate"))
            .ok();
        Self { bpe }
    }

    pub fn count_text(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) if text.len() <= MAX_ENCODED_BYTES => {
                bpe.encode_with_special_tokens(text).len()
            }
            _ => text.len() / 4,
        }
    }

    /// Prompt tokens across message text and replayed tool calls
    pub fn count_request(&self, request: &ChatCompletionRequest) -> usize {
        request
            .messages
            .iter()
            .map(|msg| {
                let text = msg
                    .content
                    .as_ref()
                    .map(ChatMessageContent::flatten_text)
                    .unwrap_or_default();
                let calls: usize = msg
                    .tool_calls
                    .iter()
                    .flatten()
                    .map(|call| self.count_text(&call.function.arguments))
                    .sum();
                self.count_text(&text) + calls
            })
            .sum()
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}
