use powerproxy_core::slip::RoutingSlip;
use tiktoken_rs::CoreBPE;

/// Per-message overhead of the chat prompt format
/// (`<|start|>{role}\n{content}<|end|>`), plus the reply priming tokens.
const TOKENS_PER_MESSAGE: u64 = 3;
const TOKENS_PER_NAME: u64 = 1;
const REPLY_PRIMING_TOKENS: u64 = 3;

/// Token counting capability shared by plugins that meter usage.
///
/// Non-streaming responses carry an authoritative `usage` object; streamed
/// responses do not, so completion tokens are counted from the accumulated
/// deltas and prompt tokens are estimated from the request messages.
pub struct TokenCounter {
    bpe: CoreBPE,
}

impl TokenCounter {
    pub fn new() -> Result<Self, anyhow::Error> {
        Ok(Self {
            bpe: tiktoken_rs::cl100k_base()?,
        })
    }

    pub fn count_text(&self, text: &str) -> u64 {
        self.bpe.encode_ordinary(text).len() as u64
    }

    /// Take the counters from the `usage` object of a buffered upstream body.
    pub fn apply_body_counts(&self, slip: &mut RoutingSlip) {
        let read = |field: &str| -> u64 {
            slip.body_dict_from_target
                .as_ref()
                .and_then(|b| b.get("usage"))
                .and_then(|u| u.get(field))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        slip.usage.prompt_tokens = read("prompt_tokens");
        slip.usage.completion_tokens = read("completion_tokens");
        slip.usage.total_tokens = read("total_tokens");
    }

    /// Collect the delta content carried by the current streamed data event.
    pub fn accumulate_data_event(&self, slip: &mut RoutingSlip) {
        let Some(data) = slip.data_from_target.as_deref() else {
            return;
        };
        let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
            return;
        };
        let Some(choices) = event.get("choices").and_then(|c| c.as_array()) else {
            return;
        };
        for choice in choices {
            if let Some(content) = choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(|c| c.as_str())
            {
                slip.usage.streamed_content.push_str(content);
            }
        }
    }

    /// Derive the final counters once the stream has ended.
    pub fn finalize_stream_counts(&self, slip: &mut RoutingSlip) {
        slip.usage.completion_tokens = self.count_text(&slip.usage.streamed_content);
        slip.usage.prompt_tokens = self.estimate_prompt_tokens(slip.body_json.as_ref());
        slip.usage.total_tokens = slip.usage.prompt_tokens + slip.usage.completion_tokens;
    }

    /// Estimate prompt tokens from the chat messages of the request body.
    fn estimate_prompt_tokens(&self, body_json: Option<&serde_json::Value>) -> u64 {
        let Some(messages) = body_json
            .and_then(|b| b.get("messages"))
            .and_then(|m| m.as_array())
        else {
            return 0;
        };
        let mut tokens = 0;
        for message in messages {
            tokens += TOKENS_PER_MESSAGE;
            if let Some(role) = message.get("role").and_then(|r| r.as_str()) {
                tokens += self.count_text(role);
            }
            match message.get("content") {
                Some(serde_json::Value::String(content)) => tokens += self.count_text(content),
                Some(serde_json::Value::Array(parts)) => {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                            tokens += self.count_text(text);
                        }
                    }
                }
                _ => {}
            }
            if let Some(name) = message.get("name").and_then(|n| n.as_str()) {
                tokens += self.count_text(name) + TOKENS_PER_NAME;
            }
        }
        tokens + REPLY_PRIMING_TOKENS
    }
}
