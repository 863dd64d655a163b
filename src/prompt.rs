//! Chat prompt assembly.
//!
//! Renders a message window into the model's role-tag format and tokenizes it:
//!
//! ```text
//! <init><start>system\n<content><end>\n
//! <start>user\n<content><end>\n
//! <start>assistant\n            (generation prompt)
//! ```

use onllm_tokenizer::{TokenId, Tokenizer};

use crate::conversation::{Message, Role};
use crate::error::{OnllmError, Result};

/// Role tags of a model's chat format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTemplate {
    /// Emitted once before the first message (often empty).
    pub init: String,
    /// Opens each message, followed by the role name and a newline.
    pub start: String,
    /// Closes each message, followed by a newline.
    pub end: String,
}

impl ChatTemplate {
    pub fn new(init: impl Into<String>, start: impl Into<String>, end: impl Into<String>) -> Self {
        ChatTemplate {
            init: init.into(),
            start: start.into(),
            end: end.into(),
        }
    }

    /// ChatML tags used by SmolLM2 and Qwen-style models.
    pub fn chatml() -> Self {
        Self::new("", "<|im_start|>", "<|im_end|>")
    }

    /// Build from a registry `tokens` list: `[init, start, end]`.
    pub fn from_tags(tags: &[String]) -> Result<Self> {
        match tags {
            [init, start, end] => Ok(Self::new(init.as_str(), start.as_str(), end.as_str())),
            _ => Err(OnllmError::Model(format!(
                "chat template needs 3 tags (init, start, end), got {}",
                tags.len()
            ))),
        }
    }

    /// Render messages to prompt text. Content is trimmed; messages with
    /// roles outside system/user/assistant are skipped.
    pub fn render_text(&self, messages: &[Message], add_generation_prompt: bool) -> String {
        let mut prompt = self.init.clone();
        for msg in messages {
            let role = match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Other(_) => continue,
            };
            prompt.push_str(&self.start);
            prompt.push_str(role);
            prompt.push('\n');
            prompt.push_str(msg.content.trim());
            prompt.push_str(&self.end);
            prompt.push('\n');
        }

        if add_generation_prompt {
            prompt.push_str(&self.start);
            prompt.push_str("assistant\n");
        }
        prompt
    }

    /// Render and tokenize without implicit special tokens.
    pub fn render(
        &self,
        tokenizer: &dyn Tokenizer,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> Result<Vec<TokenId>> {
        let text = self.render_text(messages, add_generation_prompt);
        Ok(tokenizer.encode(&text, false)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chatml_system_user_generation_prompt() {
        let messages = vec![Message::system("Be terse."), Message::user("Hi")];
        assert_eq!(
            ChatTemplate::chatml().render_text(&messages, true),
            "<|im_start|>system\nBe terse.<|im_end|>\n<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn content_trimmed_and_unknown_roles_dropped() {
        let messages = vec![
            Message::user("  padded \n"),
            Message::new("tool", "ignored"),
            Message::new("model", "reply"),
        ];
        assert_eq!(
            ChatTemplate::new("<s>", "[", "]").render_text(&messages, false),
            "<s>[user\npadded]\n[assistant\nreply]\n"
        );
    }

    #[test]
    fn empty_window_with_generation_prompt() {
        assert_eq!(
            ChatTemplate::chatml().render_text(&[], true),
            "<|im_start|>assistant\n"
        );
    }

    #[test]
    fn from_tags_requires_three() {
        let tags = vec!["".to_string(), "<a>".to_string(), "<b>".to_string()];
        assert_eq!(ChatTemplate::from_tags(&tags).unwrap().start, "<a>");
        assert!(ChatTemplate::from_tags(&tags[..2]).is_err());
    }
}
