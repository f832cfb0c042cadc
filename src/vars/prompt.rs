//! Model prompt state built up by the `model_prompt_*` operators.

use serde::{Deserialize, Serialize};

/// Role of a message in a model conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Conversation a work item sends with `call-model` steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPrompt {
    /// System prompt.
    pub base_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
}

impl ModelPrompt {
    /// Drop the base prompt and all messages.
    pub fn reset(&mut self) {
        self.base_prompt = None;
        self.messages.clear();
    }

    pub fn set_base_prompt(&mut self, text: impl Into<String>) {
        self.base_prompt = Some(text.into());
    }

    pub fn add_user(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::user(text));
    }

    pub fn add_assistant(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(text));
    }

    /// Full message list with the base prompt as a leading system message.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(base) = &self.base_prompt {
            out.push(ChatMessage {
                role: Role::System,
                content: base.clone(),
            });
        }
        out.extend(self.messages.iter().cloned());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_prompt_leads_messages() {
        let mut prompt = ModelPrompt::default();
        prompt.add_user("describe a cat");
        prompt.set_base_prompt("You write image prompts.");
        prompt.add_assistant("a tabby cat on a windowsill");

        let messages = prompt.to_messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[2].content, "a tabby cat on a windowsill");
    }

    #[test]
    fn reset_clears_everything() {
        let mut prompt = ModelPrompt::default();
        prompt.set_base_prompt("x");
        prompt.add_user("y");
        prompt.reset();
        assert!(prompt.to_messages().is_empty());
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }
}
