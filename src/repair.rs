//! Expression repair: ask a chat model to rewrite an expression the
//! simulation API rejected.
//!
//! The orchestrator depends on [`ExpressionRepairer`] only, so the model call
//! is a black box that either produces a new candidate or fails.

use thiserror::Error;
use tracing::debug;

use crate::config::RepairConfig;
use crate::llm::{ChatClient, ChatMessage, ChatRequest, ChatSender, LlmError};
use crate::state_machine::Candidate;

const SYSTEM_PROMPT: &str = "You are an expert in Fast Expression syntax repair.";

const DEFAULT_TEMPLATE: &str = "The following Fast Expression failed to simulate on the \
WorldQuant BRAIN platform.\n\
\n\
Expression:\n\
{{ fast_expression }}\n\
\n\
Error returned by the platform:\n\
{{ error_mes }}\n\
\n\
Rewrite the expression so that it is syntactically valid and uses only existing \
operators and data fields, keeping its original intent. \
Reply with the corrected expression only, with no explanation and no markdown.";

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("repair model call failed: {0}")]
    Service(#[from] LlmError),

    #[error("repair model returned no expression")]
    Empty,

    #[error("repair model returned the failing expression unchanged")]
    Unchanged,
}

/// Produces a replacement for a candidate whose simulation failed.
pub trait ExpressionRepairer {
    async fn repair(&self, candidate: &Candidate, error_payload: &str) -> Result<Candidate, RepairError>;
}

pub fn render_prompt(template: &str, expression: &str, error: &str) -> String {
    template
        .replace("{{ fast_expression }}", expression)
        .replace("{{ error_mes }}", error)
}

/// Pull the expression out of a model answer, dropping code fences and
/// wrapping backticks.
pub fn extract_expression(answer: &str) -> Option<String> {
    let mut text = answer.trim();

    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        // Skip a language tag on the opening fence line.
        let body = match after.find('\n') {
            Some(nl) => &after[nl + 1..],
            None => after,
        };
        text = match body.find("```") {
            Some(end) => &body[..end],
            None => body,
        };
    }

    let text = text.trim().trim_matches('`').trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

pub struct LlmRepairer<S> {
    sender: S,
    model: String,
    temperature: f32,
    template: String,
}

impl<S: ChatSender> LlmRepairer<S> {
    pub fn new(sender: S, model: String, temperature: f32, template: Option<String>) -> Self {
        Self {
            sender,
            model,
            temperature,
            template: template.unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
        }
    }
}

impl LlmRepairer<ChatClient> {
    pub fn from_config(config: &RepairConfig) -> Result<Self, LlmError> {
        let client = ChatClient::new(config.api_key.clone(), &config.base_url)?;
        Ok(Self::new(
            client,
            config.model.clone(),
            config.temperature,
            config.prompt_template.clone(),
        ))
    }
}

impl<S: ChatSender> ExpressionRepairer for LlmRepairer<S> {
    async fn repair(&self, candidate: &Candidate, error_payload: &str) -> Result<Candidate, RepairError> {
        let req = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(render_prompt(&self.template, candidate.as_str(), error_payload)),
            ],
            temperature: self.temperature,
        };

        let response = self.sender.send_chat(&req).await?;
        let answer = response.first_text().ok_or(LlmError::EmptyResponse)?;
        debug!(answer, "repair model answered");

        let expression = extract_expression(answer).ok_or(RepairError::Empty)?;
        if expression == candidate.as_str() {
            return Err(RepairError::Unchanged);
        }
        Ok(Candidate::new(expression))
    }
}
