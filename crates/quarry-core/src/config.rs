use secrecy::{ExposeSecret, SecretString};

use crate::errors::ValidationError;
use crate::messages::Message;

/// Per-query parameters sent alongside the messages.
#[derive(Clone, Debug)]
pub struct QueryConfig {
    /// Opaque bearer credential.
    pub token: SecretString,
    pub model: String,
    /// Knowledge bases to search. At least one non-blank id is required.
    pub kb_list: Vec<String>,
    /// Restrict retrieval to these document ids. Empty means all.
    pub documents: Vec<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub response_format: Option<String>,
    /// Streaming endpoint (deltas) or the single-response endpoint.
    pub stream: bool,
}

impl QueryConfig {
    pub fn new(token: impl Into<String>, kb_list: Vec<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            model: String::new(),
            kb_list,
            documents: Vec::new(),
            temperature: None,
            max_tokens: None,
            response_format: None,
            stream: true,
        }
    }

    /// Preconditions checked before any network call.
    pub fn validate(&self, messages: &[Message]) -> Result<(), ValidationError> {
        if self.token.expose_secret().trim().is_empty() {
            return Err(ValidationError::MissingCredential);
        }
        if !self.kb_list.iter().any(|kb| !kb.trim().is_empty()) {
            return Err(ValidationError::MissingKnowledgeBase);
        }
        match messages.last() {
            None => Err(ValidationError::EmptyMessages),
            Some(last) if last.is_blank() => Err(ValidationError::EmptyMessage),
            Some(_) => Ok(()),
        }
    }

    /// Knowledge base ids with blanks removed.
    pub fn knowledge_bases(&self) -> Vec<String> {
        self.kb_list
            .iter()
            .map(|kb| kb.trim())
            .filter(|kb| !kb.is_empty())
            .map(String::from)
            .collect()
    }
}
