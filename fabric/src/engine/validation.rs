use crate::config::ChatSection;
use crate::error::ChatError;

/// Length limits applied to client input.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_username_length: usize,
    pub max_message_length: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_username_length: 50,
            max_message_length: 4000,
        }
    }
}

impl From<&ChatSection> for Limits {
    fn from(chat: &ChatSection) -> Self {
        Self {
            max_username_length: chat.max_username_length,
            max_message_length: chat.max_message_length,
        }
    }
}

/// What to do with a message body that passed validation.
#[derive(Debug, PartialEq, Eq)]
pub enum BodyCheck {
    Send,
    /// Empty or whitespace-only: accepted but nothing is broadcast or stored.
    Ignore,
}

/// Validate a username. Must be non-blank and at most `max_username_length` characters.
pub fn validate_username(username: &str, limits: &Limits) -> Result<(), ChatError> {
    if username.trim().is_empty() {
        return Err(ChatError::validation("Username cannot be empty"));
    }
    if username.chars().count() > limits.max_username_length {
        return Err(ChatError::validation(format!(
            "Username cannot exceed {} characters",
            limits.max_username_length
        )));
    }
    Ok(())
}

/// Validate a message body against the configured maximum.
pub fn validate_body(body: &str, limits: &Limits) -> Result<BodyCheck, ChatError> {
    if body.trim().is_empty() {
        return Ok(BodyCheck::Ignore);
    }
    if body.chars().count() > limits.max_message_length {
        return Err(ChatError::validation(format!(
            "Message cannot exceed {} characters",
            limits.max_message_length
        )));
    }
    Ok(BodyCheck::Send)
}
