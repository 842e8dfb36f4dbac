use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// One entry of the chat shown to the user.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    pub is_user_message: bool,
    pub text: String,
}

impl ConversationMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(true, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(false, text)
    }

    fn new(is_user_message: bool, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            is_user_message,
            text: text.into(),
        }
    }
}

/// Body of `POST /api/message`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRequest {
    pub messages: Vec<ConversationMessage>,
}

impl MessageRequest {
    /// Parses and validates a request body.
    pub fn from_slice(body: &[u8]) -> Result<Self, RelayError> {
        let req: Self = serde_json::from_slice(body)?;
        if let Some(i) = req.messages.iter().position(|msg| msg.id.is_empty()) {
            return Err(RelayError::Validation(format!(
                "messages[{i}].id must not be empty"
            )));
        }
        Ok(req)
    }
}
