use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::borrow::Cow;

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Body of a chat completion request.
///
/// The relay only ever asks for a streamed response, so `stream` is always `true`
/// for payloads built with [`CompletionRequest::new`].
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub max_tokens: u32,
    pub stream: bool,
    pub n: u32,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.4,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            max_tokens: 150,
            stream: true,
            n: 1,
        }
    }
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct Delta<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Cow<'a, str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Cow<'a, str>>,
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct StreamChoice<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub finish_reason: Option<Cow<'a, str>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseStreamChunk<'a> {
    pub choices: SmallVec<[StreamChoice<'a>; 1]>,
}

impl ResponseStreamChunk<'_> {
    /// Text carried by the first choice; a missing delta or content means no text.
    pub fn content(&self) -> Option<&str> {
        let delta = self.choices.first()?.delta.as_ref();
        Some(delta.and_then(|d| d.content.as_deref()).unwrap_or(""))
    }
}
