use anyhow::Error;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, BodyStream, LengthLimitError, Limited, StreamBody};
use hyper::body::{Body, Bytes, Incoming};

use crate::{
    Outgoing, Service,
    error::RelayError,
    message::{ConversationMessage, MessageRequest},
    openai::{
        api,
        stream::{DEFAULT_WARMUP_CHUNKS, DeltaFilter, RelayStream},
        upstream::Upstream,
    },
    service::text_response,
};

pub const MAX_BODY_SIZE: usize = 64 * 1024;

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful customer support chatbot embedded on a website. \
Answer questions about the website and its content politely and concisely. \
Refuse to answer questions unrelated to the website. \
Reply in plain text or simple markdown, keeping answers short enough for a small chat window.";

/// `POST /api/message`: completes a conversation upstream and streams the reply text back.
pub struct MessageRelay<U> {
    upstream: U,
    model: String,
    system_prompt: String,
    warmup_chunks: usize,
}

impl<U: Upstream> MessageRelay<U> {
    pub fn new(upstream: U) -> Self {
        Self {
            upstream,
            model: api::DEFAULT_MODEL.to_owned(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
            warmup_chunks: DEFAULT_WARMUP_CHUNKS,
        }
    }

    pub fn model(self, model: Option<String>) -> Self {
        Self {
            model: model.unwrap_or(self.model),
            ..self
        }
    }

    pub fn system_prompt(self, system_prompt: Option<String>) -> Self {
        Self {
            system_prompt: system_prompt.unwrap_or(self.system_prompt),
            ..self
        }
    }

    pub fn warmup_chunks(self, warmup_chunks: usize) -> Self {
        Self {
            warmup_chunks,
            ..self
        }
    }

    /// Upstream payload for a validated conversation, instructions first.
    pub fn payload(&self, messages: &[ConversationMessage]) -> api::CompletionRequest {
        let messages = std::iter::once(api::Message::system(self.system_prompt.as_str()))
            .chain(messages.iter().map(|msg| {
                if msg.is_user_message {
                    api::Message::user(msg.text.as_str())
                } else {
                    api::Message::system(msg.text.as_str())
                }
            }))
            .collect();
        api::CompletionRequest::new(self.model.as_str(), messages)
    }

    /// Handles an already collected request body.
    pub async fn respond(&self, body: &[u8]) -> Result<Response<Outgoing>, Error> {
        match self.relay(body).await {
            Ok(res) => Ok(res),
            Err(err) => {
                match &err {
                    RelayError::UpstreamStatus { status, body } => {
                        log::error!("Upstream responded with {status}: {body}")
                    }
                    RelayError::UpstreamTransport(e) => log::error!("Upstream request failed: {e:?}"),
                    _ => log::warn!("Rejecting message request: {err}"),
                }
                let text = match err.status() {
                    StatusCode::BAD_GATEWAY => "Upstream completion request failed".to_owned(),
                    _ => err.to_string(),
                };
                text_response(err.status(), text)
            }
        }
    }

    async fn relay(&self, body: &[u8]) -> Result<Response<Outgoing>, RelayError> {
        let req = MessageRequest::from_slice(body)?;
        log::trace!("Incoming request struct: {req:?}");

        let payload = self.payload(&req.messages);
        log::trace!("Outgoing request struct: {payload:?}");

        let res = self
            .upstream
            .complete(payload)
            .await
            .map_err(RelayError::UpstreamTransport)?;
        if !res.status().is_success() {
            let status = res.status();
            let body = match res.into_body().collect().await {
                Ok(body) => String::from_utf8_lossy(&body.to_bytes()).into_owned(),
                Err(e) => format!("<cannot read body: {e}>"),
            };
            return Err(RelayError::UpstreamStatus { status, body });
        }

        let stream = RelayStream::new(
            BodyStream::new(res.into_body()),
            DeltaFilter::new(self.warmup_chunks),
        );
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(StreamBody::new(stream).boxed())
            .map_err(|e| RelayError::UpstreamTransport(e.into()))
    }
}

/// Collects at most `limit` bytes of `body`.
pub async fn collect_limited<B>(body: B, limit: usize) -> Result<Result<Bytes, RelayError>, Error>
where
    B: Body<Data = Bytes>,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(Ok(collected.to_bytes())),
        Err(err) if err.is::<LengthLimitError>() => {
            Ok(Err(RelayError::PayloadTooLarge { limit }))
        }
        Err(err) => Err(anyhow::anyhow!(err)),
    }
}

impl<U: Upstream> Service for MessageRelay<U> {
    async fn call(&self, req: Request<Incoming>) -> Result<Response<Outgoing>, Error> {
        log::trace!("Request: {req:?}");
        if req.method() != Method::POST {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "Only POST is allowed");
        }

        let body = match collect_limited(req.into_body(), MAX_BODY_SIZE).await? {
            Ok(body) => body,
            Err(err) => return text_response(err.status(), err.to_string()),
        };
        self.respond(&body).await
    }
}
