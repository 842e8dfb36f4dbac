use anyhow::{Context, Error};
use http::{Method, Request, Response, Uri, header};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Bytes;

use crate::{
    http_util,
    message::{ConversationMessage, MessageRequest},
};

pub type ClientBody = BoxBody<Bytes, Error>;

/// Delivers a conversation to the relay.
pub trait Transport: Send + Sync {
    /// Resolves with the response head; the body streams the reply.
    fn send(
        &self,
        messages: Vec<ConversationMessage>,
    ) -> impl Future<Output = Result<Response<ClientBody>, Error>> + Send + '_;
}

/// Posts to the relay endpoint over HTTP(S).
#[derive(Clone, Debug)]
pub struct HttpTransport {
    url: Uri,
}

impl HttpTransport {
    pub fn new(url: Uri) -> Self {
        Self { url }
    }
}

impl Transport for HttpTransport {
    async fn send(&self, messages: Vec<ConversationMessage>) -> Result<Response<ClientBody>, Error> {
        let host = self.url.authority().context("Relay URL has no authority")?;
        let data = serde_json::to_vec(&MessageRequest { messages })?;
        let path = self
            .url
            .path_and_query()
            .map_or("/", |p| p.as_str());
        let req = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::HOST, host.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(data)))?;

        let mut sender = http_util::connect(&self.url).await?;
        let res = sender.send_request(req).await?;
        log::debug!("Relay responded: {}", res.status());
        Ok(res.map(|body| body.map_err(Error::from).boxed()))
    }
}
