use anyhow::{Context, Error};
use http::{Method, Request, Response, Uri, header};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Bytes;

use crate::{http_util, openai::api};

pub const OPENAI_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

pub type UpstreamBody = BoxBody<Bytes, Error>;

/// Completion endpoint the relay forwards conversations to.
pub trait Upstream: Send + Sync {
    /// Sends `payload` and resolves once the response head has arrived.
    fn complete(
        &self,
        payload: api::CompletionRequest,
    ) -> impl Future<Output = Result<Response<UpstreamBody>, Error>> + Send + '_;
}

/// Chat completion API reached over HTTP(S), one connection per request.
#[derive(Clone, Debug)]
pub struct HttpUpstream {
    url: Uri,
    api_key: Option<String>,
}

impl HttpUpstream {
    pub fn new(url: Uri) -> Self {
        Self { url, api_key: None }
    }

    pub fn api_key(self, api_key: Option<String>) -> Self {
        Self { api_key, ..self }
    }
}

impl Upstream for HttpUpstream {
    async fn complete(
        &self,
        payload: api::CompletionRequest,
    ) -> Result<Response<UpstreamBody>, Error> {
        let host = self
            .url
            .authority()
            .context("Upstream URL has no authority")?;
        let data = Bytes::from(serde_json::to_vec(&payload)?);
        log::trace!(
            "Outgoing request data: {}",
            String::from_utf8_lossy(&data)
        );

        let path = self
            .url
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let mut req = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::HOST, host.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "text/event-stream");
        if let Some(api_key) = &self.api_key {
            req = req.header(header::AUTHORIZATION, format!("Bearer {api_key}"));
        }
        let req = req.body(Full::new(data))?;

        let mut sender = http_util::connect(&self.url).await?;
        let res = sender.send_request(req).await?;
        log::debug!("Upstream responded: {}", res.status());

        Ok(res.map(|body| body.map_err(Error::from).boxed()))
    }
}
