use std::{convert::Infallible, net::SocketAddr, pin::Pin, sync::Arc};

use anyhow::Error;
use http::{Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::{Bytes, Incoming};

pub type Outgoing = BoxBody<Bytes, Error>;

/// Address of the peer that sent a request, stored in the request extensions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ClientAddr(pub SocketAddr);

pub trait Service: Send + Sync {
    fn call(
        &self,
        req: Request<Incoming>,
    ) -> impl Future<Output = Result<Response<Outgoing>, Error>> + Send + '_;

    fn call_arc(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> impl Future<Output = Result<Response<Outgoing>, Error>> + Send
    where
        Self: 'static,
    {
        async move { self.call(req).await }
    }
}

pub trait ServiceDyn: Send + Sync {
    fn call_dyn(
        &self,
        req: Request<Incoming>,
    ) -> Pin<Box<dyn Future<Output = Result<Response<Outgoing>, Error>> + Send + '_>>;
}

impl<S: Service> ServiceDyn for S {
    fn call_dyn(
        &self,
        req: Request<Incoming>,
    ) -> Pin<Box<dyn Future<Output = Result<Response<Outgoing>, Error>> + Send + '_>> {
        Box::pin(self.call(req))
    }
}

/// Dispatches requests by path to the service mounted at it or below it.
pub struct Router {
    routes: Vec<(String, Arc<dyn ServiceDyn>)>,
    default: Arc<dyn ServiceDyn>,
}

impl Router {
    pub fn new<S: Service + 'static>(default: S) -> Self {
        Self {
            routes: Vec::new(),
            default: Arc::new(default),
        }
    }

    /// Mounts `service` at `path`, so that it also gets every `{path}/...` request.
    pub fn push<S: Service + 'static>(mut self, path: &str, service: S) -> Self {
        self.routes
            .push((path.trim_end_matches('/').to_string(), Arc::new(service)));
        self
    }

    fn route(&self, path: &str) -> &dyn ServiceDyn {
        self.routes
            .iter()
            .find(|(prefix, _)| match path.strip_prefix(prefix.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            })
            .map_or(&*self.default, |(_, service)| &**service)
    }
}

impl Service for Router {
    async fn call(&self, req: Request<Incoming>) -> Result<Response<Outgoing>, Error> {
        let service = self.route(req.uri().path());
        service.call_dyn(req).await
    }
}

#[derive(Clone, Default, Debug)]
pub struct Nothing;

impl Service for Nothing {
    async fn call(&self, req: Request<Incoming>) -> Result<Response<Outgoing>, Error> {
        log::debug!("No route for {} {}", req.method(), req.uri().path());
        text_response(StatusCode::NOT_FOUND, "Not found")
    }
}

/// Plain-text response with a complete body.
pub fn text_response(
    status: StatusCode,
    text: impl Into<String>,
) -> Result<Response<Outgoing>, Error> {
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from(text.into()))
                .map_err(|never: Infallible| match never {})
                .boxed(),
        )?)
}
