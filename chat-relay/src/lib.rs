pub mod client;
pub mod error;
pub mod http_util;
pub mod message;
pub mod openai;
pub mod ratelimit;
pub mod service;
pub mod sse;
pub mod utf8;

pub use self::service::{ClientAddr, Outgoing, Router, Service};

use std::sync::Arc;

use anyhow::Error;
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, ToSocketAddrs};

pub async fn serve<A, S, F>(addr: A, make_service: F) -> Result<(), Error>
where
    A: ToSocketAddrs,
    S: Service + 'static,
    F: AsyncFnMut() -> Result<S, Error>,
{
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, make_service).await
}

pub async fn serve_listener<S, F>(listener: TcpListener, mut make_service: F) -> Result<(), Error>
where
    S: Service + 'static,
    F: AsyncFnMut() -> Result<S, Error>,
{
    log::info!(
        "Listening for incoming connections at {}",
        listener.local_addr()?
    );

    loop {
        let (stream, addr) = listener.accept().await?;
        log::debug!("Incoming connection from {addr} established");

        let io = TokioIo::new(stream);
        let service = Arc::new(make_service().await?);

        tokio::task::spawn(async move {
            // Dropping a response body mid-stream (client gone) also drops the upstream body.
            if let Err(err) = http1::Builder::new()
                .serve_connection(
                    io,
                    service_fn(move |mut req| {
                        req.extensions_mut().insert(ClientAddr(addr));
                        service.clone().call_arc(req)
                    }),
                )
                .await
            {
                if err.is_incomplete_message() {
                    log::warn!("Incoming connection from {addr} unexpected EOF");
                } else {
                    log::error!("Incoming connection from {addr} failed: {err:?}");
                }
            } else {
                log::debug!("Incoming connection closed: {addr}");
            }
        });
    }
}
