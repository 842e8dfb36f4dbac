use std::pin::Pin;

use anyhow::{Context, Error, bail};
use http_body_util::Full;
use hyper::{Uri, body::Bytes, client::conn::http1::SendRequest};
use hyper_util::rt::TokioIo;
use openssl::ssl::{SslConnector, SslMethod};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

pub type Sender = SendRequest<Full<Bytes>>;

/// Opens a fresh HTTP/1.1 connection to the origin of `url`, over TLS for `https`.
///
/// The connection is driven by a spawned task that ends once the returned sender
/// and the last response body are dropped.
pub async fn connect(url: &Uri) -> Result<Sender, Error> {
    let host = url.host().context("URL has no host")?;
    let tls = match url.scheme_str() {
        Some("https") => true,
        Some("http") => false,
        other => bail!("Unsupported URL scheme {other:?}"),
    };
    let port = url.port_u16().unwrap_or(if tls { 443 } else { 80 });
    let addr = format!("{host}:{port}");

    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("Cannot connect to {addr}"))?;
    stream.set_nodelay(true)?;

    if tls {
        let ssl = SslConnector::builder(SslMethod::tls())?
            .build()
            .configure()?
            .into_ssl(host)?;
        let mut stream = SslStream::new(ssl, stream)?;
        Pin::new(&mut stream)
            .connect()
            .await
            .with_context(|| format!("TLS handshake with {addr} failed"))?;
        handshake(TokioIo::new(stream), addr).await
    } else {
        handshake(TokioIo::new(stream), addr).await
    }
}

async fn handshake<I>(io: I, addr: String) -> Result<Sender, Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    log::debug!("Outgoing connection to {addr} established");

    tokio::task::spawn(async move {
        if let Err(err) = conn.await {
            log::error!("Outgoing connection to {addr} failed: {err:?}");
        } else {
            log::debug!("Outgoing connection to {addr} closed");
        }
    });

    Ok(sender)
}
