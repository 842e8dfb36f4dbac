//! Stand-in for the chat completions API, for running the relay without an API key.

use std::{convert::Infallible, net::SocketAddr, time::Duration};

use anyhow::Error;
use clap::Parser;
use http::{Method, StatusCode, header};
use http_body_util::{BodyExt, Full, StreamBody, combinators::UnsyncBoxBody};
use hyper::{
    Request, Response,
    body::{Bytes, Frame, Incoming},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_stream::StreamExt;

use chat_relay::{
    openai::{
        api::{CompletionRequest, Delta, ResponseStreamChunk, Role, StreamChoice},
        stream::DONE,
    },
    sse::Event,
};

type Body = UnsyncBoxBody<Bytes, Infallible>;

#[derive(Clone, Debug, Parser)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    addr: SocketAddr,
    /// Delay between body chunks, in milliseconds
    #[arg(long, default_value_t = 30)]
    delay: u64,
    /// Size of body chunks in bytes, small enough to split events and characters
    #[arg(long, default_value_t = 7)]
    chunk_size: usize,
}

fn text(status: StatusCode, text: &'static str) -> Response<Body> {
    let mut res = Response::new(Full::new(Bytes::from_static(text.as_bytes())).boxed_unsync());
    *res.status_mut() = status;
    res
}

/// Reply text for a conversation: echoes the last user message word by word.
fn reply_tokens(req: &CompletionRequest) -> Vec<String> {
    let last = req
        .messages
        .iter()
        .rev()
        .find(|msg| msg.role == Role::User)
        .map_or("nothing", |msg| msg.content.as_str());
    let mut tokens = vec!["You".to_owned(), " said:\n".to_owned()];
    tokens.extend(last.split_inclusive(' ').map(str::to_owned));
    tokens.push(format!("\n({} messages in context.)", req.messages.len()));
    tokens
}

fn event_stream(tokens: Vec<String>) -> Result<String, Error> {
    let chunk = |delta: Delta<'static>, finish_reason: Option<&'static str>| {
        serde_json::to_string(&ResponseStreamChunk {
            choices: [StreamChoice {
                delta: Some(delta),
                index: Some(0),
                finish_reason: finish_reason.map(Into::into),
            }]
            .into_iter()
            .collect(),
        })
    };

    let mut events = vec![chunk(
        Delta {
            role: Some("assistant".into()),
            content: None,
        },
        None,
    )?];
    for token in tokens {
        events.push(chunk(
            Delta {
                role: None,
                content: Some(token.into()),
            },
            None,
        )?);
    }
    events.push(chunk(Delta::default(), Some("stop"))?);
    events.push(DONE.to_owned());

    let mut out = String::new();
    for data in events {
        Event::data(data).write_to(&mut out)?;
    }
    Ok(out)
}

async fn complete(req: Request<Incoming>, args: Args) -> Result<Response<Body>, Error> {
    log::info!("{} {}", req.method(), req.uri());
    if req.method() != Method::POST || req.uri().path() != "/v1/chat/completions" {
        return Ok(text(StatusCode::NOT_FOUND, "Not found"));
    }

    let data = req.into_body().collect().await?.to_bytes();
    let payload: CompletionRequest = match serde_json::from_slice(&data) {
        Ok(payload) => payload,
        Err(e) => {
            log::warn!("Bad completion request: {e}");
            return Ok(text(StatusCode::BAD_REQUEST, "Malformed completion request"));
        }
    };
    log::debug!("Completion request: {payload:?}");
    if !payload.stream {
        return Ok(text(StatusCode::BAD_REQUEST, "Only streaming completions are supported"));
    }

    let body = event_stream(reply_tokens(&payload))?.into_bytes();
    let chunks: Vec<_> = body
        .chunks(args.chunk_size.max(1))
        .map(|c| Ok(Frame::data(Bytes::copy_from_slice(c))))
        .collect();
    let stream = tokio_stream::iter(chunks).throttle(Duration::from_millis(args.delay));

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(StreamBody::new(stream).boxed_unsync())?)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::builder().init();
    let args = Args::parse();

    let listener = TcpListener::bind(args.addr).await?;
    log::info!("Mock upstream listening at {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let args = args.clone();

        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(move |req| complete(req, args.clone())))
                .await
            {
                log::error!("Error serving connection from {addr}: {err:?}");
            }
        });
    }
}
