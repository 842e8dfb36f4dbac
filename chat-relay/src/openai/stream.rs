use std::{
    collections::VecDeque,
    mem,
    pin::Pin,
    task::{Context, Poll},
};

use anyhow::Error;
use hyper::body::{Bytes, Frame};
use pin_project::pin_project;
use tokio_stream::Stream;

use crate::{
    error::RelayError,
    openai::api,
    sse::{EventParser, Parsed},
};

pub const DONE: &str = "[DONE]";

/// Number of forwarded chunks after which deltas without a newline are no longer held back.
pub const DEFAULT_WARMUP_CHUNKS: usize = 2;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Action {
    Skip,
    Forward(Bytes),
    Close,
}

/// Turns parsed completion events into the text sent to the client.
///
/// Until `warmup` chunks have been forwarded, a delta is dropped unless it contains a newline.
/// Only forwarded chunks advance the counter.
#[derive(Clone, Debug)]
pub struct DeltaFilter {
    warmup: usize,
    forwarded: usize,
    closed: bool,
}

impl Default for DeltaFilter {
    fn default() -> Self {
        Self::new(DEFAULT_WARMUP_CHUNKS)
    }
}

impl DeltaFilter {
    pub fn new(warmup: usize) -> Self {
        Self {
            warmup,
            forwarded: 0,
            closed: false,
        }
    }

    pub fn forwarded(&self) -> usize {
        self.forwarded
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn accept(&mut self, event: &Parsed) -> Result<Action, RelayError> {
        let data = match event {
            Parsed::Event(event) if !self.closed => event.data.as_str(),
            _ => return Ok(Action::Skip),
        };
        if data == DONE {
            self.closed = true;
            return Ok(Action::Close);
        }

        let chunk: api::ResponseStreamChunk =
            serde_json::from_str(data).map_err(|e| RelayError::UpstreamParse {
                data: data.to_owned(),
                reason: e.to_string(),
            })?;
        let text = chunk.content().ok_or_else(|| RelayError::UpstreamParse {
            data: data.to_owned(),
            reason: "no choices".to_owned(),
        })?;
        if let Some(reason) = chunk.choices.first().and_then(|c| c.finish_reason.as_deref()) {
            log::debug!("Completion finished: {reason}");
        }

        if self.forwarded < self.warmup && !text.contains('\n') {
            log::trace!("Holding back warm-up delta {text:?}");
            return Ok(Action::Skip);
        }
        self.forwarded += 1;
        Ok(Action::Forward(Bytes::copy_from_slice(text.as_bytes())))
    }
}

enum Status {
    Open,
    Done,
    Failed(Error),
    Finished,
}

/// Body stream carrying the filtered completion text of an upstream event stream.
///
/// Ends cleanly after `[DONE]`. Malformed events and an upstream body ending
/// before `[DONE]` end it with an error, once already accepted text has been yielded.
#[pin_project]
pub struct RelayStream<S> {
    #[pin]
    upstream: S,
    parser: EventParser,
    filter: DeltaFilter,
    ready: VecDeque<Bytes>,
    status: Status,
}

impl<S> RelayStream<S> {
    pub fn new(upstream: S, filter: DeltaFilter) -> Self {
        Self {
            upstream,
            parser: EventParser::new(),
            filter,
            ready: VecDeque::new(),
            status: Status::Open,
        }
    }
}

impl<S> Stream for RelayStream<S>
where
    S: Stream<Item = Result<Frame<Bytes>, Error>>,
{
    type Item = Result<Frame<Bytes>, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(bytes) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(Frame::data(bytes))));
            }
            match mem::replace(this.status, Status::Finished) {
                Status::Open => *this.status = Status::Open,
                Status::Done | Status::Finished => return Poll::Ready(None),
                Status::Failed(err) => return Poll::Ready(Some(Err(err))),
            }

            let frame = match this.upstream.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(frame))) => frame,
                Poll::Ready(Some(Err(err))) => {
                    log::error!("Upstream body failed mid-stream: {err:?}");
                    *this.status = Status::Failed(
                        RelayError::UpstreamTransport(err).into(),
                    );
                    continue;
                }
                Poll::Ready(None) => {
                    log::error!("Upstream body ended before {DONE}");
                    *this.status = Status::Failed(RelayError::UpstreamTruncated.into());
                    continue;
                }
            };
            let Ok(data) = frame.into_data() else {
                continue;
            };
            log::trace!("Upstream data frame: {}", String::from_utf8_lossy(&data));

            let (filter, ready, status) = (&mut *this.filter, &mut *this.ready, &mut *this.status);
            this.parser.feed(&data, |event| {
                if !matches!(status, Status::Open) {
                    return;
                }
                match filter.accept(&event) {
                    Ok(Action::Forward(bytes)) if !bytes.is_empty() => ready.push_back(bytes),
                    Ok(Action::Forward(_) | Action::Skip) => (),
                    Ok(Action::Close) => *status = Status::Done,
                    Err(err) => {
                        log::error!("Upstream stream broken: {err}");
                        *status = Status::Failed(err.into());
                    }
                }
            });
        }
    }
}
