use std::sync::Arc;

use anyhow::Error;
use http::StatusCode;
use http_body_util::BodyExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{Conversation, Transport},
    message::ConversationMessage,
    utf8::Utf8Decoder,
};

const SEND_FAILED: &str = "Something went wrong.";
const REPLY_INTERRUPTED: &str = "The reply was interrupted.";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SendState {
    Idle,
    /// Request dispatched, no reply byte received yet.
    Sending,
    /// Reply text is being appended.
    Streaming,
    Done,
    Failed,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SessionEvent {
    State(SendState),
    Chunk { id: String, text: String },
    /// Transient error notice for the user.
    Notification(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Another message is being sent")]
    Busy,
    #[error("Cannot reach relay: {0}")]
    Fetch(#[source] Error),
    #[error("Relay responded with status {0}")]
    Status(StatusCode),
    #[error("Reply stream broken: {0}")]
    Stream(#[source] Error),
    #[error("Cancelled")]
    Cancelled,
}

/// Everything the chat window renders.
#[derive(Clone, Debug)]
pub struct ChatState {
    pub conversation: Conversation,
    pub send_state: SendState,
    pub is_message_updating: bool,
    pub input_focused: bool,
}

impl Default for ChatState {
    fn default() -> Self {
        Self {
            conversation: Conversation::default(),
            send_state: SendState::Idle,
            is_message_updating: false,
            input_focused: true,
        }
    }
}

/// Sends user messages through a [`Transport`] and streams replies into shared [`ChatState`].
pub struct ChatSession<T> {
    transport: T,
    state: Arc<Mutex<ChatState>>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl<T: Transport> ChatSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: Arc::default(),
            events: None,
        }
    }

    pub fn with_conversation(self, conversation: Conversation) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChatState {
                conversation,
                ..Default::default()
            })),
            ..self
        }
    }

    /// Returns a receiver for state changes, appended chunks and notifications.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.events = Some(sender);
        receiver
    }

    pub fn shared_state(&self) -> Arc<Mutex<ChatState>> {
        self.state.clone()
    }

    pub async fn state(&self) -> ChatState {
        self.state.lock().await.clone()
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Sends `text` as a new user message along with the conversation so far
    /// and appends the reply as it streams in.
    ///
    /// Returns the id of the reply message, if any reply byte arrived.
    pub async fn submit(
        &self,
        text: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ClientError> {
        let message = ConversationMessage::user(text);
        let messages = {
            let mut state = self.state.lock().await;
            if matches!(state.send_state, SendState::Sending | SendState::Streaming) {
                return Err(ClientError::Busy);
            }
            state.conversation.add(message.clone());
            state.send_state = SendState::Sending;
            state.input_focused = false;
            state.conversation.messages().to_vec()
        };
        self.emit(SessionEvent::State(SendState::Sending));

        let res = tokio::select! {
            res = self.transport.send(messages) => match res {
                Ok(res) if res.status().is_success() => Ok(res),
                Ok(res) => Err(ClientError::Status(res.status())),
                Err(err) => Err(ClientError::Fetch(err)),
            },
            () = cancel.cancelled() => Err(ClientError::Cancelled),
        };
        let mut body = match res {
            Ok(res) => res.into_body(),
            Err(err) => {
                self.roll_back(&message.id).await;
                return Err(err);
            }
        };

        let mut decoder = Utf8Decoder::default();
        let mut reply = None;
        let outcome = loop {
            let frame = tokio::select! {
                frame = body.frame() => frame,
                () = cancel.cancelled() => break Err(ClientError::Cancelled),
            };
            let data = match frame {
                None => break Ok(()),
                Some(Err(err)) => break Err(ClientError::Stream(err)),
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) if !data.is_empty() => data,
                    _ => continue,
                },
            };
            self.append(&mut reply, &decoder.decode(&data)).await;
        };

        if reply.is_some() {
            self.append(&mut reply, &decoder.finish()).await;
        }
        match outcome {
            Ok(()) => {
                self.finish(SendState::Done).await;
                Ok(reply)
            }
            Err(err) if reply.is_none() => {
                self.roll_back(&message.id).await;
                Err(err)
            }
            Err(err) => {
                log::warn!("Reply interrupted: {err}");
                self.emit(SessionEvent::Notification(REPLY_INTERRUPTED.to_owned()));
                self.finish(SendState::Failed).await;
                Err(err)
            }
        }
    }

    /// Appends reply text, creating the reply message on the first call.
    async fn append(&self, reply: &mut Option<String>, text: &str) {
        let mut state = self.state.lock().await;
        if reply.is_none() {
            let message = ConversationMessage::assistant("");
            *reply = Some(message.id.clone());
            state.conversation.add(message);
            state.is_message_updating = true;
            state.send_state = SendState::Streaming;
            self.emit(SessionEvent::State(SendState::Streaming));
        }
        let Some(id) = reply.as_ref() else {
            return;
        };
        if !text.is_empty() && state.conversation.append(id, text) {
            self.emit(SessionEvent::Chunk {
                id: id.clone(),
                text: text.to_owned(),
            });
        }
    }

    async fn finish(&self, send_state: SendState) {
        let mut state = self.state.lock().await;
        state.send_state = send_state;
        state.is_message_updating = false;
        state.input_focused = true;
        self.emit(SessionEvent::State(send_state));
    }

    /// Removes the optimistically added user message after a failed request.
    async fn roll_back(&self, id: &str) {
        self.state.lock().await.conversation.remove(id);
        log::warn!("Message {id} was not delivered");
        self.emit(SessionEvent::Notification(SEND_FAILED.to_owned()));
        self.finish(SendState::Failed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientBody, GREETING};
    use http::Response;
    use http_body_util::StreamBody;
    use hyper::body::{Bytes, Frame};
    use std::sync::Mutex as StdMutex;

    enum Reply {
        Unreachable,
        Status(StatusCode),
        Chunks(&'static [&'static [u8]]),
        Broken(&'static [&'static [u8]]),
        NeverResponds,
        NeverEnds(&'static [&'static [u8]]),
    }

    struct Scripted {
        reply: Reply,
        sent: StdMutex<Vec<Vec<ConversationMessage>>>,
    }

    impl Scripted {
        fn new(reply: Reply) -> Self {
            Self {
                reply,
                sent: StdMutex::new(Vec::new()),
            }
        }
    }

    fn frames(chunks: &[&'static [u8]]) -> Vec<Result<Frame<Bytes>, Error>> {
        chunks
            .iter()
            .map(|&c| Ok(Frame::data(Bytes::from_static(c))))
            .collect()
    }

    impl Transport for Scripted {
        async fn send(
            &self,
            messages: Vec<ConversationMessage>,
        ) -> Result<Response<ClientBody>, Error> {
            self.sent.lock().unwrap().push(messages);
            let body: ClientBody = match &self.reply {
                Reply::Unreachable => anyhow::bail!("connection refused"),
                Reply::NeverResponds => std::future::pending().await,
                Reply::Status(status) => {
                    return Ok(Response::builder()
                        .status(*status)
                        .body(StreamBody::new(tokio_stream::iter(frames(&[b"busy"]))).boxed())?);
                }
                Reply::Chunks(chunks) => StreamBody::new(tokio_stream::iter(frames(chunks))).boxed(),
                Reply::Broken(chunks) => {
                    let mut all = frames(chunks);
                    all.push(Err(anyhow::anyhow!("connection reset")));
                    StreamBody::new(tokio_stream::iter(all)).boxed()
                }
                Reply::NeverEnds(chunks) => {
                    use tokio_stream::StreamExt;
                    let stream = tokio_stream::iter(frames(chunks)).chain(tokio_stream::pending());
                    StreamBody::new(stream).boxed()
                }
            };
            Ok(Response::new(body))
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut all = Vec::new();
        while let Ok(event) = events.try_recv() {
            all.push(event);
        }
        all
    }

    fn texts(state: &ChatState) -> Vec<(bool, &str)> {
        state
            .conversation
            .messages()
            .iter()
            .map(|m| (m.is_user_message, m.text.as_str()))
            .collect()
    }

    #[tokio::test]
    async fn streams_reply() {
        let mut session = ChatSession::new(Scripted::new(Reply::Chunks(&[
            b"Hel",
            b"lo \xd0",
            b"\x90!",
        ])));
        let mut events = session.subscribe();

        let reply = session
            .submit("Hi", &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        let state = session.state().await;
        assert_eq!(texts(&state), [(false, GREETING), (true, "Hi"), (false, "Hello А!")]);
        assert_eq!(state.conversation.messages()[2].id, reply);
        assert_eq!(state.send_state, SendState::Done);
        assert!(!state.is_message_updating);
        assert!(state.input_focused);

        let sent = session.transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 2);
        assert_eq!(sent[0][1].text, "Hi");

        let chunk = |text: &str| SessionEvent::Chunk {
            id: reply.clone(),
            text: text.to_owned(),
        };
        assert_eq!(
            drain(&mut events),
            [
                SessionEvent::State(SendState::Sending),
                SessionEvent::State(SendState::Streaming),
                chunk("Hel"),
                chunk("lo "),
                chunk("А!"),
                SessionEvent::State(SendState::Done),
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_relay_rolls_back() {
        let mut session = ChatSession::new(Scripted::new(Reply::Unreachable));
        let mut events = session.subscribe();

        let err = session.submit("Hi", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Fetch(_)));

        let state = session.state().await;
        assert_eq!(texts(&state), [(false, GREETING)]);
        assert_eq!(state.send_state, SendState::Failed);
        assert!(state.input_focused);
        assert!(drain(&mut events).contains(&SessionEvent::Notification(SEND_FAILED.to_owned())));
    }

    #[tokio::test]
    async fn error_status_rolls_back() {
        let session = ChatSession::new(Scripted::new(Reply::Status(StatusCode::TOO_MANY_REQUESTS)))
            .with_conversation(Conversation::empty());

        let err = session.submit("Hi", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Status(StatusCode::TOO_MANY_REQUESTS)));

        let state = session.state().await;
        assert!(state.conversation.messages().is_empty());
        assert_eq!(state.send_state, SendState::Failed);
    }

    #[tokio::test]
    async fn broken_stream_keeps_partial_reply() {
        let mut session = ChatSession::new(Scripted::new(Reply::Broken(&[b"Par", b"tial"])));
        let mut events = session.subscribe();

        let err = session.submit("Hi", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Stream(_)));

        let state = session.state().await;
        assert_eq!(texts(&state), [(false, GREETING), (true, "Hi"), (false, "Partial")]);
        assert_eq!(state.send_state, SendState::Failed);
        assert!(!state.is_message_updating);
        assert!(drain(&mut events).contains(&SessionEvent::Notification(
            REPLY_INTERRUPTED.to_owned()
        )));
    }

    #[tokio::test]
    async fn broken_stream_before_any_byte_rolls_back() {
        let session = ChatSession::new(Scripted::new(Reply::Broken(&[])));
        let err = session.submit("Hi", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Stream(_)));
        assert_eq!(texts(&session.state().await), [(false, GREETING)]);
    }

    #[tokio::test]
    async fn empty_reply_adds_nothing() {
        let session = ChatSession::new(Scripted::new(Reply::Chunks(&[])));
        let reply = session.submit("Hi", &CancellationToken::new()).await.unwrap();
        assert!(reply.is_none());
        let state = session.state().await;
        assert_eq!(texts(&state), [(false, GREETING), (true, "Hi")]);
        assert_eq!(state.send_state, SendState::Done);
    }

    #[tokio::test]
    async fn cancel_while_streaming() {
        let session = Arc::new(ChatSession::new(Scripted::new(Reply::NeverEnds(&[b"So far"]))));
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let (session, cancel) = (session.clone(), cancel.clone());
            async move { session.submit("Hi", &cancel).await }
        });

        while session.state().await.send_state != SendState::Streaming {
            tokio::task::yield_now().await;
        }
        assert!(session.state().await.is_message_updating);
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
        let state = session.state().await;
        assert_eq!(texts(&state), [(false, GREETING), (true, "Hi"), (false, "So far")]);
        assert_eq!(state.send_state, SendState::Failed);
    }

    #[tokio::test]
    async fn one_message_at_a_time() {
        let session = Arc::new(ChatSession::new(Scripted::new(Reply::NeverResponds)));
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let (session, cancel) = (session.clone(), cancel.clone());
            async move { session.submit("first", &cancel).await }
        });

        while session.state().await.send_state != SendState::Sending {
            tokio::task::yield_now().await;
        }
        let err = session.submit("second", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Busy));

        cancel.cancel();
        assert!(matches!(task.await.unwrap(), Err(ClientError::Cancelled)));
        assert_eq!(texts(&session.state().await), [(false, GREETING)]);
        assert_eq!(session.transport.sent.lock().unwrap().len(), 1);
    }
}
