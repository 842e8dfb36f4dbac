//! Consumer side of the relay: conversation state and the task that streams a reply into it.

mod conversation;
mod session;
mod transport;

pub use self::{
    conversation::{Conversation, GREETING},
    session::{ChatSession, ChatState, ClientError, SendState, SessionEvent},
    transport::{ClientBody, HttpTransport, Transport},
};
