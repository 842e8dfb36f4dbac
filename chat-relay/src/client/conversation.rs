use crate::message::ConversationMessage;

pub const GREETING: &str = "Hello, how can I help you?";

/// Ordered list of messages shown in the chat window.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Conversation {
    messages: Vec<ConversationMessage>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self {
            messages: vec![ConversationMessage::assistant(GREETING)],
        }
    }
}

impl Conversation {
    pub fn empty() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn get(&self, id: &str) -> Option<&ConversationMessage> {
        self.messages.iter().find(|msg| msg.id == id)
    }

    pub fn add(&mut self, message: ConversationMessage) {
        self.messages.push(message);
    }

    pub fn remove(&mut self, id: &str) -> Option<ConversationMessage> {
        let i = self.messages.iter().position(|msg| msg.id == id)?;
        Some(self.messages.remove(i))
    }

    /// Appends `chunk` to the text of message `id`. Returns `false` if there is no such message.
    pub fn append(&mut self, id: &str, chunk: &str) -> bool {
        match self.messages.iter_mut().find(|msg| msg.id == id) {
            Some(msg) => {
                msg.text.push_str(chunk);
                true
            }
            None => false,
        }
    }
}
