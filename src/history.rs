//! Conversation history for transports that do not keep context on the server side.
//!
//! The Ollama `generate` endpoint is stateless, so the only way to give the model a memory of
//! the conversation is to send the previous turns along with every new message. [`History`]
//! keeps a sliding window of the most recent [`Exchange`]s and renders them as a
//! speaker-labeled transcript.
//!
//! ## Example
//!
//! ```
//! use tron::history::{Exchange, History, Speakers};
//!
//! let mut history = History::new();
//! history.append(Exchange::new("Who are you?", "I am TRON."));
//!
//! let prompt = history.prompt_for(&Speakers::default(), "What do you fight for?");
//! assert_eq!(
//!     prompt,
//!     "User: Who are you?\nTRON: I am TRON.\n\nUser: What do you fight for?\nTRON:"
//! );
//! ```

use std::sync::Arc;

/// Number of exchanges kept by default.
pub const DEFAULT_CAPACITY: usize = 10;

/// One user message paired with the assistant's reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exchange {
    user_text: Arc<str>,
    assistant_text: Arc<str>,
}

impl Exchange {
    pub fn new<U: Into<Arc<str>>, A: Into<Arc<str>>>(user_text: U, assistant_text: A) -> Self {
        Self {
            user_text: user_text.into(),
            assistant_text: assistant_text.into(),
        }
    }

    pub fn user_text(&self) -> &str {
        &self.user_text
    }

    pub fn assistant_text(&self) -> &str {
        &self.assistant_text
    }
}

/// Labels used when rendering a transcript.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Speakers {
    pub user: Arc<str>,
    pub assistant: Arc<str>,
}

impl Default for Speakers {
    fn default() -> Self {
        Self {
            user: Arc::from("User"),
            assistant: Arc::from("TRON"),
        }
    }
}

/// Fixed-capacity, ordered log of the most recent exchanges.
///
/// Appending beyond the capacity evicts the oldest exchange.
#[derive(Clone, Debug)]
pub struct History {
    capacity: usize,
    exchanges: im::Vector<Exchange>,
}

impl History {
    /// Creates an empty history holding up to [`DEFAULT_CAPACITY`] exchanges.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            exchanges: im::Vector::new(),
        }
    }

    /// Pushes an exchange to the tail, evicting from the head once over capacity.
    pub fn append(&mut self, exchange: Exchange) {
        self.exchanges.push_back(exchange);
        while self.exchanges.len() > self.capacity {
            self.exchanges.pop_front();
        }
    }

    /// Drops every stored exchange.
    pub fn clear(&mut self) {
        self.exchanges = im::Vector::new();
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates over the exchanges, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Exchange> {
        self.exchanges.iter()
    }

    /// Renders the stored exchanges as a chronological transcript.
    ///
    /// Every exchange becomes a `User: ...` line and an assistant line, followed by a blank
    /// line. An empty history renders as an empty string.
    pub fn render(&self, speakers: &Speakers) -> String {
        let mut transcript = String::new();
        for exchange in &self.exchanges {
            transcript.push_str(&format!(
                "{}: {}\n{}: {}\n\n",
                speakers.user, exchange.user_text, speakers.assistant, exchange.assistant_text
            ));
        }
        transcript
    }

    /// Builds a full prompt: the transcript followed by the new message and an open assistant
    /// turn for the model to complete.
    pub fn prompt_for(&self, speakers: &Speakers, message: &str) -> String {
        let mut prompt = self.render(speakers);
        prompt.push_str(&format!(
            "{}: {}\n{}:",
            speakers.user, message, speakers.assistant
        ));
        prompt
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}
