//! Response rules and the first-match-wins matcher.

use regex::Regex;
use std::fmt;
use std::sync::Arc;

use crate::error::LinkError;
use crate::frame::{nack_message, Frame};
use crate::state::DeviceStateModel;
use crate::value::Value;

/// One decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A text line with the terminator stripped.
    Line(String),
    /// A checksum-validated binary frame.
    Frame(Frame),
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line(s) => write!(f, "{s:?}"),
            Self::Frame(fr) => write!(
                f,
                "frame id1=0x{:02X} id2=0x{:02X} len={}",
                fr.id1,
                fr.id2,
                fr.data().len()
            ),
        }
    }
}

/// Turns a matched message into a value, updating state variables on the way.
pub type Interpreter =
    Arc<dyn Fn(&Message, &mut DeviceStateModel) -> Result<Value, LinkError> + Send + Sync>;
pub type Predicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

pub enum Matcher {
    /// Regex search within a text line.
    Regex(Regex),
    /// Whole-line equality.
    Exact(String),
    Predicate(Predicate),
    /// Binary frame whose id2 equals the given byte.
    FrameId(u8),
}

impl Matcher {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn regex(pattern: &str) -> Result<Self, LinkError> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|e| LinkError::Config(format!("bad response pattern {pattern:?}: {e}")))
    }

    #[must_use]
    pub fn accepts(&self, message: &Message) -> bool {
        match (self, message) {
            (Self::Regex(re), Message::Line(line)) => re.is_match(line),
            (Self::Exact(s), Message::Line(line)) => s == line,
            (Self::Predicate(p), m) => p(m),
            (Self::FrameId(id2), Message::Frame(frame)) => frame.id2 == *id2,
            _ => false,
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regex(re) => write!(f, "Regex({})", re.as_str()),
            Self::Exact(s) => write!(f, "Exact({s:?})"),
            Self::Predicate(_) => f.write_str("Predicate"),
            Self::FrameId(id) => write!(f, "FrameId(0x{id:02X})"),
        }
    }
}

pub enum ErrorText {
    Static(String),
    Computed(Arc<dyn Fn(&Message) -> String + Send + Sync>),
}

impl ErrorText {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&Message) -> String + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    fn render(&self, message: &Message) -> String {
        match self {
            Self::Static(s) => s.clone(),
            Self::Computed(f) => f(message),
        }
    }
}

pub enum RuleKind {
    Ack,
    Nack,
    Error(ErrorText),
    Value(Interpreter),
}

pub struct ResponseRule {
    pub key: String,
    pub matcher: Matcher,
    pub kind: RuleKind,
}

impl RuleKind {
    pub fn value<F>(interpreter: F) -> Self
    where
        F: Fn(&Message, &mut DeviceStateModel) -> Result<Value, LinkError> + Send + Sync + 'static,
    {
        Self::Value(Arc::new(interpreter))
    }
}

/// What a matched rule does to an outstanding exchange.
#[derive(Debug)]
pub enum Resolution {
    Resolve(Value),
    Reject(LinkError),
}

impl ResponseRule {
    /// Whether this rule settles an exchange regardless of the response key the
    /// exchange expects.
    #[must_use]
    pub const fn is_status(&self) -> bool {
        !matches!(self.kind, RuleKind::Value(_))
    }

    /// Run the rule against `message`. Interpreters run here, so calling this
    /// for an unsolicited push applies its state updates.
    ///
    /// A binary frame flagged as not acknowledged rejects whatever the rule
    /// kind, and its interpreter never runs.
    pub fn evaluate(&self, message: &Message, state: &mut DeviceStateModel) -> Resolution {
        if let Message::Frame(frame) = message {
            if !frame.is_ack() {
                return Resolution::Reject(LinkError::Nack(nack_message(frame)));
            }
        }
        match &self.kind {
            RuleKind::Ack => Resolution::Resolve(Value::Null),
            RuleKind::Nack => {
                Resolution::Reject(LinkError::Nack(format!("device rejected command: {message}")))
            }
            RuleKind::Error(text) => Resolution::Reject(LinkError::Nack(text.render(message))),
            RuleKind::Value(interpreter) => match interpreter(message, state) {
                Ok(v) => Resolution::Resolve(v),
                Err(e) => Resolution::Reject(e),
            },
        }
    }
}

impl fmt::Debug for ResponseRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RuleKind::Ack => "ack",
            RuleKind::Nack => "nack",
            RuleKind::Error(_) => "error",
            RuleKind::Value(_) => "value",
        };
        f.debug_struct("ResponseRule")
            .field("key", &self.key)
            .field("matcher", &self.matcher)
            .field("kind", &kind)
            .finish()
    }
}

/// Ordered rule list; the first rule whose matcher accepts a message wins.
#[derive(Debug, Default)]
pub struct ResponseMatcher {
    rules: Vec<ResponseRule>,
}

impl ResponseMatcher {
    #[must_use]
    pub const fn new(rules: Vec<ResponseRule>) -> Self {
        Self { rules }
    }

    #[must_use]
    pub fn find(&self, message: &Message) -> Option<&ResponseRule> {
        self.rules.iter().find(|r| r.matcher.accepts(message))
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.rules.iter().any(|r| r.key == key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
