use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ids::{QueryId, SessionId};
use crate::messages::Message;
use crate::seeds::KnowledgeSeed;

/// Lifecycle of the query currently attached to a session.
///
/// Idle → Searching → Streaming → Settled, with Error reachable from
/// Searching or Streaming. Settled and Error end a query; a new query may
/// start from either.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Searching,
    Streaming,
    Settled,
    Error { kind: String, message: String },
}

impl Phase {
    /// A query is attached and has not ended.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Searching | Self::Streaming)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Error { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Searching => "searching",
            Self::Streaming => "streaming",
            Self::Settled => "settled",
            Self::Error { .. } => "error",
        }
    }
}

/// One conversation thread.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub response: String,
    pub seeds: Vec<KnowledgeSeed>,
    pub searching: bool,
    pub phase: Phase,
    /// Target for frame dispatch. Frames from any other query are stale.
    pub active_query: Option<QueryId>,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            name: name.into(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            response: String::new(),
            seeds: Vec::new(),
            searching: false,
            phase: Phase::Idle,
            active_query: None,
        }
    }

    pub fn is_active(&self, origin: &QueryId) -> bool {
        self.active_query.as_ref() == Some(origin)
    }

    /// Attach a new query: append the caller's messages, clear the previous
    /// answer and citations, and enter Searching. Any query that was still
    /// attached loses its slot and its later frames become stale.
    pub fn begin_query(&mut self, query: QueryId, messages: Vec<Message>) {
        if let Some(previous) = self.active_query.as_ref() {
            debug!(session_id = %self.id, previous = %previous, next = %query, "superseding active query");
        }
        self.messages.extend(messages);
        self.response.clear();
        self.seeds.clear();
        self.searching = false;
        self.phase = Phase::Searching;
        self.active_query = Some(query);
        self.touch();
    }

    /// Normal end of the stream. The accumulated answer joins the history.
    pub fn settle(&mut self, origin: &QueryId) -> bool {
        if !self.is_active(origin) || !self.phase.is_in_flight() {
            return false;
        }
        if !self.response.trim().is_empty() {
            self.messages.push(Message::assistant(self.response.clone()));
        }
        self.phase = Phase::Settled;
        self.active_query = None;
        self.touch();
        debug!(session_id = %self.id, query_id = %origin, "query settled");
        true
    }

    /// Failure or abort. Partial response and seeds are kept as they are.
    pub fn fail(&mut self, origin: &QueryId, kind: &str, message: impl Into<String>) -> bool {
        if !self.is_active(origin) || !self.phase.is_in_flight() {
            return false;
        }
        self.phase = Phase::Error {
            kind: kind.to_string(),
            message: message.into(),
        };
        self.active_query = None;
        self.touch();
        debug!(session_id = %self.id, query_id = %origin, kind, "query failed");
        true
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
