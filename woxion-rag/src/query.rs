//! Lifecycle of a single query instance.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Stage of a query instance.
///
/// Transitions only move forward:
/// `Received → Retrieving → Synthesizing → {Completed | Failed}`, and any
/// non-terminal stage may move straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    /// Accepted, nothing started.
    Received,
    /// Embedding the query and searching the index.
    Retrieving,
    /// Building the prompt and calling the generation backend.
    Synthesizing,
    /// An answer was produced.
    Completed,
    /// The query ended with an error.
    Failed,
}

impl QueryState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryState::Completed | QueryState::Failed)
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: QueryState) -> bool {
        use QueryState::*;
        matches!(
            (self, next),
            (Received, Retrieving)
                | (Retrieving, Synthesizing)
                | (Synthesizing, Completed)
                | (Received | Retrieving | Synthesizing, Failed)
        )
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryState::Received => "received",
            QueryState::Retrieving => "retrieving",
            QueryState::Synthesizing => "synthesizing",
            QueryState::Completed => "completed",
            QueryState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks the state of one query and its transition history.
#[derive(Debug, Clone)]
pub struct QueryLifecycle {
    id: Uuid,
    state: QueryState,
    history: Vec<QueryState>,
}

impl QueryLifecycle {
    /// Start a new query in [`QueryState::Received`].
    pub fn new(id: Uuid) -> Self {
        Self { id, state: QueryState::Received, history: vec![QueryState::Received] }
    }

    /// The query instance id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The current state.
    pub fn state(&self) -> QueryState {
        self.state
    }

    /// Every state the query has been in, oldest first.
    pub fn history(&self) -> &[QueryState] {
        &self.history
    }

    /// Move to `next`. Returns `false` and leaves the state unchanged if the
    /// transition is not allowed.
    pub fn advance(&mut self, next: QueryState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                query_id = %self.id,
                from = %self.state,
                to = %next,
                "rejected query state transition"
            );
            return false;
        }
        debug!(query_id = %self.id, from = %self.state, to = %next, "query state");
        self.state = next;
        self.history.push(next);
        true
    }
}
