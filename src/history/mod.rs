//! History abstraction and the in-memory implementation.
//!
//! # Responsibilities
//! - Track the current location and how it was reached (push, replace, pop)
//! - Notify a single listener on externally-driven traversal (`go`)
//! - Generate unique location keys so revisits to the same URL stay distinct
//!
//! # Design Decisions
//! - `push` and `replace` are silent; the router drives those itself and
//!   already knows the outcome. Only `go` flows back through the listener.
//! - One listener, installed by the router at initialization. Fan-out to
//!   application code happens through the router's state channel instead.

use serde_json::Value;

use crate::path::{create_path, parse_path, PathParts};

/// How the current location was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryAction {
    /// A new entry was appended to the stack.
    Push,
    /// The current entry was overwritten in place.
    Replace,
    /// The stack pointer moved to an existing entry (back/forward).
    Pop,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Push => "push",
            HistoryAction::Replace => "replace",
            HistoryAction::Pop => "pop",
        }
    }
}

/// A resolved location: URL pieces plus navigation identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub pathname: String,
    /// Search string including its leading `?`, or empty.
    pub search: String,
    /// Hash fragment including its leading `#`, or empty.
    pub hash: String,
    /// Opaque state attached by the caller at navigation time.
    pub state: Option<Value>,
    /// Unique per history entry. Two visits to the same URL get different
    /// keys, which is what lets subscribers distinguish a revisit.
    pub key: String,
}

impl Location {
    /// Build a location from a path string, minting a fresh key.
    pub fn from_path(path: &str) -> Self {
        let parts = parse_path(path);
        Location {
            pathname: parts.pathname,
            search: parts.search,
            hash: parts.hash,
            state: None,
            key: new_key(),
        }
    }

    pub(crate) fn with_state(mut self, state: Option<Value>) -> Self {
        self.state = state;
        self
    }

    /// The path string for this location (pathname + search + hash).
    pub fn to_path(&self) -> String {
        create_path(&PathParts {
            pathname: self.pathname.clone(),
            search: self.search.clone(),
            hash: self.hash.clone(),
        })
    }

    /// Same pathname, search and hash. Keys and state are ignored.
    pub fn same_url(&self, other: &Location) -> bool {
        self.pathname == other.pathname && self.search == other.search && self.hash == other.hash
    }
}

/// Short unique key for a history entry.
pub(crate) fn new_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Delivered to the history listener when the stack pointer moves.
pub struct HistoryEvent {
    pub action: HistoryAction,
    pub location: Location,
    /// Entries moved, negative for back.
    pub delta: isize,
}

pub type HistoryListener = Box<dyn Fn(HistoryEvent) + Send + Sync>;

/// The stack the router sits on. Implementations must be cheap to lock; the
/// router holds its history lock only for individual calls, never across
/// awaits.
pub trait History: Send + Sync {
    /// How the current location was reached.
    fn action(&self) -> HistoryAction;

    /// The current location.
    fn location(&self) -> Location;

    /// Append an entry and make it current. Does not notify the listener.
    fn push(&mut self, location: Location);

    /// Overwrite the current entry. Does not notify the listener.
    fn replace(&mut self, location: Location);

    /// Move the stack pointer by `delta` entries and notify the listener.
    fn go(&mut self, delta: isize);

    /// Install the listener. At most one is active at a time.
    fn listen(&mut self, listener: HistoryListener);

    /// Remove the listener.
    fn unlisten(&mut self);

    /// Render a location as an href for the outside world.
    fn create_href(&self, location: &Location) -> String {
        location.to_path()
    }
}

/// In-memory history stack. The default for tests and server-side use.
pub struct MemoryHistory {
    entries: Vec<Location>,
    index: usize,
    action: HistoryAction,
    listener: Option<HistoryListener>,
}

impl MemoryHistory {
    /// A stack with a single entry.
    pub fn new(initial: &str) -> Self {
        Self::with_entries(vec![initial], None)
    }

    /// A stack seeded with several entries, current at `index` (defaults to
    /// the last entry).
    pub fn with_entries(entries: Vec<&str>, index: Option<usize>) -> Self {
        let entries: Vec<Location> = if entries.is_empty() {
            vec![Location::from_path("/")]
        } else {
            entries.iter().map(|p| Location::from_path(p)).collect()
        };
        let index = index.unwrap_or(entries.len() - 1).min(entries.len() - 1);
        MemoryHistory {
            entries,
            index,
            action: HistoryAction::Pop,
            listener: None,
        }
    }

    /// Current position in the stack.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of entries on the stack.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl History for MemoryHistory {
    fn action(&self) -> HistoryAction {
        self.action
    }

    fn location(&self) -> Location {
        self.entries[self.index].clone()
    }

    fn push(&mut self, location: Location) {
        self.action = HistoryAction::Push;
        // Forward entries beyond the current index are discarded, the same
        // way a browser drops its forward stack on push.
        self.entries.truncate(self.index + 1);
        self.entries.push(location);
        self.index = self.entries.len() - 1;
    }

    fn replace(&mut self, location: Location) {
        self.action = HistoryAction::Replace;
        self.entries[self.index] = location;
    }

    fn go(&mut self, delta: isize) {
        let next = (self.index as isize + delta).clamp(0, self.entries.len() as isize - 1);
        self.action = HistoryAction::Pop;
        self.index = next as usize;
        if let Some(listener) = &self.listener {
            listener(HistoryEvent {
                action: HistoryAction::Pop,
                location: self.entries[self.index].clone(),
                delta,
            });
        }
    }

    fn listen(&mut self, listener: HistoryListener) {
        self.listener = Some(listener);
    }

    fn unlisten(&mut self) {
        self.listener = None;
    }
}
