//! Observable router state snapshots.
//!
//! Snapshots are immutable and shared (`Arc`) through a watch channel.
//! Every commit replaces the whole snapshot; subscribers never see partial
//! mutation.

use std::collections::HashMap;

use serde_json::Value;

use crate::data::{RouteData, Submission};
use crate::error::RouteError;
use crate::history::{HistoryAction, Location};
use crate::route::RouteMatch;

/// Committed loader data by route id.
pub type RouteDataMap = HashMap<String, RouteData>;

/// Committed errors by error-boundary route id.
pub type RouteErrorMap = HashMap<String, RouteError>;

/// Where the current navigation stands.
#[derive(Clone, Debug, Default)]
pub enum Navigation {
    /// Nothing in flight; `location` on the state is current.
    #[default]
    Idle,
    /// Loaders running for `location`. `submission` is carried through
    /// from an action that already completed.
    Loading {
        location: Location,
        submission: Option<Submission>,
    },
    /// An action running for `location`.
    Submitting {
        location: Location,
        submission: Submission,
    },
}

impl Navigation {
    pub fn is_idle(&self) -> bool {
        matches!(self, Navigation::Idle)
    }

    pub fn state_str(&self) -> &'static str {
        match self {
            Navigation::Idle => "idle",
            Navigation::Loading { .. } => "loading",
            Navigation::Submitting { .. } => "submitting",
        }
    }

    /// The location being navigated to, when not idle.
    pub fn location(&self) -> Option<&Location> {
        match self {
            Navigation::Idle => None,
            Navigation::Loading { location, .. } => Some(location),
            Navigation::Submitting { location, .. } => Some(location),
        }
    }

    pub fn submission(&self) -> Option<&Submission> {
        match self {
            Navigation::Idle => None,
            Navigation::Loading { submission, .. } => submission.as_ref(),
            Navigation::Submitting { submission, .. } => Some(submission),
        }
    }
}

/// Whether an explicit revalidation pass is in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RevalidationState {
    #[default]
    Idle,
    Loading,
}

impl RevalidationState {
    pub fn is_idle(&self) -> bool {
        matches!(self, RevalidationState::Idle)
    }

    pub fn state_str(&self) -> &'static str {
        match self {
            RevalidationState::Idle => "idle",
            RevalidationState::Loading => "loading",
        }
    }
}

/// Lifecycle state of one fetcher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FetcherState {
    #[default]
    Idle,
    Loading,
    Submitting,
}

impl FetcherState {
    pub fn is_idle(&self) -> bool {
        matches!(self, FetcherState::Idle)
    }

    pub fn state_str(&self) -> &'static str {
        match self {
            FetcherState::Idle => "idle",
            FetcherState::Loading => "loading",
            FetcherState::Submitting => "submitting",
        }
    }
}

/// One keyed background fetcher as observed by subscribers.
///
/// `data` survives across reloads: a fetcher that loaded once keeps showing
/// its previous data while the next load runs.
#[derive(Clone, Debug, Default)]
pub struct Fetcher {
    pub state: FetcherState,
    pub data: Option<Value>,
    pub submission: Option<Submission>,
}

impl Fetcher {
    pub(crate) fn idle(data: Option<Value>) -> Self {
        Fetcher {
            state: FetcherState::Idle,
            data,
            submission: None,
        }
    }

    pub(crate) fn loading(data: Option<Value>, submission: Option<Submission>) -> Self {
        Fetcher {
            state: FetcherState::Loading,
            data,
            submission,
        }
    }

    pub(crate) fn submitting(data: Option<Value>, submission: Submission) -> Self {
        Fetcher {
            state: FetcherState::Submitting,
            data,
            submission: Some(submission),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state.is_idle()
    }
}

/// Full router state at one instant.
#[derive(Clone, Debug)]
pub struct RouterState {
    /// The committed location.
    pub location: Location,
    /// How `location` was reached.
    pub history_action: HistoryAction,
    /// Match chain for `location`, root first.
    pub matches: Vec<RouteMatch>,
    /// False until the first load pass commits (hydration may satisfy it
    /// immediately).
    pub initialized: bool,
    pub navigation: Navigation,
    pub revalidation: RevalidationState,
    pub loader_data: RouteDataMap,
    /// Data from the most recent action, keyed by the route that ran it.
    /// Cleared by the next completed navigation.
    pub action_data: Option<HashMap<String, Value>>,
    /// Errors keyed by the boundary route they bubbled to.
    pub errors: Option<RouteErrorMap>,
    pub fetchers: HashMap<String, Fetcher>,
}

impl RouterState {
    /// The error bucketed at `route_id`, if any.
    pub fn error_for(&self, route_id: &str) -> Option<&RouteError> {
        self.errors.as_ref().and_then(|e| e.get(route_id))
    }

    /// Matched route ids, root first.
    pub fn match_ids(&self) -> Vec<&str> {
        self.matches.iter().map(|m| m.route.id.as_str()).collect()
    }

    /// The fetcher under `key`, or the idle sentinel when none exists.
    pub fn fetcher(&self, key: &str) -> Fetcher {
        self.fetchers.get(key).cloned().unwrap_or_default()
    }
}
