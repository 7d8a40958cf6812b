//! Error taxonomy for the engine.
//!
//! # Responsibilities
//! - Represent engine-produced errors (404 no match, 405 missing handler, 400 bad encoding)
//! - Carry data-function errors through to error boundaries unchanged
//! - Resolve the error-boundary bucket for a failed route
//!
//! # Design Decisions
//! - Stored errors are plain values (`Clone + PartialEq`) so state snapshots stay cheap
//! - Raw `Response` payloads are unwrapped at normalization time, never stored
//! - Aborted calls are never represented here; they are dropped before commit

use http::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::route::RouteMatch;

/// An error committed to a route error boundary.
///
/// Engine-produced errors (no match, missing handler, bad submission encoding)
/// use [`RouteError::ErrorResponse`] with `internal` set. Errors raised by
/// loaders and actions pass through as [`RouteError::Value`] or
/// [`RouteError::Message`] without reshaping.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    /// A status-carrying error, either engine-made or unwrapped from a thrown
    /// `Response`.
    #[error("{status} {status_text}")]
    ErrorResponse {
        status: u16,
        status_text: String,
        /// Unwrapped body (JSON value or text), or an engine-made detail string.
        data: Value,
        /// True when the engine itself produced the error.
        internal: bool,
    },
    /// An arbitrary JSON-shaped error value thrown by a data function.
    #[error("{0}")]
    Value(Value),
    /// A plain error message thrown by a data function.
    #[error("{0}")]
    Message(String),
}

impl RouteError {
    /// Shorthand for a message-shaped error.
    pub fn message(msg: impl Into<String>) -> Self {
        RouteError::Message(msg.into())
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RouteError::ErrorResponse { status, .. } => StatusCode::from_u16(*status).ok(),
            _ => None,
        }
    }

    /// Whether this is an engine-produced error response.
    pub fn is_internal(&self) -> bool {
        matches!(self, RouteError::ErrorResponse { internal: true, .. })
    }

    pub(crate) fn from_status(status: StatusCode, detail: String) -> Self {
        RouteError::ErrorResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            data: Value::String(detail),
            internal: true,
        }
    }

    /// 404 for a URL no route matches.
    pub(crate) fn no_match(pathname: &str) -> Self {
        Self::from_status(
            StatusCode::NOT_FOUND,
            format!("no route matches URL {pathname:?}"),
        )
    }

    /// 405 for a matched route missing the handler the request needs.
    pub(crate) fn no_handler(method: &str, pathname: &str, route_id: &str) -> Self {
        Self::from_status(
            StatusCode::METHOD_NOT_ALLOWED,
            format!(
                "route {route_id:?} matched URL {pathname:?} but does not handle {method} requests"
            ),
        )
    }

    /// 400 for a submission the engine cannot encode.
    pub(crate) fn bad_submission(detail: impl Into<String>) -> Self {
        Self::from_status(StatusCode::BAD_REQUEST, detail.into())
    }

    /// 405 for a request method the engine does not serve at all.
    pub(crate) fn invalid_method(method: &str) -> Self {
        Self::from_status(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("invalid request method {method:?}"),
        )
    }

    /// 403 for a route-id query naming a route outside the matched chain.
    pub(crate) fn no_route_id(route_id: &str, pathname: &str) -> Self {
        Self::from_status(
            StatusCode::FORBIDDEN,
            format!("route {route_id:?} does not participate in matches for URL {pathname:?}"),
        )
    }
}

/// Fatal problems detected while constructing a router or static handler.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("route id {0:?} is used by more than one route")]
    DuplicateRouteId(String),
    #[error("at least one route is required")]
    EmptyRoutes,
    #[error("basename {0:?} must begin with '/'")]
    InvalidBasename(String),
    #[error("index route {0:?} cannot have children")]
    IndexRouteWithChildren(String),
}

/// Nearest ancestor-or-self match flagged as an error boundary.
///
/// `route_id` limits the search to the failed route's ancestry; `None` means
/// the whole chain is eligible. Falls back to the root match when nothing is
/// flagged, so every error has exactly one bucket.
pub(crate) fn find_nearest_boundary<'a>(
    matches: &'a [RouteMatch],
    route_id: Option<&str>,
) -> &'a RouteMatch {
    let eligible = match route_id {
        Some(id) => match matches.iter().position(|m| m.route.id == id) {
            Some(idx) => &matches[..=idx],
            None => &matches[..0],
        },
        None => matches,
    };
    eligible
        .iter()
        .rev()
        .find(|m| m.route.has_error_boundary())
        .unwrap_or(&matches[0])
}
