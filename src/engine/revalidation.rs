//! The revalidation decision: which loaders rerun after a data commit.
//!
//! A route with no committed data always loads and its predicate is never
//! consulted. Routes with data consult their `should_revalidate` predicate,
//! whose verdict is final; the engine's default is offered through
//! `default_should_revalidate` and applies only when no predicate exists.

use http::StatusCode;
use serde_json::Value;

use crate::data::{Params, Submission};
use crate::history::Location;
use crate::route::RouteMatch;

use super::state::RouteDataMap;

/// Everything a `should_revalidate` predicate gets to look at.
pub struct RevalidateArgs<'a> {
    pub current_location: &'a Location,
    pub current_params: &'a Params,
    pub next_location: &'a Location,
    pub next_params: &'a Params,
    /// The submission driving this pass, when it was triggered by one.
    pub submission: Option<&'a Submission>,
    /// Data committed by the action, when one ran and succeeded.
    pub action_result: Option<&'a Value>,
    pub action_status: Option<StatusCode>,
    /// What the engine would decide on its own.
    pub default_should_revalidate: bool,
}

pub type ShouldRevalidateFunction =
    std::sync::Arc<dyn Fn(&RevalidateArgs<'_>) -> bool + Send + Sync>;

/// Inputs shared by every per-route decision in one planning pass.
pub(crate) struct RevalidationContext<'a> {
    pub current_location: &'a Location,
    pub next_location: &'a Location,
    pub current_matches: &'a [RouteMatch],
    pub loader_data: &'a RouteDataMap,
    pub submission: Option<&'a Submission>,
    pub action_result: Option<&'a Value>,
    pub action_status: Option<StatusCode>,
    /// Unconditional revalidation: mutation submissions, explicit
    /// `revalidate()`, redirects carrying the revalidation header.
    pub force: bool,
}

/// Decide whether `next`'s loader runs in this pass.
///
/// `interrupted` marks routes whose previous load was cancelled mid-stream;
/// they must reload to get back to a settled state.
pub(crate) fn should_reload(
    next: &RouteMatch,
    ctx: &RevalidationContext<'_>,
    interrupted: bool,
) -> bool {
    let route = &next.route;
    // Unresolved lazy routes load so resolution can even tell us whether a
    // loader exists.
    if route.is_lazy_pending() {
        return true;
    }
    if !route.has_loader() {
        return false;
    }

    let current = match ctx.current_matches.iter().find(|m| m.route.id == route.id) {
        Some(current) if ctx.loader_data.contains_key(&route.id) => current,
        // First load for this route: unconditional, predicate skipped.
        _ => return true,
    };

    let default = interrupted
        || ctx.force
        || ctx.current_location.search != ctx.next_location.search
        || is_new_route_instance(current, next);

    let args = RevalidateArgs {
        current_location: ctx.current_location,
        current_params: &current.params,
        next_location: ctx.next_location,
        next_params: &next.params,
        submission: ctx.submission,
        action_result: ctx.action_result,
        action_status: ctx.action_status,
        default_should_revalidate: default,
    };
    match route.should_revalidate_fn() {
        Some(predicate) => predicate(&args),
        None => default,
    }
}

/// Decide whether an idle fetcher's loader reruns in this pass. Fetchers
/// sit outside the navigation match chain, so URL-derived defaults do not
/// apply; only forced revalidation (or an interrupted load) does.
pub(crate) fn should_reload_fetcher(
    target: &RouteMatch,
    ctx: &RevalidationContext<'_>,
    interrupted: bool,
) -> bool {
    let route = &target.route;
    if route.is_lazy_pending() {
        return true;
    }
    if !route.has_loader() {
        return false;
    }
    if interrupted {
        return true;
    }
    let args = RevalidateArgs {
        current_location: ctx.current_location,
        current_params: &target.params,
        next_location: ctx.next_location,
        next_params: &target.params,
        submission: ctx.submission,
        action_result: ctx.action_result,
        action_status: ctx.action_status,
        default_should_revalidate: ctx.force,
    };
    match route.should_revalidate_fn() {
        Some(predicate) => predicate(&args),
        None => ctx.force,
    }
}

/// Same route id landing on different URL text: a param or splat change.
pub(crate) fn is_new_route_instance(current: &RouteMatch, next: &RouteMatch) -> bool {
    current.pathname != next.pathname
        || (current
            .route
            .path
            .as_deref()
            .is_some_and(|p| p.ends_with('*'))
            && current.params.get("*") != next.params.get("*"))
}
