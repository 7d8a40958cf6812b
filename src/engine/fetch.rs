//! Keyed fetchers: background loads and submissions that run outside the
//! navigation lifecycle.
//!
//! # Responsibilities
//! - Run user-initiated fetcher loads and submissions under per-key
//!   cancellation, newest call winning the key
//! - Register loads for revalidation and hand submission results to the
//!   navigation pipeline for the follow-up pass
//! - Delete fetchers, deferring while busy when persistence is on
//!
//! # Design Decisions
//! - The controller map entry is the ownership token: a settlement that
//!   fails to remove its own entry was superseded and publishes nothing.
//! - Fetchers never stream; deferred loader results are resolved in place
//!   before settling.
//! - A settlement whose owning route has left the committed matches is
//!   discarded; the fetcher just returns to idle with the data it had.
//! - A failed fetcher is deleted and its error rides the page error model,
//!   bucketed near the owning route.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::data::submission::{action_request, apply_get_submission, loader_request};
use crate::data::{CallOutcome, RouteData, Submission};
use crate::error::{find_nearest_boundary, RouteError};
use crate::history::Location;
use crate::observability;
use crate::route::{target_match, RouteMatch};

use super::navigation::{
    self, call_route_handler, follow_redirect, full_path, interrupt_active_loads, CallKind,
    NavigationRequest,
};
use super::state::{Fetcher, Navigation};
use super::{FetchController, FetchOptions, FetchRecord, RouterShared};

/// Start (or restart) the fetcher under `key`. Any in-flight call for the
/// key is aborted first.
pub(crate) fn start_fetch(
    shared: &Arc<RouterShared>,
    key: &str,
    route_id: &str,
    href: &str,
    opts: FetchOptions,
) {
    let mut location = Location::from_path(&full_path(shared, href));
    let resolved = shared.resolve_matches(&location.pathname);
    if let Some((_, err)) = resolved.not_found {
        warn!(key, href, "fetch target does not match any route");
        set_fetcher_error(shared, key, route_id, err);
        return;
    }

    let mut submission = None;
    if let Some(spec) = opts.submission {
        let normalized = Submission::new(spec, shared.config.normalize_form_method);
        if normalized.method.is_mutation() {
            let target = target_match(&resolved.matches, &location.search).clone();
            start_fetch_submit(shared, key, route_id, location, target, normalized);
            return;
        }
        match apply_get_submission(&mut location, &normalized.body) {
            Ok(()) => submission = Some(normalized),
            Err(err) => {
                set_fetcher_error(shared, key, route_id, err);
                return;
            }
        }
    }

    let target = target_match(&resolved.matches, &location.search).clone();
    start_fetch_load(shared, key, route_id, location, target, submission);
}

fn start_fetch_load(
    shared: &Arc<RouterShared>,
    key: &str,
    route_id: &str,
    location: Location,
    target: RouteMatch,
    submission: Option<Submission>,
) {
    let (generation, token) = take_key(shared, key);
    observability::record_fetch_started("load");
    {
        let mut inner = shared.inner.lock();
        // A still newer call may have taken the key before we got here.
        let owned = shared
            .fetch_controllers
            .get(key)
            .is_some_and(|c| c.generation == generation);
        if !owned {
            return;
        }
        inner.fetch_records.insert(
            key.to_string(),
            FetchRecord {
                generation,
                route_id: route_id.to_string(),
                href: location.to_path(),
            },
        );
        // A restarted key is no longer being deleted.
        inner.pending_deletes.remove(key);
        let prev = inner.state.fetchers.get(key).and_then(|f| f.data.clone());
        let mut next = (*inner.state).clone();
        next.fetchers
            .insert(key.to_string(), Fetcher::loading(prev, submission.clone()));
        shared.publish(&mut inner, next);
    }
    debug!(key, href = %location.to_path(), generation, "fetcher load started");

    let job = FetchJob {
        key: key.to_string(),
        route_id: route_id.to_string(),
        generation,
        token,
        location,
        target,
        submission,
    };
    let shared = shared.clone();
    tokio::spawn(async move {
        run_fetch_load(shared, job).await;
    });
}

fn start_fetch_submit(
    shared: &Arc<RouterShared>,
    key: &str,
    route_id: &str,
    location: Location,
    target: RouteMatch,
    submission: Submission,
) {
    let (generation, token) = take_key(shared, key);
    observability::record_fetch_started("submit");
    // A mutation invalidates streaming data and other in-flight loads.
    interrupt_active_loads(shared);
    {
        let mut inner = shared.inner.lock();
        let owned = shared
            .fetch_controllers
            .get(key)
            .is_some_and(|c| c.generation == generation);
        if !owned {
            return;
        }
        inner.pending_deletes.remove(key);
        let prev = inner.state.fetchers.get(key).and_then(|f| f.data.clone());
        let mut next = (*inner.state).clone();
        next.fetchers.insert(
            key.to_string(),
            Fetcher::submitting(prev, submission.clone()),
        );
        shared.publish(&mut inner, next);
    }
    info!(key, href = %location.to_path(), method = submission.method.uppercase(), "fetcher submission started");

    let job = FetchJob {
        key: key.to_string(),
        route_id: route_id.to_string(),
        generation,
        token,
        location,
        target,
        submission: Some(submission),
    };
    let shared = shared.clone();
    tokio::spawn(async move {
        run_fetch_submit(shared, job).await;
    });
}

struct FetchJob {
    key: String,
    route_id: String,
    generation: u64,
    token: CancellationToken,
    location: Location,
    target: RouteMatch,
    submission: Option<Submission>,
}

/// Abort whoever holds the key and install a fresh controller, as one
/// atomic swap.
fn take_key(shared: &Arc<RouterShared>, key: &str) -> (u64, CancellationToken) {
    let generation = shared.clock.tick();
    let token = CancellationToken::new();
    match shared.fetch_controllers.entry(key.to_string()) {
        Entry::Occupied(mut slot) => {
            let prev = slot.insert(FetchController {
                generation,
                token: token.clone(),
            });
            prev.token.cancel();
        }
        Entry::Vacant(slot) => {
            slot.insert(FetchController {
                generation,
                token: token.clone(),
            });
        }
    }
    observability::record_fetch_controllers(shared.fetch_controllers.len());
    (generation, token)
}

/// Remove our controller entry. Returns false when a newer call has taken
/// the key (or the router was torn down), in which case the settlement
/// must be dropped.
fn release_key(shared: &Arc<RouterShared>, key: &str, generation: u64) -> bool {
    let owned = shared
        .fetch_controllers
        .remove_if(key, |_, c| c.generation == generation)
        .is_some();
    observability::record_fetch_controllers(shared.fetch_controllers.len());
    owned && !shared.is_disposed()
}

/// A settlement only applies while its owning route is still part of the
/// committed matches; work nobody owns anymore settles into nothing.
fn owner_still_matched(shared: &Arc<RouterShared>, route_id: &str) -> bool {
    let inner = shared.inner.lock();
    inner.state.matches.iter().any(|m| m.route.id == route_id)
}

/// Resolve a deferred loader result in place; fetchers never stream.
pub(crate) async fn resolve_fetcher_deferred(
    outcome: Option<CallOutcome>,
    token: &CancellationToken,
) -> Option<CallOutcome> {
    match outcome {
        Some(CallOutcome::Success {
            value: RouteData::Deferred(deferred),
            status,
            headers,
        }) => {
            let resolved = tokio::select! {
                _ = token.cancelled() => None,
                resolved = deferred.resolve_all() => Some(resolved),
            };
            match resolved {
                None => Some(CallOutcome::Aborted),
                Some(Ok(value)) => Some(CallOutcome::Success {
                    value: RouteData::Json(value),
                    status,
                    headers,
                }),
                Some(Err(error)) => Some(CallOutcome::Failure {
                    error,
                    status: None,
                    headers: None,
                }),
            }
        }
        other => other,
    }
}

async fn run_fetch_load(shared: Arc<RouterShared>, job: FetchJob) {
    let outcome = match loader_request(&job.location) {
        Ok(request) => {
            call_route_handler(
                CallKind::Loader,
                &job.target.route,
                request,
                job.target.params.clone(),
                job.token.clone(),
                None,
            )
            .await
        }
        Err(err) => Some(CallOutcome::failure(err)),
    };
    // Post-lazy the route may still lack a loader.
    let outcome = match outcome {
        None => Some(CallOutcome::failure(RouteError::no_handler(
            "GET",
            &job.location.pathname,
            &job.target.route.id,
        ))),
        other => other,
    };
    let outcome = resolve_fetcher_deferred(outcome, &job.token).await;

    if !release_key(&shared, &job.key, job.generation) {
        return;
    }
    let aborted = matches!(outcome, None | Some(CallOutcome::Aborted));
    if !aborted && !owner_still_matched(&shared, &job.route_id) {
        debug!(key = %job.key, route = %job.route_id, "fetcher result discarded; owning route left the matches");
        settle_idle_keep_data(&shared, &job.key);
        return;
    }
    match outcome {
        None | Some(CallOutcome::Aborted) => {}
        Some(CallOutcome::Redirect(redirect)) => {
            settle_idle_keep_data(&shared, &job.key);
            follow_redirect(&shared, redirect, None, false, false);
        }
        Some(CallOutcome::Failure { error, .. }) => {
            set_fetcher_error(&shared, &job.key, &job.route_id, error);
        }
        Some(CallOutcome::Success { value, .. }) => {
            let data = match value {
                RouteData::Json(value) => value,
                RouteData::Deferred(_) => unreachable!("deferred resolved above"),
            };
            let mut inner = shared.inner.lock();
            let current = inner
                .fetch_records
                .get(&job.key)
                .is_some_and(|r| r.generation == job.generation);
            if !current {
                return;
            }
            let deleting = inner.pending_deletes.remove(&job.key);
            let mut next = (*inner.state).clone();
            next.fetchers
                .insert(job.key.clone(), Fetcher::idle(Some(data)));
            shared.publish(&mut inner, next);
            debug!(key = %job.key, "fetcher load settled");
            if deleting {
                inner.fetch_records.remove(&job.key);
                let mut next = (*inner.state).clone();
                next.fetchers.remove(&job.key);
                shared.publish(&mut inner, next);
            }
        }
    }
}

async fn run_fetch_submit(shared: Arc<RouterShared>, job: FetchJob) {
    let submission = match &job.submission {
        Some(submission) => submission.clone(),
        None => return,
    };
    let outcome = match action_request(&job.location, &submission) {
        Ok(request) => {
            call_route_handler(
                CallKind::Action,
                &job.target.route,
                request,
                job.target.params.clone(),
                job.token.clone(),
                None,
            )
            .await
        }
        Err(err) => Some(CallOutcome::failure(err)),
    };
    let outcome = match outcome {
        None => Some(CallOutcome::failure(RouteError::no_handler(
            submission.method.uppercase(),
            &job.location.pathname,
            &job.target.route.id,
        ))),
        other => other,
    };

    if !release_key(&shared, &job.key, job.generation) {
        return;
    }
    let aborted = matches!(outcome, None | Some(CallOutcome::Aborted));
    if !aborted && !owner_still_matched(&shared, &job.route_id) {
        debug!(key = %job.key, route = %job.route_id, "fetcher result discarded; owning route left the matches");
        settle_idle_keep_data(&shared, &job.key);
        return;
    }
    match outcome {
        None | Some(CallOutcome::Aborted) => {}
        Some(CallOutcome::Redirect(redirect)) => {
            settle_idle_keep_data(&shared, &job.key);
            follow_redirect(&shared, redirect, Some(submission), false, false);
        }
        Some(CallOutcome::Failure { error, .. }) => {
            set_fetcher_error(&shared, &job.key, &job.route_id, error);
        }
        Some(CallOutcome::Success { value, .. }) => {
            let data = match value {
                RouteData::Json(value) => value,
                // Streaming data has no meaning for a mutation.
                RouteData::Deferred(deferred) => {
                    deferred.cancel();
                    set_fetcher_error(
                        &shared,
                        &job.key,
                        &job.route_id,
                        RouteError::bad_submission("actions cannot return deferred data"),
                    );
                    return;
                }
            };
            complete_submit(&shared, &job, &submission, data);
        }
    }
}

/// Publish the fetcher as loading with its action result and kick off the
/// revalidation pass that finishes it.
fn complete_submit(
    shared: &Arc<RouterShared>,
    job: &FetchJob,
    submission: &Submission,
    data: serde_json::Value,
) {
    let restart = {
        let mut inner = shared.inner.lock();
        if shared.is_disposed() {
            return;
        }
        if inner.pending_deletes.remove(&job.key) {
            // Deleted mid-flight under persistence: publish the terminal
            // state, then drop the fetcher.
            let mut next = (*inner.state).clone();
            next.fetchers
                .insert(job.key.clone(), Fetcher::idle(Some(data)));
            shared.publish(&mut inner, next);
            inner.fetch_records.remove(&job.key);
            let mut next = (*inner.state).clone();
            next.fetchers.remove(&job.key);
            shared.publish(&mut inner, next);
            return;
        }
        inner
            .pending_fetcher_completions
            .insert(job.key.clone(), data.clone());
        let mut next = (*inner.state).clone();
        next.fetchers.insert(
            job.key.clone(),
            Fetcher::loading(Some(data), Some(submission.clone())),
        );
        shared.publish(&mut inner, next);
        info!(key = %job.key, "fetcher action settled; revalidating");

        // A navigation action in flight will revalidate on its own and
        // drain the completion at its commit.
        if matches!(inner.state.navigation, Navigation::Submitting { .. }) {
            None
        } else if let Some(pending) = &inner.pending {
            // Restart the in-flight load pass so it sees the new data.
            Some(NavigationRequest {
                location: pending.location.clone(),
                history_action: pending.history_action,
                submission: pending.submission.clone(),
                pending_error: None,
                quiet: pending.quiet,
                force_revalidate: true,
                skip_action: true,
                preserve_action_data: true,
                action_data: pending.action_data.clone(),
            })
        } else {
            Some(NavigationRequest {
                location: inner.state.location.clone(),
                history_action: inner.state.history_action,
                submission: Some(submission.clone()),
                pending_error: None,
                quiet: true,
                force_revalidate: true,
                skip_action: true,
                preserve_action_data: true,
                action_data: None,
            })
        }
    };
    if let Some(request) = restart {
        navigation::start_navigation(shared, request);
    }
}

/// Park the fetcher idle with whatever data it had, honoring a deletion
/// requested while it was busy.
fn settle_idle_keep_data(shared: &Arc<RouterShared>, key: &str) {
    let mut inner = shared.inner.lock();
    if shared.is_disposed() {
        return;
    }
    let mut next = (*inner.state).clone();
    if inner.pending_deletes.remove(key) {
        inner.fetch_records.remove(key);
        next.fetchers.remove(key);
    } else {
        let data = inner.state.fetchers.get(key).and_then(|f| f.data.clone());
        next.fetchers.insert(key.to_string(), Fetcher::idle(data));
    }
    shared.publish(&mut inner, next);
}

/// Delete the fetcher and surface its error near the owning route. The
/// error replaces the page error model, as a fresh settlement pass.
fn set_fetcher_error(shared: &Arc<RouterShared>, key: &str, route_id: &str, error: RouteError) {
    let mut inner = shared.inner.lock();
    if shared.is_disposed() {
        return;
    }
    let boundary = find_nearest_boundary(&inner.state.matches, Some(route_id))
        .route
        .id
        .clone();
    warn!(key, route = route_id, boundary = %boundary, error = %error, "fetcher failed");
    inner.fetch_records.remove(key);
    inner.pending_deletes.remove(key);
    inner.pending_fetcher_completions.remove(key);
    let mut next = (*inner.state).clone();
    next.fetchers.remove(key);
    next.errors = Some(HashMap::from([(boundary, error)]));
    shared.publish(&mut inner, next);
}

/// Drop the fetcher under `key`. While persistence is on, a busy fetcher
/// is only marked; the real removal happens when its work settles.
pub(crate) fn delete_fetcher(shared: &Arc<RouterShared>, key: &str) {
    if shared.is_disposed() {
        return;
    }
    let mut inner = shared.inner.lock();
    let busy = shared.fetch_controllers.contains_key(key)
        || inner
            .state
            .fetchers
            .get(key)
            .is_some_and(|f| !f.is_idle());
    if busy && shared.config.persist_fetchers {
        debug!(key, "fetcher deletion deferred until settlement");
        inner.pending_deletes.insert(key.to_string());
        return;
    }
    if let Some((_, controller)) = shared.fetch_controllers.remove(key) {
        controller.token.cancel();
    }
    observability::record_fetch_controllers(shared.fetch_controllers.len());
    inner.fetch_records.remove(key);
    inner.pending_deletes.remove(key);
    inner.pending_fetcher_completions.remove(key);
    if inner.state.fetchers.contains_key(key) {
        let mut next = (*inner.state).clone();
        next.fetchers.remove(key);
        shared.publish(&mut inner, next);
    }
}
