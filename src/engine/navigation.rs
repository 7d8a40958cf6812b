//! The navigation pipeline: action phase, load planning, settlement
//! processing and commit.
//!
//! # Responsibilities
//! - Normalize `navigate` calls into navigation jobs and arbitrate them
//!   against whatever is already in flight
//! - Run the mutation action, then the planned loaders and fetcher
//!   revalidations, then commit one new state snapshot
//! - Chase redirects by starting a fresh navigation at the target
//!
//! # Design Decisions
//! - A job carries the generation stamp it was born with. Every publish
//!   and the final commit re-check that stamp under the lock; a stale job
//!   simply stops, it never rolls anything back.
//! - Aborted settlements are dropped. Cancellation is delivered through
//!   the job's token, which also fans out to per-call child tokens.
//! - The inner lock is never held across an await. Each phase locks, reads
//!   or writes what it needs, and releases before any async work.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use http::StatusCode;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::data::submission::{action_request, apply_get_submission, loader_request};
use crate::data::{
    normalize_result, CallOutcome, DataFunctionArgs, Params, RedirectResult, RequestContext,
    RouteData, Submission,
};
use crate::error::{find_nearest_boundary, RouteError};
use crate::history::{HistoryAction, Location};
use crate::observability;
use crate::path::join_paths;
use crate::route::{target_match, RouteMatch, RouteRecord};

use super::revalidation::{should_reload, should_reload_fetcher, RevalidationContext};
use super::state::{Fetcher, Navigation, RevalidationState, RouteDataMap, RouteErrorMap};
use super::{
    EngineState, FetchController, NavigateOptions, PendingNavigation, RouterShared, RouterState,
};

/// A fully normalized navigation, ready to enter the pipeline.
pub(crate) struct NavigationRequest {
    pub location: Location,
    pub history_action: HistoryAction,
    pub submission: Option<Submission>,
    /// An error to commit without running the target's handlers (bad
    /// submission encoding).
    pub pending_error: Option<RouteError>,
    /// Suppress intermediate state publications.
    pub quiet: bool,
    /// Treat every loader as due for revalidation.
    pub force_revalidate: bool,
    /// The submission already ran its action (redirect follow-ups,
    /// revalidation restarts).
    pub skip_action: bool,
    /// Carry the committed action data forward instead of clearing it.
    /// Set for fetcher-triggered revalidation passes.
    pub preserve_action_data: bool,
    /// Action data settled by an earlier pass of this same submission,
    /// inherited when that pass is restarted mid-load.
    pub action_data: Option<HashMap<String, Value>>,
}

/// Resolve a caller-supplied path against the configured basename.
pub(crate) fn full_path(shared: &RouterShared, to: &str) -> String {
    if shared.config.basename == "/" {
        to.to_string()
    } else {
        let parts = crate::path::parse_path(to);
        format!(
            "{}{}{}",
            join_paths(&shared.config.basename, &parts.pathname),
            parts.search,
            parts.hash
        )
    }
}

/// Normalize a `navigate` call and start the job.
pub(crate) fn begin_navigation(shared: &Arc<RouterShared>, to: &str, opts: NavigateOptions) {
    let current = shared.state_tx.borrow().clone();
    let mut location = Location::from_path(&full_path(shared, to)).with_state(opts.state);

    let mut submission = None;
    let mut pending_error = None;
    if let Some(spec) = opts.submission {
        let normalized = Submission::new(spec, shared.config.normalize_form_method);
        if normalized.method.is_mutation() {
            submission = Some(normalized);
        } else {
            // GET submissions carry no body; the form pairs become the
            // target's search string.
            match apply_get_submission(&mut location, &normalized.body) {
                Ok(()) => submission = Some(normalized),
                Err(err) => pending_error = Some(err),
            }
        }
    }

    let same_path = location.pathname == current.location.pathname
        && location.search == current.location.search;
    let is_mutation = submission
        .as_ref()
        .is_some_and(|s| s.method.is_mutation());
    let replace = opts.replace.unwrap_or(is_mutation && same_path);
    let history_action = if replace {
        HistoryAction::Replace
    } else {
        HistoryAction::Push
    };

    start_navigation(
        shared,
        NavigationRequest {
            location,
            history_action,
            submission,
            pending_error,
            quiet: false,
            force_revalidate: false,
            skip_action: false,
            preserve_action_data: false,
            action_data: None,
        },
    );
}

/// Register the job as the pending navigation, superseding any previous
/// one, and hand it to a task.
pub(crate) fn start_navigation(shared: &Arc<RouterShared>, request: NavigationRequest) {
    if shared.is_disposed() {
        return;
    }
    let generation = shared.clock.tick();
    let token = CancellationToken::new();
    {
        let mut inner = shared.inner.lock();
        if let Some(prev) = inner.pending.take() {
            prev.token.cancel();
            debug!(superseded = prev.generation, by = generation, "navigation superseded");
            observability::record_navigation_superseded();
        }
        inner.pending = Some(PendingNavigation {
            generation,
            token: token.clone(),
            location: request.location.clone(),
            history_action: request.history_action,
            submission: request.submission.clone(),
            quiet: request.quiet,
            action_data: request.action_data.clone(),
        });
    }
    let job = NavJob {
        generation,
        token,
        location: request.location,
        history_action: request.history_action,
        submission: request.submission,
        pending_error: request.pending_error,
        quiet: request.quiet,
        force_revalidate: request.force_revalidate,
        skip_action: request.skip_action,
        preserve_action_data: request.preserve_action_data,
        action_data: request.action_data,
    };
    let shared = shared.clone();
    tokio::spawn(async move {
        run_navigation(shared, job).await;
    });
}

/// Rerun loaders for the current location, or fold into the in-flight
/// navigation.
pub(crate) fn start_revalidation(shared: &Arc<RouterShared>) {
    interrupt_active_loads(shared);
    let restart = {
        let mut inner = shared.inner.lock();
        inner.revalidation_requested = true;
        let mut next = (*inner.state).clone();
        next.revalidation = RevalidationState::Loading;
        shared.publish(&mut inner, next);

        match inner.state.navigation.clone() {
            // The running action revalidates when it finishes.
            Navigation::Submitting { .. } => None,
            Navigation::Idle => Some(NavigationRequest {
                location: inner.state.location.clone(),
                history_action: inner.state.history_action,
                submission: None,
                pending_error: None,
                quiet: true,
                force_revalidate: false,
                skip_action: true,
                preserve_action_data: true,
                action_data: None,
            }),
            // Restart the in-flight load pass so it picks up the request.
            Navigation::Loading {
                location,
                submission,
            } => {
                let history_action = inner
                    .pending
                    .as_ref()
                    .map(|p| p.history_action)
                    .unwrap_or(inner.state.history_action);
                let action_data = inner.pending.as_ref().and_then(|p| p.action_data.clone());
                Some(NavigationRequest {
                    location,
                    history_action,
                    submission,
                    pending_error: None,
                    quiet: false,
                    force_revalidate: false,
                    skip_action: true,
                    preserve_action_data: true,
                    action_data,
                })
            }
        }
    };
    if let Some(request) = restart {
        start_navigation(shared, request);
    }
}

/// Cancel work a mutation or explicit revalidation invalidates: streaming
/// data and in-flight fetcher loads. Both are marked so the next planning
/// pass reloads them.
pub(crate) fn interrupt_active_loads(shared: &Arc<RouterShared>) {
    let mut inner = shared.inner.lock();
    let EngineState {
        active_deferreds,
        cancelled_deferred_routes,
        cancelled_fetcher_loads,
        fetch_records,
        state,
        ..
    } = &mut *inner;
    for (route_id, deferred) in active_deferreds.drain() {
        deferred.cancel();
        cancelled_deferred_routes.insert(route_id);
    }
    for key in fetch_records.keys() {
        let loading = state
            .fetchers
            .get(key)
            .is_some_and(|f| f.state == super::FetcherState::Loading);
        if !loading {
            continue;
        }
        if let Some(controller) = shared.fetch_controllers.get(key) {
            controller.token.cancel();
            cancelled_fetcher_loads.insert(key.clone());
        }
    }
}

struct NavJob {
    generation: u64,
    token: CancellationToken,
    location: Location,
    history_action: HistoryAction,
    submission: Option<Submission>,
    pending_error: Option<RouteError>,
    quiet: bool,
    force_revalidate: bool,
    skip_action: bool,
    preserve_action_data: bool,
    action_data: Option<HashMap<String, Value>>,
}

impl NavJob {
    fn is_current(&self, shared: &RouterShared) -> bool {
        !shared.is_disposed()
            && shared
                .inner
                .lock()
                .pending
                .as_ref()
                .is_some_and(|p| p.generation == self.generation)
    }
}

/// What a finished job hands to `commit`.
struct CommitPayload {
    matches: Vec<RouteMatch>,
    loader_data: RouteDataMap,
    action_data: Option<HashMap<String, Value>>,
    errors: Option<RouteErrorMap>,
    /// Fetcher settlements from this pass: `Some` replaces, `None` deletes.
    fetcher_updates: Vec<(String, Option<Fetcher>)>,
}

async fn run_navigation(shared: Arc<RouterShared>, mut job: NavJob) {
    let started = Instant::now();
    let kind = match &job.submission {
        Some(s) if s.method.is_mutation() && !job.skip_action => "submit",
        Some(_) => "load",
        None => "load",
    };
    observability::record_navigation_started(kind);
    info!(
        path = %job.location.to_path(),
        action = job.history_action.as_str(),
        kind,
        generation = job.generation,
        "navigation started"
    );

    let resolved = shared.resolve_matches(&job.location.pathname);
    let matches = resolved.matches;
    let current = shared.state_tx.borrow().clone();

    // No match: commit the 404 against the synthetic chain. Nothing runs.
    if let Some((boundary_id, err)) = resolved.not_found {
        commit(
            &shared,
            &job,
            CommitPayload {
                matches,
                loader_data: HashMap::new(),
                action_data: None,
                errors: Some(HashMap::from([(boundary_id, err)])),
                fetcher_updates: Vec::new(),
            },
        );
        observability::record_navigation_completed("not_found", started.elapsed());
        return;
    }

    // Hash-only movement commits without running anything.
    let revalidation_wanted = shared.inner.lock().revalidation_requested;
    if job.submission.is_none()
        && job.pending_error.is_none()
        && !revalidation_wanted
        && !job.force_revalidate
        && current.location.pathname == job.location.pathname
        && current.location.search == job.location.search
        && current.location.hash != job.location.hash
    {
        commit(
            &shared,
            &job,
            CommitPayload {
                matches,
                loader_data: current.loader_data.clone(),
                action_data: None,
                errors: current.errors.clone(),
                fetcher_updates: Vec::new(),
            },
        );
        observability::record_navigation_completed("hash_change", started.elapsed());
        return;
    }

    // Action phase.
    let mut pending_error: Option<(String, RouteError)> = job
        .pending_error
        .take()
        .map(|err| (find_nearest_boundary(&matches, None).route.id.clone(), err));
    let mut action_data: Option<HashMap<String, Value>> = job.action_data.take();
    let mut action_result: Option<Value> = None;
    let mut action_status: Option<StatusCode> = None;

    let action_submission = if pending_error.is_none() && !job.skip_action {
        job.submission
            .clone()
            .filter(|s| s.method.is_mutation())
    } else {
        None
    };
    if let Some(submission) = action_submission {
        // A mutation invalidates everything streaming or loading.
        interrupt_active_loads(&shared);
        if !job.quiet {
            if !publish_if_current(&shared, &job, |state| {
                state.navigation = Navigation::Submitting {
                    location: job.location.clone(),
                    submission: submission.clone(),
                };
            }) {
                return;
            }
        }

        let target = target_match(&matches, &job.location.search).clone();
        match run_action(&job, &target, &submission).await {
            ActionPhase::Aborted => return,
            ActionPhase::Redirect(redirect) => {
                start_redirect_navigation(&shared, &job, redirect);
                observability::record_navigation_completed("redirect", started.elapsed());
                return;
            }
            ActionPhase::Error { error, status } => {
                let boundary = find_nearest_boundary(&matches, Some(&target.route.id));
                pending_error = Some((boundary.route.id.clone(), error));
                action_status = status;
            }
            ActionPhase::Data { value, status } => {
                let data = HashMap::from([(target.route.id.clone(), value.clone())]);
                // Park the result on the pending record so a restart of this
                // pass inherits it.
                {
                    let mut inner = shared.inner.lock();
                    if let Some(pending) = inner.pending.as_mut() {
                        if pending.generation == job.generation {
                            pending.action_data = Some(data.clone());
                        }
                    }
                }
                action_data = Some(data);
                action_result = Some(value);
                action_status = status;
            }
        }
    }

    // Planning: which loaders and which fetchers run.
    let carried_mutation = job
        .submission
        .as_ref()
        .is_some_and(|s| s.method.is_mutation());
    let (to_load, fetcher_plans, force) = {
        let mut inner = shared.inner.lock();
        let force =
            inner.revalidation_requested || job.force_revalidate || carried_mutation;
        let boundary_matches = match &pending_error {
            // After an action error only loaders above the boundary run.
            Some((boundary_id, _)) => {
                match matches.iter().position(|m| m.route.id == *boundary_id) {
                    Some(idx) => &matches[..idx],
                    None => &matches[..],
                }
            }
            None => &matches[..],
        };
        let ctx = RevalidationContext {
            current_location: &current.location,
            next_location: &job.location,
            current_matches: &current.matches,
            loader_data: &current.loader_data,
            submission: job.submission.as_ref(),
            action_result: action_result.as_ref(),
            action_status,
            force,
        };
        let to_load: Vec<RouteMatch> = boundary_matches
            .iter()
            .filter(|m| {
                should_reload(
                    m,
                    &ctx,
                    inner.cancelled_deferred_routes.contains(&m.route.id),
                )
            })
            .cloned()
            .collect();
        let fetcher_plans = plan_fetcher_revalidations(&shared, &inner, &matches, &ctx);

        // Streaming data for routes leaving the page or about to reload is
        // dead; cancel it now so its fields settle as aborted.
        let reload_ids: HashSet<&str> = to_load.iter().map(|m| m.route.id.as_str()).collect();
        let stale: Vec<String> = inner
            .active_deferreds
            .keys()
            .filter(|id| {
                !matches.iter().any(|m| &m.route.id == *id) || reload_ids.contains(id.as_str())
            })
            .cloned()
            .collect();
        for id in stale {
            if let Some(deferred) = inner.active_deferreds.remove(&id) {
                deferred.cancel();
                inner.cancelled_deferred_routes.insert(id);
            }
        }
        (to_load, fetcher_plans, force)
    };

    if to_load.is_empty() && fetcher_plans.is_empty() {
        // Nothing to run; carry the current data forward.
        let loader_data = merge_loader_data(
            &current.loader_data,
            HashMap::new(),
            &matches,
            pending_error.as_ref().map(|(id, _)| id.as_str()),
        );
        let errors = collect_errors(pending_error, Vec::new());
        commit(
            &shared,
            &job,
            CommitPayload {
                matches,
                loader_data,
                action_data,
                errors,
                fetcher_updates: Vec::new(),
            },
        );
        observability::record_navigation_completed("no_loads", started.elapsed());
        return;
    }

    if !job.quiet {
        let plans = &fetcher_plans;
        if !publish_if_current(&shared, &job, |state| {
            state.navigation = Navigation::Loading {
                location: job.location.clone(),
                submission: job.submission.clone(),
            };
            for plan in plans {
                let data = state.fetchers.get(&plan.key).and_then(|f| f.data.clone());
                state.fetchers.insert(plan.key.clone(), Fetcher::loading(data, None));
            }
        }) {
            return;
        }
    }
    debug!(
        loads = to_load.len(),
        fetchers = fetcher_plans.len(),
        forced = force,
        "load phase started"
    );

    // Run loaders and fetcher loads together.
    let loader_futs = to_load.iter().map(|m| {
        let token = job.token.clone();
        let location = job.location.clone();
        let route = m.route.clone();
        let params = m.params.clone();
        async move {
            let outcome = match loader_request(&location) {
                Ok(request) => {
                    call_route_handler(CallKind::Loader, &route, request, params, token, None).await
                }
                Err(err) => Some(CallOutcome::failure(err)),
            };
            (route.id.clone(), outcome)
        }
    });
    let fetcher_futs = fetcher_plans.iter().map(|plan| {
        let shared = shared.clone();
        let plan = plan.clone();
        let token = job.token.clone();
        async move { run_fetcher_revalidation(&shared, plan, token).await }
    });
    let (loader_results, fetcher_results) = tokio::join!(
        futures_util::future::join_all(loader_futs),
        futures_util::future::join_all(fetcher_futs),
    );

    if !job.is_current(&shared) {
        observability::record_navigation_completed("superseded", started.elapsed());
        return;
    }

    // Deepest redirect wins; fetcher redirects outrank loader ones.
    let loader_redirect = loader_results
        .iter()
        .rev()
        .find_map(|(_, o)| match o {
            Some(CallOutcome::Redirect(r)) => Some(r.clone()),
            _ => None,
        });
    let fetcher_redirect = fetcher_results.iter().rev().find_map(|r| match &r.outcome {
        Some(CallOutcome::Redirect(redirect)) => Some(redirect.clone()),
        _ => None,
    });
    if let Some(redirect) = fetcher_redirect.or(loader_redirect) {
        start_redirect_navigation(&shared, &job, redirect);
        observability::record_navigation_completed("redirect", started.elapsed());
        return;
    }

    // Fold settlements into data and errors.
    let mut new_data: RouteDataMap = HashMap::new();
    let mut loader_errors: Vec<(String, RouteError)> = Vec::new();
    for (route_id, outcome) in loader_results {
        match outcome {
            None => {}
            Some(CallOutcome::Aborted) => return,
            Some(CallOutcome::Success { value, .. }) => {
                new_data.insert(route_id, value);
            }
            Some(CallOutcome::Failure { error, .. }) => {
                let boundary = find_nearest_boundary(&matches, Some(&route_id));
                loader_errors.push((boundary.route.id.clone(), error));
            }
            Some(CallOutcome::Redirect(_)) => unreachable!("redirects handled above"),
        }
    }
    let errors = collect_errors(pending_error, loader_errors);

    let mut fetcher_updates: Vec<(String, Option<Fetcher>)> = Vec::new();
    let mut fetcher_errors: Vec<(String, RouteError)> = Vec::new();
    for settled in fetcher_results {
        match settled.outcome {
            None | Some(CallOutcome::Aborted) => {}
            Some(CallOutcome::Success { value, .. }) => {
                let data = match value {
                    RouteData::Json(v) => Some(v),
                    RouteData::Deferred(_) => None,
                };
                fetcher_updates.push((settled.key, Some(Fetcher::idle(data))));
            }
            Some(CallOutcome::Failure { error, .. }) => {
                let boundary = find_nearest_boundary(&matches, Some(&settled.route_id));
                fetcher_errors.push((boundary.route.id.clone(), error));
                fetcher_updates.push((settled.key, None));
            }
            Some(CallOutcome::Redirect(_)) => unreachable!("redirects handled above"),
        }
    }
    let errors = merge_fetcher_errors(errors, fetcher_errors);

    let boundary_id = errors
        .as_ref()
        .and_then(|e| first_boundary_in_chain(&matches, e));
    let loader_data = merge_loader_data(&current.loader_data, new_data, &matches, boundary_id);

    commit(
        &shared,
        &job,
        CommitPayload {
            matches,
            loader_data,
            action_data,
            errors,
            fetcher_updates,
        },
    );
    observability::record_navigation_completed("committed", started.elapsed());
}

enum ActionPhase {
    Aborted,
    Redirect(RedirectResult),
    Error {
        error: RouteError,
        status: Option<StatusCode>,
    },
    Data {
        value: Value,
        status: Option<StatusCode>,
    },
}

async fn run_action(job: &NavJob, target: &RouteMatch, submission: &Submission) -> ActionPhase {
    if let Err(err) = target.route.resolve_lazy().await {
        observability::record_lazy_resolution("error");
        return ActionPhase::Error {
            error: err,
            status: None,
        };
    }
    if !target.route.has_action() {
        warn!(route = %target.route.id, "submission targeted a route without an action");
        return ActionPhase::Error {
            error: RouteError::no_handler(
                submission.method.uppercase(),
                &job.location.pathname,
                &target.route.id,
            ),
            status: Some(StatusCode::METHOD_NOT_ALLOWED),
        };
    }
    let request = match action_request(&job.location, submission) {
        Ok(request) => request,
        Err(err) => {
            return ActionPhase::Error {
                error: err,
                status: Some(StatusCode::BAD_REQUEST),
            }
        }
    };
    let outcome = call_route_handler(
        CallKind::Action,
        &target.route,
        request,
        target.params.clone(),
        job.token.clone(),
        None,
    )
    .await;
    match outcome {
        None | Some(CallOutcome::Aborted) => ActionPhase::Aborted,
        Some(CallOutcome::Redirect(redirect)) => ActionPhase::Redirect(redirect),
        Some(CallOutcome::Failure { error, status, .. }) => ActionPhase::Error { error, status },
        Some(CallOutcome::Success { value, status, .. }) => match value {
            RouteData::Json(value) => ActionPhase::Data { value, status },
            // Streaming data has no meaning for a mutation.
            RouteData::Deferred(deferred) => {
                deferred.cancel();
                ActionPhase::Error {
                    error: RouteError::bad_submission(
                        "actions cannot return deferred data",
                    ),
                    status: Some(StatusCode::BAD_REQUEST),
                }
            }
        },
    }
}

pub(crate) enum CallKind {
    Loader,
    Action,
}

impl CallKind {
    fn as_str(&self) -> &'static str {
        match self {
            CallKind::Loader => "loader",
            CallKind::Action => "action",
        }
    }
}

/// Resolve the route's lazy module, pick the handler, and race it against
/// cancellation. `None` means the route has no such handler after lazy
/// resolution; the caller decides what that implies.
pub(crate) async fn call_route_handler(
    kind: CallKind,
    route: &Arc<RouteRecord>,
    request: http::Request<bytes::Bytes>,
    params: Params,
    token: CancellationToken,
    context: Option<RequestContext>,
) -> Option<CallOutcome> {
    let was_lazy = route.is_lazy_pending();
    if let Err(err) = route.resolve_lazy().await {
        observability::record_lazy_resolution("error");
        return Some(CallOutcome::failure(err));
    }
    if was_lazy {
        observability::record_lazy_resolution("ok");
    }
    let handler = match kind {
        CallKind::Loader => route.loader(),
        CallKind::Action => route.action(),
    }?;

    let started = Instant::now();
    let signal = token.child_token();
    let args = DataFunctionArgs {
        request,
        params,
        signal: signal.clone(),
        context,
    };
    let fut = handler(args);
    let outcome = tokio::select! {
        _ = token.cancelled() => CallOutcome::Aborted,
        result = fut => normalize_result(result),
    };
    observability::record_data_call(kind.as_str(), outcome.kind(), started.elapsed());
    debug!(route = %route.id, kind = kind.as_str(), outcome = outcome.kind(), "data call settled");
    Some(outcome)
}

/// One fetcher revalidation planned into a navigation's load phase.
#[derive(Clone)]
pub(crate) struct FetcherPlan {
    pub key: String,
    pub route_id: String,
    pub record_generation: u64,
    pub target: RouteMatch,
    pub location: Location,
}

pub(crate) struct FetcherSettled {
    pub key: String,
    pub route_id: String,
    pub outcome: Option<CallOutcome>,
}

fn plan_fetcher_revalidations(
    shared: &Arc<RouterShared>,
    inner: &EngineState,
    next_matches: &[RouteMatch],
    ctx: &RevalidationContext<'_>,
) -> Vec<FetcherPlan> {
    let mut plans = Vec::new();
    for (key, record) in &inner.fetch_records {
        if inner.pending_deletes.contains(key) {
            continue;
        }
        // Reloading is for fetchers somebody still owns.
        if !next_matches.iter().any(|m| m.route.id == record.route_id) {
            debug!(key, route = %record.route_id, "fetcher reload skipped; owning route not matched");
            continue;
        }
        let interrupted = inner.cancelled_fetcher_loads.contains(key);
        let idle = inner
            .state
            .fetchers
            .get(key)
            .map(|f| f.is_idle())
            .unwrap_or(true);
        if !idle && !interrupted {
            // A live user-initiated call owns this key right now.
            continue;
        }
        let parts = crate::path::parse_path(&record.href);
        let resolved = shared.resolve_matches(&parts.pathname);
        if resolved.not_found.is_some() {
            warn!(key, href = %record.href, "fetcher href no longer matches; dropping");
            continue;
        }
        let target = target_match(&resolved.matches, &parts.search).clone();
        if should_reload_fetcher(&target, ctx, interrupted) {
            plans.push(FetcherPlan {
                key: key.clone(),
                route_id: record.route_id.clone(),
                record_generation: record.generation,
                target,
                location: Location::from_path(&record.href),
            });
        }
    }
    plans
}

/// Run one planned fetcher load under the navigation's token, registered
/// as that key's controller so a user call can still take over.
async fn run_fetcher_revalidation(
    shared: &Arc<RouterShared>,
    plan: FetcherPlan,
    nav_token: CancellationToken,
) -> FetcherSettled {
    // Own generation for the controller entry: a leftover settlement from
    // the superseded call must not be able to release this one.
    let call_generation = shared.clock.tick();
    let token = nav_token.child_token();
    let installed = match shared.fetch_controllers.entry(plan.key.clone()) {
        Entry::Vacant(slot) => {
            slot.insert(FetchController {
                generation: call_generation,
                token: token.clone(),
            });
            true
        }
        // An interrupted call's cancelled entry is ours to take over. A
        // live entry means a user call grabbed the key after planning.
        Entry::Occupied(mut slot) if slot.get().token.is_cancelled() => {
            slot.insert(FetchController {
                generation: call_generation,
                token: token.clone(),
            });
            true
        }
        Entry::Occupied(_) => false,
    };
    if !installed {
        debug!(key = %plan.key, "fetcher reload skipped; a newer call owns the key");
        return FetcherSettled {
            key: plan.key,
            route_id: plan.route_id,
            outcome: Some(CallOutcome::Aborted),
        };
    }
    observability::record_fetch_controllers(shared.fetch_controllers.len());

    let outcome = match loader_request(&plan.location) {
        Ok(request) => {
            call_route_handler(
                CallKind::Loader,
                &plan.target.route,
                request,
                plan.target.params.clone(),
                token.clone(),
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
            &plan.location.pathname,
            &plan.target.route.id,
        ))),
        other => other,
    };
    let outcome = super::fetch::resolve_fetcher_deferred(outcome, &token).await;

    shared
        .fetch_controllers
        .remove_if(&plan.key, |_, c| c.generation == call_generation);
    observability::record_fetch_controllers(shared.fetch_controllers.len());

    // A newer call for this key owns the record now; drop our settlement.
    let stale = {
        let inner = shared.inner.lock();
        inner
            .fetch_records
            .get(&plan.key)
            .map(|r| r.generation != plan.record_generation)
            .unwrap_or(true)
    };
    FetcherSettled {
        key: plan.key,
        route_id: plan.route_id,
        outcome: if stale { Some(CallOutcome::Aborted) } else { outcome },
    }
}

/// Start a follow-up navigation at a redirect target. The redirect
/// inherits push semantics unless it lands back on the committed location.
fn start_redirect_navigation(shared: &Arc<RouterShared>, job: &NavJob, redirect: RedirectResult) {
    follow_redirect(
        shared,
        redirect,
        job.submission.clone(),
        job.history_action == HistoryAction::Replace,
        job.quiet,
    );
}

/// The shared redirect follow-up, also used when a fetcher call redirects.
pub(crate) fn follow_redirect(
    shared: &Arc<RouterShared>,
    redirect: RedirectResult,
    submission: Option<Submission>,
    inherited_replace: bool,
    quiet: bool,
) {
    observability::record_redirect();
    let path = normalize_redirect_target(&redirect.location);
    let current = shared.state_tx.borrow().clone();
    let location = Location::from_path(&path);
    let same_as_committed = location.pathname == current.location.pathname
        && location.search == current.location.search;
    let history_action = if inherited_replace || same_as_committed {
        HistoryAction::Replace
    } else {
        HistoryAction::Push
    };
    let force_revalidate = (redirect.revalidate && shared.config.revalidate_on_redirect_header)
        || submission.as_ref().is_some_and(|s| s.method.is_mutation());
    info!(
        target = %path,
        status = %redirect.status,
        action = history_action.as_str(),
        "following redirect"
    );
    start_navigation(
        shared,
        NavigationRequest {
            location,
            history_action,
            submission,
            pending_error: None,
            quiet,
            force_revalidate,
            skip_action: true,
            preserve_action_data: false,
            action_data: None,
        },
    );
}

/// Absolute URLs reduce to path + query + fragment; anything that does not
/// parse as absolute is taken as a path already.
fn normalize_redirect_target(location: &str) -> String {
    match url::Url::parse(location) {
        Ok(parsed) => {
            let mut path = parsed.path().to_string();
            if let Some(query) = parsed.query() {
                path.push('?');
                path.push_str(query);
            }
            if let Some(fragment) = parsed.fragment() {
                path.push('#');
                path.push_str(fragment);
            }
            path
        }
        Err(_) => location.to_string(),
    }
}

/// Apply a mutation to a clone of the current state and publish it, unless
/// the job has been superseded. Returns false when stale.
fn publish_if_current(
    shared: &Arc<RouterShared>,
    job: &NavJob,
    mutate: impl FnOnce(&mut RouterState),
) -> bool {
    let mut inner = shared.inner.lock();
    let current = inner
        .pending
        .as_ref()
        .is_some_and(|p| p.generation == job.generation);
    if !current || shared.is_disposed() {
        return false;
    }
    let mut next = (*inner.state).clone();
    mutate(&mut next);
    shared.publish(&mut inner, next);
    true
}

/// Seed the action error, then fold in loader errors root-to-leaf with
/// first-write-wins per bucket.
fn collect_errors(
    pending_error: Option<(String, RouteError)>,
    loader_errors: Vec<(String, RouteError)>,
) -> Option<RouteErrorMap> {
    let mut errors: RouteErrorMap = HashMap::new();
    if let Some((boundary, error)) = pending_error {
        errors.insert(boundary, error);
    }
    for (boundary, error) in loader_errors {
        errors.entry(boundary).or_insert(error);
    }
    if errors.is_empty() {
        None
    } else {
        Some(errors)
    }
}

fn merge_fetcher_errors(
    errors: Option<RouteErrorMap>,
    fetcher_errors: Vec<(String, RouteError)>,
) -> Option<RouteErrorMap> {
    if fetcher_errors.is_empty() {
        return errors;
    }
    let mut errors = errors.unwrap_or_default();
    for (boundary, error) in fetcher_errors {
        errors.entry(boundary).or_insert(error);
    }
    Some(errors)
}

/// The shallowest matched route holding an error, if any.
fn first_boundary_in_chain<'a>(
    matches: &'a [RouteMatch],
    errors: &RouteErrorMap,
) -> Option<&'a str> {
    matches
        .iter()
        .find(|m| errors.contains_key(&m.route.id))
        .map(|m| m.route.id.as_str())
}

/// Merge fresh loader data over carried-forward data, walking the match
/// chain root-to-leaf. Data at and below the error bucket is dropped.
fn merge_loader_data(
    old: &RouteDataMap,
    mut new: RouteDataMap,
    matches: &[RouteMatch],
    error_boundary: Option<&str>,
) -> RouteDataMap {
    let mut merged = RouteDataMap::new();
    for m in matches {
        let id = &m.route.id;
        if error_boundary == Some(id.as_str()) {
            break;
        }
        if let Some(value) = new.remove(id) {
            merged.insert(id.clone(), value);
        } else if m.route.has_loader() {
            if let Some(value) = old.get(id) {
                merged.insert(id.clone(), value.clone());
            }
        }
    }
    merged
}

/// Apply the history side effect and publish the committed snapshot.
fn commit(shared: &Arc<RouterShared>, job: &NavJob, payload: CommitPayload) {
    let mut inner = shared.inner.lock();
    if shared.is_disposed() {
        return;
    }
    match &inner.pending {
        Some(p) if p.generation == job.generation => {}
        _ => return,
    }
    inner.pending = None;
    inner.revalidation_requested = false;
    inner.cancelled_deferred_routes.clear();
    inner.cancelled_fetcher_loads.clear();

    // Register fresh streaming data so later passes can cancel it.
    for (id, data) in &payload.loader_data {
        if let RouteData::Deferred(deferred) = data {
            inner.active_deferreds.insert(id.clone(), deferred.clone());
        }
    }

    {
        let mut history = shared.history.lock();
        // Same key means revalidation of the entry already on top; no
        // history side effect.
        if history.location().key != job.location.key {
            match job.history_action {
                HistoryAction::Push => history.push(job.location.clone()),
                HistoryAction::Replace => history.replace(job.location.clone()),
                HistoryAction::Pop => {}
            }
        }
    }

    let mut fetchers = inner.state.fetchers.clone();
    let mut deferred_removals: Vec<String> = Vec::new();
    // A parked completion whose key has been re-fetched since is obsolete;
    // the newer call publishes its own terminal state.
    let mut updates: Vec<(String, Option<Fetcher>)> = inner
        .pending_fetcher_completions
        .drain()
        .filter(|(key, _)| !shared.fetch_controllers.contains_key(key))
        .map(|(key, value)| (key, Some(Fetcher::idle(Some(value)))))
        .collect();
    updates.extend(payload.fetcher_updates);
    for (key, update) in updates {
        match update {
            Some(fetcher) => {
                if inner.pending_deletes.remove(&key) {
                    // Publish the terminal state, then drop on the next
                    // snapshot.
                    fetchers.insert(key.clone(), fetcher);
                    deferred_removals.push(key.clone());
                    inner.fetch_records.remove(&key);
                } else {
                    fetchers.insert(key, fetcher);
                }
            }
            None => {
                inner.pending_deletes.remove(&key);
                inner.fetch_records.remove(&key);
                fetchers.remove(&key);
            }
        }
    }

    let action_data = match payload.action_data {
        Some(data) => Some(data),
        None if job.preserve_action_data => inner.state.action_data.clone(),
        None => None,
    };
    let next = RouterState {
        location: job.location.clone(),
        history_action: job.history_action,
        matches: payload.matches,
        initialized: true,
        navigation: Navigation::Idle,
        revalidation: RevalidationState::Idle,
        loader_data: payload.loader_data,
        action_data,
        errors: payload.errors,
        fetchers,
    };
    info!(
        path = %next.location.to_path(),
        errors = next.errors.as_ref().map(|e| e.len()).unwrap_or(0),
        "navigation committed"
    );
    shared.publish(&mut inner, next);

    if !deferred_removals.is_empty() {
        let mut next = (*inner.state).clone();
        for key in deferred_removals {
            next.fetchers.remove(&key);
        }
        shared.publish(&mut inner, next);
    }
}
