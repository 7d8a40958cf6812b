//! The navigation controller: state machine, concurrency bookkeeping and
//! the public `Router` handle.
//!
//! # Responsibilities
//! - Own the authoritative `RouterState` and publish snapshots to
//!   subscribers through a watch channel
//! - Arbitrate concurrent work with a generation clock plus cancellation
//!   tokens: the newest operation wins, superseded settlements are dropped
//! - Route public calls (`navigate`, `revalidate`, `fetch`, `go`) into the
//!   pipelines in `navigation` and `fetch`
//!
//! # Design Decisions
//! - All mutable bookkeeping sits in one `EngineState` behind a mutex held
//!   only for synchronous sections, never across awaits.
//! - Pipelines run as spawned tasks; public calls return immediately and
//!   outcomes arrive through the state channel.
//! - Lock order is `inner` then `history`. The history listener defers its
//!   work through `tokio::spawn` because it fires under the history lock.

pub mod config;
pub mod revalidation;
pub mod state;

pub(crate) mod fetch;
pub(crate) mod navigation;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::data::{DeferredData, Submission, SubmissionSpec};
use crate::error::{find_nearest_boundary, BuildError, RouteError};
use crate::history::{History, HistoryAction, HistoryEvent, Location};
use crate::observability;
use crate::path::{join_paths, parse_path, strip_basename};
use crate::route::matcher::{RouteMatcher, SegmentMatcher};
use crate::route::{Route, RouteMatch, RouteTree};

pub use config::{HydrationState, RouterConfig};
pub use state::{
    Fetcher, FetcherState, Navigation, RevalidationState, RouteDataMap, RouteErrorMap, RouterState,
};

/// Construction input for [`Router::new`].
pub struct RouterInit {
    pub routes: Vec<Route>,
    pub history: Box<dyn History>,
    pub config: RouterConfig,
    /// Custom matching strategy; segment matching when `None`.
    pub matcher: Option<Box<dyn RouteMatcher>>,
}

impl RouterInit {
    /// Routes on a fresh in-memory history at `/`, default config.
    pub fn new(routes: Vec<Route>) -> Self {
        RouterInit {
            routes,
            history: Box::new(crate::history::MemoryHistory::new("/")),
            config: RouterConfig::default(),
            matcher: None,
        }
    }
}

/// Options for [`Router::navigate`].
#[derive(Default)]
pub struct NavigateOptions {
    /// Submit instead of plain load. GET submissions rewrite the search
    /// string; mutation methods run the target route's action first.
    pub submission: Option<SubmissionSpec>,
    /// Force replace (or push) instead of the derived default.
    pub replace: Option<bool>,
    /// Opaque state stored on the resulting location.
    pub state: Option<Value>,
}

/// Options for [`Router::fetch`].
#[derive(Default)]
pub struct FetchOptions {
    /// Submit through the target's action; plain load when `None`.
    pub submission: Option<SubmissionSpec>,
}

/// Monotonic operation stamp. Comparing stamps, not arrival order, is what
/// decides which settlement wins.
#[derive(Debug, Default)]
pub(crate) struct GenerationClock {
    next: AtomicU64,
}

impl GenerationClock {
    pub fn tick(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// The navigation currently in flight, if any.
pub(crate) struct PendingNavigation {
    pub generation: u64,
    pub token: CancellationToken,
    pub location: Location,
    pub history_action: HistoryAction,
    pub submission: Option<Submission>,
    /// Suppress intermediate Loading/Submitting publications (initial load
    /// and idle revalidation).
    pub quiet: bool,
    /// Result of an action phase that already settled, kept so a restart
    /// of this pass commits it instead of losing it.
    pub action_data: Option<HashMap<String, Value>>,
}

/// Registration of a fetcher load, making the fetcher eligible for
/// revalidation after future data commits.
#[derive(Clone, Debug)]
pub(crate) struct FetchRecord {
    pub generation: u64,
    pub route_id: String,
    pub href: String,
}

/// Cancellation handle for one in-flight fetcher call. The generation lets
/// settlement paths clean up only their own entry.
pub(crate) struct FetchController {
    pub generation: u64,
    pub token: CancellationToken,
}

/// All mutable engine bookkeeping.
pub(crate) struct EngineState {
    pub state: Arc<RouterState>,
    pub pending: Option<PendingNavigation>,
    /// Set by `revalidate()`, consumed by the next planning pass.
    pub revalidation_requested: bool,
    /// Fetcher-load registrations by key.
    pub fetch_records: HashMap<String, FetchRecord>,
    /// Fetchers deleted while busy under the persistence flag; removed
    /// once their terminal state has been published.
    pub pending_deletes: HashSet<String>,
    /// Routes whose streaming data was cancelled and must reload.
    pub cancelled_deferred_routes: HashSet<String>,
    /// Fetcher loads cancelled mid-flight and owed a rerun.
    pub cancelled_fetcher_loads: HashSet<String>,
    /// Live streaming data by owning route.
    pub active_deferreds: HashMap<String, Arc<DeferredData>>,
    /// Fetchers whose actions settled and go idle with this data at the
    /// next commit, once the revalidation pass they triggered lands.
    pub pending_fetcher_completions: HashMap<String, Value>,
}

pub(crate) struct RouterShared {
    pub tree: RouteTree,
    pub matcher: Box<dyn RouteMatcher>,
    pub history: Mutex<Box<dyn History>>,
    pub config: RouterConfig,
    pub clock: GenerationClock,
    pub inner: Mutex<EngineState>,
    pub state_tx: watch::Sender<Arc<RouterState>>,
    /// Cancellation handles for in-flight fetcher calls, keyed by fetcher.
    pub fetch_controllers: DashMap<String, FetchController>,
    pub disposed: AtomicBool,
}

/// Match resolution for a pathname, falling back to a synthetic root-level
/// 404 when nothing matches.
pub(crate) struct Resolved {
    pub matches: Vec<RouteMatch>,
    /// Boundary route id plus the 404 to commit there.
    pub not_found: Option<(String, RouteError)>,
}

/// Match `pathname` (basename included) against the tree, producing the
/// synthetic root-level 404 chain when nothing matches.
pub(crate) fn resolve_location(
    tree: &RouteTree,
    matcher: &dyn RouteMatcher,
    basename: &str,
    pathname: &str,
) -> Resolved {
    let not_found = || {
        let matches = vec![RouteMatch {
            route: tree.roots()[0].clone(),
            params: Default::default(),
            pathname: "/".to_string(),
            pathname_base: "/".to_string(),
        }];
        let boundary = find_nearest_boundary(&matches, None).route.id.clone();
        Resolved {
            matches,
            not_found: Some((boundary, RouteError::no_match(pathname))),
        }
    };
    let stripped = match strip_basename(pathname, basename) {
        Some(stripped) => stripped,
        None => return not_found(),
    };
    match matcher.match_routes(tree, &stripped) {
        Some(matches) => Resolved {
            matches,
            not_found: None,
        },
        None => not_found(),
    }
}

impl RouterShared {
    pub(crate) fn resolve_matches(&self, pathname: &str) -> Resolved {
        resolve_location(&self.tree, self.matcher.as_ref(), &self.config.basename, pathname)
    }

    /// Swap in a new snapshot and notify subscribers. Callers hold the
    /// inner lock.
    pub(crate) fn publish(&self, inner: &mut EngineState, next: RouterState) {
        let next = Arc::new(next);
        inner.state = next.clone();
        self.state_tx.send_replace(next);
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// The public handle. Cheap to clone; all clones drive the same state.
#[derive(Clone)]
pub struct Router {
    shared: Arc<RouterShared>,
}

impl Router {
    pub fn new(init: RouterInit) -> Result<Self, BuildError> {
        init.config.validate()?;
        let tree = RouteTree::new(init.routes)?;
        let matcher: Box<dyn RouteMatcher> = init
            .matcher
            .unwrap_or_else(|| Box::new(SegmentMatcher));
        let history = init.history;
        let location = history.location();
        let history_action = history.action();

        let (state_tx, _) = watch::channel(Arc::new(RouterState {
            location: location.clone(),
            history_action,
            matches: Vec::new(),
            initialized: false,
            navigation: Navigation::Idle,
            revalidation: RevalidationState::Idle,
            loader_data: HashMap::new(),
            action_data: None,
            errors: None,
            fetchers: HashMap::new(),
        }));

        let initial_state = state_tx.borrow().clone();
        let shared = Arc::new(RouterShared {
            tree,
            matcher,
            history: Mutex::new(history),
            config: init.config,
            clock: GenerationClock::default(),
            inner: Mutex::new(EngineState {
                state: initial_state,
                pending: None,
                revalidation_requested: false,
                fetch_records: HashMap::new(),
                pending_deletes: HashSet::new(),
                cancelled_deferred_routes: HashSet::new(),
                cancelled_fetcher_loads: HashSet::new(),
                active_deferreds: HashMap::new(),
                pending_fetcher_completions: HashMap::new(),
            }),
            state_tx,
            fetch_controllers: DashMap::new(),
            disposed: AtomicBool::new(false),
        });

        let resolved = shared.resolve_matches(&location.pathname);
        let initialized = initial_readiness(&resolved, shared.config.hydration.as_ref());
        let mut errors = resolved
            .not_found
            .map(|(id, err)| HashMap::from([(id, err)]));
        let mut loader_data: RouteDataMap = HashMap::new();
        let mut action_data = None;
        if let Some(hydration) = &shared.config.hydration {
            loader_data = hydration
                .loader_data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone().into()))
                .collect();
            action_data = hydration.action_data.clone();
            if let Some(hydrated_errors) = &hydration.errors {
                errors
                    .get_or_insert_with(HashMap::new)
                    .extend(hydrated_errors.clone());
            }
        }

        {
            let mut inner = shared.inner.lock();
            let initial = RouterState {
                location,
                history_action,
                matches: resolved.matches,
                initialized,
                navigation: Navigation::Idle,
                revalidation: RevalidationState::Idle,
                loader_data,
                action_data,
                errors,
                fetchers: HashMap::new(),
            };
            shared.publish(&mut inner, initial);
        }

        Ok(Router { shared })
    }

    /// Install the history listener and, unless hydration satisfied it,
    /// kick off the initial load. Must be called on a tokio runtime.
    pub fn initialize(&self) {
        let weak: Weak<RouterShared> = Arc::downgrade(&self.shared);
        self.shared
            .history
            .lock()
            .listen(Box::new(move |event: HistoryEvent| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                debug!(delta = event.delta, path = %event.location.to_path(), "history pop");
                // Fired under the history lock; navigation must start on a
                // fresh stack to respect lock order.
                tokio::spawn(async move {
                    navigation::start_navigation(
                        &shared,
                        navigation::NavigationRequest {
                            location: event.location,
                            history_action: HistoryAction::Pop,
                            submission: None,
                            pending_error: None,
                            quiet: false,
                            force_revalidate: false,
                            skip_action: false,
                            preserve_action_data: false,
                            action_data: None,
                        },
                    );
                });
            }));

        let state = self.state();
        if !state.initialized {
            navigation::start_navigation(
                &self.shared,
                navigation::NavigationRequest {
                    location: state.location.clone(),
                    history_action: state.history_action,
                    submission: None,
                    pending_error: None,
                    quiet: true,
                    force_revalidate: false,
                    skip_action: false,
                    preserve_action_data: false,
                    action_data: None,
                },
            );
        }
    }

    /// The current state snapshot.
    pub fn state(&self) -> Arc<RouterState> {
        self.shared.state_tx.borrow().clone()
    }

    /// Subscribe to state snapshots. The receiver sees every commit made
    /// while it is alive.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RouterState>> {
        self.shared.state_tx.subscribe()
    }

    /// Navigate to `to` (a path relative to the basename). Returns
    /// immediately; progress arrives through the state channel.
    pub fn navigate(&self, to: &str, opts: NavigateOptions) {
        if self.shared.is_disposed() {
            warn!(to, "navigate on disposed router ignored");
            return;
        }
        navigation::begin_navigation(&self.shared, to, opts);
    }

    /// Traverse the history stack. The resulting pop flows back through
    /// the history listener.
    pub fn go(&self, delta: isize) {
        if self.shared.is_disposed() {
            return;
        }
        self.shared.history.lock().go(delta);
    }

    /// Rerun loaders for the current location. Honors each route's
    /// revalidation predicate with the forced default.
    pub fn revalidate(&self) {
        if self.shared.is_disposed() {
            return;
        }
        navigation::start_revalidation(&self.shared);
    }

    /// Start (or restart) the fetcher under `key`, targeting `href`.
    /// `route_id` names the currently matched route that owns the fetcher:
    /// errors bubble through its ancestry, and results are discarded if it
    /// has left the matches by the time they land.
    pub fn fetch(&self, key: &str, route_id: &str, href: &str, opts: FetchOptions) {
        if self.shared.is_disposed() {
            warn!(key, "fetch on disposed router ignored");
            return;
        }
        fetch::start_fetch(&self.shared, key, route_id, href, opts);
    }

    /// The fetcher under `key`, or the idle sentinel if none exists.
    pub fn get_fetcher(&self, key: &str) -> Fetcher {
        self.state().fetcher(key)
    }

    /// Drop the fetcher under `key`. With fetcher persistence on, a busy
    /// fetcher survives until its in-flight work settles.
    pub fn delete_fetcher(&self, key: &str) {
        fetch::delete_fetcher(&self.shared, key);
    }

    /// Render `to` as an href, basename included.
    pub fn create_href(&self, to: &str) -> String {
        let parts = parse_path(to);
        let mut location = Location::from_path(&create_href_path(
            &self.shared.config.basename,
            &parts.pathname,
        ));
        location.search = parts.search;
        location.hash = parts.hash;
        self.shared.history.lock().create_href(&location)
    }

    /// Number of in-flight fetcher calls. Settles back to zero when all
    /// outstanding work completes or is cancelled.
    pub fn active_fetch_controllers(&self) -> usize {
        self.shared.fetch_controllers.len()
    }

    /// Tear down: cancel all in-flight work and stop listening to history.
    /// Subsequent calls on this router are ignored.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("router disposed");
        {
            let mut inner = self.shared.inner.lock();
            if let Some(pending) = inner.pending.take() {
                pending.token.cancel();
            }
            for deferred in inner.active_deferreds.values() {
                deferred.cancel();
            }
            inner.active_deferreds.clear();
            inner.fetch_records.clear();
            inner.pending_deletes.clear();
            inner.pending_fetcher_completions.clear();
        }
        for entry in self.shared.fetch_controllers.iter() {
            entry.value().token.cancel();
        }
        self.shared.fetch_controllers.clear();
        observability::record_fetch_controllers(0);
        self.shared.history.lock().unlisten();
    }
}

fn create_href_path(basename: &str, pathname: &str) -> String {
    if basename == "/" {
        pathname.to_string()
    } else {
        join_paths(basename, pathname)
    }
}

/// Whether construction alone leaves the router ready: nothing lazy in the
/// initial chain and every loader-bearing match covered by hydration data
/// or a hydrated error.
fn initial_readiness(resolved: &Resolved, hydration: Option<&HydrationState>) -> bool {
    if resolved.matches.iter().any(|m| m.route.is_lazy_pending()) {
        return false;
    }
    let missing: Vec<&str> = resolved
        .matches
        .iter()
        .filter(|m| m.route.has_loader())
        .map(|m| m.route.id.as_str())
        .filter(|id| {
            let hydrated_data = hydration.is_some_and(|h| h.loader_data.contains_key(*id));
            let hydrated_error = hydration
                .and_then(|h| h.errors.as_ref())
                .is_some_and(|e| e.contains_key(*id));
            !hydrated_data && !hydrated_error
        })
        .collect();
    if missing.is_empty() {
        return true;
    }
    if hydration.is_some() {
        warn!(routes = ?missing, "hydration data incomplete; running the initial load");
    }
    false
}
