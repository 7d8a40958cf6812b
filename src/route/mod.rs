//! Route definitions, the built route tree and match records.
//!
//! # Responsibilities
//! - Public `Route` builder: paths, index/pathless markers, data functions
//! - Build the immutable route tree, assigning tree-positional ids where
//!   the caller gave none
//! - Hold per-route mutable slots (loader, action, flags) behind a lock so
//!   lazy resolution can fill them in after construction
//!
//! # Design Decisions
//! - Records are `Arc`-shared between the tree, matches and state
//!   snapshots. Identity comparisons use the route id, never pointer
//!   equality.
//! - Slot reads clone the `Arc`'d function out of the lock; no lock is ever
//!   held while a data function runs.

pub mod lazy;
pub mod matcher;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::data::{data_fn, DataFunction, DataFunctionArgs, DataFunctionResult, Params};
use crate::engine::revalidation::{RevalidateArgs, ShouldRevalidateFunction};
use crate::error::BuildError;
use crate::path::has_index_param;

use lazy::{LazyFunction, LazyState};

/// A route definition, assembled by the caller and handed to the router.
pub struct Route {
    id: Option<String>,
    path: Option<String>,
    index: bool,
    loader: Option<DataFunction>,
    action: Option<DataFunction>,
    has_error_boundary: bool,
    should_revalidate: Option<ShouldRevalidateFunction>,
    lazy: Option<LazyFunction>,
    children: Vec<Route>,
}

impl Route {
    /// A route matching `path` relative to its parent.
    pub fn new(path: impl Into<String>) -> Self {
        Self::empty(Some(path.into()), false)
    }

    /// An index route: renders at its parent's exact path.
    pub fn index() -> Self {
        Self::empty(None, true)
    }

    /// A pathless route: contributes data functions and boundaries without
    /// consuming URL segments.
    pub fn pathless() -> Self {
        Self::empty(None, false)
    }

    fn empty(path: Option<String>, index: bool) -> Self {
        Route {
            id: None,
            path,
            index,
            loader: None,
            action: None,
            has_error_boundary: false,
            should_revalidate: None,
            lazy: None,
            children: Vec::new(),
        }
    }

    /// Explicit route id. Defaults to the route's tree position.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn loader<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(DataFunctionArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = DataFunctionResult> + Send + 'static,
    {
        self.loader = Some(data_fn(f));
        self
    }

    pub fn action<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(DataFunctionArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = DataFunctionResult> + Send + 'static,
    {
        self.action = Some(data_fn(f));
        self
    }

    /// Mark this route as an error boundary: failures below it commit here.
    pub fn error_boundary(mut self) -> Self {
        self.has_error_boundary = true;
        self
    }

    /// Install a revalidation opt-out predicate.
    pub fn should_revalidate<F>(mut self, f: F) -> Self
    where
        F: Fn(&RevalidateArgs<'_>) -> bool + Send + Sync + 'static,
    {
        self.should_revalidate = Some(Arc::new(f));
        self
    }

    /// Defer this route's implementation to a module resolved on first use.
    pub fn lazy<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<lazy::LazyRoute, crate::error::RouteError>>
            + Send
            + 'static,
    {
        use futures_util::future::FutureExt;
        self.lazy = Some(Arc::new(move || f().boxed()));
        self
    }

    pub fn child(mut self, route: Route) -> Self {
        self.children.push(route);
        self
    }

    pub fn children(mut self, routes: Vec<Route>) -> Self {
        self.children.extend(routes);
        self
    }
}

/// Mutable per-route slots, filled by the definition and later by lazy
/// resolution.
pub(crate) struct RouteSlots {
    pub loader: Option<DataFunction>,
    pub action: Option<DataFunction>,
    pub has_error_boundary: bool,
    pub should_revalidate: Option<ShouldRevalidateFunction>,
}

/// A built route: immutable shape plus lockable slots.
pub struct RouteRecord {
    pub id: String,
    pub path: Option<String>,
    pub index: bool,
    children: Vec<Arc<RouteRecord>>,
    pub(crate) slots: RwLock<RouteSlots>,
    pub(crate) lazy: Mutex<LazyState>,
}

impl RouteRecord {
    pub fn children(&self) -> &[Arc<RouteRecord>] {
        &self.children
    }

    pub fn has_loader(&self) -> bool {
        self.slots.read().loader.is_some()
    }

    pub fn has_action(&self) -> bool {
        self.slots.read().action.is_some()
    }

    pub fn has_error_boundary(&self) -> bool {
        self.slots.read().has_error_boundary
    }

    pub(crate) fn loader(&self) -> Option<DataFunction> {
        self.slots.read().loader.clone()
    }

    pub(crate) fn action(&self) -> Option<DataFunction> {
        self.slots.read().action.clone()
    }

    pub(crate) fn should_revalidate_fn(&self) -> Option<ShouldRevalidateFunction> {
        self.slots.read().should_revalidate.clone()
    }
}

impl fmt::Debug for RouteRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteRecord")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("index", &self.index)
            .field("children", &self.children.len())
            .finish()
    }
}

/// The immutable tree of built routes plus an id lookup table.
pub struct RouteTree {
    roots: Vec<Arc<RouteRecord>>,
    manifest: HashMap<String, Arc<RouteRecord>>,
}

impl RouteTree {
    pub(crate) fn new(routes: Vec<Route>) -> Result<Self, BuildError> {
        if routes.is_empty() {
            return Err(BuildError::EmptyRoutes);
        }
        let mut manifest = HashMap::new();
        let mut roots = Vec::with_capacity(routes.len());
        for (idx, route) in routes.into_iter().enumerate() {
            roots.push(build_record(route, &mut vec![idx], &mut manifest)?);
        }
        Ok(RouteTree { roots, manifest })
    }

    pub fn roots(&self) -> &[Arc<RouteRecord>] {
        &self.roots
    }

    pub fn get(&self, id: &str) -> Option<&Arc<RouteRecord>> {
        self.manifest.get(id)
    }

    pub fn len(&self) -> usize {
        self.manifest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.is_empty()
    }
}

impl fmt::Debug for RouteTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTree")
            .field("routes", &self.manifest.len())
            .finish()
    }
}

fn build_record(
    route: Route,
    position: &mut Vec<usize>,
    manifest: &mut HashMap<String, Arc<RouteRecord>>,
) -> Result<Arc<RouteRecord>, BuildError> {
    if route.index && !route.children.is_empty() {
        let id = describe_position(position, &route.id);
        return Err(BuildError::IndexRouteWithChildren(id));
    }
    let id = route
        .id
        .unwrap_or_else(|| describe_position(position, &None));

    let mut children = Vec::with_capacity(route.children.len());
    for (idx, child) in route.children.into_iter().enumerate() {
        position.push(idx);
        children.push(build_record(child, position, manifest)?);
        position.pop();
    }

    let record = Arc::new(RouteRecord {
        id: id.clone(),
        path: route.path,
        index: route.index,
        children,
        slots: RwLock::new(RouteSlots {
            loader: route.loader,
            action: route.action,
            has_error_boundary: route.has_error_boundary,
            should_revalidate: route.should_revalidate,
        }),
        lazy: Mutex::new(LazyState::from_definition(route.lazy)),
    });
    if manifest.insert(id.clone(), record.clone()).is_some() {
        return Err(BuildError::DuplicateRouteId(id));
    }
    Ok(record)
}

fn describe_position(position: &[usize], explicit: &Option<String>) -> String {
    match explicit {
        Some(id) => id.clone(),
        None => position
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join("-"),
    }
}

/// One route's slice of a matched URL.
#[derive(Clone)]
pub struct RouteMatch {
    pub route: Arc<RouteRecord>,
    /// Params accumulated from the root down to this route.
    pub params: Params,
    /// Portion of the URL matched through this route.
    pub pathname: String,
    /// `pathname` minus any trailing splat portion, the base child paths
    /// resolve against.
    pub pathname_base: String,
}

impl fmt::Debug for RouteMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteMatch")
            .field("route", &self.route.id)
            .field("pathname", &self.pathname)
            .field("params", &self.params)
            .finish()
    }
}

/// The match a submission targets: the index child when the search carries
/// a bare `index` param, otherwise the deepest path-contributing match.
pub(crate) fn target_match<'a>(matches: &'a [RouteMatch], search: &str) -> &'a RouteMatch {
    if let Some(last) = matches.last() {
        if last.route.index && has_index_param(search) {
            return last;
        }
    }
    matches
        .iter()
        .rev()
        .find(|m| m.route.path.as_deref().is_some_and(|p| !p.is_empty()))
        .unwrap_or(&matches[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_ids() {
        let tree = RouteTree::new(vec![Route::new("/")
            .child(Route::index())
            .child(Route::new("tasks").child(Route::new(":id")))])
        .unwrap();
        assert!(tree.get("0").is_some());
        assert!(tree.get("0-0").is_some());
        assert!(tree.get("0-1").is_some());
        assert!(tree.get("0-1-0").is_some());
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_explicit_id_wins() {
        let tree = RouteTree::new(vec![Route::new("/").id("root").child(Route::index())]).unwrap();
        assert!(tree.get("root").is_some());
        assert!(tree.get("root").unwrap().children()[0].index);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = RouteTree::new(vec![
            Route::new("/a").id("dup"),
            Route::new("/b").id("dup"),
        ]);
        assert!(matches!(result, Err(BuildError::DuplicateRouteId(id)) if id == "dup"));
    }

    #[test]
    fn test_empty_routes_rejected() {
        assert!(matches!(RouteTree::new(vec![]), Err(BuildError::EmptyRoutes)));
    }

    #[test]
    fn test_index_route_with_children_rejected() {
        let result = RouteTree::new(vec![Route::index().child(Route::new("x"))]);
        assert!(matches!(result, Err(BuildError::IndexRouteWithChildren(_))));
    }

    #[test]
    fn test_lazy_marks_pending() {
        let tree = RouteTree::new(vec![Route::new("/")
            .lazy(|| async { Ok(lazy::LazyRoute::new()) })])
        .unwrap();
        assert!(tree.get("0").unwrap().is_lazy_pending());
    }
}
