//! Lazy route modules: load a route's implementation on first use.
//!
//! Resolution is single-flight per route. Concurrent navigations targeting
//! the same unresolved route share one in-flight future, and the resolved
//! module is patched into the route's slots exactly once. A failed
//! resolution resets the route so a later visit retries.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::warn;

use crate::data::{data_fn, DataFunction, DataFunctionArgs, DataFunctionResult};
use crate::engine::revalidation::{RevalidateArgs, ShouldRevalidateFunction};
use crate::error::RouteError;

use super::RouteRecord;

/// The portion of a route definition a lazy module may supply.
#[derive(Clone, Default)]
pub struct LazyRoute {
    pub loader: Option<DataFunction>,
    pub action: Option<DataFunction>,
    pub has_error_boundary: Option<bool>,
    pub should_revalidate: Option<ShouldRevalidateFunction>,
}

impl LazyRoute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loader<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(DataFunctionArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DataFunctionResult> + Send + 'static,
    {
        self.loader = Some(data_fn(f));
        self
    }

    pub fn action<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(DataFunctionArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DataFunctionResult> + Send + 'static,
    {
        self.action = Some(data_fn(f));
        self
    }

    pub fn error_boundary(mut self, flag: bool) -> Self {
        self.has_error_boundary = Some(flag);
        self
    }

    pub fn should_revalidate<F>(mut self, f: F) -> Self
    where
        F: Fn(&RevalidateArgs<'_>) -> bool + Send + Sync + 'static,
    {
        self.should_revalidate = Some(Arc::new(f));
        self
    }
}

pub(crate) type LazyFunction =
    Arc<dyn Fn() -> BoxFuture<'static, Result<LazyRoute, RouteError>> + Send + Sync>;

type SharedResolution = Shared<BoxFuture<'static, Result<LazyRoute, RouteError>>>;

/// Resolution state of a route's lazy module.
pub(crate) enum LazyState {
    /// No lazy module declared.
    None,
    /// Declared, not yet requested.
    Idle(LazyFunction),
    /// Resolution running; later callers share the future.
    InFlight {
        f: LazyFunction,
        fut: SharedResolution,
    },
    /// Module patched in.
    Done,
}

impl LazyState {
    pub fn from_definition(f: Option<LazyFunction>) -> Self {
        match f {
            Some(f) => LazyState::Idle(f),
            None => LazyState::None,
        }
    }
}

impl RouteRecord {
    /// Whether this route still has an unresolved lazy module.
    pub fn is_lazy_pending(&self) -> bool {
        matches!(
            &*self.lazy.lock(),
            LazyState::Idle(_) | LazyState::InFlight { .. }
        )
    }

    /// Resolve the lazy module if one is pending, then patch its fields
    /// into the route. Returns the resolution error as this route's error.
    pub(crate) async fn resolve_lazy(&self) -> Result<(), RouteError> {
        let fut = {
            let mut lazy = self.lazy.lock();
            match &*lazy {
                LazyState::None | LazyState::Done => return Ok(()),
                LazyState::InFlight { fut, .. } => fut.clone(),
                LazyState::Idle(f) => {
                    let f = f.clone();
                    let fut = f().shared();
                    *lazy = LazyState::InFlight {
                        f,
                        fut: fut.clone(),
                    };
                    fut
                }
            }
        };
        match fut.await {
            Ok(module) => {
                self.apply_lazy(module);
                Ok(())
            }
            Err(err) => {
                // Reset so a later visit can retry.
                let mut lazy = self.lazy.lock();
                if let LazyState::InFlight { f, .. } = &*lazy {
                    let f = f.clone();
                    *lazy = LazyState::Idle(f);
                }
                Err(err)
            }
        }
    }

    /// One-time patch. Statically defined fields win over the module's.
    fn apply_lazy(&self, module: LazyRoute) {
        let mut lazy = self.lazy.lock();
        if matches!(&*lazy, LazyState::Done) {
            return;
        }
        let mut slots = self.slots.write();
        if let Some(loader) = module.loader {
            if slots.loader.is_some() {
                warn!(route = %self.id, field = "loader", "static field shadows lazy module");
            } else {
                slots.loader = Some(loader);
            }
        }
        if let Some(action) = module.action {
            if slots.action.is_some() {
                warn!(route = %self.id, field = "action", "static field shadows lazy module");
            } else {
                slots.action = Some(action);
            }
        }
        if let Some(should_revalidate) = module.should_revalidate {
            if slots.should_revalidate.is_some() {
                warn!(route = %self.id, field = "should_revalidate", "static field shadows lazy module");
            } else {
                slots.should_revalidate = Some(should_revalidate);
            }
        }
        if let Some(flag) = module.has_error_boundary {
            if slots.has_error_boundary {
                warn!(route = %self.id, field = "error_boundary", "static field shadows lazy module");
            } else {
                slots.has_error_boundary = flag;
            }
        }
        *lazy = LazyState::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataFunctionValue;
    use crate::route::{Route, RouteTree};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lazy_tree(calls: Arc<AtomicUsize>) -> RouteTree {
        RouteTree::new(vec![Route::new("/").id("root").lazy(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(LazyRoute::new()
                    .loader(|_| async { Ok(DataFunctionValue::json(json!("lazy"))) })
                    .error_boundary(true))
            }
        })])
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolution_patches_slots() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tree = lazy_tree(calls.clone());
        let route = tree.get("root").unwrap();
        assert!(!route.has_loader());
        route.resolve_lazy().await.unwrap();
        assert!(route.has_loader());
        assert!(route.has_error_boundary());
        assert!(!route.is_lazy_pending());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolution_is_single_flight() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tree = lazy_tree(calls.clone());
        let route = tree.get("root").unwrap().clone();
        let other = route.clone();
        let (a, b) = tokio::join!(route.resolve_lazy(), other.resolve_lazy());
        a.unwrap();
        b.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_static_loader_shadows_lazy() {
        let tree = RouteTree::new(vec![Route::new("/")
            .id("root")
            .loader(|_| async { Ok(DataFunctionValue::json(json!("static"))) })
            .lazy(|| async {
                Ok(LazyRoute::new().loader(|_| async { Ok(DataFunctionValue::json(json!("lazy"))) }))
            })])
        .unwrap();
        let route = tree.get("root").unwrap();
        route.resolve_lazy().await.unwrap();
        let loader = route.loader().unwrap();
        let args = crate::data::DataFunctionArgs {
            request: crate::data::submission::loader_request(
                &crate::history::Location::from_path("/"),
            )
            .unwrap(),
            params: Default::default(),
            signal: Default::default(),
            context: None,
        };
        match loader(args).await.unwrap() {
            DataFunctionValue::Json(v) => assert_eq!(v, json!("static")),
            _ => panic!("expected json"),
        }
    }

    #[tokio::test]
    async fn test_failed_resolution_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tree = RouteTree::new(vec![Route::new("/").id("root").lazy(move || {
            let calls = counter.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RouteError::message("module load failed"))
                } else {
                    Ok(LazyRoute::new())
                }
            }
        })])
        .unwrap();
        let route = tree.get("root").unwrap();
        assert!(route.resolve_lazy().await.is_err());
        assert!(route.is_lazy_pending());
        route.resolve_lazy().await.unwrap();
        assert!(!route.is_lazy_pending());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
