//! Deferred loader data: a mix of ready values and still-settling fields.
//!
//! # Responsibilities
//! - Let a loader return some fields immediately and stream the rest in
//! - Track per-field settlement so consumers can render as data arrives
//! - Cancel in-flight fields when the owning route reloads or unloads
//!
//! # Design Decisions
//! - Pending fields are driven by spawned tasks at construction, so they
//!   make progress whether or not anyone is awaiting them. Construction
//!   therefore requires a runtime context, same as the data functions that
//!   build these.
//! - Field futures share their output (`Shared`), letting the engine, SSR
//!   handler and any subscriber await the same settlement independently.

use std::fmt;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::RouteError;

type FieldFuture = Shared<BoxFuture<'static, Result<Value, RouteError>>>;

/// Settlement state of a single deferred field.
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredFieldState {
    Pending,
    Resolved(Value),
    Rejected(RouteError),
}

#[derive(Clone)]
enum DeferredEntry {
    Ready(Value),
    Pending(FieldFuture),
}

/// Loader data with independently settling fields.
pub struct DeferredData {
    entries: Vec<(String, DeferredEntry)>,
    token: CancellationToken,
}

impl DeferredData {
    pub fn builder() -> DeferredBuilder {
        DeferredBuilder {
            entries: Vec::new(),
        }
    }

    /// Field names in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current settlement state of a field without waiting.
    pub fn get(&self, key: &str) -> Option<DeferredFieldState> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, e)| match e {
            DeferredEntry::Ready(value) => DeferredFieldState::Resolved(value.clone()),
            DeferredEntry::Pending(fut) => match fut.peek() {
                Some(Ok(value)) => DeferredFieldState::Resolved(value.clone()),
                Some(Err(err)) => DeferredFieldState::Rejected(err.clone()),
                None => DeferredFieldState::Pending,
            },
        })
    }

    /// Wait for one field to settle.
    pub async fn resolved_value(&self, key: &str) -> Option<Result<Value, RouteError>> {
        let entry = self.entries.iter().find(|(k, _)| k == key)?.1.clone();
        Some(match entry {
            DeferredEntry::Ready(value) => Ok(value),
            DeferredEntry::Pending(fut) => fut.await,
        })
    }

    /// Wait for every field and collapse into a plain JSON object. The
    /// first rejection wins.
    pub async fn resolve_all(&self) -> Result<Value, RouteError> {
        let mut out = Map::new();
        for (key, entry) in &self.entries {
            let value = match entry {
                DeferredEntry::Ready(value) => value.clone(),
                DeferredEntry::Pending(fut) => fut.clone().await?,
            };
            out.insert(key.clone(), value);
        }
        Ok(Value::Object(out))
    }

    /// Wait until every field has settled, rejections included.
    pub async fn settled(&self) {
        for (_, entry) in &self.entries {
            if let DeferredEntry::Pending(fut) = entry {
                let _ = fut.clone().await;
            }
        }
    }

    /// Whether every field has already settled.
    pub fn is_settled(&self) -> bool {
        self.entries.iter().all(|(_, e)| match e {
            DeferredEntry::Ready(_) => true,
            DeferredEntry::Pending(fut) => fut.peek().is_some(),
        })
    }

    /// Abort all still-pending fields. They settle as rejected.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether this data has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl fmt::Debug for DeferredData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, _) in &self.entries {
            match self.get(key) {
                Some(DeferredFieldState::Pending) => map.entry(&key, &"<pending>"),
                Some(state) => map.entry(&key, &state),
                None => map.entry(&key, &"<missing>"),
            };
        }
        map.finish()
    }
}

/// Accumulates deferred fields before spawning their drivers.
pub struct DeferredBuilder {
    entries: Vec<(String, Seed)>,
}

enum Seed {
    Ready(Value),
    Future(BoxFuture<'static, Result<Value, RouteError>>),
}

impl DeferredBuilder {
    /// A field whose value is already known.
    pub fn value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.push((key.into(), Seed::Ready(value.into())));
        self
    }

    /// A field that settles later. The future starts running at `build`.
    pub fn future<F>(mut self, key: impl Into<String>, fut: F) -> Self
    where
        F: std::future::Future<Output = Result<Value, RouteError>> + Send + 'static,
    {
        self.entries.push((key.into(), Seed::Future(fut.boxed())));
        self
    }

    /// Finalize, spawning a driver per pending field. Must run on a runtime.
    pub fn build(self) -> DeferredData {
        let token = CancellationToken::new();
        let entries = self
            .entries
            .into_iter()
            .map(|(key, seed)| {
                let entry = match seed {
                    Seed::Ready(value) => DeferredEntry::Ready(value),
                    Seed::Future(fut) => {
                        let cancel = token.clone();
                        let shared = async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    Err(RouteError::message("deferred data aborted"))
                                }
                                result = fut => result,
                            }
                        }
                        .boxed()
                        .shared();
                        tokio::spawn(shared.clone().map(|_| ()));
                        DeferredEntry::Pending(shared)
                    }
                };
                (key, entry)
            })
            .collect();
        DeferredData { entries, token }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ready_fields_settle_immediately() {
        let deferred = DeferredData::builder().value("count", json!(3)).build();
        assert!(deferred.is_settled());
        assert_eq!(
            deferred.get("count"),
            Some(DeferredFieldState::Resolved(json!(3)))
        );
    }

    #[tokio::test]
    async fn test_pending_field_settles_in_background() {
        let deferred = DeferredData::builder()
            .future("slow", async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!("done"))
            })
            .build();
        assert_eq!(deferred.get("slow"), Some(DeferredFieldState::Pending));
        deferred.settled().await;
        assert_eq!(
            deferred.get("slow"),
            Some(DeferredFieldState::Resolved(json!("done")))
        );
    }

    #[tokio::test]
    async fn test_cancel_rejects_pending_fields() {
        let deferred = DeferredData::builder()
            .future("never", std::future::pending())
            .build();
        deferred.cancel();
        deferred.settled().await;
        match deferred.get("never") {
            Some(DeferredFieldState::Rejected(_)) => {}
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_all_collapses_to_object() {
        let deferred = DeferredData::builder()
            .value("a", json!(1))
            .future("b", async { Ok(json!(2)) })
            .build();
        let value = deferred.resolve_all().await.unwrap();
        assert_eq!(value, json!({ "a": 1, "b": 2 }));
    }

    #[tokio::test]
    async fn test_resolve_all_surfaces_rejection() {
        let deferred = DeferredData::builder()
            .future("bad", async { Err(RouteError::message("nope")) })
            .build();
        assert!(deferred.resolve_all().await.is_err());
    }
}
