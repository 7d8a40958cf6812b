//! Shared utilities for router integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Notify};

use data_router::data::{DataFunctionArgs, DataFunctionResult, DataFunctionValue};
use data_router::{MemoryHistory, Route, Router, RouterConfig, RouterInit, RouterState};

pub const WAIT: Duration = Duration::from_secs(2);

/// Install the test tracing subscriber once per process. Scope output with
/// `RUST_LOG`, e.g. `RUST_LOG=data_router=debug`.
fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

/// Wait until the published state satisfies `pred`, returning the first
/// snapshot that does.
pub async fn wait_for<F>(rx: &mut watch::Receiver<Arc<RouterState>>, pred: F) -> Arc<RouterState>
where
    F: Fn(&RouterState) -> bool,
{
    let outcome = tokio::time::timeout(WAIT, async {
        loop {
            let state = rx.borrow_and_update().clone();
            if pred(&state) {
                return state;
            }
            if rx.changed().await.is_err() {
                panic!("router state channel closed");
            }
        }
    })
    .await;
    match outcome {
        Ok(state) => state,
        Err(_) => panic!("timed out waiting for router state"),
    }
}

/// Wait for an initialized router with no navigation or revalidation in
/// flight.
pub async fn wait_idle(rx: &mut watch::Receiver<Arc<RouterState>>) -> Arc<RouterState> {
    wait_for(rx, |s| {
        s.initialized && s.navigation.is_idle() && s.revalidation.is_idle()
    })
    .await
}

/// Build and initialize a router over `routes` with history seeded at
/// `initial`. Does not wait for the initial load to settle.
pub fn start(routes: Vec<Route>, initial: &str) -> (Router, watch::Receiver<Arc<RouterState>>) {
    start_with_config(routes, initial, RouterConfig::default())
}

pub fn start_with_config(
    routes: Vec<Route>,
    initial: &str,
    config: RouterConfig,
) -> (Router, watch::Receiver<Arc<RouterState>>) {
    init_tracing();
    let mut init = RouterInit::new(routes);
    init.history = Box::new(MemoryHistory::new(initial));
    init.config = config;
    let router = Router::new(init).expect("router construction failed");
    router.initialize();
    let rx = router.subscribe();
    (router, rx)
}

/// [`start`] plus waiting for the initial load to settle.
pub async fn boot(routes: Vec<Route>, initial: &str) -> (Router, watch::Receiver<Arc<RouterState>>) {
    let (router, mut rx) = start(routes, initial);
    wait_idle(&mut rx).await;
    (router, rx)
}

type Release = oneshot::Sender<DataFunctionResult>;

/// A data function whose calls park until the test feeds them a settlement.
///
/// Calls queue in arrival order; [`Controlled::release`] settles the oldest
/// call still alive, skipping slots whose call the engine cancelled. Use
/// [`Controlled::wait_aborted`] to order a release after a cancellation.
#[derive(Clone, Default)]
pub struct Controlled {
    calls: Arc<AtomicU32>,
    aborted: Arc<AtomicU32>,
    parked: Arc<Mutex<VecDeque<Release>>>,
    arrived: Arc<Notify>,
}

/// Counts a call as aborted when its future is dropped before settling.
struct AbortGuard {
    settled: bool,
    aborted: Arc<AtomicU32>,
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Controlled {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times the handler has been entered.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls the engine dropped before they settled.
    pub fn aborted(&self) -> u32 {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Calls parked and not yet released.
    pub fn parked(&self) -> usize {
        self.parked.lock().len()
    }

    /// The data function backed by this controller.
    pub fn handler(
        &self,
    ) -> impl Fn(DataFunctionArgs) -> BoxFuture<'static, DataFunctionResult> + Send + Sync + 'static
    {
        let this = self.clone();
        move |_args: DataFunctionArgs| {
            let this = this.clone();
            Box::pin(async move {
                this.calls.fetch_add(1, Ordering::SeqCst);
                let mut guard = AbortGuard {
                    settled: false,
                    aborted: this.aborted.clone(),
                };
                let (tx, rx) = oneshot::channel();
                this.parked.lock().push_back(tx);
                this.arrived.notify_waiters();
                let result = match rx.await {
                    Ok(result) => result,
                    // Test dropped its end; settle with a null.
                    Err(_) => Ok(DataFunctionValue::Json(Value::Null)),
                };
                guard.settled = true;
                result
            })
        }
    }

    /// Settle the oldest live parked call with `result`, waiting for one
    /// to arrive if none is parked yet. Slots whose call was cancelled are
    /// skipped, so a release always lands on a call that can still settle.
    pub async fn release(&self, result: DataFunctionResult) {
        let mut slot = Some(result);
        let fed = tokio::time::timeout(WAIT, async {
            loop {
                let notified = self.arrived.notified();
                let next = self.parked.lock().pop_front();
                match next {
                    Some(tx) => match tx.send(slot.take().unwrap()) {
                        Ok(()) => return,
                        // Call was cancelled; try the next slot.
                        Err(returned) => slot = Some(returned),
                    },
                    None => notified.await,
                }
            }
        })
        .await;
        if fed.is_err() {
            panic!("timed out waiting for a parked data function call");
        }
    }

    pub async fn release_json(&self, value: Value) {
        self.release(Ok(DataFunctionValue::Json(value))).await;
    }

    /// Wait until the handler has been entered at least `n` times.
    pub async fn wait_calls(&self, n: u32) {
        let seen = tokio::time::timeout(WAIT, async {
            while self.calls() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        if seen.is_err() {
            panic!(
                "timed out waiting for {n} calls, saw {}",
                self.calls()
            );
        }
    }

    /// Wait until at least `n` calls have been dropped unsettled. Used to
    /// pin down cancellation before releasing a follow-up call.
    pub async fn wait_aborted(&self, n: u32) {
        let seen = tokio::time::timeout(WAIT, async {
            while self.aborted() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        if seen.is_err() {
            panic!(
                "timed out waiting for {n} aborted calls, saw {}",
                self.aborted()
            );
        }
    }
}

/// A loader settling immediately with a clone of `value`.
pub fn json_loader(
    value: Value,
) -> impl Fn(DataFunctionArgs) -> BoxFuture<'static, DataFunctionResult> + Send + Sync + 'static {
    move |_args| {
        let value = value.clone();
        Box::pin(async move { Ok(DataFunctionValue::Json(value)) })
    }
}

/// [`json_loader`] that also counts its calls.
pub fn counting_loader(
    calls: Arc<AtomicU32>,
    value: Value,
) -> impl Fn(DataFunctionArgs) -> BoxFuture<'static, DataFunctionResult> + Send + Sync + 'static {
    move |_args| {
        calls.fetch_add(1, Ordering::SeqCst);
        let value = value.clone();
        Box::pin(async move { Ok(DataFunctionValue::Json(value)) })
    }
}

pub fn counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

pub fn count(calls: &Arc<AtomicU32>) -> u32 {
    calls.load(Ordering::SeqCst)
}
