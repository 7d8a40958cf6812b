//! Navigation and data-loading engine with stateless server-side querying.

pub mod data;
pub mod engine;
pub mod error;
pub mod history;
pub mod route;
pub mod ssr;

mod observability;
mod path;

pub use data::{
    redirect, redirect_with_status, DataFunctionArgs, DataFunctionError, DataFunctionValue,
    DeferredBuilder, DeferredData, FormEncType, FormMethod, SubmissionBody, SubmissionSpec,
};
pub use engine::revalidation::RevalidateArgs;
pub use engine::{
    FetchOptions, Fetcher, FetcherState, HydrationState, NavigateOptions, Navigation,
    RevalidationState, Router, RouterConfig, RouterInit, RouterState,
};
pub use error::{BuildError, RouteError};
pub use history::{History, HistoryAction, Location, MemoryHistory};
pub use route::lazy::LazyRoute;
pub use route::matcher::{RouteMatcher, SegmentMatcher};
pub use route::{Route, RouteMatch};
pub use ssr::{
    QueryOptions, QueryOutcome, QueryRouteOutcome, StaticHandler, StaticHandlerConfig,
    StaticHandlerContext,
};
