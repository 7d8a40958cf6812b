//! Stateless request/response querying over a route tree.
//!
//! # Responsibilities
//! - Replay the matching, action, loader and error-bubbling logic of the
//!   navigation pipeline against a single `Request`, with no history stack
//! - Aggregate per-route results into a render context with an overall
//!   status code and per-phase headers
//! - Pass redirect responses through untouched for the HTTP layer
//!
//! # Design Decisions
//! - Handlers run through the same call path as navigations, so lazy
//!   resolution, cancellation and metrics behave identically.
//! - `query` is total over handler failures: errors land in the context.
//!   Only caller-initiated cancellation surfaces as `Err`.
//! - `query_route` hands back the raw outcome, responses untouched; thrown
//!   errors propagate to the caller unbucketed.

use std::collections::HashMap;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::data::submission::{loader_request, REQUEST_ORIGIN};
use crate::data::{
    normalize_result, CallOutcome, DataFunctionArgs, DataFunctionValue, RedirectResult,
    RequestContext, RouteData,
};
use crate::engine::navigation::{call_route_handler, CallKind};
use crate::engine::state::{RouteDataMap, RouteErrorMap};
use crate::engine::resolve_location;
use crate::error::{find_nearest_boundary, BuildError, RouteError};
use crate::history::Location;
use crate::route::matcher::{RouteMatcher, SegmentMatcher};
use crate::route::{target_match, Route, RouteMatch, RouteTree};

/// Construction options for [`StaticHandler`].
#[derive(Clone, Debug)]
pub struct StaticHandlerConfig {
    /// Path prefix stripped before matching, `"/"` for none.
    pub basename: String,
}

impl Default for StaticHandlerConfig {
    fn default() -> Self {
        StaticHandlerConfig {
            basename: "/".to_string(),
        }
    }
}

/// Per-query options.
#[derive(Default)]
pub struct QueryOptions {
    /// Opaque value handed to every data function this query invokes.
    pub context: Option<RequestContext>,
    /// Cancels the query; in-flight handlers observe it as their signal.
    pub signal: Option<CancellationToken>,
}

/// Everything a server renderer needs for one request.
#[derive(Debug)]
pub struct StaticHandlerContext {
    pub location: Location,
    pub matches: Vec<RouteMatch>,
    pub loader_data: RouteDataMap,
    pub action_data: Option<HashMap<String, Value>>,
    pub errors: Option<RouteErrorMap>,
    pub status_code: StatusCode,
    pub loader_headers: HashMap<String, HeaderMap>,
    pub action_headers: HashMap<String, HeaderMap>,
}

/// Result of [`StaticHandler::query`].
#[derive(Debug)]
pub enum QueryOutcome {
    /// Render this context.
    Context(StaticHandlerContext),
    /// A redirect to relay as-is.
    Response(Response<Bytes>),
}

/// Result of [`StaticHandler::query_route`].
#[derive(Debug)]
pub enum QueryRouteOutcome {
    /// The handler's decoded data.
    Data(Value),
    /// The handler's raw response (redirects included), untouched.
    Response(Response<Bytes>),
}

/// The server-side twin of the router: same tree, same handlers, no state.
pub struct StaticHandler {
    tree: RouteTree,
    matcher: Box<dyn RouteMatcher>,
    config: StaticHandlerConfig,
}

impl std::fmt::Debug for StaticHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticHandler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StaticHandler {
    pub fn new(routes: Vec<Route>, config: StaticHandlerConfig) -> Result<Self, BuildError> {
        if !config.basename.starts_with('/') {
            return Err(BuildError::InvalidBasename(config.basename));
        }
        Ok(StaticHandler {
            tree: RouteTree::new(routes)?,
            matcher: Box::new(SegmentMatcher),
            config,
        })
    }

    /// Replace the segment matcher with a custom strategy.
    pub fn with_matcher(mut self, matcher: Box<dyn RouteMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Run the full request lifecycle: action for mutation methods, then
    /// loaders, aggregated into a render context. `Err` only on
    /// cancellation through [`QueryOptions::signal`].
    pub async fn query(
        &self,
        request: Request<Bytes>,
        opts: QueryOptions,
    ) -> Result<QueryOutcome, RouteError> {
        let location = location_of(&request);
        let method = request.method().clone();
        let signal = opts.signal.clone().unwrap_or_default();

        let resolved = resolve_location(
            &self.tree,
            self.matcher.as_ref(),
            &self.config.basename,
            &location.pathname,
        );
        let matches = resolved.matches;
        if let Some((boundary, err)) = resolved.not_found {
            debug!(path = %location.to_path(), "static query matched nothing");
            return Ok(QueryOutcome::Context(error_context(
                location,
                matches,
                boundary,
                err,
                StatusCode::NOT_FOUND,
            )));
        }

        let phase = match classify(&method) {
            MethodPhase::Load => None,
            MethodPhase::Submit => Some(target_match(&matches, &location.search).clone()),
            MethodPhase::Invalid => {
                warn!(method = %method, path = %location.to_path(), "static query with unsupported method");
                let target = target_match(&matches, &location.search);
                let boundary = find_nearest_boundary(&matches, Some(&target.route.id))
                    .route
                    .id
                    .clone();
                return Ok(QueryOutcome::Context(error_context(
                    location,
                    matches,
                    boundary,
                    RouteError::invalid_method(method.as_str()),
                    StatusCode::METHOD_NOT_ALLOWED,
                )));
            }
        };

        // Action phase for mutation methods.
        let mut pending_error: Option<PendingError> = None;
        let mut action_data: Option<HashMap<String, Value>> = None;
        let mut action_status: Option<StatusCode> = None;
        let mut action_headers: HashMap<String, HeaderMap> = HashMap::new();
        if let Some(target) = phase {
            let target_index = matches
                .iter()
                .position(|m| m.route.id == target.route.id)
                .unwrap_or(matches.len() - 1);
            let request = absolutized(request)?;
            let outcome = call_route_handler(
                CallKind::Action,
                &target.route,
                request,
                target.params.clone(),
                signal.clone(),
                opts.context.clone(),
            )
            .await;
            let boundary = find_nearest_boundary(&matches, Some(&target.route.id))
                .route
                .id
                .clone();
            match outcome {
                None => {
                    pending_error = Some(PendingError {
                        boundary,
                        index: target_index,
                        error: RouteError::no_handler(
                            method.as_str(),
                            &location.pathname,
                            &target.route.id,
                        ),
                        status: Some(StatusCode::METHOD_NOT_ALLOWED),
                    });
                }
                Some(CallOutcome::Aborted) => {
                    return Err(aborted_query(&method, &location));
                }
                Some(CallOutcome::Redirect(redirect)) => {
                    return Ok(QueryOutcome::Response(redirect_response(&redirect)));
                }
                Some(CallOutcome::Failure { error, status, .. }) => {
                    pending_error = Some(PendingError {
                        boundary,
                        index: target_index,
                        error,
                        status,
                    });
                }
                Some(CallOutcome::Success {
                    value,
                    status,
                    headers,
                }) => match value {
                    // Streaming data has no meaning for a mutation.
                    RouteData::Deferred(deferred) => {
                        deferred.cancel();
                        pending_error = Some(PendingError {
                            boundary,
                            index: target_index,
                            error: RouteError::bad_submission(
                                "actions cannot return deferred data",
                            ),
                            status: Some(StatusCode::BAD_REQUEST),
                        });
                    }
                    RouteData::Json(value) => {
                        action_data = Some(HashMap::from([(target.route.id.clone(), value)]));
                        action_status = status;
                        if let Some(headers) = headers {
                            action_headers.insert(target.route.id.clone(), headers);
                        }
                    }
                },
            }
        }

        // Loader phase; after an action error only routes above the
        // boundary run.
        let boundary_matches = match &pending_error {
            Some(pending) => match matches.iter().position(|m| m.route.id == pending.boundary) {
                Some(idx) => &matches[..idx],
                None => &matches[..],
            },
            None => &matches[..],
        };
        let loader_futs = boundary_matches.iter().enumerate().map(|(index, m)| {
            let signal = signal.clone();
            let context = opts.context.clone();
            let location = location.clone();
            let route = m.route.clone();
            let params = m.params.clone();
            async move {
                let outcome = match loader_request(&location) {
                    Ok(request) => {
                        call_route_handler(CallKind::Loader, &route, request, params, signal, context)
                            .await
                    }
                    Err(err) => Some(CallOutcome::failure(err)),
                };
                (index, route.id.clone(), outcome)
            }
        });
        let results = futures_util::future::join_all(loader_futs).await;

        // Deepest redirect wins.
        if let Some(redirect) = results.iter().rev().find_map(|(_, _, o)| match o {
            Some(CallOutcome::Redirect(r)) => Some(r.clone()),
            _ => None,
        }) {
            return Ok(QueryOutcome::Response(redirect_response(&redirect)));
        }

        let mut new_data: RouteDataMap = HashMap::new();
        let mut loader_headers: HashMap<String, HeaderMap> = HashMap::new();
        let mut loader_errors: Vec<PendingError> = Vec::new();
        let mut success_statuses: Vec<(usize, StatusCode)> = Vec::new();
        for (index, route_id, outcome) in results {
            match outcome {
                None => {}
                Some(CallOutcome::Aborted) => return Err(aborted_query(&method, &location)),
                Some(CallOutcome::Success {
                    value,
                    status,
                    headers,
                }) => {
                    new_data.insert(route_id.clone(), value);
                    if let Some(headers) = headers {
                        loader_headers.insert(route_id.clone(), headers);
                    }
                    if let Some(status) = status {
                        success_statuses.push((index, status));
                    }
                }
                Some(CallOutcome::Failure { error, status, .. }) => {
                    let boundary = find_nearest_boundary(&matches, Some(&route_id))
                        .route
                        .id
                        .clone();
                    loader_errors.push(PendingError {
                        boundary,
                        index,
                        error,
                        status,
                    });
                }
                Some(CallOutcome::Redirect(_)) => unreachable!("redirects handled above"),
            }
        }
        loader_errors.sort_by_key(|e| e.index);

        // Status: shallowest error wins; otherwise the deepest success
        // status, the action's taking precedence.
        let status_code = {
            let error_candidate = loader_errors
                .iter()
                .map(|e| (e.index, e.status))
                .chain(pending_error.iter().map(|e| (e.index, e.status)))
                .min_by_key(|(index, _)| *index);
            match error_candidate {
                Some((_, status)) => status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                None => action_status
                    .or_else(|| {
                        success_statuses
                            .iter()
                            .max_by_key(|(index, _)| *index)
                            .map(|(_, status)| *status)
                    })
                    .unwrap_or(StatusCode::OK),
            }
        };

        // Fold errors: the action error seeds its bucket, loader errors
        // follow root-to-leaf with first-write-wins.
        let mut errors: RouteErrorMap = HashMap::new();
        if let Some(pending) = pending_error {
            errors.insert(pending.boundary, pending.error);
        }
        for failed in loader_errors {
            errors.entry(failed.boundary).or_insert(failed.error);
        }

        // Data at and below the shallowest error bucket is dropped.
        let mut loader_data: RouteDataMap = HashMap::new();
        for m in &matches {
            if errors.contains_key(&m.route.id) {
                break;
            }
            if let Some(value) = new_data.remove(&m.route.id) {
                loader_data.insert(m.route.id.clone(), value);
            }
        }

        Ok(QueryOutcome::Context(StaticHandlerContext {
            location,
            matches,
            loader_data,
            action_data,
            errors: if errors.is_empty() { None } else { Some(errors) },
            status_code,
            loader_headers,
            action_headers,
        }))
    }

    /// Run exactly one handler — the deepest match's, or the one named by
    /// `route_id` — and return its raw outcome. Thrown errors propagate.
    pub async fn query_route(
        &self,
        request: Request<Bytes>,
        route_id: Option<&str>,
        opts: QueryOptions,
    ) -> Result<QueryRouteOutcome, RouteError> {
        let location = location_of(&request);
        let method = request.method().clone();
        let signal = opts.signal.clone().unwrap_or_default();

        let resolved = resolve_location(
            &self.tree,
            self.matcher.as_ref(),
            &self.config.basename,
            &location.pathname,
        );
        if let Some((_, err)) = resolved.not_found {
            return Err(err);
        }
        let matches = resolved.matches;
        let target = match route_id {
            Some(id) => matches
                .iter()
                .find(|m| m.route.id == id)
                .cloned()
                .ok_or_else(|| RouteError::no_route_id(id, &location.pathname))?,
            None => target_match(&matches, &location.search).clone(),
        };

        let kind = match classify(&method) {
            MethodPhase::Load => CallKind::Loader,
            MethodPhase::Submit => CallKind::Action,
            MethodPhase::Invalid => return Err(RouteError::invalid_method(method.as_str())),
        };
        target.route.resolve_lazy().await?;
        let handler = match kind {
            CallKind::Loader => target.route.loader(),
            CallKind::Action => target.route.action(),
        };
        let Some(handler) = handler else {
            return Err(RouteError::no_handler(
                method.as_str(),
                &location.pathname,
                &target.route.id,
            ));
        };

        let request = absolutized(request)?;
        let args = DataFunctionArgs {
            request,
            params: target.params.clone(),
            signal: signal.child_token(),
            context: opts.context,
        };
        let fut = handler(args);
        let result = tokio::select! {
            _ = signal.cancelled() => return Err(aborted_query(&method, &location)),
            result = fut => result,
        };
        match result {
            Ok(DataFunctionValue::Json(value)) => Ok(QueryRouteOutcome::Data(value)),
            Ok(DataFunctionValue::Response(response)) => {
                Ok(QueryRouteOutcome::Response(response))
            }
            Ok(DataFunctionValue::Deferred(deferred)) => {
                if matches!(kind, CallKind::Action) {
                    deferred.cancel();
                    return Err(RouteError::bad_submission(
                        "actions cannot return deferred data",
                    ));
                }
                // No streaming consumer here; settle it fully.
                let resolved = tokio::select! {
                    _ = signal.cancelled() => return Err(aborted_query(&method, &location)),
                    resolved = deferred.resolve_all() => resolved,
                };
                resolved.map(QueryRouteOutcome::Data)
            }
            Err(error) => match normalize_result(Err(error)) {
                CallOutcome::Redirect(redirect) => {
                    Ok(QueryRouteOutcome::Response(redirect_response(&redirect)))
                }
                CallOutcome::Failure { error, .. } => Err(error),
                _ => Err(RouteError::message("unexpected handler outcome")),
            },
        }
    }
}

struct PendingError {
    boundary: String,
    index: usize,
    error: RouteError,
    status: Option<StatusCode>,
}

fn aborted_query(method: &Method, location: &Location) -> RouteError {
    debug!(method = %method, path = %location.to_path(), "static query aborted");
    RouteError::message(format!(
        "query aborted: {method} {}",
        location.to_path()
    ))
}

enum MethodPhase {
    Load,
    Submit,
    Invalid,
}

fn classify(method: &Method) -> MethodPhase {
    match *method {
        Method::GET | Method::HEAD => MethodPhase::Load,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE => MethodPhase::Submit,
        _ => MethodPhase::Invalid,
    }
}

fn location_of(request: &Request<Bytes>) -> Location {
    match request.uri().path_and_query() {
        Some(pq) => Location::from_path(pq.as_str()),
        None => Location::from_path(request.uri().path()),
    }
}

/// Handlers parse their request URL; relative request targets are rebased
/// onto the engine origin.
fn absolutized(request: Request<Bytes>) -> Result<Request<Bytes>, RouteError> {
    if request.uri().scheme().is_some() {
        return Ok(request);
    }
    let (mut parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    parts.uri = format!("{REQUEST_ORIGIN}{path}")
        .parse()
        .map_err(|_| RouteError::bad_submission("request target is not a valid URL"))?;
    Ok(Request::from_parts(parts, body))
}

fn redirect_response(redirect: &RedirectResult) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = redirect.status;
    *response.headers_mut() = redirect.headers.clone();
    response
}

fn error_context(
    location: Location,
    matches: Vec<RouteMatch>,
    boundary: String,
    error: RouteError,
    status_code: StatusCode,
) -> StaticHandlerContext {
    StaticHandlerContext {
        location,
        matches,
        loader_data: HashMap::new(),
        action_data: None,
        errors: Some(HashMap::from([(boundary, error)])),
        status_code,
        loader_headers: HashMap::new(),
        action_headers: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::redirect;
    use serde_json::json;

    fn demo_routes() -> Vec<Route> {
        vec![Route::new("/")
            .id("root")
            .error_boundary()
            .loader(|_args| async { Ok(DataFunctionValue::Json(json!({"who": "root"}))) })
            .child(
                Route::new("tasks")
                    .id("tasks")
                    .loader(|_args| async { Ok(DataFunctionValue::Json(json!(["a", "b"]))) })
                    .action(|_args| async { Ok(DataFunctionValue::Json(json!({"saved": true}))) }),
            )]
    }

    fn get(path: &str) -> Request<Bytes> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_query_runs_all_loaders() {
        let handler = StaticHandler::new(demo_routes(), StaticHandlerConfig::default()).unwrap();
        let outcome = handler
            .query(get("/tasks"), QueryOptions::default())
            .await
            .unwrap();
        let context = match outcome {
            QueryOutcome::Context(context) => context,
            QueryOutcome::Response(_) => panic!("expected context"),
        };
        assert_eq!(context.status_code, StatusCode::OK);
        assert_eq!(context.loader_data.len(), 2);
        assert_eq!(
            context.loader_data.get("tasks").and_then(|d| d.as_json()),
            Some(&json!(["a", "b"]))
        );
        assert!(context.errors.is_none());
    }

    #[tokio::test]
    async fn test_query_not_found_context() {
        let handler = StaticHandler::new(demo_routes(), StaticHandlerConfig::default()).unwrap();
        let outcome = handler
            .query(get("/nope"), QueryOptions::default())
            .await
            .unwrap();
        let context = match outcome {
            QueryOutcome::Context(context) => context,
            QueryOutcome::Response(_) => panic!("expected context"),
        };
        assert_eq!(context.status_code, StatusCode::NOT_FOUND);
        let errors = context.errors.unwrap();
        assert!(errors.get("root").unwrap().is_internal());
    }

    #[tokio::test]
    async fn test_query_action_then_loaders() {
        let handler = StaticHandler::new(demo_routes(), StaticHandlerConfig::default()).unwrap();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/tasks")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Bytes::from_static(b"{\"title\":\"new\"}"))
            .unwrap();
        let outcome = handler
            .query(request, QueryOptions::default())
            .await
            .unwrap();
        let context = match outcome {
            QueryOutcome::Context(context) => context,
            QueryOutcome::Response(_) => panic!("expected context"),
        };
        let action_data = context.action_data.unwrap();
        assert_eq!(action_data.get("tasks"), Some(&json!({"saved": true})));
        assert_eq!(context.loader_data.len(), 2);
    }

    #[tokio::test]
    async fn test_query_redirect_passthrough() {
        let routes = vec![Route::new("/")
            .id("root")
            .child(Route::new("old").id("old").loader(|_args| async {
                Ok(redirect("/new"))
            }))];
        let handler = StaticHandler::new(routes, StaticHandlerConfig::default()).unwrap();
        let outcome = handler
            .query(get("/old"), QueryOptions::default())
            .await
            .unwrap();
        let response = match outcome {
            QueryOutcome::Response(response) => response,
            QueryOutcome::Context(_) => panic!("expected response"),
        };
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(http::header::LOCATION).unwrap(),
            "/new"
        );
    }

    #[tokio::test]
    async fn test_query_route_returns_single_result() {
        let handler = StaticHandler::new(demo_routes(), StaticHandlerConfig::default()).unwrap();
        let outcome = handler
            .query_route(get("/tasks"), None, QueryOptions::default())
            .await
            .unwrap();
        match outcome {
            QueryRouteOutcome::Data(value) => assert_eq!(value, json!(["a", "b"])),
            QueryRouteOutcome::Response(_) => panic!("expected data"),
        }
    }

    #[tokio::test]
    async fn test_query_route_by_id() {
        let handler = StaticHandler::new(demo_routes(), StaticHandlerConfig::default()).unwrap();
        let outcome = handler
            .query_route(get("/tasks"), Some("root"), QueryOptions::default())
            .await
            .unwrap();
        match outcome {
            QueryRouteOutcome::Data(value) => assert_eq!(value, json!({"who": "root"})),
            QueryRouteOutcome::Response(_) => panic!("expected data"),
        }
    }

    #[tokio::test]
    async fn test_query_route_unknown_id() {
        let handler = StaticHandler::new(demo_routes(), StaticHandlerConfig::default()).unwrap();
        let err = handler
            .query_route(get("/tasks"), Some("ghost"), QueryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn test_query_route_propagates_thrown_error() {
        let routes = vec![Route::new("/").id("root").child(
            Route::new("boom").id("boom").loader(|_args| async {
                Err(crate::data::DataFunctionError::Message("Kaboom!".into()))
            }),
        )];
        let handler = StaticHandler::new(routes, StaticHandlerConfig::default()).unwrap();
        let err = handler
            .query_route(get("/boom"), None, QueryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::Message("Kaboom!".into()));
    }

    #[tokio::test]
    async fn test_query_error_statuses() {
        let routes = vec![Route::new("/")
            .id("root")
            .error_boundary()
            .child(Route::new("teapot").id("teapot").loader(|_args| async {
                let response = Response::builder()
                    .status(StatusCode::IM_A_TEAPOT)
                    .body(Bytes::from_static(b"short and stout"))
                    .unwrap();
                Err(crate::data::DataFunctionError::Response(response))
            }))];
        let handler = StaticHandler::new(routes, StaticHandlerConfig::default()).unwrap();
        let outcome = handler
            .query(get("/teapot"), QueryOptions::default())
            .await
            .unwrap();
        let context = match outcome {
            QueryOutcome::Context(context) => context,
            QueryOutcome::Response(_) => panic!("expected context"),
        };
        assert_eq!(context.status_code, StatusCode::IM_A_TEAPOT);
        let errors = context.errors.unwrap();
        assert!(errors.contains_key("root"));
    }

    #[test]
    fn test_invalid_basename_rejected() {
        let err = StaticHandler::new(
            demo_routes(),
            StaticHandlerConfig {
                basename: "app".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::InvalidBasename(_)));
    }

    #[test]
    fn test_classify_methods() {
        assert!(matches!(classify(&Method::GET), MethodPhase::Load));
        assert!(matches!(classify(&Method::HEAD), MethodPhase::Load));
        assert!(matches!(classify(&Method::POST), MethodPhase::Submit));
        assert!(matches!(classify(&Method::DELETE), MethodPhase::Submit));
        assert!(matches!(classify(&Method::TRACE), MethodPhase::Invalid));
    }
}
