//! The loader/action contract and settlement normalization.
//!
//! # Responsibilities
//! - Define the argument and result shapes for loaders and actions
//! - Normalize raw settlements (values, responses, thrown errors) into the
//!   engine's internal outcome shape
//! - Detect redirect responses, including the forced-revalidation header
//!
//! # Design Decisions
//! - Raw `http::Response` payloads are unwrapped once here. Committed state
//!   only ever holds plain JSON values and cloneable errors.
//! - Abort is an outcome, not an error. Callers drop aborted settlements
//!   without touching state.

pub mod deferred;
pub mod submission;

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::RouteError;

pub use deferred::{DeferredBuilder, DeferredData, DeferredFieldState};
pub use submission::{FormEncType, FormMethod, Submission, SubmissionBody, SubmissionSpec};

/// Dynamic segment values extracted by the matcher, keyed by segment name.
pub type Params = HashMap<String, String>;

/// Opaque per-call context threaded through to data functions (SSR only).
pub type RequestContext = Arc<dyn Any + Send + Sync>;

/// Response header that forces full revalidation after a redirect when the
/// router's redirect-revalidation flag is on.
pub const REVALIDATE_HEADER: &str = "x-router-revalidate";

/// Everything a loader or action receives for one call.
pub struct DataFunctionArgs {
    /// The request for this call: GET at the target URL for loaders, the
    /// submission method and encoded body for actions.
    pub request: Request<Bytes>,
    pub params: Params,
    /// Cancelled when the call is superseded. Long data functions should
    /// poll this and bail early.
    pub signal: CancellationToken,
    /// Host-supplied context, present only under the static handler.
    pub context: Option<RequestContext>,
}

/// Successful settlement of a data function.
pub enum DataFunctionValue {
    /// A plain JSON value, stored as-is.
    Json(Value),
    /// A raw response. Redirect statuses steer the navigation; anything
    /// else is unwrapped into data by content type.
    Response(Response<Bytes>),
    /// Mixed ready/streaming data. Only meaningful from loaders.
    Deferred(DeferredData),
}

impl DataFunctionValue {
    pub fn json(value: impl Into<Value>) -> Self {
        DataFunctionValue::Json(value.into())
    }
}

/// Failed settlement of a data function.
#[derive(Debug)]
pub enum DataFunctionError {
    /// A thrown response; 3xx with a location steers navigation, anything
    /// else lands in an error boundary with its status preserved.
    Response(Response<Bytes>),
    /// An arbitrary error value.
    Value(Value),
    /// A plain message.
    Message(String),
}

impl From<Value> for DataFunctionError {
    fn from(value: Value) -> Self {
        DataFunctionError::Value(value)
    }
}

impl From<String> for DataFunctionError {
    fn from(message: String) -> Self {
        DataFunctionError::Message(message)
    }
}

impl From<&str> for DataFunctionError {
    fn from(message: &str) -> Self {
        DataFunctionError::Message(message.to_string())
    }
}

pub type DataFunctionResult = Result<DataFunctionValue, DataFunctionError>;

/// A loader or action. Both share one shape; the engine decides which slot
/// a function fills.
pub type DataFunction =
    Arc<dyn Fn(DataFunctionArgs) -> BoxFuture<'static, DataFunctionResult> + Send + Sync>;

pub type LoaderFunction = DataFunction;
pub type ActionFunction = DataFunction;

/// Wrap an async closure as a [`DataFunction`].
pub fn data_fn<F, Fut>(f: F) -> DataFunction
where
    F: Fn(DataFunctionArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DataFunctionResult> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

/// A 302 redirect settlement pointing at `location`.
pub fn redirect(location: &str) -> DataFunctionValue {
    redirect_with_status(location, StatusCode::FOUND)
}

/// A redirect settlement with an explicit 3xx status.
pub fn redirect_with_status(location: &str, status: StatusCode) -> DataFunctionValue {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::try_from(location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    DataFunctionValue::Response(response)
}

/// Committed loader data for one route.
#[derive(Clone, Debug)]
pub enum RouteData {
    Json(Value),
    Deferred(Arc<DeferredData>),
}

impl RouteData {
    /// The plain JSON value, if this is not deferred data.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            RouteData::Json(value) => Some(value),
            RouteData::Deferred(_) => None,
        }
    }

    pub fn as_deferred(&self) -> Option<&Arc<DeferredData>> {
        match self {
            RouteData::Json(_) => None,
            RouteData::Deferred(deferred) => Some(deferred),
        }
    }
}

impl PartialEq<Value> for RouteData {
    fn eq(&self, other: &Value) -> bool {
        self.as_json() == Some(other)
    }
}

impl From<Value> for RouteData {
    fn from(value: Value) -> Self {
        RouteData::Json(value)
    }
}

/// Redirect extracted from a data-function settlement.
#[derive(Debug, Clone)]
pub(crate) struct RedirectResult {
    pub location: String,
    pub status: StatusCode,
    /// Set when the response carried the forced-revalidation header.
    pub revalidate: bool,
    pub headers: HeaderMap,
}

/// One data-function settlement, normalized.
#[derive(Debug)]
pub(crate) enum CallOutcome {
    Success {
        value: RouteData,
        status: Option<StatusCode>,
        headers: Option<HeaderMap>,
    },
    Redirect(RedirectResult),
    Failure {
        error: RouteError,
        status: Option<StatusCode>,
        headers: Option<HeaderMap>,
    },
    Aborted,
}

impl CallOutcome {
    pub fn failure(error: RouteError) -> Self {
        CallOutcome::Failure {
            error,
            status: None,
            headers: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CallOutcome::Success { .. } => "success",
            CallOutcome::Redirect(_) => "redirect",
            CallOutcome::Failure { .. } => "failure",
            CallOutcome::Aborted => "aborted",
        }
    }
}

/// Normalize a raw settlement into a [`CallOutcome`].
pub(crate) fn normalize_result(result: DataFunctionResult) -> CallOutcome {
    match result {
        Ok(DataFunctionValue::Json(value)) => CallOutcome::Success {
            value: RouteData::Json(value),
            status: None,
            headers: None,
        },
        Ok(DataFunctionValue::Deferred(deferred)) => CallOutcome::Success {
            value: RouteData::Deferred(Arc::new(deferred)),
            status: None,
            headers: None,
        },
        Ok(DataFunctionValue::Response(response)) => {
            if let Some(redirect) = extract_redirect(&response) {
                return CallOutcome::Redirect(redirect);
            }
            let status = response.status();
            let headers = response.headers().clone();
            match unwrap_body(response) {
                Ok(value) => CallOutcome::Success {
                    value: RouteData::Json(value),
                    status: Some(status),
                    headers: Some(headers),
                },
                Err(error) => CallOutcome::Failure {
                    error,
                    status: Some(status),
                    headers: Some(headers),
                },
            }
        }
        Err(DataFunctionError::Response(response)) => {
            // Thrown redirects steer navigation the same as returned ones.
            if let Some(redirect) = extract_redirect(&response) {
                return CallOutcome::Redirect(redirect);
            }
            let status = response.status();
            let headers = response.headers().clone();
            let data = unwrap_body(response).unwrap_or_else(|err| Value::String(err.to_string()));
            CallOutcome::Failure {
                error: RouteError::ErrorResponse {
                    status: status.as_u16(),
                    status_text: status.canonical_reason().unwrap_or("").to_string(),
                    data,
                    internal: false,
                },
                status: Some(status),
                headers: Some(headers),
            }
        }
        Err(DataFunctionError::Value(value)) => CallOutcome::failure(RouteError::Value(value)),
        Err(DataFunctionError::Message(message)) => {
            CallOutcome::failure(RouteError::Message(message))
        }
    }
}

fn extract_redirect(response: &Response<Bytes>) -> Option<RedirectResult> {
    if !response.status().is_redirection() {
        return None;
    }
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())?;
    Some(RedirectResult {
        location: location.to_string(),
        status: response.status(),
        revalidate: response.headers().contains_key(REVALIDATE_HEADER),
        headers: response.headers().clone(),
    })
}

/// Unwrap a response body into a JSON value by content type. JSON bodies
/// parse; everything else becomes a string. Empty bodies become null.
fn unwrap_body(response: Response<Bytes>) -> Result<Value, RouteError> {
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);
    let body = response.into_body();
    if body.is_empty() {
        return Ok(Value::Null);
    }
    if is_json {
        serde_json::from_slice(&body)
            .map_err(|e| RouteError::message(format!("could not decode response body: {e}")))
    } else {
        Ok(Value::String(String::from_utf8_lossy(&body).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn json_response(status: StatusCode, body: Value) -> Response<Bytes> {
        let mut response = Response::new(Bytes::from(body.to_string()));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }

    #[test]
    fn test_json_value_passes_through() {
        let outcome = normalize_result(Ok(DataFunctionValue::json(json!({ "id": 1 }))));
        match outcome {
            CallOutcome::Success { value, status, .. } => {
                assert_eq!(value, json!({ "id": 1 }));
                assert_eq!(status, None);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_response_body_unwrapped_with_status() {
        let response = json_response(StatusCode::CREATED, json!({ "ok": true }));
        let outcome = normalize_result(Ok(DataFunctionValue::Response(response)));
        match outcome {
            CallOutcome::Success { value, status, .. } => {
                assert_eq!(value, json!({ "ok": true }));
                assert_eq!(status, Some(StatusCode::CREATED));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_returned_redirect_detected() {
        let outcome = normalize_result(Ok(redirect("/login")));
        match outcome {
            CallOutcome::Redirect(r) => {
                assert_eq!(r.location, "/login");
                assert_eq!(r.status, StatusCode::FOUND);
                assert!(!r.revalidate);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_thrown_redirect_detected() {
        let value = match redirect_with_status("/away", StatusCode::SEE_OTHER) {
            DataFunctionValue::Response(r) => r,
            _ => unreachable!(),
        };
        let outcome = normalize_result(Err(DataFunctionError::Response(value)));
        assert!(matches!(outcome, CallOutcome::Redirect(r) if r.status == StatusCode::SEE_OTHER));
    }

    #[test]
    fn test_revalidate_header_flags_redirect() {
        let mut response = match redirect("/next") {
            DataFunctionValue::Response(r) => r,
            _ => unreachable!(),
        };
        response
            .headers_mut()
            .insert(REVALIDATE_HEADER, HeaderValue::from_static("yes"));
        let outcome = normalize_result(Ok(DataFunctionValue::Response(response)));
        assert!(matches!(outcome, CallOutcome::Redirect(r) if r.revalidate));
    }

    #[test]
    fn test_thrown_response_preserves_status() {
        let response = json_response(StatusCode::UNAUTHORIZED, json!("denied"));
        let outcome = normalize_result(Err(DataFunctionError::Response(response)));
        match outcome {
            CallOutcome::Failure { error, status, .. } => {
                assert_eq!(status, Some(StatusCode::UNAUTHORIZED));
                assert_eq!(error.status(), Some(StatusCode::UNAUTHORIZED));
                assert!(!error.is_internal());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_text_body_becomes_string() {
        let response = Response::new(Bytes::from_static(b"plain text"));
        let outcome = normalize_result(Ok(DataFunctionValue::Response(response)));
        match outcome {
            CallOutcome::Success { value, .. } => assert_eq!(value, json!("plain text")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_redirect_without_location_is_data() {
        let mut response = Response::new(Bytes::new());
        *response.status_mut() = StatusCode::FOUND;
        let outcome = normalize_result(Ok(DataFunctionValue::Response(response)));
        assert!(matches!(outcome, CallOutcome::Success { .. }));
    }
}
