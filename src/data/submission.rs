//! Submission normalization and request encoding.
//!
//! # Responsibilities
//! - Normalize caller-supplied submissions into the form stored on state
//! - Encode submission bodies into `http::Request` payloads for actions
//! - Convert GET submissions into a search string instead of a body
//!
//! # Design Decisions
//! - Encoding happens once, up front. A submission that cannot be encoded
//!   becomes a 400 before any data function runs.
//! - Request URLs are absolute against a fixed local authority so loaders
//!   can parse them with any standards-compliant URL parser.

use bytes::Bytes;
use http::{header, Method, Request};
use serde_json::Value;

use crate::error::RouteError;
use crate::history::Location;
use crate::path::has_index_param;

/// Base authority used to absolutize request URLs handed to data functions.
pub(crate) const REQUEST_ORIGIN: &str = "http://localhost";

/// HTTP method of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl FormMethod {
    /// Whether this method routes through an action instead of loaders.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, FormMethod::Get)
    }

    pub fn as_http(&self) -> Method {
        match self {
            FormMethod::Get => Method::GET,
            FormMethod::Post => Method::POST,
            FormMethod::Put => Method::PUT,
            FormMethod::Patch => Method::PATCH,
            FormMethod::Delete => Method::DELETE,
        }
    }

    /// Lowercase spelling, the historical default exposure.
    pub fn lowercase(&self) -> &'static str {
        match self {
            FormMethod::Get => "get",
            FormMethod::Post => "post",
            FormMethod::Put => "put",
            FormMethod::Patch => "patch",
            FormMethod::Delete => "delete",
        }
    }

    /// Uppercase spelling, used when method-casing normalization is on.
    pub fn uppercase(&self) -> &'static str {
        match self {
            FormMethod::Get => "GET",
            FormMethod::Post => "POST",
            FormMethod::Put => "PUT",
            FormMethod::Patch => "PATCH",
            FormMethod::Delete => "DELETE",
        }
    }
}

/// Declared encoding of a submission body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormEncType {
    #[default]
    UrlEncoded,
    Multipart,
    Json,
    Text,
}

impl FormEncType {
    pub fn content_type(&self) -> &'static str {
        match self {
            FormEncType::UrlEncoded => "application/x-www-form-urlencoded;charset=UTF-8",
            FormEncType::Multipart => "multipart/form-data",
            FormEncType::Json => "application/json",
            FormEncType::Text => "text/plain;charset=UTF-8",
        }
    }
}

/// Body shapes a caller can submit.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionBody {
    /// Ordered key/value pairs, the form-data shape.
    Form(Vec<(String, String)>),
    /// A JSON document.
    Json(Value),
    /// Plain text.
    Text(String),
    /// Already-encoded bytes, passed through untouched.
    Raw(Bytes),
}

/// A caller-supplied submission, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionSpec {
    pub method: FormMethod,
    pub enc_type: FormEncType,
    pub body: SubmissionBody,
}

impl SubmissionSpec {
    /// A url-encoded form submission, the common case.
    pub fn form(method: FormMethod, pairs: Vec<(String, String)>) -> Self {
        SubmissionSpec {
            method,
            enc_type: FormEncType::UrlEncoded,
            body: SubmissionBody::Form(pairs),
        }
    }

    /// A JSON submission.
    pub fn json(method: FormMethod, value: Value) -> Self {
        SubmissionSpec {
            method,
            enc_type: FormEncType::Json,
            body: SubmissionBody::Json(value),
        }
    }
}

/// A normalized submission as exposed on navigation and fetcher state.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub method: FormMethod,
    pub enc_type: FormEncType,
    pub body: SubmissionBody,
    normalized_method: bool,
}

impl Submission {
    pub(crate) fn new(spec: SubmissionSpec, normalize_method: bool) -> Self {
        Submission {
            method: spec.method,
            enc_type: spec.enc_type,
            body: spec.body,
            normalized_method: normalize_method,
        }
    }

    /// Method spelling as exposed to subscribers; casing follows the
    /// router's method-normalization flag.
    pub fn method_str(&self) -> &'static str {
        if self.normalized_method {
            self.method.uppercase()
        } else {
            self.method.lowercase()
        }
    }
}

/// Encode a submission body per its declared encoding.
///
/// `Raw` passes through under any encoding; otherwise the body shape must
/// agree with the encoding or the submission is rejected.
pub(crate) fn encode_body(
    enc_type: FormEncType,
    body: &SubmissionBody,
) -> Result<Bytes, RouteError> {
    if let SubmissionBody::Raw(bytes) = body {
        return Ok(bytes.clone());
    }
    match (enc_type, body) {
        (FormEncType::UrlEncoded, SubmissionBody::Form(pairs)) => {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (k, v) in pairs {
                serializer.append_pair(k, v);
            }
            Ok(Bytes::from(serializer.finish()))
        }
        (FormEncType::Multipart, SubmissionBody::Form(pairs)) => {
            Ok(encode_multipart(pairs).0)
        }
        (FormEncType::Json, SubmissionBody::Json(value)) => serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| RouteError::bad_submission(format!("could not serialize body: {e}"))),
        (FormEncType::Text, SubmissionBody::Text(text)) => Ok(Bytes::from(text.clone())),
        (enc, body) => Err(RouteError::bad_submission(format!(
            "submission body {} cannot be encoded as {}",
            body_shape(body),
            enc.content_type(),
        ))),
    }
}

fn body_shape(body: &SubmissionBody) -> &'static str {
    match body {
        SubmissionBody::Form(_) => "form pairs",
        SubmissionBody::Json(_) => "json",
        SubmissionBody::Text(_) => "text",
        SubmissionBody::Raw(_) => "raw bytes",
    }
}

fn encode_multipart(pairs: &[(String, String)]) -> (Bytes, String) {
    let boundary = format!("----router-{}", uuid::Uuid::new_v4().simple());
    let mut out = String::new();
    for (k, v) in pairs {
        out.push_str("--");
        out.push_str(&boundary);
        out.push_str("\r\n");
        out.push_str(&format!("Content-Disposition: form-data; name={k:?}\r\n\r\n"));
        out.push_str(v);
        out.push_str("\r\n");
    }
    out.push_str("--");
    out.push_str(&boundary);
    out.push_str("--\r\n");
    (Bytes::from(out), boundary)
}

/// Rewrite a location's search from a GET submission's form pairs.
///
/// The previous search is replaced wholesale, except a bare `index` param,
/// which survives because it selects the submission target rather than
/// carrying data.
pub(crate) fn apply_get_submission(
    location: &mut Location,
    body: &SubmissionBody,
) -> Result<(), RouteError> {
    let pairs = match body {
        SubmissionBody::Form(pairs) => pairs,
        other => {
            return Err(RouteError::bad_submission(format!(
                "GET submissions require form pairs, got {}",
                body_shape(other),
            )))
        }
    };
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    if has_index_param(&location.search) {
        serializer.append_key_only("index");
    }
    for (k, v) in pairs {
        serializer.append_pair(k, v);
    }
    let search = serializer.finish();
    location.search = if search.is_empty() {
        String::new()
    } else {
        format!("?{search}")
    };
    Ok(())
}

/// Build the GET request handed to loaders for a location.
pub(crate) fn loader_request(location: &Location) -> Result<Request<Bytes>, RouteError> {
    Request::builder()
        .method(Method::GET)
        .uri(request_url(location))
        .body(Bytes::new())
        .map_err(|e| RouteError::bad_submission(format!("could not build request: {e}")))
}

/// Build the request handed to an action, with the submission body encoded.
pub(crate) fn action_request(
    location: &Location,
    submission: &Submission,
) -> Result<Request<Bytes>, RouteError> {
    // Multipart is encoded here directly so the content type can carry the
    // generated boundary.
    if let (FormEncType::Multipart, SubmissionBody::Form(pairs)) =
        (&submission.enc_type, &submission.body)
    {
        let (encoded, boundary) = encode_multipart(pairs);
        return Request::builder()
            .method(submission.method.as_http())
            .uri(request_url(location))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(encoded)
            .map_err(|e| RouteError::bad_submission(format!("could not build request: {e}")));
    }
    let body = encode_body(submission.enc_type, &submission.body)?;
    Request::builder()
        .method(submission.method.as_http())
        .uri(request_url(location))
        .header(header::CONTENT_TYPE, submission.enc_type.content_type())
        .body(body)
        .map_err(|e| RouteError::bad_submission(format!("could not build request: {e}")))
}

fn request_url(location: &Location) -> String {
    format!("{REQUEST_ORIGIN}{}{}", location.pathname, location.search)
}
