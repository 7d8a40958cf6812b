//! Static handler integration tests: request lifecycle against the route
//! tree with no client state, header/status aggregation and deferred data.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use data_router::{
    redirect_with_status, DataFunctionArgs, DataFunctionError, DataFunctionValue, DeferredData,
    LazyRoute, QueryOptions, QueryOutcome, QueryRouteOutcome, Route, StaticHandler,
    StaticHandlerConfig, StaticHandlerContext,
};

mod common;
use common::{count, counter, counting_loader, json_loader, Controlled};

fn get(path: &str) -> Request<Bytes> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Bytes::new())
        .unwrap()
}

fn post(path: &str, body: &'static [u8]) -> Request<Bytes> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Bytes::from_static(body))
        .unwrap()
}

fn json_response(status: StatusCode, body: &'static [u8]) -> Response<Bytes> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Bytes::from_static(body))
        .unwrap()
}

fn unwrap_context(outcome: QueryOutcome) -> StaticHandlerContext {
    match outcome {
        QueryOutcome::Context(context) => context,
        QueryOutcome::Response(response) => {
            panic!("expected a context, got response {}", response.status())
        }
    }
}

#[tokio::test]
async fn test_status_follows_deepest_success_response() {
    let routes = vec![Route::new("/")
        .id("root")
        .loader(|_args| async {
            let response = Response::builder()
                .status(StatusCode::NON_AUTHORITATIVE_INFORMATION)
                .header(http::header::CONTENT_TYPE, "application/json")
                .header("x-layer", "root")
                .body(Bytes::from_static(b"{\"layer\":\"root\"}"))
                .unwrap();
            Ok(DataFunctionValue::Response(response))
        })
        .child(Route::new("report").id("report").loader(|_args| async {
            let response = Response::builder()
                .status(StatusCode::CREATED)
                .header(http::header::CONTENT_TYPE, "application/json")
                .header("x-layer", "report")
                .body(Bytes::from_static(b"{\"rows\":2}"))
                .unwrap();
            Ok(DataFunctionValue::Response(response))
        }))];
    let handler = StaticHandler::new(routes, StaticHandlerConfig::default()).unwrap();

    let context = unwrap_context(
        handler
            .query(get("/report"), QueryOptions::default())
            .await
            .unwrap(),
    );
    assert_eq!(context.status_code, StatusCode::CREATED);
    assert_eq!(
        context.loader_data.get("root").and_then(|d| d.as_json()),
        Some(&json!({"layer": "root"}))
    );
    assert_eq!(
        context.loader_data.get("report").and_then(|d| d.as_json()),
        Some(&json!({"rows": 2}))
    );
    let headers = context.loader_headers.get("report").unwrap();
    assert_eq!(headers.get("x-layer").unwrap(), "report");
    assert!(context.errors.is_none());
}

#[tokio::test]
async fn test_action_error_truncates_deeper_loaders() {
    let root_calls = counter();
    let sec_calls = counter();
    let item_calls = counter();
    let routes = vec![Route::new("/")
        .id("root")
        .error_boundary()
        .loader(counting_loader(root_calls.clone(), json!("root")))
        .child(
            Route::new("sec")
                .id("sec")
                .loader(counting_loader(sec_calls.clone(), json!("sec")))
                .child(
                    Route::new("item")
                        .id("item")
                        .error_boundary()
                        .loader(counting_loader(item_calls.clone(), json!("item")))
                        .action(|_args| async {
                            Err(DataFunctionError::Response(json_response(
                                StatusCode::UNPROCESSABLE_ENTITY,
                                b"{\"field\":\"title\"}",
                            )))
                        }),
                ),
        )];
    let handler = StaticHandler::new(routes, StaticHandlerConfig::default()).unwrap();

    let context = unwrap_context(
        handler
            .query(post("/sec/item", b"{}"), QueryOptions::default())
            .await
            .unwrap(),
    );
    assert_eq!(context.status_code, StatusCode::UNPROCESSABLE_ENTITY);
    let errors = context.errors.unwrap();
    let error = errors.get("item").unwrap();
    assert_eq!(error.status().map(|s| s.as_u16()), Some(422));
    assert!(!error.is_internal());
    assert!(context.action_data.is_none());
    // Loaders above the failed boundary still ran; the rest did not.
    assert_eq!(count(&root_calls), 1);
    assert_eq!(count(&sec_calls), 1);
    assert_eq!(count(&item_calls), 0);
    assert!(context.loader_data.get("root").is_some());
    assert!(context.loader_data.get("sec").is_some());
    assert!(context.loader_data.get("item").is_none());
}

#[tokio::test]
async fn test_action_receives_absolutized_request() {
    let routes = vec![Route::new("/").id("root").child(
        Route::new("echo").id("echo").action(|args: DataFunctionArgs| async move {
            let url = args.request.uri().to_string();
            let body = String::from_utf8_lossy(args.request.body()).to_string();
            Ok(DataFunctionValue::Json(json!({ "url": url, "body": body })))
        }),
    )];
    let handler = StaticHandler::new(routes, StaticHandlerConfig::default()).unwrap();

    let context = unwrap_context(
        handler
            .query(post("/echo?x=1", b"{\"title\":\"hello\"}"), QueryOptions::default())
            .await
            .unwrap(),
    );
    assert_eq!(context.status_code, StatusCode::OK);
    let action_data = context.action_data.unwrap();
    assert_eq!(
        action_data.get("echo"),
        Some(&json!({
            "url": "http://localhost/echo?x=1",
            "body": "{\"title\":\"hello\"}"
        }))
    );
}

#[tokio::test]
async fn test_query_leaves_deferred_live() {
    let routes = vec![Route::new("/").id("root").child(
        Route::new("metrics").id("metrics").loader(|_args| async {
            let deferred = DeferredData::builder()
                .value("ready", json!(1))
                .future("slow", async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(json!("later"))
                })
                .build();
            Ok(DataFunctionValue::Deferred(deferred))
        }),
    )];
    let handler = StaticHandler::new(routes, StaticHandlerConfig::default()).unwrap();

    let context = unwrap_context(
        handler
            .query(get("/metrics"), QueryOptions::default())
            .await
            .unwrap(),
    );
    assert_eq!(context.status_code, StatusCode::OK);
    let data = context.loader_data.get("metrics").unwrap();
    assert!(data.as_json().is_none(), "deferred data must stay deferred");
    let deferred = data.as_deferred().unwrap();
    assert_eq!(
        deferred.resolve_all().await.unwrap(),
        json!({"ready": 1, "slow": "later"})
    );
}

#[tokio::test]
async fn test_query_route_resolves_deferred() {
    let routes = vec![Route::new("/").id("root").child(
        Route::new("metrics").id("metrics").loader(|_args| async {
            let deferred = DeferredData::builder()
                .value("ready", json!(1))
                .future("slow", async { Ok(json!("later")) })
                .build();
            Ok(DataFunctionValue::Deferred(deferred))
        }),
    )];
    let handler = StaticHandler::new(routes, StaticHandlerConfig::default()).unwrap();

    let outcome = handler
        .query_route(get("/metrics"), None, QueryOptions::default())
        .await
        .unwrap();
    match outcome {
        QueryRouteOutcome::Data(value) => {
            assert_eq!(value, json!({"ready": 1, "slow": "later"}))
        }
        QueryRouteOutcome::Response(_) => panic!("expected data"),
    }
}

#[tokio::test]
async fn test_query_route_rejects_action_deferred() {
    let routes = vec![Route::new("/").id("root").child(
        Route::new("gen").id("gen").action(|_args| async {
            let deferred = DeferredData::builder().value("n", json!(1)).build();
            Ok(DataFunctionValue::Deferred(deferred))
        }),
    )];
    let handler = StaticHandler::new(routes, StaticHandlerConfig::default()).unwrap();

    let err = handler
        .query_route(post("/gen", b"{}"), None, QueryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.status().map(|s| s.as_u16()), Some(400));
}

#[tokio::test]
async fn test_basename_scopes_matching() {
    let routes = vec![Route::new("/")
        .id("root")
        .child(Route::new("tasks").id("tasks").loader(json_loader(json!(["t"]))))];
    let handler = StaticHandler::new(
        routes,
        StaticHandlerConfig {
            basename: "/app".to_string(),
        },
    )
    .unwrap();

    let context = unwrap_context(
        handler
            .query(get("/app/tasks"), QueryOptions::default())
            .await
            .unwrap(),
    );
    assert_eq!(context.status_code, StatusCode::OK);
    assert_eq!(context.location.pathname, "/app/tasks");
    assert_eq!(
        context.loader_data.get("tasks").and_then(|d| d.as_json()),
        Some(&json!(["t"]))
    );

    // Outside the basename nothing matches.
    let context = unwrap_context(
        handler
            .query(get("/tasks"), QueryOptions::default())
            .await
            .unwrap(),
    );
    assert_eq!(context.status_code, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_action_redirect_passes_through() {
    let root_calls = counter();
    let routes = vec![Route::new("/")
        .id("root")
        .loader(counting_loader(root_calls.clone(), json!("root")))
        .child(Route::new("submit").id("submit").action(|_args| async {
            Ok(redirect_with_status("/done", StatusCode::SEE_OTHER))
        }))];
    let handler = StaticHandler::new(routes, StaticHandlerConfig::default()).unwrap();

    let outcome = handler
        .query(post("/submit", b"{}"), QueryOptions::default())
        .await
        .unwrap();
    let response = match outcome {
        QueryOutcome::Response(response) => response,
        QueryOutcome::Context(_) => panic!("expected a redirect response"),
    };
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers().get(http::header::LOCATION).unwrap(), "/done");
    assert_eq!(count(&root_calls), 0, "redirect must short-circuit the loaders");
}

#[tokio::test]
async fn test_lazy_route_resolved_during_query() {
    let routes = vec![Route::new("/").id("root").child(
        Route::new("late").id("late").lazy(|| async {
            Ok(LazyRoute::new().loader(|_args| async {
                Ok(DataFunctionValue::Json(json!({"mode": "lazy"})))
            }))
        }),
    )];
    let handler = StaticHandler::new(routes, StaticHandlerConfig::default()).unwrap();

    let context = unwrap_context(
        handler
            .query(get("/late"), QueryOptions::default())
            .await
            .unwrap(),
    );
    assert_eq!(
        context.loader_data.get("late").and_then(|d| d.as_json()),
        Some(&json!({"mode": "lazy"}))
    );
}

#[tokio::test]
async fn test_query_aborts_on_signal() {
    let slow = Controlled::new();
    let routes = vec![Route::new("/")
        .id("root")
        .child(Route::new("slow").id("slow").loader(slow.handler()))];
    let handler = Arc::new(StaticHandler::new(routes, StaticHandlerConfig::default()).unwrap());

    let signal = CancellationToken::new();
    let opts = QueryOptions {
        signal: Some(signal.clone()),
        ..Default::default()
    };
    let running = {
        let handler = handler.clone();
        tokio::spawn(async move { handler.query(get("/slow"), opts).await })
    };
    slow.wait_calls(1).await;
    signal.cancel();

    let err = running.await.unwrap().unwrap_err();
    assert!(
        err.to_string().contains("aborted"),
        "unexpected error: {err}"
    );
}
