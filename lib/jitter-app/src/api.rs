//! API server.

use std::time::Duration;

use axum::{
    body::Body,
    extract::Request,
    middleware::{self, Next},
    response::Response,
    Router,
};
use http::{HeaderValue, StatusCode};
use jitter_api::APIHandler;
use jitter_io::net::{
    listener::Listener,
    server::http::HttpServer,
    util::hyper::{RequestTimeout, TowerToHyperService},
};
use tower_http::trace::TraceLayer;
use tracing::{debug, field, info_span, Span};

use crate::trace_context::{TraceContext, TRACEPARENT};

const NOT_FOUND_BODY: &str = "Not Found\n";

/// The Hyper service produced by [`APIBuilder::into_service`].
pub type APIService = RequestTimeout<TowerToHyperService<Router>>;

/// An API builder.
///
/// `APIBuilder` provides a simple and ergonomic builder pattern for constructing an API server from multiple handlers.
/// This allows composing portions of an API from individual building blocks.
///
/// Every request routed through the built API gets a trace context, taken from its `traceparent` header when valid
/// and generated otherwise, and is handled within an `http_request` span carrying it. The trace context is echoed back
/// in the `traceparent` header of the response.
#[derive(Default)]
pub struct APIBuilder {
    router: Router,
}

impl APIBuilder {
    /// Create a new `APIBuilder` with an empty router.
    ///
    /// A fallback route will be provided that returns a 404 Not Found response for any route that isn't explicitly handled.
    pub fn new() -> Self {
        Self { router: Router::new() }
    }

    /// Adds the given handler to this builder.
    ///
    /// The initial state and routes provided by the handler will be merged into this builder.
    ///
    /// # Panics
    ///
    /// If the handler registers a route that has already been registered by another handler, this will panic.
    pub fn with_handler<H>(mut self, handler: H) -> Self
    where
        H: APIHandler,
    {
        let handler_router = handler.generate_routes();
        let handler_state = handler.generate_initial_state();
        self.router = self.router.merge(handler_router.with_state(handler_state));

        self
    }

    /// Builds the router, with the not-found fallback and the tracing middleware applied.
    pub fn into_router(self) -> Router {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(make_request_span)
            .on_request(())
            .on_response(record_response)
            .on_failure(());

        self.router
            .fallback(not_found)
            .layer(trace_layer)
            .layer(middleware::from_fn(propagate_trace_context))
    }

    /// Builds a Hyper service from the router, which fails any request that takes longer than `request_timeout` to
    /// produce a response.
    pub fn into_service(self, request_timeout: Duration) -> APIService {
        // The router is a Tower service, and `HttpServer` expects a Hyper service.
        RequestTimeout::new(TowerToHyperService::new(self.into_router()), request_timeout)
    }

    /// Builds an HTTP server for this API on the given listener.
    ///
    /// Clients have `header_read_timeout` to send their request headers, and each request has `request_timeout` to
    /// produce a response before its connection is closed.
    pub fn into_server(
        self, listener: Listener, header_read_timeout: Duration, request_timeout: Duration,
    ) -> HttpServer<APIService> {
        let service = self.into_service(request_timeout);
        HttpServer::from_listener(listener, service).with_header_read_timeout(header_read_timeout)
    }
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}

async fn propagate_trace_context(mut request: Request, next: Next) -> Response {
    let trace_context = resolve_trace_context(&request);
    request.extensions_mut().insert(trace_context);

    let mut response = next.run(request).await;
    match HeaderValue::from_str(&trace_context.to_string()) {
        Ok(value) => {
            response.headers_mut().insert(TRACEPARENT, value);
        }
        Err(e) => debug!(error = %e, "Failed to encode trace context."),
    }

    response
}

fn resolve_trace_context(request: &Request) -> TraceContext {
    let mut rng = rand::rng();
    request
        .headers()
        .get(TRACEPARENT)
        .and_then(|value| value.to_str().ok())
        .and_then(TraceContext::from_traceparent)
        .map(|parent| parent.child(&mut rng))
        .unwrap_or_else(|| TraceContext::generate(&mut rng))
}

fn make_request_span(request: &Request<Body>) -> Span {
    let span = info_span!(
        "http_request",
        method = %request.method(),
        path = %request.uri().path(),
        trace_id = field::Empty,
        span_id = field::Empty,
        status = field::Empty,
        latency_ms = field::Empty,
    );

    if let Some(trace_context) = request.extensions().get::<TraceContext>() {
        span.record("trace_id", trace_context.trace_id_hex().as_str());
        span.record("span_id", trace_context.span_id_hex().as_str());
    }

    span
}

fn record_response(response: &Response<Body>, latency: Duration, span: &Span) {
    span.record("status", response.status().as_u16());
    span.record("latency_ms", latency.as_millis() as u64);
    debug!("Finished processing request.");
}

#[cfg(test)]
mod tests {
    use axum::routing::get;
    use http_body_util::BodyExt as _;
    use tower::ServiceExt as _;

    use super::*;

    struct EchoTraceHandler;

    impl APIHandler for EchoTraceHandler {
        type State = ();

        fn generate_initial_state(&self) -> Self::State {}

        fn generate_routes(&self) -> Router<Self::State> {
            Router::new().route(
                "/trace",
                get(|axum::Extension(ctx): axum::Extension<TraceContext>| async move { ctx.trace_id_hex() }),
            )
        }
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, Option<String>, String) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let traceparent = response
            .headers()
            .get(TRACEPARENT)
            .map(|v| v.to_str().unwrap().to_string());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, traceparent, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn unknown_route_not_found() {
        let router = APIBuilder::new().with_handler(EchoTraceHandler).into_router();
        let request = http::Request::get("/random").body(Body::empty()).unwrap();

        let (status, traceparent, body) = call(router, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "Not Found\n");
        assert!(traceparent.is_some());
    }

    #[tokio::test]
    async fn incoming_trace_context_honored() {
        let router = APIBuilder::new().with_handler(EchoTraceHandler).into_router();
        let request = http::Request::get("/trace")
            .header(TRACEPARENT, "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
            .body(Body::empty())
            .unwrap();

        let (status, traceparent, body) = call(router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "4bf92f3577b34da6a3ce929d0e0e4736");

        let echoed = TraceContext::from_traceparent(&traceparent.unwrap()).unwrap();
        assert_eq!(echoed.trace_id_hex(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_ne!(echoed.span_id_hex(), "00f067aa0ba902b7");
    }

    #[tokio::test]
    async fn invalid_trace_context_replaced() {
        let router = APIBuilder::new().with_handler(EchoTraceHandler).into_router();
        let request = http::Request::get("/trace")
            .header(TRACEPARENT, "not-a-trace")
            .body(Body::empty())
            .unwrap();

        let (status, traceparent, body) = call(router, request).await;
        assert_eq!(status, StatusCode::OK);

        let generated = TraceContext::from_traceparent(&traceparent.unwrap()).unwrap();
        assert_eq!(generated.trace_id_hex(), body);
    }
}
