//! Request handlers.

use std::time::Duration;

use http::Method;
use jitter_api::{
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, Router},
    APIHandler, StatusCode,
};
use jitter_core::{
    generator::ResponseGenerator,
    latency::{LatencySimulator, WaitOutcome},
};
use jitter_io::net::server::http::connection_error;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Span};

use crate::body::{Reporter, ReportingBody, WriteOutcome};

/// State for [`OutcomeHandler`].
#[derive(Clone)]
pub struct OutcomeState {
    generator: ResponseGenerator,
    abandon_token: CancellationToken,
}

/// Responds to requests with a randomly chosen status code, after a random delay.
///
/// The delay is cut short if the abandonment token is cancelled, in which case the response is still written, but
/// reports how long was actually waited.
pub struct OutcomeHandler {
    state: OutcomeState,
}

impl OutcomeHandler {
    /// Creates a new `OutcomeHandler`.
    pub fn new(generator: ResponseGenerator, abandon_token: CancellationToken) -> Self {
        Self {
            state: OutcomeState {
                generator,
                abandon_token,
            },
        }
    }

    async fn outcome_handler(State(state): State<OutcomeState>, method: Method) -> Response {
        let sample = match state.generator.sample() {
            Ok(sample) => sample,
            Err(e) => {
                error!(error = %e, "Failed to sample response outcome.");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        // From here on, if the request is dropped (client gone, connection closed) the record says so.
        let mut record = RequestRecord::new(Span::current(), sample.code, sample.delay);

        let wait_outcome = LatencySimulator::wait(sample.delay, &state.abandon_token).await;
        record.waited(wait_outcome);
        let waited = wait_outcome.waited(sample.delay);

        counter!("requests_total", "code" => sample.code.to_string()).increment(1);
        histogram!("simulated_latency_seconds").record(waited.as_secs_f64());

        let status = StatusCode::from_u16(sample.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // HEAD responses never have their body polled, so there's nothing to wait for.
        if method == Method::HEAD {
            record.complete(WriteOutcome::Written);
            return status.into_response();
        }

        let reporter: Reporter = Box::new(move |write_outcome| record.complete(write_outcome));
        let body = ReportingBody::new(format!("{}ms -> {}\n", waited.as_millis(), sample.code), reporter);
        (status, jitter_api::body::Body::new(body)).into_response()
    }
}

impl APIHandler for OutcomeHandler {
    type State = OutcomeState;

    fn generate_initial_state(&self) -> Self::State {
        self.state.clone()
    }

    fn generate_routes(&self) -> Router<Self::State> {
        Router::new().route("/", get(Self::outcome_handler))
    }
}

/// The log record for a single request.
///
/// Exactly one record is emitted per request: either when the response has been written, or when the request is
/// abandoned. Dropping the record before it was completed counts as abandoning the request.
struct RequestRecord {
    span: Span,
    code: u16,
    delay: Duration,
    cancelled: bool,
    emitted: bool,
}

impl RequestRecord {
    fn new(span: Span, code: u16, delay: Duration) -> Self {
        Self {
            span,
            code,
            delay,
            cancelled: false,
            emitted: false,
        }
    }

    fn waited(&mut self, wait_outcome: WaitOutcome) {
        self.delay = wait_outcome.waited(self.delay);
        self.cancelled = wait_outcome.is_cancelled();
    }

    fn complete(mut self, write_outcome: WriteOutcome) {
        self.emit(write_outcome);
    }

    fn emit(&mut self, write_outcome: WriteOutcome) {
        if self.emitted {
            return;
        }
        self.emitted = true;

        let _entered = self.span.enter();
        let delay_ms = self.delay.as_millis() as u64;
        match write_outcome {
            WriteOutcome::Written => info!(
                result = self.code,
                delay_ms,
                cancelled = self.cancelled,
                "Request handled."
            ),
            WriteOutcome::Abandoned => {
                let cause = connection_error()
                    .unwrap_or_else(|| "request dropped before the response was written".to_string());
                error!(
                    result = self.code,
                    delay_ms,
                    cancelled = self.cancelled,
                    error = %cause,
                    "Failed to write response."
                )
            }
        }
    }
}

impl Drop for RequestRecord {
    fn drop(&mut self) {
        self.emit(WriteOutcome::Abandoned);
    }
}

/// Liveness and readiness probes.
///
/// Both probes respond with 200 and an empty body for as long as the service is accepting connections.
pub struct ProbeHandler;

impl ProbeHandler {
    async fn probe_handler() -> StatusCode {
        StatusCode::OK
    }
}

impl APIHandler for ProbeHandler {
    type State = ();

    fn generate_initial_state(&self) -> Self::State {}

    fn generate_routes(&self) -> Router<Self::State> {
        Router::new()
            .route("/healthz", get(Self::probe_handler))
            .route("/readyz", get(Self::probe_handler))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use http::Request;
    use http_body_util::BodyExt as _;
    use jitter_api::body::Body;
    use jitter_app::api::APIBuilder;
    use jitter_core::{
        distribution::{Distribution, Outcome},
        entropy::EntropySource,
    };
    use jitter_io::net::listener::Listener;
    use tokio::{
        io::AsyncWriteExt as _,
        net::TcpStream,
        time::{sleep, Instant},
    };
    use tower::ServiceExt as _;

    use super::*;

    fn router(distribution: Distribution, max_latency_ms: u64, abandon_token: CancellationToken) -> Router {
        let generator = ResponseGenerator::new(
            distribution,
            LatencySimulator::from_max_millis(max_latency_ms),
            EntropySource::from_seed(11),
        );

        APIBuilder::new()
            .with_handler(OutcomeHandler::new(generator, abandon_token))
            .with_handler(ProbeHandler)
            .into_router()
    }

    async fn send(router: Router, path: &str) -> (StatusCode, String) {
        let request = Request::get(path).body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn parse_body(body: &str) -> (u64, u16) {
        let (delay, code) = body
            .strip_suffix('\n')
            .and_then(|body| body.split_once("ms -> "))
            .unwrap_or_else(|| panic!("malformed body: {:?}", body));
        (delay.parse().unwrap(), code.parse().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn outcome_responses_well_formed() {
        let router = router(Distribution::default(), 2000, CancellationToken::new());

        for _ in 0..50 {
            let (status, body) = send(router.clone(), "/").await;
            let (delay_ms, code) = parse_body(&body);

            assert!([200, 400, 500].contains(&code));
            assert_eq!(status.as_u16(), code);
            assert!(delay_ms < 2000);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn outcome_uses_configured_distribution() {
        let distribution = Distribution::try_from_outcomes(vec![Outcome::new(503, 1), Outcome::new(200, 0)]).unwrap();
        let router = router(distribution, 10, CancellationToken::new());

        for _ in 0..10 {
            let (status, body) = send(router.clone(), "/").await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert!(body.ends_with("ms -> 503\n"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn outcome_zero_latency_bound_still_responds() {
        let router = router(Distribution::default(), 0, CancellationToken::new());

        let (_, body) = send(router, "/").await;
        let (delay_ms, _) = parse_body(&body);
        assert_eq!(delay_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn outcome_cancelled_wait_reports_elapsed() {
        let abandon_token = CancellationToken::new();
        abandon_token.cancel();
        let router = router(Distribution::default(), 2000, abandon_token);

        let (status, body) = send(router, "/").await;
        let (delay_ms, code) = parse_body(&body);
        assert_eq!(delay_ms, 0);
        assert_eq!(status.as_u16(), code);
    }

    #[tokio::test]
    async fn probes_respond_empty() {
        let router = router(Distribution::default(), 2000, CancellationToken::new());

        for path in ["/healthz", "/readyz"] {
            let (status, body) = send(router.clone(), path).await;
            assert_eq!(status, StatusCode::OK);
            assert!(body.is_empty());
        }
    }

    #[tokio::test]
    async fn unknown_path_not_found() {
        let router = router(Distribution::default(), 2000, CancellationToken::new());

        let (status, body) = send(router, "/random").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "Not Found\n");
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn client_disconnect_mid_wait_emits_one_record() {
        let buffer = SharedBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _subscriber_guard = tracing::subscriber::set_default(subscriber);

        let generator = ResponseGenerator::new(
            Distribution::try_from_outcomes(vec![Outcome::new(200, 1)]).unwrap(),
            LatencySimulator::from_max_millis(60_000),
            EntropySource::from_seed(11),
        );
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server = APIBuilder::new()
            .with_handler(OutcomeHandler::new(generator, CancellationToken::new()))
            .into_server(listener, Duration::from_secs(1), Duration::from_secs(120));
        let address = server.listen_address();
        let (shutdown_handle, _error_handle) = server.listen();

        let mut stream = TcpStream::connect(address).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        sleep(Duration::from_millis(20)).await;
        drop(stream);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !buffer.contents().contains("Failed to write response.") && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }
        sleep(Duration::from_millis(100)).await;

        let output = buffer.contents();
        assert_eq!(output.matches("Failed to write response.").count(), 1, "output: {}", output);
        assert_eq!(output.matches("Request handled.").count(), 0, "output: {}", output);

        let record = output
            .lines()
            .find(|line| line.contains("Failed to write response."))
            .unwrap();
        assert!(record.contains("http_request"), "record: {}", record);
        assert!(record.contains("trace_id"), "record: {}", record);
        assert!(record.contains("result=200"), "record: {}", record);
        assert!(record.contains("cancelled=false"), "record: {}", record);
        assert!(
            !record.contains("request dropped before the response was written"),
            "record should carry the connection error: {}",
            record
        );

        let draining = shutdown_handle.shutdown().await;
        assert!(draining.wait(Duration::from_secs(1)).await);
    }

    #[test]
    fn record_emitted_once_when_completed() {
        let buffer = SharedBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut record = RequestRecord::new(Span::none(), 400, Duration::from_millis(900));
            record.waited(WaitOutcome::Cancelled {
                elapsed: Duration::from_millis(250),
            });
            record.complete(WriteOutcome::Written);

            let dropped = RequestRecord::new(Span::none(), 500, Duration::from_millis(10));
            drop(dropped);
        });

        let output = buffer.contents();
        assert_eq!(output.matches("Request handled.").count(), 1, "output: {}", output);
        assert!(output.contains("result=400 delay_ms=250 cancelled=true"), "output: {}", output);
        assert_eq!(output.matches("Failed to write response.").count(), 1, "output: {}", output);
        assert!(output.contains("request dropped before the response was written"), "output: {}", output);
    }
}
