use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::{Duration, Instant},
};

use jitter::{
    config::JitterConfiguration,
    lifecycle::{LifecycleState, ServiceLifecycle},
};
use jitter_error::GenericError;
use tokio::{net::TcpStream, sync::oneshot, task::JoinHandle, time::sleep};

struct RunningService {
    address: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<(Result<(), GenericError>, LifecycleState)>,
}

impl RunningService {
    async fn start(config: JitterConfiguration) -> Self {
        let mut lifecycle = ServiceLifecycle::new(JitterConfiguration {
            listen_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
            rng_seed: Some(7),
            ..config
        });
        let address = lifecycle.start().await.expect("should start");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = lifecycle
                .run_until(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            (result, lifecycle.state())
        });

        Self {
            address,
            shutdown_tx,
            task,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    async fn stop(self) -> (Result<(), GenericError>, LifecycleState) {
        let _ = self.shutdown_tx.send(());
        self.task.await.expect("lifecycle task should not panic")
    }
}

fn parse_body(body: &str) -> (u64, u16) {
    let (delay, code) = body
        .strip_suffix('\n')
        .and_then(|body| body.split_once("ms -> "))
        .unwrap_or_else(|| panic!("malformed body: {:?}", body));
    (delay.parse().unwrap(), code.parse().unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serves_all_routes() {
    let service = RunningService::start(JitterConfiguration {
        max_latency_ms: 200,
        ..Default::default()
    })
    .await;
    let client = reqwest::Client::new();

    // Keep the primary route busy while probing.
    let load = (0..8)
        .map(|_| tokio::spawn(client.get(service.url("/")).send()))
        .collect::<Vec<_>>();

    for path in ["/healthz", "/readyz"] {
        let response = client.get(service.url(path)).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert!(response.text().await.unwrap().is_empty());
    }

    let response = client.get(service.url("/random")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 404);
    assert!(response.headers().contains_key("traceparent"));
    assert_eq!(response.text().await.unwrap(), "Not Found\n");

    for request in load {
        let response = request.await.unwrap().unwrap();
        let status = response.status().as_u16();
        assert!(response.headers().contains_key("traceparent"));

        let (delay_ms, code) = parse_body(&response.text().await.unwrap());
        assert_eq!(status, code);
        assert!([200, 400, 500].contains(&code));
        assert!(delay_ms < 200);
    }

    let (result, state) = service.stop().await;
    result.unwrap();
    assert_eq!(state, LifecycleState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_lets_in_flight_requests_finish() {
    let service = RunningService::start(JitterConfiguration {
        max_latency_ms: 1000,
        shutdown_grace_period_secs: 5,
        ..Default::default()
    })
    .await;
    let address = service.address;
    let client = reqwest::Client::new();

    let in_flight = (0..4)
        .map(|_| tokio::spawn(client.get(service.url("/")).send()))
        .collect::<Vec<_>>();
    sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let stopping = tokio::spawn(service.stop());

    // The port closes as soon as shutdown begins, even while requests are still in flight.
    sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(address).await.is_err());

    for request in in_flight {
        let response = request.await.unwrap().unwrap();
        let status = response.status().as_u16();
        let (delay_ms, code) = parse_body(&response.text().await.unwrap());
        assert_eq!(status, code);
        assert!(delay_ms < 1000);
    }

    let (result, state) = stopping.await.unwrap();
    result.unwrap();
    assert_eq!(state, LifecycleState::Stopped);
    assert!(started.elapsed() < Duration::from_millis(5500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cuts_short_requests_past_grace_period() {
    let service = RunningService::start(JitterConfiguration {
        max_latency_ms: 60_000,
        shutdown_grace_period_secs: 0,
        abandon_drain_period_ms: 500,
        ..Default::default()
    })
    .await;
    let client = reqwest::Client::new();

    let request = tokio::spawn(client.get(service.url("/")).send());
    sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let (result, state) = service.stop().await;
    result.unwrap();
    assert_eq!(state, LifecycleState::Stopped);
    assert!(started.elapsed() < Duration::from_secs(5));

    // Whether the wait was cut short or not, the request still got a well-formed response.
    let response = request.await.unwrap().unwrap();
    let status = response.status().as_u16();
    let (delay_ms, code) = parse_body(&response.text().await.unwrap());
    assert_eq!(status, code);
    assert!(delay_ms < 60_000);
}
