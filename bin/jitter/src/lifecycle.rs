//! Service lifecycle.

use std::{future::Future, net::SocketAddr};

use jitter_app::{api::APIBuilder, telemetry::TelemetryHandle};
use jitter_core::{entropy::EntropySource, generator::ResponseGenerator};
use jitter_error::{generic_error, merge_errors, ErrorContext as _, GenericError};
use jitter_io::net::{
    listener::Listener,
    server::http::{ErrorHandle, ShutdownHandle},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::JitterConfiguration,
    handlers::{OutcomeHandler, ProbeHandler},
};

/// State of the service.
///
/// The service moves through each state in order, exactly once.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleState {
    /// The listener has not been bound yet.
    NotStarted,

    /// Accepting connections and serving requests.
    Serving,

    /// No longer accepting connections, and waiting for in-flight requests to finish.
    ShuttingDown,

    /// All connections have been closed and telemetry has been flushed.
    Stopped,
}

impl LifecycleState {
    fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::Serving),
            Self::Serving => Some(Self::ShuttingDown),
            Self::ShuttingDown => Some(Self::Stopped),
            Self::Stopped => None,
        }
    }
}

/// Drives the service from startup to shutdown.
///
/// Shutdown is triggered by whichever comes first: the shutdown signal, or the server failing. Once triggered, the
/// listener is closed immediately, and in-flight requests are given the grace period to finish normally. Requests
/// still running after that have their simulated latency cut short, and are given the drain period to write a
/// response before their connections are forcibly closed.
pub struct ServiceLifecycle {
    state: LifecycleState,
    config: JitterConfiguration,
    abandon_token: CancellationToken,
    server: Option<(ShutdownHandle, ErrorHandle)>,
    telemetry: Option<TelemetryHandle>,
}

impl ServiceLifecycle {
    /// Creates a new `ServiceLifecycle` from the given configuration.
    pub fn new(config: JitterConfiguration) -> Self {
        Self {
            state: LifecycleState::NotStarted,
            config,
            abandon_token: CancellationToken::new(),
            server: None,
            telemetry: None,
        }
    }

    /// Hands over the telemetry pipeline, to be flushed and shut down once the service has stopped.
    pub fn with_telemetry(mut self, telemetry: TelemetryHandle) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn transition(&mut self, next: LifecycleState) -> Result<(), GenericError> {
        if self.state.next() != Some(next) {
            return Err(generic_error!(
                "Invalid lifecycle transition from {:?} to {:?}.",
                self.state,
                next
            ));
        }

        debug!(from = ?self.state, to = ?next, "Lifecycle transition.");
        self.state = next;
        Ok(())
    }

    /// Starts serving.
    ///
    /// Returns the address the service is listening on, which differs from the configured address when binding to
    /// port zero.
    ///
    /// # Errors
    ///
    /// If the service was already started, the configuration is invalid, or the listener cannot be bound, an error is
    /// returned. When startup fails, telemetry is shut down before returning.
    pub async fn start(&mut self) -> Result<SocketAddr, GenericError> {
        if self.state != LifecycleState::NotStarted {
            return Err(generic_error!("Service cannot be started while {:?}.", self.state));
        }

        match self.try_start().await {
            Ok(listen_address) => Ok(listen_address),
            Err(e) => {
                // Any telemetry shutdown failure is logged there.
                let _ = self.shutdown_telemetry().await;
                Err(e)
            }
        }
    }

    async fn try_start(&mut self) -> Result<SocketAddr, GenericError> {
        self.config.validate()?;

        let listener = Listener::bind(self.config.listen_address)
            .await
            .error_context("Failed to bind listener.")?;

        let entropy = match self.config.rng_seed {
            Some(seed) => {
                info!(seed, "Seeding random number generator from configuration.");
                EntropySource::from_seed(seed)
            }
            None => EntropySource::from_os_rng(),
        };
        let generator = ResponseGenerator::new(
            self.config.outcomes.clone(),
            self.config.latency_simulator(),
            entropy,
        );

        let server = APIBuilder::new()
            .with_handler(OutcomeHandler::new(generator, self.abandon_token.clone()))
            .with_handler(ProbeHandler)
            .into_server(listener, self.config.read_timeout(), self.config.write_timeout());
        let listen_address = server.listen_address();

        self.server = Some(server.listen());
        self.transition(LifecycleState::Serving)?;

        info!(%listen_address, "Serving requests.");
        Ok(listen_address)
    }

    /// Serves until `shutdown` resolves or the server fails, and then shuts down.
    ///
    /// # Errors
    ///
    /// If the service was not started, or the server failed, an error is returned. Failing to shut down telemetry is
    /// reported alongside any server error, but is otherwise only logged.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), GenericError>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_handle, error_handle) = match (self.state, self.server.take()) {
            (LifecycleState::Serving, Some(server)) => server,
            (state, _) => return Err(generic_error!("Service cannot run while {:?}.", state)),
        };

        self.serve_until(shutdown_handle, error_handle, shutdown).await
    }

    async fn serve_until<F, E>(
        &mut self, shutdown_handle: ShutdownHandle, server_error: E, shutdown: F,
    ) -> Result<(), GenericError>
    where
        F: Future<Output = ()>,
        E: Future<Output = Option<GenericError>>,
    {
        let serve_error = select! {
            _ = shutdown => {
                info!("Shutdown requested.");
                None
            },
            maybe_err = server_error => {
                let err = maybe_err.unwrap_or_else(|| generic_error!("HTTP server stopped unexpectedly."));
                error!(error = %err, "HTTP server failed. Shutting down.");
                Some(err)
            },
        };

        self.transition(LifecycleState::ShuttingDown)?;
        self.drain(shutdown_handle).await;

        let teardown_error = self.shutdown_telemetry().await;

        self.transition(LifecycleState::Stopped)?;
        info!("Service stopped.");

        match merge_errors(serve_error, teardown_error) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn shutdown_telemetry(&mut self) -> Option<GenericError> {
        let teardown_error = match self.telemetry.take() {
            Some(telemetry) => telemetry
                .shutdown()
                .await
                .error_context("Failed to shut down telemetry.")
                .err(),
            None => None,
        };
        if let Some(e) = &teardown_error {
            warn!(error = %e, "Telemetry was not shut down cleanly.");
        }
        teardown_error
    }

    async fn drain(&self, shutdown_handle: ShutdownHandle) {
        let grace_period = self.config.shutdown_grace_period();
        let drain_period = self.config.abandon_drain_period();

        let draining = shutdown_handle.shutdown().await;
        info!(
            in_flight = draining.remaining(),
            grace_period_ms = grace_period.as_millis() as u64,
            "Stopped accepting connections. Waiting for in-flight requests to complete."
        );

        if draining.wait(grace_period).await {
            return;
        }

        warn!(
            in_flight = draining.remaining(),
            "Grace period expired. Cutting short in-flight requests."
        );
        self.abandon_token.cancel();

        if !draining.wait(drain_period).await {
            warn!(
                in_flight = draining.remaining(),
                "Connections still open after drain period. Forcibly closing."
            );
        }
        draining.terminate().await;
    }
}
