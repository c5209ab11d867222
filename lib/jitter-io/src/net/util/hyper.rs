//! Adapters between Tower and Hyper services.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use pin_project_lite::pin_project;
use snafu::Snafu;
use tokio::time::{sleep, Sleep};
use tower::{util::Oneshot, ServiceExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A Tower service converted into a Hyper service.
#[derive(Debug, Copy, Clone)]
pub struct TowerToHyperService<S> {
    service: S,
}

impl<S> TowerToHyperService<S> {
    /// Create a new `TowerToHyperService` from a Tower service.
    pub fn new(tower_service: S) -> Self {
        Self { service: tower_service }
    }
}

impl<S, R> hyper::service::Service<R> for TowerToHyperService<S>
where
    S: tower::Service<R> + Clone,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = TowerToHyperServiceFuture<S, R>;

    fn call(&self, req: R) -> Self::Future {
        TowerToHyperServiceFuture {
            future: self.service.clone().oneshot(req),
        }
    }
}

pin_project! {
    /// Response future for [`TowerToHyperService`].
    pub struct TowerToHyperServiceFuture<S, R>
    where
        S: tower::Service<R>,
    {
        #[pin]
        future: Oneshot<S, R>,
    }
}

impl<S, R> Future for TowerToHyperServiceFuture<S, R>
where
    S: tower::Service<R>,
{
    type Output = Result<S::Response, S::Error>;

    #[inline]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().future.poll(cx)
    }
}

/// A request did not produce a response in time.
#[derive(Debug, Snafu)]
#[snafu(display("request did not complete within {}ms", timeout.as_millis()))]
pub struct RequestTimedOut {
    timeout: Duration,
}

/// A Hyper service that fails any request whose response is not produced within a fixed timeout.
///
/// Failing the service call causes the connection serving the request to be closed, without a response being written.
#[derive(Debug, Copy, Clone)]
pub struct RequestTimeout<S> {
    service: S,
    timeout: Duration,
}

impl<S> RequestTimeout<S> {
    /// Create a new `RequestTimeout` wrapping the given service.
    pub fn new(service: S, timeout: Duration) -> Self {
        Self { service, timeout }
    }
}

impl<S, R> hyper::service::Service<R> for RequestTimeout<S>
where
    S: hyper::service::Service<R>,
    S::Error: Into<BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = RequestTimeoutFuture<S::Future>;

    fn call(&self, req: R) -> Self::Future {
        RequestTimeoutFuture {
            future: self.service.call(req),
            deadline: sleep(self.timeout),
            timeout: self.timeout,
        }
    }
}

pin_project! {
    /// Response future for [`RequestTimeout`].
    pub struct RequestTimeoutFuture<F> {
        #[pin]
        future: F,
        #[pin]
        deadline: Sleep,
        timeout: Duration,
    }
}

impl<F, T, E> Future for RequestTimeoutFuture<F>
where
    F: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(result) = this.future.poll(cx) {
            return Poll::Ready(result.map_err(Into::into));
        }

        match this.deadline.poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Box::new(RequestTimedOut {
                timeout: *this.timeout,
            }))),
            Poll::Pending => Poll::Pending,
        }
    }
}
