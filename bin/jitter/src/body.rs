//! Response bodies that report whether they were written.

use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};

/// How writing a response body ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    /// The entire body was handed to the connection.
    Written,

    /// The body was dropped before it was entirely handed to the connection.
    ///
    /// This happens when the client goes away, or the connection is closed during shutdown, before the response is
    /// written.
    Abandoned,
}

/// Callback invoked once with the outcome of writing a [`ReportingBody`].
pub type Reporter = Box<dyn FnOnce(WriteOutcome) + Send>;

/// A single-chunk response body that reports whether it was written.
///
/// The reporter is invoked exactly once: with [`WriteOutcome::Written`] when the connection polls the final frame, or
/// with [`WriteOutcome::Abandoned`] if the body is dropped before then.
pub struct ReportingBody {
    data: Option<Bytes>,
    len: u64,
    reporter: Option<Reporter>,
}

impl ReportingBody {
    /// Creates a new `ReportingBody` from the given data.
    pub fn new(data: impl Into<Bytes>, reporter: Reporter) -> Self {
        let data = data.into();
        Self {
            len: data.len() as u64,
            data: Some(data),
            reporter: Some(reporter),
        }
    }

    fn report(&mut self, outcome: WriteOutcome) {
        if let Some(reporter) = self.reporter.take() {
            reporter(outcome);
        }
    }
}

impl Body for ReportingBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = this.data.take().map(|data| Ok(Frame::data(data)));

        // There's only ever one frame, so whatever we return here is the last thing the connection gets from us.
        this.report(WriteOutcome::Written);

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(if self.data.is_some() { self.len } else { 0 })
    }
}

impl Drop for ReportingBody {
    fn drop(&mut self) {
        self.report(WriteOutcome::Abandoned);
    }
}
