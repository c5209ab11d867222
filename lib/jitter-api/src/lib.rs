//! Building blocks for composing the HTTP surface out of independent handlers.
#![deny(warnings)]
#![deny(missing_docs)]

pub use axum::body;
pub use axum::response;
pub use axum::routing;
use axum::Router;
pub use http::StatusCode;

/// Request extractors.
pub mod extract {
    pub use axum::extract::*;
}

/// An API handler.
///
/// API handlers define the initial state and routes for a portion of an API. Each handler owns its routes outright:
/// handlers are merged into a single route table when the API is built, so a given path must only be registered by a
/// single handler.
pub trait APIHandler {
    /// Shared state handed to every route of this handler.
    type State: Clone + Send + Sync + 'static;

    /// Generates the state given to the routes of this handler.
    fn generate_initial_state(&self) -> Self::State;

    /// Generates the routes served by this handler.
    fn generate_routes(&self) -> Router<Self::State>;
}
