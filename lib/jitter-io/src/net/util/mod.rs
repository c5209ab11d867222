//! Helpers for adapting services to the server.

pub mod hyper;
