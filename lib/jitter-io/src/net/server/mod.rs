//! Network servers.

pub mod http;
