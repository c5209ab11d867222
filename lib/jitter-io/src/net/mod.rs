//! Network listeners, servers, and service adapters.

pub mod listener;
pub mod server;
pub mod util;
