//! Networking primitives for serving HTTP.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod net;
