//! Core primitives for simulating request outcomes: which status code to respond with, and how long to take doing so.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod distribution;
pub mod entropy;
pub mod generator;
pub mod latency;
