//! A synthetic traffic generator.
//!
//! Serves HTTP requests with randomly chosen status codes and latencies, drawn from configurable distributions, to
//! produce realistic and variable telemetry for exercising observability pipelines.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod body;
pub mod config;
pub mod handlers;
pub mod lifecycle;
