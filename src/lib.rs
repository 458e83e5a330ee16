//! A mock streaming span-ingestion endpoint for testing tracing agents.
//!
//! The observer stands in for a remote trace collector that accepts a long-lived,
//! client-driven gRPC stream of spans. It lets an agent's transport (reconnects,
//! backpressure, failure recovery) be exercised deterministically in tests.
//!
//! # Features
//!
//! - **Bidirectional Streaming**: `RecordSpan` and `RecordSpanBatch` streams with
//!   per-batch acknowledgements
//! - **Failure Injection**: reject the first stream with `PERMISSION_DENIED`, or every
//!   stream with `UNIMPLEMENTED`
//! - **Lifecycle Control**: `start`, `run`, `stop` and `restart` with bounded bind retries
//! - **Waiting Helpers**: block until activity, a span count, or any predicate holds
//! - **Fluent Assertion API**: builder-style assertions over recorded spans
//!
//! # Quick Start
//!
//! ```no_run
//! use mock_trace_observer::{ObserverServer, Variant};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = ObserverServer::builder()
//!         .variant(Variant::Normal)
//!         .serve()
//!         .await?;
//!
//!     // Point the agent under test at server.endpoint()...
//!
//!     server.wait_for_spans(3, Duration::from_secs(5)).await?;
//!     server.with_spans(|spans| {
//!         spans
//!             .expect_span_with_name("GET /orders")
//!             .with_attributes([("http.method", "GET")])
//!             .assert_exists();
//!     });
//!
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Variants
//!
//! - [`Variant::Normal`]: accepts every stream
//! - [`Variant::TransientFailure`]: rejects the first stream after construction or
//!   [`restart`](ObserverServer::restart), then accepts
//! - [`Variant::Unsupported`]: rejects every stream; a well-behaved client stops retrying

mod config;
mod error;
mod listener;
pub mod proto;
mod recorder;
mod server;
mod service;
mod worker;

pub use config::{ObserverConfig, ObserverServerBuilder};
pub use error::ObserverError;
pub use opentelemetry_proto::tonic::trace::v1::span::SpanKind;
pub use recorder::{RecorderSnapshot, SpanAssertion, SpanRecorder};
pub use server::{LifecycleState, ObserverServer};
pub use service::{IngestVariant, Rejection, RecordStatusStream, Variant};
