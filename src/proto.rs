//! Wire types for the `observer.ingest.v1.IngestService` streaming contract.
//!
//! Span payloads are plain OTLP [`Span`] messages. The service glue (server trait,
//! server wrapper and client) is generated at build time from `build.rs`.

pub use opentelemetry_proto::tonic::trace::v1::Span;

/// A group of spans delivered as one message on a `RecordSpanBatch` stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SpanBatch {
    #[prost(message, repeated, tag = "1")]
    pub spans: ::prost::alloc::vec::Vec<Span>,
}

impl SpanBatch {
    pub fn new(spans: impl IntoIterator<Item = Span>) -> Self {
        Self {
            spans: spans.into_iter().collect(),
        }
    }
}

/// Acknowledgement sent back on every accepted stream.
///
/// `messages_seen` is the running number of spans consumed on that stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecordStatus {
    #[prost(uint64, tag = "1")]
    pub messages_seen: u64,
}

#[allow(clippy::all, unused_qualifications)]
mod generated {
    include!(concat!(env!("OUT_DIR"), "/observer.ingest.v1.IngestService.rs"));
}

pub use generated::ingest_service_client::IngestServiceClient;
pub use generated::ingest_service_server::{IngestService, IngestServiceServer};
