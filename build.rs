fn main() {
    let record_span = tonic_build::manual::Method::builder()
        .name("record_span")
        .route_name("RecordSpan")
        .input_type("crate::proto::Span")
        .output_type("crate::proto::RecordStatus")
        .codec_path("tonic::codec::ProstCodec")
        .client_streaming()
        .server_streaming()
        .build();

    let record_span_batch = tonic_build::manual::Method::builder()
        .name("record_span_batch")
        .route_name("RecordSpanBatch")
        .input_type("crate::proto::SpanBatch")
        .output_type("crate::proto::RecordStatus")
        .codec_path("tonic::codec::ProstCodec")
        .client_streaming()
        .server_streaming()
        .build();

    let ingest_service = tonic_build::manual::Service::builder()
        .name("IngestService")
        .package("observer.ingest.v1")
        .method(record_span)
        .method(record_span_batch)
        .build();

    tonic_build::manual::Builder::new().compile(&[ingest_service]);
}
