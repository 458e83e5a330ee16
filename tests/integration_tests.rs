use mock_trace_observer::proto::{IngestServiceClient, RecordStatus, Span, SpanBatch};
use mock_trace_observer::{
    LifecycleState, ObserverError, ObserverServer, Rejection, SpanKind, Variant,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Streaming;
use tonic::transport::Channel;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn span(name: &str) -> Span {
    Span {
        name: name.to_string(),
        trace_id: vec![7; 16],
        span_id: vec![1; 8],
        kind: SpanKind::Internal as i32,
        ..Default::default()
    }
}

fn batches(prefix: &str, sizes: &[usize]) -> Vec<SpanBatch> {
    let mut next = 0;
    sizes
        .iter()
        .map(|&size| {
            SpanBatch::new((0..size).map(|_| {
                next += 1;
                span(&format!("{prefix}-{}", next - 1))
            }))
        })
        .collect()
}

async fn connect(server: &ObserverServer) -> IngestServiceClient<Channel> {
    let endpoint = server.endpoint().expect("server should be started");
    IngestServiceClient::connect(endpoint)
        .await
        .expect("Failed to connect to observer")
}

/// Sends every batch on one stream and returns the acknowledgements.
async fn send_batches(
    mut client: IngestServiceClient<Channel>,
    batches: Vec<SpanBatch>,
) -> Result<Vec<RecordStatus>, tonic::Status> {
    let mut acks = client
        .record_span_batch(tokio_stream::iter(batches))
        .await?
        .into_inner();
    let mut received = Vec::new();
    while let Some(ack) = acks.message().await? {
        received.push(ack);
    }
    Ok(received)
}

/// A batch stream that stays open until `tx` is dropped.
struct OpenStream {
    _client: IngestServiceClient<Channel>,
    tx: mpsc::Sender<SpanBatch>,
    acks: Streaming<RecordStatus>,
}

async fn open_stream(server: &ObserverServer) -> OpenStream {
    let mut client = connect(server).await;
    let (tx, rx) = mpsc::channel(4);
    let acks = client
        .record_span_batch(ReceiverStream::new(rx))
        .await
        .expect("stream should be accepted")
        .into_inner();
    OpenStream {
        _client: client,
        tx,
        acks,
    }
}

#[tokio::test]
async fn test_two_concurrent_streams_on_fixed_port() {
    init_tracing();

    let mut server = ObserverServer::new(50555, Variant::Normal);
    server.start().await.expect("Failed to start server");
    server.run().await.expect("Failed to run server");
    assert_eq!(server.state(), LifecycleState::Running);

    let client = connect(&server).await;
    let (a, b) = tokio::join!(
        send_batches(client.clone(), batches("a", &[1, 1, 1])),
        send_batches(client, batches("b", &[2])),
    );

    let a = a.expect("stream A should be accepted");
    let b = b.expect("stream B should be accepted");
    assert_eq!(a.last().map(|ack| ack.messages_seen), Some(3));
    assert_eq!(b.last().map(|ack| ack.messages_seen), Some(2));

    server
        .wait_for_spans(5, Duration::from_secs(5))
        .await
        .expect("all spans should be recorded");
    assert_eq!(server.seen_count(), 5);
    assert_eq!(server.spans().len(), 5);
    assert_eq!(server.stream_count(), 2);

    server.stop().await.expect("Failed to stop server");
    server.stop().await.expect("Second stop should be a no-op");
    assert_eq!(server.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_many_streams_keep_per_stream_order() {
    init_tracing();

    let mut server = ObserverServer::builder()
        .serve()
        .await
        .expect("Failed to start server");
    let client = connect(&server).await;

    let sends: Vec<_> = (0..6)
        .map(|stream| {
            let client = client.clone();
            tokio::spawn(async move {
                send_batches(client, batches(&format!("s{stream}"), &[3, 1, 4, 2])).await
            })
        })
        .collect();
    for send in sends {
        send.await
            .expect("send task panicked")
            .expect("stream should be accepted");
    }

    server
        .wait_for_spans(60, Duration::from_secs(5))
        .await
        .expect("all spans should be recorded");

    server.with_spans(|snapshot| {
        assert_eq!(snapshot.seen_count(), 60);
        assert_eq!(snapshot.spans().len(), 60);
        for stream in 0..6 {
            let prefix = format!("s{stream}-");
            let order: Vec<usize> = snapshot
                .spans()
                .iter()
                .filter_map(|span| span.name.strip_prefix(&prefix))
                .map(|idx| idx.parse().expect("numeric suffix"))
                .collect();
            assert_eq!(order, (0..10).collect::<Vec<_>>());
        }
        snapshot
            .expect_span()
            .with_kind(SpanKind::Internal)
            .with_trace_id(vec![7; 16])
            .assert_count(60);
    });

    server.stop().await.expect("Failed to stop server");
}

#[tokio::test]
async fn test_single_span_stream_is_acknowledged_per_span() {
    init_tracing();

    let mut server = ObserverServer::builder()
        .serve()
        .await
        .expect("Failed to start server");
    let mut client = connect(&server).await;

    let spans = vec![span("first"), span("second"), span("third")];
    let mut acks = client
        .record_span(tokio_stream::iter(spans))
        .await
        .expect("stream should be accepted")
        .into_inner();

    let mut seen = Vec::new();
    while let Some(ack) = acks.message().await.expect("ack stream failed") {
        seen.push(ack.messages_seen);
    }
    assert_eq!(seen, vec![1, 2, 3]);

    server.with_spans(|snapshot| {
        snapshot.expect_span_with_name("second").assert_exists();
        snapshot.expect_span().assert_count(3);
    });

    server.stop().await.expect("Failed to stop server");
}

#[tokio::test]
async fn test_transient_failure_rejects_first_stream_until_restart() {
    init_tracing();

    let mut server = ObserverServer::builder()
        .variant(Variant::TransientFailure)
        .serve()
        .await
        .expect("Failed to start server");

    let status = send_batches(connect(&server).await, batches("t", &[2]))
        .await
        .expect_err("first stream should be rejected");
    assert_eq!(status.code(), tonic::Code::PermissionDenied);
    assert_eq!(
        Rejection::from_status(&status),
        Some(Rejection::PermissionDenied)
    );
    assert_eq!(server.seen_count(), 0);

    send_batches(connect(&server).await, batches("t", &[2]))
        .await
        .expect("second stream should be accepted");
    server
        .wait_for_spans(2, Duration::from_secs(5))
        .await
        .expect("spans from the retried stream should arrive");

    let endpoint = server.endpoint();
    server.restart().await.expect("Failed to restart server");
    assert_eq!(server.endpoint(), endpoint);
    assert_eq!(server.seen_count(), 0);

    let status = send_batches(connect(&server).await, batches("r", &[1]))
        .await
        .expect_err("first stream after restart should be rejected again");
    assert_eq!(status.code(), tonic::Code::PermissionDenied);

    send_batches(connect(&server).await, batches("r", &[1]))
        .await
        .expect("retry after restart should be accepted");

    server.stop().await.expect("Failed to stop server");
}

#[tokio::test]
async fn test_unsupported_rejects_every_stream() {
    init_tracing();

    let mut server = ObserverServer::builder()
        .variant(Variant::Unsupported)
        .serve()
        .await
        .expect("Failed to start server");
    let client = connect(&server).await;

    for _ in 0..3 {
        let status = send_batches(client.clone(), batches("u", &[1, 1]))
            .await
            .expect_err("stream should be rejected");
        assert_eq!(status.code(), tonic::Code::Unimplemented);
        assert!(
            !Rejection::from_status(&status)
                .expect("known rejection")
                .is_retryable()
        );
    }

    tokio::time::timeout(Duration::from_secs(1), server.wait_for_first_notice())
        .await
        .expect("wait_for_first_notice should not deadlock");
    assert_eq!(server.seen_count(), 0);
    assert_eq!(server.stream_count(), 0);

    server.stop().await.expect("Failed to stop server");
}

#[tokio::test]
async fn test_client_retry_loop_against_each_variant() {
    init_tracing();

    // A minimal reconnecting client: retry retryable rejections, give up on permanent ones.
    async fn export_with_retry(server: &ObserverServer) -> (usize, Option<tonic::Code>) {
        for attempt in 1..=5 {
            match send_batches(connect(server).await, batches("x", &[1])).await {
                Ok(_) => return (attempt, None),
                Err(status) => match Rejection::from_status(&status) {
                    Some(rejection) if rejection.is_retryable() => continue,
                    _ => return (attempt, Some(status.code())),
                },
            }
        }
        (5, None)
    }

    let cases = [
        (Variant::Normal, 1, None),
        (Variant::TransientFailure, 2, None),
        (Variant::Unsupported, 1, Some(tonic::Code::Unimplemented)),
    ];
    for (variant, expected_attempts, expected_failure) in cases {
        let mut server = ObserverServer::builder()
            .variant(variant)
            .serve()
            .await
            .expect("Failed to start server");

        let (attempts, failure) = export_with_retry(&server).await;
        assert_eq!(attempts, expected_attempts, "variant {variant}");
        assert_eq!(failure, expected_failure, "variant {variant}");

        server.stop().await.expect("Failed to stop server");
    }
}

#[tokio::test]
async fn test_start_waits_for_a_port_released_within_the_window() {
    init_tracing();

    let holder = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to hold port");
    let port = holder.local_addr().expect("holder address").port();

    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(holder);
    });

    let mut server = ObserverServer::builder()
        .port(port)
        .bind_retry_delay(Duration::from_millis(50))
        .build()
        .expect("valid configuration");
    server
        .start()
        .await
        .expect("start should succeed once the port frees");
    server.run().await.expect("Failed to run server");
    assert_eq!(server.local_addr().map(|addr| addr.port()), Some(port));

    release.await.expect("release task panicked");
    server.stop().await.expect("Failed to stop server");
}

#[tokio::test]
async fn test_start_fails_after_six_attempts_on_a_held_port() {
    init_tracing();

    let holder = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to hold port");
    let port = holder.local_addr().expect("holder address").port();

    let mut server = ObserverServer::new(port, Variant::Normal);
    match server.start().await {
        Err(ObserverError::BindError { addr, attempts, .. }) => {
            assert_eq!(addr.port(), port);
            assert_eq!(attempts, 6);
        }
        other => panic!("Expected BindError, got {other:?}"),
    }
    assert_eq!(server.state(), LifecycleState::Stopped);

    drop(holder);
}

#[tokio::test]
async fn test_wait_for_spans_timeout_returns_error() {
    init_tracing();

    let mut server = ObserverServer::builder()
        .serve()
        .await
        .expect("Failed to start server");

    let result = server.wait_for_spans(1, Duration::from_millis(100)).await;
    match result {
        Err(ObserverError::WaitTimeout(duration)) => {
            assert_eq!(duration, Duration::from_millis(100));
        }
        _ => panic!("Expected WaitTimeout error"),
    }

    server.stop().await.expect("Failed to stop server");
}

#[tokio::test]
async fn test_wait_until_with_predicate() {
    init_tracing();

    let mut server = ObserverServer::builder()
        .serve()
        .await
        .expect("Failed to start server");
    let client = connect(&server).await;

    let send_task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let checkout = SpanBatch::new([Span {
            name: "POST /checkout".to_string(),
            kind: SpanKind::Server as i32,
            ..Default::default()
        }]);
        send_batches(client, vec![checkout]).await
    });

    server
        .wait_until(
            |snapshot| {
                snapshot
                    .expect_span_with_name("POST /checkout")
                    .with_kind(SpanKind::Server)
                    .count()
                    >= 1
            },
            Duration::from_secs(5),
        )
        .await
        .expect("Should find matching span before timeout");

    send_task
        .await
        .expect("send task panicked")
        .expect("stream should be accepted");
    server.stop().await.expect("Failed to stop server");
}

#[tokio::test]
async fn test_spans_remain_readable_after_stop() {
    init_tracing();

    let mut server = ObserverServer::builder()
        .serve()
        .await
        .expect("Failed to start server");
    send_batches(connect(&server).await, batches("kept", &[2]))
        .await
        .expect("stream should be accepted");
    server
        .wait_for_spans(2, Duration::from_secs(5))
        .await
        .expect("spans should arrive");

    server.stop().await.expect("Failed to stop server");
    assert_eq!(server.seen_count(), 2);
    server.with_spans(|snapshot| {
        snapshot.expect_span_with_name("kept-0").assert_exists();
        snapshot.expect_span_with_name("kept-1").assert_exists();
    });
}

#[tokio::test]
async fn test_stop_with_an_open_stream_is_bounded_and_keeps_recording() {
    init_tracing();

    let join_timeout = Duration::from_millis(200);
    let mut server = ObserverServer::builder()
        .join_timeout(join_timeout)
        .serve()
        .await
        .expect("Failed to start server");
    let OpenStream {
        _client,
        tx,
        mut acks,
    } = open_stream(&server).await;

    tx.send(SpanBatch::new([span("before-stop")]))
        .await
        .expect("stream should be open");
    server
        .wait_for_spans(1, Duration::from_secs(5))
        .await
        .expect("first span should arrive");

    let started = Instant::now();
    server.stop().await.expect("Failed to stop server");
    assert!(started.elapsed() < join_timeout + Duration::from_secs(1));
    assert_eq!(server.state(), LifecycleState::Stopped);

    // The accepted stream outlives the listener.
    tx.send(SpanBatch::new([span("after-stop")]))
        .await
        .expect("accepted stream should still be open");
    drop(tx);
    server
        .wait_for_spans(2, Duration::from_secs(5))
        .await
        .expect("in-flight stream should keep recording after stop");

    let mut last = 0;
    while let Some(ack) = acks.message().await.expect("ack stream failed") {
        last = ack.messages_seen;
    }
    assert_eq!(last, 2);
    server.with_spans(|snapshot| {
        snapshot.expect_span_with_name("after-stop").assert_exists();
    });
}

#[tokio::test]
async fn test_interrupted_stop_is_observable_and_can_be_finished() {
    init_tracing();

    let mut server = ObserverServer::builder()
        .serve()
        .await
        .expect("Failed to start server");
    let stream = open_stream(&server).await;
    stream
        .tx
        .send(SpanBatch::new([span("held")]))
        .await
        .expect("stream should be open");
    server
        .wait_for_spans(1, Duration::from_secs(5))
        .await
        .expect("span should arrive");

    // The open stream keeps the serve loop joining well past this deadline.
    let interrupted = tokio::time::timeout(Duration::from_millis(50), server.stop()).await;
    assert!(interrupted.is_err());
    assert_eq!(server.state(), LifecycleState::Stopping);

    match server.start().await {
        Err(ObserverError::InvalidState { operation, state }) => {
            assert_eq!(operation, "start");
            assert_eq!(state, LifecycleState::Stopping);
        }
        other => panic!("Expected InvalidState, got {other:?}"),
    }

    server.stop().await.expect("Failed to finish stopping");
    assert_eq!(server.state(), LifecycleState::Stopped);
    assert!(server.endpoint().is_none());

    drop(stream);
}
