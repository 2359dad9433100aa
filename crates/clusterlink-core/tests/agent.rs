//! End-to-end tests driving an [`Agent`] against the fake cluster.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use clusterlink_core::protocol::{Frame, Opcode, Status};
use clusterlink_core::{
    Agent, CoreError, Deadline, ErrorKind, HttpCommand, KvCommand, NoopTracer, OperationRequest,
    OperationResponse, PasswordAuthenticator, ServiceKind,
};
use common::{kv_value, no_http, FakeCluster, HttpReply, KvHandler, KvReply};
use tokio::sync::oneshot;
use tokio::time::Instant;

const ROWS_BODY: &str = r#"{"requestID":"r-1","signature":{"*":"*"},"results":[{"n":1},{"n":2,"s":"a,]}"},{"n":3}],"status":"success","metrics":{"resultCount":3}}"#;

async fn connect(cluster: &FakeCluster) -> Agent {
    common::init_tracing();
    let agent = Agent::connect(
        cluster.config(),
        Arc::new(PasswordAuthenticator::new("user", "secret")),
        Arc::new(NoopTracer),
    )
    .await
    .unwrap();
    agent.wait_until_ready(Duration::from_secs(5)).await.unwrap();
    agent
}

fn query(timeout: Duration) -> OperationRequest {
    OperationRequest::http(
        ServiceKind::Query,
        HttpCommand::post("/query/service", r#"{"statement":"SELECT n FROM t"}"#),
        Deadline::new(timeout),
    )
    .idempotent(true)
}

async fn wait_idle(agent: &Agent) {
    let started = Instant::now();
    while agent.pending_count() > 0 || agent.active_tasks() > 0 {
        assert!(started.elapsed() < Duration::from_secs(5), "operations did not drain");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn slow_kv(delay: Duration) -> KvHandler {
    Arc::new(move |request: &Frame| {
        let opcode = request.opcode().unwrap_or(Opcode::Noop);
        KvReply::Delay(delay, Frame::response(opcode, Status::Success, 0).with_value("late"))
    })
}

#[tokio::test]
async fn test_bootstrap_and_kv_get() {
    let cluster = FakeCluster::start(kv_value("hello"), no_http()).await;
    let agent = connect(&cluster).await;

    let snapshot = agent.topology().unwrap();
    assert_eq!(snapshot.bucket(), Some("default"));
    assert!(snapshot.offers(ServiceKind::Query));

    let response = agent
        .execute(OperationRequest::kv(
            KvCommand::get("airline_10"),
            Deadline::new(Duration::from_secs(2)),
        ))
        .await
        .unwrap()
        .into_kv()
        .unwrap();
    assert_eq!(response.status, Status::Success);
    assert_eq!(response.value, Bytes::from_static(b"hello"));
    assert_eq!(cluster.kv_requests(), 1);
    assert_eq!(agent.pool_stats().connections, 1);

    agent.close().await;
}

#[tokio::test]
async fn test_unoffered_service_rejected_synchronously() {
    let cluster = FakeCluster::start(kv_value("x"), no_http()).await;
    let agent = connect(&cluster).await;
    let search = OperationRequest::http(
        ServiceKind::Search,
        HttpCommand::get("/api/index"),
        Deadline::new(Duration::from_secs(1)),
    );
    let err = agent.dispatch(search, |_| panic!("callback must not run")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceNotAvailable);
    assert_eq!(agent.pending_count(), 0);
    agent.close().await;
}

#[tokio::test]
async fn test_expired_deadline_settles_without_io() {
    let cluster = FakeCluster::start(kv_value("x"), no_http()).await;
    let agent = connect(&cluster).await;
    let request = OperationRequest::kv(
        KvCommand::get("k"),
        Deadline::at(Instant::now() - Duration::from_millis(5)),
    );
    let err = agent.execute(request).await.unwrap_err();
    assert_eq!(err, CoreError::Timeout { attempts: 0 });
    assert_eq!(cluster.kv_requests(), 0);
    agent.close().await;
}

#[tokio::test]
async fn test_cancel_settles_once_and_late_response_is_orphaned() {
    let cluster = FakeCluster::start(slow_kv(Duration::from_millis(150)), no_http()).await;
    let agent = connect(&cluster).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let counter = calls.clone();
    let handle = agent
        .dispatch(
            OperationRequest::kv(KvCommand::get("k"), Deadline::new(Duration::from_secs(2))),
            move |result| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(result);
                }
            },
        )
        .unwrap();

    while cluster.kv_requests() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(handle.cancel());
    assert!(!handle.cancel());
    assert_eq!(rx.await.unwrap().unwrap_err(), CoreError::RequestCanceled);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(handle.is_settled());
    assert_eq!(agent.orphaned_responses(), 1);
    wait_idle(&agent).await;
    agent.close().await;
}

#[tokio::test]
async fn test_hung_server_times_out() {
    let hang: KvHandler = Arc::new(|_: &Frame| KvReply::Hang);
    let cluster = FakeCluster::start(hang, no_http()).await;
    let agent = connect(&cluster).await;

    let started = Instant::now();
    let err = agent
        .execute(OperationRequest::kv(
            KvCommand::get("k"),
            Deadline::new(Duration::from_millis(100)),
        ))
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::Timeout { attempts: 1 });
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_secs(2));
    wait_idle(&agent).await;
    agent.close().await;
}

#[tokio::test]
async fn test_query_rows_stream_in_order() {
    let http = Arc::new(|path: &str, body: &str| {
        assert_eq!(path, "/query/service");
        assert!(body.contains("SELECT"));
        HttpReply::chunked(ROWS_BODY, 7)
    });
    let cluster = FakeCluster::start(kv_value("x"), http).await;
    let agent = connect(&cluster).await;

    let mut rows = agent
        .execute(query(Duration::from_secs(2)))
        .await
        .unwrap()
        .into_rows()
        .unwrap();
    let mut seen = Vec::new();
    while let Some(row) = rows.next().await {
        seen.push(String::from_utf8(row.to_vec()).unwrap());
    }
    assert_eq!(seen, vec![r#"{"n":1}"#, r#"{"n":2,"s":"a,]}"}"#, r#"{"n":3}"#]);
    assert!(rows.err().is_none());
    assert!(rows.next().await.is_none());
    let meta = rows.metadata().unwrap();
    assert_eq!(meta.request_id.as_deref(), Some("r-1"));
    assert_eq!(meta.status.as_deref(), Some("success"));

    drop(rows);
    wait_idle(&agent).await;
    agent.close().await;
}

#[tokio::test]
async fn test_truncated_stream_reports_error() {
    let http = Arc::new(|_: &str, _: &str| {
        let cut = ROWS_BODY.find(r#"{"n":3}"#).unwrap();
        let mut reply = HttpReply::chunked(&ROWS_BODY[..cut], 16);
        reply.truncate = true;
        reply
    });
    let cluster = FakeCluster::start(kv_value("x"), http).await;
    let agent = connect(&cluster).await;

    let mut rows = agent
        .execute(query(Duration::from_secs(2)))
        .await
        .unwrap()
        .into_rows()
        .unwrap();
    let mut seen = Vec::new();
    while let Some(row) = rows.next().await {
        seen.push(String::from_utf8(row.to_vec()).unwrap());
    }
    assert_eq!(seen, vec![r#"{"n":1}"#, r#"{"n":2,"s":"a,]}"}"#]);
    assert!(rows.next().await.is_none());
    let err = rows.err().unwrap();
    assert!(
        matches!(err.kind(), ErrorKind::ProtocolFailure | ErrorKind::TransportFailure),
        "unexpected error {:?}",
        err
    );
    assert!(rows.metadata().is_none());
    wait_idle(&agent).await;
    agent.close().await;
}

#[tokio::test]
async fn test_dropping_reader_stops_producer() {
    let http = Arc::new(|_: &str, _: &str| {
        let mut reply = HttpReply::chunked(ROWS_BODY, 4);
        reply.chunk_delay = Duration::from_millis(20);
        reply
    });
    let cluster = FakeCluster::start(kv_value("x"), http).await;
    let agent = connect(&cluster).await;

    let mut rows = agent
        .execute(query(Duration::from_secs(10)))
        .await
        .unwrap()
        .into_rows()
        .unwrap();
    assert!(agent.active_tasks() >= 1);
    let _ = tokio::time::timeout(Duration::from_millis(50), rows.next()).await;
    drop(rows);
    wait_idle(&agent).await;
    agent.close().await;
}

#[tokio::test]
async fn test_temporary_failure_is_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let http = Arc::new(move |_: &str, _: &str| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            HttpReply::with_status(503, r#"{"errors":[{"code":1000,"msg":"busy"}]}"#)
        } else {
            HttpReply::ok(ROWS_BODY)
        }
    });
    let cluster = FakeCluster::start(kv_value("x"), http).await;
    let agent = connect(&cluster).await;

    let rows = agent
        .execute(query(Duration::from_secs(2)))
        .await
        .unwrap()
        .into_rows()
        .unwrap()
        .collect_rows()
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(cluster.http_requests(), 2);
    agent.close().await;
}

#[tokio::test]
async fn test_backoff_beyond_deadline_fails_fast() {
    let http = Arc::new(|_: &str, _: &str| HttpReply::with_status(503, "{}"));
    let cluster = FakeCluster::start(kv_value("x"), http).await;
    let mut config = cluster.config();
    config.retry.initial_backoff_ms = 400;
    config.retry.max_backoff_ms = 400;
    config.retry.jitter = false;
    let agent = Agent::connect(
        config,
        Arc::new(PasswordAuthenticator::new("user", "secret")),
        Arc::new(NoopTracer),
    )
    .await
    .unwrap();
    agent.wait_until_ready(Duration::from_secs(5)).await.unwrap();

    let started = Instant::now();
    let err = agent
        .execute(query(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::Timeout { attempts: 1 });
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(cluster.http_requests(), 1);
    agent.close().await;
}

#[tokio::test]
async fn test_server_error_is_not_retried() {
    let http = Arc::new(|_: &str, _: &str| {
        HttpReply::with_status(400, r#"{"errors":[{"code":3000,"msg":"syntax error"}]}"#)
    });
    let cluster = FakeCluster::start(kv_value("x"), http).await;
    let agent = connect(&cluster).await;
    let err = agent.execute(query(Duration::from_secs(2))).await.unwrap_err();
    assert_eq!(
        err,
        CoreError::ServiceError {
            status: 400,
            code: Some(3000),
            message: "syntax error".to_string(),
        }
    );
    assert_eq!(cluster.http_requests(), 1);
    agent.close().await;
}

#[tokio::test]
async fn test_close_settles_pending_with_shutdown() {
    let hang: KvHandler = Arc::new(|_: &Frame| KvReply::Hang);
    let cluster = FakeCluster::start(hang, no_http()).await;
    let agent = connect(&cluster).await;

    let results = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5 {
        let results = results.clone();
        agent
            .dispatch(
                OperationRequest::kv(
                    KvCommand::get(format!("k{}", i)),
                    Deadline::new(Duration::from_secs(10)),
                ),
                move |result| results.lock().unwrap().push(result.map(|_| ())),
            )
            .unwrap();
    }
    while cluster.kv_requests() < 5 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    agent.close().await;

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r == &Err(CoreError::Shutdown)));
    assert_eq!(agent.active_tasks(), 0);
    assert_eq!(agent.pool_stats().connections, 0);

    let err = agent
        .dispatch(
            OperationRequest::kv(KvCommand::get("late"), Deadline::new(Duration::from_secs(1))),
            |_| panic!("callback must not run"),
        )
        .unwrap_err();
    assert_eq!(err, CoreError::Shutdown);
    // A second close is a no-op.
    agent.close().await;
}

#[tokio::test]
async fn test_no_task_leaks_under_mixed_outcomes() {
    let cluster = FakeCluster::start(slow_kv(Duration::from_millis(10)), no_http()).await;
    let agent = connect(&cluster).await;

    let settled = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for i in 0..60u64 {
        let settled = settled.clone();
        let timeout = Duration::from_millis(if i % 3 == 0 { 5 } else { 500 });
        let handle = agent
            .dispatch(
                OperationRequest::kv(KvCommand::get(format!("key-{}", i)), Deadline::new(timeout)),
                move |_result: clusterlink_core::Result<OperationResponse>| {
                    settled.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
        handles.push(handle);
    }
    for handle in handles.iter().step_by(4) {
        handle.cancel();
    }
    wait_idle(&agent).await;
    assert_eq!(settled.load(Ordering::SeqCst), 60);
    assert!(handles.iter().all(|h| h.is_settled()));
    agent.close().await;
}
