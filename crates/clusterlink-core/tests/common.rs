//! In-process fake cluster for integration tests: one KV node speaking the
//! binary protocol and one HTTP node serving management and query requests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clusterlink_core::protocol::{Frame, Opcode, Status};
use clusterlink_core::topology::{BootstrapMode, TopologyConfig};
use clusterlink_core::CoreConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Routes test logs through the test harness. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// What the fake KV node does with a data request.
pub enum KvReply {
    Respond(Frame),
    Delay(Duration, Frame),
    Hang,
}

/// What the fake HTTP node sends back.
pub struct HttpReply {
    pub status: u16,
    pub chunks: Vec<String>,
    pub chunk_delay: Duration,
    /// Close the connection before the terminating chunk.
    pub truncate: bool,
}

impl HttpReply {
    pub fn ok(body: &str) -> Self {
        Self::with_status(200, body)
    }

    pub fn with_status(status: u16, body: &str) -> Self {
        Self {
            status,
            chunks: vec![body.to_string()],
            chunk_delay: Duration::ZERO,
            truncate: false,
        }
    }

    /// Splits `body` into `size`-byte chunks.
    pub fn chunked(body: &str, size: usize) -> Self {
        let chunks = body
            .as_bytes()
            .chunks(size)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect();
        Self {
            status: 200,
            chunks,
            chunk_delay: Duration::from_millis(1),
            truncate: false,
        }
    }
}

pub type KvHandler = Arc<dyn Fn(&Frame) -> KvReply + Send + Sync>;
pub type HttpHandler = Arc<dyn Fn(&str, &str) -> HttpReply + Send + Sync>;

/// A running fake cluster.
pub struct FakeCluster {
    pub kv_port: u16,
    pub http_port: u16,
    /// Data requests seen by the KV node (handshake and config excluded).
    pub kv_requests: Arc<AtomicUsize>,
    /// Requests seen by the HTTP node.
    pub http_requests: Arc<AtomicUsize>,
}

impl FakeCluster {
    pub async fn start(kv: KvHandler, http: HttpHandler) -> FakeCluster {
        let kv_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let kv_port = kv_listener.local_addr().unwrap().port();
        let http_port = http_listener.local_addr().unwrap().port();
        let config = Arc::new(cluster_config(kv_port, http_port));

        let kv_requests = Arc::new(AtomicUsize::new(0));
        let http_requests = Arc::new(AtomicUsize::new(0));

        tokio::spawn(serve_kv(kv_listener, kv, config.clone(), kv_requests.clone()));
        tokio::spawn(serve_http(http_listener, http, config, http_requests.clone()));

        FakeCluster {
            kv_port,
            http_port,
            kv_requests,
            http_requests,
        }
    }

    pub fn kv_requests(&self) -> usize {
        self.kv_requests.load(Ordering::SeqCst)
    }

    pub fn http_requests(&self) -> usize {
        self.http_requests.load(Ordering::SeqCst)
    }

    /// Agent config bootstrapping over the binary protocol with fast polls.
    pub fn config(&self) -> CoreConfig {
        CoreConfig {
            kv_seeds: vec![format!("127.0.0.1:{}", self.kv_port)],
            http_seeds: vec![format!("127.0.0.1:{}", self.http_port)],
            bucket: Some("default".to_string()),
            topology: TopologyConfig {
                bootstrap: BootstrapMode::Cccp,
                poll_interval_ms: 50,
                poll_timeout_ms: 500,
                ..TopologyConfig::default()
            },
            ..CoreConfig::default()
        }
    }
}

/// Terse cluster config for a single node at 127.0.0.1.
pub fn cluster_config(kv_port: u16, http_port: u16) -> String {
    serde_json::json!({
        "rev": 1,
        "name": "default",
        "nodesExt": [{
            "hostname": "$HOST",
            "services": {
                "kv": kv_port,
                "mgmt": http_port,
                "n1ql": http_port,
                "cbas": http_port,
            }
        }],
        "vBucketServerMap": {
            "serverList": [format!("127.0.0.1:{}", kv_port)],
            "vBucketMap": [[0], [0], [0], [0]],
        }
    })
    .to_string()
}

async fn serve_kv(
    listener: TcpListener,
    handler: KvHandler,
    config: Arc<String>,
    requests: Arc<AtomicUsize>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let (handler, config, requests) = (handler.clone(), config.clone(), requests.clone());
        tokio::spawn(async move {
            let (read_half, write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let writer = Arc::new(Mutex::new(write_half));
            while let Ok(request) = Frame::read_from(&mut reader).await {
                let Some(opcode) = request.opcode() else {
                    continue;
                };
                let reply = match opcode {
                    Opcode::SaslAuth | Opcode::SelectBucket => {
                        KvReply::Respond(Frame::response(opcode, Status::Success, request.opaque))
                    }
                    Opcode::GetClusterConfig => KvReply::Respond(
                        Frame::response(opcode, Status::Success, request.opaque)
                            .with_value(config.as_bytes().to_vec()),
                    ),
                    _ => {
                        requests.fetch_add(1, Ordering::SeqCst);
                        let mut reply = handler(&request);
                        // Responses always echo the request's opaque.
                        match &mut reply {
                            KvReply::Respond(frame) | KvReply::Delay(_, frame) => {
                                frame.opaque = request.opaque
                            }
                            KvReply::Hang => {}
                        }
                        reply
                    }
                };
                let writer = writer.clone();
                tokio::spawn(async move {
                    let frame = match reply {
                        KvReply::Respond(frame) => frame,
                        KvReply::Delay(delay, frame) => {
                            tokio::time::sleep(delay).await;
                            frame
                        }
                        KvReply::Hang => return,
                    };
                    let bytes = frame.to_bytes().unwrap();
                    let _ = writer.lock().await.write_all(&bytes).await;
                });
            }
        });
    }
}

async fn serve_http(
    listener: TcpListener,
    handler: HttpHandler,
    config: Arc<String>,
    requests: Arc<AtomicUsize>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let (handler, config, requests) = (handler.clone(), config.clone(), requests.clone());
        tokio::spawn(async move {
            let _ = handle_http(stream, handler, config, requests).await;
        });
    }
}

async fn handle_http(
    mut stream: TcpStream,
    handler: HttpHandler,
    config: Arc<String>,
    requests: Arc<AtomicUsize>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[head_end..]).into_owned();

    let reply = if path.starts_with("/pools/default") {
        HttpReply::ok(&config)
    } else {
        requests.fetch_add(1, Ordering::SeqCst);
        handler(&path, &body)
    };

    let head = format!(
        "HTTP/1.1 {} Fake\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
        reply.status
    );
    stream.write_all(head.as_bytes()).await?;
    for chunk in &reply.chunks {
        if !reply.chunk_delay.is_zero() {
            tokio::time::sleep(reply.chunk_delay).await;
        }
        stream
            .write_all(format!("{:x}\r\n{}\r\n", chunk.len(), chunk).as_bytes())
            .await?;
        stream.flush().await?;
    }
    if !reply.truncate {
        stream.write_all(b"0\r\n\r\n").await?;
    }
    stream.shutdown().await
}

/// KV handler answering every request with `Success` and `value`.
pub fn kv_value(value: &'static str) -> KvHandler {
    Arc::new(move |request: &Frame| {
        let opcode = request.opcode().unwrap_or(Opcode::Noop);
        KvReply::Respond(Frame::response(opcode, Status::Success, 0).with_value(value))
    })
}

/// HTTP handler that must not be reached.
pub fn no_http() -> HttpHandler {
    Arc::new(|path: &str, _body: &str| HttpReply::with_status(404, &format!("no route for {}", path)))
}
