//! Channel benchmark suite.
//!
//! Benchmarks the hot paths of a bridge:
//! - Identity codec: create and parse
//! - Frame codec: encode and decode of a request
//! - Call round trip over an in-memory port pair, sequential and concurrent
//!
//! Run with: cargo bench --bench channel_roundtrip
//! Results saved to: target/criterion/

use std::hint::black_box;
use std::sync::Arc;

use async_trait::async_trait;
use context_bridge::transport::ExtensionPort;
use context_bridge::{
    BridgeConfig, CallContext, Error, EventSource, Frame, Peer, Protocol, RequestId, Result,
    ServerChannel, create_identity, parse_identity,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use futures_util::future::join_all;
use serde_json::{Value, json};
use tokio::runtime::Runtime;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const CONCURRENT_CALLS: &[usize] = &[1, 10, 50];

// ============================================================================
// Fixtures
// ============================================================================

struct Echo;

#[async_trait]
impl ServerChannel for Echo {
    async fn call(&self, _ctx: &CallContext, _command: &str, arg: Value) -> Result<Value> {
        Ok(arg)
    }

    fn listen(&self, _ctx: &CallContext, event: &str, _arg: Value) -> Result<EventSource> {
        Err(Error::unknown_event("echo", event))
    }
}

/// Connects a client to a server exposing `echo`.
async fn connected_pair() -> (Peer, Peer) {
    let (client_port, server_port) = ExtensionPort::pair("background", None);
    let server = tokio::spawn(Peer::accept(
        Protocol::new(server_port),
        BridgeConfig::default(),
    ));
    let client = Peer::connect(
        Protocol::new(client_port),
        "documentId:7:42:0",
        BridgeConfig::default(),
    );
    let server = server.await.expect("join").expect("handshake");
    server.register_channel("echo", Arc::new(Echo));
    (client, server)
}

// ============================================================================
// Benchmark: Codecs
// ============================================================================

fn bench_identity_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity");

    group.bench_function("create", |b| {
        b.iter(|| create_identity(black_box("documentId"), Some(7), Some(42), Some(0)));
    });
    group.bench_function("parse", |b| {
        b.iter(|| parse_identity(black_box("documentId:7:42:0")));
    });

    group.finish();
}

fn bench_frame_codec(c: &mut Criterion) {
    let frame = Frame::Request {
        id: RequestId::new(1),
        channel: "storage".into(),
        command: "get".into(),
        arg: json!({ "key": "theme", "area": "local" }),
    };
    let encoded = frame.encode().expect("encode");

    let mut group = c.benchmark_group("frame");
    group.bench_function("encode", |b| {
        b.iter(|| black_box(&frame).encode());
    });
    group.bench_function("decode", |b| {
        b.iter(|| Frame::decode(black_box(&encoded)));
    });
    group.finish();
}

// ============================================================================
// Benchmark: Round Trips
// ============================================================================

fn bench_call_roundtrip(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (client, _server) = rt.block_on(connected_pair());
    let echo = client.channel("echo");

    let mut group = c.benchmark_group("call_roundtrip");

    for &count in CONCURRENT_CALLS {
        group.bench_with_input(BenchmarkId::new("concurrent", count), &count, |b, &n| {
            b.to_async(&rt).iter(|| async {
                let calls = (0..n).map(|i| echo.call("echo", i));
                for result in join_all(calls).await {
                    black_box(result.expect("echo"));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_identity_codec,
    bench_frame_codec,
    bench_call_roundtrip
);
criterion_main!(benches);
