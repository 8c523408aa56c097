//! Benchmarks for routing and the pipelined round trip.
//!
//! Run benchmarks:
//! ```bash
//! cargo bench --bench routing_benchmark
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use muxplex::cluster::{hash_slot, slot_of_keys};
use muxplex::proto::codec::{Decoder, Encoder};
use muxplex::{command, Frame, Multiplexer, MultiplexerBuilder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

/// Benchmark: slot calculation with and without hash tags.
fn bench_hash_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_slot");
    for key in ["user:1000", "{user1000}.following", "a-much-longer-key-without-any-tag:42"] {
        group.bench_with_input(BenchmarkId::from_parameter(key), key, |b, key| {
            b.iter(|| hash_slot(black_box(key.as_bytes())));
        });
    }
    group.bench_function("slot_of_keys_tagged", |b| {
        let keys: Vec<String> = (0..16).map(|i| format!("{{order}}:{}", i)).collect();
        b.iter(|| slot_of_keys(keys.iter().map(|k| k.as_bytes())));
    });
    group.finish();
}

/// Benchmark: encoding a pipelined batch and decoding its replies.
fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    for batch in [1usize, 16, 256] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("encode_set", batch), &batch, |b, &batch| {
            let frame = command::set("bench:key", vec![b'x'; 64]).into_frame();
            let mut encoder = Encoder::new();
            b.iter(|| {
                for _ in 0..batch {
                    encoder.encode(black_box(&frame));
                }
                encoder.take()
            });
        });
        group.bench_with_input(BenchmarkId::new("decode_ok", batch), &batch, |b, &batch| {
            let wire = b"+OK\r\n".repeat(batch);
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.append(black_box(&wire));
                let mut n = 0;
                while let Ok(Some(_)) = decoder.decode() {
                    n += 1;
                }
                n
            });
        });
    }
    group.finish();
}

/// Starts a server that answers every command with PONG.
async fn pong_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut decoder = Decoder::new();
                let mut encoder = Encoder::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    decoder.append(&buf[..n]);
                    while let Ok(Some(_)) = decoder.decode() {
                        encoder.encode(&Frame::simple("PONG"));
                    }
                    if socket.write_all(&encoder.take()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr.to_string()
}

/// Benchmark: concurrent callers multiplexed over one connection.
fn bench_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mux: Multiplexer = rt.block_on(async {
        let endpoint = pong_server().await;
        MultiplexerBuilder::new()
            .endpoint(endpoint)
            .connect()
            .await
            .expect("failed to connect")
    });

    let mut group = c.benchmark_group("round_trip");
    for callers in [1usize, 8, 64] {
        group.throughput(Throughput::Elements(callers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(callers), &callers, |b, &callers| {
            b.to_async(&rt).iter(|| {
                let mux = mux.clone();
                async move {
                    let calls = (0..callers).map(|_| mux.execute(command::ping()));
                    for reply in futures::future::join_all(calls).await {
                        reply.expect("PING failed");
                    }
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_hash_slot, bench_codec, bench_round_trip);
criterion_main!(benches);
