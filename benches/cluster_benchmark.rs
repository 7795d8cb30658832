//! Benchmarks for cluster routing.
//!
//! The slot, routing and topology groups run in memory. The `cluster_*`
//! groups need a real Redis Cluster on localhost and are skipped when none
//! answers.
//!
//! Setup with Docker:
//! ```bash
//! docker run -d --name redis-cluster \
//!   -p 7000-7005:7000-7005 \
//!   grokzen/redis-cluster:latest
//! ```
//!
//! Run benchmarks:
//! ```bash
//! cargo bench --bench cluster_benchmark
//! ```

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use slotwise::cluster::redirect::{classify, decide, PendingRetry};
use slotwise::cluster::{
    NodeEndpoint, NodeRole, RetryPolicy, SlotRange, Topology, TopologyMap, SLOT_COUNT,
};
use slotwise::{key_slot, validate_same_slot, ClusterClient, Frame};
use tokio::runtime::Runtime;

/// Connects to the local cluster, or `None` when it is not running.
fn create_client(rt: &Runtime) -> Option<ClusterClient> {
    rt.block_on(async {
        match ClusterClient::connect("127.0.0.1:7000,127.0.0.1:7001,127.0.0.1:7002").await {
            Ok(client) => Some(client),
            Err(e) => {
                eprintln!("skipping cluster benchmarks: {}", e);
                None
            }
        }
    })
}

/// Six primaries with one replica each, evenly split.
fn six_shard_topology() -> Topology {
    let share = SLOT_COUNT / 6;
    let ranges = (0..6u16)
        .map(|i| SlotRange {
            start: i * share,
            end: if i == 5 { SLOT_COUNT - 1 } else { (i + 1) * share - 1 },
            primary: NodeEndpoint::new(format!("p{}", i), "10.0.0.1", 7000 + i, NodeRole::Primary),
            replicas: vec![NodeEndpoint::new(
                format!("r{}", i),
                "10.0.0.2",
                7100 + i,
                NodeRole::Replica,
            )],
        })
        .collect();
    Topology::from_ranges(ranges).expect("valid ranges")
}

/// Benchmark: Slot calculation.
fn bench_slot_calculation(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_calculation");

    // Short key
    group.bench_function("short_key", |b| {
        b.iter(|| key_slot(black_box("key")));
    });

    // Long key
    group.bench_function("long_key", |b| {
        let key = "a".repeat(100);
        b.iter(|| key_slot(black_box(&key)));
    });

    // Key with hash tag
    group.bench_function("hash_tag", |b| {
        b.iter(|| key_slot(black_box("user:{12345}:profile")));
    });

    group.finish();
}

/// Benchmark: Multi-key validation.
fn bench_validate_same_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate_same_slot");

    for count in [2usize, 5, 10] {
        let keys: Vec<String> = (0..count).map(|i| format!("{{tag}}:key{}", i)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(count), &keys, |b, keys| {
            b.iter(|| validate_same_slot(black_box(keys)));
        });
    }

    group.finish();
}

/// Benchmark: Routing through the shared map.
fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("route");
    let map = TopologyMap::new();
    map.replace(six_shard_topology());

    group.bench_function("primary", |b| {
        b.iter(|| map.route(black_box(key_slot("user:1000")), false));
    });
    group.bench_function("replica", |b| {
        b.iter(|| map.route(black_box(key_slot("user:1000")), true));
    });

    let primary = NodeEndpoint::new("p0", "10.0.0.1", 7000, NodeRole::Primary);
    group.bench_function("mark_moved", |b| {
        b.iter(|| map.mark_moved(black_box(9000), &primary));
    });

    group.finish();
}

/// Benchmark: Parsing a CLUSTER SLOTS reply.
fn bench_topology_parse(c: &mut Criterion) {
    let ranges = six_shard_topology().ranges();
    let node = |n: &NodeEndpoint| {
        Frame::Array(vec![
            Frame::bulk(n.host.clone()),
            Frame::Integer(n.port as i64),
            Frame::bulk(n.id.as_str().to_string()),
        ])
    };
    let reply = Frame::Array(
        ranges
            .iter()
            .map(|r| {
                let mut entry = vec![
                    Frame::Integer(r.start as i64),
                    Frame::Integer(r.end as i64),
                    node(&r.primary),
                ];
                entry.extend(r.replicas.iter().map(node));
                Frame::Array(entry)
            })
            .collect(),
    );

    c.bench_function("from_cluster_slots", |b| {
        b.iter(|| Topology::from_cluster_slots(black_box(reply.clone())));
    });
}

/// Benchmark: Redirect decisions.
fn bench_decide(c: &mut Criterion) {
    let policy = RetryPolicy::default();
    let pending = PendingRetry::new(Some(14687), None);

    c.bench_function("decide_moved", |b| {
        b.iter(|| {
            let outcome = classify(Ok(Frame::error("MOVED 14687 10.0.0.2:7002")));
            decide(black_box(&pending), outcome, &policy)
        });
    });
}

/// Benchmark: SET and GET with different value sizes.
fn bench_cluster_set_get(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let Some(client) = create_client(&rt) else {
        return;
    };
    let mut group = c.benchmark_group("cluster_set_get");

    for size in [64usize, 1024, 16384] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let value = Bytes::from(vec![b'x'; size]);
            let key = format!("bench:set:{}", size);

            b.to_async(&rt).iter(|| async {
                client
                    .set(black_box(key.clone()), black_box(value.clone()))
                    .await
                    .expect("SET failed");
                client.get(black_box(key.clone())).await.expect("GET failed");
            });
        });
    }

    group.finish();
}

/// Benchmark: Concurrent operations sharing one client.
fn bench_cluster_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let Some(client) = create_client(&rt) else {
        return;
    };
    let mut group = c.benchmark_group("cluster_concurrent");

    for num_tasks in [1usize, 10, 50] {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_tasks),
            &num_tasks,
            |b, &num_tasks| {
                b.to_async(&rt).iter(|| async {
                    let handles: Vec<_> = (0..num_tasks)
                        .map(|i| {
                            let client = client.clone();
                            tokio::spawn(async move {
                                let key = format!("bench:concurrent:{}", i);
                                client.set(key.clone(), "value").await?;
                                client.get(key).await?;
                                Ok::<_, slotwise::Error>(())
                            })
                        })
                        .collect();

                    for handle in handles {
                        handle.await.expect("task panicked").expect("operation failed");
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_slot_calculation,
    bench_validate_same_slot,
    bench_route,
    bench_topology_parse,
    bench_decide,
    bench_cluster_set_get,
    bench_cluster_concurrent
);

criterion_main!(benches);
