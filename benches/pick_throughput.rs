//! Balancer pick throughput benchmark

use meshlink::balancer::{Balancer, BalancerGroup, RandomBalancer, Strategy, SwrrBalancer};
use meshlink::node::Node;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn nodes(count: usize) -> Vec<Node> {
    (0..count)
        .map(|i| {
            Node::new(format!("user-{}", i), "user", format!("10.0.0.{}:9000", i % 250))
                .with_weight((i % 5 + 1) as i64)
        })
        .collect()
}

fn benchmark_pickers(c: &mut Criterion) {
    let mut group = c.benchmark_group("picker_get");
    group.throughput(Throughput::Elements(1));

    for size in [3usize, 32, 256] {
        let mut swrr = SwrrBalancer::new();
        let mut random = RandomBalancer::new();
        for node in nodes(size) {
            swrr.add(node.clone());
            random.add(node);
        }

        group.bench_with_input(BenchmarkId::new("swrr", size), &size, |b, _| {
            b.iter(|| black_box(swrr.get().unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("random", size), &size, |b, _| {
            b.iter(|| black_box(random.get().unwrap()));
        });
    }

    group.finish();
}

fn benchmark_group_pick(c: &mut Criterion) {
    let group = BalancerGroup::new();
    for node in nodes(32) {
        group.add(node);
    }

    c.bench_function("balancer_group_pick_swrr", |b| {
        b.iter(|| black_box(group.pick("user", Strategy::Swrr).unwrap()));
    });
}

criterion_group!(benches, benchmark_pickers, benchmark_group_pick);

criterion_main!(benches);
