use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

use skerry_graph::EntityGraph;
use skerry_types::Entity;

fn build_graph(bodies: u32, edges_per_body: u32) -> EntityGraph {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut graph = EntityGraph::new();

    let nodes: Vec<_> = (0..bodies)
        .map(|i| graph.insert_node(Entity::from_parts(i, 0), i % 16 == 0))
        .collect();

    let mut next = bodies;
    for _ in 0..bodies * edges_per_body / 2 {
        let a = nodes[rng.gen_range(0..nodes.len())];
        let b = nodes[rng.gen_range(0..nodes.len())];
        if a != b {
            graph
                .insert_edge(Entity::from_parts(next, 0), a, b)
                .unwrap();
            next += 1;
        }
    }
    graph
}

fn bench_connected_components(c: &mut Criterion) {
    let mut group = c.benchmark_group("connected_components");
    for bodies in [128u32, 1024, 4096] {
        let graph = build_graph(bodies, 3);
        group.bench_with_input(BenchmarkId::from_parameter(bodies), &graph, |b, graph| {
            b.iter(|| graph.connected_components());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_connected_components);
criterion_main!(benches);
