use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use kyrokv::{CompactionPolicy, GuardConfig, Node, SerializationGuard};

fn chat_list(len: i64) -> Node {
    Node::array(
        (0..len)
            .map(|i| {
                Node::object([
                    ("id", Node::from(i)),
                    ("name", Node::from(format!("chat {i}"))),
                    ("avatar", Node::from(format!("data:image/png;base64,{}", "Q".repeat(512)))),
                    ("unread", Node::from(i % 7)),
                ])
            })
            .collect(),
    )
}

/// A tree where every object also points back at the root.
fn cyclic_tree(width: i64) -> Node {
    let root = Node::object([("name", Node::from("root"))]);
    if let Some(fields) = root.object_handle() {
        let mut fields = fields.write();
        for i in 0..width {
            let child = Node::object([("index", Node::from(i)), ("root", root.clone())]);
            fields.insert(format!("child_{i}"), child);
        }
    }
    root
}

fn bench_sanitize_arrays(c: &mut Criterion) {
    let guard = SerializationGuard::new(GuardConfig::default().with_policy(
        "list",
        CompactionPolicy {
            max_bytes: 64 * 1024,
            ..CompactionPolicy::default()
        },
    ));

    let mut group = c.benchmark_group("guard/array");
    for len in [50_i64, 500, 2_000] {
        let node = chat_list(len);
        group.throughput(Throughput::Elements(len.unsigned_abs()));
        group.bench_with_input(BenchmarkId::from_parameter(len), &node, |b, node| {
            b.iter(|| guard.sanitize("list", black_box(node)));
        });
    }
    group.finish();
}

fn bench_sanitize_cycles(c: &mut Criterion) {
    let guard = SerializationGuard::default();
    let node = cyclic_tree(256);

    c.bench_function("guard/cyclic_256", |b| {
        b.iter(|| guard.sanitize("settings", black_box(&node)));
    });
}

criterion_group!(benches, bench_sanitize_arrays, bench_sanitize_cycles);
criterion_main!(benches);
