use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use hindsight::agent::{DataManager, TriggerManager};
use hindsight::util::priority_tree::PriorityTree;
use hindsight::{BufferId, TraceId};

const TRACES: u64 = 4_096;
const BUFFER_SIZE: usize = 32 * 1024;

/// Spread keys across the range the way random trace ids are.
fn scatter(i: u64) -> u64 {
    i.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn filled_tree() -> PriorityTree {
    let mut tree = PriorityTree::new();
    for i in 0..TRACES {
        tree.insert(scatter(i));
    }
    tree
}

/// Untriggered cache of `TRACES` traces with two buffers each.
fn populated_manager() -> TriggerManager {
    let mut dm = DataManager::new();
    dm.set_now(Instant::now());
    for i in 1..=TRACES {
        let b = (2 * i) as BufferId;
        dm.add_buffers(scatter(i), vec![b, b + 1])
            .expect("add buffers");
    }
    TriggerManager::new(dm, BUFFER_SIZE, 0.0)
}

fn bench_priority_tree(c: &mut Criterion) {
    c.bench_function("priority_tree/drain_pop_min", |b| {
        b.iter_batched(
            filled_tree,
            |mut tree| {
                while let Some(key) = tree.pop_min() {
                    black_box(key);
                }
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("priority_tree/drain_pop_near_max", |b| {
        b.iter_batched(
            filled_tree,
            |mut tree| {
                while let Some(key) = tree.pop_near_max() {
                    black_box(key);
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_trigger_and_report(c: &mut Criterion) {
    c.bench_function("trigger_manager/trigger_then_report_all", |b| {
        b.iter_batched(
            populated_manager,
            |mut tm| {
                for i in 1..=TRACES {
                    let trace_id: TraceId = scatter(i);
                    let queue_id = (i % 4) as i32;
                    tm.trigger_remote(queue_id, trace_id, &[trace_id])
                        .expect("trigger");
                }
                let mut reported = 0;
                loop {
                    let batch = tm.next_batch_to_report().expect("report");
                    if batch.is_empty() {
                        break;
                    }
                    reported += batch.len();
                }
                black_box(reported)
            },
            BatchSize::LargeInput,
        )
    });

    c.bench_function("data_manager/evict_untriggered_to_half", |b| {
        b.iter_batched(
            populated_manager,
            |mut tm| {
                let target = TRACES as i64;
                let evicted = tm
                    .data_manager_mut()
                    .evict_to_capacity(target)
                    .expect("evict");
                black_box(evicted.len())
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_priority_tree(c);
    bench_trigger_and_report(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
