use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use opsdeck_core::model::task::Task;
use opsdeck_triage::{classify, triage_bucket};

const BOARD_SIZES: [usize; 3] = [100, 1_000, 10_000];

const STATUSES: [&str; 5] = ["inbox", "in_progress", "review", "done", "on_hold"];

fn synthetic_board(size: usize) -> Vec<Task> {
    (0..size)
        .map(|n| {
            let mut task = Task::new(format!("t-{n}"), STATUSES[n % STATUSES.len()]);
            task.is_blocked = n % 7 == 0;
            task.approvals_pending_count = u32::from(n % 3 == 0);
            if n % 11 == 0 {
                task.blocked_by_task_ids = vec![format!("t-{}", n / 2)];
            }
            task
        })
        .collect()
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("triage.classify");

    for size in BOARD_SIZES {
        let board = synthetic_board(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("full", size), &board, |b, board| {
            b.iter(|| black_box(classify(board)))
        });

        group.bench_with_input(BenchmarkId::new("bucket_only", size), &board, |b, board| {
            b.iter(|| {
                black_box(board.iter().filter_map(triage_bucket).count())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_classify);
criterion_main!(benches);
