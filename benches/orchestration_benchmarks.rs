use criterion::{black_box, criterion_group, criterion_main, Criterion};
use exporter_core::orchestration::{BoundedParallelRunner, RunDirectoryPattern, TaskGraph, TaskMetrics};

fn benchmark_pattern_compile(c: &mut Criterion) {
    c.bench_function("run_pattern_compile", |b| {
        b.iter(|| RunDirectoryPattern::compile(black_box("%Y_%m_%d_%H_%M_%S")))
    });
}

fn benchmark_pattern_match(c: &mut Criterion) {
    let pattern = RunDirectoryPattern::compile("%Y_%m_%d_%H_%M_%S").unwrap();
    c.bench_function("run_pattern_match", |b| {
        b.iter(|| pattern.is_match(black_box("2024_03_09_17_45_01")))
    });
}

fn benchmark_graph_execution(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("linear_graph_14_steps", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let mut builder = TaskGraph::<u64>::builder();
                let names: Vec<String> = (0..14).map(|i| format!("step_{i}")).collect();
                for (i, name) in names.iter().enumerate() {
                    let deps: Vec<&str> = if i == 0 { vec![] } else { vec![names[i - 1].as_str()] };
                    builder = builder.step(name, &deps, move |_| async move { Ok(i as u64) });
                }
                builder.build().unwrap().execute().await.into_result().unwrap()
            })
        })
    });
}

fn benchmark_bounded_runner(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let runner = BoundedParallelRunner::new("bench", 10);
    c.bench_function("bounded_runner_100_tasks", |b| {
        b.iter(|| {
            runtime.block_on(runner.run((0..100u64).collect(), |i| async move {
                tokio::task::yield_now().await;
                Ok(TaskMetrics::new(i, i * 8, 0))
            }))
        })
    });
}

criterion_group!(
    benches,
    benchmark_pattern_compile,
    benchmark_pattern_match,
    benchmark_graph_execution,
    benchmark_bounded_runner
);
criterion_main!(benches);
