use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use gated_mapreduce::{GateKind, MapReduce, Pipeline, SchedulerConfig};

const SENTENCES: &str = "Deer Bear River\nCar Car River\nDeer Car Bear";

fn word_count(gate: GateKind) -> Pipeline<String, String, String, u64> {
    MapReduce::with_input::<String>()
        .with_reader(|text: String| text.split('\n').map(str::to_string).collect::<Vec<_>>())
        .with_mapper(|line: String| line.split(' ').map(|w| (w.to_string(), 1u64)).collect::<Vec<_>>())
        .with_reducer(|_word, counts| counts.into_iter().sum())
        .with_writer(|word: &String, count: &u64| {
            black_box((word, count));
        })
        .with_scheduler(SchedulerConfig {
            gate,
            queue_poll_interval: Duration::from_micros(20),
            ..SchedulerConfig::default()
        })
        .build()
        .unwrap()
}

fn bench_word_count(c: &mut Criterion) {
    gated_mapreduce::system::metrics::set_enabled(false);
    let text = vec![SENTENCES; 500].join("\n");

    let mut group = c.benchmark_group("pipeline/word_count");
    group.sample_size(20);
    for gate in [GateKind::Filter, GateKind::Queue] {
        let pipeline = word_count(gate);
        for workers in [1usize, 2, 4, 8] {
            group.bench_with_input(BenchmarkId::new(gate.to_string(), workers), &workers, |b, &workers| {
                b.iter(|| black_box(pipeline.run_blocking(text.clone(), workers).unwrap()));
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_word_count);
criterion_main!(benches);
