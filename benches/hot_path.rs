use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use logrelay::{
    BufferConfig, CircuitBreaker, Level, LogBuffer, LogEvent, Sampler, SamplingConfig,
};

use std::time::Duration;

fn event(level: Level) -> LogEvent {
    LogEvent::new(level, "request handled", "bench", "default")
}

fn sampler_decide(c: &mut Criterion) {
    let keep_all = Sampler::new(SamplingConfig::default()).with_rng_seed(1);
    let scaled = Sampler::new(SamplingConfig {
        volume_threshold: 10,
        ..SamplingConfig::recommended()
    })
    .with_rng_seed(1);
    let info = event(Level::Info);

    c.bench_function("sampler_decide_keep_all", |b| {
        b.iter(|| black_box(keep_all.decide(black_box(&info))));
    });
    // Volume well above threshold: every decision goes through scaling and a random draw.
    c.bench_function("sampler_decide_volume_scaled", |b| {
        b.iter(|| black_box(scaled.decide(black_box(&info))));
    });
}

fn buffer_enqueue(c: &mut Criterion) {
    let buffer = LogBuffer::new(BufferConfig { max_size: 10_000, flush_interval: Duration::from_secs(3600) });
    c.bench_function("buffer_enqueue_at_capacity", |b| {
        b.iter_batched(
            || event(Level::Info),
            |e| black_box(buffer.enqueue(e)),
            BatchSize::SmallInput,
        );
    });
}

fn breaker_admission(c: &mut Criterion) {
    let breaker = CircuitBreaker::new(5, Duration::from_secs(30)).unwrap();
    c.bench_function("circuit_breaker_closed_check", |b| {
        b.iter(|| black_box(breaker.check()));
    });
}

criterion_group!(benches, sampler_decide, buffer_enqueue, breaker_admission);
criterion_main!(benches);
