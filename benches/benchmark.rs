use card_render::{fingerprint, CacheSettings, Config, RenderRequest, ResultCache};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use std::time::Duration;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn sample_body() -> Value {
    json!({
        "temp": "tempB",
        "language": "en",
        "title": "Weekly notes",
        "content": "## Heading\n\n- one\n- two\n\n| a | b |\n|---|---|\n| 1 | 2 |",
        "author": "someone",
        "switchConfig": {"showIcon": true, "showDate": false, "showQRCode": true},
        "fonts": {"title": "serif", "content": "sans-serif"},
        "form": {"content": "shadow", "qrcode": "https://example.com"},
        "imgScale": 2
    })
}

fn benchmark_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    configure_fast_group(&mut group);

    let body = sample_body();
    group.bench_function("canonical_json", |b| {
        b.iter(|| black_box(fingerprint(black_box(&body))));
    });

    group.finish();
}

fn benchmark_request_building(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_request");
    configure_fast_group(&mut group);

    let config = Config::default();
    let body = sample_body();

    group.bench_function("from_body", |b| {
        b.iter(|| {
            let request = RenderRequest::from_value(body.clone());
            let _ = black_box(request);
        });
    });

    let request = RenderRequest::from_value(body.clone()).expect("sample body is valid");
    group.bench_function("target_url", |b| {
        b.iter(|| {
            let url = request.target_url(&config);
            let _ = black_box(url);
        });
    });

    group.bench_function("content_markup", |b| {
        b.iter(|| black_box(request.content_markup().map(|m| m.len())));
    });

    group.finish();
}

fn benchmark_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("result_cache");
    configure_fast_group(&mut group);

    let cache = ResultCache::new(&CacheSettings {
        max_entries: 50,
        max_bytes: 50 * 1024 * 1024,
        ttl: Duration::from_secs(300),
    });
    let image = vec![0u8; 256 * 1024];
    let keys: Vec<String> = (0..100).map(|i| format!("{{\"n\":{i}}}")).collect();

    group.bench_function("put_evicting", |b| {
        let mut i = 0;
        b.iter(|| {
            let key = keys[i % keys.len()].clone();
            i += 1;
            black_box(cache.put(key, image.clone()));
        });
    });

    group.bench_function("get_hit", |b| {
        cache.put(keys[0].clone(), image.clone());
        b.iter(|| black_box(cache.get(&keys[0]).map(|bytes| bytes.len())));
    });

    group.finish();
}

fn benchmark_format_utilities(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_utils");
    configure_fast_group(&mut group);

    group.bench_function("bytes", |b| {
        b.iter(|| black_box(card_render::format_bytes(black_box(1_572_864))));
    });

    group.bench_function("duration", |b| {
        b.iter(|| black_box(card_render::format_duration(black_box(Duration::from_millis(2340)))));
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_fingerprint,
    benchmark_request_building,
    benchmark_cache,
    benchmark_format_utilities
);
criterion_main!(benches);
