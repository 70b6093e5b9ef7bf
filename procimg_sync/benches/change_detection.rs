//! Change detection benchmark: event evaluation over a device buffer and a
//! full engine cycle for growing device sizes.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use procimg_common::config::SyncSettings;
use procimg_common::io::config::PiCtoryConfig;
use procimg_sync::events::{WatchedIo, detect};
use procimg_sync::{EventHandler, EventSpec, MemoryByteSource, ProcessImage};

/// Virtual device with `n` input bytes and `n` output bytes.
fn config(n: usize) -> PiCtoryConfig {
    let inputs: Vec<String> = (0..n)
        .map(|i| format!(r#""{i}": ["In_{i}", 0, 8, {i}, 0, "", "", ""]"#))
        .collect();
    let outputs: Vec<String> = (0..n)
        .map(|i| format!(r#""{i}": ["Out_{i}", 0, 8, {}, 0, "", "", ""]"#, n + i))
        .collect();
    let json = format!(
        r#"{{"Devices": [{{"name": "virt", "position": 64, "offset": 0,
            "productType": 24577, "type": "VIRTUAL",
            "inp": {{{}}}, "out": {{{}}}}}]}}"#,
        inputs.join(","),
        outputs.join(",")
    );
    PiCtoryConfig::from_json(&json).unwrap()
}

fn image(n: usize) -> ProcessImage {
    let settings = SyncSettings {
        cycle_time_ms: Some(20),
        ..SyncSettings::default()
    };
    ProcessImage::from_parts(settings, config(n), Box::new(MemoryByteSource::new(2 * n))).unwrap()
}

fn bench_detect(c: &mut Criterion) {
    let mut group = c.benchmark_group("detect");
    let handler = EventHandler::new(|_| Ok(()));

    for &n in &[8usize, 64, 256] {
        let image = image(n);
        let watched: Vec<WatchedIo> = image
            .ios()
            .iter()
            .filter_map(|io| io.descriptor().ok())
            .map(|io| WatchedIo {
                io,
                specs: vec![EventSpec::new(handler.clone())],
            })
            .collect();
        let old = vec![0u8; 2 * n];
        let mut new = old.clone();
        // Every 8th input changed.
        for byte in new.iter_mut().take(n).step_by(8) {
            *byte = 1;
        }

        group.bench_with_input(BenchmarkId::new("ios", n), &n, |b, _| {
            b.iter(|| {
                let mut fired = 0usize;
                detect(&watched, black_box(&old), black_box(&new), |_, _, _| fired += 1);
                black_box(fired)
            });
        });
    }
    group.finish();
}

fn bench_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle_once");

    for &n in &[8usize, 64, 256] {
        let image = image(n);
        image.autorefresh_all().unwrap();
        image.engine().stop();

        group.bench_with_input(BenchmarkId::new("ios", n), &n, |b, _| {
            b.iter(|| black_box(image.engine().cycle_once()));
        });
        image.cleanup().unwrap();
    }
    group.finish();
}

criterion_group!(benches, bench_detect, bench_cycle);
criterion_main!(benches);
