//! Planner throughput: buffer a zigzag toolpath and keep the lookahead
//! recalculation honest while the buffer drains.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use motion::planner::{LineData, Planner};
use motion::segment::SegmentGenerator;
use motion::settings::Settings;

fn zigzag(count: usize) -> Vec<[f32; 3]> {
    (0..count)
        .map(|i| {
            let x = (i % 17) as f32;
            let y = ((i * 3) % 11) as f32;
            [x, y, 0.0]
        })
        .collect()
}

fn bench_buffer_line(c: &mut Criterion) {
    let settings = Arc::new(Settings::default());
    let targets = zigzag(256);
    let data = LineData {
        feed_rate: 1800.0,
        ..LineData::default()
    };

    c.bench_function("buffer_line_256_moves", |b| {
        b.iter(|| {
            let mut planner = Planner::new(settings.clone());
            let mut prep = SegmentGenerator::new(settings.clone());
            for target in &targets {
                planner.buffer_line(black_box(target), &data, &mut prep);
            }
            black_box(planner.len())
        })
    });

    c.bench_function("buffer_line_with_drain", |b| {
        b.iter(|| {
            let mut planner = Planner::new(settings.clone());
            let mut prep = SegmentGenerator::new(settings.clone());
            for target in &targets {
                planner.buffer_line(black_box(target), &data, &mut prep);
                if planner.len() > 64 {
                    prep.prep_buffer(&mut planner);
                    while prep.tail_segment().is_some() {
                        prep.advance_tail();
                    }
                }
            }
            black_box(planner.len())
        })
    });
}

criterion_group!(benches, bench_buffer_line);
criterion_main!(benches);
