use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use enhance::{
    backends::test_utils::{gradient_image, MockBackend},
    utils::resample::{pad_reflect, resize_area, resize_bicubic},
    BitDepth, Job, TileProcessor,
};
use ndarray::Array2;

fn benchmark_tile_processing(c: &mut Criterion) {
    let mut group = c.benchmark_group("tile_processing");
    group.sample_size(20);

    let image = gradient_image(512, 384, BitDepth::Eight).unwrap();
    for (tile, padding) in [(128, 16), (256, 32), (512, 32)] {
        let processor = TileProcessor::new(tile, padding).unwrap();
        group.bench_function(BenchmarkId::new("identity", format!("t{tile}_p{padding}")), |b| {
            b.iter(|| {
                let mut backend = MockBackend::identity();
                let job = Job::new("bench");
                black_box(processor.process(&image, &mut backend, None, &job).unwrap())
            });
        });
    }

    let processor = TileProcessor::new(128, 16).unwrap();
    group.bench_function("upscale_x2", |b| {
        b.iter(|| {
            let mut backend = MockBackend::upscale(2);
            let job = Job::new("bench");
            black_box(processor.process(&image, &mut backend, None, &job).unwrap())
        });
    });

    // Half the image masked out, so roughly half the tiles are skipped
    let mask = Array2::from_shape_fn((384, 512), |(_, x)| if x < 256 { 1.0 } else { 0.0 });
    group.bench_function("masked_half", |b| {
        b.iter(|| {
            let mut backend = MockBackend::identity();
            let job = Job::new("bench");
            black_box(processor.process(&image, &mut backend, Some(&mask), &job).unwrap())
        });
    });

    group.finish();
}

fn benchmark_resampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("resampling");
    let tensor = gradient_image(256, 256, BitDepth::Eight).unwrap().to_planar();

    group.bench_function("bicubic_x2", |b| {
        b.iter(|| black_box(resize_bicubic(tensor.view(), 512, 512)));
    });
    group.bench_function("area_half", |b| {
        b.iter(|| black_box(resize_area(tensor.view(), 128, 128)));
    });
    group.bench_function("reflect_pad_32", |b| {
        b.iter(|| black_box(pad_reflect(tensor.view(), 32, 32, 32, 32)));
    });

    group.finish();
}

criterion_group!(tiling_benches, benchmark_tile_processing, benchmark_resampling);
criterion_main!(tiling_benches);
