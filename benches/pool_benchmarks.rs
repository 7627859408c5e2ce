//! Performance benchmarks for Axiom graphics buffer pools
//!
//! The reuse path runs once per client frame, so it must stay allocation
//! free. Fresh allocation is measured alongside for comparison.

use axiom_graphics::buffer::BufferPool;
use axiom_graphics::platform::shm::{ShmPlatform, ShmSearchPath};
use axiom_graphics::platform::NativeBufferPlatform;
use axiom_graphics::{PixelFormat, PostedBuffer, Size};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;

fn shm_platform(dir: &std::path::Path) -> Arc<dyn NativeBufferPlatform> {
    let search = ShmSearchPath::with_candidates(vec![dir.to_path_buf()]);
    Arc::new(ShmPlatform::new(search).expect("shared-memory platform"))
}

/// Benchmark get_buffer when the previous frame has been released
fn bench_get_buffer_reuse(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("temporary directory");
    let platform = shm_platform(dir.path());
    let mut group = c.benchmark_group("get_buffer_reuse");

    for (width, height) in [(256u32, 256u32), (1920, 1080)] {
        for ring_depth in [1usize, 3] {
            let mut pool = BufferPool::new(platform.clone(), PixelFormat::Argb8888, ring_depth);
            let size = Size::new(width, height);
            let stride = PixelFormat::Argb8888.packed_stride(width).expect("packed stride");

            group.bench_function(format!("{width}x{height}_ring{ring_depth}"), |b| {
                b.iter(|| {
                    let buffer = pool.get_buffer(black_box(size), stride).expect("reused buffer");
                    PostedBuffer::new(buffer).release();
                })
            });
        }
    }

    group.finish();
}

/// Benchmark a cold pool allocating its first buffer
fn bench_first_allocation(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("temporary directory");
    let platform = shm_platform(dir.path());
    let size = Size::new(1920, 1080);
    let stride = PixelFormat::Argb8888.packed_stride(1920).expect("packed stride");

    c.bench_function("first_allocation_1920x1080", |b| {
        b.iter_batched(
            || BufferPool::new(platform.clone(), PixelFormat::Argb8888, 1),
            |mut pool| black_box(pool.get_buffer(size, stride).expect("allocated buffer")),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_get_buffer_reuse, bench_first_allocation);
criterion_main!(benches);
