//! # Pool Benchmark
//!
//! - Add/remove churn in a standard 4MB pool
//! - Registry routing once the first pools are full
//! - Prepare of a dirty pool (image build plus upload)
//!
//! Run with: `cargo bench --package geopool_core`

#![allow(missing_docs)]

use std::rc::Rc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use geopool_core::{
    BufferLayout, BufferUsage, IndexType, MemoryDevice, Pool, PoolRegistry, SharedBufferConfig,
};

/// Model vertex: position, normal, texcoord.
const STRIDE: u32 = 32;

fn layout() -> BufferLayout {
    BufferLayout::new(STRIDE).with_index_type(IndexType::U32)
}

fn standard_pool(rebase: bool) -> Pool<MemoryDevice> {
    let config = SharedBufferConfig::default();
    let layout = layout();
    Pool::new(
        Rc::new(MemoryDevice::new()),
        layout.clone(),
        BufferUsage::Static,
        config.max_point_count(&layout),
        config.max_index_count(&layout),
        rebase,
    )
    .unwrap()
}

/// Benchmark: allocate and release blocks of varied size.
fn bench_add_remove_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_remove_churn");

    for live in [16usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(live), &live, |b, &live| {
            let pool = standard_pool(false);
            let mut blocks: Vec<_> = (0..live)
                .map(|i| pool.add_block(8 + (i as u32 % 24), 36).unwrap())
                .collect();
            let mut cursor = 0usize;
            b.iter(|| {
                let slot = cursor % live;
                let size = 8 + (cursor as u32 % 31);
                blocks[slot] = pool.add_block(size, 36).unwrap();
                cursor = cursor.wrapping_add(7);
                black_box(pool.used_size())
            });
        });
    }

    group.finish();
}

/// Benchmark: registry first-fit once several pools exist.
fn bench_registry_routing(c: &mut Criterion) {
    c.bench_function("registry_add_data_4_pools", |b| {
        let config = SharedBufferConfig {
            max_vertex_bytes: 64 * 1024,
            max_index_bytes: 64 * 1024,
            use_base_vertex: true,
        };
        let mut registry = PoolRegistry::new(
            Rc::new(MemoryDevice::new()),
            layout(),
            BufferUsage::Static,
            &config,
        )
        .unwrap();
        let mut fill = Vec::new();
        while registry.pool_count() < 4 {
            fill.push(registry.add_data(64, 96).unwrap());
        }
        b.iter(|| black_box(registry.add_data(4, 6).unwrap()));
    });
}

/// Benchmark: prepare a dirty pool holding many small meshes.
fn bench_prepare(c: &mut Criterion) {
    let mut group = c.benchmark_group("prepare");

    for rebase in [false, true] {
        group.bench_with_input(BenchmarkId::new("rebase", rebase), &rebase, |b, &rebase| {
            let pool = standard_pool(rebase);
            let blocks: Vec<_> = (0..512)
                .map(|_| {
                    let block = pool.add_block(24, 36).unwrap();
                    block
                        .with_data(|data| {
                            let indices: Vec<u32> = (0..36).map(|i| i % 24).collect();
                            data.write_indices(0, &indices)
                        })
                        .unwrap()
                        .unwrap();
                    block
                })
                .collect();
            b.iter(|| {
                blocks[0].set_valid(false).unwrap();
                pool.prepare().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_add_remove_churn,
    bench_registry_routing,
    bench_prepare,
);

criterion_main!(benches);
