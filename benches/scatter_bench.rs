use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use memscatter::{config::PAGE_SIZE, BufferPool, BufferPoolConfig, LoopbackTransport, Pid, Session};
use std::sync::Arc;

fn physical_session(pages: u64) -> Session {
    let transport = Arc::new(LoopbackTransport::new());
    transport.map_region(Pid::PHYSICAL, 0, pages * PAGE_SIZE as u64);
    Session::new(transport).unwrap()
}

fn benchmark_batch_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("ScatterSet_BatchSize");
    let session = physical_session(1024);

    for count in [4usize, 64, 512, 4096].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("prepare_execute_read", count), count, |b, &count| {
            let set = session.scatter(Pid::PHYSICAL).unwrap();
            b.iter(|| {
                set.clear().unwrap();
                for i in 0..count {
                    set.prepare_read(((i % 1024) * PAGE_SIZE) as u64, 64).unwrap();
                }
                set.execute().unwrap();
                for i in 0..count {
                    black_box(set.read_pooled(((i % 1024) * PAGE_SIZE) as u64, 64).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn benchmark_read_lengths(c: &mut Criterion) {
    let mut group = c.benchmark_group("ScatterSet_ReadLength");
    let session = physical_session(256);

    for length in [8usize, 256, 4096].iter() {
        group.throughput(Throughput::Bytes((*length * 256) as u64));
        group.bench_with_input(BenchmarkId::new("read_vs_pooled", length), length, |b, &length| {
            let set = session.scatter(Pid::PHYSICAL).unwrap();
            for page in 0..256u64 {
                set.prepare_read(page * PAGE_SIZE as u64, length).unwrap();
            }
            set.execute().unwrap();
            b.iter(|| {
                for page in 0..256u64 {
                    black_box(set.read_pooled(page * PAGE_SIZE as u64, length).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn benchmark_round_map_chase(c: &mut Criterion) {
    let transport = Arc::new(LoopbackTransport::new());
    let pid = Pid(7);
    for i in 0..128u64 {
        transport.write_memory(pid, 0x1000 + i * 8, &(0x8000 + i * 16).to_le_bytes());
        transport.write_memory(pid, 0x8000 + i * 16, &[i as u8; 16]);
    }
    let session = Session::new(transport).unwrap();

    c.bench_function("RoundMap_TwoRoundChase_128", |b| {
        b.iter(|| {
            let map = session.round_map(pid).unwrap();
            let r0 = map.add_round().unwrap();
            let r1 = map.add_round().unwrap();
            for i in 0..128u64 {
                let r1 = r1.clone();
                r0.prepare_read_with(0x1000 + i * 8, 8, move |completion| {
                    if let Ok(Some(target)) = completion.read_u64() {
                        let _ = r1.prepare_read(target, 16);
                    }
                })
                .unwrap();
            }
            map.execute().unwrap();
            map.dispose().unwrap();
        });
    });
}

fn benchmark_pool_rent(c: &mut Criterion) {
    let mut group = c.benchmark_group("BufferPool_Rent");
    let pool = BufferPool::new(BufferPoolConfig::new("bench")).unwrap();

    for length in [64usize, 4096, 65536].iter() {
        group.bench_with_input(BenchmarkId::new("rent_release", length), length, |b, &length| {
            b.iter(|| {
                let buffer = pool.rent(length).unwrap();
                black_box(buffer.len());
            });
        });
    }

    group.bench_function("vec_alloc_4096", |b| {
        b.iter(|| black_box(vec![0u8; 4096]));
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_batch_sizes,
    benchmark_read_lengths,
    benchmark_round_map_chase,
    benchmark_pool_rent
);
criterion_main!(benches);
