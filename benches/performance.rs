//! Performance benchmarks
//!
//! Exercises hybridkv across different value sizes, read/write mixes,
//! and concurrency levels.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use hybridkv::{Config, HybridKv};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn generate_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

fn generate_key(index: usize) -> Vec<u8> {
    format!("key_{index:08}").into_bytes()
}

async fn create_test_store(memory_size: u64) -> HybridKv {
    let temp_dir = tempdir().unwrap();
    let config = Config {
        storage_dir: temp_dir.path().to_string_lossy().to_string(),
        memory_size,
        page_bits: 22, // 4MB pages
        enable_checkpointing: false,
        enable_gc: false,
        ..Default::default()
    };

    let store = HybridKv::new(config).await.unwrap();
    std::mem::forget(temp_dir); // keep the directory alive for the store's lifetime
    store
}

fn bench_write_performance(c: &mut Criterion) {
    let value_sizes = vec![
        ("1B", 1),
        ("100B", 100),
        ("1KB", 1024),
        ("10KB", 10 * 1024),
        ("100KB", 100 * 1024),
    ];

    let mut group = c.benchmark_group("write_performance");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(10));

    for (size_name, size) in value_sizes {
        group.throughput(Throughput::Bytes(size as u64 * 100));

        group.bench_with_input(
            BenchmarkId::new("sequential_write", size_name),
            &size,
            |b, &value_size| {
                b.iter_custom(|iters| {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    let mut total_duration = Duration::from_nanos(0);

                    for _ in 0..iters {
                        let duration = rt.block_on(async {
                            let store = create_test_store(256 * 1024 * 1024).await;
                            let mut session = store.start_session(false);
                            let test_data = generate_test_data(value_size);

                            let start = std::time::Instant::now();
                            for i in 0..100 {
                                let key = generate_key(i);
                                store
                                    .upsert(&mut session, key, test_data.clone())
                                    .await
                                    .unwrap();
                            }
                            start.elapsed()
                        });

                        total_duration += duration;
                    }

                    total_duration
                });
            },
        );
    }

    group.finish();
}

fn bench_read_performance(c: &mut Criterion) {
    let value_sizes = vec![
        ("1B", 1),
        ("100B", 100),
        ("1KB", 1024),
        ("10KB", 10 * 1024),
        ("100KB", 100 * 1024),
    ];

    let mut group = c.benchmark_group("read_performance");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(10));

    for (size_name, size) in value_sizes {
        group.throughput(Throughput::Bytes(size as u64 * 100));

        group.bench_with_input(
            BenchmarkId::new("sequential_read", size_name),
            &size,
            |b, &value_size| {
                b.iter_custom(|iters| {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    let mut total_duration = Duration::from_nanos(0);

                    for _ in 0..iters {
                        let duration = rt.block_on(async {
                            let store = create_test_store(256 * 1024 * 1024).await;
                            let mut session = store.start_session(false);
                            let test_data = generate_test_data(value_size);

                            for i in 0..100 {
                                let key = generate_key(i);
                                store
                                    .upsert(&mut session, key, test_data.clone())
                                    .await
                                    .unwrap();
                            }

                            let start = std::time::Instant::now();
                            for i in 0..100 {
                                let key = generate_key(i);
                                let _value = black_box(store.read(&mut session, &key).await.unwrap());
                            }
                            start.elapsed()
                        });

                        total_duration += duration;
                    }

                    total_duration
                });
            },
        );
    }

    group.finish();
}

fn bench_mixed_workload(c: &mut Criterion) {
    let read_percentages = vec![0, 50, 90, 95, 99];
    let value_size = 1024;

    let mut group = c.benchmark_group("mixed_workload");
    group.sample_size(15);
    group.measurement_time(Duration::from_secs(8));
    group.throughput(Throughput::Elements(100));

    for read_pct in read_percentages {
        group.bench_with_input(
            BenchmarkId::new("mixed_ops", format!("{read_pct}%_read")),
            &read_pct,
            |b, &read_percentage| {
                b.iter_custom(|iters| {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    let mut total_duration = Duration::from_nanos(0);

                    for _ in 0..iters {
                        let duration = rt.block_on(async {
                            let store = create_test_store(256 * 1024 * 1024).await;
                            let mut session = store.start_session(false);
                            let test_data = generate_test_data(value_size);

                            for i in 0..50 {
                                let key = generate_key(i);
                                store
                                    .upsert(&mut session, key, test_data.clone())
                                    .await
                                    .unwrap();
                            }

                            let start = std::time::Instant::now();

                            for i in 0..100 {
                                let should_read = (i % 100) < read_percentage;
                                let key = generate_key(i % 50);

                                if should_read {
                                    let _value = store.read(&mut session, &key).await.unwrap();
                                } else {
                                    store
                                        .upsert(&mut session, key, test_data.clone())
                                        .await
                                        .unwrap();
                                }
                            }

                            start.elapsed()
                        });

                        total_duration += duration;
                    }

                    total_duration
                });
            },
        );
    }

    group.finish();
}

fn bench_concurrent_operations(c: &mut Criterion) {
    let concurrency_levels = vec![1, 2, 4, 8, 16, 32];
    let value_size = 1024;

    let mut group = c.benchmark_group("concurrent_operations");
    group.sample_size(5);
    group.measurement_time(Duration::from_secs(15));

    for concurrency in concurrency_levels {
        group.throughput(Throughput::Elements(100 * concurrency as u64));

        group.bench_with_input(
            BenchmarkId::new("concurrent_mixed", format!("{concurrency}_threads")),
            &concurrency,
            |b, &num_threads| {
                b.iter_custom(|iters| {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    let mut total_duration = Duration::from_nanos(0);

                    for _ in 0..iters {
                        let duration = rt.block_on(async {
                            let store = Arc::new(create_test_store(512 * 1024 * 1024).await);
                            let test_data = generate_test_data(value_size);

                            {
                                let mut session = store.start_session(false);
                                for i in 0..100 {
                                    let key = generate_key(i);
                                    store
                                        .upsert(&mut session, key, test_data.clone())
                                        .await
                                        .unwrap();
                                }
                            }

                            let start = std::time::Instant::now();

                            let mut handles = Vec::new();
                            for thread_id in 0..num_threads {
                                let store_clone = store.clone();
                                let data_clone = test_data.clone();

                                let handle = tokio::spawn(async move {
                                    let mut session = store_clone.start_session(false);
                                    for i in 0..100 {
                                        let key_index = thread_id * 100 + i;
                                        let key = generate_key(key_index);

                                        if i % 2 == 0 {
                                            let _value =
                                                store_clone.read(&mut session, &key).await.unwrap();
                                        } else {
                                            store_clone
                                                .upsert(&mut session, key, data_clone.clone())
                                                .await
                                                .unwrap();
                                        }
                                    }
                                });

                                handles.push(handle);
                            }

                            for handle in handles {
                                handle.await.unwrap();
                            }

                            start.elapsed()
                        });

                        total_duration += duration;
                    }

                    total_duration
                });
            },
        );
    }

    group.finish();
}

fn bench_batch_operations(c: &mut Criterion) {
    let batch_sizes = vec![1, 10, 100];
    let value_size = 1024;

    let mut group = c.benchmark_group("batch_operations");
    group.sample_size(10);

    for batch_size in batch_sizes {
        group.throughput(Throughput::Elements(batch_size as u64));

        group.bench_with_input(
            BenchmarkId::new("batch_write", format!("{batch_size}_ops")),
            &batch_size,
            |b, &batch_size| {
                b.iter_custom(|iters| {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    let mut total_duration = Duration::from_nanos(0);

                    for _ in 0..iters {
                        let duration = rt.block_on(async {
                            let store = create_test_store(256 * 1024 * 1024).await;
                            let mut session = store.start_session(false);
                            let test_data = generate_test_data(value_size);

                            let start = std::time::Instant::now();

                            for i in 0..batch_size {
                                let key = generate_key(i);
                                store
                                    .upsert(&mut session, key, test_data.clone())
                                    .await
                                    .unwrap();
                            }

                            start.elapsed()
                        });

                        total_duration += duration;
                    }

                    total_duration
                });
            },
        );
    }

    group.finish();
}

fn bench_thread_scaling(c: &mut Criterion) {
    let thread_counts = vec![1, 2, 4, 8, 16, 24, 32];
    let value_size = 1024;

    let mut group = c.benchmark_group("thread_scaling");
    group.sample_size(5);
    group.measurement_time(Duration::from_secs(12));

    for thread_count in thread_counts {
        group.throughput(Throughput::Elements(1000 * thread_count as u64));

        group.bench_with_input(
            BenchmarkId::new("write_scaling", format!("{thread_count}_threads")),
            &thread_count,
            |b, &num_threads| {
                b.iter_custom(|iters| {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    let mut total_duration = Duration::from_nanos(0);

                    for _ in 0..iters {
                        let duration = rt.block_on(async {
                            let store = Arc::new(create_test_store(512 * 1024 * 1024).await);
                            let test_data = generate_test_data(value_size);

                            let start = std::time::Instant::now();

                            let mut handles = Vec::new();
                            for thread_id in 0..num_threads {
                                let store_clone = store.clone();
                                let data_clone = test_data.clone();

                                let handle = tokio::spawn(async move {
                                    let mut session = store_clone.start_session(false);
                                    for i in 0..1000 {
                                        let key = format!("thread_{thread_id}_{i}").into_bytes();
                                        store_clone
                                            .upsert(&mut session, key, data_clone.clone())
                                            .await
                                            .unwrap();
                                    }
                                });

                                handles.push(handle);
                            }

                            for handle in handles {
                                handle.await.unwrap();
                            }

                            start.elapsed()
                        });

                        total_duration += duration;
                    }

                    total_duration
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("read_scaling", format!("{thread_count}_threads")),
            &thread_count,
            |b, &num_threads| {
                b.iter_custom(|iters| {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    let mut total_duration = Duration::from_nanos(0);

                    for _ in 0..iters {
                        let duration = rt.block_on(async {
                            let store = Arc::new(create_test_store(512 * 1024 * 1024).await);
                            let test_data = generate_test_data(value_size);

                            {
                                let mut session = store.start_session(false);
                                for i in 0..1000 {
                                    let key = format!("read_test_{i}").into_bytes();
                                    store
                                        .upsert(&mut session, key, test_data.clone())
                                        .await
                                        .unwrap();
                                }
                            }

                            let start = std::time::Instant::now();

                            let mut handles = Vec::new();
                            for _ in 0..num_threads {
                                let store_clone = store.clone();

                                let handle = tokio::spawn(async move {
                                    let mut session = store_clone.start_session(false);
                                    for i in 0..1000 {
                                        let key = format!("read_test_{}", i % 1000).into_bytes();
                                        let _value =
                                            store_clone.read(&mut session, &key).await.unwrap();
                                    }
                                });

                                handles.push(handle);
                            }

                            for handle in handles {
                                handle.await.unwrap();
                            }

                            start.elapsed()
                        });

                        total_duration += duration;
                    }

                    total_duration
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("mixed_scaling", format!("{thread_count}_threads")),
            &thread_count,
            |b, &num_threads| {
                b.iter_custom(|iters| {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    let mut total_duration = Duration::from_nanos(0);

                    for _ in 0..iters {
                        let duration = rt.block_on(async {
                            let store = Arc::new(create_test_store(512 * 1024 * 1024).await);
                            let test_data = generate_test_data(value_size);

                            {
                                let mut session = store.start_session(false);
                                for i in 0..500 {
                                    let key = format!("mixed_test_{i}").into_bytes();
                                    store
                                        .upsert(&mut session, key, test_data.clone())
                                        .await
                                        .unwrap();
                                }
                            }

                            let start = std::time::Instant::now();

                            let mut handles = Vec::new();
                            for _ in 0..num_threads {
                                let store_clone = store.clone();
                                let data_clone = test_data.clone();

                                let handle = tokio::spawn(async move {
                                    let mut session = store_clone.start_session(false);
                                    for i in 0..1000 {
                                        let key = format!("mixed_test_{}", i % 500).into_bytes();

                                        if i % 10 < 7 {
                                            let _value =
                                                store_clone.read(&mut session, &key).await.unwrap();
                                        } else {
                                            store_clone
                                                .upsert(&mut session, key, data_clone.clone())
                                                .await
                                                .unwrap();
                                        }
                                    }
                                });

                                handles.push(handle);
                            }

                            for handle in handles {
                                handle.await.unwrap();
                            }

                            start.elapsed()
                        });

                        total_duration += duration;
                    }

                    total_duration
                });
            },
        );
    }

    group.finish();
}

fn bench_high_concurrency(c: &mut Criterion) {
    let scenarios = vec![("light_load", 1000, 100), ("heavy_load", 100, 10000)];

    let mut group = c.benchmark_group("high_concurrency");
    group.sample_size(3);
    group.measurement_time(Duration::from_secs(20));

    for (scenario_name, thread_count, ops_per_thread) in scenarios {
        group.throughput(Throughput::Elements(thread_count * ops_per_thread));

        group.bench_with_input(
            BenchmarkId::new("stress_test", scenario_name),
            &(thread_count, ops_per_thread),
            |b, &(num_threads, ops_per_thread)| {
                b.iter_custom(|iters| {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    let mut total_duration = Duration::from_nanos(0);

                    for _ in 0..iters {
                        let duration = rt.block_on(async {
                            let store = Arc::new(create_test_store(1024 * 1024 * 1024).await);
                            let test_data = generate_test_data(256);

                            let start = std::time::Instant::now();

                            let mut handles = Vec::new();
                            for thread_id in 0..num_threads {
                                let store_clone = store.clone();
                                let data_clone = test_data.clone();

                                let handle = tokio::spawn(async move {
                                    let mut session = store_clone.start_session(false);
                                    for i in 0..ops_per_thread {
                                        let key = format!("stress_{thread_id}_{i}").into_bytes();

                                        if i % 5 < 4 {
                                            store_clone
                                                .upsert(&mut session, key, data_clone.clone())
                                                .await
                                                .unwrap();
                                        } else {
                                            let _value =
                                                store_clone.read(&mut session, &key).await.ok();
                                        }
                                    }
                                });

                                handles.push(handle);
                            }

                            for handle in handles {
                                handle.await.unwrap();
                            }

                            start.elapsed()
                        });

                        total_duration += duration;
                    }

                    total_duration
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_write_performance,
    bench_read_performance,
    bench_mixed_workload,
    bench_concurrent_operations,
    bench_thread_scaling,
    bench_high_concurrency,
    bench_batch_operations,
);

criterion_main!(benches);
