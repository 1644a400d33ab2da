//! Map benchmarks comparing the lock-free hash map against a
//! mutex-wrapped std HashMap under single-thread and multi-thread load.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use lfkit::hash_map::{HashMap as LfHashMap, LF_HASH_UNIQUE};
use std::collections::HashMap as StdHashMap;
use std::hint::black_box;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn lf_map() -> &'static LfHashMap {
    Box::leak(Box::new(LfHashMap::new(16, LF_HASH_UNIQUE, 0, 8)))
}

fn element(k: u64) -> [u8; 16] {
    let mut e = [0u8; 16];
    e[..8].copy_from_slice(&k.to_le_bytes());
    e[8..].copy_from_slice(&(!k).to_le_bytes());
    e
}

// ---------------------------------------------------------------------------
// Single thread
// ---------------------------------------------------------------------------

fn bench_insert_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_search_single");
    let n = 10_000u64;
    group.throughput(Throughput::Elements(n));

    group.bench_function("lfkit", |b| {
        b.iter(|| {
            let m = lf_map();
            let pins = m.get_pins();
            unsafe {
                for k in 0..n {
                    let e = element(k);
                    let _ = m.insert(pins, e.as_ptr());
                }
                for k in 0..n {
                    let kb = k.to_le_bytes();
                    black_box(m.search(pins, &kb).unwrap());
                    m.search_unpin(pins);
                }
                m.put_pins(pins);
            }
        })
    });

    group.bench_function("std_mutex", |b| {
        b.iter(|| {
            let m: Mutex<StdHashMap<u64, [u8; 16]>> = Mutex::new(StdHashMap::new());
            for k in 0..n {
                m.lock().unwrap().insert(k, element(k));
            }
            for k in 0..n {
                black_box(m.lock().unwrap().get(&k).copied());
            }
        })
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Multi thread
// ---------------------------------------------------------------------------

fn bench_concurrent_lookups(c: &mut Criterion) {
    let mut group = c.benchmark_group("search_concurrent");
    let n = 10_000u64;

    for threads in [2usize, 4, 8] {
        group.throughput(Throughput::Elements(n * threads as u64));

        group.bench_with_input(BenchmarkId::new("lfkit", threads), &threads, |b, &threads| {
            let m = lf_map();
            let pins = m.get_pins();
            unsafe {
                for k in 0..n {
                    let e = element(k);
                    m.insert(pins, e.as_ptr()).unwrap();
                }
                m.put_pins(pins);
            }
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        std::thread::spawn(move || {
                            let pins = m.get_pins();
                            unsafe {
                                for k in 0..n {
                                    let kb = ((k + t as u64) % n).to_le_bytes();
                                    black_box(m.search(pins, &kb).unwrap());
                                    m.search_unpin(pins);
                                }
                                m.put_pins(pins);
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            })
        });

        group.bench_with_input(
            BenchmarkId::new("std_mutex", threads),
            &threads,
            |b, &threads| {
                let m: &'static Mutex<StdHashMap<u64, [u8; 16]>> =
                    Box::leak(Box::new(Mutex::new(StdHashMap::new())));
                for k in 0..n {
                    m.lock().unwrap().insert(k, element(k));
                }
                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|t| {
                            std::thread::spawn(move || {
                                for k in 0..n {
                                    let key = (k + t as u64) % n;
                                    black_box(m.lock().unwrap().get(&key).copied());
                                }
                            })
                        })
                        .collect();
                    for h in handles {
                        h.join().unwrap();
                    }
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_insert_search, bench_concurrent_lookups);
criterion_main!(benches);
