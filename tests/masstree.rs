//! Masstree end-to-end: single-writer population and ordered scans,
//! destroy/reinitialize, and a concurrent put/get storm with epoch
//! protection.

use lfkit::masstree::{Scanner, Table};
use lfkit::ThreadInfo;
use std::sync::Once;

static INIT: Once = Once::new();

const WORKERS: usize = 6;

fn init() {
    INIT.call_once(|| {
        lfkit::init(WORKERS).unwrap();
    });
}

struct KeyCollector {
    keys: Vec<String>,
    stop_at: Vec<u8>,
}

impl Scanner for KeyCollector {
    fn visit_value(&mut self, key: &[u8], _value: u64, _ti: &mut ThreadInfo) -> bool {
        if key >= &self.stop_at[..] {
            return false;
        }
        self.keys.push(String::from_utf8_lossy(key).into_owned());
        true
    }
}

#[test]
fn single_writer_population_and_scan() {
    init();
    let ti = unsafe { &mut *lfkit::thread_info(0) };
    let t = Table::new();
    unsafe {
        t.initialize(ti);

        // keys "123456789012", "123456789017", … 100 keys with stride 5
        let mut expect = Vec::new();
        for i in 0..100u64 {
            let key = format!("{}", 123_456_789_012u64 + i * 5);
            assert!(t.put(key.as_bytes(), i, ti));
            expect.push(key);
        }

        assert_eq!(t.get(b"123456789017", ti), Some(1));
        assert_eq!(t.get(b"123456789018", ti), None);

        let mut c = KeyCollector {
            keys: Vec::new(),
            stop_at: b"123456790000".to_vec(),
        };
        t.scan(b"123456789012", true, &mut c, ti);
        assert_eq!(c.keys.len(), 100);
        assert_eq!(c.keys, expect, "scan must yield every key in order");
    }
}

#[test]
fn destroy_then_reuse() {
    init();
    let ti = unsafe { &mut *lfkit::thread_info(1) };
    let t = Table::new();
    unsafe {
        t.initialize(ti);
        for i in 0..10u64 {
            let key = format!("victim{:02}", i);
            assert!(t.put(key.as_bytes(), i, ti));
        }
        t.destroy(ti);
        // the destroy callback is two-phase; drive reclamation through
        for _ in 0..10_000 {
            ti.hard_free();
            std::thread::yield_now();
        }
        t.initialize(ti);
        assert_eq!(t.get(b"victim00", ti), None);
        assert!(t.put(b"victim00", 7, ti));
        assert_eq!(t.get(b"victim00", ti), Some(7));
    }
}

#[test]
fn concurrent_disjoint_writers_and_readers() {
    init();
    static TABLE: Table = Table::new();
    {
        let ti = unsafe { &mut *lfkit::thread_info(2) };
        unsafe { TABLE.initialize(ti) };
    }

    // workers 2..6: two writers on disjoint ranges, two readers chasing
    let writers: Vec<_> = (0..2usize)
        .map(|w| {
            std::thread::spawn(move || {
                let ti = unsafe { &mut *lfkit::thread_info(2 + w) };
                unsafe {
                    for i in 0..20_000u64 {
                        let h = ti.new_handle();
                        let key = format!("w{}:{:08}", w, i);
                        assert!(TABLE.put(key.as_bytes(), (w as u64) << 32 | i, ti));
                        ti.delete_handle(h);
                    }
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2usize)
        .map(|r| {
            std::thread::spawn(move || {
                let ti = unsafe { &mut *lfkit::thread_info(4 + r) };
                let mut hits = 0u64;
                unsafe {
                    for i in 0..20_000u64 {
                        let h = ti.new_handle();
                        let key = format!("w{}:{:08}", r, i % 20_000);
                        if let Some(v) = TABLE.get(key.as_bytes(), ti) {
                            // a visible value is always the one written
                            assert_eq!(v, (r as u64) << 32 | (i % 20_000));
                            hits += 1;
                        }
                        ti.delete_handle(h);
                    }
                }
                hits
            })
        })
        .collect();

    for w in writers {
        w.join().unwrap();
    }
    for r in readers {
        r.join().unwrap();
    }

    // after all writers joined, everything must be visible and ordered
    let ti = unsafe { &mut *lfkit::thread_info(2) };
    unsafe {
        let h = ti.new_handle();
        for w in 0..2u64 {
            for i in 0..20_000u64 {
                let key = format!("w{}:{:08}", w, i);
                assert_eq!(TABLE.get(key.as_bytes(), ti), Some(w << 32 | i));
            }
        }
        let mut c = KeyCollector {
            keys: Vec::new(),
            stop_at: b"zzzz".to_vec(),
        };
        let n = TABLE.scan(b"", true, &mut c, ti);
        assert_eq!(n, 40_000);
        let mut sorted = c.keys.clone();
        sorted.sort();
        assert_eq!(c.keys, sorted);
        ti.delete_handle(h);
    }
}
