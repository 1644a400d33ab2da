//! Hash map end-to-end scenarios: the single-thread element lifecycle and
//! the multi-thread disjoint-range insert storm.

use lfkit::hash_map::{HashMap, LF_HASH_UNIQUE, MapError};

#[test]
fn single_thread_insert_search_remove() {
    // element size 7 ("key1:v1"), key at offset 0, length 4, no unique flag
    let m = HashMap::new(7, 0, 0, 4);
    let pins = m.get_pins();
    unsafe {
        assert_eq!(m.insert(pins, b"key1:v1".as_ptr()), Ok(()));

        let found = m.search(pins, b"key1").unwrap();
        let p = found.expect("key1 must be found");
        assert_eq!(std::slice::from_raw_parts(p, 7), b"key1:v1");
        m.search_unpin(pins);

        assert_eq!(m.remove(pins, b"key1"), Ok(()));
        assert_eq!(m.remove(pins, b"key1"), Err(MapError::NotFound));

        assert_eq!(m.insert(pins, b"key1:v1".as_ptr()), Ok(()));
        assert_eq!(m.remove(pins, b"key1"), Ok(()));

        m.put_pins(pins);
    }
}

#[test]
fn single_thread_repeated_cycles() {
    let m = HashMap::new(7, LF_HASH_UNIQUE, 0, 4);
    for _ in 0..10_000 {
        let pins = m.get_pins();
        unsafe {
            assert_eq!(m.insert(pins, b"key2:v2".as_ptr()), Ok(()));
            let found = m.search(pins, b"key2").unwrap();
            assert!(found.is_some());
            m.search_unpin(pins);
            assert_eq!(m.remove(pins, b"key2"), Ok(()));
            m.put_pins(pins);
        }
    }
    assert_eq!(m.count(), 0);
}

#[test]
fn multi_thread_disjoint_inserts() {
    // 5 threads, each inserting 100 000 distinct 4-byte integer keys from
    // disjoint ranges starting near 95 000, 195 000, …; value = thread id
    let nthreads = 5i64;
    let per_thread = 100_000i64;
    let keylen = 4usize;
    let m: &'static HashMap =
        Box::leak(Box::new(HashMap::new(keylen * 2, LF_HASH_UNIQUE, 0, keylen)));

    let handles: Vec<_> = (0..nthreads)
        .map(|t| {
            std::thread::spawn(move || {
                let pins = m.get_pins();
                assert!(!pins.is_null());
                unsafe {
                    for i in 0..per_thread {
                        let key = (t * per_thread - 5000 + i) as i32;
                        let mut element = [0u8; 8];
                        element[..4].copy_from_slice(&key.to_le_bytes());
                        element[4..].copy_from_slice(&(t as i32).to_le_bytes());
                        assert_eq!(m.insert(pins, element.as_ptr()), Ok(()));
                    }
                    m.put_pins(pins);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(m.count(), (nthreads * per_thread) as u32);

    let pins = m.get_pins();
    unsafe {
        for key in -5000i32..(nthreads * per_thread - 5000) as i32 {
            let kb = key.to_le_bytes();
            let found = m.search(pins, &kb).unwrap();
            assert!(found.is_some(), "key {key} missing after join");
            m.search_unpin(pins);
        }
        m.put_pins(pins);
    }
}

#[test]
fn concurrent_insert_remove_search_churn() {
    let m: &'static HashMap = Box::leak(Box::new(HashMap::new(8, LF_HASH_UNIQUE, 0, 8)));
    let nthreads = 4u64;
    let iters = 20_000u64;

    let handles: Vec<_> = (0..nthreads)
        .map(|t| {
            std::thread::spawn(move || {
                let pins = m.get_pins();
                unsafe {
                    for i in 0..iters {
                        // a small hot key space shared by all threads
                        let key = (i % 64).to_le_bytes();
                        match i % 3 {
                            0 => {
                                let _ = m.insert(pins, key.as_ptr());
                            }
                            1 => {
                                let r = m.search(pins, &key).unwrap();
                                if let Some(p) = r {
                                    // the payload's key bytes are coherent
                                    assert_eq!(
                                        std::slice::from_raw_parts(p, 8),
                                        &key[..],
                                        "thread {t} read a torn element"
                                    );
                                }
                                m.search_unpin(pins);
                            }
                            _ => {
                                let _ = m.remove(pins, &key);
                            }
                        }
                    }
                    m.put_pins(pins);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}
