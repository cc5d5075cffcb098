//! Port pool tests
//!
//! Uniqueness under concurrent acquisition, the reuse quarantine and orphan
//! reclamation.

use proptest::prelude::*;
use rato_relay::{PortAllocator, PortAllocatorConfig, PortError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn allocator(port_count: u16, reuse_delay: Duration) -> PortAllocator {
    PortAllocator::new(PortAllocatorConfig {
        base_port: 40000,
        port_count,
        reuse_delay,
        orphan_timeout: Duration::from_secs(60),
    })
    .unwrap()
}

#[test]
fn test_concurrent_acquire_is_unique() {
    const THREADS: usize = 48;
    let pool = allocator(32, Duration::from_secs(2));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let pool = pool.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                pool.acquire(&format!("streamer-{}", i))
            })
        })
        .collect();

    let mut leases = Vec::new();
    let mut exhausted = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(lease) => leases.push(lease),
            Err(PortError::ExhaustedPool) => exhausted += 1,
            Err(e) => panic!("unexpected error {:?}", e),
        }
    }

    assert_eq!(leases.len(), 32);
    assert_eq!(exhausted, THREADS - 32);
    let ports: HashSet<u16> = leases.iter().map(|l| l.port()).collect();
    assert_eq!(ports.len(), leases.len());
    assert!(ports.iter().all(|p| (40000..40032).contains(p)));
    assert_eq!(pool.leased_count(), 32);
}

#[test]
fn test_concurrent_release_and_acquire() {
    let pool = allocator(8, Duration::ZERO);
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let pool = pool.clone();
            thread::spawn(move || {
                let id = format!("churn-{}", i);
                for _ in 0..200 {
                    if let Ok(lease) = pool.acquire(&id) {
                        assert_eq!(pool.lease_of(&id), Some(lease.port()));
                        assert!(lease.release());
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(pool.leased_count(), 0);
}

#[test]
fn test_reuse_waits_for_quarantine() {
    let pool = allocator(1, Duration::from_secs(2));
    let t0 = Instant::now();

    let lease = pool.acquire_at("a", t0).unwrap();
    let port = lease.port();
    assert_eq!(pool.release_at(port, t0), Ok(true));
    assert!(!lease.is_held());
    drop(lease);

    assert_eq!(
        pool.acquire_at("b", t0 + Duration::from_millis(1999)).err(),
        Some(PortError::ExhaustedPool)
    );
    let again = pool.acquire_at("b", t0 + Duration::from_secs(2)).unwrap();
    assert_eq!(again.port(), port);
}

#[test]
fn test_one_lease_per_streamer() {
    let pool = allocator(4, Duration::ZERO);
    let first = pool.acquire("cam").unwrap();
    assert_eq!(
        pool.acquire("cam").err(),
        Some(PortError::AlreadyLeased {
            streamer_id: "cam".to_string(),
            port: first.port(),
        })
    );
}

#[test]
fn test_orphan_sweep_reclaims_untouched() {
    let pool = PortAllocator::new(PortAllocatorConfig {
        base_port: 40100,
        port_count: 4,
        reuse_delay: Duration::ZERO,
        orphan_timeout: Duration::from_secs(10),
    })
    .unwrap();
    let t0 = Instant::now();
    let alive = pool.acquire_at("alive", t0).unwrap();
    let dead = pool.acquire_at("dead", t0).unwrap();

    assert!(pool.touch_at(alive.port(), t0 + Duration::from_secs(8)));
    let reclaimed = pool.sweep(t0 + Duration::from_secs(12));
    assert_eq!(reclaimed, vec![("dead".to_string(), dead.port())]);
    assert!(!dead.is_held());
    assert!(alive.is_held());
    assert_eq!(pool.lease_of("dead"), None);
}

#[test]
fn test_pinned_port_stays_out_of_circulation() {
    let pool = allocator(1, Duration::ZERO);
    let lease = pool.acquire("a").unwrap();
    let pin = pool.pin(lease.port());
    assert!(lease.release());

    assert_eq!(pool.acquire("b").err(), Some(PortError::ExhaustedPool));
    drop(pin);
    assert!(pool.acquire("b").is_ok());
}

#[derive(Debug, Clone)]
enum Op {
    Acquire(usize),
    Release(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..10).prop_map(Op::Acquire),
        (0usize..10).prop_map(Op::Release),
    ]
}

proptest! {
    /// No two live leases ever share a port, and a streamer holds at most one
    #[test]
    fn prop_live_leases_never_collide(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let pool = allocator(6, Duration::ZERO);
        let mut held = HashMap::new();

        for op in ops {
            match op {
                Op::Acquire(s) => {
                    let id = format!("s{}", s);
                    match pool.acquire(&id) {
                        Ok(lease) => {
                            prop_assert!(!held.contains_key(&s));
                            held.insert(s, lease);
                        }
                        Err(PortError::AlreadyLeased { .. }) => prop_assert!(held.contains_key(&s)),
                        Err(PortError::ExhaustedPool) => prop_assert_eq!(held.len(), 6),
                        Err(e) => prop_assert!(false, "unexpected error {:?}", e),
                    }
                }
                Op::Release(s) => {
                    if let Some(lease) = held.remove(&s) {
                        prop_assert!(lease.release());
                    }
                }
            }

            let ports: HashSet<u16> = held.values().map(|l| l.port()).collect();
            prop_assert_eq!(ports.len(), held.len());
            prop_assert_eq!(pool.leased_count(), held.len());
        }
    }
}
