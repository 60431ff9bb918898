//! Concurrency and model tests for the lock-free pool

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use rs_railnode::pool::{Handle, LockFreePool};

const SLOTS: usize = 8;

static POOL: LockFreePool<u64, SLOTS> = LockFreePool::new();

#[test]
fn concurrent_acquire_never_shares_a_slot() {
    let owned: Arc<[AtomicBool; SLOTS]> = Arc::new(std::array::from_fn(|_| AtomicBool::new(false)));

    let workers: Vec<_> = (0..6u64)
        .map(|id| {
            let owned = Arc::clone(&owned);
            thread::spawn(move || {
                for round in 0..20_000u64 {
                    // Six threads holding one slot each never exhaust eight.
                    let mut handle = POOL.acquire(1).expect("pool exhausted");
                    let index = handle.index();
                    assert!(index < SLOTS);
                    assert!(
                        !owned[index].swap(true, Ordering::AcqRel),
                        "slot {index} handed out twice"
                    );

                    let stamp = (id << 32) | round;
                    *handle.get_mut().unwrap() = stamp;
                    if round % 3 == 0 {
                        let shared = handle.clone();
                        assert_eq!(*shared, stamp);
                    }
                    thread::yield_now();
                    assert_eq!(*handle, stamp);

                    owned[index].store(false, Ordering::Release);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(POOL.in_use(), 0);
}

#[test]
fn handles_cross_threads_and_release_on_last_drop() {
    let pool: &'static LockFreePool<Vec<u8>, 2> = Box::leak(Box::new(LockFreePool::new()));
    let mut handle = pool.acquire(1).unwrap();
    handle.get_mut().unwrap().extend_from_slice(b"status");

    let copies: Vec<Handle<'static, Vec<u8>, 2>> = (0..4).map(|_| handle.clone()).collect();
    drop(handle);

    let readers: Vec<_> = copies
        .into_iter()
        .map(|copy| thread::spawn(move || copy.as_slice() == b"status"))
        .collect();
    for reader in readers {
        assert!(reader.join().unwrap());
    }
    assert_eq!(pool.in_use(), 0);
}

#[derive(Clone, Debug)]
enum Op {
    Acquire,
    Clone(usize),
    Drop(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Acquire),
        any::<usize>().prop_map(Op::Clone),
        any::<usize>().prop_map(Op::Drop),
    ]
}

proptest! {
    /// Pool bookkeeping matches a model of live handles.
    #[test]
    fn pool_matches_model(ops in prop::collection::vec(op(), 1..200)) {
        let pool: LockFreePool<u32, 4> = LockFreePool::new();
        let mut held: Vec<Handle<'_, u32, 4>> = Vec::new();

        for op in ops {
            match op {
                Op::Acquire => {
                    let mut live: Vec<usize> = held.iter().map(Handle::index).collect();
                    live.sort_unstable();
                    live.dedup();
                    match pool.acquire(1) {
                        Some(handle) => {
                            prop_assert!(live.len() < 4);
                            prop_assert!(!live.contains(&handle.index()));
                            prop_assert_eq!(*handle, 0);
                            held.push(handle);
                        }
                        None => {
                            prop_assert_eq!(live.len(), 4);
                        }
                    }
                }
                Op::Clone(i) if !held.is_empty() => {
                    let copy = held[i % held.len()].clone();
                    held.push(copy);
                }
                Op::Drop(i) if !held.is_empty() => {
                    let n = held.len();
                    held.swap_remove(i % n);
                }
                _ => {}
            }

            let mut live: Vec<usize> = held.iter().map(Handle::index).collect();
            live.sort_unstable();
            live.dedup();
            prop_assert_eq!(pool.in_use(), live.len());
            for index in live {
                let refs = held.iter().filter(|h| h.index() == index).count();
                let handle = held.iter().find(|h| h.index() == index).unwrap();
                prop_assert_eq!(handle.ref_count() as usize, refs);
            }
        }

        held.clear();
        prop_assert_eq!(pool.in_use(), 0);
    }

    /// Reserved references are all accounted for whatever mix is claimed.
    #[test]
    fn reserved_references_balance(extra in 0u32..6, claim in 0u32..6) {
        let pool: LockFreePool<u8, 2> = LockFreePool::new();
        let handle = pool.acquire(1 + extra).unwrap();

        let claimed: Vec<_> = (0..claim).filter_map(|_| handle.claim_reserved()).collect();
        prop_assert_eq!(claimed.len() as u32, claim.min(extra));
        prop_assert_eq!(handle.drop_reserved(), extra - claimed.len() as u32);
        prop_assert_eq!(handle.ref_count(), 1 + claimed.len() as u32);

        drop(claimed);
        drop(handle);
        prop_assert_eq!(pool.in_use(), 0);
    }
}
