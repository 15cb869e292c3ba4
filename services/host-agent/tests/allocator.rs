//! Integration tests for vsock port allocation across allocators.
//!
//! Several allocators share one claims directory, the way agents for
//! different VMs on one host do.

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

use tempfile::TempDir;
use vmfwd_host_agent::vsock::{AllocatorError, ClaimOnlyProbe, VsockPortAllocator};

const MIN: u32 = 1024;
const MAX: u32 = 1123;

fn allocator(dir: &TempDir) -> VsockPortAllocator {
    VsockPortAllocator::new(dir.path(), MIN, MAX, 64, Box::new(ClaimOnlyProbe)).unwrap()
}

#[test]
fn test_concurrent_allocators_never_share_a_port() {
    let dir = TempDir::new().unwrap();
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let allocator = allocator(&dir);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let ports: Vec<u32> = (0..10).map(|_| allocator.allocate().unwrap()).collect();
                // keep the claims alive until every thread is done
                barrier.wait();
                (allocator, ports)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let mut seen = BTreeSet::new();
    for (_, ports) in &results {
        for port in ports {
            assert!((MIN..=MAX).contains(port));
            assert!(seen.insert(*port), "port {port} handed out twice");
        }
    }
    assert_eq!(seen.len(), 40);
}

#[test]
fn test_released_port_can_be_claimed_by_another_allocator() {
    let dir = TempDir::new().unwrap();
    let first = VsockPortAllocator::new(dir.path(), MIN, MIN, 8, Box::new(ClaimOnlyProbe)).unwrap();
    let second = VsockPortAllocator::new(dir.path(), MIN, MIN, 8, Box::new(ClaimOnlyProbe)).unwrap();

    let port = first.allocate().unwrap();
    assert!(matches!(
        second.allocate(),
        Err(AllocatorError::ResourceExhausted { .. })
    ));

    first.release(port);
    assert_eq!(second.allocate().unwrap(), port);
}

#[test]
fn test_dropped_allocator_frees_its_claims() {
    let dir = TempDir::new().unwrap();
    let first = VsockPortAllocator::new(dir.path(), MIN, MIN, 8, Box::new(ClaimOnlyProbe)).unwrap();
    first.allocate().unwrap();
    drop(first);

    let second = VsockPortAllocator::new(dir.path(), MIN, MIN, 8, Box::new(ClaimOnlyProbe)).unwrap();
    assert_eq!(second.allocate().unwrap(), MIN);
}
