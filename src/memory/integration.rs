#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::binned::BinnedAllocator;
    use crate::memory::config::{ArenaParams, EnvOverrides};
    use crate::memory::malloc::{Malloc, SystemMalloc};
    use crate::memory::platform::{AllocatorKind, MallocContext};
    use crate::memory::proxy::BlockProxyAllocator;
    use crate::memory::vm::HeapVm;
    use crate::sync::Arc;
    use crate::sync::thread;
    use std::ptr::NonNull;

    const MB: usize = 1 << 20;

    fn params() -> ArenaParams {
        ArenaParams {
            pool_reserved_size: 4 * MB,
            ..ArenaParams::default()
        }
    }

    fn binned() -> Arc<BinnedAllocator> {
        Arc::new(BinnedAllocator::with_vm(Arc::new(HeapVm::new()), params()).unwrap())
    }

    /// Fill `len` bytes with a pattern derived from `seed`.
    unsafe fn paint(ptr: NonNull<u8>, len: usize, seed: usize) {
        for i in 0..len {
            // Safety: caller provides `len` writable bytes.
            unsafe { ptr.as_ptr().add(i).write((seed.wrapping_mul(31) ^ i) as u8) };
        }
    }

    unsafe fn painted(ptr: NonNull<u8>, len: usize, seed: usize) -> bool {
        // Safety: caller provides `len` readable bytes.
        (0..len).all(|i| unsafe { ptr.as_ptr().add(i).read() } == (seed.wrapping_mul(31) ^ i) as u8)
    }

    #[test]
    fn test_integration_variants_stress_mix() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Every variant behind the same trait, interleaved.
        let binned = BinnedAllocator::with_vm(Arc::new(HeapVm::new()), params()).unwrap();
        let variants: [&dyn Malloc; 2] = [&binned, &SystemMalloc];

        let mut live: Vec<(usize, NonNull<u8>, usize, usize)> = Vec::new();
        for i in 0..600usize {
            let which = i % variants.len();
            let size = match i % 7 {
                0 => 200_000,
                1 => 1,
                n => 24 << n,
            };
            let ptr = variants[which].allocate(size, 16).unwrap();
            // Safety: Test code.
            unsafe { paint(ptr, size.min(256), i) };
            live.push((which, ptr, size, i));

            if i % 5 == 4 {
                let (w, p, size, seed) = live.swap_remove(i % live.len());
                // Safety: Test code.
                unsafe {
                    assert!(painted(p, size.min(256), seed), "{} block corrupted", variants[w].name());
                    variants[w].free(p).unwrap();
                }
            }
        }
        for (w, p, size, seed) in live.drain(..) {
            // Safety: Test code.
            unsafe {
                assert!(painted(p, size.min(256), seed));
                variants[w].free(p).unwrap();
            }
        }
        binned.trim(true);
        assert!(binned.validate_heap());
        let stats = binned.stats();
        assert_eq!(stats.os_allocations, 0);
        assert_eq!(stats.live_small_bytes(), 0);
    }

    #[test]
    fn test_integration_thread_contention() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Threads share one allocator; each checks its own canaries.
        let alloc = binned();
        let num_threads = 8usize;
        let iters = 300usize;
        let barrier = Arc::new(crate::sync::barrier::Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let a = alloc.clone();
                let b = barrier.clone();
                thread::spawn(move || {
                    let mut ptrs = Vec::with_capacity(iters);
                    b.wait();
                    for i in 0..iters {
                        let size = if i % 50 == 0 { 70_000 } else { 16 << (i % 9) };
                        let ptr = a.allocate(size, 16).unwrap();
                        // Safety: Test code.
                        unsafe { paint(ptr, size.min(128), t * iters + i) };
                        ptrs.push((ptr.as_ptr() as usize, size, t * iters + i));
                    }
                    for &(addr, size, seed) in &ptrs {
                        let ptr = NonNull::new(addr as *mut u8).unwrap();
                        // Safety: Test code.
                        unsafe {
                            assert!(painted(ptr, size.min(128), seed), "thread {t} block {addr:#x} corrupted");
                            a.free(ptr).unwrap();
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        alloc.trim(true);
        let stats = alloc.stats();
        assert_eq!(stats.registered_thread_caches, 0, "exited threads detach");
        assert_eq!(stats.live_small_bytes(), 0);
        assert_eq!(stats.os_allocations, 0);
        assert!(alloc.validate_heap());
    }

    #[test]
    fn test_integration_producer_consumer() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Blocks allocated on one thread are freed on another; bundles
        // travel through the recycler.
        let alloc = binned();
        let (tx, rx) = std::sync::mpsc::channel::<usize>();

        let producer = {
            let a = alloc.clone();
            thread::spawn(move || {
                for i in 0..2000usize {
                    let ptr = a.allocate(48, 16).unwrap();
                    // Safety: Test code.
                    unsafe { paint(ptr, 48, i) };
                    tx.send(ptr.as_ptr() as usize).unwrap();
                }
            })
        };
        let consumer = {
            let a = alloc.clone();
            thread::spawn(move || {
                let mut n = 0usize;
                for addr in rx {
                    let ptr = NonNull::new(addr as *mut u8).unwrap();
                    // Safety: Test code.
                    unsafe {
                        assert!(painted(ptr, 48, n));
                        a.free(ptr).unwrap();
                    }
                    n += 1;
                }
                n
            })
        };
        producer.join().unwrap();
        assert_eq!(consumer.join().unwrap(), 2000);

        alloc.trim(true);
        assert_eq!(alloc.stats().live_small_bytes(), 0);
        assert!(alloc.validate_heap());
    }

    #[test]
    fn test_integration_trim_reaches_other_threads() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = binned();
        let filled = Arc::new(crate::sync::barrier::Barrier::new(2));
        let trimmed = Arc::new(crate::sync::barrier::Barrier::new(2));
        let touched = Arc::new(crate::sync::barrier::Barrier::new(2));

        let worker = {
            let (a, filled, trimmed, touched) = (alloc.clone(), filled.clone(), trimmed.clone(), touched.clone());
            thread::spawn(move || {
                let ptrs: Vec<_> = (0..100).map(|_| a.allocate(64, 16).unwrap()).collect();
                for p in ptrs {
                    // Safety: Test code.
                    unsafe { a.free(p).unwrap() };
                }
                filled.wait();
                trimmed.wait();
                // The pending flush is honoured on the next call.
                let p = a.allocate(64, 16).unwrap();
                // Safety: Test code.
                unsafe { a.free(p).unwrap() };
                touched.wait();
            })
        };

        filled.wait();
        let before = alloc.stats().thread_cached_bytes;
        assert!(before >= 64 * 64, "worker cache holds its freed blocks");
        alloc.trim(true);
        trimmed.wait();
        touched.wait();
        let after = alloc.stats().thread_cached_bytes;
        assert!(after < before, "worker flushed: {before} -> {after}");
        worker.join().unwrap();
        assert!(alloc.validate_heap());
    }

    #[test]
    fn test_integration_leak_check() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let vm = Arc::new(HeapVm::new());
        let alloc = BinnedAllocator::with_vm(vm.clone(), params()).unwrap();
        let slab = alloc.params().slab_size;

        for round in 0..3 {
            let ptrs: Vec<_> = (0..2000usize)
                .map(|i| alloc.allocate(16 << (i % 10), 16).unwrap())
                .collect();
            assert!(alloc.stats().small_committed_bytes(slab) > 0);
            for p in ptrs {
                // Safety: Test code.
                unsafe { alloc.free(p).unwrap() };
            }
            alloc.trim(true);
            let stats = alloc.stats();
            assert_eq!(stats.small_committed_bytes(slab), 0, "round {round}: slabs left committed");
            assert_eq!(stats.thread_cached_bytes, 0);
            assert_eq!(vm.committed_bytes(), 0, "round {round}: provider still holds commits");
        }
    }

    #[test]
    fn test_integration_oom_handling() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // A commit budget of two slabs: small requests fail cleanly once it
        // is spent, and freeing restores service.
        let vm = Arc::new(HeapVm::with_commit_limit(128 * 1024));
        let alloc = BinnedAllocator::with_vm(
            vm,
            ArenaParams {
                per_thread_caches: false,
                ..params()
            },
        )
        .unwrap();

        let mut ptrs = Vec::new();
        let err = loop {
            match alloc.allocate(4096, 16) {
                Ok(p) => ptrs.push(p),
                Err(e) => break e,
            }
            assert!(ptrs.len() < 1000, "budget never ran out");
        };
        assert!(err.is_out_of_memory());
        assert!(!ptrs.is_empty());
        let p = ptrs.pop().unwrap();
        // Safety: Test code.
        unsafe { alloc.free(p).unwrap() };
        let again = alloc.allocate(4096, 16).unwrap();
        ptrs.push(again);
        for p in ptrs {
            // Safety: Test code.
            unsafe { alloc.free(p).unwrap() };
        }
        assert!(alloc.validate_heap());
    }

    #[test]
    fn test_integration_context_lifecycle() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Bring-up, use, teardown, then a second independent context.
        for forced in [None, Some(AllocatorKind::System), Some(AllocatorKind::Binned)] {
            let env = EnvOverrides {
                allocator: forced,
                ..EnvOverrides::default()
            };
            let ctx = MallocContext::with_env(&env, Arc::new(HeapVm::new()), params());
            assert_eq!(ctx.kind(), forced.unwrap_or(AllocatorKind::Binned));
            let m = ctx.malloc();
            let ptrs: Vec<_> = (0..64).map(|i| m.allocate(8 + i * 40, 8).unwrap()).collect();
            for (i, &p) in ptrs.iter().enumerate() {
                assert!(m.get_allocation_size(p).unwrap() >= 8 + i * 40);
            }
            for p in ptrs {
                // Safety: Test code.
                unsafe { m.free(p).unwrap() };
            }
            assert!(m.validate_heap());
            ctx.teardown();
        }
    }

    #[test]
    fn test_integration_proxy_alongside_binned() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Proxy and CPU allocators never hand out overlapping addresses, and
        // neither recognizes the other's pointers.
        let cpu = binned();
        let gpu = BlockProxyAllocator::new(Arc::new(HeapVm::new()), params()).unwrap();

        let c = cpu.allocate(256, 16).unwrap();
        let g = gpu.allocate(256, 16).unwrap();
        assert!(cpu.owns(c) && !cpu.owns(g));
        assert!(gpu.get_allocation_size(c).is_none());
        assert_eq!(gpu.get_allocation_size(g), Some(cpu.get_allocation_size(c).unwrap()));
        // Safety: Test code.
        unsafe {
            assert!(gpu.free(c).is_err());
            gpu.free(g).unwrap();
            cpu.free(c).unwrap();
        }
        assert!(gpu.validate_heap() && cpu.validate_heap());
    }
}
