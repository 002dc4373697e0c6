use binalloc::{AllocatorKind, GlobalMalloc};
use std::collections::HashMap;

#[global_allocator]
static ALLOC: GlobalMalloc = GlobalMalloc::new();

#[test]
fn collections_round_trip() {
    let mut map: HashMap<String, Vec<u64>> = HashMap::new();
    for i in 0..2_000u64 {
        map.entry(format!("key-{}", i % 97)).or_default().push(i);
    }
    assert_eq!(map.len(), 97);
    let total: u64 = map.values().flatten().sum();
    assert_eq!(total, (0..2_000).sum());
    assert!(ALLOC.kind().is_some(), "bring-up ran on first allocation");
}

#[test]
fn growth_crosses_the_large_threshold() {
    let mut v: Vec<u8> = Vec::new();
    for i in 0..(1 << 20) {
        v.push((i % 251) as u8);
    }
    assert!(v.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
    v.truncate(10);
    v.shrink_to_fit();
    assert_eq!(v, (0..10).collect::<Vec<u8>>());

    let big = vec![0u8; 3 << 20];
    assert!(big.iter().all(|&b| b == 0));
}

#[test]
fn over_aligned_layouts() {
    #[repr(align(4096))]
    struct Page([u8; 4096]);
    #[repr(align(65536))]
    struct Huge([u8; 16]);

    let pages: Vec<Box<Page>> = (0..8).map(|_| Box::new(Page([7; 4096]))).collect();
    for p in &pages {
        assert!((std::ptr::from_ref::<Page>(p) as usize).is_multiple_of(4096));
        assert_eq!(p.0[4095], 7);
    }
    let huge = Box::new(Huge([1; 16]));
    assert!((std::ptr::from_ref::<Huge>(&huge) as usize).is_multiple_of(65536));
}

#[test]
fn threads_share_the_process_allocator() {
    let handles: Vec<_> = (0..8)
        .map(|t| {
            std::thread::spawn(move || {
                let strings: Vec<String> = (0..500).map(|i| format!("{t}:{i}:{}", "x".repeat(i % 40))).collect();
                strings.iter().map(String::len).sum::<usize>()
            })
        })
        .collect();
    let lens: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(lens.windows(2).all(|w| w[0] == w[1]));

    if let Some(binned) = ALLOC.binned() {
        assert_eq!(ALLOC.kind(), Some(AllocatorKind::Binned));
        ALLOC.trim(true);
        assert!(binned.validate_heap());
        let mut report = String::new();
        binned.dump_allocator_stats(&mut report).unwrap();
        assert!(report.contains("BinnedAllocator"));
    }
}
