// Exercises the allocator's worked examples from the messaging core spec
// end-to-end against the in-memory cache + store doubles, so the
// cache-script/refill interaction is covered without a live Redis/Postgres.

use im_allocator::Allocator;
use im_test_support::{InMemorySeqCache, InMemoryStore};

#[tokio::test]
async fn cache_empty_first_allocate_refills_fifty_plus_n() {
    let cache = InMemorySeqCache::new();
    let store = InMemoryStore::new();
    let allocator = Allocator::new(cache, store);

    let (first, last) = allocator.allocate("single:1_2", 1).await.unwrap();
    assert_eq!((first, last), (1, 1));

    let (first2, last2) = allocator.allocate("single:1_2", 1).await.unwrap();
    assert_eq!((first2, last2), (2, 2));
}

#[tokio::test]
async fn group_conversations_refill_with_larger_basic_size() {
    let cache = InMemorySeqCache::new();
    let store = InMemoryStore::new();
    let allocator = Allocator::new(cache, store);

    let (first, last) = allocator.allocate("group:g1", 3).await.unwrap();
    assert_eq!((first, last), (1, 3));
}

#[tokio::test]
async fn window_exhaustion_refills_from_store_and_continues_monotonic() {
    let cache = InMemorySeqCache::new();
    let store = InMemoryStore::new();
    cache.seed(&format!("ConvSeq_SEQ:{}", "single:1_2"), 50, 50);
    store.refill_conversation_seq("single:1_2", 50).await.unwrap();
    let allocator = Allocator::new(cache, store);

    let (first, last) = allocator.allocate("single:1_2", 5).await.unwrap();
    assert_eq!((first, last), (51, 55));

    let (first2, last2) = allocator.allocate("single:1_2", 1).await.unwrap();
    assert_eq!((first2, last2), (56, 56));
}

#[tokio::test]
async fn two_concurrent_senders_get_disjoint_strictly_increasing_ranges() {
    let cache = InMemorySeqCache::new();
    let store = InMemoryStore::new();
    let allocator = std::sync::Arc::new(Allocator::new(cache, store));

    let a = allocator.clone();
    let b = allocator.clone();
    let (r1, r2) = tokio::join!(
        a.allocate("single:1_2", 1),
        b.allocate("single:1_2", 1),
    );
    let (f1, l1) = r1.unwrap();
    let (f2, l2) = r2.unwrap();
    assert_eq!(f1, l1);
    assert_eq!(f2, l2);
    assert_ne!(f1, f2, "concurrent senders must not collide on a seq");
    let (lo, hi) = if f1 < f2 { (f1, f2) } else { (f2, f1) };
    assert_eq!(hi, lo + 1, "no gap between the two assigned seqs");
}

#[tokio::test]
async fn read_only_probe_does_not_advance_the_counter() {
    let cache = InMemorySeqCache::new();
    let store = InMemoryStore::new();
    let allocator = Allocator::new(cache, store);

    assert_eq!(allocator.current_max_seq("single:1_2").await.unwrap(), 0);
    allocator.allocate("single:1_2", 1).await.unwrap();
    assert_eq!(allocator.current_max_seq("single:1_2").await.unwrap(), 1);
    assert_eq!(allocator.current_max_seq("single:1_2").await.unwrap(), 1);
}
