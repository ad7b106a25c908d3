//! Signature-keyed cache of compiled kernel entry points.
//!
//! One cache instance exists per `(index_width, rowwise_sparse)` pair; the
//! key inside an instance is the remaining kernel signature. Concurrent
//! `get_or_create` calls for distinct signatures compile in parallel;
//! concurrent calls for the same signature run the producer exactly once
//! and every caller observes the same entry point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::types::KernelSignature;

/// Entry point of installed kernel code.
///
/// The address stays valid for the lifetime of the process: the code buffer
/// is owned by the process-wide [`crate::executable::JitRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodePtr(pub *const u8);

// SAFETY: the pointee is immutable executable code owned by the process-wide
// JIT runtime; sharing the address across threads is sound.
unsafe impl Send for CodePtr {}
unsafe impl Sync for CodePtr {}

type Slot = Arc<OnceLock<Option<CodePtr>>>;

/// Maps kernel signatures to compiled entry points.
#[derive(Default)]
pub struct KernelCache {
    entries: Mutex<HashMap<KernelSignature, Slot>>,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached entry point for `sig`, invoking `produce` on the
    /// first call. A `None` from the producer (emission or installation
    /// failure) is cached as an error sentinel; no retry is attempted.
    ///
    /// The map lock is held only to fetch the per-signature slot, never
    /// while the producer runs, so distinct signatures compile in parallel.
    /// Callers racing on the same signature block until the single producer
    /// finishes.
    pub fn get_or_create<F>(&self, sig: KernelSignature, produce: F) -> Option<CodePtr>
    where
        F: FnOnce() -> Option<CodePtr>,
    {
        let slot: Slot = {
            let mut entries = self.entries.lock().unwrap();
            entries.entry(sig).or_default().clone()
        };
        *slot.get_or_init(produce)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sig(block_size: usize) -> KernelSignature {
        KernelSignature {
            bit_rate: 4,
            block_size,
            has_weight: false,
            is_weight_positional: false,
            normalize_by_lengths: false,
            prefetch: 0,
        }
    }

    #[test]
    fn hit_returns_same_pointer() {
        let cache = KernelCache::new();
        let a = cache.get_or_create(sig(8), || Some(CodePtr(0x1000 as *const u8)));
        let b = cache.get_or_create(sig(8), || unreachable!("producer must not rerun"));
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failure_is_cached_as_sentinel() {
        let cache = KernelCache::new();
        let calls = AtomicUsize::new(0);
        let r = cache.get_or_create(sig(16), || {
            calls.fetch_add(1, Ordering::SeqCst);
            None
        });
        assert!(r.is_none());
        let r = cache.get_or_create(sig(16), || {
            calls.fetch_add(1, Ordering::SeqCst);
            None
        });
        assert!(r.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_same_signature_compiles_once() {
        let cache = Arc::new(KernelCache::new());
        let produced = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let cache = Arc::clone(&cache);
            let produced = Arc::clone(&produced);
            handles.push(std::thread::spawn(move || {
                cache.get_or_create(sig(32), || {
                    produced.fetch_add(1, Ordering::SeqCst);
                    Some(CodePtr(0x2000 as *const u8))
                })
            }));
        }
        let ptrs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(produced.load(Ordering::SeqCst), 1);
        assert!(ptrs.iter().all(|p| *p == ptrs[0]));
    }

    #[test]
    fn distinct_signatures_get_distinct_slots() {
        let cache = KernelCache::new();
        let a = cache.get_or_create(sig(8), || Some(CodePtr(0x10 as *const u8)));
        let b = cache.get_or_create(sig(9), || Some(CodePtr(0x20 as *const u8)));
        assert_ne!(a, b);
        assert_eq!(cache.len(), 2);
    }
}
