use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// A word-addressed shared memory region.
///
/// Cloning a `Region` yields another view of the same memory; the driver is
/// responsible for making the backing storage visible to both sides of a
/// link (the in-process reference driver simply shares the allocation).
#[derive(Clone)]
pub struct Region {
    words: Arc<[AtomicU64]>,
}

impl Region {
    /// Allocate a zeroed region of `num_words` 64-bit words.
    pub fn allocate(num_words: usize) -> Self {
        let words: Vec<AtomicU64> = (0..num_words).map(|_| AtomicU64::new(0)).collect();
        Self {
            words: words.into(),
        }
    }

    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    pub fn word(&self, index: usize) -> &AtomicU64 {
        &self.words[index]
    }

    /// A view of `len` words starting at `offset`.
    pub fn words(&self, offset: usize, len: usize) -> &[AtomicU64] {
        &self.words[offset..offset + len]
    }

    /// True if both views refer to the same underlying allocation.
    pub fn same_memory(&self, other: &Region) -> bool {
        Arc::ptr_eq(&self.words, &other.words)
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("len_words", &self.words.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;

    #[test]
    fn clones_share_memory() {
        let a = Region::allocate(16);
        let b = a.clone();
        a.word(3).store(99, Ordering::Relaxed);
        assert_eq!(b.word(3).load(Ordering::Relaxed), 99);
        assert!(a.same_memory(&b));
        assert!(!a.same_memory(&Region::allocate(16)));
    }
}
