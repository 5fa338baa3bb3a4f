//! In-memory volume contents.
//!
//! The [`BackingStore`] is one contiguous byte region addressed by byte offset.
//! It backs both the local target and the storage server. Every access is
//! checked against the region's bounds before any byte moves.
//!
//! # Concurrency
//!
//! The region sits behind a single reader/writer lock. Any number of reads
//! proceed together; a write excludes everything else for its duration. Each
//! request is therefore applied atomically with respect to every other
//! request, overlapping or not.
//!
//! Zero-copy reads hand out a [`StoreReadGuard`]: a shared borrow of the
//! region that keeps writers out until the guard is dropped, typically right
//! after the reply that references it has been written.
mod store;

pub use store::{BackingStore, StoreReadGuard, check_range};

pub mod error {
    use thiserror::Error;

    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    pub enum StorageError {
        #[error("failed to allocate {size} bytes of backing storage")]
        Allocation { size: usize },

        #[error("[{offset}, {offset}+{len}) is outside a {capacity} byte region")]
        OutOfBounds { offset: u64, len: u64, capacity: u64 },
    }
}

pub use error::StorageError;
