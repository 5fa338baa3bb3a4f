use std::{
    ops::Range,
    sync::{PoisonError, RwLock, RwLockReadGuard},
};

use log::{debug, trace};

use super::StorageError;

#[derive(Debug)]
pub struct BackingStore {
    data: RwLock<Box<[u8]>>,
    capacity: usize,
}

/// Validates `[offset, offset + len)` against a region of `capacity` bytes.
pub fn check_range(offset: u64, len: u64, capacity: u64) -> Result<Range<usize>, StorageError> {
    let out_of_bounds = StorageError::OutOfBounds {
        offset,
        len,
        capacity,
    };
    let end = offset.checked_add(len).ok_or(out_of_bounds.clone())?;
    if end > capacity {
        return Err(out_of_bounds);
    }

    let start = usize::try_from(offset).map_err(|_| out_of_bounds.clone())?;
    let end = usize::try_from(end).map_err(|_| out_of_bounds)?;
    Ok(start..end)
}

impl BackingStore {
    /// Allocates a zeroed region. Allocation failure is reported rather than
    /// aborting the process.
    pub fn new(capacity: usize) -> Result<Self, StorageError> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| StorageError::Allocation { size: capacity })?;
        data.resize(capacity, 0);
        debug!("allocated {capacity} byte backing store");

        Ok(Self {
            data: RwLock::new(data.into_boxed_slice()),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copies `[offset, ..)` into `segments`, filling each in order.
    pub fn read_into(&self, offset: u64, segments: &mut [Vec<u8>]) -> Result<(), StorageError> {
        let range = self.range(offset, total_len(segments))?;
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        trace!("read {:?} into {} segments", range, segments.len());

        let mut src = range.start;
        for segment in segments.iter_mut() {
            let len = segment.len();
            segment.copy_from_slice(&data[src..src + len]);
            src += len;
        }
        Ok(())
    }

    /// Copies `segments` back to back into the region starting at `offset`.
    pub fn write_segments<S: AsRef<[u8]>>(
        &self,
        offset: u64,
        segments: &[S],
    ) -> Result<(), StorageError> {
        let range = self.range(offset, total_len(segments))?;
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        trace!("write {:?} from {} segments", range, segments.len());

        let mut dst = range.start;
        for segment in segments {
            let segment = segment.as_ref();
            data[dst..dst + segment.len()].copy_from_slice(segment);
            dst += segment.len();
        }
        Ok(())
    }

    /// Borrows `[offset, ..)` split into segments of `lens` bytes without
    /// copying.
    pub fn read_view(&self, offset: u64, lens: &[usize]) -> Result<StoreReadGuard<'_>, StorageError> {
        let len: usize = lens.iter().sum();
        let range = self.range(offset, len)?;
        let guard = self.data.read().unwrap_or_else(PoisonError::into_inner);

        Ok(StoreReadGuard {
            guard,
            range,
            lens: lens.to_vec(),
        })
    }

    fn range(&self, offset: u64, len: usize) -> Result<Range<usize>, StorageError> {
        check_range(offset, len as u64, self.capacity as u64)
    }
}

/// Shared borrow of a store range. Writers wait until it is dropped.
#[derive(Debug)]
pub struct StoreReadGuard<'a> {
    guard: RwLockReadGuard<'a, Box<[u8]>>,
    range: Range<usize>,
    lens: Vec<usize>,
}

impl StoreReadGuard<'_> {
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        let data = &self.guard[self.range.clone()];
        self.lens.iter().scan(0, move |start, len| {
            let segment = &data[*start..*start + len];
            *start += len;
            Some(segment)
        })
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

fn total_len<S: AsRef<[u8]>>(segments: &[S]) -> usize {
    segments.iter().map(|segment| segment.as_ref().len()).sum()
}
