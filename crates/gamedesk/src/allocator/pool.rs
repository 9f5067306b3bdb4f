//! Bounded numeric id pool with first-fit allocation.

use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::error::{AllocationError, AllocationResult};

/// Allocator over the half-open id range `[low, high)`.
///
/// Single ids and contiguous windows are drawn from the same used-set, so a
/// window never overlaps an id handed out by [`allocate_single`] and vice
/// versa. The internal lock only guards the in-memory set and is never held
/// across I/O.
///
/// [`allocate_single`]: ResourcePool::allocate_single
#[derive(Debug)]
pub struct ResourcePool {
    name: &'static str,
    low: u32,
    high: u32,
    used: Mutex<BTreeSet<u32>>,
}

impl ResourcePool {
    /// Create an empty pool over `range`.
    pub fn new(name: &'static str, range: Range<u32>) -> Self {
        Self {
            name,
            low: range.start,
            high: range.end.max(range.start),
            used: Mutex::new(BTreeSet::new()),
        }
    }

    /// Pool name used in errors and logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The managed id range.
    pub fn range(&self) -> Range<u32> {
        self.low..self.high
    }

    /// Total number of ids in the pool.
    pub fn capacity(&self) -> u32 {
        self.high - self.low
    }

    /// Number of ids currently held.
    pub fn allocated_count(&self) -> usize {
        self.lock().len()
    }

    /// Whether `id` is currently held.
    pub fn is_allocated(&self, id: u32) -> bool {
        self.lock().contains(&id)
    }

    /// Allocate the lowest free id.
    pub fn allocate_single(&self) -> AllocationResult<u32> {
        let mut used = self.lock();
        let id = (self.low..self.high)
            .find(|id| !used.contains(id))
            .ok_or(AllocationError::Exhausted {
                pool: self.name,
                requested: 1,
            })?;
        used.insert(id);
        Ok(id)
    }

    /// Allocate the lowest window of `n` consecutive free ids and return its
    /// first id. Either all `n` ids are reserved or none are.
    pub fn allocate_contiguous(&self, n: u32) -> AllocationResult<u32> {
        if n == 0 {
            return Err(AllocationError::InvalidRequest {
                pool: self.name,
                message: "window width must be at least 1".to_string(),
            });
        }

        let mut used = self.lock();
        let start = first_free_window(&used, self.low, self.high, n).ok_or(
            AllocationError::Exhausted {
                pool: self.name,
                requested: n,
            },
        )?;
        used.extend(start..start + n);
        Ok(start)
    }

    /// Return `id` to the pool. Releasing an id that is not held is a no-op.
    pub fn release(&self, id: u32) {
        self.lock().remove(&id);
    }

    /// Return `n` ids starting at `start` to the pool.
    pub fn release_range(&self, start: u32, n: u32) {
        let mut used = self.lock();
        for id in start..start.saturating_add(n) {
            used.remove(&id);
        }
    }

    /// Mark a specific id as held.
    ///
    /// Returns `false` without changing anything when `id` is outside the
    /// range or already held.
    pub fn reserve(&self, id: u32) -> bool {
        self.reserve_range(id, 1)
    }

    /// Mark `n` ids starting at `start` as held, all or nothing.
    pub fn reserve_range(&self, start: u32, n: u32) -> bool {
        let Some(end) = start.checked_add(n) else {
            return false;
        };
        if n == 0 || start < self.low || end > self.high {
            return false;
        }

        let mut used = self.lock();
        if used.range(start..end).next().is_some() {
            return false;
        }
        used.extend(start..end);
        true
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u32>> {
        // The set is always left consistent, so a poisoned lock is still usable.
        self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Find the first `start` in `[low, high - n]` such that `start..start + n`
/// contains no used id.
fn first_free_window(used: &BTreeSet<u32>, low: u32, high: u32, n: u32) -> Option<u32> {
    let mut start = low;
    loop {
        let end = start.checked_add(n)?;
        if end > high {
            return None;
        }
        // Jump past the highest conflicting id instead of sliding by one.
        match used.range(start..end).next_back() {
            Some(&taken) => start = taken + 1,
            None => return Some(start),
        }
    }
}
