//! Object pools for hot-path allocations (spec.md §5 "Object pools").
//!
//! A pool is a bounded free-list behind a `parking_lot::Mutex`, matching
//! spec.md §9's "free-list... the design cares only that hot-path
//! allocations are amortized". `acquire()` returns a pooled value (or
//! allocates a fresh one via `Default` if the free-list is empty);
//! `release()` clears it and returns it to the list. The handoff rule from
//! spec.md §5 is enforced by callers, not the pool itself: the pool has no
//! way to know who the "last consumer" is, so it is the caller's job not to
//! release a value that is still referenced.

use parking_lot::Mutex;

pub struct Pool<T: Default> {
    free: Mutex<Vec<T>>,
    cap: usize,
}

impl<T: Default> Pool<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(cap.min(1024))),
            cap,
        }
    }

    /// Take a value from the free-list, or allocate a fresh default one.
    pub fn acquire(&self) -> T {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Return a value to the pool after clearing it. Dropped (not retained)
    /// once the free-list reaches `cap`, so the pool stays bounded even
    /// under bursty release patterns.
    pub fn release(&self, mut value: T)
    where
        T: Clearable,
    {
        value.clear();
        let mut free = self.free.lock();
        if free.len() < self.cap {
            free.push(value);
        }
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Implemented by pooled carrier types so `Pool::release` can reset them
/// (strings zeroed, numeric fields reset) before returning them to the
/// free-list, per spec.md §5: "Carriers are cleared... on release".
pub trait Clearable {
    fn clear(&mut self);
}

use crate::quotes::Quote;
use crate::spread::Opportunity;

impl Clearable for Quote {
    fn clear(&mut self) {
        self.venue.clear();
        self.symbol.clear();
        self.bid_price = 0.0;
        self.ask_price = 0.0;
        self.timestamp_ms = 0;
    }
}

impl Clearable for Opportunity {
    fn clear(&mut self) {
        self.symbol.clear();
        self.long_venue.clear();
        self.short_venue.clear();
        self.long_price = 0.0;
        self.short_price = 0.0;
        self.raw_spread = 0.0;
        self.net_spread = 0.0;
        self.source_timestamp_ms = 0;
    }
}
