//! Time-expiring store for relationship lookups.
//!
//! One instance lives for one CLI invocation. It is not synchronized; mutation
//! goes through `&mut self`.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::domain::{DatasetCode, RelationKind, RelationshipRecord};

pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(15 * 60);

pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Cell::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: RelationKind,
    pub code: DatasetCode,
}

impl CacheKey {
    pub fn new(kind: RelationKind, code: &DatasetCode) -> Self {
        Self {
            kind,
            code: code.clone(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind, self.code)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    records: Vec<RelationshipRecord>,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct RelationshipCache<C: Clock = SystemClock> {
    clock: C,
    expiry: Duration,
    entries: HashMap<CacheKey, CacheEntry>,
}

impl RelationshipCache<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock, DEFAULT_EXPIRY)
    }
}

impl Default for RelationshipCache<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> RelationshipCache<C> {
    pub fn with_clock(clock: C, expiry: Duration) -> Self {
        Self {
            clock,
            expiry,
            entries: HashMap::new(),
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// `None` is a miss. `Some(&[])` is a cached empty result and counts as a hit.
    pub fn get(&self, key: &CacheKey) -> Option<&[RelationshipRecord]> {
        let entry = self.entries.get(key)?;
        let age = self.clock.now().saturating_duration_since(entry.stored_at);
        if age < self.expiry {
            Some(entry.records.as_slice())
        } else {
            None
        }
    }

    pub fn put(&mut self, key: CacheKey, records: Vec<RelationshipRecord>) {
        let entry = CacheEntry {
            records,
            stored_at: self.clock.now(),
        };
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
