//! Explicit context threaded through every chain operation
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use crate::config::KeyConfigProvider;
use crate::qr::{RateSource, StaticRates};
use crate::store::DocumentStore;
use crate::types::{DocumentId, TimeStamp};

pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp<Utc> {
        TimeStamp::new()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: TimeStamp<Utc>) -> Self {
        Self {
            now: Mutex::new(start.to_datetime_utc()),
        }
    }

    pub fn set(&self, now: TimeStamp<Utc>) {
        *lock(&self.now) = now.to_datetime_utc();
    }

    pub fn advance(&self, seconds: i64) {
        let mut now = lock(&self.now);
        *now += Duration::seconds(seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeStamp<Utc> {
        TimeStamp::from(*lock(&self.now))
    }
}

pub type YieldHook = Arc<dyn Fn() + Send + Sync>;

pub struct Session {
    store: DocumentStore,
    provider: Arc<KeyConfigProvider>,
    clock: Arc<dyn Clock>,
    rates: Arc<dyn RateSource>,
    yield_hook: Option<YieldHook>,
    // posted documents awaiting a hash at the next flush
    pending: Mutex<BTreeSet<DocumentId>>,
}

impl Session {
    pub fn new(store: DocumentStore, provider: Arc<KeyConfigProvider>) -> Self {
        Self {
            store,
            provider,
            clock: Arc::new(SystemClock),
            rates: Arc::new(StaticRates::default()),
            yield_hook: None,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_rates(mut self, rates: Arc<dyn RateSource>) -> Self {
        self.rates = rates;
        self
    }

    /// Called by long walks between documents so the host can yield.
    pub fn with_yield_hook(mut self, hook: YieldHook) -> Self {
        self.yield_hook = Some(hook);
        self
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn provider(&self) -> &KeyConfigProvider {
        &self.provider
    }

    pub fn now(&self) -> TimeStamp<Utc> {
        self.clock.now()
    }

    pub fn rates(&self) -> &dyn RateSource {
        self.rates.as_ref()
    }

    pub(crate) fn yield_now(&self) {
        if let Some(hook) = &self.yield_hook {
            hook();
        }
    }

    pub(crate) fn mark_pending(&self, id: DocumentId) {
        lock(&self.pending).insert(id);
    }

    pub(crate) fn take_pending(&self) -> BTreeSet<DocumentId> {
        std::mem::take(&mut *lock(&self.pending))
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

// a panicking holder leaves plain data behind, still usable
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
