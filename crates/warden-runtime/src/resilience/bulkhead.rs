//! Per-resource concurrency isolation.
//!
//! Each resource gets its own semaphore sized to the configured limit. A
//! slot is held by a [`BulkheadPermit`] and returned when it drops, so
//! normal returns, failures and cancellation all free the slot.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use warden_core::{BulkheadConfig, Failure, FailureKind, WardenConfig};

/// Semaphore plus the counters reported for one resource.
#[derive(Debug)]
struct Slots {
    semaphore: Arc<Semaphore>,
    active: AtomicU32,
    peak: AtomicU32,
    /// Permits still to retire after a limit decrease, taken as they come back
    excess: AtomicU32,
}

#[derive(Debug)]
struct Compartment {
    slots: Arc<Slots>,
    limit: u32,
    timeout: Duration,
}

impl Compartment {
    fn new(config: &BulkheadConfig) -> Self {
        Self {
            slots: Arc::new(Slots {
                semaphore: Arc::new(Semaphore::new(config.limit as usize)),
                active: AtomicU32::new(0),
                peak: AtomicU32::new(0),
                excess: AtomicU32::new(0),
            }),
            limit: config.limit,
            timeout: config.timeout,
        }
    }

    fn resize(&mut self, limit: u32) {
        let slots = &self.slots;
        if limit > self.limit {
            let mut grow = limit - self.limit;
            // Cancel pending retirements before handing out new permits
            while grow > 0 {
                match slots
                    .excess
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                {
                    Ok(_) => grow -= 1,
                    Err(_) => break,
                }
            }
            slots.semaphore.add_permits(grow as usize);
        } else {
            let shrink = (self.limit - limit) as usize;
            let retired = slots.semaphore.forget_permits(shrink);
            slots
                .excess
                .fetch_add((shrink - retired) as u32, Ordering::SeqCst);
        }
        self.limit = limit;
    }
}

/// Concurrency limiter keyed by resource.
pub struct Bulkhead {
    compartments: Mutex<HashMap<String, Compartment>>,
    defaults: BulkheadConfig,
}

/// A held bulkhead slot. Dropping it frees the slot.
#[must_use = "the slot is released as soon as the permit is dropped"]
#[derive(Debug)]
pub struct BulkheadPermit {
    resource: String,
    slots: Arc<Slots>,
    permit: Option<OwnedSemaphorePermit>,
}

impl BulkheadPermit {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.slots.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(permit) = self.permit.take() {
            let retire = self
                .slots
                .excess
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if retire {
                permit.forget();
            }
        }
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("resources", &self.compartments.lock().len())
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl Bulkhead {
    /// Create a bulkhead with default per-resource settings.
    pub fn new(defaults: BulkheadConfig) -> Self {
        Self {
            compartments: Mutex::new(HashMap::new()),
            defaults,
        }
    }

    /// Build from a config document, registering every configured resource.
    pub fn from_config(config: &WardenConfig) -> Self {
        let bulkhead = Self::new(config.resolve_defaults().bulkhead);
        for name in config.resource_names() {
            let settings = config.resolve(name).bulkhead;
            bulkhead.set_limit(name, settings.limit);
            bulkhead.set_timeout(name, settings.timeout);
        }
        bulkhead
    }

    fn slots_for(&self, resource: &str) -> (Arc<Slots>, Duration) {
        let mut compartments = self.compartments.lock();
        let compartment = compartments
            .entry(resource.to_string())
            .or_insert_with(|| Compartment::new(&self.defaults));
        (compartment.slots.clone(), compartment.timeout)
    }

    /// Acquire a slot, waiting up to the resource's timeout.
    ///
    /// A zero timeout fails fast. `max_concurrent` can only tighten the
    /// configured limit: it is checked once a slot is granted, and a call
    /// over it fails without waiting further.
    pub async fn acquire(
        &self,
        resource: &str,
        max_concurrent: Option<u32>,
    ) -> Result<BulkheadPermit, Failure> {
        let (slots, timeout) = self.slots_for(resource);
        let semaphore = slots.semaphore.clone();

        let permit = if timeout.is_zero() {
            semaphore.try_acquire_owned().map_err(|_| {
                tracing::debug!(resource = %resource, "Bulkhead full");
                Failure::bulkhead_timeout(resource, timeout)
            })?
        } else {
            match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(Failure::bulkhead_timeout(resource, timeout)),
                Err(_) => {
                    tracing::warn!(resource = %resource, waited = ?timeout, "Bulkhead slot wait timed out");
                    return Err(Failure::bulkhead_timeout(resource, timeout));
                }
            }
        };

        let active = slots.active.fetch_add(1, Ordering::SeqCst) + 1;
        let held = BulkheadPermit {
            resource: resource.to_string(),
            slots,
            permit: Some(permit),
        };

        if let Some(cap) = max_concurrent {
            if active > cap {
                return Err(Failure::new(
                    FailureKind::BulkheadTimeout,
                    format!("'{}' already has {} calls in flight (cap {})", resource, active - 1, cap),
                ));
            }
        }

        held.slots.peak.fetch_max(active, Ordering::SeqCst);
        Ok(held)
    }

    /// Run `action` while holding a slot.
    pub async fn try_execute<F, Fut, T>(
        &self,
        resource: &str,
        action: F,
        max_concurrent: Option<u32>,
    ) -> Result<T, Failure>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let _permit = self.acquire(resource, max_concurrent).await?;
        action().await
    }

    /// Change the limit. Slots already held are not revoked; a smaller limit
    /// takes effect as they are returned.
    pub fn set_limit(&self, resource: &str, limit: u32) {
        self.compartments
            .lock()
            .entry(resource.to_string())
            .or_insert_with(|| Compartment::new(&self.defaults))
            .resize(limit);
    }

    /// Change how long acquisitions wait for a slot.
    pub fn set_timeout(&self, resource: &str, timeout: Duration) {
        self.compartments
            .lock()
            .entry(resource.to_string())
            .or_insert_with(|| Compartment::new(&self.defaults))
            .timeout = timeout;
    }

    /// Slots currently held.
    pub fn active(&self, resource: &str) -> u32 {
        self.compartments
            .lock()
            .get(resource)
            .map(|c| c.slots.active.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Highest number of slots ever held at once.
    pub fn peak(&self, resource: &str) -> u32 {
        self.compartments
            .lock()
            .get(resource)
            .map(|c| c.slots.peak.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Configured limit.
    pub fn limit(&self, resource: &str) -> u32 {
        self.compartments
            .lock()
            .get(resource)
            .map(|c| c.limit)
            .unwrap_or(self.defaults.limit)
    }
}

impl Default for Bulkhead {
    fn default() -> Self {
        Self::new(BulkheadConfig::default())
    }
}
