use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::metrics_consts::{SENDER_IN_FLIGHT, SENDER_PERMIT_WAIT_MS};

/// Bounded gate on records dispatched but not yet resolved.
///
/// A permit is taken before a record is pulled from the input and is held until its
/// result has been handed to the result stream, so the in-flight count covers the
/// whole dispatch, retry and report cycle.
#[derive(Debug)]
pub struct InFlightLimiter {
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    in_flight: AtomicUsize,
    high_water_mark: AtomicUsize,
}

impl InFlightLimiter {
    pub fn new(max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            in_flight: AtomicUsize::new(0),
            high_water_mark: AtomicUsize::new(0),
        }
    }

    /// Wait for capacity. Returns `None` once the limiter has been closed.
    pub async fn acquire(self: &Arc<Self>) -> Option<InFlightPermit> {
        let start = Instant::now();
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        metrics::histogram!(SENDER_PERMIT_WAIT_MS).record(start.elapsed().as_millis() as f64);

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water_mark.fetch_max(in_flight, Ordering::SeqCst);
        metrics::gauge!(SENDER_IN_FLIGHT).set(in_flight as f64);

        Some(InFlightPermit {
            _permit: permit,
            limiter: self.clone(),
        })
    }

    /// Stop handing out permits; pending and future `acquire` calls return `None`
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest in-flight count observed since creation
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// One unit of in-flight capacity. Dropping it releases the slot.
#[derive(Debug)]
pub struct InFlightPermit {
    _permit: OwnedSemaphorePermit,
    limiter: Arc<InFlightLimiter>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        // Runs before the semaphore permit field is dropped, so the counter never
        // lags behind a slot that has already been handed to someone else
        let in_flight = self.limiter.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!(SENDER_IN_FLIGHT).set(in_flight as f64);
    }
}
