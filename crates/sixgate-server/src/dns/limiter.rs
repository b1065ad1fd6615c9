//! Per-eTLD+1 recursion gate.
//!
//! Each effective-TLD-plus-one gets its own counting semaphore, created
//! lazily on first use. Acquisition is bounded by the remaining query
//! deadline; failing to get a permit in time is the concurrency-limit
//! error, which the query handler turns into SERVFAIL.

use std::collections::HashMap;
use std::sync::Arc;

use sixgate_core::{SixgateError, SixgateResult};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout_at, Instant};

pub struct RecursionGate {
    limit: usize,
    table: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl RecursionGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a permit for `etld1`, waiting no later than `deadline`.
    ///
    /// Names with no computable eTLD+1 share the `""` key, so malformed
    /// inputs contend with each other instead of minting fresh semaphores.
    pub async fn acquire(
        &self,
        etld1: &str,
        deadline: Instant,
    ) -> SixgateResult<OwnedSemaphorePermit> {
        let semaphore = {
            let mut table = self.table.lock().await;
            table
                .entry(etld1.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.limit)))
                .clone()
        };

        match timeout_at(deadline, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(SixgateError::ConcurrencyLimit),
            Err(_) => Err(SixgateError::ConcurrencyLimit),
        }
    }
}
