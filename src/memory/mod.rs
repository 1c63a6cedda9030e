/// MemoryContext: query-scoped memory budgeting and revocation
///
/// Reservations are advisory: a reservation above the limit is still
/// recorded, but the caller receives `Overbudget` and is expected to either
/// trigger revocation (spill) or fail with an over-commit error. The
/// revocation request is a cooperative flag; the driver observes it and runs
/// the `start_memory_revoke` / `finish_memory_revoke` handshake on the
/// operator that owns the revocable state.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryGrant {
    Granted,
    Overbudget,
}

pub struct MemoryContext {
    limit: usize,
    reserved: AtomicUsize,
    revocation_requested: AtomicBool,
}

impl MemoryContext {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            reserved: AtomicUsize::new(0),
            revocation_requested: AtomicBool::new(false),
        }
    }

    /// A context that never reports over-budget.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Record a reservation. The reservation always succeeds; the grant tells
    /// the caller whether the budget was exceeded.
    pub fn reserve(&self, bytes: usize) -> MemoryGrant {
        let total = self.reserved.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if total > self.limit {
            warn!(
                requested = bytes,
                reserved = total,
                limit = self.limit,
                "memory reservation over budget"
            );
            MemoryGrant::Overbudget
        } else {
            debug!(requested = bytes, reserved = total, "memory reserved");
            MemoryGrant::Granted
        }
    }

    pub fn release(&self, bytes: usize) {
        let mut current = self.reserved.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.reserved.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn request_revocation(&self) {
        self.revocation_requested.store(true, Ordering::Relaxed);
    }

    pub fn revocation_requested(&self) -> bool {
        self.revocation_requested.load(Ordering::Relaxed)
    }

    pub fn clear_revocation_request(&self) {
        self.revocation_requested.store(false, Ordering::Relaxed);
    }
}
