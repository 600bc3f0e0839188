//! Single-flight admission control
//!
//! One query runs at a time. A request arriving while another runs is turned
//! away immediately instead of queueing.

use crate::types::{QueryError, Result};
use std::sync::{Mutex, MutexGuard, TryLockError};

/// Gate with a single permit
#[derive(Debug, Default)]
pub struct AdmissionGate {
    permit: Mutex<()>,
}

/// Held for the duration of one query; released on drop
#[derive(Debug)]
pub struct AdmissionPermit<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the permit, or fail with [`QueryError::Busy`] if it is held
    pub fn try_acquire(&self) -> Result<AdmissionPermit<'_>> {
        match self.permit.try_lock() {
            Ok(guard) => Ok(AdmissionPermit { _guard: guard }),
            // A query that panicked still released its permit
            Err(TryLockError::Poisoned(poisoned)) => Ok(AdmissionPermit {
                _guard: poisoned.into_inner(),
            }),
            Err(TryLockError::WouldBlock) => Err(QueryError::Busy),
        }
    }
}
