use core::ops::{Deref, DerefMut};

use crate::semaphore::{Semaphore, SemaphoreGuard};

/// Mutex whose waiters sleep instead of spinning.
///
/// Waiters queue on a binary [`Semaphore`] and are parked until the holder
/// releases it. The data itself sits behind a `spin::Mutex` that is never
/// contended, since only the thread holding the gate touches it.
pub struct MutexBlocking<T> {
    gate: Semaphore,
    data: spin::Mutex<T>,
}

impl<T> MutexBlocking<T> {
    pub fn new(data: T) -> Self {
        Self {
            gate: Semaphore::new(1),
            data: spin::Mutex::new(data),
        }
    }

    pub fn lock(&self) -> MutexBlockingGuard<'_, T> {
        let gate = self.gate.acquire();
        MutexBlockingGuard {
            data: self.data.lock(),
            _gate: gate,
        }
    }
}

// Fields drop in order: the data lock is released before the gate.
pub struct MutexBlockingGuard<'a, T> {
    data: spin::MutexGuard<'a, T>,
    _gate: SemaphoreGuard<'a>,
}

impl<T> Deref for MutexBlockingGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for MutexBlockingGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}
