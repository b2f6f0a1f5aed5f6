use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, Thread};

use spin::Mutex;

use crate::block_dev::RequestDone;

/// Counting semaphore. Threads that cannot proceed are parked and woken in
/// arrival order.
pub struct Semaphore {
    inner: Mutex<SemaphoreInner>,
}

pub struct SemaphoreInner {
    count: isize,
    blocked_threads: VecDeque<Arc<Waiter>>,
}

impl Semaphore {
    pub fn new(res_count: usize) -> Self {
        Self {
            inner: Mutex::new(SemaphoreInner {
                count: res_count as isize,
                blocked_threads: VecDeque::new(),
            }),
        }
    }

    pub fn up(&self) {
        let mut inner = self.inner.lock();
        inner.count += 1;
        if inner.count <= 0 {
            if let Some(waiter) = inner.blocked_threads.pop_front() {
                waiter.wake();
            }
        }
    }

    pub fn down(&self) {
        let mut inner = self.inner.lock();
        inner.count -= 1;
        if inner.count < 0 {
            let waiter = Arc::new(Waiter::current());
            inner.blocked_threads.push_back(Arc::clone(&waiter));
            drop(inner);
            waiter.block();
        }
    }

    /// `down`, released again when the guard is dropped.
    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        self.down();
        SemaphoreGuard { sem: self }
    }
}

impl RequestDone for Semaphore {
    fn request_done(&self) {
        self.up();
    }
}

pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.sem.up();
    }
}

/// A parked thread and the flag that tells it the wakeup is real.
pub struct Waiter {
    thread: Thread,
    woken: AtomicBool,
}

impl Waiter {
    fn current() -> Self {
        Self {
            thread: thread::current(),
            woken: AtomicBool::new(false),
        }
    }

    fn block(&self) {
        while !self.woken.load(Ordering::Acquire) {
            thread::park();
        }
    }

    fn wake(&self) {
        self.woken.store(true, Ordering::Release);
        self.thread.unpark();
    }
}
