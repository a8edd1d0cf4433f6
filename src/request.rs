use crate::drink::Drink;
use futures::task::AtomicWaker;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

// sentinel for timestamps that have not been stamped yet
const UNSET: u64 = u64::MAX;

/// One-shot completion signal shared by exactly one server/producer pair.
#[derive(Debug)]
struct Completion {
    // ground truth for completion; flips false -> true once
    done: AtomicBool,
    // mirror of `done` guarded for condvar waiters
    flag: Mutex<bool>,
    cond: Condvar,
    waker: AtomicWaker,
}

impl Completion {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            flag: Mutex::new(false),
            cond: Condvar::new(),
            waker: AtomicWaker::new(),
        }
    }

    #[inline]
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Returns true if we won; later calls are no-ops.
    fn complete(&self) -> bool {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
        self.waker.wake();
        true
    }

    fn wait(&self) {
        if self.is_done() {
            return;
        }
        let mut flag = self.flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*flag {
            flag = self
                .cond
                .wait(flag)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_done() {
            return true;
        }
        let flag = self.flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (flag, _) = self
            .cond
            .wait_timeout_while(flag, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *flag
    }
}

/// A unit of work with a fixed service time.
///
/// Producers keep an `Arc<Request>` to wait on; the server stamps the
/// lifecycle timestamps and consumes remaining service while the request
/// is in flight. All timestamps are in units of the server's clock and
/// satisfy `queue_entry_time <= start_time <= completion_time`.
#[derive(Debug)]
pub struct Request {
    owner: usize,
    drink: Option<Drink>,
    total_service: u64,
    remaining: AtomicU64,

    // set by the first successful submit; a request is queued at most once
    submitted: AtomicBool,
    queue_entry: AtomicU64,
    // start of the current queued stretch; moves on every requeue
    last_enqueued: AtomicU64,
    start: AtomicU64,
    completion: AtomicU64,
    waited: AtomicU64,
    slices: AtomicU32,

    done: Completion,
}

impl Request {
    pub fn new(owner: usize, total_service: u64) -> Self {
        Self {
            owner,
            drink: None,
            total_service,
            remaining: AtomicU64::new(total_service),
            submitted: AtomicBool::new(false),
            queue_entry: AtomicU64::new(UNSET),
            last_enqueued: AtomicU64::new(UNSET),
            start: AtomicU64::new(UNSET),
            completion: AtomicU64::new(UNSET),
            waited: AtomicU64::new(0),
            slices: AtomicU32::new(0),
            done: Completion::new(),
        }
    }

    /// A request whose service time is the drink's preparation time.
    pub fn for_drink(owner: usize, drink: Drink) -> Self {
        Self {
            drink: Some(drink),
            ..Self::new(owner, drink.preparation_time())
        }
    }

    pub fn owner(&self) -> usize {
        self.owner
    }
    pub fn drink(&self) -> Option<Drink> {
        self.drink
    }
    pub fn total_service(&self) -> u64 {
        self.total_service
    }
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }
    pub fn queue_entry_time(&self) -> Option<u64> {
        load_stamp(&self.queue_entry)
    }
    /// Time of the first dispatch.
    pub fn start_time(&self) -> Option<u64> {
        load_stamp(&self.start)
    }
    pub fn completion_time(&self) -> Option<u64> {
        load_stamp(&self.completion)
    }
    /// Total time spent queued before each service slice.
    pub fn waiting_time(&self) -> u64 {
        self.waited.load(Ordering::Acquire)
    }
    /// Number of times the request was dispatched.
    pub fn slices(&self) -> u32 {
        self.slices.load(Ordering::Acquire)
    }
    pub fn is_completed(&self) -> bool {
        self.done.is_done()
    }

    /// Block the calling thread until the server completes this request.
    pub fn wait(&self) {
        self.done.wait();
    }

    /// Like `wait`, giving up after `timeout`. Returns whether the request
    /// completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.done.wait_timeout(timeout)
    }

    /// Future resolving once the request completes.
    pub fn completed(&self) -> Completed<'_> {
        Completed { request: self }
    }

    pub(crate) fn claim_submission(&self) -> bool {
        !self.submitted.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn stamp_queue_entry(&self, now: u64) {
        stamp_once(&self.queue_entry, now);
        self.last_enqueued.store(now, Ordering::Release);
    }

    /// Called on every dispatch. Returns how long this stretch was queued.
    pub(crate) fn begin_slice(&self, now: u64) -> u64 {
        stamp_once(&self.start, now);
        let queued = now.saturating_sub(self.last_enqueued.load(Ordering::Acquire));
        self.waited.fetch_add(queued, Ordering::AcqRel);
        self.slices.fetch_add(1, Ordering::AcqRel);
        queued
    }

    /// Consume `served` units. Returns what is left.
    pub(crate) fn end_slice(&self, served: u64) -> u64 {
        let prev = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r.saturating_sub(served))
            })
            .unwrap_or_else(|r| r);
        prev.saturating_sub(served)
    }

    pub(crate) fn requeue(&self, now: u64) {
        self.last_enqueued.store(now, Ordering::Release);
    }

    /// Stamp completion and fire the signal. Returns false if already done.
    pub(crate) fn finish(&self, now: u64) -> bool {
        if self.is_completed() {
            return false;
        }
        self.remaining.store(0, Ordering::Release);
        stamp_once(&self.completion, now);
        self.mark_done()
    }

    pub(crate) fn mark_done(&self) -> bool {
        self.done.complete()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.drink {
            Some(drink) => write!(f, "{}: {}", self.owner, drink),
            None => write!(f, "{}: {} units", self.owner, self.total_service),
        }
    }
}

fn stamp_once(slot: &AtomicU64, now: u64) {
    let _ = slot.compare_exchange(UNSET, now, Ordering::AcqRel, Ordering::Acquire);
}

fn load_stamp(slot: &AtomicU64) -> Option<u64> {
    match slot.load(Ordering::Acquire) {
        UNSET => None,
        t => Some(t),
    }
}

/// Future returned by `Request::completed`.
#[derive(Debug)]
pub struct Completed<'a> {
    request: &'a Request,
}

impl Future for Completed<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let done = &self.request.done;
        if done.is_done() {
            return Poll::Ready(());
        }
        done.waker.register(cx.waker());
        // Re-check after registering to avoid missed wake.
        if done.is_done() {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}
