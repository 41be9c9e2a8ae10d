//! Single-assignment result cells handed to workflow code.
//!
//! A [`WorkflowFuture`] starts pending and is settled exactly once through its
//! [`Resolver`]. The resolver is consumed by settling, so a second resolution
//! cannot be expressed. Reading the value never consumes it: every clone and
//! every `get` observes the same outcome.

use crate::WorkflowContext;
use crate::errors::WorkflowError;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

#[derive(Debug)]
enum Slot<T> {
    Pending,
    Resolved(T),
    Failed(WorkflowError),
}

fn lock<T>(slot: &Mutex<Slot<T>>) -> MutexGuard<'_, Slot<T>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a pending future and the handle that settles it.
pub fn new_future<T>() -> (WorkflowFuture<T>, Resolver<T>) {
    let slot = Arc::new(Mutex::new(Slot::Pending));
    (
        WorkflowFuture { slot: Arc::clone(&slot) },
        Resolver { slot },
    )
}

/// Pending-or-settled result of one asynchronous operation.
#[derive(Debug)]
pub struct WorkflowFuture<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for WorkflowFuture<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> WorkflowFuture<T> {
    /// Already resolved future.
    pub fn ready(value: T) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Resolved(value))),
        }
    }

    /// Already failed future.
    pub fn failed(error: WorkflowError) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Failed(error))),
        }
    }

    pub fn is_ready(&self) -> bool {
        !matches!(*lock(&self.slot), Slot::Pending)
    }
}

impl<T: Clone> WorkflowFuture<T> {
    /// Outcome if settled.
    pub(crate) fn peek(&self) -> Option<Result<T, WorkflowError>> {
        match &*lock(&self.slot) {
            Slot::Pending => None,
            Slot::Resolved(v) => Some(Ok(v.clone())),
            Slot::Failed(e) => Some(Err(e.clone())),
        }
    }

    /// Suspend until settled.
    ///
    /// Returns [`WorkflowError::Canceled`] on the next scheduling step after
    /// the instance is canceled, unless the future has already settled.
    pub fn get<'a>(&'a self, ctx: &'a WorkflowContext) -> Get<'a, T> {
        Get { future: self, ctx }
    }
}

/// Future returned by [`WorkflowFuture::get`].
#[must_use = "futures do nothing unless awaited"]
pub struct Get<'a, T> {
    future: &'a WorkflowFuture<T>,
    ctx: &'a WorkflowContext,
}

impl<T: Clone> Future for Get<'_, T> {
    type Output = Result<T, WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.future.peek() {
            return Poll::Ready(outcome);
        }
        if self.ctx.is_canceled() {
            return Poll::Ready(Err(WorkflowError::Canceled));
        }
        Poll::Pending
    }
}

/// Settles the paired [`WorkflowFuture`].
#[derive(Debug)]
pub struct Resolver<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Resolver<T> {
    pub fn resolve(self, value: T) {
        self.settle(Slot::Resolved(value));
    }

    pub fn fail(self, error: WorkflowError) {
        self.settle(Slot::Failed(error));
    }

    pub fn complete(self, outcome: Result<T, WorkflowError>) {
        match outcome {
            Ok(v) => self.resolve(v),
            Err(e) => self.fail(e),
        }
    }

    fn settle(self, next: Slot<T>) {
        let mut slot = lock(&self.slot);
        // Only `new_future` hands out a resolver, and settling consumes it.
        debug_assert!(matches!(*slot, Slot::Pending), "future settled twice");
        if matches!(*slot, Slot::Pending) {
            *slot = next;
        }
    }
}
