//! Deterministic multiplexing over several [`WorkflowFuture`]s.
//!
//! Each `select` call fires exactly one callback: the one registered first
//! among the futures that are settled at that moment. Arrival order of the
//! underlying completions never matters, which keeps replays identical.

use crate::WorkflowContext;
use crate::errors::WorkflowError;
use crate::futures::WorkflowFuture;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

trait SelectCase<R>: Send {
    /// Fire the callback when the future has settled and the case is unused.
    fn try_fire(&mut self) -> Option<R>;
    fn is_spent(&self) -> bool;
}

struct FutureCase<T, F> {
    future: WorkflowFuture<T>,
    callback: Option<F>,
}

impl<T, R, F> SelectCase<R> for FutureCase<T, F>
where
    T: Clone + Send,
    F: FnOnce(Result<T, WorkflowError>) -> R + Send,
{
    fn try_fire(&mut self) -> Option<R> {
        if self.callback.is_none() {
            return None;
        }
        let outcome = self.future.peek()?;
        let callback = self.callback.take()?;
        Some(callback(outcome))
    }

    fn is_spent(&self) -> bool {
        self.callback.is_none()
    }
}

/// Ordered set of `(future, callback)` cases.
///
/// ```ignore
/// let mut selector = Selector::new();
/// selector
///     .add_future(&approval, |r| Decision::Approved(r))
///     .add_future(&deadline, |_| Decision::TimedOut);
/// let decision = selector.select(&ctx).await?;
/// ```
pub struct Selector<'a, R> {
    cases: Vec<Box<dyn SelectCase<R> + 'a>>,
    default: Option<Box<dyn FnMut() -> R + Send + 'a>>,
}

impl<R> Default for Selector<'_, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, R> Selector<'a, R> {
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            default: None,
        }
    }

    /// Register a case. Registration order decides ties.
    pub fn add_future<T, F>(&mut self, future: &WorkflowFuture<T>, callback: F) -> &mut Self
    where
        T: Clone + Send + 'a,
        F: FnOnce(Result<T, WorkflowError>) -> R + Send + 'a,
    {
        self.cases.push(Box::new(FutureCase {
            future: future.clone(),
            callback: Some(callback),
        }));
        self
    }

    /// Callback fired by `select` when no case is ready, instead of suspending.
    pub fn add_default<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut() -> R + Send + 'a,
    {
        self.default = Some(Box::new(callback));
        self
    }

    /// Number of registered cases whose callback has not fired yet.
    pub fn pending(&self) -> usize {
        self.cases.iter().filter(|c| !c.is_spent()).count()
    }

    /// Wait for one case and return its callback's value.
    ///
    /// Fails with [`WorkflowError::EmptySelector`] once every case has fired
    /// and no default exists, and with [`WorkflowError::Canceled`] when the
    /// instance is canceled while nothing is ready.
    pub fn select<'s>(&'s mut self, ctx: &'s WorkflowContext) -> Select<'s, 'a, R> {
        Select { selector: self, ctx }
    }

    fn poll_cases(&mut self, ctx: &WorkflowContext) -> Poll<Result<R, WorkflowError>> {
        for case in self.cases.iter_mut() {
            if let Some(value) = case.try_fire() {
                return Poll::Ready(Ok(value));
            }
        }
        if let Some(default) = self.default.as_mut() {
            return Poll::Ready(Ok(default()));
        }
        if self.cases.iter().all(|c| c.is_spent()) {
            return Poll::Ready(Err(WorkflowError::EmptySelector));
        }
        if ctx.is_canceled() {
            return Poll::Ready(Err(WorkflowError::Canceled));
        }
        Poll::Pending
    }
}

/// Future returned by [`Selector::select`].
#[must_use = "futures do nothing unless awaited"]
pub struct Select<'s, 'a, R> {
    selector: &'s mut Selector<'a, R>,
    ctx: &'s WorkflowContext,
}

impl<R> Future for Select<'_, '_, R> {
    type Output = Result<R, WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.selector.poll_cases(this.ctx)
    }
}
