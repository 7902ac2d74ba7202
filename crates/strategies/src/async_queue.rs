//! Asynchronous checkpoint save protocol
//!
//! An async-capable save strategy returns an [`AsyncRequest`]: the deferred
//! write (`execute`) paired with the commit bookkeeping (`finalize`). The
//! caller schedules the request on an [`AsyncCallsQueue`] and decides when to
//! finalize, blocking or not. Execution runs on a dedicated OS worker thread
//! because it performs blocking storage I/O; finalization always runs on the
//! caller's own context, in strict schedule order.

use std::collections::VecDeque;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use checkpoint_core::{Error, Result};

type CallFn = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// One in-flight asynchronous save: a deferred-execution unit and a
/// deferred-finalization unit, each consumed at most once.
pub struct AsyncRequest {
    execute: Option<CallFn>,
    finalize: Option<CallFn>,
}

impl AsyncRequest {
    /// Pair an execution unit with its finalization unit
    pub fn new(
        execute: impl FnOnce() -> Result<()> + Send + 'static,
        finalize: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            execute: Some(Box::new(execute)),
            finalize: Some(Box::new(finalize)),
        }
    }

    fn into_parts(self) -> (Option<CallFn>, Option<CallFn>) {
        (self.execute, self.finalize)
    }
}

impl std::fmt::Debug for AsyncRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRequest")
            .field("execute", &self.execute.is_some())
            .field("finalize", &self.finalize.is_some())
            .finish()
    }
}

struct InFlightCall {
    handle: JoinHandle<Result<()>>,
    finalize: Option<CallFn>,
}

/// Ordered queue of outstanding async save requests, FIFO by schedule time.
///
/// Entries are removed only by finalization. Finalization order is always
/// the schedule order, never the completion order of the concurrent
/// background writes, because finalize bookkeeping must reflect save order.
#[derive(Default)]
pub struct AsyncCallsQueue {
    calls: Mutex<VecDeque<InFlightCall>>,
}

impl AsyncCallsQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch the request's execution to a background worker thread and
    /// append it to the queue tail. Runs nothing on the caller; O(1).
    pub fn schedule_async_request(&self, request: AsyncRequest) {
        let (execute, finalize) = request.into_parts();
        let handle = tokio::task::spawn_blocking(move || match execute {
            Some(execute) => execute(),
            None => Ok(()),
        });

        let mut calls = self.calls.lock();
        calls.push_back(InFlightCall { handle, finalize });
        debug!(pending = calls.len(), "Scheduled async checkpoint request");
    }

    /// Finalize queue entries in strict schedule order.
    ///
    /// Blocking mode waits for each entry's execution, runs its finalization
    /// and removes it, draining the whole queue; the first failure is
    /// propagated and later entries remain scheduled for a retry of
    /// finalization. Non-blocking mode only finalizes entries whose
    /// execution has already completed and never skips over an incomplete
    /// entry to reach a later one.
    ///
    /// Returns whether anything was finalized.
    pub async fn maybe_finalize_async_calls(&self, blocking: bool) -> Result<bool> {
        let mut finalized_any = false;
        loop {
            let call = {
                let mut calls = self.calls.lock();
                match calls.front() {
                    Some(call) if blocking || call.handle.is_finished() => calls.pop_front(),
                    _ => None,
                }
            };
            let call = match call {
                Some(call) => call,
                None => break,
            };

            match call.handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "Async checkpoint execution failed");
                    return Err(e);
                }
                Err(join_err) => {
                    return Err(Error::Internal {
                        message: format!("Async checkpoint worker panicked: {}", join_err),
                    });
                }
            }

            if let Some(finalize) = call.finalize {
                finalize()?;
            }
            finalized_any = true;
            debug!(
                pending = self.calls.lock().len(),
                "Finalized async checkpoint request"
            );
        }
        Ok(finalized_any)
    }

    /// Number of scheduled requests not yet finalized
    pub fn unfinalized_calls(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Drop for AsyncCallsQueue {
    fn drop(&mut self) {
        let pending = self.calls.lock().len();
        if pending > 0 {
            warn!(
                pending,
                "Async checkpoint requests still pending at queue drop; \
                 finalize them before exit to commit the checkpoints"
            );
        }
    }
}

static DEFAULT_QUEUE: Lazy<AsyncCallsQueue> = Lazy::new(AsyncCallsQueue::new);

/// Process-wide queue used by the synchronous save facade
pub fn default_queue() -> &'static AsyncCallsQueue {
    &DEFAULT_QUEUE
}
