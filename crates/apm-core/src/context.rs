// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Which transaction is current for the running code.
//!
//! Each thread, and each task run under [`scope`] or [`isolate`], keeps a
//! stack of weak references. Beginning a transaction pushes onto the task's
//! stack when there is one, else onto the thread's. Entries whose
//! transaction was dropped or ended, possibly on another thread, are
//! skipped and purged on lookup, so a stale transaction never becomes
//! current again.

use crate::transaction::{TransactionHandle, WeakTransactionHandle};
use std::cell::RefCell;
use std::future::Future;

#[derive(Debug)]
struct Stack {
    entries: Vec<WeakTransactionHandle>,
}

impl Stack {
    const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn push(&mut self, handle: &TransactionHandle) {
        self.entries.push(handle.downgrade());
    }

    fn remove(&mut self, handle: &TransactionHandle) {
        if let Some(position) = self.entries.iter().rposition(|w| w.points_to(handle)) {
            self.entries.remove(position);
        }
    }

    fn current(&mut self) -> Option<TransactionHandle> {
        self.entries.retain(WeakTransactionHandle::is_live);
        self.entries.last().and_then(WeakTransactionHandle::upgrade)
    }
}

thread_local! {
    static CURRENT: RefCell<Stack> = const { RefCell::new(Stack::new()) };
}

tokio::task_local! {
    static TASK_CURRENT: RefCell<Stack>;
}

/// The current transaction of the calling task or thread, if any. Inside a
/// task scope only the task's own transactions are visible.
#[must_use]
pub fn current() -> Option<TransactionHandle> {
    if let Ok(found) = TASK_CURRENT.try_with(|stack| stack.borrow_mut().current()) {
        return found;
    }
    CURRENT
        .try_with(|stack| stack.borrow_mut().current())
        .ok()
        .flatten()
}

pub(crate) fn push(handle: &TransactionHandle) {
    if TASK_CURRENT
        .try_with(|stack| stack.borrow_mut().push(handle))
        .is_err()
    {
        let _ = CURRENT.try_with(|stack| stack.borrow_mut().push(handle));
    }
}

/// Removes the innermost entry for `handle` from the calling task and
/// thread. Entries elsewhere are purged lazily once the transaction ends.
pub(crate) fn remove(handle: &TransactionHandle) {
    let _ = TASK_CURRENT.try_with(|stack| stack.borrow_mut().remove(handle));
    let _ = CURRENT.try_with(|stack| stack.borrow_mut().remove(handle));
}

/// Guard that uninstalls a handle entered with [`enter`].
#[derive(Debug)]
pub struct CurrentGuard {
    handle: TransactionHandle,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        remove(&self.handle);
    }
}

/// Makes `handle` current until the guard drops. The guard keeps the
/// transaction alive.
pub fn enter(handle: &TransactionHandle) -> CurrentGuard {
    push(handle);
    CurrentGuard {
        handle: handle.clone(),
    }
}

/// Runs `future` with `handle` as the current transaction of the task.
///
/// The handle is dropped with the future, so a transaction owned only by
/// this scope ends when the task completes or is cancelled.
pub async fn scope<F: Future>(handle: TransactionHandle, future: F) -> F::Output {
    let mut stack = Stack::new();
    stack.push(&handle);
    TASK_CURRENT
        .scope(RefCell::new(stack), async move {
            let _owner = handle;
            future.await
        })
        .await
}

/// Runs `future` with a context of its own, so transactions it begins are
/// not visible to other tasks sharing its worker thread.
pub async fn isolate<F: Future>(future: F) -> F::Output {
    TASK_CURRENT.scope(RefCell::new(Stack::new()), future).await
}
