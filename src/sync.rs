//! Signalling primitives shared between the worker and the controller
//!
//! [`Event`] is a binary, auto-resetting event: one `wait` consumes one
//! `signal`, and signalling an already-signalled event is a no-op.
//!
//! Transfer completions travel over a one-slot channel. The sending half is
//! handed to the controller with every queued request and is safe to call
//! from interrupt-like completion context: it only records the result and
//! wakes the waiter, it never blocks.

use crate::error::{UmsError, UmsResult};
use async_channel::{Receiver, Sender, TrySendError};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Binary auto-reset event
#[derive(Debug, Default)]
pub struct Event {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut signalled = self.signalled.lock().unwrap_or_else(|e| e.into_inner());
        *signalled = true;
        self.cond.notify_one();
    }

    /// Block until signalled, then reset
    pub fn wait(&self) {
        let mut signalled = self.signalled.lock().unwrap_or_else(|e| e.into_inner());
        while !*signalled {
            signalled = self.cond.wait(signalled).unwrap_or_else(|e| e.into_inner());
        }
        *signalled = false;
    }

    /// Like [`Event::wait`], giving up after `timeout`. Returns whether the
    /// event fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.signalled.lock().unwrap_or_else(|e| e.into_inner());
        let (mut signalled, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |s| !*s)
            .unwrap_or_else(|e| e.into_inner());
        let fired = *signalled;
        *signalled = false;
        fired
    }
}

/// Controller-reported status of a finished request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Ok,
    /// The request was retired without completing, e.g. by `stop()` or a
    /// disconnect.
    Cancelled,
    /// Controller-specific failure code
    Error(i32),
}

/// What the completion callback records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferResult {
    /// Bytes actually moved
    pub actual: usize,
    pub status: TransferStatus,
}

/// Completion callback handed to the controller
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: Sender<TransferResult>,
}

impl CompletionSender {
    /// Record the result and wake the waiter
    pub fn complete(&self, actual: usize, status: TransferStatus) {
        match self.tx.try_send(TransferResult { actual, status }) {
            Ok(()) => {}
            Err(TrySendError::Full(result)) => {
                log::warn!("Dropping completion {:?}: previous one not consumed", result);
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Completion delivered after session teardown");
            }
        }
    }
}

/// Waiting half of the completion channel, owned by the worker
#[derive(Debug)]
pub struct CompletionWaiter {
    rx: Receiver<TransferResult>,
}

impl CompletionWaiter {
    pub fn wait(&self) -> UmsResult<TransferResult> {
        self.rx
            .recv_blocking()
            .map_err(|_| UmsError::Transfer("completion channel closed".into()))
    }

    /// Discard a stale completion, if any
    pub fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

/// Create the per-session completion signal
pub fn completion_channel() -> (CompletionSender, CompletionWaiter) {
    let (tx, rx) = async_channel::bounded(1);
    (CompletionSender { tx }, CompletionWaiter { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_event_auto_resets() {
        let event = Event::new();
        event.signal();
        event.signal();
        assert!(event.wait_timeout(Duration::from_millis(10)));
        assert!(!event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_event_wakes_waiter() {
        let event = Arc::new(Event::new());
        let signaller = Arc::clone(&event);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.signal();
        });
        event.wait();
        handle.join().unwrap();
    }

    #[test]
    fn test_completion_is_one_shot() {
        let (tx, rx) = completion_channel();
        tx.complete(31, TransferStatus::Ok);
        // Second completion without a wait in between is dropped.
        tx.complete(13, TransferStatus::Ok);

        let result = rx.wait().unwrap();
        assert_eq!(result.actual, 31);
        assert_eq!(result.status, TransferStatus::Ok);
    }

    #[test]
    fn test_completion_from_other_thread() {
        let (tx, rx) = completion_channel();
        let handle = thread::spawn(move || tx.complete(512, TransferStatus::Cancelled));
        let result = rx.wait().unwrap();
        assert_eq!(result, TransferResult { actual: 512, status: TransferStatus::Cancelled });
        handle.join().unwrap();
    }
}
