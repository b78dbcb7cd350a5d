//! The condvar engine a caller blocks on while waiting for one or more
//! in-flight invocations to finish. One thread (the "pumper", see
//! [`super::runtime`]) drives the link and calls [`Awaiter::notify_all`]
//! whenever it completes or fails an entry; every other thread just waits.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::inflight::{InFlightTable, MessageStatus};

/// How [`Awaiter::await_multiple`] decides when to return, mirroring the
/// C source's `await(ctxs, flags)` flag set (`Async` is the pumper-thread
/// itself driving the link instead of condvar-waiting on it, which on the
/// client runtime here is always true — there is no separate mode for it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitMode {
    /// Returns as soon as at least one descriptor is terminal.
    Any,
    /// Returns only once every descriptor is terminal.
    All,
}

#[derive(Default)]
pub struct Awaiter {
    table: Mutex<InFlightTable>,
    signal: Condvar,
}

impl Awaiter {
    pub fn new() -> Self {
        Self { table: Mutex::new(InFlightTable::new()), signal: Condvar::new() }
    }

    pub fn begin(&self, message_id: u32) {
        self.table.lock().unwrap().begin(message_id);
    }

    pub fn cancel(&self, message_id: u32) {
        self.table.lock().unwrap().cancel(message_id);
    }

    pub fn complete(&self, message_id: u32, payload: Vec<u8>) {
        let mut table = self.table.lock().unwrap();
        if table.complete(message_id, payload) {
            self.signal.notify_all();
        }
    }

    pub fn fail(&self, message_id: u32) {
        let mut table = self.table.lock().unwrap();
        if table.fail(message_id) {
            self.signal.notify_all();
        }
    }

    /// Fails every still-waiting invocation, e.g. when the link disconnects.
    pub fn fail_all_waiting(&self, ids: &[u32]) {
        let mut table = self.table.lock().unwrap();
        for &id in ids {
            table.fail(id);
        }
        self.signal.notify_all();
    }

    pub fn status(&self, message_id: u32) -> Option<MessageStatus> {
        self.table.lock().unwrap().status(message_id)
    }

    /// Unconditionally removes and returns an entry's status. Idempotent.
    pub fn status_finalize(&self, message_id: u32) -> Option<MessageStatus> {
        self.table.lock().unwrap().status_finalize(message_id)
    }

    /// Blocks until `message_id` is completed or failed, returning its
    /// response payload (absent on failure).
    pub fn wait(&self, message_id: u32) -> Option<Vec<u8>> {
        let mut table = self.table.lock().unwrap();
        loop {
            if let Some((status, payload)) = table.take_if_finished(message_id) {
                return if status == MessageStatus::Completed { payload } else { None };
            }
            table = self.signal.wait(table).unwrap();
        }
    }

    /// Blocks until `message_id` finishes or `timeout` elapses, without
    /// consuming the entry on timeout so a later call can still collect it.
    pub fn wait_timeout(&self, message_id: u32, timeout: Duration) -> Option<Option<Vec<u8>>> {
        let mut table = self.table.lock().unwrap();
        loop {
            if let Some((status, payload)) = table.take_if_finished(message_id) {
                return Some(if status == MessageStatus::Completed { payload } else { None });
            }
            let (guard, result) = self.signal.wait_timeout(table, timeout).unwrap();
            table = guard;
            if result.timed_out() {
                return None;
            }
        }
    }

    /// Blocks until `mode`'s condition over `message_ids` holds — at least
    /// one terminal for `Any`, every one terminal for `All` — then returns
    /// each descriptor's current status without consuming it, mirroring
    /// `await(ctxs, flags)`'s "return a status, let the caller collect each
    /// context individually" contract. Callers fetch payloads afterward via
    /// `wait_message`/`status_finalize`.
    pub fn await_multiple(&self, message_ids: &[u32], mode: AwaitMode) -> Vec<MessageStatus> {
        let mut table = self.table.lock().unwrap();
        loop {
            let statuses: Vec<Option<MessageStatus>> = message_ids.iter().map(|&id| table.peek_status(id)).collect();
            let terminal_count = statuses.iter().filter(|s| matches!(s, Some(MessageStatus::Completed | MessageStatus::Failed))).count();
            let done = match mode {
                AwaitMode::Any => terminal_count > 0,
                AwaitMode::All => terminal_count == message_ids.len(),
            };
            if done {
                return statuses.into_iter().map(|s| s.unwrap_or(MessageStatus::Waiting)).collect();
            }
            table = self.signal.wait(table).unwrap();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_blocks_until_complete() {
        let awaiter = Arc::new(Awaiter::new());
        awaiter.begin(1);

        let completer = awaiter.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(1, vec![7, 8]);
        });

        assert_eq!(awaiter.wait(1), Some(vec![7, 8]));
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_returns_none_when_nothing_arrives() {
        let awaiter = Awaiter::new();
        awaiter.begin(1);
        assert_eq!(awaiter.wait_timeout(1, Duration::from_millis(10)), None);
        assert_eq!(awaiter.status(1), Some(MessageStatus::Waiting));
    }

    #[test]
    fn fail_resolves_waiters_with_none() {
        let awaiter = Arc::new(Awaiter::new());
        awaiter.begin(1);
        let failer = awaiter.clone();
        let handle = thread::spawn(move || failer.fail(1));
        assert_eq!(awaiter.wait(1), None);
        handle.join().unwrap();
    }

    #[test]
    fn status_finalize_is_idempotent_through_the_awaiter() {
        let awaiter = Awaiter::new();
        awaiter.begin(1);
        awaiter.complete(1, vec![3]);
        assert_eq!(awaiter.status_finalize(1), Some(MessageStatus::Completed));
        assert_eq!(awaiter.status_finalize(1), None);
    }

    #[test]
    fn await_multiple_any_returns_as_soon_as_one_completes() {
        let awaiter = Arc::new(Awaiter::new());
        awaiter.begin(1);
        awaiter.begin(2);

        let completer = awaiter.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(2, vec![]);
        });

        let statuses = awaiter.await_multiple(&[1, 2], AwaitMode::Any);
        assert_eq!(statuses, vec![MessageStatus::Waiting, MessageStatus::Completed]);
        handle.join().unwrap();
    }

    #[test]
    fn await_multiple_all_waits_for_every_descriptor() {
        let awaiter = Arc::new(Awaiter::new());
        awaiter.begin(1);
        awaiter.begin(2);

        let completer = awaiter.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            completer.complete(1, vec![]);
            thread::sleep(Duration::from_millis(10));
            completer.complete(2, vec![]);
        });

        let statuses = awaiter.await_multiple(&[1, 2], AwaitMode::All);
        assert_eq!(statuses, vec![MessageStatus::Completed, MessageStatus::Completed]);
        handle.join().unwrap();
    }
}
