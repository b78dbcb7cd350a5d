//! Bookkeeping for invocations that are waiting on a response. Grounded on
//! `runtime/client.c`'s message store: every `Sync`/`Async` invocation gets a
//! slot keyed by `message_id` that moves through a small state machine as
//! the response arrives (or the wait times out).

use gracht_communication::RobinHoodMap;

/// Where a tracked invocation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// Sent, no response yet.
    Waiting,
    /// A response payload has arrived and is ready to be claimed.
    Completed,
    /// The link reported an error before a response arrived.
    Failed,
}

pub struct InFlightEntry {
    pub status: MessageStatus,
    pub payload: Option<Vec<u8>>,
}

/// The set of invocations a client is currently waiting on, keyed by
/// `message_id`.
#[derive(Default)]
pub struct InFlightTable {
    entries: RobinHoodMap<u32, InFlightEntry>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self { entries: RobinHoodMap::new() }
    }

    pub fn begin(&mut self, message_id: u32) {
        self.entries.insert(message_id, InFlightEntry { status: MessageStatus::Waiting, payload: None });
    }

    pub fn complete(&mut self, message_id: u32, payload: Vec<u8>) -> bool {
        match self.entries.get_mut(&message_id) {
            Some(entry) => {
                entry.status = MessageStatus::Completed;
                entry.payload = Some(payload);
                true
            }
            None => false,
        }
    }

    pub fn fail(&mut self, message_id: u32) -> bool {
        match self.entries.get_mut(&message_id) {
            Some(entry) => {
                entry.status = MessageStatus::Failed;
                true
            }
            None => false,
        }
    }

    /// Non-consuming peek at an entry's status. Used internally wherever a
    /// terminal-state check must not itself remove the entry.
    pub(crate) fn peek_status(&self, message_id: u32) -> Option<MessageStatus> {
        self.entries.get(&message_id).map(|e| e.status)
    }

    /// Peeks an entry's status. A `Failed` entry carries no payload, so it's
    /// already safe to remove and free on the spot; `Completed`/`Waiting`
    /// entries are left in place for `take_if_finished`/`status_finalize` to
    /// collect later.
    pub fn status(&mut self, message_id: u32) -> Option<MessageStatus> {
        let status = self.peek_status(message_id)?;
        if status == MessageStatus::Failed {
            self.entries.remove(&message_id);
        }
        Some(status)
    }

    /// Unconditionally removes and returns an entry's status, if any.
    /// Idempotent: a second call after the entry is gone just returns `None`.
    pub fn status_finalize(&mut self, message_id: u32) -> Option<MessageStatus> {
        self.entries.remove(&message_id).map(|entry| entry.status)
    }

    /// Removes and returns a completed or failed entry's payload, if ready.
    pub fn take_if_finished(&mut self, message_id: u32) -> Option<(MessageStatus, Option<Vec<u8>>)> {
        let finished = matches!(self.peek_status(message_id), Some(MessageStatus::Completed | MessageStatus::Failed));
        if !finished {
            return None;
        }
        let entry = self.entries.remove(&message_id)?;
        Some((entry.status, entry.payload))
    }

    pub fn cancel(&mut self, message_id: u32) {
        self.entries.remove(&message_id);
    }

    pub fn contains(&self, message_id: u32) -> bool {
        self.entries.contains_key(&message_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn begin_then_complete_is_visible() {
        let mut table = InFlightTable::new();
        table.begin(1);
        assert_eq!(table.status(1), Some(MessageStatus::Waiting));
        assert!(table.complete(1, vec![9]));
        let (status, payload) = table.take_if_finished(1).unwrap();
        assert_eq!(status, MessageStatus::Completed);
        assert_eq!(payload, Some(vec![9]));
        assert!(!table.contains(1));
    }

    #[test]
    fn complete_unknown_message_is_noop() {
        let mut table = InFlightTable::new();
        assert!(!table.complete(42, vec![]));
    }

    #[test]
    fn take_if_finished_returns_none_while_waiting() {
        let mut table = InFlightTable::new();
        table.begin(5);
        assert!(table.take_if_finished(5).is_none());
    }

    #[test]
    fn status_removes_failed_entries_but_not_completed_ones() {
        let mut table = InFlightTable::new();
        table.begin(1);
        table.begin(2);
        table.fail(1);
        table.complete(2, vec![1]);

        assert_eq!(table.status(1), Some(MessageStatus::Failed));
        assert!(!table.contains(1));

        assert_eq!(table.status(2), Some(MessageStatus::Completed));
        assert!(table.contains(2));
    }

    #[test]
    fn status_finalize_is_idempotent() {
        let mut table = InFlightTable::new();
        table.begin(1);
        table.complete(1, vec![7]);
        assert_eq!(table.status_finalize(1), Some(MessageStatus::Completed));
        assert_eq!(table.status_finalize(1), None);
    }
}
