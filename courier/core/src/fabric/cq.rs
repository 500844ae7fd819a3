//! Completion Queue State
//!
//! One queue implementation backs both providers: ordered entries, a
//! separate error queue, and the registered wakeup handle fired on the
//! idle-to-readable transition. Error entries take precedence over normal
//! entries when polled, so an error at the head blocks reads until the
//! detailed record is consumed.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::buffer::Deposit;
use super::{
    flags, Completion, CompletionQueue, CqErrorEntry, CqPoll, FabricError, ResourceToken,
    WakeupHandle,
};

#[derive(Debug, Default)]
pub(crate) struct CqState {
    entries: VecDeque<Completion>,
    errors: VecDeque<CqErrorEntry>,
    wakeup: Option<WakeupHandle>,
}

impl CqState {
    fn is_idle(&self) -> bool {
        self.entries.is_empty() && self.errors.is_empty()
    }

    fn notify_if_was_idle(&self, was_idle: bool) {
        if was_idle {
            if let Some(wakeup) = &self.wakeup {
                wakeup.notify();
            }
        }
    }

    pub(crate) fn push(&mut self, completion: Completion) {
        let was_idle = self.is_idle();
        self.entries.push_back(completion);
        self.notify_if_was_idle(was_idle);
    }

    pub(crate) fn push_error(&mut self, error: CqErrorEntry) {
        let was_idle = self.is_idle();
        self.errors.push_back(error);
        self.notify_if_was_idle(was_idle);
    }
}

/// Push the completion entries a deposit outcome implies.
///
/// `Queued` produces nothing (the provider is buffering until the next
/// repost); `Dropped` produces nothing either, the caller logs it.
pub(crate) fn push_deposit(cq: &Arc<Mutex<CqState>>, deposit: &Deposit) {
    match deposit {
        Deposit::Delivered {
            offset,
            len,
            exhausted,
        } => {
            let mut entry_flags = flags::RECV;
            if *exhausted {
                entry_flags |= flags::MULTI_RECV;
            }
            cq.lock().push(Completion {
                flags: entry_flags,
                len: *len,
                buf_offset: *offset,
                context: None,
            });
        }
        Deposit::ExhaustionOnly => {
            cq.lock().push(Completion {
                flags: flags::MULTI_RECV,
                len: 0,
                buf_offset: 0,
                context: None,
            });
        }
        Deposit::Queued | Deposit::Dropped => {}
    }
}

/// [`CompletionQueue`] handle over shared queue state.
pub(crate) struct CqHandle {
    token: ResourceToken,
    state: Arc<Mutex<CqState>>,
}

impl CqHandle {
    pub(crate) fn new(token: ResourceToken, state: Arc<Mutex<CqState>>) -> Self {
        Self { token, state }
    }
}

impl CompletionQueue for CqHandle {
    fn token(&self) -> ResourceToken {
        self.token
    }

    fn poll(&mut self) -> CqPoll {
        let mut state = self.state.lock();
        if !state.errors.is_empty() {
            return CqPoll::ErrorAvailable;
        }
        match state.entries.pop_front() {
            Some(entry) => CqPoll::Entry(entry),
            None => CqPoll::Empty,
        }
    }

    fn read_error(&mut self) -> Result<CqErrorEntry, FabricError> {
        self.state
            .lock()
            .errors
            .pop_front()
            .ok_or(FabricError::NotReady("no error completion pending"))
    }

    fn register_wakeup(&mut self, handle: WakeupHandle) {
        self.state.lock().wakeup = Some(handle);
    }

    fn deregister_wakeup(&mut self) {
        self.state.lock().wakeup = None;
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn completion(entry_flags: u32) -> Completion {
        Completion {
            flags: entry_flags,
            len: 0,
            buf_offset: 0,
            context: None,
        }
    }

    #[test]
    fn test_wakeup_fires_only_on_idle_transition() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(CqState::default()));
        let mut cq = CqHandle::new(ResourceToken(1), Arc::clone(&state));
        cq.register_wakeup(WakeupHandle::new(3, tx));

        state.lock().push(completion(flags::RECV));
        state.lock().push(completion(flags::RECV));

        // One notification for two entries pushed while idle-then-busy.
        assert_eq!(rx.try_recv().unwrap(), 3);
        assert!(rx.try_recv().is_err());

        // Drain both; the next push transitions from idle again.
        assert!(matches!(cq.poll(), CqPoll::Entry(_)));
        assert!(matches!(cq.poll(), CqPoll::Entry(_)));
        assert!(matches!(cq.poll(), CqPoll::Empty));
        state.lock().push(completion(flags::RECV));
        assert_eq!(rx.try_recv().unwrap(), 3);
    }

    #[test]
    fn test_error_takes_precedence_and_is_read_once() {
        let state = Arc::new(Mutex::new(CqState::default()));
        let mut cq = CqHandle::new(ResourceToken(1), Arc::clone(&state));

        state.lock().push(completion(flags::RECV));
        state.lock().push_error(CqErrorEntry {
            context: None,
            message: "boom".into(),
        });

        assert!(matches!(cq.poll(), CqPoll::ErrorAvailable));
        let err = cq.read_error().unwrap();
        assert_eq!(err.message, "boom");
        assert!(cq.read_error().is_err());

        // The ordinary entry is still there.
        assert!(matches!(cq.poll(), CqPoll::Entry(_)));
    }
}
