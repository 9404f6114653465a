//! Command result futures.
//!
//! A `publish` returns a `CommandFuture` backed by a bounded(1) crossbeam
//! channel. Cancellation is a CAS race against the worker's claim: it
//! only succeeds while the command is still queued. Abandoning the future
//! never stops the pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};

use super::PublishError;

const STATE_QUEUED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_CANCELLED: u8 = 2;

/// Resolves once the command pipeline finishes (or refuses) the command.
pub struct CommandFuture<R> {
    receiver: Receiver<Result<R, PublishError>>,
    state: Arc<AtomicU8>,
}

impl<R> CommandFuture<R> {
    /// Block until the command resolves.
    pub fn wait(self) -> Result<R, PublishError> {
        match self.receiver.recv() {
            Ok(result) => result,
            Err(_) => Err(PublishError::IllegalState {
                reason: "command consumer stopped before resolving".into(),
            }),
        }
    }

    /// Block up to `timeout`. `None` means still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<R, PublishError>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(PublishError::IllegalState {
                reason: "command consumer stopped before resolving".into(),
            })),
        }
    }

    /// Cancel the command. Succeeds only while it is still queued; once a
    /// worker has claimed it the pipeline runs to completion and this
    /// returns `false`.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_QUEUED,
                STATE_CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Worker-side claim on a queued command.
pub(crate) struct ClaimToken {
    state: Arc<AtomicU8>,
}

impl ClaimToken {
    /// Move Queued -> Running. `false` means the caller cancelled first.
    pub(crate) fn claim(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_QUEUED,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Worker-side completion handle.
pub(crate) struct CompletionSlot<R> {
    sender: Sender<Result<R, PublishError>>,
}

impl<R> CompletionSlot<R> {
    pub(crate) fn complete(self, result: Result<R, PublishError>) {
        // The caller may have abandoned the future; that is their right.
        let _ = self.sender.send(result);
    }
}

pub(crate) fn command_future<R>() -> (CommandFuture<R>, CompletionSlot<R>, ClaimToken) {
    let (sender, receiver) = bounded(1);
    let state = Arc::new(AtomicU8::new(STATE_QUEUED));
    (
        CommandFuture {
            receiver,
            state: state.clone(),
        },
        CompletionSlot { sender },
        ClaimToken { state },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_with_result() {
        let (future, slot, claim) = command_future::<u32>();
        assert!(claim.claim());
        slot.complete(Ok(7));
        assert_eq!(future.wait().unwrap(), 7);
    }

    #[test]
    fn cancel_wins_only_before_claim() {
        let (future, _slot, claim) = command_future::<u32>();
        assert!(future.cancel());
        assert!(!claim.claim());

        let (future, _slot, claim) = command_future::<u32>();
        assert!(claim.claim());
        assert!(!future.cancel());
    }

    #[test]
    fn dropped_slot_reads_as_stopped_consumer() {
        let (future, slot, _claim) = command_future::<u32>();
        drop(slot);
        assert!(matches!(
            future.wait(),
            Err(PublishError::IllegalState { .. })
        ));
    }

    #[test]
    fn wait_timeout_reports_pending() {
        let (future, slot, _claim) = command_future::<u32>();
        assert!(future.wait_timeout(Duration::from_millis(1)).is_none());
        slot.complete(Ok(1));
        assert_eq!(
            future.wait_timeout(Duration::from_millis(100)).unwrap().unwrap(),
            1
        );
    }
}
