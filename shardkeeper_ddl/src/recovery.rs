//! Tracks whether DDL operations started by a previous primary have been reloaded since this node
//! last became primary.
//!
//! ```text
//!             step up               all coordinators rebuilt
//!   Paused ──────────────▶ Recovering ──────────────────────▶ Recovered
//!     ▲                        │                                  │
//!     └────────────────────────┴──────────────────────────────────┘
//!                               step down
//! ```
//!
//! Step-down is synchronous and interrupts every waiter registered under the previous term.

use std::fmt::Display;

use observability_deps::tracing::info;
use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{DdlError, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecoveryState {
    Paused,
    Recovering,
    Recovered,
}

impl Display for RecoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paused => f.write_str("paused"),
            Self::Recovering => f.write_str("recovering"),
            Self::Recovered => f.write_str("recovered"),
        }
    }
}

/// Why waiting for recovery ended without the node reaching [`RecoveryState::Recovered`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecoveryWaitError {
    DeadlineExceeded,
    SteppedDown,
}

#[derive(Debug)]
struct Term {
    term: Option<i64>,
    interrupt: CancellationToken,
}

#[derive(Debug)]
pub struct RecoveryTracker {
    state: watch::Sender<RecoveryState>,
    term: Mutex<Term>,
}

impl Default for RecoveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryTracker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RecoveryState::Paused);
        Self {
            state,
            term: Mutex::new(Term {
                term: None,
                interrupt: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> RecoveryState {
        *self.state.borrow()
    }

    /// The term this node is primary in, `None` while not primary.
    pub fn current_term(&self) -> Option<i64> {
        self.term.lock().term
    }

    /// Token cancelled on the next step-down.
    pub fn interrupt_token(&self) -> CancellationToken {
        self.term.lock().interrupt.clone()
    }

    pub fn on_step_up(&self, term: i64) {
        let mut t = self.term.lock();
        t.term = Some(term);
        let previous = self.state.send_replace(RecoveryState::Recovering);
        info!(term, from = %previous, "DDL recovery state changed to recovering");
    }

    pub fn on_step_down(&self) {
        let mut t = self.term.lock();
        t.term = None;
        t.interrupt.cancel();
        t.interrupt = CancellationToken::new();
        let previous = self.state.send_replace(RecoveryState::Paused);
        info!(from = %previous, "DDL recovery state changed to paused");
    }

    /// Finish recovery of `term`. Does nothing if the node has since stepped down or up again.
    pub fn set_recovered(&self, term: i64) -> bool {
        let t = self.term.lock();
        if t.term != Some(term) || self.state() != RecoveryState::Recovering {
            return false;
        }
        self.state.send_replace(RecoveryState::Recovered);
        info!(term, "DDL recovery state changed to recovered");
        true
    }

    /// Wait until recovery completes. Fails straight away when the node is not primary and as
    /// soon as it steps down.
    pub async fn wait_for_recovery_completion(&self) -> Result<()> {
        let interrupt = self.interrupt_token();
        let mut rx = self.state.subscribe();
        if *rx.borrow_and_update() == RecoveryState::Paused {
            return Err(DdlError::NotWritablePrimary);
        }
        tokio::select! {
            biased;
            _ = interrupt.cancelled() => Err(DdlError::NotWritablePrimary),
            res = rx.wait_for(|s| *s == RecoveryState::Recovered) => {
                res.map(|_| ()).map_err(|_| DdlError::Interrupted)
            }
        }
    }

    /// Wait until recovery completes or `deadline` passes. Unlike
    /// [`wait_for_recovery_completion`](Self::wait_for_recovery_completion) a paused node is
    /// waited on too, so requests issued before step-up can still be served.
    pub async fn wait_until_recovered(
        &self,
        deadline: Instant,
        interrupt: &CancellationToken,
    ) -> Result<(), RecoveryWaitError> {
        let mut rx = self.state.subscribe();
        tokio::select! {
            biased;
            _ = interrupt.cancelled() => Err(RecoveryWaitError::SteppedDown),
            res = rx.wait_for(|s| *s == RecoveryState::Recovered) => {
                res.map(|_| ()).map_err(|_| RecoveryWaitError::SteppedDown)
            }
            _ = tokio::time::sleep_until(deadline) => Err(RecoveryWaitError::DeadlineExceeded),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[test]
    fn transitions() {
        let tracker = RecoveryTracker::new();
        assert_eq!(RecoveryState::Paused, tracker.state());
        // recovery cannot complete without a step up
        assert!(!tracker.set_recovered(1));

        tracker.on_step_up(1);
        assert_eq!(RecoveryState::Recovering, tracker.state());
        assert!(!tracker.set_recovered(2));
        assert!(tracker.set_recovered(1));
        assert_eq!(RecoveryState::Recovered, tracker.state());

        let token = tracker.interrupt_token();
        tracker.on_step_down();
        assert!(token.is_cancelled());
        assert!(!tracker.interrupt_token().is_cancelled());
        assert_eq!(RecoveryState::Paused, tracker.state());
        assert_eq!(None, tracker.current_term());
    }

    #[test_log::test(tokio::test)]
    async fn wait_for_completion_fails_when_not_primary() {
        let tracker = RecoveryTracker::new();
        assert!(matches!(
            tracker.wait_for_recovery_completion().await,
            Err(DdlError::NotWritablePrimary)
        ));
    }

    #[test_log::test(tokio::test)]
    async fn wait_for_completion_resolves_on_recovery_or_step_down() {
        let tracker = Arc::new(RecoveryTracker::new());
        tracker.on_step_up(3);

        let waiter = tokio::spawn({
            let tracker = Arc::clone(&tracker);
            async move { tracker.wait_for_recovery_completion().await }
        });
        tokio::task::yield_now().await;
        tracker.set_recovered(3);
        waiter.await.unwrap().unwrap();

        tracker.on_step_down();
        tracker.on_step_up(4);
        let waiter = tokio::spawn({
            let tracker = Arc::clone(&tracker);
            async move { tracker.wait_for_recovery_completion().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.on_step_down();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(DdlError::NotWritablePrimary)
        ));
    }

    #[test_log::test(tokio::test)]
    async fn wait_until_recovered_honours_deadline() {
        let tracker = RecoveryTracker::new();
        let token = tracker.interrupt_token();
        let res = tracker
            .wait_until_recovered(Instant::now() + Duration::from_millis(5), &token)
            .await;
        assert_eq!(Err(RecoveryWaitError::DeadlineExceeded), res);
    }
}
