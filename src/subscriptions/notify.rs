//! Wait/notify plumbing for subscription set state changes.
//!
//! Callers register interest in a set version reaching a target state and
//! get back a one-shot [`StateNotification`]. The committing editor
//! dispatches after each commit, resolving every matching request exactly
//! once. An `outstanding_requests` counter plus condition variable keeps a
//! dispatch from running between a caller's state probe and its enqueue,
//! which is what makes the delivered outcome race-free.

use super::types::SetState;
use crate::error::{Result, StoreError};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::time::Duration;
use tracing::trace;

type NotificationResult = std::result::Result<SetState, StoreError>;

/// One-shot future resolved when a subscription set reaches a target
/// state, goes to Error, or is superseded.
pub struct StateNotification {
    receiver: Receiver<NotificationResult>,
}

impl StateNotification {
    fn ready_with(result: NotificationResult) -> Self {
        let (sender, receiver) = bounded(1);
        // A bounded(1) channel we just created cannot be full.
        let _ = sender.send(result);
        Self { receiver }
    }

    pub(crate) fn ready(state: SetState) -> Self {
        Self::ready_with(Ok(state))
    }

    pub(crate) fn ready_err(err: StoreError) -> Self {
        Self::ready_with(Err(err))
    }

    /// Block until the notification resolves.
    pub fn recv(&self) -> Result<SetState> {
        match self.receiver.recv() {
            Ok(result) => result,
            Err(_) => Err(StoreError::StoreReleased),
        }
    }

    /// Non-blocking poll; `None` if not yet resolved.
    pub fn try_recv(&self) -> Option<Result<SetState>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(crossbeam_channel::TryRecvError::Empty) => None,
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                Some(Err(StoreError::StoreReleased))
            }
        }
    }

    /// Block up to `timeout`; `None` if it elapses first.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Result<SetState>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Some(Err(StoreError::StoreReleased))
            }
        }
    }
}

struct NotificationRequest {
    version: i64,
    sender: Sender<NotificationResult>,
    notify_when: SetState,
}

#[derive(Default)]
struct PendingNotifications {
    pending: Vec<NotificationRequest>,
    /// Low-water mark: versions below this are deemed superseded. Never
    /// decreased.
    min_outstanding_version: i64,
    /// Registrations currently between their state probe and enqueue.
    outstanding_requests: usize,
}

/// Per-store notification state: the pending request list, the
/// supersedence watermark, and the registration interlock.
pub(crate) struct NotificationCenter {
    state: Mutex<PendingNotifications>,
    cv: Condvar,
}

/// Outcome of starting a registration.
pub(crate) enum Registration<'a> {
    /// The version is below the watermark; resolve immediately.
    Superseded,
    /// Registration is open; dispatch is blocked until the guard drops.
    Open(RegistrationGuard<'a>),
}

/// Holds the `outstanding_requests` increment. Dropping it (on any exit
/// path) decrements the counter and wakes a waiting dispatch.
pub(crate) struct RegistrationGuard<'a> {
    center: &'a NotificationCenter,
}

impl<'a> RegistrationGuard<'a> {
    /// Enqueue a request and return its future. The guard's drop runs
    /// after the push, so dispatch cannot observe the counter at zero
    /// without also observing the request.
    pub(crate) fn enqueue(self, version: i64, notify_when: SetState) -> StateNotification {
        let (sender, receiver) = bounded(1);
        {
            let mut st = self.center.state.lock();
            st.pending.push(NotificationRequest {
                version,
                sender,
                notify_when,
            });
        }
        StateNotification { receiver }
    }
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.center.state.lock();
        st.outstanding_requests -= 1;
        self.center.cv.notify_one();
    }
}

impl NotificationCenter {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PendingNotifications::default()),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn min_outstanding_version(&self) -> i64 {
        self.state.lock().min_outstanding_version
    }

    /// Start a registration for `version`. If the version is already below
    /// the watermark the caller must resolve to Superseded without
    /// enqueueing anything.
    pub(crate) fn begin_register(&self, version: i64) -> Registration<'_> {
        let mut st = self.state.lock();
        if st.min_outstanding_version > version {
            return Registration::Superseded;
        }
        st.outstanding_requests += 1;
        Registration::Open(RegistrationGuard { center: self })
    }

    /// Resolve every request matched by the freshly-committed state of
    /// `my_version`. Invoked by the committing editor after the commit is
    /// visible.
    pub(crate) fn dispatch(&self, my_version: i64, new_state: SetState, error_str: Option<&str>) {
        let mut to_finish = Vec::new();
        {
            let mut st = self.state.lock();
            while st.outstanding_requests != 0 {
                self.cv.wait(&mut st);
            }

            let mut idx = 0;
            while idx < st.pending.len() {
                let req = &st.pending[idx];
                let matches_self = req.version == my_version
                    && (new_state == SetState::Error || new_state.reached(req.notify_when));
                let superseded_by_self = new_state == SetState::Complete && req.version < my_version;
                if matches_self || superseded_by_self {
                    to_finish.push(st.pending.remove(idx));
                } else {
                    idx += 1;
                }
            }

            if new_state == SetState::Complete {
                st.min_outstanding_version = my_version;
            }
        }

        trace!(
            version = my_version,
            state = ?new_state,
            resolved = to_finish.len(),
            "dispatched state change notifications"
        );

        for req in to_finish {
            let result = if new_state == SetState::Error && req.version == my_version {
                Err(StoreError::Runtime(
                    error_str.unwrap_or_default().to_string(),
                ))
            } else if req.version < my_version {
                Ok(SetState::Superseded)
            } else {
                Ok(new_state)
            };
            let _ = req.sender.send(result);
        }
    }

    /// Resolve every request for any version other than `version_to_keep`
    /// as Superseded and advance the watermark to it.
    pub(crate) fn supercede_all_except(&self, version_to_keep: i64) {
        let mut to_finish = Vec::new();
        {
            let mut st = self.state.lock();
            while st.outstanding_requests != 0 {
                self.cv.wait(&mut st);
            }

            let mut idx = 0;
            while idx < st.pending.len() {
                if st.pending[idx].version != version_to_keep {
                    to_finish.push(st.pending.remove(idx));
                } else {
                    idx += 1;
                }
            }

            debug_assert!(version_to_keep >= st.min_outstanding_version);
            st.min_outstanding_version = version_to_keep;
        }

        for req in to_finish {
            let _ = req.sender.send(Ok(SetState::Superseded));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_notification_resolves_immediately() {
        let n = StateNotification::ready(SetState::Complete);
        assert_eq!(n.recv().unwrap(), SetState::Complete);
    }

    #[test]
    fn test_ready_err_carries_text() {
        let n = StateNotification::ready_err(StoreError::Runtime("boom".into()));
        match n.recv() {
            Err(StoreError::Runtime(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_resolves_target_reached() {
        let center = NotificationCenter::new();
        let guard = match center.begin_register(1) {
            Registration::Open(guard) => guard,
            Registration::Superseded => panic!("fresh center has no watermark"),
        };
        let n = guard.enqueue(1, SetState::Complete);

        assert!(n.try_recv().is_none());
        center.dispatch(1, SetState::Complete, None);
        assert_eq!(n.recv().unwrap(), SetState::Complete);
    }

    #[test]
    fn test_dispatch_skips_unreached_target() {
        let center = NotificationCenter::new();
        let guard = match center.begin_register(1) {
            Registration::Open(guard) => guard,
            Registration::Superseded => panic!(),
        };
        let n = guard.enqueue(1, SetState::Complete);

        center.dispatch(1, SetState::Bootstrapping, None);
        assert!(n.try_recv().is_none());

        center.dispatch(1, SetState::Complete, None);
        assert_eq!(n.recv().unwrap(), SetState::Complete);
    }

    #[test]
    fn test_complete_supersedes_older_versions() {
        let center = NotificationCenter::new();
        let guard = match center.begin_register(1) {
            Registration::Open(guard) => guard,
            Registration::Superseded => panic!(),
        };
        let n = guard.enqueue(1, SetState::Complete);

        center.dispatch(2, SetState::Complete, None);
        assert_eq!(n.recv().unwrap(), SetState::Superseded);
        assert_eq!(center.min_outstanding_version(), 2);
    }

    #[test]
    fn test_registration_below_watermark_short_circuits() {
        let center = NotificationCenter::new();
        center.dispatch(5, SetState::Complete, None);

        match center.begin_register(3) {
            Registration::Superseded => {}
            Registration::Open(_) => panic!("version 3 is below the watermark"),
        };
    }

    #[test]
    fn test_error_dispatch_fails_request() {
        let center = NotificationCenter::new();
        let guard = match center.begin_register(4) {
            Registration::Open(guard) => guard,
            Registration::Superseded => panic!(),
        };
        let n = guard.enqueue(4, SetState::Complete);

        center.dispatch(4, SetState::Error, Some("rejected"));
        match n.recv() {
            Err(StoreError::Runtime(msg)) => assert_eq!(msg, "rejected"),
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_supercede_all_except_keeps_one() {
        let center = NotificationCenter::new();
        let n1 = match center.begin_register(1) {
            Registration::Open(guard) => guard.enqueue(1, SetState::Complete),
            Registration::Superseded => panic!(),
        };
        let n2 = match center.begin_register(2) {
            Registration::Open(guard) => guard.enqueue(2, SetState::Complete),
            Registration::Superseded => panic!(),
        };

        center.supercede_all_except(2);
        assert_eq!(n1.recv().unwrap(), SetState::Superseded);
        assert!(n2.try_recv().is_none());
        assert_eq!(center.min_outstanding_version(), 2);
    }

    #[test]
    fn test_dispatch_waits_for_open_registrations() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let center = Arc::new(NotificationCenter::new());

        let guard = match center.begin_register(1) {
            Registration::Open(guard) => guard,
            Registration::Superseded => panic!(),
        };

        let dispatcher = {
            let center = Arc::clone(&center);
            thread::spawn(move || {
                center.dispatch(1, SetState::Complete, None);
            })
        };

        // Give the dispatcher time to reach the condvar wait, then finish
        // the registration. The request must still be resolved.
        thread::sleep(Duration::from_millis(50));
        let n = guard.enqueue(1, SetState::Complete);

        dispatcher.join().unwrap();
        assert_eq!(
            n.recv_timeout(Duration::from_secs(1)).unwrap().unwrap(),
            SetState::Complete
        );
    }
}
