// Copyright (c) 2022 Huawei Technologies Co.,Ltd. All rights reserved.
//
// sysMaster is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Fork and child-exit watchers
//!
//! The backend has no handle kind for either event class, so both are
//! synthesized: an owned wakeup watcher plus a registration in the loop's
//! observer list. The trigger side stores its payload in atomics and
//! signals the wakeup, which keeps it safe to call from the restricted
//! contexts that observe these events (signal handlers, post-fork hooks,
//! foreign threads); the callback itself runs on the loop thread on the
//! next tick.

use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::events::EventLoop;
use crate::wakeup::{AsyncShared, AsyncWatcher};
use crate::watcher::{Watcher, WatcherState};
use crate::{Error, Result};

pub(crate) struct ForkInner {
    lp: Rc<EventLoop>,
    wakeup: AsyncWatcher,
}

impl ForkInner {
    /// Flag the watcher pending; loop-thread side of the trigger.
    pub(crate) fn deliver(&self) {
        if let Some(shared) = self.wakeup.shared() {
            let _ = shared.signal();
        }
    }
}

/// Watcher dispatched after the process forks.
#[derive(Clone)]
pub struct ForkWatcher {
    inner: Rc<ForkInner>,
}

/// `Send + Sync` trigger for a [`ForkWatcher`], safe inside a post-fork
/// hook.
#[derive(Clone)]
pub struct ForkNotifier {
    shared: Arc<AsyncShared>,
}

impl ForkNotifier {
    /// Mark the watcher pending and wake its loop.
    pub fn notify(&self) -> Result<()> {
        self.shared.signal()
    }
}

impl ForkWatcher {
    pub(crate) fn new(lp: Rc<EventLoop>) -> ForkWatcher {
        let wakeup = AsyncWatcher::new(lp.clone());
        ForkWatcher {
            inner: Rc::new(ForkInner { lp, wakeup }),
        }
    }

    /// Register with the loop's fork observers and arm the wakeup.
    pub fn start(&self, cb: impl FnMut() + 'static) -> Result<()> {
        self.inner.wakeup.start(cb)?;
        self.inner.lp.register_fork_observer(&self.inner);
        Ok(())
    }

    /// Loop-thread trigger, normally reached through
    /// [`EventLoop::notify_fork`].
    pub fn notify(&self) {
        self.inner.deliver()
    }

    /// Trigger handle for the post-fork hook. Only valid once started.
    pub fn notifier(&self) -> Result<ForkNotifier> {
        match self.inner.wakeup.shared() {
            Some(shared) => Ok(ForkNotifier { shared }),
            None => Err(Error::Other {
                word: "fork watcher was never started",
            }),
        }
    }
}

impl Watcher for ForkWatcher {
    fn state(&self) -> WatcherState {
        self.inner.wakeup.state()
    }

    fn stop(&self) -> Result<()> {
        self.inner.lp.unregister_fork_observer(&self.inner);
        self.inner.wakeup.stop()
    }

    fn close(&self) {
        self.inner.lp.unregister_fork_observer(&self.inner);
        self.inner.wakeup.close()
    }

    fn has_ref(&self) -> bool {
        self.inner.wakeup.has_ref()
    }

    fn set_ref(&self, on: bool) {
        self.inner.wakeup.set_ref(on)
    }
}

struct ChildPayload {
    rpid: AtomicI32,
    rstatus: AtomicI32,
}

pub(crate) struct ChildInner {
    lp: Rc<EventLoop>,
    wakeup: AsyncWatcher,
    pid: libc::pid_t,
    payload: Arc<ChildPayload>,
}

impl ChildInner {
    /// Store the reaped status and flag the watcher, if the pid matches.
    pub(crate) fn deliver_status(&self, pid: libc::pid_t, status: i32) {
        if self.pid != 0 && self.pid != pid {
            return;
        }
        self.payload.rpid.store(pid, Ordering::SeqCst);
        self.payload.rstatus.store(status, Ordering::SeqCst);
        if let Some(shared) = self.wakeup.shared() {
            let _ = shared.signal();
        }
    }
}

/// Watcher dispatched when a watched child's exit status is reported.
#[derive(Clone)]
pub struct ChildWatcher {
    inner: Rc<ChildInner>,
}

/// `Send + Sync` trigger for a [`ChildWatcher`]: stores `(pid, status)` in
/// atomics and wakes the loop. Safe from a SIGCHLD handler.
#[derive(Clone)]
pub struct ChildNotifier {
    payload: Arc<ChildPayload>,
    shared: Arc<AsyncShared>,
}

impl ChildNotifier {
    /// Record a reaped child and wake the loop.
    pub fn notify(&self, pid: libc::pid_t, status: i32) -> Result<()> {
        self.payload.rpid.store(pid, Ordering::SeqCst);
        self.payload.rstatus.store(status, Ordering::SeqCst);
        self.shared.signal()
    }
}

impl ChildWatcher {
    pub(crate) fn new(lp: Rc<EventLoop>, pid: libc::pid_t) -> ChildWatcher {
        let wakeup = AsyncWatcher::new(lp.clone());
        ChildWatcher {
            inner: Rc::new(ChildInner {
                lp,
                wakeup,
                pid,
                payload: Arc::new(ChildPayload {
                    rpid: AtomicI32::new(0),
                    rstatus: AtomicI32::new(0),
                }),
            }),
        }
    }

    /// The watched pid; 0 watches any child.
    pub fn pid(&self) -> libc::pid_t {
        self.inner.pid
    }

    /// Register with the loop's child observers and arm the wakeup. The
    /// callback receives the reported `(pid, status)`.
    pub fn start(&self, mut cb: impl FnMut(libc::pid_t, i32) + 'static) -> Result<()> {
        let payload = self.inner.payload.clone();
        self.inner.wakeup.start(move || {
            cb(
                payload.rpid.load(Ordering::SeqCst),
                payload.rstatus.load(Ordering::SeqCst),
            )
        })?;
        self.inner.lp.register_child_observer(&self.inner);
        Ok(())
    }

    /// Loop-thread trigger, normally reached through
    /// [`EventLoop::notify_child`].
    pub fn notify(&self, pid: libc::pid_t, status: i32) {
        self.inner.deliver_status(pid, status)
    }

    /// Trigger handle for the SIGCHLD facility. Only valid once started.
    pub fn notifier(&self) -> Result<ChildNotifier> {
        match self.inner.wakeup.shared() {
            Some(shared) => Ok(ChildNotifier {
                payload: self.inner.payload.clone(),
                shared,
            }),
            None => Err(Error::Other {
                word: "child watcher was never started",
            }),
        }
    }
}

impl Watcher for ChildWatcher {
    fn state(&self) -> WatcherState {
        self.inner.wakeup.state()
    }

    fn stop(&self) -> Result<()> {
        self.inner.lp.unregister_child_observer(&self.inner);
        self.inner.wakeup.stop()
    }

    fn close(&self) {
        self.inner.lp.unregister_child_observer(&self.inner);
        self.inner.wakeup.close()
    }

    fn has_ref(&self) -> bool {
        self.inner.wakeup.has_ref()
    }

    fn set_ref(&self, on: bool) {
        self.inner.wakeup.set_ref(on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifier_requires_start() {
        let lp = EventLoop::new().unwrap();
        let child = lp.child(42);
        assert!(child.notifier().is_err());
        assert_eq!(child.pid(), 42);
    }

    #[test]
    fn mismatched_pid_is_ignored() {
        let lp = EventLoop::new().unwrap();
        let child = lp.child(42);
        let fired = Rc::new(std::cell::Cell::new(false));
        let seen = fired.clone();
        child.start(move |_, _| seen.set(true)).unwrap();

        child.notify(43, 0);
        lp.run_once(0).unwrap();
        assert!(!fired.get());

        child.notify(42, 7);
        lp.run_once(10).unwrap();
        assert!(fired.get());
        child.close();
    }
}
