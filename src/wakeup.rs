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

//! Cross-thread wakeup watcher
//!
//! The only watcher whose trigger side may run off the loop thread. The
//! trigger stores a flag and writes the loop's eventfd, nothing else, so it
//! is safe from signal handlers and foreign threads.

use std::cell::RefCell;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::events::{EventLoop, HandleKind, InitArg, RawDispatch, StartArgs};
use crate::syscall;
use crate::watcher::{invoke_restoring, Watcher, WatcherCore, WatcherState};
use crate::{Error, Result};

/// The loop's wakeup descriptor. Shared with notifiers through an `Arc` so
/// the descriptor stays valid for as long as anything can still write it.
pub(crate) struct WakeupFd {
    fd: RawFd,
}

impl WakeupFd {
    pub(crate) fn new() -> Result<WakeupFd> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok(WakeupFd { fd })
    }

    /// Async-signal-safe: one write(2), no allocation, result ignored
    /// (EAGAIN means the counter is already non-zero).
    pub(crate) fn notify(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    pub(crate) fn drain(&self) {
        let mut buf: u64 = 0;
        loop {
            let n = unsafe { libc::read(self.fd, &mut buf as *mut u64 as *mut libc::c_void, 8) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl AsRawFd for WakeupFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for WakeupFd {
    fn drop(&mut self) {
        let _ = syscall!(close(self.fd));
    }
}

/// Trigger half of one async watcher, shared between the loop slot, the
/// watcher and any notifiers.
pub(crate) struct AsyncShared {
    pending: AtomicBool,
    closed: AtomicBool,
    wake: Arc<WakeupFd>,
}

impl AsyncShared {
    pub(crate) fn new(wake: Arc<WakeupFd>) -> AsyncShared {
        AsyncShared {
            pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            wake,
        }
    }

    pub(crate) fn signal(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::UseAfterClose {
                what: "async watcher handle",
            });
        }
        self.pending.store(true, Ordering::Release);
        self.wake.notify();
        Ok(())
    }

    pub(crate) fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Sendable trigger for an [`AsyncWatcher`].
#[derive(Clone)]
pub struct AsyncNotifier {
    shared: Arc<AsyncShared>,
}

impl AsyncNotifier {
    /// Mark the watcher pending and wake its loop. Callable from any thread
    /// or from a signal handler.
    pub fn send(&self) -> Result<()> {
        self.shared.signal()
    }
}

pub(crate) struct AsyncInner {
    core: WatcherCore,
    cb: RefCell<Option<Box<dyn FnMut()>>>,
    shared: RefCell<Option<Arc<AsyncShared>>>,
}

impl RawDispatch for AsyncInner {
    fn raw_dispatch(&self, _status: i32, _datum: u32) {
        if !self.core.dispatchable() {
            return;
        }
        invoke_restoring(&self.core, &self.cb, |cb| cb());
    }
}

/// Cross-thread wakeup watcher: the callback runs on the loop thread on the
/// tick after any notifier fired, however many times it fired.
#[derive(Clone)]
pub struct AsyncWatcher {
    inner: Rc<AsyncInner>,
}

impl AsyncWatcher {
    pub(crate) fn new(lp: Rc<EventLoop>) -> AsyncWatcher {
        AsyncWatcher {
            inner: Rc::new(AsyncInner {
                core: WatcherCore::new(lp, HandleKind::Async, true),
                cb: RefCell::new(None),
                shared: RefCell::new(None),
            }),
        }
    }

    /// Arm the watcher. The callback fires once per tick with a pending
    /// wakeup, regardless of how many sends coalesced into it.
    pub fn start(&self, cb: impl FnMut() + 'static) -> Result<()> {
        if self.inner.core.state() == WatcherState::Active {
            *self.inner.cb.borrow_mut() = Some(Box::new(cb));
            return Ok(());
        }
        let dispatch: Weak<AsyncInner> = Rc::downgrade(&self.inner);
        self.inner.core.ensure_init(dispatch, InitArg::None)?;
        if self.inner.shared.borrow().is_none() {
            let shared = self
                .inner
                .core
                .event_loop()
                .async_shared(self.inner.core.token());
            *self.inner.shared.borrow_mut() = shared;
        }
        *self.inner.cb.borrow_mut() = Some(Box::new(cb));
        self.inner.core.arm(StartArgs::None)
    }

    /// Trigger from the loop thread. Fails loudly once the handle is closed.
    pub fn send(&self) -> Result<()> {
        match self.inner.shared.borrow().as_ref() {
            Some(shared) => shared.signal(),
            None => Err(Error::Other {
                word: "async watcher was never started",
            }),
        }
    }

    /// A `Send + Sync` trigger for foreign threads and signal handlers.
    pub fn notifier(&self) -> Result<AsyncNotifier> {
        match self.inner.shared.borrow().as_ref() {
            Some(shared) => Ok(AsyncNotifier {
                shared: shared.clone(),
            }),
            None => Err(Error::Other {
                word: "async watcher was never started",
            }),
        }
    }

    pub(crate) fn shared(&self) -> Option<Arc<AsyncShared>> {
        self.inner.shared.borrow().clone()
    }
}

impl Watcher for AsyncWatcher {
    fn state(&self) -> WatcherState {
        self.inner.core.state()
    }

    fn stop(&self) -> Result<()> {
        self.inner.core.do_stop()?;
        *self.inner.cb.borrow_mut() = None;
        Ok(())
    }

    fn close(&self) {
        self.inner.core.do_close();
        *self.inner.cb.borrow_mut() = None;
    }

    fn has_ref(&self) -> bool {
        self.inner.core.has_ref()
    }

    fn set_ref(&self, on: bool) {
        self.inner.core.set_ref(on)
    }
}
