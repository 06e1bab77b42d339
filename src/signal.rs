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

//! Signal watcher
//!
//! Starting one blocks the signal for the loop thread and routes delivery
//! through the loop's signalfd. Signal watchers are created unreffed: on
//! their own they do not keep the loop alive.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use nix::sys::signal::Signal;

use crate::events::{EventLoop, HandleKind, InitArg, RawDispatch, StartArgs};
use crate::watcher::{invoke_restoring, Watcher, WatcherCore, WatcherState};
use crate::Result;

pub(crate) struct SignalInner {
    core: WatcherCore,
    signum: i32,
    cb: RefCell<Option<Box<dyn FnMut(i32)>>>,
}

impl RawDispatch for SignalInner {
    fn raw_dispatch(&self, _status: i32, datum: u32) {
        if !self.core.dispatchable() {
            return;
        }
        invoke_restoring(&self.core, &self.cb, |cb| cb(datum as i32));
    }
}

/// Watcher for one signal; the callback receives the signal number.
#[derive(Clone)]
pub struct SignalWatcher {
    inner: Rc<SignalInner>,
}

impl SignalWatcher {
    pub(crate) fn new(lp: Rc<EventLoop>, signal: Signal) -> SignalWatcher {
        SignalWatcher {
            inner: Rc::new(SignalInner {
                core: WatcherCore::new(lp, HandleKind::Signal, false),
                signum: signal as i32,
                cb: RefCell::new(None),
            }),
        }
    }

    /// The watched signal number.
    pub fn signum(&self) -> i32 {
        self.inner.signum
    }

    /// Block the signal for this thread and arm delivery.
    pub fn start(&self, cb: impl FnMut(i32) + 'static) -> Result<()> {
        if self.inner.core.state() == WatcherState::Active {
            *self.inner.cb.borrow_mut() = Some(Box::new(cb));
            return Ok(());
        }
        let dispatch: Weak<SignalInner> = Rc::downgrade(&self.inner);
        self.inner.core.ensure_init(dispatch, InitArg::None)?;
        *self.inner.cb.borrow_mut() = Some(Box::new(cb));
        self.inner.core.arm(StartArgs::Signal {
            signum: self.inner.signum,
        })
    }
}

impl Watcher for SignalWatcher {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_watcher_defaults_to_unref() {
        let lp = EventLoop::new().unwrap();
        let watcher = lp.signal(Signal::SIGUSR2);
        assert!(!watcher.has_ref());
        assert_eq!(watcher.signum(), Signal::SIGUSR2 as i32);
    }
}
