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

//! Idle, prepare and check watchers
//!
//! Phase watchers run once per loop iteration: idle and prepare before the
//! poll, check after it. An active idle watcher keeps the poll from
//! blocking.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::events::{EventLoop, HandleKind, InitArg, RawDispatch, StartArgs};
use crate::watcher::{invoke_restoring, Watcher, WatcherCore, WatcherState};
use crate::Result;

pub(crate) struct PhaseInner {
    core: WatcherCore,
    cb: RefCell<Option<Box<dyn FnMut()>>>,
}

impl PhaseInner {
    fn start(this: &Rc<PhaseInner>, cb: Box<dyn FnMut()>) -> Result<()> {
        if this.core.state() == WatcherState::Active {
            *this.cb.borrow_mut() = Some(cb);
            return Ok(());
        }
        let dispatch: Weak<PhaseInner> = Rc::downgrade(this);
        this.core.ensure_init(dispatch, InitArg::None)?;
        *this.cb.borrow_mut() = Some(cb);
        this.core.arm(StartArgs::None)
    }
}

impl RawDispatch for PhaseInner {
    fn raw_dispatch(&self, _status: i32, _datum: u32) {
        if !self.core.dispatchable() {
            return;
        }
        invoke_restoring(&self.core, &self.cb, |cb| cb());
    }
}

macro_rules! phase_watcher {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name {
            inner: Rc<PhaseInner>,
        }

        impl $name {
            pub(crate) fn new(lp: Rc<EventLoop>) -> $name {
                $name {
                    inner: Rc::new(PhaseInner {
                        core: WatcherCore::new(lp, $kind, true),
                        cb: RefCell::new(None),
                    }),
                }
            }

            /// Run the callback once per loop iteration in this watcher's
            /// phase.
            pub fn start(&self, cb: impl FnMut() + 'static) -> Result<()> {
                PhaseInner::start(&self.inner, Box::new(cb))
            }
        }

        impl Watcher for $name {
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
    };
}

phase_watcher!(
    /// Runs every iteration before polling and forces the poll not to
    /// block while active.
    IdleWatcher,
    HandleKind::Idle
);

phase_watcher!(
    /// Runs every iteration right before the poll.
    PrepareWatcher,
    HandleKind::Prepare
);

phase_watcher!(
    /// Runs every iteration after the poll.
    CheckWatcher,
    HandleKind::Check
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn idle_watcher_fires_every_iteration() {
        let lp = EventLoop::new().unwrap();
        let idle = lp.idle();
        let count = Rc::new(Cell::new(0u32));
        let seen = count.clone();
        idle.start(move || seen.set(seen.get() + 1)).unwrap();

        lp.run_once(0).unwrap();
        lp.run_once(0).unwrap();
        assert_eq!(count.get(), 2);

        idle.stop().unwrap();
        lp.run_once(0).unwrap();
        assert_eq!(count.get(), 2);
        idle.close();
    }

    #[test]
    fn check_only_fires_while_started() {
        let lp = EventLoop::new().unwrap();
        let check = lp.check();
        let fired = Rc::new(Cell::new(false));
        let seen = fired.clone();
        check.start(move || seen.set(true)).unwrap();
        assert!(check.active());
        lp.run_once(0).unwrap();
        assert!(fired.get());
        check.close();
        assert_eq!(check.state(), WatcherState::Closed);
    }
}
