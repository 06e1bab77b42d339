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

//! Timer watcher
//!
//! The backend's resolution is one millisecond; shorter non-zero durations
//! are clamped up with a warning. A timer that is zero in both `after` and
//! `repeat` cannot go through the native timeout path (a zero-length native
//! timer would be seen as expired again and again and stall the loop), so
//! it is realized as a check-phase watcher that fires on the next iteration
//! and stops itself.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::clock::{self, USEC_PER_MSEC};
use crate::events::{EventLoop, HandleKind, InitArg, RawDispatch, StartArgs};
use crate::watcher::{invoke_restoring, Watcher, WatcherCore, WatcherState};
use crate::Result;

pub(crate) struct TimerInner {
    core: WatcherCore,
    after: Cell<u64>,
    repeat: Cell<u64>,
    next_tick: bool,
    cb: RefCell<Option<Box<dyn FnMut()>>>,
}

impl TimerInner {
    fn start(this: &Rc<TimerInner>, cb: Box<dyn FnMut()>) -> Result<()> {
        if this.core.state() == WatcherState::Active {
            *this.cb.borrow_mut() = Some(cb);
            return Ok(());
        }
        let dispatch: Weak<TimerInner> = Rc::downgrade(this);
        this.core.ensure_init(dispatch, InitArg::None)?;
        *this.cb.borrow_mut() = Some(cb);
        if this.next_tick {
            this.core.arm(StartArgs::None)
        } else {
            this.core.arm(StartArgs::Timer {
                after: this.after.get(),
                repeat: this.repeat.get(),
            })
        }
    }
}

impl RawDispatch for TimerInner {
    fn raw_dispatch(&self, _status: i32, _datum: u32) {
        if !self.core.dispatchable() {
            return;
        }
        if self.next_tick || self.repeat.get() == 0 {
            // One-shot: the native side already disarmed a plain timer; the
            // check-phase variant stops itself before the callback runs.
            if self.next_tick {
                if let Err(e) = self.core.do_stop() {
                    log::warn!("Failed to stop one-shot watcher: {}", e);
                }
            } else {
                self.core.mark_stopped();
            }
            let taken = self.cb.borrow_mut().take();
            if let Some(mut cb) = taken {
                cb();
            }
        } else {
            invoke_restoring(&self.core, &self.cb, |cb| cb());
        }
    }
}

/// Timer watcher with an initial timeout and an optional repeat interval.
#[derive(Clone)]
pub struct TimerWatcher {
    inner: Rc<TimerInner>,
}

impl TimerWatcher {
    pub(crate) fn new(lp: Rc<EventLoop>, after: Duration, repeat: Duration) -> TimerWatcher {
        let mut after = clock::duration_usec(after);
        let mut repeat = clock::duration_usec(repeat);
        if after > 0 && after < USEC_PER_MSEC {
            log::warn!("timer resolution is one millisecond; shorter timeouts are set to 1 ms");
            after = USEC_PER_MSEC;
        }
        if repeat > 0 && repeat < USEC_PER_MSEC {
            log::warn!("timer resolution is one millisecond; shorter repeats are set to 1 ms");
            repeat = USEC_PER_MSEC;
        }
        let next_tick = after == 0 && repeat == 0;
        let kind = if next_tick {
            HandleKind::Check
        } else {
            HandleKind::Timer
        };
        TimerWatcher {
            inner: Rc::new(TimerInner {
                core: WatcherCore::new(lp, kind, true),
                after: Cell::new(after),
                repeat: Cell::new(repeat),
                next_tick,
                cb: RefCell::new(None),
            }),
        }
    }

    /// The (clamped) initial timeout.
    pub fn after(&self) -> Duration {
        Duration::from_micros(self.inner.after.get())
    }

    /// The (clamped) repeat interval; zero means one-shot.
    pub fn repeat(&self) -> Duration {
        Duration::from_micros(self.inner.repeat.get())
    }

    /// Arm the timer to fire after its initial timeout.
    pub fn start(&self, cb: impl FnMut() + 'static) -> Result<()> {
        TimerInner::start(&self.inner, Box::new(cb))
    }

    /// Restart counting from now. Never started behaves exactly like
    /// [`start`](Self::start); active with a repeat interval re-arms with
    /// that interval; active without one stops the timer.
    pub fn again(&self, cb: impl FnMut() + 'static) -> Result<()> {
        if self.inner.next_tick || !self.active() {
            return TimerInner::start(&self.inner, Box::new(cb));
        }
        if self.inner.repeat.get() == 0 {
            return self.stop();
        }
        *self.inner.cb.borrow_mut() = Some(Box::new(cb));
        self.inner.core.arm(StartArgs::TimerAgain)
    }
}

impl Watcher for TimerWatcher {
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
