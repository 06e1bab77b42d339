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

//! Descriptor readiness watcher with multiplexed logical sub-watchers
//!
//! One descriptor gets exactly one native polling handle no matter how many
//! logical readers and writers are interested in it; registering the same
//! descriptor under several native handles is undefined on some backends.
//! The native handle's armed interest always equals the union of the
//! sub-watchers' masks, and closing the last sub-watcher closes the native
//! handle synchronously, before the descriptor number can be reused.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use bitflags::bitflags;

use crate::events::{EventLoop, HandleKind, InitArg, RawDispatch, StartArgs};
use crate::watcher::{Watcher, WatcherCore, WatcherState};
use crate::{Error, Result};

bitflags! {
    /// Readiness classes a watcher can wait for.
    pub struct EventMask: u32 {
        /// Descriptor readable.
        const READ = 1;
        /// Descriptor writable.
        const WRITE = 2;
        /// Peer hung up its end.
        const DISCONNECT = 4;
    }
}

enum IoCallback {
    /// Fan events out to the multiplexed sub-watchers.
    Fanout,
    /// Deliver straight to a user callback.
    User(Box<dyn FnMut(i32, EventMask)>),
}

enum MuxCallback {
    Plain(Box<dyn FnMut()>),
    WithEvents(Box<dyn FnMut(i32, EventMask)>),
}

pub(crate) struct IoInner {
    core: WatcherCore,
    fd: RawFd,
    events: Cell<EventMask>,
    cb: RefCell<Option<IoCallback>>,
    muxes: RefCell<Vec<Rc<MuxInner>>>,
    next_id: Cell<u64>,
}

impl IoInner {
    fn union(&self) -> EventMask {
        self.muxes
            .borrow()
            .iter()
            .fold(EventMask::empty(), |acc, m| acc | m.events.get())
    }

    /// Recompute the armed interest from the sub-watcher masks and re-arm
    /// the native handle in place if the union changed while active.
    fn recalc(this: &Rc<IoInner>) -> Result<()> {
        let union = this.union();
        if union == this.events.get() {
            return Ok(());
        }
        this.events.set(union);
        if this.core.dispatchable() {
            this.core.arm(StartArgs::Poll {
                events: union.bits(),
            })?;
        }
        Ok(())
    }

    /// Arm the native handle on behalf of the sub-watchers.
    fn multiplex_start(this: &Rc<IoInner>) -> Result<()> {
        let dispatch: Weak<IoInner> = Rc::downgrade(this);
        this.core.ensure_init(dispatch, InitArg::Fd(this.fd))?;
        *this.cb.borrow_mut() = Some(IoCallback::Fanout);
        this.core.arm(StartArgs::Poll {
            events: this.events.get().bits(),
        })
    }

    /// Leave the polling set once no sub-watcher is started. The native
    /// handle stays allocated for a fast restart.
    fn maybe_stop(this: &Rc<IoInner>) -> Result<()> {
        if this.muxes.borrow().iter().any(|m| m.started.get()) {
            return Ok(());
        }
        this.core.do_stop()?;
        *this.cb.borrow_mut() = None;
        Ok(())
    }

    /// A sub-watcher closed. Dropping the last one must invalidate the
    /// native handle within this call: a deferred close could tear down a
    /// fresh watcher that reused the descriptor number.
    fn multiplex_closed(this: &Rc<IoInner>, id: u64) {
        let removed = {
            let mut muxes = this.muxes.borrow_mut();
            let before = muxes.len();
            muxes.retain(|m| m.id != id);
            before != muxes.len()
        };
        if !removed {
            return;
        }
        if this.muxes.borrow().is_empty() {
            if let Err(e) = this.core.do_stop() {
                log::warn!("Failed to stop io watcher: {}", e);
            }
            *this.cb.borrow_mut() = None;
            this.core.do_close();
        } else if let Err(e) = IoInner::recalc(this) {
            log::warn!("Failed to narrow io interest: {}", e);
        }
    }

    fn fan_out(&self, status: i32, events: EventMask) {
        // Clone first: a callback may stop or close any sub-watcher, or the
        // whole set, while we iterate.
        let targets: Vec<Rc<MuxInner>> = self.muxes.borrow().clone();
        for mux in targets {
            mux.deliver(status, events);
        }
    }
}

impl RawDispatch for IoInner {
    fn raw_dispatch(&self, status: i32, datum: u32) {
        if !self.core.dispatchable() {
            return;
        }
        let events = EventMask::from_bits_truncate(datum);
        let fanout = matches!(*self.cb.borrow(), Some(IoCallback::Fanout));
        if fanout {
            self.fan_out(status, events);
            return;
        }

        let taken = self.cb.borrow_mut().take();
        if let Some(IoCallback::User(mut cb)) = taken {
            cb(status, events);
            if self.core.state() == WatcherState::Active && self.cb.borrow().is_none() {
                *self.cb.borrow_mut() = Some(IoCallback::User(cb));
            }
        }
    }
}

/// Readiness watcher for one descriptor, usable directly or through
/// multiplexed sub-watchers.
#[derive(Clone)]
pub struct IoWatcher {
    inner: Rc<IoInner>,
}

impl IoWatcher {
    pub(crate) fn new(lp: Rc<EventLoop>, fd: RawFd, events: EventMask) -> IoWatcher {
        IoWatcher {
            inner: Rc::new(IoInner {
                core: WatcherCore::new(lp, HandleKind::Poll, true),
                fd,
                events: Cell::new(events),
                cb: RefCell::new(None),
                muxes: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
            }),
        }
    }

    /// The watched descriptor.
    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    /// The interest the native handle is armed with (union of sub-watcher
    /// masks once multiplexing is in use).
    pub fn events(&self) -> EventMask {
        self.inner.events.get()
    }

    /// Change the interest mask; a live watcher is re-armed in place.
    pub fn set_events(&self, events: EventMask) -> Result<()> {
        if events == self.inner.events.get() {
            return Ok(());
        }
        self.inner.events.set(events);
        if self.inner.core.dispatchable() {
            self.inner.core.arm(StartArgs::Poll {
                events: events.bits(),
            })?;
        }
        Ok(())
    }

    /// Arm with a direct callback. Restarting while active re-arms with the
    /// current mask, which is how the interest of a live watcher changes.
    pub fn start(&self, cb: impl FnMut(i32, EventMask) + 'static) -> Result<()> {
        if self.inner.core.state() == WatcherState::Active {
            *self.inner.cb.borrow_mut() = Some(IoCallback::User(Box::new(cb)));
            return Ok(());
        }
        let dispatch: Weak<IoInner> = Rc::downgrade(&self.inner);
        self.inner.core.ensure_init(dispatch, InitArg::Fd(self.inner.fd))?;
        *self.inner.cb.borrow_mut() = Some(IoCallback::User(Box::new(cb)));
        self.inner.core.arm(StartArgs::Poll {
            events: self.inner.events.get().bits(),
        })
    }

    /// Register a logical sub-watcher. The armed interest becomes the union
    /// of every sub-watcher's mask.
    pub fn multiplex(&self, events: EventMask) -> MultiplexHandle {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        let mux = Rc::new(MuxInner {
            owner: Rc::downgrade(&self.inner),
            id,
            events: Cell::new(events),
            cb: RefCell::new(None),
            started: Cell::new(false),
            closed: Cell::new(false),
        });
        self.inner.muxes.borrow_mut().push(mux.clone());
        if let Err(e) = IoInner::recalc(&self.inner) {
            log::warn!("Failed to widen io interest: {}", e);
        }
        MultiplexHandle { inner: mux }
    }
}

impl Watcher for IoWatcher {
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
        self.inner.muxes.borrow_mut().clear();
    }

    fn has_ref(&self) -> bool {
        self.inner.core.has_ref()
    }

    fn set_ref(&self, on: bool) {
        self.inner.core.set_ref(on)
    }
}

pub(crate) struct MuxInner {
    // Non-owning: the io watcher's lifetime is driven by explicit close
    // calls, never by sub-watchers lingering somewhere.
    owner: Weak<IoInner>,
    id: u64,
    events: Cell<EventMask>,
    cb: RefCell<Option<MuxCallback>>,
    started: Cell<bool>,
    closed: Cell<bool>,
}

impl MuxInner {
    fn deliver(&self, status: i32, events: EventMask) {
        if self.closed.get() || !self.started.get() {
            return;
        }
        // A negative status cannot be attributed to one mask, so it goes to
        // everyone.
        if status >= 0 && !events.intersects(self.events.get()) {
            return;
        }
        let taken = self.cb.borrow_mut().take();
        if let Some(mut cb) = taken {
            match &mut cb {
                MuxCallback::Plain(f) => f(),
                MuxCallback::WithEvents(f) => f(status, events),
            }
            if self.started.get() && self.cb.borrow().is_none() {
                *self.cb.borrow_mut() = Some(cb);
            }
        }
    }
}

/// Logical sub-watcher sharing its owner's native polling handle.
#[derive(Clone)]
pub struct MultiplexHandle {
    inner: Rc<MuxInner>,
}

impl MultiplexHandle {
    /// The mask this sub-watcher is interested in.
    pub fn events(&self) -> EventMask {
        self.inner.events.get()
    }

    /// Change the interest mask. Only allowed while not started.
    pub fn set_events(&self, events: EventMask) -> Result<()> {
        if self.inner.started.get() {
            return Err(Error::Other {
                word: "cannot change events while started",
            });
        }
        self.inner.events.set(events);
        if let Some(owner) = self.inner.owner.upgrade() {
            IoInner::recalc(&owner)?;
        }
        Ok(())
    }

    /// Whether this sub-watcher currently has a callback armed.
    pub fn active(&self) -> bool {
        self.inner.started.get() && !self.inner.closed.get()
    }

    /// Start with a callback that ignores the event bits.
    pub fn start(&self, cb: impl FnMut() + 'static) -> Result<()> {
        self.start_inner(MuxCallback::Plain(Box::new(cb)))
    }

    /// Start with a callback receiving `(status, events)`; status is
    /// negative when the backend reported an error for the descriptor.
    pub fn start_with_events(&self, cb: impl FnMut(i32, EventMask) + 'static) -> Result<()> {
        self.start_inner(MuxCallback::WithEvents(Box::new(cb)))
    }

    fn start_inner(&self, cb: MuxCallback) -> Result<()> {
        if self.inner.closed.get() {
            return Err(Error::UseAfterClose {
                what: "multiplexed io watcher",
            });
        }
        let owner = match self.inner.owner.upgrade() {
            Some(owner) => owner,
            None => {
                return Err(Error::UseAfterClose {
                    what: "io watcher owning this sub-watcher",
                })
            }
        };
        *self.inner.cb.borrow_mut() = Some(cb);
        self.inner.started.set(true);
        if !owner.core.dispatchable() {
            IoInner::multiplex_start(&owner)?;
        }
        Ok(())
    }

    /// Disarm. If no sub-watcher remains started, the owner leaves the
    /// polling set (its native handle survives for a fast restart).
    pub fn stop(&self) -> Result<()> {
        self.inner.cb.borrow_mut().take();
        self.inner.started.set(false);
        if let Some(owner) = self.inner.owner.upgrade() {
            IoInner::maybe_stop(&owner)?;
        }
        Ok(())
    }

    /// Remove this sub-watcher from its owner. Closing the last one closes
    /// the owner's native handle synchronously. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.get() {
            return;
        }
        self.inner.closed.set(true);
        self.inner.started.set(false);
        self.inner.cb.borrow_mut().take();
        if let Some(owner) = self.inner.owner.upgrade() {
            IoInner::multiplex_closed(&owner, self.inner.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;

    fn pipe_fds() -> (RawFd, RawFd) {
        unistd::pipe().unwrap()
    }

    #[test]
    fn armed_interest_is_union_of_multiplexes() {
        let lp = EventLoop::new().unwrap();
        let (r, w) = pipe_fds();

        let io = lp.io(r, EventMask::empty());
        let a = io.multiplex(EventMask::READ);
        let b = io.multiplex(EventMask::WRITE);
        assert_eq!(io.events(), EventMask::READ | EventMask::WRITE);

        a.start(|| {}).unwrap();
        let token = io.inner.core.token();
        assert_eq!(
            lp.poll_interest(token),
            Some((EventMask::READ | EventMask::WRITE).bits())
        );

        b.close();
        assert_eq!(io.events(), EventMask::READ);
        assert_eq!(lp.poll_interest(token), Some(EventMask::READ.bits()));

        a.close();
        assert_eq!(io.state(), WatcherState::Closed);
        // The close request went out synchronously with the last close call.
        assert_eq!(lp.raw_is_closing(token), 1);

        lp.run_once(0).unwrap();
        let _ = unistd::close(r);
        let _ = unistd::close(w);
    }

    #[test]
    fn closing_unknown_multiplex_twice_is_harmless() {
        let lp = EventLoop::new().unwrap();
        let (r, w) = pipe_fds();
        let io = lp.io(r, EventMask::empty());
        let a = io.multiplex(EventMask::READ);
        a.close();
        a.close();
        assert!(!a.active());
        assert!(a.start(|| {}).is_err());
        let _ = unistd::close(r);
        let _ = unistd::close(w);
    }

    #[test]
    fn stopping_last_multiplex_keeps_handle_for_restart() {
        let lp = EventLoop::new().unwrap();
        let (r, w) = pipe_fds();
        let io = lp.io(r, EventMask::empty());
        let a = io.multiplex(EventMask::READ);

        a.start(|| {}).unwrap();
        assert_eq!(io.state(), WatcherState::Active);
        a.stop().unwrap();
        assert_eq!(io.state(), WatcherState::Stopped);
        a.start(|| {}).unwrap();
        assert_eq!(io.state(), WatcherState::Active);

        a.close();
        lp.run_once(0).unwrap();
        let _ = unistd::close(r);
        let _ = unistd::close(w);
    }
}
