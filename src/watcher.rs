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

//! Watcher base: the state machine every watcher kind shares

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::events::{EventLoop, HandleKind, InitArg, RawDispatch, StartArgs};
use crate::lifecycle::{native_call, NativeHandle};
use crate::{Error, Result};

/// Lifecycle state of a watcher.
///
/// `Uninitialized → Stopped → Active → Stopped → … → Closed`; `Closed` is
/// terminal and reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// No native handle has been initialized yet.
    Uninitialized,
    /// Handle is live but not armed.
    Stopped,
    /// Handle is armed and may dispatch.
    Active,
    /// Close was requested; the watcher is spent.
    Closed,
}

/// Capability set common to every watcher kind. Starting is kind-specific
/// and lives on the concrete types.
pub trait Watcher {
    /// Current lifecycle state.
    fn state(&self) -> WatcherState;

    /// Whether the watcher is armed.
    fn active(&self) -> bool {
        self.state() == WatcherState::Active
    }

    /// Disarm without releasing the native handle. No-op unless active.
    fn stop(&self) -> Result<()>;

    /// Stop if needed, then request the deferred native close. Idempotent.
    fn close(&self);

    /// Whether this watcher counts toward keeping the loop alive.
    fn has_ref(&self) -> bool;

    /// Toggle loop-liveness accounting. Harmless on a watcher that was
    /// never started; the setting is applied once the handle exists.
    fn set_ref(&self, on: bool);
}

/// State shared by all watcher kinds: the loop, the handle and the
/// ref/state bookkeeping. Kind modules wrap this in their inner type and
/// implement [`RawDispatch`] next to it.
pub(crate) struct WatcherCore {
    lp: Rc<EventLoop>,
    handle: Rc<NativeHandle>,
    state: Cell<WatcherState>,
    want_ref: Cell<bool>,
}

impl WatcherCore {
    pub(crate) fn new(lp: Rc<EventLoop>, kind: HandleKind, want_ref: bool) -> WatcherCore {
        WatcherCore {
            lp,
            handle: NativeHandle::alloc(kind),
            state: Cell::new(WatcherState::Uninitialized),
            want_ref: Cell::new(want_ref),
        }
    }

    pub(crate) fn event_loop(&self) -> &Rc<EventLoop> {
        &self.lp
    }

    pub(crate) fn state(&self) -> WatcherState {
        self.state.get()
    }

    pub(crate) fn token(&self) -> u64 {
        self.handle.token()
    }

    /// Lazily initialize the native handle on first use. Errors with
    /// `UseAfterClose` on a closed watcher and `NativeInit` when the loop
    /// rejects the handle.
    pub(crate) fn ensure_init(
        &self,
        dispatch: Weak<dyn RawDispatch>,
        arg: InitArg,
    ) -> Result<()> {
        if self.state.get() == WatcherState::Closed {
            return Err(Error::UseAfterClose {
                what: "watcher handle",
            });
        }
        if self.handle.token() == 0 {
            self.handle.initialize(&self.lp, dispatch, arg)?;
            self.state.set(WatcherState::Stopped);
            if !self.want_ref.get() {
                let _ = native_call!(self.lp, raw_unref(self.handle.token()));
            }
        }
        Ok(())
    }

    pub(crate) fn arm(&self, args: StartArgs) -> Result<()> {
        native_call!(self.lp, raw_start(self.handle.token(), args))?;
        self.state.set(WatcherState::Active);
        Ok(())
    }

    pub(crate) fn do_stop(&self) -> Result<()> {
        if self.state.get() != WatcherState::Active {
            return Ok(());
        }
        native_call!(self.lp, raw_stop(self.handle.token()))?;
        self.state.set(WatcherState::Stopped);
        Ok(())
    }

    /// Record that the native layer already disarmed this handle (one-shot
    /// timers) without issuing another stop.
    pub(crate) fn mark_stopped(&self) {
        if self.state.get() == WatcherState::Active {
            self.state.set(WatcherState::Stopped);
        }
    }

    pub(crate) fn do_close(&self) {
        if self.state.get() == WatcherState::Closed {
            return;
        }
        if self.state.get() == WatcherState::Active {
            if let Err(e) = self.do_stop() {
                log::warn!("Failed to stop watcher while closing: {}", e);
            }
        }
        NativeHandle::request_close(&self.handle, &self.lp);
        self.state.set(WatcherState::Closed);
    }

    pub(crate) fn has_ref(&self) -> bool {
        let token = self.handle.token();
        if token == 0 || self.state.get() == WatcherState::Closed {
            return self.want_ref.get();
        }
        self.lp.raw_has_ref(token) > 0
    }

    pub(crate) fn set_ref(&self, on: bool) {
        self.want_ref.set(on);
        let token = self.handle.token();
        if token != 0 && self.state.get() != WatcherState::Closed {
            let _ = if on {
                native_call!(self.lp, raw_ref(token))
            } else {
                native_call!(self.lp, raw_unref(token))
            };
        }
    }

    /// Trampoline guard: dispatch only reaches the callback while the
    /// watcher is still active on this tick.
    pub(crate) fn dispatchable(&self) -> bool {
        self.state.get() == WatcherState::Active
    }
}

/// Run a stored callback with the slot temporarily emptied, so the callback
/// may stop, close or restart its own watcher. The callback is put back only
/// if the watcher is still active and nothing replaced it meanwhile.
pub(crate) fn invoke_restoring<T: ?Sized>(
    core: &WatcherCore,
    slot: &RefCell<Option<Box<T>>>,
    call: impl FnOnce(&mut Box<T>),
) {
    let taken = slot.borrow_mut().take();
    if let Some(mut cb) = taken {
        call(&mut cb);
        if core.state() == WatcherState::Active && slot.borrow().is_none() {
            *slot.borrow_mut() = Some(cb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl RawDispatch for Noop {
        fn raw_dispatch(&self, _status: i32, _datum: u32) {}
    }

    #[test]
    fn unref_before_start_is_recorded() {
        let lp = EventLoop::new().unwrap();
        let core = WatcherCore::new(lp, HandleKind::Timer, true);
        core.set_ref(false);
        assert_eq!(core.state(), WatcherState::Uninitialized);
        assert!(!core.has_ref());
    }

    #[test]
    fn stop_before_start_is_noop() {
        let lp = EventLoop::new().unwrap();
        let core = WatcherCore::new(lp, HandleKind::Timer, true);
        core.do_stop().unwrap();
        assert_eq!(core.state(), WatcherState::Uninitialized);
    }

    #[test]
    fn close_is_idempotent() {
        let lp = EventLoop::new().unwrap();
        let core = WatcherCore::new(lp, HandleKind::Timer, true);
        core.do_close();
        core.do_close();
        assert_eq!(core.state(), WatcherState::Closed);
        let dead: Weak<Noop> = Weak::new();
        assert!(matches!(
            core.ensure_init(dead, InitArg::None),
            Err(Error::UseAfterClose { .. })
        ));
    }
}
