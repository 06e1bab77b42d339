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

//! Deferred-close protocol for native handles
//!
//! Closing a handle is asynchronous: the loop disarms it immediately but
//! acknowledges the close on a later tick. Between the request and the
//! acknowledgment the handle object is parked in a thread-local closing set
//! so it cannot be reclaimed while the loop still refers to its slot. The
//! acknowledgment callback is the only thing that removes it.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::events::{EventLoop, HandleKind, InitArg, RawDispatch};
use crate::{Error, Result};

/// Wraps a raw loop entry point: a negative status becomes
/// [`Error::Native`](crate::Error) carrying the call name and the decoded
/// errno text.
macro_rules! native_call {
    ($lp:expr, $op:ident ( $($arg:expr),* $(,)? ) ) => {{
        let ret = $lp.$op($($arg),*);
        if ret < 0 {
            Err($crate::Error::Native {
                op: stringify!($op),
                ret,
                msg: $crate::events::status_msg(ret),
            })
        } else {
            Ok(ret)
        }
    }};
}

pub(crate) use native_call;

thread_local! {
    static CLOSING_HANDLES: RefCell<HashMap<u64, Rc<NativeHandle>>> =
        RefCell::new(HashMap::new());
}

fn close_acknowledged(token: u64) {
    CLOSING_HANDLES.with(|set| set.borrow_mut().remove(&token));
}

#[cfg(test)]
pub(crate) fn closing_len() -> usize {
    CLOSING_HANDLES.with(|set| set.borrow().len())
}

/// One native handle slot, from allocation to acknowledged close.
///
/// Token 0 means the handle was never initialized; closing such a handle at
/// the native layer is fatal, so `request_close` refuses to forward it.
pub(crate) struct NativeHandle {
    kind: HandleKind,
    token: Cell<u64>,
}

impl NativeHandle {
    /// Reserve a handle of the requested kind. Nothing is registered with
    /// the loop yet.
    pub(crate) fn alloc(kind: HandleKind) -> Rc<NativeHandle> {
        Rc::new(NativeHandle {
            kind,
            token: Cell::new(0),
        })
    }

    pub(crate) fn token(&self) -> u64 {
        self.token.get()
    }

    /// Register with the loop. Fails with `NativeInit` when the loop rejects
    /// the kind or its arguments; the handle then stays unallocated.
    pub(crate) fn initialize(
        &self,
        lp: &EventLoop,
        dispatch: std::rc::Weak<dyn RawDispatch>,
        arg: InitArg,
    ) -> Result<()> {
        debug_assert_eq!(self.token.get(), 0);
        let ret = lp.raw_init(self.kind, dispatch, arg);
        if ret < 0 {
            return Err(Error::NativeInit {
                op: "raw_init",
                ret: ret as i32,
                msg: crate::events::status_msg(ret as i32),
            });
        }
        self.token.set(ret as u64);
        Ok(())
    }

    /// Idempotent close request. The slot is disarmed before this returns;
    /// the handle is parked in the closing set until the loop acknowledges.
    /// At most one native close is ever issued per handle.
    pub(crate) fn request_close(this: &Rc<NativeHandle>, lp: &EventLoop) {
        let token = this.token.get();
        if token == 0 {
            return;
        }
        let already = CLOSING_HANDLES.with(|set| set.borrow().contains_key(&token));
        if already || lp.raw_is_closing(token) > 0 {
            return;
        }

        CLOSING_HANDLES.with(|set| set.borrow_mut().insert(token, Rc::clone(this)));
        let ret = lp.raw_close(token, close_acknowledged);
        if ret < 0 {
            // Cleanup is best-effort, but the set entry must never leak.
            close_acknowledged(token);
            log::warn!(
                "Failed to close {:?} handle: {}",
                this.kind,
                crate::events::status_msg(ret)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StartArgs;

    struct Noop;

    impl RawDispatch for Noop {
        fn raw_dispatch(&self, _status: i32, _datum: u32) {}
    }

    #[test]
    fn close_before_init_is_noop() {
        let handle = NativeHandle::alloc(HandleKind::Idle);
        let lp = EventLoop::new().unwrap();
        NativeHandle::request_close(&handle, &lp);
        assert_eq!(closing_len(), 0);
    }

    #[test]
    fn double_close_issues_one_native_close() {
        let lp = EventLoop::new().unwrap();
        let target = Rc::new(Noop);
        let dispatch: std::rc::Weak<Noop> = Rc::downgrade(&target);

        let handle = NativeHandle::alloc(HandleKind::Idle);
        handle.initialize(&lp, dispatch, InitArg::None).unwrap();
        let token = handle.token();
        assert!(token != 0);
        assert_eq!(lp.raw_start(token, StartArgs::None), 0);

        NativeHandle::request_close(&handle, &lp);
        assert_eq!(closing_len(), 1);
        assert_eq!(lp.raw_is_closing(token), 1);

        NativeHandle::request_close(&handle, &lp);
        assert_eq!(closing_len(), 1);

        // The acknowledgment on the next tick empties the set.
        lp.run_once(0).unwrap();
        assert_eq!(closing_len(), 0);
    }
}
