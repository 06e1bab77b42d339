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

//! Path metadata watcher
//!
//! Re-stats a path at a fixed interval and dispatches when the metadata
//! changed. The interval has a floor of roughly 107 ms; anything shorter
//! only burns stat calls without observing more.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::time::Duration;

use nix::sys::stat::FileStat;

use crate::clock;
use crate::events::{EventLoop, HandleKind, InitArg, RawDispatch, StartArgs};
use crate::watcher::{invoke_restoring, Watcher, WatcherCore, WatcherState};
use crate::Result;

/// Smallest polling interval, in microseconds.
const MIN_STAT_INTERVAL: u64 = 107_489;

pub(crate) struct StatInner {
    core: WatcherCore,
    path: PathBuf,
    interval: Cell<u64>,
    cb: RefCell<Option<Box<dyn FnMut()>>>,
}

impl RawDispatch for StatInner {
    fn raw_dispatch(&self, _status: i32, _datum: u32) {
        if !self.core.dispatchable() {
            return;
        }
        invoke_restoring(&self.core, &self.cb, |cb| cb());
    }
}

/// Watcher dispatching when a path's metadata changes between polls. The
/// callback reads the [`previous`](StatWatcher::previous) and
/// [`current`](StatWatcher::current) snapshots.
#[derive(Clone)]
pub struct StatWatcher {
    inner: Rc<StatInner>,
}

impl StatWatcher {
    pub(crate) fn new(lp: Rc<EventLoop>, path: PathBuf, interval: Duration) -> StatWatcher {
        let mut interval = clock::duration_usec(interval);
        if interval < MIN_STAT_INTERVAL {
            interval = MIN_STAT_INTERVAL;
        }
        StatWatcher {
            inner: Rc::new(StatInner {
                core: WatcherCore::new(lp, HandleKind::FsPoll, true),
                path,
                interval: Cell::new(interval),
                cb: RefCell::new(None),
            }),
        }
    }

    /// The watched path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The effective polling interval after clamping.
    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.inner.interval.get())
    }

    /// Take an initial snapshot and start polling.
    pub fn start(&self, cb: impl FnMut() + 'static) -> Result<()> {
        if self.inner.core.state() == WatcherState::Active {
            *self.inner.cb.borrow_mut() = Some(Box::new(cb));
            return Ok(());
        }
        let dispatch: Weak<StatInner> = Rc::downgrade(&self.inner);
        self.inner
            .core
            .ensure_init(dispatch, InitArg::Path(self.inner.path.clone()))?;
        *self.inner.cb.borrow_mut() = Some(Box::new(cb));
        self.inner.core.arm(StartArgs::FsPoll {
            interval: self.inner.interval.get(),
        })
    }

    /// Metadata before the last observed change. `None` when the entity did
    /// not exist or had a zero link count.
    pub fn previous(&self) -> Option<FileStat> {
        self.snapshot(|prev, _| prev)
    }

    /// Metadata from the latest poll, with the same `None` convention.
    pub fn current(&self) -> Option<FileStat> {
        self.snapshot(|_, curr| curr)
    }

    fn snapshot(
        &self,
        pick: fn(Option<FileStat>, Option<FileStat>) -> Option<FileStat>,
    ) -> Option<FileStat> {
        let token = self.inner.core.token();
        let (prev, curr) = self.inner.core.event_loop().fs_poll_view(token)?;
        pick(prev, curr).filter(|st| st.st_nlink != 0)
    }
}

impl Watcher for StatWatcher {
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
