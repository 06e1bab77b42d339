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

//! The host event loop behind the watcher layer
//!
//! Handles live in token-keyed slots; tokens grow monotonically and are
//! never reused, so a stale token can always be told apart from a new
//! handle even when the OS has already handed the same descriptor number to
//! someone else. The raw entry points mirror a C event-loop surface: they
//! return `0` on success and a negative errno on failure, and the watcher
//! layer only reaches them through the `native_call!` wrapper and the
//! handle lifecycle.
//!
//! Tick order: due timers, idle, prepare, poll, due timers again, check,
//! close acknowledgments.

use std::cell::RefCell;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::signalfd::{SfdFlags, SigSet, SignalFd};
use nix::sys::stat::FileStat;
use snafu::ResultExt;

use crate::clock;
use crate::error::NixSnafu;
use crate::io::{EventMask, IoWatcher};
use crate::phase::{CheckWatcher, IdleWatcher, PrepareWatcher};
use crate::poll::Poll;
use crate::process::{ChildInner, ChildWatcher, ForkInner, ForkWatcher};
use crate::signal::SignalWatcher;
use crate::stat::StatWatcher;
use crate::timer::TimerWatcher;
use crate::wakeup::{AsyncShared, AsyncWatcher, WakeupFd};
use crate::Result;

/// Reserved epoll tokens for the loop's own descriptors.
const WAKE_TOKEN: u64 = 1;
const SIGNAL_TOKEN: u64 = 2;
const FIRST_TOKEN: u64 = 16;

const ACTIVE: u8 = 1 << 0;
const REF: u8 = 1 << 1;
const CLOSING: u8 = 1 << 2;

/// Native handle kinds the loop can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum HandleKind {
    /// Descriptor readiness.
    Poll,
    /// Relative timeout, optionally repeating.
    Timer,
    /// Signal delivery through the loop's signalfd.
    Signal,
    /// Cross-thread wakeup.
    Async,
    /// Runs every tick before polling; forces a zero poll timeout.
    Idle,
    /// Runs every tick right before polling.
    Prepare,
    /// Runs every tick after polling.
    Check,
    /// Interval-driven re-stat of a path.
    FsPoll,
}

/// Kind-specific initialization argument.
pub(crate) enum InitArg {
    None,
    Fd(RawFd),
    Path(PathBuf),
}

/// Kind-specific arming arguments, all times in microseconds.
pub(crate) enum StartArgs {
    None,
    Poll { events: u32 },
    Timer { after: u64, repeat: u64 },
    TimerAgain,
    Signal { signum: i32 },
    FsPoll { interval: u64 },
}

/// Dispatch target stored per slot. The loop holds it weakly: watcher
/// lifetime is controlled by the application and the closing set, never by
/// the loop's bookkeeping.
pub(crate) trait RawDispatch {
    fn raw_dispatch(&self, status: i32, datum: u32);
}

/// Decode a negative status into the errno text.
pub(crate) fn status_msg(ret: i32) -> String {
    nix::errno::Errno::from_i32(-ret).desc().to_string()
}

enum SlotData {
    Poll {
        fd: RawFd,
        interest: u32,
    },
    Timer {
        repeat: u64,
        gen: u64,
    },
    Signal {
        signum: i32,
    },
    Async {
        shared: Arc<AsyncShared>,
    },
    Idle,
    Prepare,
    Check,
    FsPoll {
        path: PathBuf,
        interval: u64,
        gen: u64,
        prev: Option<FileStat>,
        curr: Option<FileStat>,
    },
}

struct Slot {
    kind: HandleKind,
    flags: u8,
    dispatch: Weak<dyn RawDispatch>,
    data: SlotData,
}

struct TimerEntry {
    due: u64,
    gen: u64,
    token: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).reverse()
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for TimerEntry {}

struct Target {
    token: u64,
    dispatch: Weak<dyn RawDispatch>,
    status: i32,
    datum: u32,
    require_active: bool,
}

/// The host event loop. Single-threaded; the only cross-thread entry is the
/// wakeup eventfd behind the async watchers.
pub struct EventLoop {
    me: Weak<EventLoop>,
    data: RefCell<LoopData>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventLoop { .. }")
    }
}

struct LoopData {
    poller: Poll,
    slots: HashMap<u64, Slot>,
    next_token: u64,
    timers: BinaryHeap<TimerEntry>,
    closing: Vec<(u64, fn(u64))>,
    signalfd: SignalFd,
    wake: Arc<WakeupFd>,
    stop_flag: bool,
    now: u64,
    fork_observers: Vec<Weak<ForkInner>>,
    child_observers: Vec<Weak<ChildInner>>,
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Acknowledge whatever is still queued so the closing set drains.
        self.finish_closing();
        self.data.borrow_mut().slots.clear();
    }
}

impl EventLoop {
    /// Create a loop with its poller, wakeup descriptor and (empty-masked)
    /// signalfd armed.
    pub fn new() -> Result<Rc<EventLoop>> {
        let mut poller = Poll::new()?;

        let wake = Arc::new(WakeupFd::new()?);
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        poller.register(wake.as_raw_fd(), &mut event)?;

        let signalfd = SignalFd::with_flags(
            &SigSet::empty(),
            SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC,
        )
        .context(NixSnafu)?;
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: SIGNAL_TOKEN,
        };
        poller.register(signalfd.as_raw_fd(), &mut event)?;

        Ok(Rc::new_cyclic(|me| EventLoop {
            me: me.clone(),
            data: RefCell::new(LoopData {
                poller,
                slots: HashMap::new(),
                next_token: FIRST_TOKEN,
                timers: BinaryHeap::new(),
                closing: Vec::new(),
                signalfd,
                wake,
                stop_flag: false,
                now: clock::now_usec(),
                fork_observers: Vec::new(),
                child_observers: Vec::new(),
            }),
        }))
    }

    // Always resolvable while a caller holds `&self`.
    fn me(&self) -> Rc<EventLoop> {
        self.me.upgrade().expect("event loop self reference")
    }

    // ---- watcher factories -------------------------------------------------

    /// Readiness watcher for one descriptor.
    pub fn io(&self, fd: RawFd, events: EventMask) -> IoWatcher {
        IoWatcher::new(self.me(), fd, events)
    }

    /// Timer watcher. Non-zero durations below one millisecond are clamped
    /// up to one millisecond; a zero `after` with zero `repeat` fires on the
    /// next loop iteration instead of using a native timeout.
    pub fn timer(&self, after: Duration, repeat: Duration) -> TimerWatcher {
        TimerWatcher::new(self.me(), after, repeat)
    }

    /// Signal watcher. Created unreffed: signal watchers alone do not keep
    /// the loop alive.
    pub fn signal(&self, signal: Signal) -> SignalWatcher {
        SignalWatcher::new(self.me(), signal)
    }

    /// Idle watcher: runs every iteration and keeps the loop from blocking.
    pub fn idle(&self) -> IdleWatcher {
        IdleWatcher::new(self.me())
    }

    /// Check watcher: runs every iteration after polling.
    pub fn check(&self) -> CheckWatcher {
        CheckWatcher::new(self.me())
    }

    /// Prepare watcher: runs every iteration right before polling.
    pub fn prepare(&self) -> PrepareWatcher {
        PrepareWatcher::new(self.me())
    }

    /// Path watcher polling metadata at the given interval.
    pub fn stat(&self, path: impl Into<PathBuf>, interval: Duration) -> StatWatcher {
        StatWatcher::new(self.me(), path.into(), interval)
    }

    /// Cross-thread wakeup watcher.
    pub fn wakeup(&self) -> AsyncWatcher {
        AsyncWatcher::new(self.me())
    }

    /// Fork watcher, synthesized from a wakeup watcher.
    pub fn fork_watcher(&self) -> ForkWatcher {
        ForkWatcher::new(self.me())
    }

    /// Child-exit watcher for `pid` (0 watches any child), synthesized from
    /// a wakeup watcher.
    pub fn child(&self, pid: libc::pid_t) -> ChildWatcher {
        ChildWatcher::new(self.me(), pid)
    }

    // ---- running -----------------------------------------------------------

    /// One tick: run due timers and phases, poll for at most `timeout`
    /// milliseconds (-1 blocks), dispatch, acknowledge closes. Returns
    /// whether the loop still has reffed active work.
    pub fn run_once(&self, timeout: i32) -> Result<bool> {
        let fired = self.expire_timers();
        self.deliver(fired);

        self.run_phase(HandleKind::Idle);
        self.run_phase(HandleKind::Prepare);

        let wait = self.data.borrow().poll_timeout(timeout);
        let events = { self.data.borrow().poller.poll(wait)? };
        let ready = self.collect_ready(&events);
        self.deliver(ready);

        let fired = self.expire_timers();
        self.deliver(fired);

        self.run_phase(HandleKind::Check);

        self.finish_closing();
        Ok(self.alive())
    }

    /// Run until no reffed active watcher remains or [`stop`](Self::stop)
    /// is called.
    pub fn run(&self) -> Result<()> {
        while !self.data.borrow().stop_flag && self.alive() {
            self.run_once(-1)?;
        }
        self.data.borrow_mut().stop_flag = false;
        Ok(())
    }

    /// Make `run` return after the current tick.
    pub fn stop(&self) {
        self.data.borrow_mut().stop_flag = true;
        let wake = self.data.borrow().wake.clone();
        wake.notify();
    }

    /// Whether any reffed watcher is armed or a close is still pending.
    pub fn alive(&self) -> bool {
        let d = self.data.borrow();
        !d.closing.is_empty()
            || d.slots
                .values()
                .any(|s| s.flags & (ACTIVE | REF) == (ACTIVE | REF))
    }

    // ---- simulated-watcher observer lists ---------------------------------

    pub(crate) fn register_fork_observer(&self, observer: &Rc<ForkInner>) {
        let mut d = self.data.borrow_mut();
        let ptr = Rc::as_ptr(observer);
        if !d.fork_observers.iter().any(|w| w.as_ptr() == ptr) {
            d.fork_observers.push(Rc::downgrade(observer));
        }
    }

    pub(crate) fn unregister_fork_observer(&self, observer: &Rc<ForkInner>) {
        let ptr = Rc::as_ptr(observer);
        self.data
            .borrow_mut()
            .fork_observers
            .retain(|w| w.as_ptr() != ptr);
    }

    pub(crate) fn register_child_observer(&self, observer: &Rc<ChildInner>) {
        let mut d = self.data.borrow_mut();
        let ptr = Rc::as_ptr(observer);
        if !d.child_observers.iter().any(|w| w.as_ptr() == ptr) {
            d.child_observers.push(Rc::downgrade(observer));
        }
    }

    pub(crate) fn unregister_child_observer(&self, observer: &Rc<ChildInner>) {
        let ptr = Rc::as_ptr(observer);
        self.data
            .borrow_mut()
            .child_observers
            .retain(|w| w.as_ptr() != ptr);
    }

    /// Post-fork hook: flag every registered fork watcher; their callbacks
    /// run on the next tick.
    pub fn notify_fork(&self) {
        let observers: Vec<Rc<ForkInner>> = self
            .data
            .borrow()
            .fork_observers
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            observer.deliver();
        }
    }

    /// Route a reaped child status to the watchers registered for that pid.
    pub fn notify_child(&self, pid: libc::pid_t, status: i32) {
        let observers: Vec<Rc<ChildInner>> = self
            .data
            .borrow()
            .child_observers
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            observer.deliver_status(pid, status);
        }
    }

    // ---- raw entry points --------------------------------------------------
    //
    // Negative errno on failure; the watcher layer wraps every call.

    pub(crate) fn raw_init(
        &self,
        kind: HandleKind,
        dispatch: Weak<dyn RawDispatch>,
        arg: InitArg,
    ) -> i64 {
        let mut d = self.data.borrow_mut();
        let data = match (kind, arg) {
            (HandleKind::Poll, InitArg::Fd(fd)) => {
                if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
                    return -(unsafe { *libc::__errno_location() } as i64);
                }
                SlotData::Poll { fd, interest: 0 }
            }
            (HandleKind::Timer, InitArg::None) => SlotData::Timer { repeat: 0, gen: 0 },
            (HandleKind::Signal, InitArg::None) => SlotData::Signal { signum: 0 },
            (HandleKind::Async, InitArg::None) => SlotData::Async {
                shared: Arc::new(AsyncShared::new(d.wake.clone())),
            },
            (HandleKind::Idle, InitArg::None) => SlotData::Idle,
            (HandleKind::Prepare, InitArg::None) => SlotData::Prepare,
            (HandleKind::Check, InitArg::None) => SlotData::Check,
            (HandleKind::FsPoll, InitArg::Path(path)) => SlotData::FsPoll {
                path,
                interval: 0,
                gen: 0,
                prev: None,
                curr: None,
            },
            _ => return -(libc::EINVAL as i64),
        };

        let token = d.next_token;
        d.next_token += 1;
        d.slots.insert(
            token,
            Slot {
                kind,
                flags: REF,
                dispatch,
                data,
            },
        );
        token as i64
    }

    pub(crate) fn raw_start(&self, token: u64, args: StartArgs) -> i32 {
        let mut d = self.data.borrow_mut();
        let LoopData {
            ref mut poller,
            ref mut slots,
            ref mut timers,
            ref mut signalfd,
            ..
        } = *d;

        let slot = match slots.get_mut(&token) {
            Some(slot) => slot,
            None => return -libc::ENOENT,
        };
        if slot.flags & CLOSING != 0 {
            return -libc::EINVAL;
        }

        let mut signal_armed = false;
        match (&mut slot.data, args) {
            (SlotData::Poll { fd, interest }, StartArgs::Poll { events }) => {
                let fd = *fd;
                let mut event = libc::epoll_event {
                    events: epoll_interest(events),
                    u64: token,
                };
                let res = if slot.flags & ACTIVE != 0 {
                    poller.reregister(fd, &mut event)
                } else {
                    poller.register(fd, &mut event)
                };
                if let Err(e) = res {
                    return match e {
                        crate::Error::Syscall { errno, .. } => -errno,
                        _ => -libc::EINVAL,
                    };
                }
                *interest = events;
                slot.flags |= ACTIVE;
            }
            (SlotData::Timer { repeat, gen }, StartArgs::Timer { after, repeat: rep }) => {
                *gen += 1;
                *repeat = rep;
                timers.push(TimerEntry {
                    due: clock::now_usec().saturating_add(after),
                    gen: *gen,
                    token,
                });
                slot.flags |= ACTIVE;
            }
            (SlotData::Timer { repeat, gen }, StartArgs::TimerAgain) => {
                *gen += 1;
                if *repeat == 0 {
                    slot.flags &= !ACTIVE;
                } else {
                    timers.push(TimerEntry {
                        due: clock::now_usec().saturating_add(*repeat),
                        gen: *gen,
                        token,
                    });
                    slot.flags |= ACTIVE;
                }
            }
            (SlotData::Signal { signum }, StartArgs::Signal { signum: sig }) => {
                *signum = sig;
                slot.flags |= ACTIVE;
                signal_armed = true;
            }
            (SlotData::Async { .. }, StartArgs::None)
            | (SlotData::Idle, StartArgs::None)
            | (SlotData::Prepare, StartArgs::None)
            | (SlotData::Check, StartArgs::None) => {
                slot.flags |= ACTIVE;
            }
            (
                SlotData::FsPoll {
                    path,
                    interval,
                    gen,
                    prev,
                    curr,
                },
                StartArgs::FsPoll { interval: iv },
            ) => {
                *interval = iv;
                *gen += 1;
                *prev = None;
                *curr = stat_snapshot(path);
                timers.push(TimerEntry {
                    due: clock::now_usec().saturating_add(iv),
                    gen: *gen,
                    token,
                });
                slot.flags |= ACTIVE;
            }
            _ => return -libc::EINVAL,
        }

        if signal_armed {
            let ret = apply_sigmask(slots, signalfd);
            if ret < 0 {
                // Roll back so a failed mask update does not leave the slot
                // half-armed.
                if let Some(slot) = slots.get_mut(&token) {
                    slot.flags &= !ACTIVE;
                }
                return ret;
            }
        }

        0
    }

    pub(crate) fn raw_stop(&self, token: u64) -> i32 {
        let mut d = self.data.borrow_mut();
        let LoopData {
            ref mut poller,
            ref mut slots,
            ref mut signalfd,
            ..
        } = *d;

        let slot = match slots.get_mut(&token) {
            Some(slot) => slot,
            None => return -libc::ENOENT,
        };
        if slot.flags & ACTIVE == 0 {
            return 0;
        }
        slot.flags &= !ACTIVE;

        let mut signal_disarmed = false;
        match &mut slot.data {
            SlotData::Poll { fd, .. } => {
                // The descriptor may already be gone; epoll then dropped the
                // registration on its own.
                let fd = *fd;
                if let Err(e) = poller.unregister(fd) {
                    log::debug!("Failed to unregister fd {}: {}", fd, e);
                }
            }
            SlotData::Timer { gen, .. } => *gen += 1,
            SlotData::FsPoll { gen, .. } => *gen += 1,
            SlotData::Signal { .. } => signal_disarmed = true,
            _ => {}
        }

        if signal_disarmed {
            let ret = apply_sigmask(slots, signalfd);
            if ret < 0 {
                log::warn!("Failed to shrink signal mask: {}", status_msg(ret));
            }
        }

        0
    }

    /// Disarm synchronously and queue the acknowledgment. Pending events for
    /// the slot die here, before this call returns, which is what makes
    /// immediate descriptor reuse safe.
    pub(crate) fn raw_close(&self, token: u64, ack: fn(u64)) -> i32 {
        {
            let d = self.data.borrow();
            match d.slots.get(&token) {
                None => return -libc::ENOENT,
                Some(slot) if slot.flags & CLOSING != 0 => return 0,
                Some(_) => {}
            }
        }

        let ret = self.raw_stop(token);
        if ret < 0 {
            return ret;
        }

        let mut d = self.data.borrow_mut();
        let slot = match d.slots.get_mut(&token) {
            Some(slot) => slot,
            None => return -libc::ENOENT,
        };
        slot.flags |= CLOSING;
        if let SlotData::Async { shared } = &slot.data {
            shared.mark_closed();
        }
        d.closing.push((token, ack));
        0
    }

    pub(crate) fn raw_ref(&self, token: u64) -> i32 {
        match self.data.borrow_mut().slots.get_mut(&token) {
            Some(slot) => {
                slot.flags |= REF;
                0
            }
            None => -libc::ENOENT,
        }
    }

    pub(crate) fn raw_unref(&self, token: u64) -> i32 {
        match self.data.borrow_mut().slots.get_mut(&token) {
            Some(slot) => {
                slot.flags &= !REF;
                0
            }
            None => -libc::ENOENT,
        }
    }

    pub(crate) fn raw_has_ref(&self, token: u64) -> i32 {
        match self.data.borrow().slots.get(&token) {
            Some(slot) => i32::from(slot.flags & REF != 0),
            None => -libc::ENOENT,
        }
    }

    pub(crate) fn raw_is_closing(&self, token: u64) -> i32 {
        match self.data.borrow().slots.get(&token) {
            Some(slot) => i32::from(slot.flags & CLOSING != 0),
            None => -libc::ENOENT,
        }
    }

    // ---- slot views for the watcher layer ---------------------------------

    pub(crate) fn async_shared(&self, token: u64) -> Option<Arc<AsyncShared>> {
        match self.data.borrow().slots.get(&token) {
            Some(Slot {
                data: SlotData::Async { shared },
                ..
            }) => Some(shared.clone()),
            _ => None,
        }
    }

    pub(crate) fn fs_poll_view(&self, token: u64) -> Option<(Option<FileStat>, Option<FileStat>)> {
        match self.data.borrow().slots.get(&token) {
            Some(Slot {
                data: SlotData::FsPoll { prev, curr, .. },
                ..
            }) => Some((*prev, *curr)),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn poll_interest(&self, token: u64) -> Option<u32> {
        match self.data.borrow().slots.get(&token) {
            Some(Slot {
                data: SlotData::Poll { interest, .. },
                flags,
                ..
            }) if flags & ACTIVE != 0 => Some(*interest),
            _ => None,
        }
    }

    // ---- tick internals ----------------------------------------------------

    fn expire_timers(&self) -> Vec<Target> {
        let mut d = self.data.borrow_mut();
        d.now = clock::now_usec();
        let LoopData {
            ref mut slots,
            ref mut timers,
            now,
            ..
        } = *d;

        let mut out = Vec::new();
        while let Some(top) = timers.peek() {
            if top.due > now {
                break;
            }
            let entry = timers.pop().unwrap();
            let slot = match slots.get_mut(&entry.token) {
                Some(slot) => slot,
                None => continue,
            };
            if slot.flags & ACTIVE == 0 || slot.flags & CLOSING != 0 {
                continue;
            }
            match &mut slot.data {
                SlotData::Timer { repeat, gen } => {
                    if *gen != entry.gen {
                        continue;
                    }
                    if *repeat > 0 {
                        timers.push(TimerEntry {
                            due: now.saturating_add(*repeat),
                            gen: *gen,
                            token: entry.token,
                        });
                    } else {
                        slot.flags &= !ACTIVE;
                    }
                    out.push(Target {
                        token: entry.token,
                        dispatch: slot.dispatch.clone(),
                        status: 0,
                        datum: 0,
                        require_active: false,
                    });
                }
                SlotData::FsPoll {
                    path,
                    interval,
                    gen,
                    prev,
                    curr,
                } => {
                    if *gen != entry.gen {
                        continue;
                    }
                    let fresh = stat_snapshot(path);
                    let changed = snapshots_differ(curr, &fresh);
                    if changed {
                        *prev = curr.take();
                        *curr = fresh;
                    }
                    timers.push(TimerEntry {
                        due: now.saturating_add(*interval),
                        gen: *gen,
                        token: entry.token,
                    });
                    if changed {
                        out.push(Target {
                            token: entry.token,
                            dispatch: slot.dispatch.clone(),
                            status: 0,
                            datum: 0,
                            require_active: true,
                        });
                    }
                }
                _ => {}
            }
        }
        out
    }

    fn run_phase(&self, kind: HandleKind) {
        let targets: Vec<Target> = {
            let d = self.data.borrow();
            d.slots
                .iter()
                .filter(|(_, s)| {
                    s.kind == kind && s.flags & ACTIVE != 0 && s.flags & CLOSING == 0
                })
                .map(|(token, s)| Target {
                    token: *token,
                    dispatch: s.dispatch.clone(),
                    status: 0,
                    datum: 0,
                    require_active: true,
                })
                .collect()
        };
        self.deliver(targets);
    }

    fn collect_ready(&self, events: &[libc::epoll_event]) -> Vec<Target> {
        let mut d = self.data.borrow_mut();
        let LoopData {
            ref mut slots,
            ref mut signalfd,
            ref wake,
            ..
        } = *d;

        let mut out = Vec::new();
        for event in events.iter() {
            match event.u64 {
                WAKE_TOKEN => {
                    wake.drain();
                    for (token, slot) in slots.iter() {
                        if let SlotData::Async { shared } = &slot.data {
                            if !shared.take_pending() {
                                continue;
                            }
                            if slot.flags & ACTIVE != 0 && slot.flags & CLOSING == 0 {
                                out.push(Target {
                                    token: *token,
                                    dispatch: slot.dispatch.clone(),
                                    status: 0,
                                    datum: 0,
                                    require_active: true,
                                });
                            }
                        }
                    }
                }
                SIGNAL_TOKEN => {
                    while let Ok(Some(info)) = signalfd.read_signal() {
                        let signo = info.ssi_signo as i32;
                        for (token, slot) in slots.iter() {
                            if let SlotData::Signal { signum } = slot.data {
                                if signum == signo
                                    && slot.flags & ACTIVE != 0
                                    && slot.flags & CLOSING == 0
                                {
                                    out.push(Target {
                                        token: *token,
                                        dispatch: slot.dispatch.clone(),
                                        status: 0,
                                        datum: signo as u32,
                                        require_active: true,
                                    });
                                }
                            }
                        }
                    }
                }
                token => {
                    if let Some(slot) = slots.get(&token) {
                        if slot.kind == HandleKind::Poll
                            && slot.flags & ACTIVE != 0
                            && slot.flags & CLOSING == 0
                        {
                            let (status, datum) = translate_ready(event.events);
                            out.push(Target {
                                token,
                                dispatch: slot.dispatch.clone(),
                                status,
                                datum,
                                require_active: true,
                            });
                        }
                    }
                }
            }
        }
        out
    }

    fn deliver(&self, targets: Vec<Target>) {
        for target in targets {
            // Re-check per target: an earlier callback this tick may have
            // stopped or closed the watcher.
            let live = {
                let d = self.data.borrow();
                match d.slots.get(&target.token) {
                    Some(slot) => {
                        slot.flags & CLOSING == 0
                            && (!target.require_active || slot.flags & ACTIVE != 0)
                    }
                    None => false,
                }
            };
            if !live {
                continue;
            }
            match target.dispatch.upgrade() {
                Some(dispatch) => dispatch.raw_dispatch(target.status, target.datum),
                None => {
                    // The watcher object is gone without a close; disarm the
                    // slot so a level-triggered source cannot spin.
                    let _ = self.raw_stop(target.token);
                }
            }
        }
    }

    fn finish_closing(&self) {
        loop {
            let next = self.data.borrow_mut().closing.pop();
            match next {
                Some((token, ack)) => {
                    self.data.borrow_mut().slots.remove(&token);
                    ack(token);
                }
                None => break,
            }
        }
    }
}

impl LoopData {
    fn poll_timeout(&self, user: i32) -> i32 {
        if self.stop_flag || !self.closing.is_empty() {
            return 0;
        }
        if self
            .slots
            .values()
            .any(|s| s.kind == HandleKind::Idle && s.flags & ACTIVE != 0)
        {
            return 0;
        }

        let next = self
            .timers
            .iter()
            .filter(|e| self.timer_entry_valid(e))
            .map(|e| e.due)
            .min();
        match next {
            None => user,
            Some(due) => {
                let delta = due.saturating_sub(clock::now_usec());
                let ms = (delta.saturating_add(clock::USEC_PER_MSEC - 1) / clock::USEC_PER_MSEC)
                    .min(i32::MAX as u64) as i32;
                if user < 0 {
                    ms
                } else {
                    user.min(ms)
                }
            }
        }
    }

    fn timer_entry_valid(&self, entry: &TimerEntry) -> bool {
        match self.slots.get(&entry.token) {
            Some(slot) if slot.flags & ACTIVE != 0 && slot.flags & CLOSING == 0 => {
                match &slot.data {
                    SlotData::Timer { gen, .. } | SlotData::FsPoll { gen, .. } => *gen == entry.gen,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

fn epoll_interest(events: u32) -> u32 {
    let mut ep = 0u32;
    if events & EventMask::READ.bits() != 0 {
        ep |= libc::EPOLLIN as u32;
    }
    if events & EventMask::WRITE.bits() != 0 {
        ep |= libc::EPOLLOUT as u32;
    }
    if events & EventMask::DISCONNECT.bits() != 0 {
        ep |= libc::EPOLLRDHUP as u32;
    }
    ep
}

fn translate_ready(ep: u32) -> (i32, u32) {
    if ep & libc::EPOLLERR as u32 != 0 {
        return (-libc::EBADF, 0);
    }
    let mut events = EventMask::empty();
    if ep & libc::EPOLLIN as u32 != 0 {
        events |= EventMask::READ;
    }
    if ep & libc::EPOLLOUT as u32 != 0 {
        events |= EventMask::WRITE;
    }
    if ep & libc::EPOLLRDHUP as u32 != 0 {
        events |= EventMask::DISCONNECT;
    }
    if ep & libc::EPOLLHUP as u32 != 0 {
        events |= EventMask::READ | EventMask::WRITE;
    }
    (0, events.bits())
}

fn apply_sigmask(slots: &HashMap<u64, Slot>, signalfd: &mut SignalFd) -> i32 {
    let mut mask = SigSet::empty();
    for slot in slots.values() {
        if slot.kind != HandleKind::Signal || slot.flags & ACTIVE == 0 {
            continue;
        }
        if let SlotData::Signal { signum } = slot.data {
            if let Ok(sig) = Signal::try_from(signum) {
                mask.add(sig);
            }
        }
    }
    if let Err(e) = mask.thread_set_mask() {
        return -(e as i32);
    }
    if let Err(e) = signalfd.set_mask(&mask) {
        return -(e as i32);
    }
    0
}

fn stat_snapshot(path: &PathBuf) -> Option<FileStat> {
    nix::sys::stat::stat(path).ok()
}

fn snapshots_differ(a: &Option<FileStat>, b: &Option<FileStat>) -> bool {
    match (a, b) {
        (None, None) => false,
        (Some(_), None) | (None, Some(_)) => true,
        (Some(a), Some(b)) => {
            a.st_dev != b.st_dev
                || a.st_ino != b.st_ino
                || a.st_mode != b.st_mode
                || a.st_nlink != b.st_nlink
                || a.st_uid != b.st_uid
                || a.st_gid != b.st_gid
                || a.st_size != b.st_size
                || a.st_mtime != b.st_mtime
                || a.st_mtime_nsec != b.st_mtime_nsec
                || a.st_ctime != b.st_ctime
                || a.st_ctime_nsec != b.st_ctime_nsec
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Watcher;
    use std::cell::Cell;

    #[test]
    fn fresh_loop_is_not_alive() {
        let lp = EventLoop::new().unwrap();
        assert!(!lp.alive());
        assert!(!lp.run_once(0).unwrap());
    }

    #[test]
    fn timer_keeps_loop_alive_until_it_fires() {
        let lp = EventLoop::new().unwrap();
        let timer = lp.timer(Duration::from_millis(2), Duration::ZERO);
        let fired = Rc::new(Cell::new(false));
        let seen = fired.clone();
        timer.start(move || seen.set(true)).unwrap();
        assert!(lp.alive());
        lp.run().unwrap();
        assert!(fired.get());
        assert!(!lp.alive());
    }

    #[test]
    fn unreffed_watcher_does_not_hold_the_loop() {
        let lp = EventLoop::new().unwrap();
        let timer = lp.timer(Duration::from_millis(50), Duration::ZERO);
        timer.set_ref(false);
        timer.start(|| {}).unwrap();
        assert!(!lp.alive());
        lp.run().unwrap();
    }

    #[test]
    fn repeating_timer_rearms() {
        let lp = EventLoop::new().unwrap();
        let timer = lp.timer(Duration::from_millis(1), Duration::from_millis(1));
        let count = Rc::new(Cell::new(0u32));
        let seen = count.clone();
        let inner = lp.clone();
        timer
            .start(move || {
                seen.set(seen.get() + 1);
                if seen.get() >= 3 {
                    inner.stop();
                }
            })
            .unwrap();
        lp.run().unwrap();
        assert!(count.get() >= 3);
        assert!(timer.active());
        timer.close();
    }
}
