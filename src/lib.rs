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

//! # A uniform watcher layer over an epoll-based event loop
//!
//! Watchers register interest in one class of event — descriptor
//! readiness, timeouts, signals, loop phases, path metadata, cross-thread
//! wakeups, fork and child-exit notifications — without knowing how the
//! loop represents its handles or when it releases them.
//!
//! Every watcher moves through the same lifecycle: `start` lazily
//! initializes the native handle and arms it, `stop` disarms it but keeps
//! it allocated, `close` requests the deferred native release. Closing is
//! asynchronous at the native layer: the handle is disarmed immediately but
//! only reclaimed once the loop acknowledges, so descriptor numbers can be
//! reused eagerly without tearing down the wrong registration.
//!
//! Several logical readers and writers can share one descriptor through
//! [`IoWatcher::multiplex`]: the single native polling handle is armed with
//! the union of the sub-watchers' masks, and events fan out to whichever
//! sub-watchers they match.
//!
//! # Example:
//! ```rust
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! use watcher::{EventLoop, Watcher};
//!
//! let lp = EventLoop::new().unwrap();
//!
//! /// A one-shot timer; the loop exits once no armed watcher remains.
//! let timer = lp.timer(Duration::from_millis(5), Duration::ZERO);
//!
//! let fired = Rc::new(Cell::new(false));
//! let seen = fired.clone();
//! timer.start(move || seen.set(true)).unwrap();
//!
//! lp.run().unwrap();
//! assert!(fired.get());
//! assert!(!timer.active());
//! ```
//!
pub mod error;
pub mod events;
pub mod io;
pub mod phase;
pub mod process;
pub mod signal;
pub mod stat;
pub mod timer;
pub mod watcher;
pub mod wakeup;

mod clock;
mod lifecycle;
mod poll;

pub use crate::events::EventLoop;
pub use crate::io::{EventMask, IoWatcher, MultiplexHandle};
pub use crate::phase::{CheckWatcher, IdleWatcher, PrepareWatcher};
pub use crate::process::{ChildNotifier, ChildWatcher, ForkNotifier, ForkWatcher};
pub use crate::signal::SignalWatcher;
pub use crate::stat::StatWatcher;
pub use crate::timer::TimerWatcher;
pub use crate::wakeup::{AsyncNotifier, AsyncWatcher};
pub use crate::watcher::{Watcher, WatcherState};
pub use error::*;
