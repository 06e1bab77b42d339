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

// This test cannot run as a regular test because cargo would spawn a thread
// to run it, failing the signal masking. So we make our own, non-threaded
// harnessing (harness = false in Cargo.toml).

use std::cell::Cell;
use std::rc::Rc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use watcher::{EventLoop, Watcher, WatcherState};

fn main() {
    let lp = EventLoop::new().unwrap();
    let watcher = lp.signal(Signal::SIGUSR1);

    // Signal watchers do not keep the loop alive on their own.
    assert!(!watcher.has_ref());

    let got = Rc::new(Cell::new(0i32));
    let seen = got.clone();
    watcher.start(move |signum| seen.set(signum)).unwrap();
    assert!(watcher.active());

    // Starting blocked the signal for this thread; raising it now queues it
    // on the loop's signalfd instead of running the default action.
    kill(Pid::this(), Signal::SIGUSR1).expect("Failed to send SIGUSR1 signal");

    lp.run_once(1000).unwrap();
    assert_eq!(got.get(), Signal::SIGUSR1 as i32);

    // A stopped watcher no longer hears the signal it unblocked.
    watcher.stop().unwrap();
    watcher.close();
    assert_eq!(watcher.state(), WatcherState::Closed);
    lp.run_once(0).unwrap();

    println!("signal watcher test ok");
}
