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

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use nix::unistd;
use watcher::{Error, EventLoop, EventMask, Watcher, WatcherState};

#[test]
fn readiness_reaches_only_matching_multiplexes() {
    let lp = EventLoop::new().unwrap();
    let (r, w) = unistd::pipe().unwrap();

    let io = lp.io(r, EventMask::empty());
    let read_mux = io.multiplex(EventMask::READ);
    let write_mux = io.multiplex(EventMask::WRITE);

    let read_seen = Rc::new(Cell::new(EventMask::empty()));
    let write_fired = Rc::new(Cell::new(false));

    let seen = read_seen.clone();
    read_mux
        .start_with_events(move |status, events| {
            assert!(status >= 0);
            seen.set(events);
        })
        .unwrap();
    let fired = write_fired.clone();
    write_mux.start(move || fired.set(true)).unwrap();

    assert_eq!(io.events(), EventMask::READ | EventMask::WRITE);

    unistd::write(w, b"x").unwrap();
    lp.run_once(100).unwrap();

    assert!(read_seen.get().contains(EventMask::READ));
    assert!(!write_fired.get());

    read_mux.close();
    write_mux.close();
    lp.run_once(0).unwrap();
    let _ = unistd::close(r);
    let _ = unistd::close(w);
}

#[test]
fn last_multiplex_close_lets_the_descriptor_be_rewatched() {
    let lp = EventLoop::new().unwrap();
    let (r, w) = unistd::pipe().unwrap();

    let io = lp.io(r, EventMask::empty());
    let mux = io.multiplex(EventMask::READ);
    mux.start(|| {}).unwrap();

    // Closing the last sub-watcher tears the descriptor out of the poll set
    // before returning.
    mux.close();
    assert_eq!(io.state(), WatcherState::Closed);

    let _ = unistd::close(r);
    let _ = unistd::close(w);

    // A fresh pipe may reuse the very same descriptor numbers; watching it
    // must work even though the old handle's acknowledgment is still queued.
    let (r2, w2) = unistd::pipe().unwrap();
    let io2 = lp.io(r2, EventMask::empty());
    let mux2 = io2.multiplex(EventMask::READ);
    let fired = Rc::new(Cell::new(false));
    let seen = fired.clone();
    mux2.start(move || seen.set(true)).unwrap();

    unistd::write(w2, b"y").unwrap();
    lp.run_once(100).unwrap();
    assert!(fired.get());

    mux2.close();
    lp.run_once(0).unwrap();
    let _ = unistd::close(r2);
    let _ = unistd::close(w2);
}

#[test]
fn callback_may_stop_a_sibling_mid_tick() {
    let lp = EventLoop::new().unwrap();
    let (r, w) = unistd::pipe().unwrap();

    let io = lp.io(r, EventMask::empty());
    let first = io.multiplex(EventMask::READ);
    let second = io.multiplex(EventMask::READ);

    let first_fired = Rc::new(Cell::new(false));
    let second_fired = Rc::new(Cell::new(false));

    let fired = first_fired.clone();
    let sibling = second.clone();
    first
        .start(move || {
            fired.set(true);
            sibling.stop().unwrap();
        })
        .unwrap();
    let fired = second_fired.clone();
    second.start(move || fired.set(true)).unwrap();

    unistd::write(w, b"z").unwrap();
    lp.run_once(100).unwrap();

    assert!(first_fired.get());
    assert!(!second_fired.get());

    first.close();
    second.close();
    lp.run_once(0).unwrap();
    let _ = unistd::close(r);
    let _ = unistd::close(w);
}

#[test]
fn io_watcher_rejects_a_dead_descriptor() {
    let lp = EventLoop::new().unwrap();
    let io = lp.io(987_654, EventMask::READ);
    assert!(matches!(
        io.start(|_, _| {}),
        Err(Error::NativeInit { .. })
    ));
    assert_eq!(io.state(), WatcherState::Uninitialized);
}

#[test]
fn timer_fires_no_sooner_than_one_millisecond() {
    let lp = EventLoop::new().unwrap();
    let timer = lp.timer(Duration::from_micros(500), Duration::ZERO);
    assert_eq!(timer.after(), Duration::from_millis(1));

    let fired = Rc::new(Cell::new(false));
    let seen = fired.clone();
    let begun = Instant::now();
    timer.start(move || seen.set(true)).unwrap();
    lp.run().unwrap();

    assert!(fired.get());
    assert!(begun.elapsed() >= Duration::from_millis(1));
}

#[test]
fn again_on_a_never_started_timer_behaves_like_start() {
    let lp = EventLoop::new().unwrap();
    let timer = lp.timer(Duration::from_millis(3), Duration::ZERO);

    let fired = Rc::new(Cell::new(false));
    let seen = fired.clone();
    timer.again(move || seen.set(true)).unwrap();
    assert!(timer.active());

    lp.run().unwrap();
    assert!(fired.get());
    assert_eq!(timer.state(), WatcherState::Stopped);
}

#[test]
fn zero_duration_timer_fires_on_the_next_iteration() {
    let lp = EventLoop::new().unwrap();
    let timer = lp.timer(Duration::ZERO, Duration::ZERO);

    let count = Rc::new(Cell::new(0u32));
    let seen = count.clone();
    timer.start(move || seen.set(seen.get() + 1)).unwrap();

    lp.run_once(0).unwrap();
    assert_eq!(count.get(), 1);
    assert_eq!(timer.state(), WatcherState::Stopped);

    // Stopped itself after one shot.
    lp.run_once(0).unwrap();
    assert_eq!(count.get(), 1);
}

#[test]
fn unref_before_start_is_harmless() {
    let lp = EventLoop::new().unwrap();
    let timer = lp.timer(Duration::from_millis(2), Duration::ZERO);
    timer.set_ref(false);

    let fired = Rc::new(Cell::new(false));
    let seen = fired.clone();
    timer.start(move || seen.set(true)).unwrap();

    // Unreffed watchers do not keep the loop alive, but still fire when the
    // loop is driven.
    assert!(!lp.alive());
    lp.run_once(100).unwrap();
    assert!(fired.get());
}

#[test]
fn child_notification_wakes_a_blocked_loop() {
    let lp = EventLoop::new().unwrap();
    let child = lp.child(42);

    let reported = Rc::new(RefCell::new(None));
    let seen = reported.clone();
    let inner = lp.clone();
    child
        .start(move |pid, status| {
            *seen.borrow_mut() = Some((pid, status));
            inner.stop();
        })
        .unwrap();

    let notifier = child.notifier().unwrap();
    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        notifier.notify(42, 0).unwrap();
    });

    let begun = Instant::now();
    lp.run().unwrap();
    trigger.join().unwrap();

    assert_eq!(*reported.borrow(), Some((42, 0)));
    assert!(begun.elapsed() >= Duration::from_millis(40));
    child.close();
    lp.run_once(0).unwrap();
}

#[test]
fn fork_watchers_run_on_the_tick_after_notification() {
    let lp = EventLoop::new().unwrap();
    let fork = lp.fork_watcher();

    let fired = Rc::new(Cell::new(false));
    let seen = fired.clone();
    fork.start(move || seen.set(true)).unwrap();

    lp.notify_fork();
    lp.run_once(100).unwrap();
    assert!(fired.get());

    fork.close();
    lp.run_once(0).unwrap();
}

#[test]
fn wakeup_send_crosses_threads_and_fails_after_close() {
    let lp = EventLoop::new().unwrap();
    let wakeup = lp.wakeup();

    let count = Rc::new(Cell::new(0u32));
    let seen = count.clone();
    let inner = lp.clone();
    wakeup
        .start(move || {
            seen.set(seen.get() + 1);
            inner.stop();
        })
        .unwrap();

    let notifier = wakeup.notifier().unwrap();
    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        notifier.send().unwrap();
    });

    lp.run().unwrap();
    trigger.join().unwrap();
    assert_eq!(count.get(), 1);

    let notifier = wakeup.notifier().unwrap();
    wakeup.close();
    assert!(matches!(
        notifier.send(),
        Err(Error::UseAfterClose { .. })
    ));
    assert!(matches!(wakeup.send(), Err(Error::UseAfterClose { .. })));
    lp.run_once(0).unwrap();
}

#[test]
fn start_after_close_fails_loudly() {
    let lp = EventLoop::new().unwrap();
    let timer = lp.timer(Duration::from_millis(1), Duration::ZERO);
    timer.close();
    assert!(matches!(
        timer.start(|| {}),
        Err(Error::UseAfterClose { .. })
    ));
    lp.run_once(0).unwrap();
}

#[test]
fn phases_run_in_loop_order() {
    let lp = EventLoop::new().unwrap();
    let (r, w) = unistd::pipe().unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));

    let idle = lp.idle();
    let trace = order.clone();
    idle.start(move || trace.borrow_mut().push("idle")).unwrap();

    let prepare = lp.prepare();
    let trace = order.clone();
    prepare
        .start(move || trace.borrow_mut().push("prepare"))
        .unwrap();

    let check = lp.check();
    let trace = order.clone();
    check
        .start(move || trace.borrow_mut().push("check"))
        .unwrap();

    let io = lp.io(r, EventMask::empty());
    let mux = io.multiplex(EventMask::READ);
    let trace = order.clone();
    mux.start(move || trace.borrow_mut().push("io")).unwrap();

    unistd::write(w, b"p").unwrap();
    lp.run_once(100).unwrap();

    let order = order.borrow();
    let pos = |name| order.iter().position(|v| *v == name).unwrap();
    assert!(pos("idle") < pos("prepare"));
    assert!(pos("prepare") < pos("io"));
    assert!(pos("io") < pos("check"));

    idle.close();
    prepare.close();
    check.close();
    mux.close();
    lp.run_once(0).unwrap();
    let _ = unistd::close(r);
    let _ = unistd::close(w);
}

#[test]
fn stat_watcher_observes_create_modify_delete() {
    let lp = EventLoop::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("target.txt");

    let stat = lp.stat(path.clone(), Duration::from_millis(120));
    let count = Rc::new(Cell::new(0u32));
    let seen = count.clone();
    stat.start(move || seen.set(seen.get() + 1)).unwrap();
    assert!(stat.current().is_none());

    let wait_for = |lp: &EventLoop, count: &Rc<Cell<u32>>, n: u32| {
        let begun = Instant::now();
        while count.get() < n && begun.elapsed() < Duration::from_secs(5) {
            lp.run_once(50).unwrap();
        }
        assert_eq!(count.get(), n);
    };

    std::fs::write(&path, b"one").unwrap();
    wait_for(&lp, &count, 1);
    assert!(stat.current().is_some());
    assert!(stat.previous().is_none());

    std::fs::write(&path, b"two plus more").unwrap();
    wait_for(&lp, &count, 2);
    assert!(stat.previous().is_some());
    assert_eq!(stat.current().unwrap().st_size, 13);

    std::fs::remove_file(&path).unwrap();
    wait_for(&lp, &count, 3);
    assert!(stat.current().is_none());

    stat.close();
    lp.run_once(0).unwrap();
}
