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

//! Monotonic time for timer scheduling, in microseconds

use std::mem;
use std::time::Duration;

pub(crate) const USEC_INFINITY: u64 = u64::MAX;
pub(crate) const USEC_PER_SEC: u64 = 1000000;
pub(crate) const USEC_PER_MSEC: u64 = 1000;
pub(crate) const NSEC_PER_SEC: u64 = 1000000000;
pub(crate) const NSEC_PER_USEC: u64 = 1000;

/// Current CLOCK_MONOTONIC reading in microseconds.
pub(crate) fn now_usec() -> u64 {
    unsafe {
        let mut tp: libc::timespec = mem::MaybeUninit::zeroed().assume_init();
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut tp);
        load_usec(tp)
    }
}

fn load_usec(ts: libc::timespec) -> u64 {
    if ts.tv_sec < 0 || ts.tv_nsec < 0 {
        return USEC_INFINITY;
    }

    if (ts.tv_sec as u64) > (USEC_INFINITY - ((ts.tv_nsec as u64) / NSEC_PER_SEC)) / USEC_PER_SEC {
        return USEC_INFINITY;
    }

    (ts.tv_sec as u64) * USEC_PER_SEC + (ts.tv_nsec as u64) / NSEC_PER_USEC
}

/// A `Duration` as microseconds, saturating at infinity.
pub(crate) fn duration_usec(d: Duration) -> u64 {
    let usec = d.as_micros();
    if usec > USEC_INFINITY as u128 {
        USEC_INFINITY
    } else {
        usec as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn monotonic() {
        let a = now_usec();
        let b = now_usec();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn duration_conversion() {
        assert_eq!(duration_usec(Duration::from_millis(3)), 3 * USEC_PER_MSEC);
        assert_eq!(duration_usec(Duration::ZERO), 0);
    }
}
