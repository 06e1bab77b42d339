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

//! Error define
use snafu::prelude::*;

/// Watcher Error
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Error(watcher): Got an error: {:?}", source))]
    Io { source: std::io::Error },
    #[snafu(display("Error(watcher): Nix error: {}", source))]
    Nix { source: nix::Error },
    #[snafu(display("Error(watcher): '{}'.", word))]
    Other { word: &'static str },
    #[snafu(display(
        "Error(watcher): Got an error: (ret={}, errno={}) for syscall: {}",
        ret,
        errno,
        syscall
    ))]
    Syscall {
        syscall: &'static str,
        ret: i32,
        errno: i32,
    },
    #[snafu(display(
        "Error(watcher): handle init '{}' rejected: {} (ret={})",
        op,
        msg,
        ret
    ))]
    NativeInit {
        op: &'static str,
        ret: i32,
        msg: String,
    },
    #[snafu(display("Error(watcher): call '{}' failed: {} (ret={})", op, msg, ret))]
    Native {
        op: &'static str,
        ret: i32,
        msg: String,
    },
    #[snafu(display("Error(watcher): '{}' used after close.", what))]
    UseAfterClose { what: &'static str },
}

/// new Result
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_error() {
        let error = Error::Syscall {
            syscall: "epoll_wait",
            ret: -1,
            errno: 9,
        };
        assert_eq!(
            error.to_string(),
            "Error(watcher): Got an error: (ret=-1, errno=9) for syscall: epoll_wait"
        );
    }

    #[test]
    fn test_native_error() {
        let error = Error::Native {
            op: "raw_start",
            ret: -22,
            msg: String::from("Invalid argument"),
        };
        assert_eq!(
            error.to_string(),
            "Error(watcher): call 'raw_start' failed: Invalid argument (ret=-22)"
        );
    }

    #[test]
    fn test_use_after_close_error() {
        let error = Error::UseAfterClose {
            what: "async watcher handle",
        };
        assert_eq!(
            error.to_string(),
            "Error(watcher): 'async watcher handle' used after close."
        );
    }

    #[test]
    fn test_other_error() {
        let error = Error::Other { word: "test" };
        assert_eq!(error.to_string(), "Error(watcher): 'test'.");
    }
}
