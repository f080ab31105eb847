// Copyright © 2025 Cyberus Technology GmbH
//
// Copyright © 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0
//

//! Advisory locking of image files.
//!
//! Images are locked with OFD locks over the whole file. The lock belongs to
//! the open file description, so it is held for exactly as long as the handle
//! that took it and two handles of one process still exclude each other.
//! A writable handle takes an exclusive lock, a read-only handle a shared one.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use crate::{Error, ResourceError, Result};

/// Commands for use with [`fcntl`].
#[allow(non_camel_case_types)]
enum FcntlArg<'a> {
    /// Set an OFD lock from the given lock description.
    F_OFD_SETLK(&'a libc::flock),
    /// Get the first OFD lock for the given lock description.
    F_OFD_GETLK(&'a mut libc::flock),
}

/// Wrapper for [`libc::fcntl`] that properly sets the function arguments.
fn fcntl(fd: RawFd, arg: FcntlArg) -> libc::c_int {
    // SAFETY: We use a valid FD and the flock structures outlive the call.
    unsafe {
        match arg {
            FcntlArg::F_OFD_SETLK(flock) => libc::fcntl(fd, libc::F_OFD_SETLK, flock),
            FcntlArg::F_OFD_GETLK(flock) => libc::fcntl(fd, libc::F_OFD_GETLK, flock),
        }
    }
}

/// The kind of access a lock grants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockType {
    /// Clear a lock.
    Unlock,
    /// Exclusive access, for writers.
    Write,
    /// Shared access, for readers.
    Read,
}

impl LockType {
    /// The lock a handle opened with the given access needs.
    pub fn for_access(writable: bool) -> Self {
        if writable {
            LockType::Write
        } else {
            LockType::Read
        }
    }

    const fn to_libc_val(self) -> libc::c_int {
        match self {
            Self::Unlock => libc::F_UNLCK as libc::c_int,
            Self::Write => libc::F_WRLCK as libc::c_int,
            Self::Read => libc::F_RDLCK as libc::c_int,
        }
    }
}

/// Returns a [`struct@libc::flock`] structure for the whole file.
const fn get_flock(lock_type: LockType) -> libc::flock {
    libc::flock {
        l_type: lock_type.to_libc_val() as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0, /* EOF */
        l_pid: 0, /* filled by callee */
    }
}

/// Tries to lock `file` without blocking. `path` only names the image in the error returned
/// when another handle holds a conflicting lock.
pub fn try_acquire_lock(file: &File, lock_type: LockType, path: &Path) -> Result<()> {
    let flock = get_flock(lock_type);

    match fcntl(file.as_raw_fd(), FcntlArg::F_OFD_SETLK(&flock)) {
        0 => Ok(()),
        _ => {
            let io_error = io::Error::last_os_error();
            match io_error.raw_os_error() {
                // See man page for error code:
                // <https://man7.org/linux/man-pages/man2/fcntl.2.html>
                Some(libc::EAGAIN) | Some(libc::EACCES) => {
                    Err(ResourceError::Locked(path.to_path_buf()).into())
                }
                _ => Err(Error::Locking(io_error)),
            }
        }
    }
}

/// Clears the lock `file` holds.
pub fn clear_lock(file: &File, path: &Path) -> Result<()> {
    try_acquire_lock(file, LockType::Unlock, path)
}

/// Returns true if some other open file description holds a lock that would conflict with
/// `lock_type`.
pub fn is_locked(file: &File, lock_type: LockType) -> Result<bool> {
    let mut flock = get_flock(lock_type);
    match fcntl(file.as_raw_fd(), FcntlArg::F_OFD_GETLK(&mut flock)) {
        0 => Ok(flock.l_type as libc::c_int != libc::F_UNLCK as libc::c_int),
        _ => Err(Error::Locking(io::Error::last_os_error())),
    }
}
