// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the hostfs bridge

use std::fmt;
use std::io;

use libc::c_int;

/// A positive POSIX error number reported back to the kernel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(c_int);

impl Errno {
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EACCES: Errno = Errno(libc::EACCES);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const ENOMEM: Errno = Errno(libc::ENOMEM);
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);
    pub const ENOTCONN: Errno = Errno(libc::ENOTCONN);

    /// Wraps a raw error number. Host-provided codes are passed through untouched.
    pub const fn from_raw(code: c_int) -> Self {
        Errno(code)
    }

    /// The raw (positive) error number, as expected by `fuser` replies.
    pub const fn raw(self) -> c_int {
        self.0
    }

    /// The value a libfuse-style operation would return: `-errno`.
    pub const fn as_return_code(self) -> c_int {
        -self.0
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({})", self.0)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", io::Error::from_raw_os_error(self.0), self.0)
    }
}

impl std::error::Error for Errno {}

/// Result of a single kernel-facing operation.
pub type OpResult<T> = Result<T, Errno>;

/// Reasons a mount attempt can fail before the session reaches `Mounted`.
#[derive(thiserror::Error, Debug)]
pub enum StartError {
    #[error("invalid mount arguments: {0}")]
    ArgParse(String),
    #[error("mount failed: {0}")]
    Mount(#[source] io::Error),
    #[error("failed to create filesystem instance: {0}")]
    InstanceCreate(String),
    #[error("failed to allocate {bytes} byte kernel I/O buffer")]
    Alloc { bytes: usize },
    #[error("a session is already mounted")]
    AlreadyMounted,
    #[error("failed to spawn session thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("session thread exited before reporting its init outcome")]
    InitAborted,
}

/// Returned by `Mailbox::submit` once the owning session has torn down.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("mailbox closed")]
pub struct MailboxClosed;

/// Binding a handler under a name that is not one of the well-known operation names.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown operation name: {0}")]
pub struct UnknownOperation(pub String);
