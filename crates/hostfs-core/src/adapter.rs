// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel-facing operation set
//!
//! Each method builds one [`Request`], blocks in [`Mailbox::submit`] until the host has
//! answered, and decodes the [`Response`] into a POSIX result. The adapter is path based
//! and independent of any particular kernel binding; the `fuse` module layers the
//! inode protocol on top of it.
//!
//! Outcomes shared by every operation:
//!
//! | response                | result      |
//! |-------------------------|-------------|
//! | `Unimplemented`         | `ENOSYS`    |
//! | `HostError(code)`       | `code`      |
//! | `UnknownFailure`        | `ENOSYS`    |
//! | mailbox closed          | `ENOTCONN`  |

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::OpenPolicy;
use crate::error::{Errno, OpResult};
use crate::mailbox::Mailbox;
use crate::request::{Completion, NodeAttr, OpKind, Reply, Request, Response};

pub const REGULAR_FILE_MODE: u32 = libc::S_IFREG as u32 | 0o666;
pub const DIRECTORY_MODE: u32 = libc::S_IFDIR as u32 | 0o755;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
}

/// Attributes reported for a path, already in kernel terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
}

impl FileStat {
    pub fn regular(size: u64) -> Self {
        Self {
            kind: FileKind::RegularFile,
            mode: REGULAR_FILE_MODE,
            nlink: 1,
            size,
        }
    }

    pub fn directory() -> Self {
        Self {
            kind: FileKind::Directory,
            mode: DIRECTORY_MODE,
            nlink: 2,
            size: 0,
        }
    }
}

#[derive(Clone)]
pub struct OperationAdapter {
    mailbox: Arc<Mailbox>,
    open_policy: OpenPolicy,
}

impl OperationAdapter {
    pub fn new(mailbox: Arc<Mailbox>, open_policy: OpenPolicy) -> Self {
        Self {
            mailbox,
            open_policy,
        }
    }

    pub fn open_policy(&self) -> OpenPolicy {
        self.open_policy
    }

    fn call(&self, request: Request) -> OpResult<Reply> {
        let kind = request.kind();
        let response = self.mailbox.submit(request).map_err(|_| {
            debug!(target: "hostfs::adapter", %kind, "session closed; request not delivered");
            Errno::ENOTCONN
        })?;
        match response {
            Response::Success(reply) => Ok(reply),
            Response::Unimplemented => {
                debug!(target: "hostfs::adapter", %kind, "operation not implemented by host");
                Err(Errno::ENOSYS)
            }
            Response::HostError(code) => Err(Errno::from_raw(code)),
            Response::UnknownFailure { identity } => {
                warn!(
                    target: "hostfs::adapter",
                    %kind,
                    identity = %identity,
                    "host failed with an unrecognized error"
                );
                Err(Errno::ENOSYS)
            }
        }
    }

    pub fn create(&self, path: &[u8]) -> OpResult<()> {
        match self.call(Request::Create { path: path.to_vec() })? {
            Reply::Create(completion) => completed(completion),
            other => Err(mismatch(OpKind::Create, &other)),
        }
    }

    pub fn rename(&self, from: &[u8], to: &[u8]) -> OpResult<()> {
        let request = Request::Rename {
            from: from.to_vec(),
            to: to.to_vec(),
        };
        match self.call(request)? {
            Reply::Rename(completion) => completed(completion),
            other => Err(mismatch(OpKind::Rename, &other)),
        }
    }

    pub fn getattr(&self, path: &[u8]) -> OpResult<FileStat> {
        match self.call(Request::GetAttr { path: path.to_vec() })? {
            Reply::GetAttr(NodeAttr::File { size }) => Ok(FileStat::regular(size)),
            Reply::GetAttr(NodeAttr::Directory) => Ok(FileStat::directory()),
            Reply::GetAttr(NodeAttr::NotFound) => Err(Errno::ENOENT),
            other => Err(mismatch(OpKind::GetAttr, &other)),
        }
    }

    /// Feed the directory's entry names to `fill` in order. `fill` returns `true` once
    /// the kernel buffer is full; the remaining names are dropped.
    pub fn readdir<F>(&self, path: &[u8], mut fill: F) -> OpResult<()>
    where
        F: FnMut(&[u8]) -> bool,
    {
        match self.call(Request::ReadDir { path: path.to_vec() })? {
            Reply::ReadDir(names) => {
                for name in &names {
                    if fill(name) {
                        break;
                    }
                }
                Ok(())
            }
            other => Err(mismatch(OpKind::ReadDir, &other)),
        }
    }

    pub fn open(&self, path: &[u8], flags: i32) -> OpResult<()> {
        if self.open_policy == OpenPolicy::ReadOnly && flags & libc::O_ACCMODE != libc::O_RDONLY {
            debug!(
                target: "hostfs::adapter",
                path = %String::from_utf8_lossy(path),
                flags,
                "rejecting non-read-only open"
            );
            return Err(Errno::EACCES);
        }
        match self.call(Request::Open { path: path.to_vec() })? {
            Reply::Open { found: true } => Ok(()),
            Reply::Open { found: false } => Err(Errno::EACCES),
            other => Err(mismatch(OpKind::Open, &other)),
        }
    }

    pub fn release(&self, path: &[u8]) -> OpResult<()> {
        match self.call(Request::Release { path: path.to_vec() })? {
            Reply::Release { found: true } => Ok(()),
            Reply::Release { found: false } => Err(Errno::EACCES),
            other => Err(mismatch(OpKind::Release, &other)),
        }
    }

    /// Read up to `buf.len()` bytes at `offset`.
    ///
    /// Copies `min(L, buf.len())` bytes and returns `L`, the length the host produced.
    pub fn read(&self, path: &[u8], offset: u64, buf: &mut [u8]) -> OpResult<usize> {
        let request = Request::Read {
            path: path.to_vec(),
            offset,
            size: u32::try_from(buf.len()).unwrap_or(u32::MAX),
        };
        match self.call(request)? {
            Reply::Read(Some(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(data.len())
            }
            Reply::Read(None) => Err(Errno::ENOENT),
            other => Err(mismatch(OpKind::Read, &other)),
        }
    }

    /// Returns the byte count the host accepted; a negative host result is its errno.
    pub fn write(&self, path: &[u8], data: &[u8], offset: u64) -> OpResult<u32> {
        let request = Request::Write {
            path: path.to_vec(),
            data: data.to_vec(),
            offset,
        };
        match self.call(request)? {
            Reply::Write(n) if n < 0 => Err(n
                .checked_neg()
                .and_then(|code| i32::try_from(code).ok())
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO)),
            Reply::Write(n) => u32::try_from(n).map_err(|_| Errno::EIO),
            other => Err(mismatch(OpKind::Write, &other)),
        }
    }

    pub fn truncate(&self, path: &[u8], size: u64) -> OpResult<()> {
        match self.call(Request::Truncate {
            path: path.to_vec(),
            size,
        })? {
            Reply::Truncate(completion) => completed(completion),
            other => Err(mismatch(OpKind::Truncate, &other)),
        }
    }

    pub fn unlink(&self, path: &[u8]) -> OpResult<()> {
        match self.call(Request::Unlink { path: path.to_vec() })? {
            Reply::Unlink(completion) => completed(completion),
            other => Err(mismatch(OpKind::Unlink, &other)),
        }
    }
}

fn completed(completion: Completion) -> OpResult<()> {
    match completion {
        Completion::Done => Ok(()),
        Completion::Failed => Err(Errno::ENOENT),
    }
}

fn mismatch(expected: OpKind, reply: &Reply) -> Errno {
    error!(
        target: "hostfs::adapter",
        %expected,
        reply = ?reply,
        "reply does not match request kind"
    );
    Errno::EIO
}
