// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request/response model for one filesystem call crossing the mailbox

use std::fmt;
use std::str::FromStr;

use crate::error::UnknownOperation;

/// The ten operations the kernel side can delegate to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Create,
    Rename,
    GetAttr,
    ReadDir,
    Open,
    Release,
    Read,
    Write,
    Truncate,
    Unlink,
}

impl OpKind {
    pub const ALL: [OpKind; 10] = [
        OpKind::Create,
        OpKind::Rename,
        OpKind::GetAttr,
        OpKind::ReadDir,
        OpKind::Open,
        OpKind::Release,
        OpKind::Read,
        OpKind::Write,
        OpKind::Truncate,
        OpKind::Unlink,
    ];

    /// Well-known name a host binds its handler under.
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Rename => "rename",
            OpKind::GetAttr => "getattr",
            OpKind::ReadDir => "readdir",
            OpKind::Open => "open",
            OpKind::Release => "release",
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::Truncate => "truncate",
            OpKind::Unlink => "unlink",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OpKind {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| UnknownOperation(s.to_string()))
    }
}

/// Arguments of one filesystem call. Paths are raw kernel byte strings.
#[derive(Clone, PartialEq, Eq)]
pub enum Request {
    Create { path: Vec<u8> },
    Rename { from: Vec<u8>, to: Vec<u8> },
    GetAttr { path: Vec<u8> },
    ReadDir { path: Vec<u8> },
    Open { path: Vec<u8> },
    Release { path: Vec<u8> },
    Read { path: Vec<u8>, offset: u64, size: u32 },
    Write { path: Vec<u8>, data: Vec<u8>, offset: u64 },
    Truncate { path: Vec<u8>, size: u64 },
    Unlink { path: Vec<u8> },
}

impl Request {
    pub fn kind(&self) -> OpKind {
        match self {
            Request::Create { .. } => OpKind::Create,
            Request::Rename { .. } => OpKind::Rename,
            Request::GetAttr { .. } => OpKind::GetAttr,
            Request::ReadDir { .. } => OpKind::ReadDir,
            Request::Open { .. } => OpKind::Open,
            Request::Release { .. } => OpKind::Release,
            Request::Read { .. } => OpKind::Read,
            Request::Write { .. } => OpKind::Write,
            Request::Truncate { .. } => OpKind::Truncate,
            Request::Unlink { .. } => OpKind::Unlink,
        }
    }

    /// Primary path of the call (the source path for renames).
    pub fn path(&self) -> &[u8] {
        match self {
            Request::Rename { from, .. } => from,
            Request::Create { path }
            | Request::GetAttr { path }
            | Request::ReadDir { path }
            | Request::Open { path }
            | Request::Release { path }
            | Request::Read { path, .. }
            | Request::Write { path, .. }
            | Request::Truncate { path, .. }
            | Request::Unlink { path } => path,
        }
    }
}

// Write payloads can be megabytes; keep them out of logs.
impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.kind().name());
        s.field("path", &String::from_utf8_lossy(self.path()));
        match self {
            Request::Rename { to, .. } => {
                s.field("to", &String::from_utf8_lossy(to));
            }
            Request::Read { offset, size, .. } => {
                s.field("offset", offset).field("size", size);
            }
            Request::Write { data, offset, .. } => {
                s.field("len", &data.len()).field("offset", offset);
            }
            Request::Truncate { size, .. } => {
                s.field("size", size);
            }
            _ => {}
        }
        s.finish()
    }
}

/// Outcome of Create/Rename/Truncate/Unlink: the handler's integer sign.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Done,
    Failed,
}

impl Completion {
    pub fn from_sign(code: i64) -> Self {
        if code >= 0 {
            Completion::Done
        } else {
            Completion::Failed
        }
    }
}

/// GetAttr result as reported by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeAttr {
    File { size: u64 },
    Directory,
    NotFound,
}

/// Kind-specific payload of a successful call. Buffers are owned and move to the
/// adapter thread exactly once, inside the [`Response`].
#[derive(Clone, PartialEq, Eq)]
pub enum Reply {
    Create(Completion),
    Rename(Completion),
    GetAttr(NodeAttr),
    ReadDir(Vec<Vec<u8>>),
    Open { found: bool },
    Release { found: bool },
    /// `None` is the host's "no data" marker.
    Read(Option<Vec<u8>>),
    /// Passed through verbatim: `>= 0` bytes accepted, `< 0` an error code.
    Write(i64),
    Truncate(Completion),
    Unlink(Completion),
}

impl Reply {
    pub fn kind(&self) -> OpKind {
        match self {
            Reply::Create(_) => OpKind::Create,
            Reply::Rename(_) => OpKind::Rename,
            Reply::GetAttr(_) => OpKind::GetAttr,
            Reply::ReadDir(_) => OpKind::ReadDir,
            Reply::Open { .. } => OpKind::Open,
            Reply::Release { .. } => OpKind::Release,
            Reply::Read(_) => OpKind::Read,
            Reply::Write(_) => OpKind::Write,
            Reply::Truncate(_) => OpKind::Truncate,
            Reply::Unlink(_) => OpKind::Unlink,
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Create(c) => write!(f, "Create({c:?})"),
            Reply::Rename(c) => write!(f, "Rename({c:?})"),
            Reply::GetAttr(a) => write!(f, "GetAttr({a:?})"),
            Reply::ReadDir(names) => write!(f, "ReadDir({} entries)", names.len()),
            Reply::Open { found } => write!(f, "Open(found={found})"),
            Reply::Release { found } => write!(f, "Release(found={found})"),
            Reply::Read(Some(data)) => write!(f, "Read({} bytes)", data.len()),
            Reply::Read(None) => write!(f, "Read(no data)"),
            Reply::Write(n) => write!(f, "Write({n})"),
            Reply::Truncate(c) => write!(f, "Truncate({c:?})"),
            Reply::Unlink(c) => write!(f, "Unlink({c:?})"),
        }
    }
}

/// What the dispatcher hands back for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Success(Reply),
    /// No handler bound for the request's kind.
    Unimplemented,
    /// The handler raised `fs-error` with this POSIX code.
    HostError(i32),
    /// The handler raised something the bridge does not recognize.
    UnknownFailure { identity: String },
}
