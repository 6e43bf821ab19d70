// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! FUSE binding
//!
//! Maps the inode-based `fuser` protocol onto the path-based [`OperationAdapter`].
//! `fuser` drives every callback from the session thread, so at most one adapter
//! call is outstanding at a time.

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use fuser::{
    FUSE_ROOT_ID, FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite,
    Request, Session, SessionUnmounter, TimeOrNow,
};
use libc::{EINVAL, ENOENT, c_int};
use tracing::{debug, info};

use crate::adapter::{FileKind, FileStat, OperationAdapter};
use crate::error::{Errno, StartError};
use crate::session::{
    FilesystemInstance, KernelBackend, MountArgs, MountOpt, MountedSession, Unmount,
};

const DEFAULT_FS_NAME: &str = "hostfs";

/// Inode number reported for directory entries the kernel has not looked up yet.
/// The kernel ignores it and issues a lookup before using the name.
const UNKNOWN_INODE: u64 = u64::MAX;

#[derive(Debug)]
struct Node {
    path: Vec<u8>,
    lookups: u64,
}

/// Inode/path table with kernel lookup counts. The root inode always maps to `/`.
///
/// A node lives until the kernel forgets every lookup it was handed, so an unlinked
/// file that is still open keeps resolving to its last path.
#[derive(Debug)]
struct InodeTable {
    nodes: HashMap<u64, Node>,
    paths: HashMap<Vec<u8>, u64>,
    next_inode: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            nodes: HashMap::new(),
            paths: HashMap::new(),
            next_inode: FUSE_ROOT_ID + 1,
        };
        table.paths.insert(b"/".to_vec(), FUSE_ROOT_ID);
        table.nodes.insert(
            FUSE_ROOT_ID,
            Node {
                path: b"/".to_vec(),
                lookups: 1,
            },
        );
        table
    }

    fn path(&self, inode: u64) -> Option<&[u8]> {
        self.nodes.get(&inode).map(|node| node.path.as_slice())
    }

    fn known(&self, path: &[u8]) -> Option<u64> {
        self.paths.get(path).copied()
    }

    /// Hand the kernel a reference to `path`, allocating an inode on first sight.
    fn lookup(&mut self, path: &[u8]) -> u64 {
        if let Some(inode) = self.known(path) {
            if let Some(node) = self.nodes.get_mut(&inode) {
                node.lookups += 1;
            }
            return inode;
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.paths.insert(path.to_vec(), inode);
        self.nodes.insert(
            inode,
            Node {
                path: path.to_vec(),
                lookups: 1,
            },
        );
        inode
    }

    fn child(&self, parent: u64, name: &OsStr) -> Option<Vec<u8>> {
        let parent = self.path(parent)?;
        Some(join_path(parent, name.as_bytes()))
    }

    /// Detach `path` from its inode; the node stays until it is forgotten.
    fn unlink(&mut self, path: &[u8]) {
        self.paths.remove(path);
    }

    fn forget(&mut self, inode: u64, nlookup: u64) {
        if inode == FUSE_ROOT_ID {
            return;
        }
        let Some(node) = self.nodes.get_mut(&inode) else {
            return;
        };
        node.lookups = node.lookups.saturating_sub(nlookup);
        if node.lookups > 0 {
            return;
        }
        if let Some(node) = self.nodes.remove(&inode) {
            if self.paths.get(&node.path) == Some(&inode) {
                self.paths.remove(&node.path);
            }
        }
    }

    /// Re-key `from` and everything below it to `to`, keeping inode numbers.
    fn rename(&mut self, from: &[u8], to: &[u8]) {
        self.unlink(to);
        let moved: Vec<(Vec<u8>, Vec<u8>, u64)> = self
            .paths
            .iter()
            .filter_map(|(path, &inode)| {
                let rest = path.strip_prefix(from)?;
                (rest.is_empty() || rest.starts_with(b"/")).then(|| {
                    let mut renamed = to.to_vec();
                    renamed.extend_from_slice(rest);
                    (path.clone(), renamed, inode)
                })
            })
            .collect();
        for (old, renamed, inode) in moved {
            self.paths.remove(&old);
            if let Some(node) = self.nodes.get_mut(&inode) {
                node.path = renamed.clone();
            }
            self.paths.insert(renamed, inode);
        }
    }
}

/// Inode and type reported for `name` when listing `dir` (inode `dir_ino`).
/// Listing never takes a kernel reference.
fn dir_entry(nodes: &InodeTable, dir: &[u8], dir_ino: u64, name: &[u8]) -> (u64, FileType) {
    match name {
        b"." | b".." => (dir_ino, FileType::Directory),
        _ => (
            nodes.known(&join_path(dir, name)).unwrap_or(UNKNOWN_INODE),
            FileType::RegularFile,
        ),
    }
}

/// Apply `limit` through a `KernelConfig` setter, settling for the nearest value it
/// accepts. Returns the value in effect.
fn negotiate(mut set: impl FnMut(u32) -> Result<u32, u32>, limit: u32) -> u32 {
    match set(limit) {
        Ok(_) => limit,
        Err(nearest) => {
            let _ = set(nearest);
            nearest
        }
    }
}

fn join_path(parent: &[u8], name: &[u8]) -> Vec<u8> {
    let mut path = parent.to_vec();
    if !path.ends_with(b"/") {
        path.push(b'/');
    }
    path.extend_from_slice(name);
    path
}

/// `fuser` filesystem delegating to the host through the adapter.
pub struct HostFs {
    adapter: OperationAdapter,
    io_buffer: Vec<u8>,
    attr_ttl: Duration,
    entry_ttl: Duration,
    uid: u32,
    gid: u32,
    nodes: InodeTable,
}

impl HostFs {
    pub fn new(instance: FilesystemInstance, uid: u32, gid: u32) -> Self {
        Self {
            attr_ttl: instance.cache.attr_ttl(),
            entry_ttl: instance.cache.entry_ttl(),
            adapter: instance.adapter,
            io_buffer: instance.io_buffer,
            uid,
            gid,
            nodes: InodeTable::new(),
        }
    }

    fn path(&self, ino: u64) -> Result<Vec<u8>, c_int> {
        self.nodes.path(ino).map(<[u8]>::to_vec).ok_or(ENOENT)
    }

    fn file_attr(&self, ino: u64, stat: &FileStat) -> FileAttr {
        let kind = match stat.kind {
            FileKind::RegularFile => FileType::RegularFile,
            FileKind::Directory => FileType::Directory,
        };
        FileAttr {
            ino,
            size: stat.size,
            blocks: stat.size.div_ceil(512),
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind,
            perm: (stat.mode & 0o7777) as u16,
            nlink: stat.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn stat_path(&mut self, path: &[u8]) -> Result<FileAttr, Errno> {
        let stat = self.adapter.getattr(path)?;
        let ino = self.nodes.lookup(path);
        Ok(self.file_attr(ino, &stat))
    }

    /// Read up to `size` bytes of `path` at `offset`, growing the I/O buffer when the
    /// kernel asks for more than it holds.
    fn read_data(&mut self, path: &[u8], offset: u64, size: usize) -> Result<&[u8], Errno> {
        if size > self.io_buffer.len() {
            self.io_buffer
                .try_reserve_exact(size - self.io_buffer.len())
                .map_err(|_| Errno::ENOMEM)?;
            debug!(target: "hostfs::fuse", from = self.io_buffer.len(), to = size, "growing I/O buffer");
            self.io_buffer.resize(size, 0);
        }
        let produced = self.adapter.read(path, offset, &mut self.io_buffer[..size])?;
        Ok(&self.io_buffer[..produced.min(size)])
    }
}

impl Filesystem for HostFs {
    fn init(&mut self, _req: &Request, config: &mut KernelConfig) -> Result<(), c_int> {
        let limit = u32::try_from(self.io_buffer.len()).unwrap_or(u32::MAX);
        let max_write = negotiate(|value| config.set_max_write(value), limit);
        let max_readahead = negotiate(|value| config.set_max_readahead(value), limit);
        info!(target: "hostfs::fuse", max_write, max_readahead, "kernel session initialised");
        Ok(())
    }

    // Runs before fuser releases the mount, so the buffer goes first.
    fn destroy(&mut self) {
        self.io_buffer = Vec::new();
        info!(target: "hostfs::fuse", "kernel session destroyed");
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.nodes.forget(ino, nlookup);
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.nodes.child(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        match self.stat_path(&path) {
            Ok(attr) => reply.entry(&self.entry_ttl, &attr, 0),
            Err(errno) => reply.error(errno.raw()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        match self.adapter.getattr(&path) {
            Ok(stat) => reply.attr(&self.attr_ttl, &self.file_attr(ino, &stat)),
            Err(errno) => reply.error(errno.raw()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        if let Some(size) = size {
            if let Err(errno) = self.adapter.truncate(&path, size) {
                return reply.error(errno.raw());
            }
        }
        match self.adapter.getattr(&path) {
            Ok(stat) => reply.attr(&self.attr_ttl, &self.file_attr(ino, &stat)),
            Err(errno) => reply.error(errno.raw()),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        match self.adapter.open(&path, flags) {
            Ok(()) => reply.opened(0, 0),
            Err(errno) => reply.error(errno.raw()),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        match self.adapter.release(&path) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.raw()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(EINVAL);
        };
        match self.read_data(&path, offset, size as usize) {
            Ok(data) => reply.data(data),
            Err(errno) => reply.error(errno.raw()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(EINVAL);
        };
        match self.adapter.write(&path, data, offset) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno.raw()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let dir = match self.path(ino) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        if offset < 0 {
            return reply.error(EINVAL);
        }

        let nodes = &self.nodes;
        let mut index: i64 = 0;
        let listed = self.adapter.readdir(&dir, |name| {
            index += 1;
            if index <= offset {
                return false;
            }
            let (entry_ino, kind) = dir_entry(nodes, &dir, ino, name);
            reply.add(entry_ino, index, kind, OsStr::from_bytes(name))
        });
        match listed {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.raw()),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.nodes.child(parent, name) else {
            return reply.error(ENOENT);
        };
        if let Err(errno) = self.adapter.create(&path) {
            return reply.error(errno.raw());
        }
        let stat = self.adapter.getattr(&path).unwrap_or_else(|errno| {
            debug!(
                target: "hostfs::fuse",
                path = %String::from_utf8_lossy(&path),
                %errno,
                "no attributes after create; reporting an empty file"
            );
            FileStat::regular(0)
        });
        let ino = self.nodes.lookup(&path);
        reply.created(&self.entry_ttl, &self.file_attr(ino, &stat), 0, 0, 0);
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.nodes.child(parent, name) else {
            return reply.error(ENOENT);
        };
        match self.adapter.unlink(&path) {
            Ok(()) => {
                self.nodes.unlink(&path);
                reply.ok();
            }
            Err(errno) => reply.error(errno.raw()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.nodes.child(parent, name),
            self.nodes.child(newparent, newname),
        ) else {
            return reply.error(ENOENT);
        };
        match self.adapter.rename(&from, &to) {
            Ok(()) => {
                self.nodes.rename(&from, &to);
                reply.ok();
            }
            Err(errno) => reply.error(errno.raw()),
        }
    }
}

fn fuser_options(options: &[MountOpt]) -> Vec<MountOption> {
    let mut converted: Vec<MountOption> = options
        .iter()
        .map(|opt| match opt {
            MountOpt::FsName(name) => MountOption::FSName(name.clone()),
            MountOpt::Subtype(name) => MountOption::Subtype(name.clone()),
            MountOpt::AllowOther => MountOption::AllowOther,
            MountOpt::AllowRoot => MountOption::AllowRoot,
            MountOpt::AutoUnmount => MountOption::AutoUnmount,
            MountOpt::ReadOnly => MountOption::RO,
            MountOpt::DefaultPermissions => MountOption::DefaultPermissions,
        })
        .collect();
    if !options.iter().any(|opt| matches!(opt, MountOpt::FsName(_))) {
        converted.push(MountOption::FSName(DEFAULT_FS_NAME.to_string()));
    }
    converted
}

/// Mounts through `fuser::Session`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FuserBackend;

impl KernelBackend for FuserBackend {
    fn mount(
        &self,
        args: &MountArgs,
        instance: FilesystemInstance,
    ) -> Result<Box<dyn MountedSession>, StartError> {
        let filesystem = HostFs::new(instance, args.uid, args.gid);
        let options = fuser_options(&args.options);
        debug!(target: "hostfs::fuse", ?options, mountpoint = %args.mountpoint.display(), "mounting");
        let session =
            Session::new(filesystem, &args.mountpoint, &options).map_err(StartError::Mount)?;
        Ok(Box::new(FuserSession { session }))
    }
}

struct FuserSession {
    session: Session<HostFs>,
}

impl MountedSession for FuserSession {
    fn unmounter(&mut self) -> Box<dyn Unmount> {
        Box::new(FuserUnmounter(self.session.unmount_callable()))
    }

    // The receive loop returns once the unmounter detaches the mount.
    fn run(&mut self, exit: &AtomicBool) -> io::Result<()> {
        if exit.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.session.run()
    }
}

struct FuserUnmounter(SessionUnmounter);

impl Unmount for FuserUnmounter {
    fn unmount(&mut self) -> io::Result<()> {
        self.0.unmount()
    }
}
