// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session lifecycle: the dedicated thread that mounts and runs the kernel loop
//!
//! ```text
//! Unmounted -> Mounting -> Mounted -> Unmounting -> Unmounted
//!                 |
//!                 +-> Unmounted (ArgParse | Mount | InstanceCreate | Alloc)
//! ```
//!
//! The caller of [`start`] blocks only until the session thread reports its init
//! outcome over a one-shot channel. Stopping is cooperative: [`SessionHandle::begin_stop`]
//! raises the exit flag and detaches the mount so the receive wait returns; a round
//! trip already in flight runs to completion first.

use std::fmt;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel as chan;
use scopeguard::defer;
use tracing::{debug, error, info, warn};

use crate::adapter::OperationAdapter;
use crate::config::{BridgeConfig, CacheConfig};
use crate::error::StartError;
use crate::mailbox::Mailbox;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Unmounted = 0,
    Mounting = 1,
    Mounted = 2,
    Unmounting = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Mounting,
            2 => SessionState::Mounted,
            3 => SessionState::Unmounting,
            _ => SessionState::Unmounted,
        }
    }
}

#[derive(Debug)]
struct SharedState(AtomicU8);

impl SharedState {
    fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// A single `-o` style mount option.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MountOpt {
    FsName(String),
    Subtype(String),
    AllowOther,
    AllowRoot,
    AutoUnmount,
    ReadOnly,
    DefaultPermissions,
}

impl FromStr for MountOpt {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let opt = match s.split_once('=') {
            Some(("fsname", value)) if !value.is_empty() => MountOpt::FsName(value.to_string()),
            Some(("subtype", value)) if !value.is_empty() => MountOpt::Subtype(value.to_string()),
            Some(_) => return Err(format!("unsupported mount option '{s}'")),
            None => match s {
                "allow_other" => MountOpt::AllowOther,
                "allow_root" => MountOpt::AllowRoot,
                "auto_unmount" => MountOpt::AutoUnmount,
                "ro" => MountOpt::ReadOnly,
                "default_permissions" => MountOpt::DefaultPermissions,
                _ => return Err(format!("unsupported mount option '{s}'")),
            },
        };
        Ok(opt)
    }
}

/// Validated mount arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountArgs {
    pub mountpoint: PathBuf,
    pub options: Vec<MountOpt>,
    /// Owner reported for every node; taken from the mountpoint directory.
    pub uid: u32,
    pub gid: u32,
}

impl MountArgs {
    /// Check the mountpoint and parse option strings. Each string may hold several
    /// comma-separated options, as with `mount -o`.
    pub fn parse(mountpoint: &Path, options: &[String]) -> Result<Self, StartError> {
        if mountpoint.as_os_str().is_empty() {
            return Err(StartError::ArgParse("empty mountpoint".to_string()));
        }
        let metadata = std::fs::metadata(mountpoint).map_err(|e| {
            StartError::ArgParse(format!("mountpoint {}: {e}", mountpoint.display()))
        })?;
        if !metadata.is_dir() {
            return Err(StartError::ArgParse(format!(
                "mountpoint {} is not a directory",
                mountpoint.display()
            )));
        }

        let options = options
            .iter()
            .flat_map(|group| group.split(','))
            .map(str::trim)
            .filter(|opt| !opt.is_empty())
            .map(|opt| opt.parse::<MountOpt>().map_err(StartError::ArgParse))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            mountpoint: mountpoint.to_path_buf(),
            options,
            uid: metadata.uid(),
            gid: metadata.gid(),
        })
    }
}

/// What a kernel binding needs to serve one session. Dropped by the binding in
/// reverse order of acquisition.
pub struct FilesystemInstance {
    pub adapter: OperationAdapter,
    pub io_buffer: Vec<u8>,
    pub cache: CacheConfig,
}

/// Detaches a live mount from another thread so the receive loop returns.
pub trait Unmount: Send {
    fn unmount(&mut self) -> io::Result<()>;
}

/// A mounted kernel channel owned by the session thread. Dropping it releases the
/// filesystem instance and unmounts.
pub trait MountedSession {
    fn unmounter(&mut self) -> Box<dyn Unmount>;

    /// Receive and process kernel requests until the channel closes or `exit` is set.
    fn run(&mut self, exit: &AtomicBool) -> io::Result<()>;
}

/// Kernel binding used by the session thread.
pub trait KernelBackend: Send + Sync + 'static {
    fn mount(
        &self,
        args: &MountArgs,
        instance: FilesystemInstance,
    ) -> Result<Box<dyn MountedSession>, StartError>;
}

fn allocate_io_buffer(bytes: usize) -> Result<Vec<u8>, StartError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(bytes)
        .map_err(|_| StartError::Alloc { bytes })?;
    buffer.resize(bytes, 0);
    Ok(buffer)
}

type InitOutcome = Result<Box<dyn Unmount>, StartError>;

/// Spawn the session thread for `mountpoint` and wait for its init outcome.
///
/// The mailbox is closed when the thread unwinds, on every exit path.
pub fn start(
    backend: Arc<dyn KernelBackend>,
    mailbox: Arc<Mailbox>,
    config: &BridgeConfig,
    mountpoint: &Path,
) -> Result<SessionHandle, StartError> {
    let state = Arc::new(SharedState::new(SessionState::Mounting));
    let exit = Arc::new(AtomicBool::new(false));
    let (init_tx, init_rx) = chan::bounded::<InitOutcome>(1);

    let thread = {
        let state = state.clone();
        let exit = exit.clone();
        let mountpoint = mountpoint.to_path_buf();
        let options = config.mount_options.clone();
        let max_read = config.max_read;
        let cache = config.cache.clone();
        let open_policy = config.open_policy;

        thread::Builder::new()
            .name("hostfs-session".to_string())
            .spawn(move || {
                defer! {
                    mailbox.close();
                    state.set(SessionState::Unmounted);
                    info!(target: "hostfs::session", "session thread finished");
                }

                let mounted = MountArgs::parse(&mountpoint, &options).and_then(|args| {
                    let io_buffer = allocate_io_buffer(max_read)?;
                    let instance = FilesystemInstance {
                        adapter: OperationAdapter::new(mailbox.clone(), open_policy),
                        io_buffer,
                        cache,
                    };
                    backend.mount(&args, instance)
                });
                let mut session = match mounted {
                    Ok(session) => session,
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };

                state.set(SessionState::Mounted);
                info!(target: "hostfs::session", mountpoint = %mountpoint.display(), "mounted");
                if init_tx.send(Ok(session.unmounter())).is_err() {
                    warn!(target: "hostfs::session", "mount caller went away; unmounting");
                    exit.store(true, Ordering::SeqCst);
                }

                if !exit.load(Ordering::SeqCst) {
                    if let Err(err) = session.run(&exit) {
                        error!(target: "hostfs::session", error = %err, "kernel channel failed");
                    }
                }

                state.set(SessionState::Unmounting);
                drop(session);
                info!(target: "hostfs::session", mountpoint = %mountpoint.display(), "unmounted");
            })
            .map_err(StartError::Spawn)?
    };

    let outcome = init_rx.recv().unwrap_or(Err(StartError::InitAborted));
    match outcome {
        Ok(unmounter) => Ok(SessionHandle {
            state,
            exit,
            unmounter: Some(unmounter),
            thread: Some(thread),
            mountpoint: mountpoint.to_path_buf(),
        }),
        Err(err) => {
            if thread.join().is_err() {
                error!(target: "hostfs::session", "session thread panicked during mount");
            }
            debug!(target: "hostfs::session", error = %err, "mount failed");
            Err(err)
        }
    }
}

/// Owner's view of a running session.
pub struct SessionHandle {
    state: Arc<SharedState>,
    exit: Arc<AtomicBool>,
    unmounter: Option<Box<dyn Unmount>>,
    thread: Option<JoinHandle<()>>,
    mountpoint: PathBuf,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Raise the exit flag and detach the mount. Does not wait.
    pub fn begin_stop(&mut self) {
        if self.exit.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state
            .transition(SessionState::Mounted, SessionState::Unmounting);
        if let Some(mut unmounter) = self.unmounter.take() {
            if let Err(err) = unmounter.unmount() {
                warn!(
                    target: "hostfs::session",
                    mountpoint = %self.mountpoint.display(),
                    error = %err,
                    "unmount request failed"
                );
            }
        }
    }

    /// Whether the session thread has fully unwound.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(target: "hostfs::session", "session thread panicked");
            }
        }
    }

    /// Stop and wait for the session thread, including any round trip in flight.
    pub fn request_stop(mut self) {
        self.begin_stop();
        self.join();
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("mountpoint", &self.mountpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.begin_stop();
            self.join();
        }
    }
}
