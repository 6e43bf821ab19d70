// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! hostfs: delegate filesystem operations to a single-threaded host runtime
//!
//! Kernel worker threads call into the [`OperationAdapter`], which submits one
//! [`Request`] at a time through the [`Mailbox`] and blocks. The host thread, whenever
//! its own scheduler decides, runs the [`Dispatcher`] (usually via [`Bridge::poll`]),
//! which invokes the handler bound in the [`HandlerRegistry`] and completes the call.

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
#[cfg(all(feature = "fuse", target_os = "linux"))]
pub mod fuse;
pub mod mailbox;
pub mod notifier;
pub mod registry;
pub mod request;
pub mod session;
pub mod value;

pub use adapter::{FileKind, FileStat, OperationAdapter};
pub use bridge::Bridge;
pub use config::{BridgeConfig, CacheConfig, ConfigError, OpenPolicy};
pub use dispatcher::{dispatch, Dispatcher};
pub use error::{Errno, MailboxClosed, OpResult, StartError, UnknownOperation};
pub use mailbox::{Mailbox, PendingCall};
pub use notifier::{wake_channel, HostEvents, Notify, TickNotifier, WakeListener, WakeNotifier, WakeStrategy};
pub use registry::{handler_fn, Binding, Handler, HandlerRegistry};
pub use request::{Completion, NodeAttr, OpKind, Reply, Request, Response};
pub use session::{
    FilesystemInstance, KernelBackend, MountArgs, MountOpt, MountedSession, SessionHandle,
    SessionState, Unmount,
};
pub use value::{HostSignal, HostValue, FS_ERROR};
