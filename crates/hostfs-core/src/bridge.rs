// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host-facing entry points: mount, poll, unmount
//!
//! A [`Bridge`] is owned by the host's cooperative thread together with the handler
//! registry, so it is not `Send`. Every call returns promptly except [`Bridge::mount`]
//! (waits for the init outcome) and [`Bridge::unmount`] (waits for the session thread,
//! servicing requests meanwhile).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::BridgeConfig;
use crate::dispatcher::Dispatcher;
use crate::error::StartError;
use crate::mailbox::Mailbox;
use crate::notifier::{wake_channel, HostEvents, Notify, TickNotifier, WakeListener, WakeStrategy};
use crate::registry::{Handler, HandlerRegistry};
use crate::request::OpKind;
use crate::session::{self, KernelBackend, SessionHandle, SessionState};

const UNMOUNT_WAIT: Duration = Duration::from_millis(5);

struct ActiveSession {
    handle: SessionHandle,
    dispatcher: Dispatcher,
}

pub struct Bridge {
    config: BridgeConfig,
    backend: Arc<dyn KernelBackend>,
    registry: HandlerRegistry,
    notifier: Arc<dyn Notify>,
    listener: WakeListener,
    session: Option<ActiveSession>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, backend: Arc<dyn KernelBackend>) -> Self {
        let (wake, listener) = wake_channel();
        let notifier: Arc<dyn Notify> = match config.wake {
            WakeStrategy::Tick { .. } => Arc::new(TickNotifier),
            WakeStrategy::Wake => Arc::new(wake),
        };
        Self {
            config,
            backend,
            registry: HandlerRegistry::new(),
            notifier,
            listener,
            session: None,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    pub fn bind<H>(&mut self, kind: OpKind, handler: H)
    where
        H: Handler + 'static,
    {
        self.registry.bind(kind, handler);
    }

    /// Channels the host loop should select on before calling [`Bridge::poll`].
    pub fn events(&self) -> HostEvents {
        HostEvents::new(self.config.wake, &self.listener)
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Unmounted, |active| active.handle.state())
    }

    pub fn is_mounted(&self) -> bool {
        self.state() == SessionState::Mounted
    }

    /// Mount at `mountpoint`, blocking until the session reports its init outcome.
    pub fn try_mount(&mut self, mountpoint: &Path) -> Result<(), StartError> {
        if let Some(active) = self.session.as_mut() {
            if !active.handle.is_finished() {
                return Err(StartError::AlreadyMounted);
            }
            active.handle.join();
            self.session = None;
        }

        let mailbox = Mailbox::new(self.notifier.clone());
        let handle = session::start(
            self.backend.clone(),
            mailbox.clone(),
            &self.config,
            mountpoint,
        )?;
        self.session = Some(ActiveSession {
            handle,
            dispatcher: Dispatcher::new(mailbox),
        });
        Ok(())
    }

    pub fn mount(&mut self, mountpoint: &Path) -> bool {
        match self.try_mount(mountpoint) {
            Ok(()) => true,
            Err(err) => {
                error!(
                    target: "hostfs::session",
                    mountpoint = %mountpoint.display(),
                    error = %err,
                    "mount failed"
                );
                false
            }
        }
    }

    /// Run at most one dispatch cycle. Returns whether the session is still mounted.
    pub fn poll(&mut self) -> bool {
        let Some(active) = self.session.as_mut() else {
            debug!(target: "hostfs::dispatch", "poll called but the loop is not running");
            return false;
        };
        active.dispatcher.poll_once(&mut self.registry);

        if active.handle.is_finished() {
            active.handle.join();
            self.session = None;
            info!(target: "hostfs::session", "session ended");
            return false;
        }
        active.handle.state() == SessionState::Mounted
    }

    /// Stop the session and wait for its thread to unwind. Requests that arrive
    /// meanwhile are still dispatched, so an in-flight round trip cannot stall the
    /// shutdown. Returns `false` when nothing was mounted.
    pub fn unmount(&mut self) -> bool {
        let Some(mut active) = self.session.take() else {
            debug!(target: "hostfs::session", "unmount called with no session");
            return false;
        };
        info!(
            target: "hostfs::session",
            mountpoint = %active.handle.mountpoint().display(),
            "unmounting"
        );
        active.handle.begin_stop();
        while !active.handle.is_finished() {
            if !active.dispatcher.poll_once(&mut self.registry) {
                self.listener.wait(UNMOUNT_WAIT);
            }
        }
        active.handle.join();
        self.listener.drain();
        true
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.unmount();
        }
    }
}
