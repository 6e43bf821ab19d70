// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Common helpers for integration tests
//!
//! [`ScriptedBackend`] stands in for the kernel: once mounted, its session thread runs
//! a script against the [`OperationAdapter`] exactly as FUSE worker threads would, then
//! idles until it is asked to unmount.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;
use hostfs_core::{
    Bridge, FilesystemInstance, KernelBackend, MountArgs, MountedSession, OperationAdapter,
    StartError, Unmount,
};

pub type Script = Box<dyn FnOnce(&OperationAdapter) + Send>;

/// A kernel backend that replays one script per mount.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<Vec<Script>>,
    adapter: Arc<Mutex<Option<OperationAdapter>>>,
    mounts: Arc<Mutex<Vec<MountArgs>>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the script the next mount will run.
    pub fn push_script<F>(&self, script: F)
    where
        F: FnOnce(&OperationAdapter) + Send + 'static,
    {
        self.scripts.lock().unwrap().push(Box::new(script));
    }

    /// The adapter handed to the most recent mount; it outlives the session.
    pub fn last_adapter(&self) -> Option<OperationAdapter> {
        self.adapter.lock().unwrap().clone()
    }

    pub fn mounts(&self) -> Vec<MountArgs> {
        self.mounts.lock().unwrap().clone()
    }
}

struct ScriptedSession {
    instance: FilesystemInstance,
    script: Option<Script>,
    detached: Arc<AtomicBool>,
}

struct Detach(Arc<AtomicBool>);

impl Unmount for Detach {
    fn unmount(&mut self) -> io::Result<()> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl MountedSession for ScriptedSession {
    fn unmounter(&mut self) -> Box<dyn Unmount> {
        Box::new(Detach(self.detached.clone()))
    }

    fn run(&mut self, exit: &AtomicBool) -> io::Result<()> {
        if let Some(script) = self.script.take() {
            script(&self.instance.adapter);
        }
        while !exit.load(Ordering::SeqCst) && !self.detached.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }
}

impl KernelBackend for ScriptedBackend {
    fn mount(
        &self,
        args: &MountArgs,
        instance: FilesystemInstance,
    ) -> Result<Box<dyn MountedSession>, StartError> {
        self.mounts.lock().unwrap().push(args.clone());
        *self.adapter.lock().unwrap() = Some(instance.adapter.clone());
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            (!scripts.is_empty()).then(|| scripts.remove(0))
        };
        Ok(Box::new(ScriptedSession {
            instance,
            script,
            detached: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// Poll `bridge` like a host loop would until `rx` yields a value.
pub fn serve_until<T>(bridge: &mut Bridge, rx: &chan::Receiver<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        bridge.poll();
        if let Ok(value) = rx.recv_timeout(Duration::from_millis(1)) {
            return value;
        }
        assert!(Instant::now() < deadline, "script did not finish in time");
    }
}
