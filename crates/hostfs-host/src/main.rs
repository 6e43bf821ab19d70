// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! hostfs reference host
//!
//! Mounts an in-memory tree and serves it from a single cooperative thread. The tree
//! is seeded from the `files` table of the JSON configuration.

#[cfg_attr(not(all(feature = "fuse", target_os = "linux")), allow(dead_code))]
mod demo;
#[cfg_attr(not(all(feature = "fuse", target_os = "linux")), allow(dead_code))]
mod host_loop;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hostfs_core::{BridgeConfig, OpenPolicy, WakeStrategy};
use hostfs_logging::CliLoggingArgs;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "hostfs-host", version, about = "Serve an in-memory tree through hostfs")]
struct Args {
    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,

    /// Let open(2) reach the host for any access mode
    #[arg(long)]
    writable: bool,

    /// Poll when a request arrives instead of on a fixed schedule
    #[arg(long, conflicts_with = "tick_ms")]
    wake: bool,

    /// Poll interval in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct HostConfig {
    #[serde(flatten)]
    bridge: BridgeConfig,
    /// Initial file contents keyed by absolute path.
    files: BTreeMap<String, String>,
}

fn load_config(config_path: Option<PathBuf>) -> Result<HostConfig> {
    match config_path {
        Some(path) => {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: HostConfig = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        }
        None => Ok(HostConfig::default()),
    }
}

impl Args {
    /// Command-line flags win over the environment, which wins over the file.
    fn apply(&self, config: &mut BridgeConfig) -> Result<()> {
        config.apply_env()?;
        if let Some(interval_ms) = self.tick_ms {
            config.wake = WakeStrategy::Tick { interval_ms };
        }
        if self.wake {
            config.wake = WakeStrategy::Wake;
        }
        if self.writable {
            config.open_policy = OpenPolicy::PassThrough;
        }
        if self.allow_other {
            config.mount_options.push("allow_other".to_string());
        }
        if self.auto_unmount {
            config.mount_options.push("auto_unmount".to_string());
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    args.logging.init("hostfs")?;

    info!(target: "hostfs::host", mount_point = %args.mount_point.display(), "starting hostfs host");

    let mut config = load_config(args.config.clone())?;
    args.apply(&mut config.bridge)?;
    info!(target: "hostfs::host", bridge = ?config.bridge, files = config.files.len(), "configuration loaded");

    #[cfg(all(feature = "fuse", target_os = "linux"))]
    {
        use std::cell::RefCell;
        use std::rc::Rc;
        use std::sync::Arc;

        use crossbeam_channel as chan;
        use hostfs_core::fuse::FuserBackend;
        use hostfs_core::Bridge;

        let tree = Rc::new(RefCell::new(demo::MemTree::from_files(
            config.files.into_iter().map(|(path, content)| (path, content.into_bytes())),
        )));
        let mut bridge = Bridge::new(config.bridge, Arc::new(FuserBackend));
        demo::install(&tree, bridge.registry_mut());

        let (shutdown_tx, shutdown_rx) = chan::bounded(1);
        ctrlc::set_handler(move || {
            let _ = shutdown_tx.try_send(());
        })
        .context("installing signal handler")?;

        bridge
            .try_mount(&args.mount_point)
            .with_context(|| format!("mounting {}", args.mount_point.display()))?;
        info!(target: "hostfs::host", "mounted; serving until unmount or Ctrl-C");
        host_loop::run(&mut bridge, &shutdown_rx)?;
        info!(target: "hostfs::host", files = tree.borrow().len(), "unmounted");
    }

    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    {
        warn!(target: "hostfs::host", "FUSE support not compiled in; nothing will be mounted");
        let tree = demo::MemTree::from_files(
            config.files.into_iter().map(|(path, content)| (path, content.into_bytes())),
        );
        info!(target: "hostfs::host", files = tree.len(), "configuration is valid");
        info!(target: "hostfs::host", "to mount, build with: cargo build --features fuse");
    }

    Ok(())
}
