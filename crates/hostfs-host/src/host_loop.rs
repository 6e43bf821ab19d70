// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Cooperative host loop: sleep on the bridge's event sources, poll once per wake-up

use crossbeam_channel as chan;
use tracing::{debug, info};

use hostfs_core::Bridge;

/// Drive `bridge` until the session ends or `shutdown` fires, then unmount.
pub fn run(bridge: &mut Bridge, shutdown: &chan::Receiver<()>) -> anyhow::Result<()> {
    let events = bridge.events();
    let mut polls: u64 = 0;

    loop {
        chan::select_biased! {
            recv(shutdown) -> _ => {
                info!(target: "hostfs::host", "shutdown requested");
                break;
            }
            recv(events.wake) -> _ => {}
            recv(events.tick) -> _ => {}
        }
        polls += 1;
        if !bridge.poll() {
            info!(target: "hostfs::host", "session is no longer mounted");
            break;
        }
    }

    debug!(target: "hostfs::host", polls, "leaving host loop");
    bridge.unmount();
    Ok(())
}
