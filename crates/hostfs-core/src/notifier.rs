// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Cross-thread prompts that make the host run its dispatcher
//!
//! Two strategies are supported. With [`WakeStrategy::Tick`] the host polls on a
//! fixed schedule and the mailbox does not signal anything. With
//! [`WakeStrategy::Wake`] every submit pushes a token into a single-slot channel
//! that the host's event loop selects on, so the dispatcher runs immediately.

use std::time::{Duration, Instant};

use crossbeam_channel as chan;
use serde::{Deserialize, Serialize};

const DEFAULT_TICK_MS: u64 = 20;

/// How the host learns that a request is pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WakeStrategy {
    /// Poll every `interval_ms`; latency is bounded by the interval.
    Tick {
        #[serde(default = "default_tick_ms")]
        interval_ms: u64,
    },
    /// Explicit wake on every submit.
    Wake,
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}

impl Default for WakeStrategy {
    fn default() -> Self {
        WakeStrategy::Tick {
            interval_ms: DEFAULT_TICK_MS,
        }
    }
}

/// Called by the submitting thread right after a request is stored.
///
/// Implementations must not block and must not call back into the mailbox.
pub trait Notify: Send + Sync {
    fn notify(&self);
}

/// Timer-polled strategy: nothing to signal.
#[derive(Debug, Default)]
pub struct TickNotifier;

impl Notify for TickNotifier {
    fn notify(&self) {}
}

/// Sending half of the wake channel.
#[derive(Clone, Debug)]
pub struct WakeNotifier {
    tx: chan::Sender<()>,
}

impl Notify for WakeNotifier {
    fn notify(&self) {
        // A full slot already guarantees the host will run once more.
        let _ = self.tx.try_send(());
    }
}

/// Receiving half of the wake channel, owned by the host thread.
#[derive(Clone, Debug)]
pub struct WakeListener {
    rx: chan::Receiver<()>,
}

impl WakeListener {
    /// Channel to hand to a `select!` in the host's event loop.
    pub fn receiver(&self) -> &chan::Receiver<()> {
        &self.rx
    }

    /// Wait up to `timeout` for a wake; `true` if one arrived.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// Drop any pending wake token.
    pub fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

/// Create a connected single-slot wake channel.
pub fn wake_channel() -> (WakeNotifier, WakeListener) {
    let (tx, rx) = chan::bounded(1);
    (WakeNotifier { tx }, WakeListener { rx })
}

/// Event sources the host's cooperative loop should select on.
pub struct HostEvents {
    /// Fires whenever a request is submitted (never fires under the tick strategy).
    pub wake: chan::Receiver<()>,
    /// Periodic poll schedule (never fires under the wake strategy).
    pub tick: chan::Receiver<Instant>,
}

impl HostEvents {
    pub(crate) fn new(strategy: WakeStrategy, listener: &WakeListener) -> Self {
        match strategy {
            WakeStrategy::Tick { interval_ms } => HostEvents {
                wake: chan::never(),
                tick: chan::tick(Duration::from_millis(interval_ms.max(1))),
            },
            WakeStrategy::Wake => HostEvents {
                wake: listener.receiver().clone(),
                tick: chan::never(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_channel_coalesces_to_one_token() {
        let (notifier, listener) = wake_channel();
        notifier.notify();
        notifier.notify();
        notifier.notify();
        assert!(listener.wait(Duration::from_millis(10)));
        assert!(!listener.wait(Duration::from_millis(10)));
    }

    #[test]
    fn wake_strategy_deserializes_from_tagged_json() {
        let tick: WakeStrategy = serde_json::from_str(r#"{"mode":"tick","interval_ms":5}"#)
            .expect("tick strategy");
        assert_eq!(tick, WakeStrategy::Tick { interval_ms: 5 });

        let tick: WakeStrategy =
            serde_json::from_str(r#"{"mode":"tick"}"#).expect("tick with default interval");
        assert_eq!(tick, WakeStrategy::default());

        let wake: WakeStrategy = serde_json::from_str(r#"{"mode":"wake"}"#).expect("wake");
        assert_eq!(wake, WakeStrategy::Wake);
    }

    #[test]
    fn host_events_follow_strategy() {
        let (notifier, listener) = wake_channel();
        let events = HostEvents::new(WakeStrategy::Wake, &listener);
        notifier.notify();
        assert!(events.wake.recv_timeout(Duration::from_millis(50)).is_ok());
        assert!(events.tick.recv_timeout(Duration::from_millis(10)).is_err());

        let events = HostEvents::new(WakeStrategy::Tick { interval_ms: 1 }, &listener);
        assert!(events.tick.recv_timeout(Duration::from_millis(200)).is_ok());
    }
}
