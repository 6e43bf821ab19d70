// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Single-slot exchange between kernel worker threads and the host thread
//!
//! At most one request is in flight per mailbox. `submit` holds the flight lock for
//! the whole transaction (store request, notify, wait, take response), so a second
//! caller cannot even store its request until the first round trip has finished.
//! The host side never blocks: `poll` uses a try-lock and simply returns `None` when
//! contended, leaving the request for the next tick or wake.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};

use tracing::{debug, warn};

use crate::error::MailboxClosed;
use crate::notifier::Notify;
use crate::request::{Request, Response};

/// Identity reported when a taken call is dropped without a response.
pub const ABANDONED_CALL: &str = "abandoned-call";

enum Slot {
    Idle,
    Pending(Request),
    Dispatching,
    Ready(Response),
}

struct State {
    call_id: u64,
    slot: Slot,
    closed: bool,
}

pub struct Mailbox {
    flight: Mutex<()>,
    state: Mutex<State>,
    ready: Condvar,
    notifier: Arc<dyn Notify>,
}

impl Mailbox {
    pub fn new(notifier: Arc<dyn Notify>) -> Arc<Self> {
        Arc::new(Self {
            flight: Mutex::new(()),
            state: Mutex::new(State {
                call_id: 0,
                slot: Slot::Idle,
                closed: false,
            }),
            ready: Condvar::new(),
            notifier,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `request`, wake the host, and block until its response is delivered.
    ///
    /// Called from kernel-facing threads only; calling it on the host thread would
    /// wait for a dispatcher that can never run.
    pub fn submit(&self, request: Request) -> Result<Response, MailboxClosed> {
        let _flight = self.flight.lock().unwrap_or_else(PoisonError::into_inner);

        let call_id = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(MailboxClosed);
            }
            state.call_id += 1;
            debug!(
                target: "hostfs::mailbox",
                call_id = state.call_id,
                request = ?request,
                "request submitted"
            );
            state.slot = Slot::Pending(request);
            state.call_id
        };

        self.notifier.notify();

        let mut state = self.lock_state();
        loop {
            match std::mem::replace(&mut state.slot, Slot::Idle) {
                Slot::Ready(response) => {
                    debug!(target: "hostfs::mailbox", call_id, "response delivered");
                    return Ok(response);
                }
                Slot::Pending(_) if state.closed => {
                    debug!(target: "hostfs::mailbox", call_id, "mailbox closed before dispatch");
                    return Err(MailboxClosed);
                }
                other => state.slot = other,
            }
            state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take the pending request, if any, without blocking.
    pub fn poll(self: &Arc<Self>) -> Option<PendingCall> {
        let mut state = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return None,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        match std::mem::replace(&mut state.slot, Slot::Dispatching) {
            Slot::Pending(request) => Some(PendingCall {
                call_id: state.call_id,
                request,
                mailbox: Arc::clone(self),
                completed: false,
            }),
            other => {
                state.slot = other;
                None
            }
        }
    }

    /// Deliver the response for `call_id` and wake its submitter.
    ///
    /// Returns `false` (and drops `response`) when `call_id` is not the call
    /// currently being dispatched.
    pub fn complete(&self, call_id: u64, response: Response) -> bool {
        let mut state = self.lock_state();
        if state.call_id != call_id || !matches!(state.slot, Slot::Dispatching) {
            warn!(
                target: "hostfs::mailbox",
                call_id,
                current = state.call_id,
                "discarding stale response"
            );
            return false;
        }
        state.slot = Slot::Ready(response);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Refuse new submissions and fail a request the host has not picked up yet.
    ///
    /// A request already being dispatched still receives its response.
    pub fn close(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Whether a request is stored and waiting for the host.
    pub fn has_pending(&self) -> bool {
        matches!(self.lock_state().slot, Slot::Pending(_))
    }
}

/// A request taken by the host. Must be answered exactly once via [`PendingCall::complete`];
/// dropping it unanswered completes the call with an unknown failure.
#[must_use = "the submitting thread stays blocked until the call is completed"]
pub struct PendingCall {
    call_id: u64,
    request: Request,
    mailbox: Arc<Mailbox>,
    completed: bool,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.call_id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn complete(mut self, response: Response) {
        self.completed = true;
        self.mailbox.complete(self.call_id, response);
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.completed {
            warn!(
                target: "hostfs::mailbox",
                call_id = self.call_id,
                kind = %self.request.kind(),
                "pending call dropped without a response"
            );
            self.mailbox.complete(
                self.call_id,
                Response::UnknownFailure {
                    identity: ABANDONED_CALL.to_string(),
                },
            );
        }
    }
}
