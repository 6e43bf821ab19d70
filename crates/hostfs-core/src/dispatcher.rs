// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host-thread side of the bridge: resolve, marshal, invoke, answer

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Errno;
use crate::mailbox::Mailbox;
use crate::registry::{Binding, HandlerRegistry};
use crate::request::{Completion, NodeAttr, OpKind, Reply, Request, Response};
use crate::value::{HostSignal, HostValue};

const FILE_TAG: &str = "file";
const DIR_TAG: &str = "dir";

/// Runs at most one handler per invocation, on whichever thread owns the registry.
#[derive(Clone)]
pub struct Dispatcher {
    mailbox: Arc<Mailbox>,
}

impl Dispatcher {
    pub fn new(mailbox: Arc<Mailbox>) -> Self {
        Self { mailbox }
    }

    /// Service the pending request, if any. Returns whether a request was handled.
    pub fn poll_once(&self, registry: &mut HandlerRegistry) -> bool {
        let Some(call) = self.mailbox.poll() else {
            return false;
        };
        let response = dispatch(registry, call.request());
        debug!(
            target: "hostfs::dispatch",
            call_id = call.id(),
            response = ?response,
            "request dispatched"
        );
        call.complete(response);
        true
    }
}

/// Produce the response for `request` using the handlers currently bound in `registry`.
pub fn dispatch(registry: &mut HandlerRegistry, request: &Request) -> Response {
    let kind = request.kind();
    let handler = match registry.lookup(kind) {
        Binding::Bound(handler) => handler,
        Binding::Unimplemented => {
            debug!(target: "hostfs::dispatch", %kind, "no handler bound");
            return Response::Unimplemented;
        }
    };

    let args = match marshal_args(request) {
        Ok(args) => args,
        Err(errno) => {
            debug!(target: "hostfs::dispatch", %kind, request = ?request, "request not representable as host values");
            return Response::HostError(errno.raw());
        }
    };

    match handler.call(&args).and_then(|value| unmarshal_result(kind, value)) {
        Ok(reply) => Response::Success(reply),
        Err(signal) => match signal.posix_code() {
            Some(code) => Response::HostError(code),
            None => {
                warn!(
                    target: "hostfs::dispatch",
                    %kind,
                    identity = %signal.identity,
                    data = ?signal.data,
                    "handler raised an unrecognized error"
                );
                Response::UnknownFailure {
                    identity: signal.identity,
                }
            }
        },
    }
}

fn path_arg(path: &[u8]) -> Result<HostValue, Errno> {
    std::str::from_utf8(path)
        .map(HostValue::str)
        .map_err(|_| Errno::EINVAL)
}

fn int_arg(value: u64) -> Result<HostValue, Errno> {
    i64::try_from(value)
        .map(HostValue::Int)
        .map_err(|_| Errno::EINVAL)
}

fn marshal_args(request: &Request) -> Result<Vec<HostValue>, Errno> {
    Ok(match request {
        Request::Create { path }
        | Request::GetAttr { path }
        | Request::ReadDir { path }
        | Request::Open { path }
        | Request::Release { path }
        | Request::Unlink { path } => vec![path_arg(path)?],
        Request::Rename { from, to } => vec![path_arg(from)?, path_arg(to)?],
        Request::Read { path, offset, size } => vec![
            path_arg(path)?,
            int_arg(*offset)?,
            HostValue::Int(i64::from(*size)),
        ],
        Request::Write { path, data, offset } => vec![
            path_arg(path)?,
            HostValue::Bytes(data.clone()),
            int_arg(*offset)?,
        ],
        Request::Truncate { path, size } => vec![path_arg(path)?, int_arg(*size)?],
    })
}

fn expect_int(value: HostValue) -> Result<i64, HostSignal> {
    value
        .as_int()
        .ok_or_else(|| HostSignal::wrong_type("integerp", &value))
}

fn unmarshal_result(kind: OpKind, value: HostValue) -> Result<Reply, HostSignal> {
    Ok(match kind {
        OpKind::Create => Reply::Create(Completion::from_sign(expect_int(value)?)),
        OpKind::Rename => Reply::Rename(Completion::from_sign(expect_int(value)?)),
        OpKind::Truncate => Reply::Truncate(Completion::from_sign(expect_int(value)?)),
        OpKind::Unlink => Reply::Unlink(Completion::from_sign(expect_int(value)?)),
        OpKind::Write => Reply::Write(expect_int(value)?),
        OpKind::GetAttr => Reply::GetAttr(node_attr(value)?),
        OpKind::ReadDir => Reply::ReadDir(entry_names(value)?),
        OpKind::Open => Reply::Open {
            found: value == HostValue::Bool(true),
        },
        OpKind::Release => Reply::Release {
            found: value == HostValue::Bool(true),
        },
        OpKind::Read => Reply::Read(match value {
            HostValue::Nil => None,
            HostValue::Str(s) => Some(s.into_bytes()),
            HostValue::Bytes(b) => Some(b),
            other => return Err(HostSignal::wrong_type("stringp", &other)),
        }),
    })
}

fn node_attr(value: HostValue) -> Result<NodeAttr, HostSignal> {
    let items = match value {
        HostValue::Nil => return Ok(NodeAttr::NotFound),
        HostValue::Vector(items) => items,
        other => return Err(HostSignal::wrong_type("vectorp", &other)),
    };
    match items.as_slice() {
        [HostValue::Symbol(tag), size, ..] if tag == FILE_TAG => match size {
            HostValue::Int(n) if *n >= 0 => Ok(NodeAttr::File { size: *n as u64 }),
            other => Err(HostSignal::wrong_type("natnump", other)),
        },
        [HostValue::Symbol(tag), ..] if tag == DIR_TAG => Ok(NodeAttr::Directory),
        _ => Ok(NodeAttr::NotFound),
    }
}

// Either every element converts or the whole listing is rejected.
fn entry_names(value: HostValue) -> Result<Vec<Vec<u8>>, HostSignal> {
    match value {
        HostValue::Nil => Ok(Vec::new()),
        HostValue::Vector(items) => items
            .into_iter()
            .map(|item| match item {
                HostValue::Str(s) => Ok(s.into_bytes()),
                HostValue::Bytes(b) => Ok(b),
                other => Err(HostSignal::wrong_type("stringp", &other)),
            })
            .collect(),
        other => Err(HostSignal::wrong_type("sequencep", &other)),
    }
}
