// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host-owned table of operation handlers
//!
//! The registry lives on the host thread only (it is deliberately `!Send`) and may be
//! rebound freely between polls. A missing entry is reported as
//! [`Binding::Unimplemented`] rather than an absent value.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::UnknownOperation;
use crate::request::OpKind;
use crate::value::{HostSignal, HostValue};

/// A host procedure implementing one operation kind.
pub trait Handler {
    fn call(&mut self, args: &[HostValue]) -> Result<HostValue, HostSignal>;
}

impl<F> Handler for F
where
    F: FnMut(&[HostValue]) -> Result<HostValue, HostSignal>,
{
    fn call(&mut self, args: &[HostValue]) -> Result<HostValue, HostSignal> {
        self(args)
    }
}

/// Pins a closure to the handler signature so its argument and error types are inferred.
pub fn handler_fn<F>(f: F) -> F
where
    F: FnMut(&[HostValue]) -> Result<HostValue, HostSignal>,
{
    f
}

/// Result of resolving an operation kind against the registry.
pub enum Binding<'a> {
    Bound(&'a mut dyn Handler),
    Unimplemented,
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<OpKind, Box<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `kind`, returning the handler it replaced.
    pub fn bind<H>(&mut self, kind: OpKind, handler: H) -> Option<Box<dyn Handler>>
    where
        H: Handler + 'static,
    {
        self.handlers.insert(kind, Box::new(handler))
    }

    /// Bind under the operation's well-known name (`"getattr"`, `"read"`, ...).
    pub fn bind_named<H>(&mut self, name: &str, handler: H) -> Result<(), UnknownOperation>
    where
        H: Handler + 'static,
    {
        let kind = name.parse::<OpKind>()?;
        self.bind(kind, handler);
        Ok(())
    }

    pub fn unbind(&mut self, kind: OpKind) -> bool {
        self.handlers.remove(&kind).is_some()
    }

    pub fn is_bound(&self, kind: OpKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn bound_kinds(&self) -> impl Iterator<Item = OpKind> + '_ {
        self.handlers.keys().copied()
    }

    pub fn lookup(&mut self, kind: OpKind) -> Binding<'_> {
        match self.handlers.get_mut(&kind) {
            Some(handler) => Binding::Bound(handler.as_mut()),
            None => Binding::Unimplemented,
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.bound_kinds()).finish()
    }
}
