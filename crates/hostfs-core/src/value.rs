// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host-native values exchanged with registered handlers
//!
//! Handlers are loosely typed: they receive a slice of [`HostValue`] arguments and
//! return a single value, or raise a [`HostSignal`]. The dispatcher owns all
//! conversion between these values and the typed request/response model.

use std::fmt;

/// Identity of the error a handler raises to report a specific POSIX code.
pub const FS_ERROR: &str = "fs-error";

/// Identity used when a handler returns a value of the wrong shape.
pub const WRONG_TYPE_ARGUMENT: &str = "wrong-type-argument";

/// A dynamically typed value as seen by the host runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    Symbol(String),
    Vector(Vec<HostValue>),
}

impl HostValue {
    pub fn symbol(name: impl Into<String>) -> Self {
        HostValue::Symbol(name.into())
    }

    pub fn str(value: impl Into<String>) -> Self {
        HostValue::Str(value.into())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HostValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            HostValue::Symbol(name) => Some(name),
            _ => None,
        }
    }

    /// String-like payload: host strings and raw byte strings both qualify.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            HostValue::Str(s) => Some(s.as_bytes()),
            HostValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Nil => "nil",
            HostValue::Bool(_) => "boolean",
            HostValue::Int(_) => "integer",
            HostValue::Str(_) => "string",
            HostValue::Bytes(_) => "byte-string",
            HostValue::Symbol(_) => "symbol",
            HostValue::Vector(_) => "vector",
        }
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        HostValue::Int(value)
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::Str(value.to_string())
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(value: Vec<u8>) -> Self {
        HostValue::Bytes(value)
    }
}

/// An error raised by a handler: an identity plus arbitrary payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostSignal {
    pub identity: String,
    pub data: Vec<HostValue>,
}

impl HostSignal {
    pub fn new(identity: impl Into<String>, data: Vec<HostValue>) -> Self {
        Self {
            identity: identity.into(),
            data,
        }
    }

    /// Raise the distinguished `fs-error` carrying an explicit POSIX error number.
    pub fn errno(code: i32) -> Self {
        Self::new(FS_ERROR, vec![HostValue::Int(code as i64)])
    }

    pub fn wrong_type(expected: &str, got: &HostValue) -> Self {
        Self::new(
            WRONG_TYPE_ARGUMENT,
            vec![HostValue::symbol(expected), got.clone()],
        )
    }

    /// The POSIX code if this signal has the explicit `fs-error` shape.
    pub fn posix_code(&self) -> Option<i32> {
        if self.identity != FS_ERROR {
            return None;
        }
        match self.data.as_slice() {
            [HostValue::Int(code)] if *code > 0 && *code <= i32::MAX as i64 => Some(*code as i32),
            _ => None,
        }
    }
}

impl fmt::Display for HostSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.identity)?;
        for value in &self.data {
            write!(f, " {value:?}")?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for HostSignal {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_signal_has_recognized_shape() {
        assert_eq!(HostSignal::errno(13).posix_code(), Some(13));
    }

    #[test]
    fn other_shapes_are_opaque() {
        assert_eq!(HostSignal::new("file-missing", vec![HostValue::Int(13)]).posix_code(), None);
        assert_eq!(HostSignal::new(FS_ERROR, vec![]).posix_code(), None);
        assert_eq!(HostSignal::new(FS_ERROR, vec!["13".into()]).posix_code(), None);
        assert_eq!(HostSignal::errno(0).posix_code(), None);
        assert_eq!(HostSignal::errno(-5).posix_code(), None);
    }

    #[test]
    fn string_like_values_expose_bytes() {
        assert_eq!(HostValue::str("abc").as_bytes(), Some(&b"abc"[..]));
        assert_eq!(HostValue::Bytes(vec![0, 1]).as_bytes(), Some(&[0u8, 1][..]));
        assert_eq!(HostValue::Nil.as_bytes(), None);
    }
}
