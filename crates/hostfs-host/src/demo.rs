// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory tree served by the reference host
//!
//! Directories are implicit: a path is a directory when it is `/` or a prefix of some
//! file path. All state lives on the host thread behind `Rc<RefCell<_>>`.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use hostfs_core::{handler_fn, HandlerRegistry, HostSignal, HostValue, OpKind};

/// Largest file the tree will grow to through Write or Truncate.
pub const MAX_FILE_SIZE: usize = 1 << 30;

#[derive(Debug, Default)]
pub struct MemTree {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemTree {
    pub fn from_files<I, K, V>(files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        Self {
            files: files
                .into_iter()
                .map(|(path, content)| (path.into(), content.into()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contents(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    fn dir_prefix(path: &str) -> String {
        if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        let prefix = Self::dir_prefix(path);
        path == "/" || self.files.keys().any(|file| file.starts_with(&prefix))
    }

    fn parent_exists(&self, path: &str) -> bool {
        match path.rsplit_once('/') {
            Some(("", _)) => true,
            Some((parent, _)) => self.is_dir(parent),
            None => false,
        }
    }

    fn getattr(&self, path: &str) -> HostValue {
        if let Some(content) = self.files.get(path) {
            HostValue::Vector(vec![
                HostValue::symbol("file"),
                HostValue::Int(content.len() as i64),
            ])
        } else if self.is_dir(path) {
            HostValue::Vector(vec![HostValue::symbol("dir"), HostValue::Int(0)])
        } else {
            HostValue::Nil
        }
    }

    fn readdir(&self, path: &str) -> Result<HostValue, HostSignal> {
        if !self.is_dir(path) {
            let code = if self.files.contains_key(path) {
                libc::ENOTDIR
            } else {
                libc::ENOENT
            };
            return Err(HostSignal::errno(code));
        }
        let prefix = Self::dir_prefix(path);
        let children: BTreeSet<&str> = self
            .files
            .keys()
            .filter_map(|file| file.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap_or(rest))
            .collect();

        let mut names = vec![HostValue::str("."), HostValue::str("..")];
        names.extend(children.into_iter().map(HostValue::str));
        Ok(HostValue::Vector(names))
    }

    fn create(&mut self, path: &str) -> Result<HostValue, HostSignal> {
        if !self.parent_exists(path) {
            return Err(HostSignal::errno(libc::ENOENT));
        }
        if self.is_dir(path) {
            return Err(HostSignal::errno(libc::EISDIR));
        }
        self.files.entry(path.to_string()).or_default();
        Ok(HostValue::Int(0))
    }

    fn read(&self, path: &str, offset: usize, size: usize) -> HostValue {
        match self.files.get(path) {
            Some(content) => {
                let start = offset.min(content.len());
                let end = start.saturating_add(size).min(content.len());
                HostValue::Bytes(content[start..end].to_vec())
            }
            None => HostValue::Nil,
        }
    }

    fn write(&mut self, path: &str, data: &[u8], offset: usize) -> Result<HostValue, HostSignal> {
        let content = self
            .files
            .get_mut(path)
            .ok_or_else(|| HostSignal::errno(libc::ENOENT))?;
        let end = offset
            .checked_add(data.len())
            .ok_or_else(|| HostSignal::errno(libc::EFBIG))?;
        if content.len() < end {
            grow(content, end)?;
        }
        content[offset..end].copy_from_slice(data);
        Ok(HostValue::Int(data.len() as i64))
    }

    fn truncate(&mut self, path: &str, size: usize) -> Result<HostValue, HostSignal> {
        match self.files.get_mut(path) {
            Some(content) if size <= content.len() => content.truncate(size),
            Some(content) => grow(content, size)?,
            None => return Ok(HostValue::Int(-1)),
        }
        Ok(HostValue::Int(0))
    }

    fn unlink(&mut self, path: &str) -> HostValue {
        HostValue::Int(if self.files.remove(path).is_some() { 0 } else { -1 })
    }

    fn rename(&mut self, from: &str, to: &str) -> HostValue {
        if let Some(content) = self.files.remove(from) {
            self.files.insert(to.to_string(), content);
            return HostValue::Int(0);
        }

        let prefix = Self::dir_prefix(from);
        let moved: Vec<String> = self
            .files
            .keys()
            .filter(|file| file.starts_with(&prefix))
            .cloned()
            .collect();
        if moved.is_empty() {
            return HostValue::Int(-1);
        }
        for old in moved {
            if let Some(content) = self.files.remove(&old) {
                let renamed = format!("{}/{}", to.trim_end_matches('/'), &old[prefix.len()..]);
                self.files.insert(renamed, content);
            }
        }
        HostValue::Int(0)
    }
}

/// Zero-fill `content` up to `len` bytes, refusing sizes the tree will not hold.
fn grow(content: &mut Vec<u8>, len: usize) -> Result<(), HostSignal> {
    if len > MAX_FILE_SIZE {
        return Err(HostSignal::errno(libc::EFBIG));
    }
    content
        .try_reserve_exact(len.saturating_sub(content.len()))
        .map_err(|_| HostSignal::errno(libc::ENOMEM))?;
    content.resize(len, 0);
    Ok(())
}

fn str_arg(args: &[HostValue], index: usize) -> Result<&str, HostSignal> {
    match args.get(index) {
        Some(HostValue::Str(s)) => Ok(s),
        Some(other) => Err(HostSignal::wrong_type("stringp", other)),
        None => Err(HostSignal::wrong_type("stringp", &HostValue::Nil)),
    }
}

fn usize_arg(args: &[HostValue], index: usize) -> Result<usize, HostSignal> {
    match args.get(index) {
        Some(HostValue::Int(n)) => usize::try_from(*n).map_err(|_| HostSignal::errno(libc::EINVAL)),
        Some(other) => Err(HostSignal::wrong_type("natnump", other)),
        None => Err(HostSignal::wrong_type("natnump", &HostValue::Nil)),
    }
}

fn bytes_arg(args: &[HostValue], index: usize) -> Result<&[u8], HostSignal> {
    let value = args.get(index).unwrap_or(&HostValue::Nil);
    value
        .as_bytes()
        .ok_or_else(|| HostSignal::wrong_type("stringp", value))
}

/// Bind all ten operations to `tree`.
pub fn install(tree: &Rc<RefCell<MemTree>>, registry: &mut HandlerRegistry) {
    let t = tree.clone();
    registry.bind(
        OpKind::GetAttr,
        handler_fn(move |args| Ok(t.borrow().getattr(str_arg(args, 0)?))),
    );
    let t = tree.clone();
    registry.bind(
        OpKind::ReadDir,
        handler_fn(move |args| t.borrow().readdir(str_arg(args, 0)?)),
    );
    let t = tree.clone();
    registry.bind(
        OpKind::Open,
        handler_fn(move |args| {
            Ok(HostValue::Bool(t.borrow().files.contains_key(str_arg(args, 0)?)))
        }),
    );
    let t = tree.clone();
    registry.bind(
        OpKind::Release,
        handler_fn(move |args| {
            Ok(HostValue::Bool(t.borrow().files.contains_key(str_arg(args, 0)?)))
        }),
    );
    let t = tree.clone();
    registry.bind(
        OpKind::Read,
        handler_fn(move |args| {
            let path = str_arg(args, 0)?;
            Ok(t.borrow().read(path, usize_arg(args, 1)?, usize_arg(args, 2)?))
        }),
    );
    let t = tree.clone();
    registry.bind(
        OpKind::Write,
        handler_fn(move |args| {
            let path = str_arg(args, 0)?;
            t.borrow_mut().write(path, bytes_arg(args, 1)?, usize_arg(args, 2)?)
        }),
    );
    let t = tree.clone();
    registry.bind(
        OpKind::Create,
        handler_fn(move |args| t.borrow_mut().create(str_arg(args, 0)?)),
    );
    let t = tree.clone();
    registry.bind(
        OpKind::Truncate,
        handler_fn(move |args| {
            let path = str_arg(args, 0)?;
            t.borrow_mut().truncate(path, usize_arg(args, 1)?)
        }),
    );
    let t = tree.clone();
    registry.bind(
        OpKind::Unlink,
        handler_fn(move |args| Ok(t.borrow_mut().unlink(str_arg(args, 0)?))),
    );
    let t = tree.clone();
    registry.bind(
        OpKind::Rename,
        handler_fn(move |args| Ok(t.borrow_mut().rename(str_arg(args, 0)?, str_arg(args, 1)?))),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostfs_core::{dispatch, Completion, NodeAttr, Reply, Request, Response};

    fn served(files: &[(&str, &str)]) -> (Rc<RefCell<MemTree>>, HandlerRegistry) {
        let tree = Rc::new(RefCell::new(MemTree::from_files(
            files.iter().map(|(p, c)| (p.to_string(), c.as_bytes().to_vec())),
        )));
        let mut registry = HandlerRegistry::new();
        install(&tree, &mut registry);
        (tree, registry)
    }

    fn path(p: &str) -> Vec<u8> {
        p.as_bytes().to_vec()
    }

    #[test]
    fn every_operation_is_bound() {
        let (_tree, registry) = served(&[]);
        for kind in OpKind::ALL {
            assert!(registry.is_bound(kind), "{kind} should be bound");
        }
    }

    #[test]
    fn getattr_reports_files_and_implicit_directories() {
        let (_tree, mut registry) = served(&[("/a", "hello"), ("/d/e", "")]);
        let stat = |registry: &mut HandlerRegistry, p: &str| {
            dispatch(registry, &Request::GetAttr { path: path(p) })
        };
        assert_eq!(
            stat(&mut registry, "/a"),
            Response::Success(Reply::GetAttr(NodeAttr::File { size: 5 }))
        );
        assert_eq!(
            stat(&mut registry, "/"),
            Response::Success(Reply::GetAttr(NodeAttr::Directory))
        );
        assert_eq!(
            stat(&mut registry, "/d"),
            Response::Success(Reply::GetAttr(NodeAttr::Directory))
        );
        assert_eq!(
            stat(&mut registry, "/nope"),
            Response::Success(Reply::GetAttr(NodeAttr::NotFound))
        );
    }

    #[test]
    fn readdir_lists_immediate_children() {
        let (_tree, mut registry) = served(&[("/a", ""), ("/d/e", ""), ("/d/f/g", "")]);
        assert_eq!(
            dispatch(&mut registry, &Request::ReadDir { path: path("/") }),
            Response::Success(Reply::ReadDir(vec![path("."), path(".."), path("a"), path("d")]))
        );
        assert_eq!(
            dispatch(&mut registry, &Request::ReadDir { path: path("/d") }),
            Response::Success(Reply::ReadDir(vec![path("."), path(".."), path("e"), path("f")]))
        );
        assert_eq!(
            dispatch(&mut registry, &Request::ReadDir { path: path("/a") }),
            Response::HostError(libc::ENOTDIR)
        );
    }

    #[test]
    fn write_extends_and_read_slices() {
        let (tree, mut registry) = served(&[("/a", "hello")]);
        let written = dispatch(
            &mut registry,
            &Request::Write {
                path: path("/a"),
                data: b" world".to_vec(),
                offset: 5,
            },
        );
        assert_eq!(written, Response::Success(Reply::Write(6)));
        assert_eq!(tree.borrow().contents("/a"), Some(&b"hello world"[..]));

        let read = dispatch(
            &mut registry,
            &Request::Read {
                path: path("/a"),
                offset: 6,
                size: 100,
            },
        );
        assert_eq!(read, Response::Success(Reply::Read(Some(b"world".to_vec()))));

        let missing = dispatch(
            &mut registry,
            &Request::Read {
                path: path("/zz"),
                offset: 0,
                size: 1,
            },
        );
        assert_eq!(missing, Response::Success(Reply::Read(None)));

        let denied = dispatch(
            &mut registry,
            &Request::Write {
                path: path("/zz"),
                data: b"x".to_vec(),
                offset: 0,
            },
        );
        assert_eq!(denied, Response::HostError(libc::ENOENT));
    }

    #[test]
    fn create_truncate_rename_unlink() {
        let (tree, mut registry) = served(&[("/d/x", "abc")]);

        assert_eq!(
            dispatch(&mut registry, &Request::Create { path: path("/n") }),
            Response::Success(Reply::Create(Completion::Done))
        );
        assert_eq!(
            dispatch(&mut registry, &Request::Create { path: path("/missing/n") }),
            Response::HostError(libc::ENOENT)
        );
        assert_eq!(
            dispatch(
                &mut registry,
                &Request::Truncate {
                    path: path("/d/x"),
                    size: 1
                }
            ),
            Response::Success(Reply::Truncate(Completion::Done))
        );
        assert_eq!(
            dispatch(
                &mut registry,
                &Request::Rename {
                    from: path("/d"),
                    to: path("/e")
                }
            ),
            Response::Success(Reply::Rename(Completion::Done))
        );
        assert_eq!(tree.borrow().contents("/e/x"), Some(&b"a"[..]));
        assert_eq!(
            dispatch(&mut registry, &Request::Unlink { path: path("/e/x") }),
            Response::Success(Reply::Unlink(Completion::Done))
        );
        assert_eq!(
            dispatch(&mut registry, &Request::Unlink { path: path("/e/x") }),
            Response::Success(Reply::Unlink(Completion::Failed))
        );
        assert_eq!(tree.borrow().len(), 1);
    }

    #[test]
    fn oversized_files_are_refused_without_touching_content() {
        let (tree, mut registry) = served(&[("/a", "hello")]);

        let truncated = dispatch(
            &mut registry,
            &Request::Truncate {
                path: path("/a"),
                size: i64::MAX as u64,
            },
        );
        assert_eq!(truncated, Response::HostError(libc::EFBIG));

        let written = dispatch(
            &mut registry,
            &Request::Write {
                path: path("/a"),
                data: b"x".to_vec(),
                offset: MAX_FILE_SIZE as u64,
            },
        );
        assert_eq!(written, Response::HostError(libc::EFBIG));
        assert_eq!(tree.borrow().contents("/a"), Some(&b"hello"[..]));

        let shrunk = dispatch(
            &mut registry,
            &Request::Truncate {
                path: path("/a"),
                size: 2,
            },
        );
        assert_eq!(shrunk, Response::Success(Reply::Truncate(Completion::Done)));
        assert_eq!(tree.borrow().contents("/a"), Some(&b"he"[..]));
    }
}
