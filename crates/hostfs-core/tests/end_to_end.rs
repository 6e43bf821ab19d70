// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount, serve and unmount through [`Bridge`] with a scripted kernel side

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{serve_until, ScriptedBackend};
use crossbeam_channel as chan;
use hostfs_core::{
    handler_fn, Bridge, BridgeConfig, Errno, FileKind, HostSignal, HostValue, MountOpt, OpKind,
    OpResult, SessionState, StartError, WakeStrategy,
};

fn wake_config() -> BridgeConfig {
    BridgeConfig {
        wake: WakeStrategy::Wake,
        ..BridgeConfig::default()
    }
}

/// Host with GetAttr/Open/Read bound over a single file `/a` holding "hello".
fn hello_bridge(backend: Arc<ScriptedBackend>, config: BridgeConfig) -> Bridge {
    let mut bridge = Bridge::new(config, backend);
    bridge.bind(
        OpKind::GetAttr,
        handler_fn(|args| {
            Ok(match args.first() {
                Some(HostValue::Str(p)) if p == "/" => {
                    HostValue::Vector(vec![HostValue::symbol("dir"), HostValue::Int(0)])
                }
                Some(HostValue::Str(p)) if p == "/a" => {
                    HostValue::Vector(vec![HostValue::symbol("file"), HostValue::Int(5)])
                }
                _ => HostValue::Nil,
            })
        }),
    );
    bridge.bind(
        OpKind::Open,
        handler_fn(|args| Ok(HostValue::Bool(args.first() == Some(&HostValue::str("/a"))))),
    );
    bridge.bind(
        OpKind::Read,
        handler_fn(|args| match args {
            [HostValue::Str(p), HostValue::Int(offset), HostValue::Int(size)] if p == "/a" => {
                let data = b"hello";
                let start = (*offset as usize).min(data.len());
                let end = (start + *size as usize).min(data.len());
                Ok(HostValue::Bytes(data[start..end].to_vec()))
            }
            _ => Err(HostSignal::errno(libc::ENOENT)),
        }),
    );
    bridge
}

#[derive(Debug)]
struct Walkthrough {
    root: OpResult<(FileKind, u32)>,
    file: OpResult<(FileKind, u64)>,
    open: OpResult<()>,
    read: OpResult<Vec<u8>>,
    write: OpResult<u32>,
}

#[test]
fn stat_open_read_then_unimplemented_write() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let (tx, rx) = chan::bounded(1);
    backend.push_script(move |fs| {
        let root = fs.getattr(b"/").map(|stat| (stat.kind, stat.nlink));
        let file = fs.getattr(b"/a").map(|stat| (stat.kind, stat.size));
        let open = fs.open(b"/a", libc::O_RDONLY);
        let mut buf = [0u8; 16];
        let read = fs.read(b"/a", 0, &mut buf[..5]).map(|n| buf[..n].to_vec());
        let write = fs.write(b"/a", b"x", 0);
        tx.send(Walkthrough {
            root,
            file,
            open,
            read,
            write,
        })
        .unwrap();
    });

    let mut bridge = hello_bridge(backend.clone(), wake_config());
    bridge.try_mount(dir.path()).unwrap();
    assert_eq!(bridge.state(), SessionState::Mounted);

    let walk = serve_until(&mut bridge, &rx);
    assert_eq!(walk.root, Ok((FileKind::Directory, 2)));
    assert_eq!(walk.file, Ok((FileKind::RegularFile, 5)));
    assert_eq!(walk.open, Ok(()));
    assert_eq!(walk.read, Ok(b"hello".to_vec()));
    assert_eq!(walk.write, Err(Errno::ENOSYS));

    assert!(bridge.unmount());
    assert_eq!(bridge.state(), SessionState::Unmounted);
    assert!(!bridge.poll());
}

#[test]
fn write_access_is_refused_under_read_only_policy() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let (tx, rx) = chan::bounded(1);
    backend.push_script(move |fs| {
        tx.send([
            fs.open(b"/a", libc::O_WRONLY),
            fs.open(b"/a", libc::O_RDWR),
            fs.open(b"/missing", libc::O_RDONLY),
        ])
        .unwrap();
    });

    let mut bridge = hello_bridge(backend, wake_config());
    bridge.try_mount(dir.path()).unwrap();
    let outcomes = serve_until(&mut bridge, &rx);
    assert_eq!(
        outcomes,
        [Err(Errno::EACCES), Err(Errno::EACCES), Err(Errno::EACCES)]
    );
}

#[test]
fn second_mount_is_rejected_while_live() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let mut bridge = hello_bridge(backend.clone(), BridgeConfig::default());

    assert!(bridge.mount(dir.path()));
    assert!(matches!(
        bridge.try_mount(dir.path()),
        Err(StartError::AlreadyMounted)
    ));
    assert!(!bridge.mount(dir.path()));
    assert!(bridge.is_mounted());
    assert_eq!(backend.mounts().len(), 1);
}

#[test]
fn unmount_serves_the_call_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let (started_tx, started_rx) = chan::bounded(1);
    let (done_tx, done_rx) = chan::bounded(1);
    backend.push_script(move |fs| {
        started_tx.send(()).unwrap();
        done_tx.send(fs.getattr(b"/a").map(|stat| stat.size)).unwrap();
    });

    let mut bridge = hello_bridge(backend, wake_config());
    bridge.try_mount(dir.path()).unwrap();
    started_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(20));

    // No poll since the call was submitted: unmount itself has to answer it.
    assert!(bridge.unmount());
    assert_eq!(done_rx.recv().unwrap(), Ok(5));
    assert_eq!(bridge.state(), SessionState::Unmounted);
}

#[test]
fn adapter_reports_not_connected_after_unmount() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let mut bridge = hello_bridge(backend.clone(), wake_config());

    bridge.try_mount(dir.path()).unwrap();
    let adapter = backend.last_adapter().unwrap();
    assert!(bridge.unmount());

    assert_eq!(adapter.getattr(b"/a"), Err(Errno::ENOTCONN));
    assert_eq!(adapter.open(b"/a", libc::O_RDONLY), Err(Errno::ENOTCONN));
}

#[test]
fn handlers_can_be_rebound_between_polls() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let mut bridge = hello_bridge(backend.clone(), wake_config());
    // Declared after the bridge so a failed assertion releases the script before unmount.
    let (call_tx, call_rx) = chan::bounded::<()>(0);
    let (result_tx, result_rx) = chan::bounded(1);
    backend.push_script(move |fs| {
        for () in call_rx.iter() {
            result_tx.send(fs.unlink(b"/a")).unwrap();
        }
    });

    bridge.try_mount(dir.path()).unwrap();

    call_tx.send(()).unwrap();
    assert_eq!(serve_until(&mut bridge, &result_rx), Err(Errno::ENOSYS));

    bridge.bind(OpKind::Unlink, handler_fn(|_| Ok(HostValue::Int(0))));
    call_tx.send(()).unwrap();
    assert_eq!(serve_until(&mut bridge, &result_rx), Ok(()));

    bridge.bind(OpKind::Unlink, handler_fn(|_| Ok(HostValue::Int(-1))));
    call_tx.send(()).unwrap();
    assert_eq!(serve_until(&mut bridge, &result_rx), Err(Errno::ENOENT));

    drop(call_tx);
    assert!(bridge.unmount());
}

#[test]
fn remount_after_unmount_uses_a_fresh_session() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let mut config = wake_config();
    config.mount_options = vec!["fsname=hello,ro".to_string()];
    let mut bridge = hello_bridge(backend.clone(), config);

    for _ in 0..2 {
        let (tx, rx) = chan::bounded(1);
        backend.push_script(move |fs| tx.send(fs.getattr(b"/a").map(|s| s.size)).unwrap());
        bridge.try_mount(dir.path()).unwrap();
        assert_eq!(serve_until(&mut bridge, &rx), Ok(5));
        assert!(bridge.unmount());
    }

    let mounts = backend.mounts();
    assert_eq!(mounts.len(), 2);
    assert_eq!(
        mounts[0].options,
        vec![MountOpt::FsName("hello".to_string()), MountOpt::ReadOnly]
    );
}

#[test]
fn mount_on_missing_directory_fails_without_starting() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new();
    let mut bridge = hello_bridge(backend.clone(), wake_config());

    let missing = dir.path().join("nope");
    assert!(matches!(
        bridge.try_mount(&missing),
        Err(StartError::ArgParse(_))
    ));
    assert!(backend.mounts().is_empty());
    assert_eq!(bridge.state(), SessionState::Unmounted);
}
