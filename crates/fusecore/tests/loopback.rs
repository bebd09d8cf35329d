mod common;

use common::{init_tracing, mount, mount_with};
use fusecore::{
    channel, Config, Driver, Errno, MemStore, NodeId, NodeKind, Operation, OperationTable, Reply,
    SetAttr,
};
use std::{collections::HashSet, sync::Arc, thread, time::Duration};

const RW: i32 = libc::O_RDWR;

#[test]
fn lookup_missing_name() {
    init_tracing();
    mount(|client, _| {
        assert_eq!(
            client.lookup(NodeId::ROOT, "missing").err(),
            Some(Errno::NotFound)
        );
    });
}

#[test]
fn write_then_read_back() {
    init_tracing();
    mount(|client, _| {
        let (attr, fh) = client.create(NodeId::ROOT, "hello.txt", 0o644, RW).unwrap();
        assert_eq!(attr.kind, NodeKind::File);

        assert_eq!(client.write(fh, 0, &b"Hello, world!\n"[..]).unwrap(), 14);
        assert_eq!(client.read(fh, 0, 1024).unwrap(), b"Hello, world!\n");
        assert_eq!(client.read(fh, 7, 5).unwrap(), b"world");
        assert!(client.read(fh, 4096, 16).unwrap().is_empty());
        assert_eq!(client.getattr(attr.id).unwrap().size, 14);
        client.release(fh).unwrap();
    });
}

#[test]
fn released_handle_is_invalid() {
    init_tracing();
    mount(|client, driver| {
        let (_, fh) = client.create(NodeId::ROOT, "f", 0o644, RW).unwrap();
        client.release(fh).unwrap();

        assert_eq!(client.read(fh, 0, 16).err(), Some(Errno::InvalidHandle));
        assert_eq!(client.release(fh).err(), Some(Errno::InvalidHandle));
        assert!(driver.handles().is_empty());
    });
}

#[test]
fn double_release_leaves_others_intact() {
    init_tracing();
    mount(|client, _| {
        let (attr, a) = client.create(NodeId::ROOT, "f", 0o644, RW).unwrap();
        let b = client.open(attr.id, libc::O_RDONLY).unwrap();
        client.release(a).unwrap();
        assert_eq!(client.release(a).err(), Some(Errno::InvalidHandle));
        assert!(client.read(b, 0, 1).is_ok());
    });
}

#[test]
fn rename_moves_identity() {
    init_tracing();
    mount(|client, _| {
        let dir = client.mkdir(NodeId::ROOT, "dir", 0o755).unwrap();
        let (attr, fh) = client.create(NodeId::ROOT, "a", 0o644, RW).unwrap();
        client.release(fh).unwrap();
        // warm up the resolution cache.
        client.lookup(NodeId::ROOT, "a").unwrap();

        client.rename(NodeId::ROOT, "a", dir.id, "b", 0).unwrap();
        assert_eq!(
            client.lookup(NodeId::ROOT, "a").err(),
            Some(Errno::NotFound)
        );
        assert_eq!(client.lookup(dir.id, "b").unwrap().id, attr.id);
    });
}

#[test]
fn rename_over_non_empty_directory() {
    init_tracing();
    mount(|client, _| {
        client.mkdir(NodeId::ROOT, "src", 0o755).unwrap();
        let dst = client.mkdir(NodeId::ROOT, "dst", 0o755).unwrap();
        client.mkdir(dst.id, "inner", 0o755).unwrap();

        assert_eq!(
            client.rename(NodeId::ROOT, "src", NodeId::ROOT, "dst", 0).err(),
            Some(Errno::NotEmpty)
        );
        client.rmdir(dst.id, "inner").unwrap();
        client.rename(NodeId::ROOT, "src", NodeId::ROOT, "dst", 0).unwrap();
    });
}

#[test]
fn create_then_list_once() {
    init_tracing();
    mount(|client, _| {
        client.create(NodeId::ROOT, "only", 0o644, RW).unwrap();
        let names: Vec<_> = client
            .list(NodeId::ROOT)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [".", "..", "only"]);
    });
}

#[test]
fn concurrent_create_same_name() {
    init_tracing();
    let store = MemStore::new().latency(Duration::from_millis(2));
    mount_with(
        store,
        Config::default(),
        OperationTable::default(),
        |client, _| {
            let results: Vec<_> = thread::scope(|scope| {
                let workers: Vec<_> = (0..8)
                    .map(|_| {
                        let client = client.clone();
                        scope.spawn(move || client.create(NodeId::ROOT, "race", 0o644, RW))
                    })
                    .collect();
                workers.into_iter().map(|w| w.join().unwrap()).collect()
            });

            let created = results.iter().filter(|r| r.is_ok()).count();
            let exists = results
                .iter()
                .filter(|r| r.as_ref().err() == Some(&Errno::AlreadyExists))
                .count();
            assert_eq!(created, 1);
            assert_eq!(exists, 7);

            let listing = client.list(NodeId::ROOT).unwrap();
            assert_eq!(listing.iter().filter(|e| e.name == "race").count(), 1);
        },
    );
}

#[test]
fn concurrent_lookups_and_unlink_agree() {
    init_tracing();
    mount(|client, _| {
        for i in 0..16 {
            client
                .create(NodeId::ROOT, format!("f{}", i), 0o644, RW)
                .unwrap();
        }

        thread::scope(|scope| {
            for i in 0..16 {
                let client = client.clone();
                scope.spawn(move || {
                    let name = format!("f{}", i);
                    client.lookup(NodeId::ROOT, &name).unwrap();
                    client.unlink(NodeId::ROOT, &name).unwrap();
                    assert_eq!(
                        client.lookup(NodeId::ROOT, &name).err(),
                        Some(Errno::NotFound)
                    );
                });
            }
        });

        assert_eq!(client.list(NodeId::ROOT).unwrap().len(), 2);
    });
}

#[test]
fn read_after_unlink_fails() {
    init_tracing();
    mount(|client, _| {
        let (_, fh) = client.create(NodeId::ROOT, "doomed", 0o644, RW).unwrap();
        client.write(fh, 0, &b"bytes"[..]).unwrap();
        client.unlink(NodeId::ROOT, "doomed").unwrap();

        assert_eq!(client.read(fh, 0, 5).err(), Some(Errno::InvalidHandle));
        assert_eq!(client.write(fh, 0, &b"x"[..]).err(), Some(Errno::InvalidHandle));
    });
}

#[test]
fn unlink_directory_and_rmdir_file() {
    init_tracing();
    mount(|client, _| {
        let dir = client.mkdir(NodeId::ROOT, "d", 0o755).unwrap();
        client.create(dir.id, "f", 0o644, RW).unwrap();

        assert_eq!(
            client.unlink(NodeId::ROOT, "d").err(),
            Some(Errno::IsADirectory)
        );
        assert_eq!(client.rmdir(NodeId::ROOT, "d").err(), Some(Errno::NotEmpty));
        assert_eq!(client.rmdir(dir.id, "f").err(), Some(Errno::NotADirectory));
    });
}

#[test]
fn mutations_touch_mtime() {
    init_tracing();
    mount(|client, _| {
        let before = client.getattr(NodeId::ROOT).unwrap().mtime;
        thread::sleep(Duration::from_millis(10));
        let (attr, fh) = client.create(NodeId::ROOT, "f", 0o644, RW).unwrap();
        let after = client.getattr(NodeId::ROOT).unwrap().mtime;
        assert!(after > before);

        thread::sleep(Duration::from_millis(10));
        client.write(fh, 0, &b"x"[..]).unwrap();
        assert!(client.getattr(attr.id).unwrap().mtime > attr.mtime);
    });
}

#[test]
fn truncate_through_setattr() {
    init_tracing();
    mount(|client, _| {
        let (attr, fh) = client.create(NodeId::ROOT, "f", 0o644, RW).unwrap();
        client.write(fh, 0, &b"0123456789"[..]).unwrap();

        let attr = client
            .setattr(
                attr.id,
                SetAttr {
                    size: Some(4),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(attr.size, 4);
        assert_eq!(client.read(fh, 0, 64).unwrap(), b"0123");
    });
}

#[test]
fn append_mode() {
    init_tracing();
    mount(|client, _| {
        let (attr, fh) = client.create(NodeId::ROOT, "log", 0o644, RW).unwrap();
        client.write(fh, 0, &b"one\n"[..]).unwrap();

        let app = client.open(attr.id, libc::O_WRONLY | libc::O_APPEND).unwrap();
        client.write(app, 0, &b"two\n"[..]).unwrap();
        assert_eq!(client.read(fh, 0, 64).unwrap(), b"one\ntwo\n");
    });
}

#[test]
fn permission_denied_for_other_users() {
    init_tracing();
    mount_with(
        MemStore::with_root_owner(1000, 1000),
        Config::default(),
        OperationTable::default(),
        |client, _| {
            let owner = client.credentials(1000, 1000);
            let other = client.credentials(2000, 2000);

            let (attr, _) = owner.create(NodeId::ROOT, "private", 0o600, RW).unwrap();
            assert_eq!(
                other.open(attr.id, libc::O_RDONLY).err(),
                Some(Errno::PermissionDenied)
            );
            assert_eq!(
                other.mkdir(NodeId::ROOT, "intruder", 0o755).err(),
                Some(Errno::PermissionDenied)
            );
            assert!(owner.open(attr.id, libc::O_RDONLY).is_ok());
        },
    );
}

#[test]
fn read_only_mount_rejects_mutations() {
    init_tracing();
    let mut config = Config::default();
    config.read_only(true);
    mount_with(
        MemStore::new(),
        config,
        OperationTable::default(),
        |client, _| {
            assert_eq!(
                client.mkdir(NodeId::ROOT, "d", 0o755).err(),
                Some(Errno::ReadOnly)
            );
            assert_eq!(
                client.create(NodeId::ROOT, "f", 0o644, RW).err(),
                Some(Errno::ReadOnly)
            );
            assert!(client.list(NodeId::ROOT).is_ok());
        },
    );
}

#[test]
fn store_capacity_is_reported() {
    init_tracing();
    mount_with(
        MemStore::new().capacity(16 * 4096),
        Config::default(),
        OperationTable::default(),
        |client, _| {
            let (_, fh) = client.create(NodeId::ROOT, "f", 0o644, RW).unwrap();
            client.write(fh, 0, vec![0u8; 4096]).unwrap();

            let st = client.statfs(NodeId::ROOT).unwrap();
            assert_eq!(st.blocks, 16);
            assert_eq!(st.bfree, 15);

            // a write crossing the limit is cut short.
            let n = client.write(fh, 4096, vec![1u8; 16 * 4096]).unwrap();
            assert_eq!(n, 15 * 4096);
            assert_eq!(client.write(fh, 16 * 4096, vec![2u8; 1]).err(), Some(Errno::NoSpace));
        },
    );
}

#[test]
fn interrupted_request_replies_eintr() {
    init_tracing();
    mount_with(
        MemStore::new().latency(Duration::from_millis(50)),
        Config::default(),
        OperationTable::default(),
        |client, driver| {
            let pending = client.submit(Operation::Create {
                parent: NodeId::ROOT,
                name: "slow".into(),
                mode: 0o644,
                flags: RW,
            });
            assert!(client.interrupt(pending.unique()));
            assert_eq!(pending.wait(), Reply::Error(Errno::Interrupted));

            // the backend call went through; only the reply was dropped.
            assert!(driver.handles().is_empty());
            assert!(client.lookup(NodeId::ROOT, "slow").is_ok());
        },
    );
}

#[test]
fn huge_offsets_are_rejected() {
    init_tracing();
    mount(|client, _| {
        let (attr, fh) = client.create(NodeId::ROOT, "f", 0o644, RW).unwrap();
        assert_eq!(
            client.write(fh, 1 << 46, &b"x"[..]).err(),
            Some(Errno::FileTooLarge)
        );

        let huge = SetAttr {
            size: Some(1 << 46),
            ..Default::default()
        };
        assert_eq!(
            client.setattr(attr.id, huge).err(),
            Some(Errno::FileTooLarge)
        );

        assert_eq!(client.write(fh, 0, &b"ok"[..]).unwrap(), 2);
        assert_eq!(client.getattr(attr.id).unwrap().size, 2);
        client.release(fh).unwrap();
    });
}

#[test]
fn stale_cache_entry_is_revalidated() {
    init_tracing();
    let mut config = Config::default();
    config.lease(Duration::from_secs(60));
    mount_with(
        MemStore::new(),
        config,
        OperationTable::default(),
        |client, driver| {
            let (old, _) = client.create(NodeId::ROOT, "f", 0o644, RW).unwrap();

            // replace the file behind the driver's back.
            let store = driver.backend();
            fusecore::Backend::remove_child(store, NodeId::ROOT, "f".as_ref(), false).unwrap();
            let new = fusecore::Backend::create_child(
                store,
                NodeId::ROOT,
                "f".as_ref(),
                &fusecore::NewNode::new(NodeKind::File, 0o644, 0, 0),
            )
            .unwrap();

            assert_ne!(old.id, new.id);
            assert_eq!(client.lookup(NodeId::ROOT, "f").unwrap().id, new.id);
        },
    );
}

#[test]
fn forget_drops_references() {
    init_tracing();
    mount(|client, driver| {
        let dir = client.mkdir(NodeId::ROOT, "d", 0o755).unwrap();
        client.lookup(NodeId::ROOT, "d").unwrap();
        assert_eq!(driver.resolver().lookup_count(dir.id), 2);

        client.forget(dir.id, 2);
        assert_eq!(driver.resolver().lookup_count(dir.id), 0);
        assert_eq!(driver.resolver().cached(NodeId::ROOT, "d".as_ref()), None);
    });
}

#[test]
fn symlink_and_hard_link() {
    init_tracing();
    mount(|client, _| {
        let (attr, _) = client.create(NodeId::ROOT, "target", 0o644, RW).unwrap();
        let link = client.symlink(NodeId::ROOT, "sym", "target").unwrap();
        assert_eq!(client.readlink(link.id).unwrap(), b"target");

        let hard = client.link(attr.id, NodeId::ROOT, "hard").unwrap();
        assert_eq!(hard.id, attr.id);
        assert_eq!(hard.nlink, 2);

        let names: HashSet<_> = client
            .list(NodeId::ROOT)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names.len(), 5);
    });
}

#[test]
fn dropped_client_is_an_unclean_exit() {
    init_tracing();
    let (transport, client) = channel::pair();
    let driver = Arc::new(Driver::new(MemStore::new(), Config::default()));
    let table = OperationTable::default();

    let status = thread::scope(|scope| {
        let server = scope.spawn(|| fusecore::main(&[], &table, &driver, transport));
        client.mkdir(NodeId::ROOT, "d", 0o755).unwrap();
        drop(client);
        server.join().unwrap()
    });
    assert_eq!(status, 1);
    assert!(driver.handles().is_empty());
}
