/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! End-to-end tests of the layer and inode engine, running against a regular file standing in
//! for the device.

use layerfs::bmap::bmap_add;
use layerfs::bmap::bmap_lookup;
use layerfs::bmap::trunc_pages;
use layerfs::dir::dir_add;
use layerfs::dir::dir_lookup;
use layerfs::inode::get_inode;
use layerfs::inode::inode_alloc;
use layerfs::inode::inode_init;
use layerfs::inode::sync_inodes;
use layerfs::inode::Payload;
use layerfs::layout::encode_ino;
use layerfs::layout::BLOCK_SIZE;
use layerfs::layout::IBLOCK_MAX;
use layerfs::layout::INVALID_BLOCK;
use layerfs::layout::ROOT_INODE;
use layerfs::layout::START_BLOCK;
use layerfs::layout::START_INODE;
use layerfs::layout::SUPER_MAGIC;
use layerfs::layout::VERSION;
use layerfs::xattr::xattr_get;
use layerfs::xattr::xattr_set;
use std::ffi::OsStr;
use std::os::unix::fs::FileExt;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Barrier;
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Creates a sparse file of the given size to serve as the device.
fn new_device(size: u64) -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    file.as_file().set_len(size).unwrap();
    file
}

#[test]
fn fresh_mount_formats_device() {
    let dev = new_device(1 << 30);
    let gfs = layerfs::mount(dev.path()).unwrap();
    assert_eq!(gfs.sb.version, VERSION);
    assert_eq!(gfs.sb.magic, SUPER_MAGIC);
    assert_eq!(gfs.sb.tblocks, 262144);
    assert_eq!(gfs.sb.nblock.load(Relaxed), START_BLOCK);
    assert_eq!(gfs.sb.ninode.load(Relaxed), START_INODE);
    assert_eq!(gfs.sb.mounts, 0);

    let base = gfs.base();
    assert_eq!(base.gindex(), 0);
    assert_eq!(base.root(), ROOT_INODE);
    let root = get_inode(&gfs, &base, ROOT_INODE, None, false).unwrap();
    {
        let state = root.read();
        assert!(state.dinode.stat.is_dir());
        assert_eq!(state.dinode.stat.nlink, 2);
        assert_eq!(state.dinode.stat.mode & 0o7777, 0o755);
    }
    drop(root);
    layerfs::unmount(gfs).unwrap();
}

#[test]
fn remount_round_trip() {
    let dev = new_device(1 << 30);
    let file_ino;
    let dir_ino;
    let link_ino;
    {
        let gfs = layerfs::mount(dev.path()).unwrap();
        let base = gfs.base();

        let file = inode_init(
            &gfs,
            &base,
            libc::S_IFREG | 0o644,
            1000,
            1000,
            0,
            ROOT_INODE,
            None,
        )
        .unwrap();
        {
            let mut state = file.write();
            bmap_add(&mut state, 0, 100);
            bmap_add(&mut state, 1, 101);
            bmap_add(&mut state, 5, 200);
            state.dinode.stat.size = 6 * BLOCK_SIZE;
            xattr_set(&mut state, "user.digest", b"abc123").unwrap();
        }

        let dir = inode_init(
            &gfs,
            &base,
            libc::S_IFDIR | 0o755,
            0,
            0,
            0,
            ROOT_INODE,
            None,
        )
        .unwrap();
        {
            let mut state = dir.write();
            dir_add(&mut state, OsStr::new("file"), file.ino(), libc::S_IFREG);
        }

        let link = inode_init(
            &gfs,
            &base,
            libc::S_IFLNK | 0o777,
            0,
            0,
            0,
            ROOT_INODE,
            Some(OsStr::new("../some/target")),
        )
        .unwrap();

        let root = get_inode(&gfs, &base, ROOT_INODE, None, true).unwrap();
        {
            let mut state = root.write();
            dir_add(&mut state, OsStr::new("f"), file.ino(), libc::S_IFREG);
            dir_add(&mut state, OsStr::new("d"), dir.ino(), libc::S_IFDIR);
            dir_add(&mut state, OsStr::new("l"), link.ino(), libc::S_IFLNK);
        }

        file_ino = file.ino();
        dir_ino = dir.ino();
        link_ino = link.ino();

        let written = sync_inodes(&gfs, &base).unwrap();
        assert!(written >= 4);
        // A second sync has nothing left to write
        assert_eq!(sync_inodes(&gfs, &base).unwrap(), 0);

        drop(root);
        drop(file);
        drop(dir);
        drop(link);
        layerfs::unmount(gfs).unwrap();
    }
    {
        let gfs = layerfs::mount(dev.path()).unwrap();
        assert_eq!(gfs.sb.mounts, 1);
        let base = gfs.base();

        let file = get_inode(&gfs, &base, file_ino, None, false).unwrap();
        {
            let state = file.read();
            assert!(state.dinode.stat.is_reg());
            assert_eq!(state.dinode.stat.uid, 1000);
            assert_eq!(state.dinode.stat.size, 6 * BLOCK_SIZE);
            assert_eq!(state.dinode.stat.blocks, 3);
            assert_eq!(bmap_lookup(&state, 0), Some(100));
            assert_eq!(bmap_lookup(&state, 1), Some(101));
            assert_eq!(bmap_lookup(&state, 5), Some(200));
            assert_eq!(bmap_lookup(&state, 2), None);
            assert_eq!(xattr_get(&state, "user.digest").unwrap(), b"abc123");
        }

        let dir = get_inode(&gfs, &base, dir_ino, None, false).unwrap();
        {
            let state = dir.read();
            assert!(state.dinode.stat.is_dir());
            assert_eq!(dir_lookup(&state, OsStr::new("file")), Some(file_ino));
        }

        let link = get_inode(&gfs, &base, link_ino, None, false).unwrap();
        {
            let state = link.read();
            assert!(state.dinode.stat.is_lnk());
            match &state.payload {
                Payload::Symlink(target) => {
                    assert_eq!(target.as_os_str(), OsStr::new("../some/target"));
                }
                other => panic!("unexpected payload: {other:?}"),
            }
        }

        let root = get_inode(&gfs, &base, ROOT_INODE, None, false).unwrap();
        {
            let state = root.read();
            assert_eq!(dir_lookup(&state, OsStr::new("f")), Some(file_ino));
            assert_eq!(dir_lookup(&state, OsStr::new("d")), Some(dir_ino));
            assert_eq!(dir_lookup(&state, OsStr::new("l")), Some(link_ino));
        }

        drop(file);
        drop(dir);
        drop(link);
        drop(root);
        layerfs::unmount(gfs).unwrap();
    }
}

#[test]
fn snapshot_divergence() {
    let dev = new_device(1 << 30);
    let gfs = layerfs::mount(dev.path()).unwrap();
    let base = gfs.base();

    // A regular file with four contiguous content blocks
    let file = inode_init(
        &gfs,
        &base,
        libc::S_IFREG | 0o644,
        0,
        0,
        0,
        ROOT_INODE,
        None,
    )
    .unwrap();
    {
        let mut state = file.write();
        for i in 0..4 {
            bmap_add(&mut state, i, 100 + i);
        }
        state.dinode.stat.size = 4 * BLOCK_SIZE;
    }

    let layer = gfs.add_layer(inode_alloc(&gfs), 0).unwrap();
    let id = encode_ino(layer.gindex(), file.ino());
    let clone = get_inode(&gfs, &layer, id, None, true).unwrap();
    assert_eq!(clone.gindex(), layer.gindex());
    assert_eq!(clone.ino(), file.ino());
    {
        let state = clone.read();
        assert!(state.shared);
        match state.payload {
            Payload::Extent {
                block,
                length,
            } => {
                assert_eq!(block, 100);
                assert_eq!(length, 4);
            }
            ref other => panic!("unexpected payload: {other:?}"),
        }
        assert_eq!(state.dinode.stat, file.read().dinode.stat);
    }
    // The clone is cached in the new layer, not duplicated in the base
    assert!(layer.icache.lookup(file.ino()).is_some());
    assert!(!std::sync::Arc::ptr_eq(
        &base.icache.lookup(file.ino()).unwrap(),
        &clone
    ));
    assert!(gfs.clones.load(Relaxed) >= 1);

    // Truncating the clone unshares it without freeing the parent's blocks
    {
        let mut state = clone.write();
        let freed = trunc_pages(&mut state);
        assert_eq!(freed, 0);
        assert!(!state.shared);
        assert!(matches!(state.payload, Payload::Empty));
    }
    // The base layer's file is untouched
    {
        let state = file.read();
        assert_eq!(state.dinode.stat.blocks, 4);
        assert_eq!(bmap_lookup(&state, 3), Some(103));
    }

    drop(clone);
    drop(file);
    layerfs::unmount(gfs).unwrap();
}

#[test]
fn removed_in_child_masks_ancestor() {
    let dev = new_device(1 << 30);
    let gfs = layerfs::mount(dev.path()).unwrap();
    let base = gfs.base();

    let file = inode_init(
        &gfs,
        &base,
        libc::S_IFREG | 0o644,
        0,
        0,
        0,
        ROOT_INODE,
        None,
    )
    .unwrap();
    let file_ino = file.ino();

    let layer1 = gfs.add_layer(inode_alloc(&gfs), 0).unwrap();
    // Remove the file in layer 1: materialize it there, then mark it removed
    let id1 = encode_ino(layer1.gindex(), file_ino);
    let clone = get_inode(&gfs, &layer1, id1, None, true).unwrap();
    {
        let mut state = clone.write();
        state.removed = true;
        state.dirty = true;
    }

    let layer2 = gfs.add_layer(inode_alloc(&gfs), layer1.gindex()).unwrap();
    // The removal in layer 1 masks the base layer's file from layer 2
    let id2 = encode_ino(layer2.gindex(), file_ino);
    let err = get_inode(&gfs, &layer2, id2, None, false).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    // Lookup in layer 1 itself fails too
    let err = get_inode(&gfs, &layer1, id1, None, false).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    // The base layer still sees it
    assert!(get_inode(&gfs, &base, file_ino, None, false).is_ok());

    drop(clone);
    drop(file);
    layerfs::unmount(gfs).unwrap();
}

#[test]
fn tombstone_rewrite() {
    let dev = new_device(1 << 30);
    let file_ino;
    {
        let gfs = layerfs::mount(dev.path()).unwrap();
        let base = gfs.base();
        let file = inode_init(
            &gfs,
            &base,
            libc::S_IFREG | 0o644,
            0,
            0,
            0,
            ROOT_INODE,
            None,
        )
        .unwrap();
        file_ino = file.ino();
        drop(file);
        layerfs::unmount(gfs).unwrap();
    }

    // Locate the file's inode block through the index chain and clear its inode number,
    // simulating a corrupt inode
    let sb = layerfs::read_superblock(dev.path()).unwrap();
    let head = sb.inode_block.load(Relaxed);
    assert_ne!(head, INVALID_BLOCK);
    let raw = std::fs::read(dev.path()).unwrap();
    let islot = |raw: &[u8], k: usize| {
        let off = head as usize * BLOCK_SIZE as usize + k * 8;
        u64::from_ne_bytes(raw[off..off + 8].try_into().unwrap())
    };
    let mut slot = None;
    for k in 0..IBLOCK_MAX {
        let iblock = islot(&raw, k);
        if iblock == 0 {
            break;
        }
        if iblock == INVALID_BLOCK {
            continue;
        }
        let off = iblock as usize * BLOCK_SIZE as usize;
        let ino = u64::from_ne_bytes(raw[off..off + 8].try_into().unwrap());
        if ino == file_ino {
            slot = Some((k, iblock));
            break;
        }
    }
    let (k, iblock) = slot.expect("file inode not found on disk");
    let raw_dev = std::fs::OpenOptions::new()
        .write(true)
        .open(dev.path())
        .unwrap();
    raw_dev
        .write_all_at(&[0u8; 8], iblock * BLOCK_SIZE)
        .unwrap();
    drop(raw_dev);

    // Remounting tombstones the slot and rewrites the index block
    {
        let gfs = layerfs::mount(dev.path()).unwrap();
        let base = gfs.base();
        let err = get_inode(&gfs, &base, file_ino, None, false).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        layerfs::unmount(gfs).unwrap();
    }
    let raw = std::fs::read(dev.path()).unwrap();
    assert_eq!(islot(&raw, k), INVALID_BLOCK);
}

#[test]
fn concurrent_readers_one_writer() {
    let dev = new_device(1 << 30);
    let gfs = layerfs::mount(dev.path()).unwrap();
    let base = gfs.base();

    let file = inode_init(
        &gfs,
        &base,
        libc::S_IFREG | 0o644,
        1,
        0,
        0,
        ROOT_INODE,
        None,
    )
    .unwrap();
    {
        let mut state = file.write();
        state.dinode.stat.size = 1;
    }

    let barrier = Barrier::new(9);
    thread::scope(|s| {
        s.spawn(|| {
            let mut state = file.write();
            barrier.wait();
            // Readers must never observe uid updated without size
            state.dinode.stat.uid = 2;
            thread::sleep(Duration::from_millis(20));
            state.dinode.stat.size = 2;
        });
        for _ in 0..8 {
            s.spawn(|| {
                barrier.wait();
                let inode = get_inode(&gfs, &base, file.ino(), None, false).unwrap();
                let state = inode.read();
                let uid = state.dinode.stat.uid;
                let size = state.dinode.stat.size;
                assert!(
                    (uid == 1 && size == 1) || (uid == 2 && size == 2),
                    "partially updated stat: uid {uid} size {size}"
                );
            });
        }
    });

    drop(file);
    layerfs::unmount(gfs).unwrap();
}

#[test]
fn snapshot_teleport() {
    let dev = new_device(1 << 30);
    let gfs = layerfs::mount(dev.path()).unwrap();
    let base = gfs.base();

    // The directory under which snapshots appear
    let snap_dir = inode_init(
        &gfs,
        &base,
        libc::S_IFDIR | 0o755,
        0,
        0,
        0,
        ROOT_INODE,
        None,
    )
    .unwrap();
    {
        let root = get_inode(&gfs, &base, ROOT_INODE, None, true).unwrap();
        let mut state = root.write();
        dir_add(&mut state, OsStr::new("layers"), snap_dir.ino(), libc::S_IFDIR);
    }
    gfs.set_snap_root(snap_dir.ino()).unwrap();

    let r1 = inode_alloc(&gfs);
    let r2 = inode_alloc(&gfs);
    let r3 = inode_alloc(&gfs);
    let l1 = gfs.add_layer(r1, 0).unwrap();
    let l2 = gfs.add_layer(r2, 0).unwrap();
    let l3 = gfs.add_layer(r3, 0).unwrap();

    // A lookup under the snapshot root lands in the matching layer
    assert_eq!(gfs.get_index(&base, snap_dir.ino(), r2), l2.gindex());
    assert_eq!(gfs.get_index(&base, snap_dir.ino(), r3), l3.gindex());
    // Elsewhere, the current layer wins
    assert_eq!(gfs.get_index(&base, ROOT_INODE, r2), 0);
    assert_eq!(gfs.get_index(&l1, snap_dir.ino(), r2), l1.gindex());

    drop(snap_dir);
    layerfs::unmount(gfs).unwrap();
}

#[test]
fn registry_invariants() {
    let dev = new_device(1 << 30);
    let gfs = layerfs::mount(dev.path()).unwrap();

    let l1 = gfs.add_layer(inode_alloc(&gfs), 0).unwrap();
    let l2 = gfs.add_layer(inode_alloc(&gfs), 0).unwrap();
    let l3 = gfs.add_layer(inode_alloc(&gfs), l2.gindex()).unwrap();

    for i in 0..=gfs.snap_count() as u32 {
        let Some(fs) = gfs.layer_at(i) else {
            continue;
        };
        assert_eq!(fs.gindex(), i);
        assert_eq!(gfs.layer_root(i), fs.root());
        // Every cached inode belongs to the layer caching it
        for bucket in fs.icache.buckets() {
            for inode in bucket.read().iter() {
                assert_eq!(inode.gindex(), i);
            }
        }
    }
    assert_eq!(gfs.snap_count(), 3);

    // Removing a leaf layer frees its slot for reuse
    let l1_index = l1.gindex();
    gfs.remove_layer(l3.gindex()).unwrap();
    gfs.remove_layer(l1_index).unwrap();
    assert!(gfs.layer_at(l1_index).is_none());
    let l4 = gfs.add_layer(inode_alloc(&gfs), 0).unwrap();
    assert_eq!(l4.gindex(), l1_index);
    assert_eq!(gfs.layer_root(l2.gindex()), l2.root());

    layerfs::unmount(gfs).unwrap();
}

#[test]
fn special_dir_discovery() {
    let dev = new_device(1 << 30);
    let gfs = layerfs::mount(dev.path()).unwrap();
    let base = gfs.base();

    // Without the layer database directories, discovery fails
    let err = gfs.setup_special_dir().unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));

    // Build image/layerfs/layerdb/{mounts,sha256}
    let mut parent = ROOT_INODE;
    for name in ["image", "layerfs", "layerdb"] {
        let dir = inode_init(&gfs, &base, libc::S_IFDIR | 0o755, 0, 0, 0, parent, None).unwrap();
        let pinode = get_inode(&gfs, &base, parent, None, true).unwrap();
        {
            let mut state = pinode.write();
            dir_add(&mut state, OsStr::new(name), dir.ino(), libc::S_IFDIR);
        }
        parent = dir.ino();
    }
    let layerdb = get_inode(&gfs, &base, parent, None, true).unwrap();
    let mounts = inode_init(&gfs, &base, libc::S_IFDIR | 0o755, 0, 0, 0, parent, None).unwrap();
    let sha256 = inode_init(&gfs, &base, libc::S_IFDIR | 0o755, 0, 0, 0, parent, None).unwrap();
    {
        let mut state = layerdb.write();
        dir_add(&mut state, OsStr::new("mounts"), mounts.ino(), libc::S_IFDIR);
        dir_add(&mut state, OsStr::new("sha256"), sha256.ino(), libc::S_IFDIR);
    }

    gfs.setup_special_dir().unwrap();
    assert_eq!(gfs.mounts_root(), mounts.ino());
    assert_eq!(gfs.sha256_root(), sha256.ino());

    drop(layerdb);
    drop(mounts);
    drop(sha256);
    layerfs::unmount(gfs).unwrap();
}

#[test]
fn snapshot_sees_parent_tree() {
    let dev = new_device(1 << 30);
    let gfs = layerfs::mount(dev.path()).unwrap();
    let base = gfs.base();

    let file = inode_init(
        &gfs,
        &base,
        libc::S_IFREG | 0o644,
        0,
        0,
        0,
        ROOT_INODE,
        None,
    )
    .unwrap();
    {
        let root = get_inode(&gfs, &base, ROOT_INODE, None, true).unwrap();
        let mut state = root.write();
        dir_add(&mut state, OsStr::new("app"), file.ino(), libc::S_IFREG);
    }

    let layer = gfs.add_layer(inode_alloc(&gfs), 0).unwrap();
    // The snapshot's root shares the base root's entries
    let sroot = get_inode(
        &gfs,
        &layer,
        encode_ino(layer.gindex(), layer.root()),
        None,
        false,
    )
    .unwrap();
    {
        let state = sroot.read();
        assert!(state.shared);
        assert_eq!(dir_lookup(&state, OsStr::new("app")), Some(file.ino()));
    }
    // A read resolves to the base layer's inode without cloning
    let clones_before = gfs.clones.load(Relaxed);
    let seen = get_inode(
        &gfs,
        &layer,
        encode_ino(layer.gindex(), file.ino()),
        None,
        false,
    )
    .unwrap();
    assert_eq!(seen.gindex(), 0);
    assert_eq!(gfs.clones.load(Relaxed), clones_before);

    drop(sroot);
    drop(seen);
    drop(file);
    layerfs::unmount(gfs).unwrap();
}
