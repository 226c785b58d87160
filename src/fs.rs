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

//! Layers and the global registry.
//!
//! A mounted device carries up to [`MAX_LAYERS`] layers. The base layer, at index `0`, hosts the
//! canonical directory tree; every other layer is a snapshot branching off a parent layer,
//! seeing the parent's inodes through copy-on-write. The registry names layers by index,
//! maintains the parent/sibling graph, and owns the device, the superblock and the global
//! counters.
//!
//! Lock order, outermost first: registry mutex, layer lock, clone mutex, cache bucket lock,
//! inode metadata lock, inode page lock.

use crate::block;
use crate::block::BlockBuf;
use crate::block::Device;
use crate::dir;
use crate::inode;
use crate::inode::destroy_inodes;
use crate::inode::get_inode;
use crate::inode::sync_inodes;
use crate::inode::Inode;
use crate::inode::InodeCache;
use crate::inode::InodeChain;
use crate::layout::inode_handle_of;
use crate::layout::layer_index_of;
use crate::layout::Superblock;
use crate::layout::BLOCK_SIZE;
use crate::layout::INVALID_BLOCK;
use crate::layout::INVALID_INODE;
use crate::layout::MAX_LAYERS;
use crate::layout::ROOT_INODE;
use crate::layout::SUPER_BLOCK;
use crate::layout::VERSION;
use crate::memory;
use crate::memory::AllocTag;
use crate::util::errno;
use crate::util::read_struct;
use crate::util::reinterpret;
use log::debug;
use log::error;
use log::info;
use log::warn;
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::Mutex;
use parking_lot::RawRwLock;
use parking_lot::RwLock;
use std::ffi::OsStr;
use std::io;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

/// A layer index denoting absence, used in the sibling links.
pub const INVALID_LAYER: u32 = u32::MAX;

/// A layer of the filesystem.
pub struct Fs {
    /// The local inode number of the layer's root directory.
    root: u64,
    /// The layer's index in the registry.
    gindex: AtomicU32,
    /// The parent layer. `None` for the base layer.
    parent: Option<Arc<Fs>>,
    /// The layer lock, taken shared by requests and exclusively by snapshot operations. The base
    /// layer has none: its exclusivity is implied by the mount lifecycle.
    rwlock: Option<Arc<RwLock<()>>>,
    /// The clone mutex, shared by the whole sibling group. Serializes ancestor-walk clones so
    /// writers in sibling layers cannot materialize the same ancestor inode twice.
    ilock: Arc<Mutex<()>>,
    /// The layer's inode cache.
    pub icache: InodeCache,
    /// The number of cached inodes.
    pub icount: AtomicU64,
    /// The number of inode blocks written by this layer.
    pub iwrite: AtomicU64,
    /// The layer's root inode.
    pub root_inode: RwLock<Option<Arc<Inode>>>,
    /// The next sibling in the parent's snapshot list.
    pub(crate) next: AtomicU32,
    /// The layer's first snapshot.
    pub(crate) snap: AtomicU32,
    /// Writeback state of the layer's inode index chain.
    pub chain: Mutex<InodeChain>,
}

impl Fs {
    /// Allocates a new layer with the given parent and root inode number.
    ///
    /// With `locks`, the layer owns a reader/writer lock. The clone mutex is inherited from the
    /// parent so the whole sibling group shares one.
    pub fn new(parent: Option<Arc<Fs>>, root: u64, locks: bool) -> Arc<Self> {
        memory::alloc(AllocTag::Layer);
        let ilock = match &parent {
            Some(p) => p.ilock.clone(),
            None => Arc::new(Mutex::new(())),
        };
        Arc::new(Self {
            root,
            gindex: AtomicU32::new(0),
            parent,
            rwlock: locks.then(|| Arc::new(RwLock::new(()))),
            ilock,
            icache: InodeCache::new(),
            icount: AtomicU64::new(0),
            iwrite: AtomicU64::new(0),
            root_inode: RwLock::new(None),
            next: AtomicU32::new(INVALID_LAYER),
            snap: AtomicU32::new(INVALID_LAYER),
            chain: Mutex::new(InodeChain::new()),
        })
    }

    /// Returns the local inode number of the layer's root directory.
    pub fn root(&self) -> u64 {
        self.root
    }

    /// Returns the layer's index in the registry.
    pub fn gindex(&self) -> u32 {
        self.gindex.load(Relaxed)
    }

    pub(crate) fn set_gindex(&self, i: u32) {
        self.gindex.store(i, Relaxed);
    }

    /// Returns the parent layer.
    pub fn parent(&self) -> Option<Arc<Fs>> {
        self.parent.clone()
    }

    /// Returns the sibling-group clone mutex.
    pub fn ilock(&self) -> &Mutex<()> {
        &self.ilock
    }

    /// Tells whether the layer has a snapshot of its own.
    pub fn has_snap(&self) -> bool {
        self.snap.load(Relaxed) != INVALID_LAYER
    }

    /// Locks the layer, shared while serving a request and exclusively while taking or deleting
    /// snapshots.
    ///
    /// Returns `None` for the base layer, which has no lock.
    pub fn lock(&self, exclusive: bool) -> Option<LayerLock> {
        let rwlock = self.rwlock.as_ref()?;
        let lock = if exclusive {
            LayerLock::Exclusive(rwlock.write_arc())
        } else {
            LayerLock::Shared(rwlock.read_arc())
        };
        Some(lock)
    }
}

/// A held layer lock.
pub enum LayerLock {
    /// The layer is locked for a request.
    Shared(ArcRwLockReadGuard<RawRwLock, ()>),
    /// The layer is locked for a snapshot operation.
    Exclusive(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// A layer returned by [`Gfs::get_layer`], with its lock held.
///
/// Dropping the guard releases the layer.
pub struct LayerGuard {
    fs: Arc<Fs>,
    _lock: Option<LayerLock>,
}

impl LayerGuard {
    /// Returns the locked layer.
    pub fn fs(&self) -> &Arc<Fs> {
        &self.fs
    }
}

impl Deref for LayerGuard {
    type Target = Fs;

    fn deref(&self) -> &Self::Target {
        &self.fs
    }
}

/// The table of layers.
struct Registry {
    /// Layers by index.
    layers: Vec<Option<Arc<Fs>>>,
    /// Root inode number per layer index.
    roots: Vec<u64>,
    /// The highest index in use.
    scount: usize,
}

/// The global state of a mounted device.
pub struct Gfs {
    /// The device.
    dev: Device,
    /// The in-memory superblock.
    pub sb: Superblock,
    /// The layer table.
    registry: Mutex<Registry>,
    /// The local inode number of the snapshot root directory, `0` if not set.
    snap_root: AtomicU64,
    /// The snapshot root directory's inode.
    snap_root_inode: RwLock<Option<Arc<Inode>>>,
    /// The local inode number of the layer database mounts directory, once discovered.
    mounts_root: AtomicU64,
    /// The local inode number of the layer database sha256 directory, once discovered.
    sha256_root: AtomicU64,
    /// The number of inodes cloned from an ancestor layer.
    pub clones: AtomicU64,
    /// The number of blocks returned by layers, waiting for a reclaim pass.
    freed: AtomicU64,
}

impl Gfs {
    /// Reads the block `block` into `buf` on behalf of the given layer.
    pub fn read_block(&self, fs: &Fs, block: u64, buf: &mut BlockBuf) -> io::Result<()> {
        log::trace!("layer {}: read block {block}", fs.gindex());
        assert!(block < self.sb.tblocks);
        self.dev.read_block(block, buf)
    }

    /// Writes `buf` to the block `block` on behalf of the given layer.
    pub fn write_block(&self, fs: &Fs, buf: &BlockBuf, block: u64) -> io::Result<()> {
        log::trace!("layer {}: write block {block}", fs.gindex());
        assert!(block < self.sb.tblocks);
        self.dev.write_block(buf, block)
    }

    /// Allocates `count` blocks on behalf of the given layer.
    pub fn block_alloc(&self, fs: &Fs, count: u64, metadata: bool) -> io::Result<u64> {
        let block = block::block_alloc(&self.sb, count)?;
        log::trace!(
            "layer {}: allocated {count} block(s) at {block}, metadata: {metadata}",
            fs.gindex()
        );
        Ok(block)
    }

    /// Returns `count` blocks to the free pool.
    pub fn block_free(&self, count: u64) {
        block::block_free(&self.freed, count);
    }

    /// Writes the superblock back to the device.
    pub fn super_write(&self) -> io::Result<()> {
        let mut buf = BlockBuf::new();
        buf.as_mut_slice().copy_from_slice(reinterpret(&self.sb));
        self.dev.write_block(&buf, SUPER_BLOCK)
    }

    /// Returns the base layer.
    pub fn base(&self) -> Arc<Fs> {
        self.registry.lock().layers[0]
            .clone()
            .expect("no base layer")
    }

    /// Returns the layer at the given index, if present.
    pub fn layer_at(&self, i: u32) -> Option<Arc<Fs>> {
        assert!((i as usize) < MAX_LAYERS);
        self.registry.lock().layers[i as usize].clone()
    }

    /// Returns the root inode number recorded for the layer at the given index.
    pub fn layer_root(&self, i: u32) -> u64 {
        assert!((i as usize) < MAX_LAYERS);
        self.registry.lock().roots[i as usize]
    }

    /// Returns the highest layer index in use.
    pub fn snap_count(&self) -> usize {
        self.registry.lock().scount
    }

    /// Returns the local inode number of the snapshot root directory, `0` if not set.
    pub fn snap_root(&self) -> u64 {
        self.snap_root.load(Relaxed)
    }

    /// Returns the snapshot root directory's inode.
    pub fn snap_root_inode(&self) -> Option<Arc<Inode>> {
        self.snap_root_inode.read().clone()
    }

    /// Returns the local inode number of the layer database mounts directory, `0` if not yet
    /// discovered.
    pub fn mounts_root(&self) -> u64 {
        self.mounts_root.load(Relaxed)
    }

    /// Returns the local inode number of the layer database sha256 directory, `0` if not yet
    /// discovered.
    pub fn sha256_root(&self) -> u64 {
        self.sha256_root.load(Relaxed)
    }

    /// Returns the layer owning the inode identified by `id`, locked as requested.
    pub fn get_layer(&self, id: u64, exclusive: bool) -> LayerGuard {
        let gindex = layer_index_of(id);
        assert!((gindex as usize) < MAX_LAYERS);
        let fs = self.layer_at(gindex).expect("layer not mounted");
        let lock = fs.lock(exclusive);
        assert_eq!(fs.gindex(), gindex);
        assert_eq!(self.layer_root(gindex), fs.root());
        LayerGuard {
            fs,
            _lock: lock,
        }
    }

    /// Returns the index of the layer a lookup should continue in.
    ///
    /// A directory entry under the snapshot root whose inode is the root of a layer "teleports"
    /// the lookup into that layer: the returned index is the target layer's. In every other case
    /// the current layer's index is returned.
    pub fn get_index(&self, fs: &Fs, parent: u64, ino: u64) -> u32 {
        let gindex = fs.gindex();
        if gindex != 0 || self.snap_root.load(Relaxed) != parent {
            return gindex;
        }
        let root = inode_handle_of(ino);
        let reg = self.registry.lock();
        for i in 1..=reg.scount {
            if reg.roots[i] == root {
                return i as u32;
            }
        }
        gindex
    }

    /// Registers a layer, assigning it the first free index, and splices it into its parent's
    /// sibling list.
    fn register_layer(&self, fs: &Arc<Fs>, parent: &Arc<Fs>) {
        let mut reg = self.registry.lock();
        let i = (1..MAX_LAYERS)
            .find(|i| reg.layers[*i].is_none())
            .expect("layer table full");
        fs.set_gindex(i as u32);
        reg.layers[i] = Some(fs.clone());
        reg.roots[i] = fs.root();
        if i > reg.scount {
            reg.scount = i;
        }
        // Splice into the sibling list. Children of the base layer chain off the base itself;
        // deeper layers chain off their parent's first snapshot
        if parent.gindex() == 0 {
            fs.next.store(parent.next.load(Relaxed), Relaxed);
            parent.next.store(i as u32, Relaxed);
        } else if !parent.has_snap() {
            parent.snap.store(i as u32, Relaxed);
        } else {
            let head = reg.layers[parent.snap.load(Relaxed) as usize]
                .clone()
                .expect("broken sibling chain");
            fs.next.store(head.next.load(Relaxed), Relaxed);
            head.next.store(i as u32, Relaxed);
        }
    }

    /// Removes a layer from the table.
    fn unregister_layer(&self, fs: &Fs) {
        let i = fs.gindex() as usize;
        assert!(i > 0 && i < MAX_LAYERS);
        let mut reg = self.registry.lock();
        reg.layers[i] = None;
        reg.roots[i] = INVALID_INODE;
        if reg.scount == i {
            assert!(reg.scount > 0);
            reg.scount -= 1;
        }
    }

    /// Unlinks a layer from its parent's sibling list.
    pub fn remove_snap(&self, fs: &Fs) {
        assert!(!fs.has_snap());
        let i = fs.gindex();
        assert!(i > 0 && (i as usize) < MAX_LAYERS);
        let reg = self.registry.lock();
        let parent = fs.parent().expect("snapshot without a parent");
        if parent.gindex() != 0 && parent.snap.load(Relaxed) == i {
            parent.snap.store(fs.next.load(Relaxed), Relaxed);
        } else {
            let mut cur = if parent.gindex() == 0 {
                parent
            } else {
                reg.layers[parent.snap.load(Relaxed) as usize]
                    .clone()
                    .expect("broken sibling chain")
            };
            loop {
                let n = cur.next.load(Relaxed);
                if n == i {
                    cur.next.store(fs.next.load(Relaxed), Relaxed);
                    break;
                }
                assert_ne!(n, INVALID_LAYER, "layer not in its sibling chain");
                cur = reg.layers[n as usize]
                    .clone()
                    .expect("broken sibling chain");
            }
        }
        fs.next.store(INVALID_LAYER, Relaxed);
    }

    /// Creates a snapshot of the layer at `parent_index`.
    ///
    /// `root_ino` becomes the new layer's root: a directory inode sharing the parent root's
    /// entries until first write. The parent layer is held exclusively for the duration.
    pub fn add_layer(&self, root_ino: u64, parent_index: u32) -> io::Result<Arc<Fs>> {
        let parent = self
            .layer_at(parent_index)
            .ok_or_else(|| errno(libc::ENOENT))?;
        let _plock = parent.lock(true);
        let fs = Fs::new(Some(parent.clone()), root_ino, true);
        self.register_layer(&fs, &parent);
        let proot = parent
            .root_inode
            .read()
            .clone()
            .expect("parent layer has no root inode");
        inode::clone_root(self, &fs, &proot);
        info!(
            "layer {} created, root {root_ino}, parent {parent_index}",
            fs.gindex()
        );
        Ok(fs)
    }

    /// Deletes the layer at the given index, returning its blocks to the allocator.
    ///
    /// The layer must have no snapshot of its own.
    pub fn remove_layer(&self, index: u32) -> io::Result<()> {
        assert!(index > 0 && (index as usize) < MAX_LAYERS);
        let fs = self.layer_at(index).ok_or_else(|| errno(libc::ENOENT))?;
        let lock = fs.lock(true);
        assert!(!fs.has_snap());
        self.unregister_layer(&fs);
        self.remove_snap(&fs);
        destroy_fs(self, &fs, true);
        drop(lock);
        info!("layer {index} removed");
        Ok(())
    }

    /// Sets the directory under which snapshot roots appear.
    pub fn set_snap_root(&self, ino: u64) -> io::Result<()> {
        let old = self.snap_root.load(Relaxed);
        if old != 0 {
            if self.snap_count() > 0 {
                warn!("snapshot root changed when snapshots are present");
            }
            info!("switching snapshot root from {old} to {ino}");
            self.snap_root.store(0, Relaxed);
        }
        let base = self.base();
        let inode = get_inode(self, &base, ino, None, false)?;
        assert!(inode.read().dinode.stat.is_dir());
        *self.snap_root_inode.write() = Some(inode);
        self.snap_root.store(ino, Relaxed);
        info!("snapshot root inode {ino}");
        Ok(())
    }

    /// Resolves the well-known layer database directories and caches their inode numbers.
    pub fn setup_special_dir(&self) -> io::Result<()> {
        if self.mounts_root.load(Relaxed) != 0 && self.sha256_root.load(Relaxed) != 0 {
            return Ok(());
        }
        let fs = self.base();
        let mut inum = ROOT_INODE;
        for name in ["image", "layerfs", "layerdb"] {
            let inode = get_inode(self, &fs, inum, None, false)?;
            let state = inode.read();
            inum = dir::dir_lookup(&state, OsStr::new(name)).ok_or_else(|| {
                warn!("layer database directory {name} not found");
                errno(libc::ENOENT)
            })?;
        }
        let inode = get_inode(self, &fs, inum, None, false)?;
        let state = inode.read();
        match dir::dir_lookup(&state, OsStr::new("mounts")) {
            Some(ino) => {
                self.mounts_root.store(ino, Relaxed);
                info!("mounts directory is {ino}");
            }
            None => warn!("mounts directory not found"),
        }
        match dir::dir_lookup(&state, OsStr::new("sha256")) {
            Some(ino) => {
                self.sha256_root.store(ino, Relaxed);
                info!("sha256 directory is {ino}");
            }
            None => warn!("sha256 directory not found"),
        }
        Ok(())
    }

    /// Flushes every layer's dirty inodes and writes the superblock back.
    pub fn sync(&self) -> io::Result<()> {
        let layers: Vec<Arc<Fs>> = {
            let reg = self.registry.lock();
            (0..=reg.scount).filter_map(|i| reg.layers[i].clone()).collect()
        };
        for fs in layers.iter().skip(1).rev() {
            sync_inodes(self, fs)?;
        }
        if let Some(base) = layers.first() {
            sync_inodes(self, base)?;
        }
        self.super_write()
    }
}

/// Destroys a layer, freeing its cached inodes.
///
/// With `remove`, the layer's content blocks are returned to the allocator.
fn destroy_fs(gfs: &Gfs, fs: &Fs, remove: bool) {
    let count = destroy_inodes(gfs, fs, remove);
    if count > 0 {
        gfs.block_free(count);
    }
    memory::free(AllocTag::Layer);
}

/// Reads the superblock from the device.
fn super_read(dev: &Device) -> io::Result<Superblock> {
    let mut buf = BlockBuf::new();
    dev.read_block(SUPER_BLOCK, &mut buf)?;
    Ok(read_struct(buf.as_slice()))
}

/// Mounts the device at the given path.
///
/// If no valid superblock is found, the device is formatted. The base layer is constructed and
/// its inode table read into the cache.
pub fn mount(device: &Path) -> io::Result<Arc<Gfs>> {
    let dev = Device::open(device)?;
    let size = dev.size();
    let mut sb = super_read(&dev).map_err(|e| {
        error!("superblock read failed: {e}");
        errno(libc::EIO)
    })?;
    if sb.version != VERSION {
        info!("formatting device, {} blocks", size / BLOCK_SIZE);
        sb = Superblock::format(size);
    } else {
        sb.mounts += 1;
    }
    let gfs = Arc::new(Gfs {
        dev,
        sb,
        registry: Mutex::new(Registry {
            layers: vec![None; MAX_LAYERS],
            roots: vec![INVALID_INODE; MAX_LAYERS],
            scount: 0,
        }),
        snap_root: AtomicU64::new(0),
        snap_root_inode: RwLock::new(None),
        mounts_root: AtomicU64::new(0),
        sha256_root: AtomicU64::new(0),
        clones: AtomicU64::new(0),
        freed: AtomicU64::new(0),
    });
    let fs = Fs::new(None, ROOT_INODE, false);
    {
        let mut reg = gfs.registry.lock();
        reg.layers[0] = Some(fs.clone());
        reg.roots[0] = ROOT_INODE;
    }
    let head = gfs.sb.inode_block.load(Relaxed);
    fs.chain.lock().head = head;
    if head == INVALID_BLOCK {
        inode::root_init(&gfs, &fs, ROOT_INODE);
    } else {
        inode::read_inodes(&gfs, &fs).map_err(|e| {
            error!("reading inodes failed: {e}");
            errno(libc::EIO)
        })?;
    }
    gfs.super_write()?;
    debug!("mounted, {} blocks, mount count {}", gfs.sb.tblocks, gfs.sb.mounts);
    Ok(gfs)
}

/// Unmounts the device, flushing all dirty state and tearing the layers down.
pub fn unmount(gfs: Arc<Gfs>) -> io::Result<()> {
    gfs.sync()?;
    *gfs.snap_root_inode.write() = None;
    let layers: Vec<Arc<Fs>> = {
        let mut reg = gfs.registry.lock();
        let layers = (0..=reg.scount).filter_map(|i| reg.layers[i].clone()).collect();
        for slot in reg.layers.iter_mut() {
            *slot = None;
        }
        for root in reg.roots.iter_mut() {
            *root = INVALID_INODE;
        }
        reg.scount = 0;
        layers
    };
    // Children hold references to their parents, so tear down newest first
    for fs in layers.iter().rev() {
        let lock = fs.lock(true);
        destroy_fs(&gfs, fs, false);
        drop(lock);
    }
    memory::log_stats();
    Ok(())
}

/// Formats the device at the given path and returns its total block count.
pub fn format_device(device: &Path) -> io::Result<u64> {
    let dev = Device::open(device)?;
    let sb = Superblock::format(dev.size());
    let mut buf = BlockBuf::new();
    buf.as_mut_slice().copy_from_slice(reinterpret(&sb));
    dev.write_block(&buf, SUPER_BLOCK)?;
    dev.sync()?;
    Ok(sb.tblocks)
}

/// Reads the superblock of the device at the given path.
pub fn read_superblock(device: &Path) -> io::Result<Superblock> {
    let dev = Device::open(device)?;
    super_read(&dev)
}
