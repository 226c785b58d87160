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

//! Inodes: in-memory representation, per-layer cache, lookup through the ancestor chain with
//! clone-on-write, and persistence to the device.
//!
//! Each layer caches its inodes in a small hash table. An inode number missing from a layer's
//! cache may still be visible in the layer: the lookup walks the parent chain and either returns
//! the ancestor's inode directly (reads) or materializes a private copy in the layer (writes).
//! A materialized clone shares its payload with the ancestor until the first mutation.

use crate::bmap;
use crate::bmap::trunc_pages;
use crate::dir;
use crate::block::BlockBuf;
use crate::fs::Fs;
use crate::fs::Gfs;
use crate::layout::inode_handle_of;
use crate::layout::DInode;
use crate::layout::Timespec;
use crate::layout::BLOCK_SIZE;
use crate::layout::DINODE_SIZE;
use crate::layout::IBLOCK_MAX;
use crate::layout::INVALID_BLOCK;
use crate::memory;
use crate::memory::AllocTag;
use crate::util::errno;
use crate::util::get_timestamp;
use crate::util::read_struct;
use crate::util::reinterpret;
use crate::xattr;
use crate::xattr::Xattrs;
use log::debug;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use parking_lot::RwLockWriteGuard;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

/// The number of buckets in a layer's inode cache.
pub const ICACHE_SIZE: usize = 512;

/// The content of an inode.
///
/// A payload cloned from a parent layer is referenced, not copied; the `shared` flag on the
/// inode records this, and the first mutation replaces the reference with a private copy.
#[derive(Debug, Default)]
pub enum Payload {
    /// No content.
    #[default]
    Empty,
    /// A regular file stored as one contiguous range of blocks.
    Extent {
        /// The first block.
        block: u64,
        /// The number of blocks.
        length: u64,
    },
    /// A regular file with scattered blocks.
    Bmap(Arc<bmap::BlockMap>),
    /// A directory's entries.
    Dir(Arc<dir::Directory>),
    /// A symbolic link's target.
    Symlink(Arc<OsString>),
}

/// The mutable part of an inode, guarded by the inode's metadata lock.
#[derive(Debug)]
pub struct InodeState {
    /// The on-disk portion.
    pub dinode: DInode,
    /// The inode's content.
    pub payload: Payload,
    /// The inode's extended attributes, possibly shared with a parent layer's inode.
    pub xattrs: Option<Arc<Xattrs>>,
    /// The on-disk portion needs to be written out.
    pub dirty: bool,
    /// The block map needs to be written out.
    pub bmapdirty: bool,
    /// The directory entries need to be written out.
    pub dirdirty: bool,
    /// The extended attributes need to be written out.
    pub xattrdirty: bool,
    /// The inode was removed from its layer.
    pub removed: bool,
    /// The payload is referenced from another layer's inode and must be unshared before any
    /// mutation.
    pub shared: bool,
    /// The inode's content is eligible for page caching.
    pub pcache: bool,
}

impl InodeState {
    /// Creates a state around the given on-disk portion.
    pub fn new(dinode: DInode) -> Self {
        Self {
            dinode,
            payload: Payload::Empty,
            xattrs: None,
            dirty: false,
            bmapdirty: false,
            dirdirty: false,
            xattrdirty: false,
            removed: false,
            shared: false,
            pcache: false,
        }
    }

    /// Tells whether any part of the inode needs to be written out.
    pub fn needs_flush(&self) -> bool {
        self.dirty || self.bmapdirty || self.dirdirty || self.xattrdirty
    }
}

/// An in-memory inode.
pub struct Inode {
    /// The layer-local inode number.
    ino: u64,
    /// The index of the owning layer.
    gindex: u32,
    /// The metadata lock and the state it guards.
    state: RwLock<InodeState>,
    /// The page lock, guarding page cache state. The page cache itself is owned by the caller's
    /// paging layer.
    pglock: RwLock<()>,
}

impl Inode {
    fn new(gindex: u32, state: InodeState) -> Arc<Self> {
        memory::alloc(AllocTag::Inode);
        Arc::new(Self {
            ino: state.dinode.stat.ino,
            gindex,
            state: RwLock::new(state),
            pglock: RwLock::new(()),
        })
    }

    /// Returns the layer-local inode number.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Returns the index of the owning layer.
    pub fn gindex(&self) -> u32 {
        self.gindex
    }

    /// Locks the inode's metadata for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, InodeState> {
        self.state.read()
    }

    /// Locks the inode's metadata for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, InodeState> {
        self.state.write()
    }

    /// Returns the page lock.
    pub fn page_lock(&self) -> &RwLock<()> {
        &self.pglock
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        memory::free(AllocTag::Inode);
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("gindex", &self.gindex)
            .finish()
    }
}

/// A layer's inode cache.
///
/// Inodes are hashed by their local number. An inode is never removed from the cache while the
/// layer is alive; the cache is drained only at layer teardown, under the layer's exclusive
/// lock.
pub struct InodeCache {
    buckets: Vec<RwLock<Vec<Arc<Inode>>>>,
}

impl InodeCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        memory::alloc(AllocTag::ICache);
        Self {
            buckets: (0..ICACHE_SIZE).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }

    fn bucket(&self, ino: u64) -> &RwLock<Vec<Arc<Inode>>> {
        &self.buckets[(ino % ICACHE_SIZE as u64) as usize]
    }

    /// Inserts an inode.
    pub fn insert(&self, inode: Arc<Inode>) {
        self.bucket(inode.ino()).write().push(inode);
    }

    /// Returns the inode with the given local number, if cached.
    pub fn lookup(&self, ino: u64) -> Option<Arc<Inode>> {
        let bucket = self.bucket(ino).read();
        bucket.iter().find(|i| i.ino() == ino).cloned()
    }

    /// Returns the cache's buckets.
    pub fn buckets(&self) -> &[RwLock<Vec<Arc<Inode>>>] {
        &self.buckets
    }
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InodeCache {
    fn drop(&mut self) {
        memory::free(AllocTag::ICache);
    }
}

/// Writeback state of a layer's inode index chain.
pub struct InodeChain {
    /// The head of the on-disk chain, or [`INVALID_BLOCK`] if none. The base layer's head is
    /// mirrored in the superblock.
    pub head: u64,
    /// The index block currently being filled, along with the block reserved for it.
    cur: Option<(BlockBuf, u64)>,
    /// The next free slot in the current index block.
    index: usize,
}

impl InodeChain {
    /// Creates an empty chain state.
    pub fn new() -> Self {
        Self {
            head: INVALID_BLOCK,
            cur: None,
            index: 0,
        }
    }

    /// Starts a new index block, retiring the current one to the device if any.
    ///
    /// The block for the new head is allocated up front; the superblock is updated for the base
    /// layer so a later read finds the chain.
    fn new_block(&mut self, gfs: &Gfs, fs: &Fs) -> io::Result<()> {
        let addr = gfs.block_alloc(fs, 1, true)?;
        let next = self.head;
        if let Some((buf, a)) = self.cur.take() {
            gfs.write_block(fs, &buf, a)?;
        }
        let mut buf = BlockBuf::new();
        let next_off = IBLOCK_MAX * 8;
        buf.as_mut_slice()[next_off..next_off + 8].copy_from_slice(&next.to_ne_bytes());
        self.cur = Some((buf, addr));
        self.index = 0;
        self.head = addr;
        if fs.gindex() == 0 {
            gfs.sb.inode_block.store(addr, Relaxed);
        }
        Ok(())
    }

    /// Records an inode block address in the current index block.
    fn record(&mut self, block: u64) {
        let (buf, _) = self.cur.as_mut().expect("no current index block");
        let off = self.index * 8;
        buf.as_mut_slice()[off..off + 8].copy_from_slice(&block.to_ne_bytes());
        self.index += 1;
    }
}

impl Default for InodeChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates a fresh in-memory inode in the given layer, with accounting.
fn new_inode(gfs: &Gfs, fs: &Fs, ino: u64) -> Arc<Inode> {
    let mut dinode = DInode::default();
    dinode.stat.ino = ino;
    // This accounting is not correct after restart
    gfs.sb.inodes.fetch_add(1, Relaxed);
    fs.icount.fetch_add(1, Relaxed);
    Inode::new(fs.gindex(), InodeState::new(dinode))
}

/// Sets the inode's times to the current time.
pub fn update_inode_times(state: &mut InodeState, atime: bool, mtime: bool, ctime: bool) {
    let now = Timespec::from(get_timestamp());
    if atime {
        state.dinode.stat.atime = now;
    }
    if mtime {
        state.dinode.stat.mtime = now;
    }
    if ctime {
        state.dinode.stat.ctime = now;
    }
}

/// Allocates a new layer-local inode number.
pub fn inode_alloc(gfs: &Gfs) -> u64 {
    gfs.sb.ninode.fetch_add(1, Relaxed) + 1
}

/// Initializes the root inode of a layer.
pub fn root_init(gfs: &Gfs, fs: &Fs, root: u64) {
    let inode = new_inode(gfs, fs, root);
    {
        let mut state = inode.write();
        state.dinode.stat.mode = libc::S_IFDIR | 0o755;
        state.dinode.stat.nlink = 2;
        state.dinode.stat.blksize = BLOCK_SIZE as u32;
        state.dinode.parent = root;
        update_inode_times(&mut state, true, true, true);
        state.dirty = true;
    }
    fs.icache.insert(inode.clone());
    *fs.root_inode.write() = Some(inode);
}

/// Creates a new inode in the given layer.
///
/// For symbolic links, `target` holds the link target; it must fit in an inode block together
/// with the on-disk inode.
pub fn inode_init(
    gfs: &Gfs,
    fs: &Fs,
    mode: u32,
    uid: u32,
    gid: u32,
    rdev: u64,
    parent: u64,
    target: Option<&OsStr>,
) -> io::Result<Arc<Inode>> {
    if let Some(target) = target {
        if DINODE_SIZE + target.len() > BLOCK_SIZE as usize {
            return Err(errno(libc::ENAMETOOLONG));
        }
    }
    let ino = inode_alloc(gfs);
    let inode = new_inode(gfs, fs, ino);
    {
        let mut state = inode.write();
        state.dinode.stat.mode = mode;
        state.dinode.stat.nlink = if mode & libc::S_IFMT == libc::S_IFDIR {
            2
        } else {
            1
        };
        state.dinode.stat.uid = uid;
        state.dinode.stat.gid = gid;
        state.dinode.stat.rdev = rdev;
        state.dinode.stat.blksize = BLOCK_SIZE as u32;
        state.dinode.parent = inode_handle_of(parent);
        state.pcache = mode & libc::S_IFMT == libc::S_IFREG;
        update_inode_times(&mut state, true, true, true);
        if let Some(target) = target {
            memory::alloc(AllocTag::Target);
            state.payload = Payload::Symlink(Arc::new(target.to_os_string()));
            state.dinode.stat.size = target.len() as u64;
        }
        state.dirty = true;
    }
    fs.icache.insert(inode.clone());
    Ok(inode)
}

/// Clones the inode `parent`, belonging to the ancestor layer `pfs`, into the layer `fs`.
///
/// The clone carries the parent's stat record and references its payload; the first mutation in
/// the new layer unshares it. The clone is returned unlocked.
pub fn clone_inode(
    gfs: &Gfs,
    fs: &Fs,
    pfs: &Fs,
    parent: &Arc<Inode>,
    ino: u64,
) -> Arc<Inode> {
    assert!(!fs.has_snap());
    let inode = new_inode(gfs, fs, ino);
    {
        let pstate = parent.read();
        let mut state = inode.write();
        state.dinode.stat = pstate.dinode.stat;
        if pstate.dinode.stat.is_reg() {
            if pstate.dinode.stat.blocks != 0 {
                // Share the content blocks initially
                match &pstate.payload {
                    Payload::Extent {
                        block,
                        length,
                    } => {
                        state.payload = Payload::Extent {
                            block: *block,
                            length: *length,
                        };
                    }
                    Payload::Bmap(bmap) => {
                        state.payload = Payload::Bmap(bmap.clone());
                    }
                    _ => {}
                }
                state.shared = true;
                state.bmapdirty = true;
            } else {
                state.pcache = true;
            }
        } else if pstate.dinode.stat.is_dir() {
            if let Payload::Dir(d) = &pstate.payload {
                state.payload = Payload::Dir(d.clone());
                state.shared = true;
                state.dirdirty = true;
            }
        } else if pstate.dinode.stat.is_lnk() {
            if let Payload::Symlink(t) = &pstate.payload {
                state.payload = Payload::Symlink(t.clone());
                state.shared = true;
            }
        }
        state.dinode.parent = if pstate.dinode.parent == pfs.root() {
            fs.root()
        } else {
            pstate.dinode.parent
        };
        xattr::xattr_copy(&mut state, &pstate);
        state.dirty = true;
    }
    fs.icache.insert(inode.clone());
    gfs.clones.fetch_add(1, Relaxed);
    inode
}

/// Initializes a snapshot layer's root inode from the parent layer's root.
///
/// The new root carries the parent root's stat record and shares its directory entries, so the
/// snapshot initially sees the parent's whole tree.
pub fn clone_root(gfs: &Gfs, fs: &Fs, parent_root: &Arc<Inode>) {
    let inode = new_inode(gfs, fs, fs.root());
    {
        let pstate = parent_root.read();
        let mut state = inode.write();
        state.dinode.stat = pstate.dinode.stat;
        state.dinode.stat.ino = fs.root();
        state.dinode.parent = fs.root();
        if let Payload::Dir(d) = &pstate.payload {
            state.payload = Payload::Dir(d.clone());
            state.shared = true;
            state.dirdirty = true;
        }
        xattr::xattr_copy(&mut state, &pstate);
        state.dirty = true;
    }
    fs.icache.insert(inode.clone());
    *fs.root_inode.write() = Some(inode);
    gfs.clones.fetch_add(1, Relaxed);
}

/// Looks up an inode in the given layer only.
fn lookup_inode(gfs: &Gfs, fs: &Fs, ino: u64) -> Option<Arc<Inode>> {
    if ino == fs.root() {
        return fs.root_inode.read().clone();
    }
    if ino != 0 && ino == gfs.snap_root() {
        return gfs.snap_root_inode();
    }
    fs.icache.lookup(ino)
}

/// Looks up an inode through the layer's ancestor chain, cloning it into the layer when `copy`
/// is set.
///
/// The sibling-group clone mutex serializes this walk so concurrent writers into sibling layers
/// cannot materialize the same ancestor inode twice.
fn get_inode_parent(gfs: &Gfs, fs: &Fs, ino: u64, copy: bool) -> Option<Arc<Inode>> {
    let _ilock = fs.ilock().lock();
    if let Some(inode) = fs.icache.lookup(ino) {
        let removed = inode.read().removed;
        return (!removed).then_some(inode);
    }
    let mut pfs = fs.parent();
    while let Some(p) = pfs {
        if let Some(parent) = p.icache.lookup(ino) {
            // Do not clone an inode removed in an intermediate layer
            if parent.read().removed {
                return None;
            }
            let inode = if copy {
                clone_inode(gfs, fs, &p, &parent, ino)
            } else {
                parent
            };
            return Some(inode);
        }
        pfs = p.parent();
    }
    None
}

/// Resolves the inode identified by `id` in the given layer.
///
/// `handle` is an optional hint from a previous resolution. With `for_write`, the inode is
/// materialized in the layer itself, cloning it from an ancestor if needed; otherwise an
/// ancestor's inode may be returned directly and must not be mutated.
///
/// The caller locks the returned inode in the mode it needs.
pub fn get_inode(
    gfs: &Gfs,
    fs: &Fs,
    id: u64,
    handle: Option<&Arc<Inode>>,
    for_write: bool,
) -> io::Result<Arc<Inode>> {
    let ino = inode_handle_of(id);
    if let Some(h) = handle {
        if !for_write || h.gindex() == fs.gindex() {
            assert_eq!(h.ino(), ino);
            return Ok(h.clone());
        }
    }
    if let Some(inode) = lookup_inode(gfs, fs, ino) {
        if inode.read().removed {
            return Err(errno(libc::ENOENT));
        }
        return Ok(inode);
    }
    if fs.parent().is_some() {
        if let Some(inode) = get_inode_parent(gfs, fs, ino, for_write) {
            return Ok(inode);
        }
    }
    debug!(
        "inode {ino} not found, layer {} root {}",
        fs.gindex(),
        fs.root()
    );
    Err(errno(libc::ENOENT))
}

/// Reads the layer's inode table from the device into its cache.
///
/// An index slot referencing a cleared inode block is turned into a tombstone and the index
/// block is rewritten in place.
pub fn read_inodes(gfs: &Gfs, fs: &Fs) -> io::Result<()> {
    debug!("reading inodes for layer {} root {}", fs.gindex(), fs.root());
    let mut block = fs.chain.lock().head;
    let mut ibuf = BlockBuf::new();
    let mut buf = BlockBuf::new();
    while block != INVALID_BLOCK {
        gfs.read_block(fs, block, &mut ibuf)?;
        let mut flush = false;
        for i in 0..IBLOCK_MAX {
            let off = i * 8;
            let iblock = u64::from_ne_bytes(ibuf.as_slice()[off..off + 8].try_into().unwrap());
            if iblock == 0 {
                break;
            }
            if iblock == INVALID_BLOCK {
                continue;
            }
            gfs.read_block(fs, iblock, &mut buf)?;
            let dinode: DInode = read_struct(buf.as_slice());
            if dinode.stat.ino == 0 {
                // The inode was cleared on disk: tombstone the slot
                ibuf.as_mut_slice()[off..off + 8].copy_from_slice(&INVALID_BLOCK.to_ne_bytes());
                flush = true;
                continue;
            }
            let mut state = InodeState::new(DInode {
                block: iblock,
                ..dinode
            });
            if state.dinode.stat.is_reg() {
                bmap::bmap_read(gfs, fs, &mut state)?;
            } else if state.dinode.stat.is_dir() {
                dir::dir_read(gfs, fs, &mut state)?;
            } else if state.dinode.stat.is_lnk() {
                let size = state.dinode.stat.size as usize;
                let target = OsStr::from_bytes(&buf.as_slice()[DINODE_SIZE..DINODE_SIZE + size]);
                memory::alloc(AllocTag::Target);
                state.payload = Payload::Symlink(Arc::new(target.to_os_string()));
            }
            xattr::xattr_read(gfs, fs, &mut state)?;
            let root = state.dinode.stat.ino == fs.root();
            if root {
                assert!(state.dinode.stat.is_dir());
            }
            let inode = Inode::new(fs.gindex(), state);
            fs.icount.fetch_add(1, Relaxed);
            fs.icache.insert(inode.clone());
            if root {
                *fs.root_inode.write() = Some(inode);
            }
        }
        if flush {
            gfs.write_block(fs, &ibuf, block)?;
        }
        block = u64::from_ne_bytes(
            ibuf.as_slice()[IBLOCK_MAX * 8..IBLOCK_MAX * 8 + 8]
                .try_into()
                .unwrap(),
        );
    }
    assert!(fs.root_inode.read().is_some());
    Ok(())
}

/// Writes a single dirty inode to the device.
///
/// Returns `1` if an inode block was written, `0` otherwise.
pub fn flush_inode(
    gfs: &Gfs,
    fs: &Fs,
    chain: &mut InodeChain,
    inode: &Inode,
) -> io::Result<u64> {
    assert_eq!(inode.gindex(), fs.gindex());
    let mut state = inode.write();
    if state.xattrdirty {
        xattr::xattr_flush(gfs, fs, &mut state)?;
    }
    if state.bmapdirty {
        bmap::bmap_flush(gfs, fs, &mut state)?;
    }
    if state.dirdirty {
        dir::dir_flush(gfs, fs, &mut state)?;
    }
    let mut written = 0;
    if state.dirty {
        if !state.removed {
            if state.dinode.block == INVALID_BLOCK {
                if chain.cur.is_none() || chain.index >= IBLOCK_MAX {
                    chain.new_block(gfs, fs)?;
                }
                state.dinode.block = gfs.block_alloc(fs, 1, true)?;
                chain.record(state.dinode.block);
            }
            let mut buf = BlockBuf::new();
            buf.as_mut_slice()[..DINODE_SIZE].copy_from_slice(reinterpret(&state.dinode));
            if let Payload::Symlink(target) = &state.payload {
                let bytes = target.as_bytes();
                buf.as_mut_slice()[DINODE_SIZE..DINODE_SIZE + bytes.len()]
                    .copy_from_slice(bytes);
            }
            gfs.write_block(fs, &buf, state.dinode.block)?;
            written = 1;
        } else if state.dinode.block != INVALID_BLOCK {
            // Clear the on-disk inode so a later read tombstones the slot
            state.dinode.stat.ino = 0;
            let mut buf = BlockBuf::new();
            buf.as_mut_slice()[..DINODE_SIZE].copy_from_slice(reinterpret(&state.dinode));
            gfs.write_block(fs, &buf, state.dinode.block)?;
        }
        state.dirty = false;
    }
    Ok(written)
}

/// Writes all dirty inodes of the layer, then the pending index block.
///
/// Returns the number of inode blocks written.
pub fn sync_inodes(gfs: &Gfs, fs: &Fs) -> io::Result<u64> {
    debug!("syncing inodes for layer {} root {}", fs.gindex(), fs.root());
    let mut chain = fs.chain.lock();
    let mut count = 0;
    for bucket in fs.icache.buckets() {
        let inodes: Vec<Arc<Inode>> = bucket.read().clone();
        for inode in inodes {
            if inode.read().needs_flush() {
                count += flush_inode(gfs, fs, &mut chain, &inode)?;
            }
        }
    }
    if let Some((buf, addr)) = chain.cur.take() {
        gfs.write_block(fs, &buf, addr)?;
        chain.index = 0;
    }
    if count > 0 {
        fs.iwrite.fetch_add(count, Relaxed);
    }
    Ok(count)
}

/// Releases an inode's payload and returns the number of content blocks it owned.
fn free_inode(state: &mut InodeState, _remove: bool) -> u64 {
    let mut count = 0;
    if state.dinode.stat.is_reg() {
        count = trunc_pages(state);
    } else if state.dinode.stat.is_dir() {
        dir::dir_free(state);
    } else if state.dinode.stat.is_lnk() {
        if !state.shared {
            memory::free(AllocTag::Target);
        }
        state.payload = Payload::Empty;
    }
    xattr::xattr_free(state);
    count
}

/// Drains the layer's inode cache, freeing every inode.
///
/// With `remove`, the count of content blocks owned by the layer is returned so the caller can
/// hand them back to the allocator. Without it (clean unmount), the blocks stay owned on the
/// device and the function returns `0`.
///
/// The caller must hold the layer exclusively.
pub fn destroy_inodes(gfs: &Gfs, fs: &Fs, remove: bool) -> u64 {
    let mut freed = 0;
    let mut icount = 0;
    let mut rcount = 0;
    for bucket in fs.icache.buckets() {
        let mut list = bucket.write();
        for inode in list.drain(..) {
            let mut state = inode.write();
            if !state.removed {
                rcount += 1;
            }
            freed += free_inode(&mut state, remove);
            icount += 1;
        }
    }
    *fs.root_inode.write() = None;
    if remove && icount > 0 {
        gfs.sb.inodes.fetch_sub(rcount, Relaxed);
    }
    if icount > 0 {
        fs.icount.fetch_sub(icount, Relaxed);
    }
    if remove {
        freed
    } else {
        0
    }
}
