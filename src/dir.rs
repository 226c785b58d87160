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

//! Directory entries.
//!
//! A directory's entries live in memory as a plain vector. On disk they are packed into a chain
//! of blocks rooted at the inode's `bmap_dir_block` field. A directory payload cloned from a
//! parent layer is shared until the first mutation, which replaces it with a private copy.

use crate::block::BlockBuf;
use crate::fs::Fs;
use crate::fs::Gfs;
use crate::inode::InodeState;
use crate::inode::Payload;
use crate::layout::BLOCK_SIZE;
use crate::layout::INVALID_BLOCK;
use crate::memory;
use crate::memory::AllocTag;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

/// The size of an on-disk entry header: inode number, mode and name length.
const DIRENT_HEADER: usize = 14;
/// The number of entry bytes fitting in one directory block.
const DIR_BLOCK_CAPACITY: usize = BLOCK_SIZE as usize - 8;

/// A directory entry.
#[derive(Debug, Clone)]
pub struct Dirent {
    /// The layer-local inode number of the target.
    pub ino: u64,
    /// The mode of the target. Only the file type bits are meaningful.
    pub mode: u32,
    /// The name of the entry.
    pub name: OsString,
}

/// The entries of a directory.
#[derive(Debug, Default)]
pub struct Directory {
    /// The entries, unordered.
    pub entries: Vec<Dirent>,
}

impl Directory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, ent: Dirent) {
        memory::alloc(AllocTag::Dirent);
        memory::alloc(AllocTag::DirName);
        self.entries.push(ent);
    }

    /// Returns the entry with the given name, if any.
    pub fn lookup(&self, name: &OsStr) -> Option<&Dirent> {
        self.entries.iter().find(|e| e.name == name)
    }
}

impl Clone for Directory {
    fn clone(&self) -> Self {
        let mut dir = Self::new();
        for e in &self.entries {
            dir.push(e.clone());
        }
        dir
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        for _ in &self.entries {
            memory::free(AllocTag::Dirent);
            memory::free(AllocTag::DirName);
        }
    }
}

/// Replaces a shared directory payload with a private copy.
///
/// Mutating a directory cloned from a parent layer must not be visible through the parent, so the
/// first mutation goes through this unshare step.
pub fn dir_copy(state: &mut InodeState) {
    if !state.shared {
        return;
    }
    if let Payload::Dir(dir) = &state.payload {
        let copy = Directory::clone(dir);
        state.payload = Payload::Dir(Arc::new(copy));
    }
    state.shared = false;
    state.dirdirty = true;
}

/// Returns the directory payload for mutation, unsharing it first if needed.
fn dir_mut(state: &mut InodeState) -> &mut Directory {
    dir_copy(state);
    if !matches!(state.payload, Payload::Dir(_)) {
        state.payload = Payload::Dir(Arc::new(Directory::new()));
    }
    let Payload::Dir(dir) = &mut state.payload else {
        unreachable!();
    };
    Arc::make_mut(dir)
}

/// Looks up the entry `name` in the given directory inode.
///
/// Returns the local inode number of the target, or `None` if the entry does not exist.
pub fn dir_lookup(state: &InodeState, name: &OsStr) -> Option<u64> {
    match &state.payload {
        Payload::Dir(dir) => dir.lookup(name).map(|e| e.ino),
        _ => None,
    }
}

/// Adds an entry to the given directory inode.
pub fn dir_add(state: &mut InodeState, name: &OsStr, ino: u64, mode: u32) {
    let dir = dir_mut(state);
    dir.push(Dirent {
        ino,
        mode,
        name: name.to_os_string(),
    });
    state.dirdirty = true;
}

/// Removes the entry `name` from the given directory inode.
///
/// Returns the local inode number of the removed target, or `None` if the entry does not exist.
pub fn dir_remove(state: &mut InodeState, name: &OsStr) -> Option<u64> {
    let dir = dir_mut(state);
    let i = dir.entries.iter().position(|e| e.name == name)?;
    let ent = dir.entries.remove(i);
    memory::free(AllocTag::Dirent);
    memory::free(AllocTag::DirName);
    state.dirdirty = true;
    Some(ent.ino)
}

/// Reads the directory entries of an inode from the device.
pub fn dir_read(gfs: &Gfs, fs: &Fs, state: &mut InodeState) -> io::Result<()> {
    let mut block = state.dinode.bmap_dir_block;
    if block == INVALID_BLOCK {
        return Ok(());
    }
    let mut dir = Directory::new();
    let mut buf = BlockBuf::new();
    while block != INVALID_BLOCK {
        gfs.read_block(fs, block, &mut buf)?;
        let data = buf.as_slice();
        let next = u64::from_ne_bytes(data[0..8].try_into().unwrap());
        let mut off = 8;
        while off + DIRENT_HEADER <= data.len() {
            let ino = u64::from_ne_bytes(data[off..off + 8].try_into().unwrap());
            if ino == 0 {
                break;
            }
            let mode = u32::from_ne_bytes(data[off + 8..off + 12].try_into().unwrap());
            let name_len = u16::from_ne_bytes(data[off + 12..off + 14].try_into().unwrap()) as usize;
            let name = OsStr::from_bytes(&data[off + DIRENT_HEADER..off + DIRENT_HEADER + name_len]);
            dir.push(Dirent {
                ino,
                mode,
                name: name.to_os_string(),
            });
            off += DIRENT_HEADER + name_len;
        }
        block = next;
    }
    state.payload = Payload::Dir(Arc::new(dir));
    Ok(())
}

/// Encodes a directory entry.
fn encode_dirent(chunk: &mut Vec<u8>, ent: &Dirent) {
    chunk.extend_from_slice(&ent.ino.to_ne_bytes());
    chunk.extend_from_slice(&ent.mode.to_ne_bytes());
    chunk.extend_from_slice(&(ent.name.len() as u16).to_ne_bytes());
    chunk.extend_from_slice(ent.name.as_bytes());
}

/// Writes the directory entries of an inode to newly allocated blocks.
///
/// The inode's `bmap_dir_block` field is updated to the head of the new chain and the inode is
/// marked dirty.
pub fn dir_flush(gfs: &Gfs, fs: &Fs, state: &mut InodeState) -> io::Result<()> {
    let Payload::Dir(dir) = &state.payload else {
        state.dirdirty = false;
        return Ok(());
    };
    let dir = dir.clone();
    // Pack entries into block-sized chunks
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut cur: Vec<u8> = Vec::new();
    for ent in &dir.entries {
        let rec = DIRENT_HEADER + ent.name.len();
        if cur.len() + rec > DIR_BLOCK_CAPACITY {
            chunks.push(std::mem::take(&mut cur));
        }
        encode_dirent(&mut cur, ent);
    }
    if !cur.is_empty() {
        chunks.push(cur);
    }
    if chunks.is_empty() {
        state.dinode.bmap_dir_block = INVALID_BLOCK;
    } else {
        let count = chunks.len() as u64;
        let start = gfs.block_alloc(fs, count, true)?;
        let mut buf = BlockBuf::new();
        for (k, chunk) in chunks.iter().enumerate() {
            let next = if (k as u64) + 1 < count {
                start + k as u64 + 1
            } else {
                INVALID_BLOCK
            };
            buf.zero();
            buf.as_mut_slice()[0..8].copy_from_slice(&next.to_ne_bytes());
            buf.as_mut_slice()[8..8 + chunk.len()].copy_from_slice(chunk);
            gfs.write_block(fs, &buf, start + k as u64)?;
        }
        state.dinode.bmap_dir_block = start;
    }
    state.dirdirty = false;
    state.dirty = true;
    Ok(())
}

/// Releases the in-memory entries of a directory inode.
pub fn dir_free(state: &mut InodeState) {
    if matches!(state.payload, Payload::Dir(_)) {
        state.payload = Payload::Empty;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout::DInode;

    fn dir_state() -> InodeState {
        let mut state = InodeState::new(DInode::default());
        state.dinode.stat.mode = libc::S_IFDIR | 0o755;
        state
    }

    #[test]
    fn add_lookup_remove() {
        let mut state = dir_state();
        assert_eq!(dir_lookup(&state, OsStr::new("a")), None);
        dir_add(&mut state, OsStr::new("a"), 10, libc::S_IFREG);
        dir_add(&mut state, OsStr::new("b"), 11, libc::S_IFDIR);
        assert_eq!(dir_lookup(&state, OsStr::new("a")), Some(10));
        assert_eq!(dir_lookup(&state, OsStr::new("b")), Some(11));
        assert!(state.dirdirty);
        assert_eq!(dir_remove(&mut state, OsStr::new("a")), Some(10));
        assert_eq!(dir_lookup(&state, OsStr::new("a")), None);
        assert_eq!(dir_remove(&mut state, OsStr::new("a")), None);
    }

    #[test]
    fn unshare_leaves_original_untouched() {
        let mut parent = dir_state();
        dir_add(&mut parent, OsStr::new("f"), 10, libc::S_IFREG);
        let Payload::Dir(shared) = &parent.payload else {
            panic!();
        };

        let mut child = dir_state();
        child.payload = Payload::Dir(shared.clone());
        child.shared = true;
        dir_add(&mut child, OsStr::new("g"), 11, libc::S_IFREG);

        assert!(!child.shared);
        assert_eq!(dir_lookup(&child, OsStr::new("f")), Some(10));
        assert_eq!(dir_lookup(&child, OsStr::new("g")), Some(11));
        assert_eq!(dir_lookup(&parent, OsStr::new("g")), None);
    }
}
