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

//! Block maps of regular files.
//!
//! A regular file whose content is laid out contiguously is described by a single extent, kept
//! directly in the inode. Once the layout becomes scattered, the file is described by a block
//! map: a table from file page to device block. On disk the map is a chain of blocks of
//! `(page, block)` pairs rooted at the inode's `bmap_dir_block` field.

use crate::block::BlockBuf;
use crate::fs::Fs;
use crate::fs::Gfs;
use crate::inode::InodeState;
use crate::inode::Payload;
use crate::layout::BLOCK_SIZE;
use crate::layout::INVALID_BLOCK;
use crate::memory;
use crate::memory::AllocTag;
use std::io;
use std::sync::Arc;

/// The number of `(page, block)` pairs fitting in one map block.
const PAIRS_PER_BLOCK: usize = (BLOCK_SIZE as usize - 8) / 16;

/// The block map of a regular file.
#[derive(Debug, Default)]
pub struct BlockMap {
    /// Device block per file page. `0` marks a hole.
    pub map: Vec<u64>,
}

impl BlockMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        memory::alloc(AllocTag::Bmap);
        Self {
            map: Vec::new(),
        }
    }

    /// Returns the number of mapped pages.
    pub fn count(&self) -> u64 {
        self.map.iter().filter(|b| **b != 0).count() as u64
    }
}

impl Clone for BlockMap {
    fn clone(&self) -> Self {
        memory::alloc(AllocTag::Bmap);
        Self {
            map: self.map.clone(),
        }
    }
}

impl Drop for BlockMap {
    fn drop(&mut self) {
        memory::free(AllocTag::Bmap);
    }
}

/// Replaces a shared block map payload with a private copy.
pub fn bmap_copy(state: &mut InodeState) {
    if !state.shared {
        return;
    }
    if let Payload::Bmap(bmap) = &state.payload {
        let copy = BlockMap::clone(bmap);
        state.payload = Payload::Bmap(Arc::new(copy));
    }
    state.shared = false;
    state.bmapdirty = true;
}

/// Converts an extent payload into an equivalent block map.
fn extent_to_bmap(state: &mut InodeState) {
    if let Payload::Extent {
        block,
        length,
    } = state.payload
    {
        let mut bmap = BlockMap::new();
        bmap.map = (0..length).map(|i| block + i).collect();
        state.payload = Payload::Bmap(Arc::new(bmap));
        state.bmapdirty = true;
    }
}

/// Returns the device block backing the given file page, if mapped.
pub fn bmap_lookup(state: &InodeState, page: u64) -> Option<u64> {
    match &state.payload {
        Payload::Extent {
            block,
            length,
        } => (page < *length).then(|| block + page),
        Payload::Bmap(bmap) => match bmap.map.get(page as usize) {
            Some(0) | None => None,
            Some(block) => Some(*block),
        },
        _ => None,
    }
}

/// Maps the given file page to the given device block.
pub fn bmap_add(state: &mut InodeState, page: u64, block: u64) {
    assert_ne!(block, 0);
    bmap_copy(state);
    // A first write right past a contiguous extent keeps the file as an extent
    if let Payload::Extent {
        block: eblock,
        length,
    } = &mut state.payload
    {
        if page == *length && block == *eblock + *length {
            *length += 1;
            state.dinode.stat.blocks += 1;
            state.bmapdirty = true;
            return;
        }
    }
    extent_to_bmap(state);
    if !matches!(state.payload, Payload::Bmap(_)) {
        if page == 0 {
            // First page of an empty file: start an extent
            state.payload = Payload::Extent {
                block,
                length: 1,
            };
            state.dinode.stat.blocks += 1;
            state.bmapdirty = true;
            return;
        }
        state.payload = Payload::Bmap(Arc::new(BlockMap::new()));
    }
    let Payload::Bmap(bmap) = &mut state.payload else {
        unreachable!();
    };
    let bmap = Arc::make_mut(bmap);
    if bmap.map.len() <= page as usize {
        bmap.map.resize(page as usize + 1, 0);
    }
    if bmap.map[page as usize] == 0 {
        state.dinode.stat.blocks += 1;
    }
    bmap.map[page as usize] = block;
    state.bmapdirty = true;
}

/// Reads the block map of an inode from the device.
///
/// A map covering a single contiguous range is kept as an extent.
pub fn bmap_read(gfs: &Gfs, fs: &Fs, state: &mut InodeState) -> io::Result<()> {
    let mut block = state.dinode.bmap_dir_block;
    if block == INVALID_BLOCK {
        state.pcache = true;
        return Ok(());
    }
    let mut map: Vec<u64> = Vec::new();
    let mut buf = BlockBuf::new();
    while block != INVALID_BLOCK {
        gfs.read_block(fs, block, &mut buf)?;
        let data = buf.as_slice();
        let next = u64::from_ne_bytes(data[0..8].try_into().unwrap());
        for k in 0..PAIRS_PER_BLOCK {
            let off = 8 + k * 16;
            let page = u64::from_ne_bytes(data[off..off + 8].try_into().unwrap());
            let blk = u64::from_ne_bytes(data[off + 8..off + 16].try_into().unwrap());
            if blk == 0 {
                break;
            }
            if map.len() <= page as usize {
                map.resize(page as usize + 1, 0);
            }
            map[page as usize] = blk;
        }
        block = next;
    }
    let contiguous = !map.is_empty()
        && map.iter().enumerate().all(|(i, b)| *b == map[0] + i as u64)
        && map[0] != 0;
    if contiguous {
        state.payload = Payload::Extent {
            block: map[0],
            length: map.len() as u64,
        };
    } else {
        let mut bmap = BlockMap::new();
        bmap.map = map;
        state.payload = Payload::Bmap(Arc::new(bmap));
    }
    Ok(())
}

/// Writes the block map of an inode to newly allocated blocks.
///
/// The inode's `bmap_dir_block` field is updated to the head of the new chain and the inode is
/// marked dirty.
pub fn bmap_flush(gfs: &Gfs, fs: &Fs, state: &mut InodeState) -> io::Result<()> {
    let pairs: Vec<(u64, u64)> = match &state.payload {
        Payload::Extent {
            block,
            length,
        } => (0..*length).map(|i| (i, block + i)).collect(),
        Payload::Bmap(bmap) => bmap
            .map
            .iter()
            .enumerate()
            .filter(|(_, b)| **b != 0)
            .map(|(i, b)| (i as u64, *b))
            .collect(),
        _ => Vec::new(),
    };
    if pairs.is_empty() {
        state.dinode.bmap_dir_block = INVALID_BLOCK;
        state.bmapdirty = false;
        return Ok(());
    }
    let count = pairs.chunks(PAIRS_PER_BLOCK).len() as u64;
    let start = gfs.block_alloc(fs, count, true)?;
    let mut buf = BlockBuf::new();
    for (k, chunk) in pairs.chunks(PAIRS_PER_BLOCK).enumerate() {
        let next = if (k as u64) + 1 < count {
            start + k as u64 + 1
        } else {
            INVALID_BLOCK
        };
        buf.zero();
        buf.as_mut_slice()[0..8].copy_from_slice(&next.to_ne_bytes());
        for (j, (page, blk)) in chunk.iter().enumerate() {
            let off = 8 + j * 16;
            buf.as_mut_slice()[off..off + 8].copy_from_slice(&page.to_ne_bytes());
            buf.as_mut_slice()[off + 8..off + 16].copy_from_slice(&blk.to_ne_bytes());
        }
        gfs.write_block(fs, &buf, start + k as u64)?;
    }
    state.dinode.bmap_dir_block = start;
    state.bmapdirty = false;
    state.dirty = true;
    Ok(())
}

/// Truncates a regular file to zero bytes.
///
/// Returns the number of content blocks that may be returned to the allocator. A shared payload
/// is unshared instead: the blocks still belong to the parent layer, so none are freed.
pub fn trunc_pages(state: &mut InodeState) -> u64 {
    let count = if state.shared {
        0
    } else {
        match &state.payload {
            Payload::Extent {
                length, ..
            } => *length,
            Payload::Bmap(bmap) => bmap.count(),
            _ => 0,
        }
    };
    state.payload = Payload::Empty;
    state.shared = false;
    state.pcache = true;
    state.bmapdirty = false;
    state.dinode.bmap_dir_block = INVALID_BLOCK;
    state.dinode.stat.blocks = 0;
    state.dinode.stat.size = 0;
    state.dirty = true;
    count
}
