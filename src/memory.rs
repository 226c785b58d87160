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

//! Tagged accounting of the engine's allocations.
//!
//! Every allocation the engine performs is charged to a category so that memory usage can be
//! broken down when debugging. The counters are process-wide and updated with atomics; they are
//! never consulted on hot paths.

use log::debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// An allocation category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum AllocTag {
    /// A layer structure.
    Layer,
    /// A layer's inode cache.
    ICache,
    /// An inode.
    Inode,
    /// A symbolic link target.
    Target,
    /// An aligned block I/O buffer.
    BlockBuf,
    /// A page of file data.
    Page,
    /// File data.
    Data,
    /// A block map.
    Bmap,
    /// An extent.
    Extent,
    /// A directory entry.
    Dirent,
    /// A directory entry name.
    DirName,
    /// An extended attribute list.
    Xattr,
    /// An extended attribute name.
    XattrName,
    /// An extended attribute value.
    XattrValue,
    /// A buffer used to encode extended attributes.
    XattrBuf,
    /// Statistics.
    Stats,
}

/// The number of allocation categories.
const TAG_COUNT: usize = 16;

/// Allocation count per category.
static ALLOCS: [AtomicU64; TAG_COUNT] = [const { AtomicU64::new(0) }; TAG_COUNT];
/// Deallocation count per category.
static FREES: [AtomicU64; TAG_COUNT] = [const { AtomicU64::new(0) }; TAG_COUNT];

impl AllocTag {
    /// Returns the category's name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Layer => "layer",
            Self::ICache => "icache",
            Self::Inode => "inode",
            Self::Target => "target",
            Self::BlockBuf => "blockbuf",
            Self::Page => "page",
            Self::Data => "data",
            Self::Bmap => "bmap",
            Self::Extent => "extent",
            Self::Dirent => "dirent",
            Self::DirName => "dirname",
            Self::Xattr => "xattr",
            Self::XattrName => "xattrname",
            Self::XattrValue => "xattrvalue",
            Self::XattrBuf => "xattrbuf",
            Self::Stats => "stats",
        }
    }
}

/// Charges an allocation to the given category.
pub fn alloc(tag: AllocTag) {
    ALLOCS[tag as usize].fetch_add(1, Relaxed);
}

/// Records a deallocation in the given category.
pub fn free(tag: AllocTag) {
    FREES[tag as usize].fetch_add(1, Relaxed);
}

/// Returns the number of live allocations in the given category.
pub fn in_use(tag: AllocTag) -> i64 {
    let a = ALLOCS[tag as usize].load(Relaxed);
    let f = FREES[tag as usize].load(Relaxed);
    a as i64 - f as i64
}

/// Dumps the per-category counters to the log.
pub fn log_stats() {
    const TAGS: [AllocTag; TAG_COUNT] = [
        AllocTag::Layer,
        AllocTag::ICache,
        AllocTag::Inode,
        AllocTag::Target,
        AllocTag::BlockBuf,
        AllocTag::Page,
        AllocTag::Data,
        AllocTag::Bmap,
        AllocTag::Extent,
        AllocTag::Dirent,
        AllocTag::DirName,
        AllocTag::Xattr,
        AllocTag::XattrName,
        AllocTag::XattrValue,
        AllocTag::XattrBuf,
        AllocTag::Stats,
    ];
    for tag in TAGS {
        let a = ALLOCS[tag as usize].load(Relaxed);
        let f = FREES[tag as usize].load(Relaxed);
        if a != 0 || f != 0 {
            debug!("memory: {} allocated {a} freed {f}", tag.name());
        }
    }
}
