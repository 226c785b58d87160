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

//! `layerfs` is a layered, copy-on-write block filesystem engine backing container image
//! storage.
//!
//! The engine owns its device: it formats it and maintains its own superblock, inode table,
//! directory entries, extended attributes and block allocator. Many read-mostly layers stack
//! over the single device; each layer presents an independent, mutable view of the inodes it
//! shares with its ancestors. An inode is copied into a layer only when the layer writes to it,
//! and even then its directory entries, block map, symbolic link target and extended attributes
//! stay shared until first mutation.
//!
//! The crate exposes the layer and inode engine to an external request dispatcher: mounting,
//! layer registration and snapshots, inode resolution with clone-on-write, and inode
//! persistence. File data itself is addressed through block maps; moving the bytes is the
//! caller's business.

pub mod block;
pub mod bmap;
pub mod dir;
pub mod fs;
pub mod inode;
pub mod layout;
pub mod memory;
pub mod util;
pub mod xattr;

pub use fs::format_device;
pub use fs::mount;
pub use fs::read_superblock;
pub use fs::unmount;
pub use fs::Fs;
pub use fs::Gfs;
pub use inode::get_inode;
pub use inode::Inode;
