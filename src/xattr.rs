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

//! Extended attributes.
//!
//! An inode's extended attributes are kept as a name/value list and stored packed in a single
//! block pointed to by the inode's `xattr_block` field. On clone the list is shared by reference;
//! the first mutation in the clone copies it.

use crate::block::BlockBuf;
use crate::fs::Fs;
use crate::fs::Gfs;
use crate::inode::InodeState;
use crate::layout::BLOCK_SIZE;
use crate::layout::INVALID_BLOCK;
use crate::memory;
use crate::memory::AllocTag;
use crate::util::errno;
use std::io;
use std::sync::Arc;

/// The size of an on-disk attribute header: name length and value length.
const XATTR_HEADER: usize = 4;

/// An extended attribute.
#[derive(Debug, Clone)]
pub struct Xattr {
    /// The attribute's name.
    pub name: String,
    /// The attribute's value.
    pub value: Vec<u8>,
}

/// The extended attributes of an inode.
#[derive(Debug, Default)]
pub struct Xattrs {
    /// The attributes, unordered.
    pub entries: Vec<Xattr>,
}

impl Xattrs {
    /// Creates an empty list.
    pub fn new() -> Self {
        memory::alloc(AllocTag::Xattr);
        Self::default()
    }

    fn push(&mut self, attr: Xattr) {
        memory::alloc(AllocTag::XattrName);
        memory::alloc(AllocTag::XattrValue);
        self.entries.push(attr);
    }

    /// Returns the total encoded size of the attributes, including the terminator.
    fn disk_size(&self) -> usize {
        let entries: usize = self
            .entries
            .iter()
            .map(|a| XATTR_HEADER + a.name.len() + a.value.len())
            .sum();
        entries + 2
    }
}

impl Clone for Xattrs {
    fn clone(&self) -> Self {
        let mut list = Self::new();
        for a in &self.entries {
            list.push(a.clone());
        }
        list
    }
}

impl Drop for Xattrs {
    fn drop(&mut self) {
        for _ in &self.entries {
            memory::free(AllocTag::XattrName);
            memory::free(AllocTag::XattrValue);
        }
        memory::free(AllocTag::Xattr);
    }
}

/// Returns the attribute list for mutation, copying it first if it is shared with another inode.
fn xattrs_mut(state: &mut InodeState) -> &mut Xattrs {
    if state.xattrs.is_none() {
        state.xattrs = Some(Arc::new(Xattrs::new()));
    }
    let attrs = state.xattrs.as_mut().unwrap();
    Arc::make_mut(attrs)
}

/// Sets the attribute `name` to `value` on the given inode.
///
/// Returns `ENOSPC` if the attributes would no longer fit in one block.
pub fn xattr_set(state: &mut InodeState, name: &str, value: &[u8]) -> io::Result<()> {
    let attrs = xattrs_mut(state);
    let old = attrs.entries.iter().position(|a| a.name == name);
    let projected = attrs.disk_size() + XATTR_HEADER + name.len() + value.len()
        - old
            .map(|i| XATTR_HEADER + name.len() + attrs.entries[i].value.len())
            .unwrap_or(0);
    if projected > BLOCK_SIZE as usize {
        return Err(errno(libc::ENOSPC));
    }
    match old {
        Some(i) => attrs.entries[i].value = value.to_vec(),
        None => attrs.push(Xattr {
            name: name.to_string(),
            value: value.to_vec(),
        }),
    }
    state.xattrdirty = true;
    Ok(())
}

/// Returns the value of the attribute `name` on the given inode.
///
/// Returns `ENODATA` if the attribute does not exist.
pub fn xattr_get(state: &InodeState, name: &str) -> io::Result<Vec<u8>> {
    state
        .xattrs
        .as_ref()
        .and_then(|attrs| attrs.entries.iter().find(|a| a.name == name))
        .map(|a| a.value.clone())
        .ok_or_else(|| errno(libc::ENODATA))
}

/// Returns the names of the attributes set on the given inode.
pub fn xattr_list(state: &InodeState) -> Vec<String> {
    state
        .xattrs
        .as_ref()
        .map(|attrs| attrs.entries.iter().map(|a| a.name.clone()).collect())
        .unwrap_or_default()
}

/// Removes the attribute `name` from the given inode.
///
/// Returns `ENODATA` if the attribute does not exist.
pub fn xattr_remove(state: &mut InodeState, name: &str) -> io::Result<()> {
    let attrs = xattrs_mut(state);
    let i = attrs
        .entries
        .iter()
        .position(|a| a.name == name)
        .ok_or_else(|| errno(libc::ENODATA))?;
    attrs.entries.remove(i);
    memory::free(AllocTag::XattrName);
    memory::free(AllocTag::XattrValue);
    state.xattrdirty = true;
    Ok(())
}

/// Shares the attributes of `parent` with a freshly cloned inode.
///
/// The list is copied by reference; the first mutation through [`xattr_set`] or [`xattr_remove`]
/// makes a private copy.
pub fn xattr_copy(state: &mut InodeState, parent: &InodeState) {
    state.xattrs = parent.xattrs.clone();
}

/// Reads the extended attributes of an inode from the device.
pub fn xattr_read(gfs: &Gfs, fs: &Fs, state: &mut InodeState) -> io::Result<()> {
    let block = state.dinode.xattr_block;
    if block == INVALID_BLOCK {
        return Ok(());
    }
    let mut buf = BlockBuf::with_tag(AllocTag::XattrBuf);
    gfs.read_block(fs, block, &mut buf)?;
    let data = buf.as_slice();
    let mut attrs = Xattrs::new();
    let mut off = 0;
    while off + XATTR_HEADER <= data.len() {
        let name_len = u16::from_ne_bytes(data[off..off + 2].try_into().unwrap()) as usize;
        if name_len == 0 {
            break;
        }
        let value_len = u16::from_ne_bytes(data[off + 2..off + 4].try_into().unwrap()) as usize;
        let name = String::from_utf8_lossy(&data[off + 4..off + 4 + name_len]).into_owned();
        let value = data[off + 4 + name_len..off + 4 + name_len + value_len].to_vec();
        attrs.push(Xattr {
            name,
            value,
        });
        off += XATTR_HEADER + name_len + value_len;
    }
    if !attrs.entries.is_empty() {
        state.xattrs = Some(Arc::new(attrs));
    }
    Ok(())
}

/// Writes the extended attributes of an inode to a newly allocated block.
///
/// The inode's `xattr_block` field is updated and the inode is marked dirty.
pub fn xattr_flush(gfs: &Gfs, fs: &Fs, state: &mut InodeState) -> io::Result<()> {
    let attrs = match &state.xattrs {
        Some(attrs) if !attrs.entries.is_empty() => attrs.clone(),
        _ => {
            state.dinode.xattr_block = INVALID_BLOCK;
            state.xattrdirty = false;
            state.dirty = true;
            return Ok(());
        }
    };
    let mut buf = BlockBuf::with_tag(AllocTag::XattrBuf);
    let mut off = 0;
    for a in &attrs.entries {
        let data = buf.as_mut_slice();
        data[off..off + 2].copy_from_slice(&(a.name.len() as u16).to_ne_bytes());
        data[off + 2..off + 4].copy_from_slice(&(a.value.len() as u16).to_ne_bytes());
        data[off + 4..off + 4 + a.name.len()].copy_from_slice(a.name.as_bytes());
        off += XATTR_HEADER + a.name.len();
        data[off..off + a.value.len()].copy_from_slice(&a.value);
        off += a.value.len();
    }
    let block = gfs.block_alloc(fs, 1, true)?;
    gfs.write_block(fs, &buf, block)?;
    state.dinode.xattr_block = block;
    state.xattrdirty = false;
    state.dirty = true;
    Ok(())
}

/// Releases the in-memory attributes of an inode.
pub fn xattr_free(state: &mut InodeState) {
    state.xattrs = None;
}
