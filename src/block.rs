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

//! Block device access and block allocation.

use crate::layout::Superblock;
use crate::layout::BLOCK_SIZE;
use crate::layout::INVALID_BLOCK;
use crate::memory;
use crate::memory::AllocTag;
use crate::util::errno;
use libc::ioctl;
use log::debug;
use log::error;
use std::alloc;
use std::alloc::Layout;
use std::ffi::c_long;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Error;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// ioctl macro: Command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl macro: Read command.
macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
    };
}

/// ioctl command: Get size of disk in bytes.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);

/// The memory layout of a block buffer.
const BLOCK_LAYOUT: Layout =
    unsafe { Layout::from_size_align_unchecked(BLOCK_SIZE as usize, BLOCK_SIZE as usize) };

/// A block-sized, block-aligned I/O buffer.
///
/// The alignment makes the buffer compatible with direct I/O on the device. The buffer carries
/// the allocation category it is charged to, so codecs with a category of their own account
/// their buffers there.
pub struct BlockBuf {
    ptr: NonNull<u8>,
    tag: AllocTag,
}

impl BlockBuf {
    /// Allocates a zeroed buffer charged to the generic block buffer category.
    pub fn new() -> Self {
        Self::with_tag(AllocTag::BlockBuf)
    }

    /// Allocates a zeroed buffer charged to the given category.
    pub fn with_tag(tag: AllocTag) -> Self {
        let ptr = unsafe { alloc::alloc_zeroed(BLOCK_LAYOUT) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(BLOCK_LAYOUT);
        };
        memory::alloc(tag);
        Self {
            ptr,
            tag,
        }
    }

    /// Returns the buffer's content.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), BLOCK_SIZE as usize) }
    }

    /// Returns the buffer's content for writing.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), BLOCK_SIZE as usize) }
    }

    /// Fills the buffer with zeros.
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl Default for BlockBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BlockBuf {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.ptr.as_ptr(), BLOCK_LAYOUT);
        }
        memory::free(self.tag);
    }
}

unsafe impl Send for BlockBuf {}
unsafe impl Sync for BlockBuf {}

/// Returns the size of the given device in bytes.
fn get_device_size(dev: &File) -> io::Result<u64> {
    let metadata = dev.metadata()?;
    let file_type = metadata.file_type();
    if file_type.is_block_device() || file_type.is_char_device() {
        let mut size = 0u64;
        let ret = unsafe { ioctl(dev.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
        if ret < 0 {
            return Err(Error::last_os_error());
        }
        Ok(size)
    } else if file_type.is_file() {
        Ok(metadata.len())
    } else {
        Ok(0)
    }
}

/// An open block device.
pub struct Device {
    /// The device file.
    file: File,
    /// The size of the device in bytes.
    size: u64,
}

impl Device {
    /// Opens the device at the given path with exclusive, synchronous semantics.
    ///
    /// Block devices are opened with direct I/O. Regular files are accepted as well so a plain
    /// file can serve as a device.
    pub fn open(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let mut flags = libc::O_SYNC | libc::O_EXCL;
        if metadata.file_type().is_block_device() {
            flags |= libc::O_DIRECT;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(flags)
            .open(path)?;
        let size = get_device_size(&file)?;
        Ok(Self {
            file,
            size,
        })
    }

    /// Returns the size of the device in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reads the block at the given address into `buf`.
    ///
    /// Any device failure surfaces as `EIO`.
    pub fn read_block(&self, block: u64, buf: &mut BlockBuf) -> io::Result<()> {
        assert_ne!(block, INVALID_BLOCK);
        self.file
            .read_exact_at(buf.as_mut_slice(), block * BLOCK_SIZE)
            .map_err(|e| {
                error!("read of block {block} failed: {e}");
                errno(libc::EIO)
            })
    }

    /// Writes `buf` to the block at the given address.
    ///
    /// Any device failure surfaces as `EIO`.
    pub fn write_block(&self, buf: &BlockBuf, block: u64) -> io::Result<()> {
        assert_ne!(block, INVALID_BLOCK);
        self.file
            .write_all_at(buf.as_slice(), block * BLOCK_SIZE)
            .map_err(|e| {
                error!("write of block {block} failed: {e}");
                errno(libc::EIO)
            })
    }

    /// Flushes pending writes to the device.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// Allocates `count` contiguous blocks from the superblock's free space.
///
/// Returns the address of the first block, or `ENOSPC` if the device is full.
pub fn block_alloc(sb: &Superblock, count: u64) -> io::Result<u64> {
    let start = sb.nblock.fetch_add(count, Relaxed);
    if start + count > sb.tblocks {
        sb.nblock.fetch_sub(count, Relaxed);
        return Err(errno(libc::ENOSPC));
    }
    Ok(start)
}

/// Records `count` blocks as freed.
///
/// The allocator hands out fresh blocks only; freed blocks are accounted in `freed` for a future
/// reclaim pass.
pub fn block_free(freed: &AtomicU64, count: u64) {
    freed.fetch_add(count, Relaxed);
    debug!("freed {count} blocks");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn buf_alignment() {
        let buf = BlockBuf::new();
        assert_eq!(buf.as_slice().as_ptr() as u64 % BLOCK_SIZE, 0);
        assert!(buf.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn device_read_write() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(BLOCK_SIZE * 16).unwrap();
        let dev = Device::open(file.path()).unwrap();
        assert_eq!(dev.size(), BLOCK_SIZE * 16);

        let mut buf = BlockBuf::new();
        buf.as_mut_slice()[0] = 0xab;
        buf.as_mut_slice()[BLOCK_SIZE as usize - 1] = 0xcd;
        dev.write_block(&buf, 3).unwrap();

        let mut read = BlockBuf::new();
        dev.read_block(3, &mut read).unwrap();
        assert_eq!(read.as_slice(), buf.as_slice());
    }

    #[test]
    fn short_device_read_is_eio() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(BLOCK_SIZE * 2).unwrap();
        let dev = Device::open(file.path()).unwrap();
        let mut buf = BlockBuf::new();
        let err = dev.read_block(8, &mut buf).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
    }

    #[test]
    fn tagged_buffer_accounting() {
        let before = memory::in_use(AllocTag::XattrBuf);
        let buf = BlockBuf::with_tag(AllocTag::XattrBuf);
        assert_eq!(memory::in_use(AllocTag::XattrBuf), before + 1);
        drop(buf);
        assert_eq!(memory::in_use(AllocTag::XattrBuf), before);
    }

    #[test]
    fn alloc_exhaustion() {
        let sb = Superblock::format(BLOCK_SIZE * 8);
        let first = block_alloc(&sb, 4).unwrap();
        assert_eq!(first, crate::layout::START_BLOCK);
        let second = block_alloc(&sb, 3).unwrap();
        assert_eq!(second, first + 4);
        let err = block_alloc(&sb, 2).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));
    }
}
