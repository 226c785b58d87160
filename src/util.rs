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

//! Utility functions shared by the on-disk codecs.

use std::io;
use std::mem::size_of;
use std::ptr;
use std::slice;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Returns the current timestamp since the Unix epoch.
pub fn get_timestamp() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock panic!")
}

/// Reinterprets the given reference as a slice of bytes.
///
/// The type `T` must be `repr(C)` with no invalid byte patterns, as the bytes are written to disk
/// as-is.
pub fn reinterpret<T>(val: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(val as *const T as *const u8, size_of::<T>()) }
}

/// Reads a value of type `T` from the beginning of the given byte slice.
///
/// The type `T` must be `repr(C)` and valid for any byte pattern.
///
/// If the slice is too short to contain a `T`, the function panics.
pub fn read_struct<T>(buf: &[u8]) -> T {
    assert!(buf.len() >= size_of::<T>());
    unsafe { ptr::read_unaligned(buf.as_ptr() as *const T) }
}

/// Returns an errno-style I/O error with the given code.
pub fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

#[cfg(test)]
mod test {
    use super::*;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pair {
        a: u64,
        b: u64,
    }

    #[test]
    fn reinterpret_read_struct() {
        let p = Pair {
            a: 0x0102030405060708,
            b: 42,
        };
        let bytes = reinterpret(&p);
        assert_eq!(bytes.len(), 16);
        let q: Pair = read_struct(bytes);
        assert_eq!(p, q);
    }

    #[test]
    fn errno_roundtrip() {
        let e = errno(libc::ENOENT);
        assert_eq!(e.raw_os_error(), Some(libc::ENOENT));
    }
}
