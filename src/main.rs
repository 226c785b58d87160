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

//! The `layerfs` command manages devices holding a layered filesystem.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::Ordering::Relaxed;

/// Writes an error to stderr, then exits.
fn error<M: fmt::Display>(msg: M) -> ! {
    eprintln!("layerfs: error: {msg}");
    exit(1);
}

/// Prints the command's usage.
fn print_usage() {
    eprintln!("Usage:");
    eprintln!(" layerfs format <device>");
    eprintln!(" layerfs info <device>");
    eprintln!();
    eprintln!("Creates or inspects a layered filesystem on a device.");
}

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// The action to perform.
    command: String,
    /// The path to the device.
    device_path: Option<PathBuf>,
    /// If true, print command line help.
    help: bool,
}

fn parse_args() -> Args {
    let mut res: Args = Default::default();
    for arg in env::args_os().skip(1) {
        match arg.to_str() {
            Some("-h" | "--help") => res.help = true,
            Some(cmd @ ("format" | "info")) if res.command.is_empty() => {
                res.command = cmd.to_string();
            }
            _ => res.device_path = Some(PathBuf::from(arg)),
        }
    }
    res
}

fn main() {
    env_logger::init();
    let args = parse_args();
    if args.help || args.command.is_empty() {
        print_usage();
        exit(if args.help {
            0
        } else {
            1
        });
    }
    let device_path = args.device_path.unwrap_or_else(|| {
        error("specify path to a device");
    });
    match args.command.as_str() {
        "format" => {
            let tblocks = layerfs::format_device(&device_path).unwrap_or_else(|e| {
                error(format_args!("{}: {e}", device_path.display()));
            });
            println!("{}: {tblocks} blocks", device_path.display());
        }
        "info" => {
            let sb = layerfs::read_superblock(&device_path).unwrap_or_else(|e| {
                error(format_args!("{}: {e}", device_path.display()));
            });
            if sb.version != layerfs::layout::VERSION || sb.magic != layerfs::layout::SUPER_MAGIC
            {
                error(format_args!(
                    "{}: no filesystem found",
                    device_path.display()
                ));
            }
            println!("version: {}", sb.version);
            println!("total blocks: {}", sb.tblocks);
            println!("next free block: {}", sb.nblock.load(Relaxed));
            println!("next free inode: {}", sb.ninode.load(Relaxed));
            println!("live inodes: {}", sb.inodes.load(Relaxed));
            println!("mount count: {}", sb.mounts);
        }
        _ => unreachable!(),
    }
}
