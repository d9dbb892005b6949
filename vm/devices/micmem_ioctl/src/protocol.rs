// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control file ioctl command codes and argument layouts.
//!
//! Codes are built the way Linux `_IOW` builds them, so they match the values
//! user space computes from the C header.

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Ioctl type shared by every control command.
pub const MICMEM_IOC_TYPE: u8 = b'c';

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;
const IOC_WRITE: u32 = 1;

const fn iow(nr: u8, size: usize) -> u32 {
    (IOC_WRITE << IOC_DIRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
        | ((MICMEM_IOC_TYPE as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
}

/// Copies host memory to the device. Argument: [`Host2DevArgs`].
pub const IOCTL_MICMEM_HOST2DEV: u32 = iow(15, size_of::<Host2DevArgs>());
/// Copies device memory to the host. Argument: [`Dev2HostArgs`].
pub const IOCTL_MICMEM_DEV2HOST: u32 = iow(16, size_of::<Dev2HostArgs>());
/// Opens a board. Argument: the board number as a `u32`.
pub const IOCTL_MICMEM_OPENDEV: u32 = iow(17, size_of::<u32>());
/// Closes a board. Argument: the board number as a `u32`.
pub const IOCTL_MICMEM_CLOSEDEV: u32 = iow(18, size_of::<u32>());
/// Maps pinned memory for a board. Argument: [`MapRangeArgs`].
pub const IOCTL_MICMEM_MAPRANGE: u32 = iow(19, size_of::<MapRangeArgs>());
/// Unmaps a range. Argument: [`UnmapRangeArgs`].
pub const IOCTL_MICMEM_UNMAPRANGE: u32 = iow(20, size_of::<UnmapRangeArgs>());
/// Pins user memory. Argument: [`PinMemArgs`].
pub const IOCTL_MICMEM_PINMEM: u32 = iow(21, size_of::<PinMemArgs>());
/// Unpins user memory. Argument: the user address as a `u64`.
pub const IOCTL_MICMEM_UNPINMEM: u32 = iow(22, size_of::<u64>());

/// Let the engine pick the channel count.
pub const MICMEM_AUTO: u32 = 0;
/// Use one channel.
pub const MICMEM_SINGLE: u32 = 1;
/// Use both channels of the direction.
pub const MICMEM_DUAL: u32 = 2;

#[expect(missing_docs)] // self-explanatory fields
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Host2DevArgs {
    pub bdnum: u32,
    /// One of the `MICMEM_*` mode values.
    pub flags: u32,
    /// User address of the mapped range.
    pub src: u64,
    pub src_offset: u64,
    pub dest_dev: u64,
    pub size: u64,
}

#[expect(missing_docs)] // self-explanatory fields
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Dev2HostArgs {
    pub bdnum: u32,
    /// One of the `MICMEM_*` mode values.
    pub flags: u32,
    /// User address of the mapped range.
    pub dest: u64,
    pub dest_offset: u64,
    pub source_dev: u64,
    pub size: u64,
}

#[expect(missing_docs)] // self-explanatory fields
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MapRangeArgs {
    pub bdnum: u32,
    pub rsvd: u32,
    pub addr: u64,
    pub size: u64,
}

#[expect(missing_docs)] // self-explanatory fields
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct UnmapRangeArgs {
    pub bdnum: u32,
    pub rsvd: u32,
    pub addr: u64,
}

#[expect(missing_docs)] // self-explanatory fields
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PinMemArgs {
    pub addr: u64,
    pub size: u64,
}

const _: () = assert!(size_of::<Host2DevArgs>() == 40);
const _: () = assert!(size_of::<Dev2HostArgs>() == 40);
const _: () = assert!(size_of::<MapRangeArgs>() == 24);
const _: () = assert!(size_of::<UnmapRangeArgs>() == 16);
const _: () = assert!(size_of::<PinMemArgs>() == 16);

/// A decoded control command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    /// `IOCTL_MICMEM_HOST2DEV`
    HostToDevice(Host2DevArgs),
    /// `IOCTL_MICMEM_DEV2HOST`
    DeviceToHost(Dev2HostArgs),
    /// `IOCTL_MICMEM_OPENDEV`
    OpenDevice(u32),
    /// `IOCTL_MICMEM_CLOSEDEV`
    CloseDevice(u32),
    /// `IOCTL_MICMEM_MAPRANGE`
    MapRange(MapRangeArgs),
    /// `IOCTL_MICMEM_UNMAPRANGE`
    UnmapRange(UnmapRangeArgs),
    /// `IOCTL_MICMEM_PINMEM`
    PinMemory(PinMemArgs),
    /// `IOCTL_MICMEM_UNPINMEM`
    UnpinMemory(u64),
}

/// A command that could not be decoded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The command code is not a control command.
    UnknownCommand(u32),
    /// The argument buffer is too small for the command.
    ShortArgument {
        /// The command code.
        cmd: u32,
        /// Bytes needed.
        expected: usize,
        /// Bytes provided.
        actual: usize,
    },
}

fn read<T: FromBytes>(cmd: u32, arg: &[u8]) -> Result<T, DecodeError> {
    T::read_from_prefix(arg)
        .map(|(value, _)| value)
        .map_err(|_| DecodeError::ShortArgument {
            cmd,
            expected: size_of::<T>(),
            actual: arg.len(),
        })
}

impl Command {
    /// Decodes command `cmd` with argument bytes `arg`. Trailing bytes are
    /// ignored.
    pub fn decode(cmd: u32, arg: &[u8]) -> Result<Self, DecodeError> {
        Ok(match cmd {
            IOCTL_MICMEM_HOST2DEV => Command::HostToDevice(read(cmd, arg)?),
            IOCTL_MICMEM_DEV2HOST => Command::DeviceToHost(read(cmd, arg)?),
            IOCTL_MICMEM_OPENDEV => Command::OpenDevice(read(cmd, arg)?),
            IOCTL_MICMEM_CLOSEDEV => Command::CloseDevice(read(cmd, arg)?),
            IOCTL_MICMEM_MAPRANGE => Command::MapRange(read(cmd, arg)?),
            IOCTL_MICMEM_UNMAPRANGE => Command::UnmapRange(read(cmd, arg)?),
            IOCTL_MICMEM_PINMEM => Command::PinMemory(read(cmd, arg)?),
            IOCTL_MICMEM_UNPINMEM => Command::UnpinMemory(read(cmd, arg)?),
            _ => return Err(DecodeError::UnknownCommand(cmd)),
        })
    }

    /// The command name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::HostToDevice(_) => "host2dev",
            Command::DeviceToHost(_) => "dev2host",
            Command::OpenDevice(_) => "opendev",
            Command::CloseDevice(_) => "closedev",
            Command::MapRange(_) => "maprange",
            Command::UnmapRange(_) => "unmaprange",
            Command::PinMemory(_) => "pinmem",
            Command::UnpinMemory(_) => "unpinmem",
        }
    }
}
