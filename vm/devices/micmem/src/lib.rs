// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scatter-gather DMA between pinned host memory and an accelerator's
//! physical address space.
//!
//! A [`MappedRange`] is built once from a [`PinnedRegion`] by
//! [`DeviceContext::map_range`]: the requested byte window of the region is
//! split into its physically contiguous chunks, and each chunk is mapped into
//! the device aperture. Any number of transfers can then be issued against
//! the range with [`DeviceContext::host_to_device`] and
//! [`DeviceContext::device_to_host`]. Each transfer reserves one or two of
//! the context's four hardware channels, submits one hardware request per
//! chunk, and blocks until the final request completes or times out.
//!
//! The engine does no locking of its own. Callers must serialize structural
//! operations (opening and closing contexts, mapping and unmapping ranges)
//! and keep ranges alive for the duration of any transfer against them.

#![forbid(unsafe_code)]

mod channel;
pub mod emulated;
pub mod hardware;
mod range;
mod transfer;

#[cfg(test)]
mod tests;

pub use channel::ChannelSlot;
pub use channel::ChannelState;
pub use channel::DeviceContext;
pub use channel::DeviceContextConfig;
pub use channel::DmaTimeouts;
pub use channel::TeardownReport;
pub use hardware::HardwareError;
pub use range::ChunkPosition;
pub use range::MappedChunk;
pub use range::MappedRange;
pub use range::PhysChunk;
pub use range::PinnedRegion;
pub use range::coalesce;
pub use transfer::DmaDirection;
pub use transfer::TransferMode;

use thiserror::Error;

/// The page size used for all DMA addresses and lengths.
pub const PAGE_SIZE: usize = 4096;
/// [`PAGE_SIZE`] as a `u64`.
pub const PAGE_SIZE64: u64 = PAGE_SIZE as u64;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Negative errno values used by [`DmaError::errno`].
pub mod errno {
    /// Operation not permitted.
    pub const EPERM: i32 = -1;
    /// I/O error.
    pub const EIO: i32 = -5;
    /// Out of memory.
    pub const ENOMEM: i32 = -12;
    /// Bad address.
    pub const EFAULT: i32 = -14;
    /// Device or resource busy.
    pub const EBUSY: i32 = -16;
    /// No such device.
    pub const ENODEV: i32 = -19;
    /// Invalid argument.
    pub const EINVAL: i32 = -22;
    /// Timed out.
    pub const ETIMEDOUT: i32 = -110;
}

/// Returns true if `value` is a multiple of [`PAGE_SIZE`].
pub fn is_page_aligned(value: u64) -> bool {
    value % PAGE_SIZE64 == 0
}

/// A violated argument constraint.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidArgument {
    /// A value that must be page aligned is not.
    #[error("{what} {value:#x} is not page aligned")]
    Unaligned {
        /// The name of the offending value.
        what: &'static str,
        /// The offending value.
        value: u64,
    },
    /// A length that must be non-zero is zero.
    #[error("{what} is empty")]
    Empty {
        /// The name of the offending value.
        what: &'static str,
    },
    /// A mapping request extends past the end of the pinned region.
    #[error("window {offset:#x}+{len:#x} exceeds pinned region of {region_size:#x} bytes")]
    WindowOutOfRange {
        /// Requested offset into the region.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Size of the pinned region.
        region_size: u64,
    },
    /// A transfer extends past the end of the mapped range.
    #[error("transfer {offset:#x}+{len:#x} exceeds mapped range of {range_size:#x} bytes")]
    TransferOutOfRange {
        /// Requested offset into the range.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Size of the mapped range.
        range_size: u64,
    },
    /// A chunk lookup at or past the end of a mapped range.
    #[error("offset {offset:#x} is not inside a range of {range_size:#x} bytes")]
    OffsetOutOfRange {
        /// The looked up offset.
        offset: u64,
        /// Size of the mapped range.
        range_size: u64,
    },
    /// A range was used with a context other than the one that mapped it.
    #[error("range was mapped by a different device context")]
    ForeignRange,
    /// An unknown transfer mode value.
    #[error("unknown transfer mode {0}")]
    UnknownMode(u32),
}

/// An error from the DMA engine.
#[derive(Debug, Error)]
pub enum DmaError {
    /// An argument violated an alignment or bounds constraint.
    #[error("invalid argument")]
    InvalidArgument(#[from] InvalidArgument),
    /// A channel could not be reserved before the acquire deadline.
    #[error("dma channel {slot} busy")]
    Busy {
        /// The channel that could not be reserved.
        slot: ChannelSlot,
    },
    /// A channel is quarantined after an abandoned request.
    #[error("dma channel {slot} is quarantined after a timed out request")]
    ChannelTainted {
        /// The quarantined channel.
        slot: ChannelSlot,
    },
    /// The hardware rejected a request.
    #[error("dma submission failed on channel {slot}")]
    Submission {
        /// The channel the request was submitted to.
        slot: ChannelSlot,
        /// The hardware status.
        #[source]
        source: HardwareError,
    },
    /// A request did not complete before the completion deadline.
    #[error("dma completion on channel {slot} timed out")]
    Timeout {
        /// The channel whose request was abandoned.
        slot: ChannelSlot,
    },
    /// A chunk could not be mapped into the device aperture.
    #[error("failed to map {len:#x} bytes at {phys:#x} into the device aperture")]
    ApertureMap {
        /// Host physical address of the chunk.
        phys: u64,
        /// Length of the chunk.
        len: u64,
        /// The hardware status.
        #[source]
        source: HardwareError,
    },
    /// Descriptor allocation failed.
    #[error("out of memory allocating range descriptors")]
    OutOfMemory,
    /// The device could not be referenced or its DMA engine opened.
    #[error("device {device} unavailable")]
    Device {
        /// The device ID.
        device: String,
        /// The underlying failure.
        #[source]
        source: HardwareError,
    },
}

impl DmaError {
    /// The negative errno value conventionally reported for this error.
    pub fn errno(&self) -> i32 {
        match self {
            DmaError::InvalidArgument(_) => errno::EINVAL,
            DmaError::Busy { .. } | DmaError::ChannelTainted { .. } => errno::EBUSY,
            DmaError::Submission { source, .. } => source.code(),
            DmaError::Timeout { .. } => errno::ETIMEDOUT,
            DmaError::ApertureMap { .. } | DmaError::OutOfMemory => errno::ENOMEM,
            DmaError::Device { source, .. } => source.code(),
        }
    }
}
