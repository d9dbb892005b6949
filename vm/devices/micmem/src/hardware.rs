// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces to the hardware the engine drives.
//!
//! The engine never touches registers or page tables directly. Everything it
//! needs from the platform goes through [`DeviceBacking`]: aperture mapping,
//! channel allocation, request submission and completion polling.

use crate::PinnedRegion;
use std::fmt;
use thiserror::Error;

/// A negative status returned by the hardware or platform layer.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
#[error("hardware status {code}")]
pub struct HardwareError {
    code: i32,
}

impl HardwareError {
    /// Wraps a status code. Non-negative codes are normalized to `EIO`.
    pub fn new(code: i32) -> Self {
        let code = if code < 0 { code } else { crate::errno::EIO };
        Self { code }
    }

    /// The negative status code.
    pub fn code(&self) -> i32 {
        self.code
    }
}

/// Opaque identifier of a hardware DMA channel, as handed out by
/// [`DeviceBacking::allocate_channel`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u32);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// A completion cookie for a submitted request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DmaCookie(pub u32);

/// A single hardware copy request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaRequest {
    /// Source physical address (host aperture or device physical).
    pub src: u64,
    /// Destination physical address.
    pub dst: u64,
    /// Length in bytes.
    pub len: u64,
    /// Whether the caller will poll for this request's completion.
    pub want_cookie: bool,
}

/// The hardware operations consumed by the engine.
pub trait DeviceBacking: Send + Sync {
    /// Returns a device ID for diagnostics.
    fn id(&self) -> &str;

    /// Takes a reference on the device, powering it up if necessary.
    fn get_reference(&self) -> Result<(), HardwareError>;

    /// Drops a reference taken with [`Self::get_reference`].
    fn put_reference(&self);

    /// Allocates a DMA channel for exclusive use. Failure may be transient.
    fn allocate_channel(&self) -> Result<ChannelHandle, HardwareError>;

    /// Returns a channel allocated with [`Self::allocate_channel`].
    fn free_channel(&self, channel: ChannelHandle);

    /// Reserves an allocated channel for the duration of one transfer.
    /// Failure may be transient.
    fn request_channel(&self, channel: ChannelHandle) -> Result<(), HardwareError>;

    /// Ends a reservation taken with [`Self::request_channel`]. Requests
    /// already submitted keep executing.
    fn release_channel(&self, channel: ChannelHandle);

    /// Queues a request on a reserved channel. Requests on one channel
    /// execute in submission order. The returned cookie is only meaningful
    /// if `request.want_cookie` was set.
    fn submit(&self, channel: ChannelHandle, request: &DmaRequest)
    -> Result<DmaCookie, HardwareError>;

    /// Returns true once the request identified by `cookie` has completed.
    fn poll_completion(&self, channel: ChannelHandle, cookie: DmaCookie) -> bool;

    /// Maps `len` bytes of host physical memory at `phys` into the device
    /// aperture, returning the device-visible address.
    fn map_to_aperture(&self, phys: u64, len: u64) -> Result<u64, HardwareError>;

    /// Unmaps an aperture mapping returned by [`Self::map_to_aperture`].
    fn unmap_from_aperture(&self, aperture: u64, len: u64);
}

/// Pins host memory so that it stays resident at fixed physical addresses.
pub trait HostPinner: Send + Sync {
    /// Pins `len` bytes of host memory at user address `addr` for read and
    /// write access.
    fn pin(&self, addr: u64, len: u64) -> Result<PinnedRegion, HardwareError>;

    /// Unpins a region returned by [`Self::pin`].
    fn unpin(&self, region: PinnedRegion);
}
