// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Single- and dual-channel transfers over a mapped range.

use crate::ChannelSlot;
use crate::DeviceContext;
use crate::DmaError;
use crate::InvalidArgument;
use crate::MappedRange;
use crate::hardware::DmaRequest;
use crate::is_page_aligned;

/// Direction of a transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaDirection {
    /// From a mapped host range to device physical memory.
    HostToDevice,
    /// From device physical memory to a mapped host range.
    DeviceToHost,
}

/// How many channels a transfer uses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Let the engine choose. Currently the same as [`TransferMode::Single`],
    /// since two channels have shown no throughput gain.
    #[default]
    Auto,
    /// Use the direction's primary channel.
    Single,
    /// Spread the chunks over the direction's primary and secondary
    /// channels.
    Dual,
}

impl TryFrom<u32> for TransferMode {
    type Error = InvalidArgument;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => TransferMode::Auto,
            1 => TransferMode::Single,
            2 => TransferMode::Dual,
            _ => return Err(InvalidArgument::UnknownMode(value)),
        })
    }
}

fn dma_request(
    direction: DmaDirection,
    device_addr: u64,
    host_addr: u64,
    len: u64,
    want_cookie: bool,
) -> DmaRequest {
    let (src, dst) = match direction {
        DmaDirection::HostToDevice => (host_addr, device_addr),
        DmaDirection::DeviceToHost => (device_addr, host_addr),
    };
    DmaRequest {
        src,
        dst,
        len,
        want_cookie,
    }
}

impl DeviceContext {
    /// Copies `len` bytes from `range_offset` of `src` to device physical
    /// address `dest_dev`.
    pub fn host_to_device(
        &self,
        dest_dev: u64,
        src: &MappedRange,
        range_offset: u64,
        len: u64,
        mode: TransferMode,
    ) -> Result<(), DmaError> {
        self.transfer(
            DmaDirection::HostToDevice,
            dest_dev,
            src,
            range_offset,
            len,
            mode,
        )
    }

    /// Copies `len` bytes from device physical address `source_dev` to
    /// `range_offset` of `dest`.
    pub fn device_to_host(
        &self,
        dest: &MappedRange,
        range_offset: u64,
        source_dev: u64,
        len: u64,
        mode: TransferMode,
    ) -> Result<(), DmaError> {
        self.transfer(
            DmaDirection::DeviceToHost,
            source_dev,
            dest,
            range_offset,
            len,
            mode,
        )
    }

    /// Synchronously moves `len` bytes between `device_addr` and the window
    /// of `range` starting at `range_offset`.
    ///
    /// Returns once the last hardware request has completed. On error there
    /// is no indication of how much data was moved.
    pub fn transfer(
        &self,
        direction: DmaDirection,
        device_addr: u64,
        range: &MappedRange,
        range_offset: u64,
        len: u64,
        mode: TransferMode,
    ) -> Result<(), DmaError> {
        if range.context_id != self.id() {
            return Err(InvalidArgument::ForeignRange.into());
        }
        for (what, value) in [
            ("device address", device_addr),
            ("range offset", range_offset),
            ("transfer size", len),
        ] {
            if !is_page_aligned(value) {
                return Err(InvalidArgument::Unaligned { what, value }.into());
            }
        }
        if len == 0 {
            return Err(InvalidArgument::Empty {
                what: "transfer size",
            }
            .into());
        }
        if range_offset
            .checked_add(len)
            .is_none_or(|end| end > range.len())
        {
            tracing::warn!(
                offset = range_offset,
                len,
                range_size = range.len(),
                "transfer exceeds mapped range"
            );
            return Err(InvalidArgument::TransferOutOfRange {
                offset: range_offset,
                len,
                range_size: range.len(),
            }
            .into());
        }

        tracing::trace!(?direction, ?mode, device_addr, range_offset, len, "transfer");
        match mode {
            TransferMode::Auto | TransferMode::Single => {
                self.transfer_single(direction, device_addr, range, range_offset, len)
            }
            TransferMode::Dual => {
                self.transfer_dual(direction, device_addr, range, range_offset, len)
            }
        }
    }

    /// Submits one request per chunk on the direction's primary channel.
    ///
    /// Only the last request carries a cookie: the channel completes requests
    /// in order, so its completion implies the earlier ones.
    fn transfer_single(
        &self,
        direction: DmaDirection,
        mut device_addr: u64,
        range: &MappedRange,
        offset: u64,
        len: u64,
    ) -> Result<(), DmaError> {
        let lease = self.acquire(ChannelSlot::primary(direction))?;
        let position = range.find_chunk(offset)?;
        let chunks = range.chunks();

        let mut index = position.index;
        let mut chunk_offset = position.offset;
        let mut remaining = len;
        loop {
            let chunk = &chunks[index];
            let available = chunk.len() - chunk_offset;
            if available >= remaining {
                break;
            }
            lease.submit(&dma_request(
                direction,
                device_addr,
                chunk.aperture + chunk_offset,
                available,
                false,
            ))?;
            device_addr += available;
            remaining -= available;
            chunk_offset = 0;
            index += 1;
        }

        let pending = lease.finish(&dma_request(
            direction,
            device_addr,
            chunks[index].aperture + chunk_offset,
            remaining,
            true,
        ))?;
        self.wait(pending)
    }

    /// Alternates intermediate chunks between the direction's primary and
    /// secondary channels, then submits the final two chunks one per channel
    /// with cookies and waits for both.
    fn transfer_dual(
        &self,
        direction: DmaDirection,
        mut device_addr: u64,
        range: &MappedRange,
        offset: u64,
        len: u64,
    ) -> Result<(), DmaError> {
        let primary = self.acquire(ChannelSlot::primary(direction))?;
        let secondary = self.acquire(ChannelSlot::secondary(direction))?;
        let position = range.find_chunk(offset)?;
        let chunks = range.chunks();

        if position.offset + len <= position.chunk_len {
            secondary.release();
            let pending = primary.finish(&dma_request(
                direction,
                device_addr,
                chunks[position.index].aperture + position.offset,
                len,
                true,
            ))?;
            return self.wait(pending);
        }

        // At least two chunks are involved from here on.
        let mut index = position.index;
        let mut chunk_offset = position.offset;
        let mut available = position.chunk_len - position.offset;
        let mut remaining = len;
        while available + chunks[index + 1].len() < remaining {
            // Odd chunks go to the primary channel, even ones to the
            // secondary.
            let lease = if index % 2 == 1 { &primary } else { &secondary };
            lease.submit(&dma_request(
                direction,
                device_addr,
                chunks[index].aperture + chunk_offset,
                available,
                false,
            ))?;
            device_addr += available;
            remaining -= available;
            chunk_offset = 0;
            index += 1;
            available = chunks[index].len();
        }

        let first = primary.finish(&dma_request(
            direction,
            device_addr,
            chunks[index].aperture + chunk_offset,
            available,
            true,
        ))?;
        device_addr += available;
        remaining -= available;

        let second = match secondary.finish(&dma_request(
            direction,
            device_addr,
            chunks[index + 1].aperture,
            remaining,
            true,
        )) {
            Ok(pending) => pending,
            Err(err) => {
                self.abandon(first);
                return Err(err);
            }
        };

        // If the first channel times out there is no point waiting for the
        // second; its request is left in flight.
        if let Err(err) = self.wait(first) {
            self.abandon(second);
            return Err(err);
        }
        self.wait(second)
    }
}

#[cfg(test)]
mod tests {
    use super::TransferMode;
    use crate::InvalidArgument;
    use test_with_tracing::test;

    #[test]
    fn mode_from_flags() {
        assert_eq!(TransferMode::try_from(0), Ok(TransferMode::Auto));
        assert_eq!(TransferMode::try_from(1), Ok(TransferMode::Single));
        assert_eq!(TransferMode::try_from(2), Ok(TransferMode::Dual));
        assert_eq!(
            TransferMode::try_from(3),
            Err(InvalidArgument::UnknownMode(3))
        );
    }
}
