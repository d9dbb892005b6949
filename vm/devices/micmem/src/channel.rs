// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device contexts and the per-context channel arena.
//!
//! A context reserves four hardware channels when it is opened: a primary and
//! a secondary channel for each transfer direction. Each transfer then leases
//! the channel(s) it needs from the arena for as long as it is submitting
//! requests. Arena state is kept in atomics; the engine takes no locks.

use crate::DmaDirection;
use crate::DmaError;
use crate::MappedRange;
use crate::PinnedRegion;
use crate::hardware::ChannelHandle;
use crate::hardware::DeviceBacking;
use crate::hardware::DmaCookie;
use crate::hardware::DmaRequest;
use crate::hardware::HardwareError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

/// One of the four channels owned by a [`DeviceContext`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChannelSlot {
    /// Primary host-to-device channel.
    HostToDevice,
    /// Primary device-to-host channel.
    DeviceToHost,
    /// Secondary host-to-device channel, used by dual-channel transfers.
    HostToDeviceSecondary,
    /// Secondary device-to-host channel, used by dual-channel transfers.
    DeviceToHostSecondary,
}

impl ChannelSlot {
    /// All slots, in the order they are allocated from the hardware.
    pub const ALL: [ChannelSlot; 4] = [
        ChannelSlot::DeviceToHost,
        ChannelSlot::HostToDevice,
        ChannelSlot::DeviceToHostSecondary,
        ChannelSlot::HostToDeviceSecondary,
    ];

    /// The primary slot for `direction`.
    pub fn primary(direction: DmaDirection) -> Self {
        match direction {
            DmaDirection::HostToDevice => ChannelSlot::HostToDevice,
            DmaDirection::DeviceToHost => ChannelSlot::DeviceToHost,
        }
    }

    /// The secondary slot for `direction`.
    pub fn secondary(direction: DmaDirection) -> Self {
        match direction {
            DmaDirection::HostToDevice => ChannelSlot::HostToDeviceSecondary,
            DmaDirection::DeviceToHost => ChannelSlot::DeviceToHostSecondary,
        }
    }

    fn index(self) -> usize {
        match self {
            ChannelSlot::DeviceToHost => 0,
            ChannelSlot::HostToDevice => 1,
            ChannelSlot::DeviceToHostSecondary => 2,
            ChannelSlot::HostToDeviceSecondary => 3,
        }
    }
}

impl fmt::Display for ChannelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            ChannelSlot::HostToDevice => "h2d",
            ChannelSlot::DeviceToHost => "d2h",
            ChannelSlot::HostToDeviceSecondary => "h2d2",
            ChannelSlot::DeviceToHostSecondary => "d2h2",
        })
    }
}

/// Arena accounting for one channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Available to the next transfer.
    Free,
    /// Leased by an in-progress transfer.
    Reserved,
    /// Has a request in flight that was abandoned by a timeout or a failed
    /// transfer. Unavailable until [`DeviceContext::recover_channel`].
    Quarantined,
}

/// Deadlines for bounded waits.
#[derive(Debug, Copy, Clone)]
pub struct DmaTimeouts {
    /// How long to wait for a submitted request to complete.
    pub completion: Duration,
    /// How long to keep retrying channel allocation and reservation.
    pub channel_acquire: Duration,
}

impl Default for DmaTimeouts {
    fn default() -> Self {
        Self {
            completion: Duration::from_secs(5),
            channel_acquire: Duration::from_secs(5),
        }
    }
}

/// Configuration for [`DeviceContext::open`].
#[derive(Debug, Clone, Default)]
pub struct DeviceContextConfig {
    /// Wait deadlines.
    pub timeouts: DmaTimeouts,
}

/// The outcome of tearing down a [`DeviceContext`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Channels returned to the hardware.
    pub freed: Vec<ChannelSlot>,
    /// Quarantined channels deliberately not returned, because the hardware
    /// may still be executing a request on them.
    pub leaked: Vec<ChannelSlot>,
}

const NO_COOKIE: u64 = 0;
const COOKIE_VALID: u64 = 1 << 32;

struct ChannelEntry {
    handle: ChannelHandle,
    reserved: AtomicBool,
    quarantined: AtomicBool,
    /// Cookie of the abandoned request, tagged with `COOKIE_VALID`.
    abandoned: AtomicU64,
}

impl ChannelEntry {
    fn new(handle: ChannelHandle) -> Self {
        Self {
            handle,
            reserved: AtomicBool::new(false),
            quarantined: AtomicBool::new(false),
            abandoned: AtomicU64::new(NO_COOKIE),
        }
    }

    fn state(&self) -> ChannelState {
        if self.quarantined.load(Ordering::Acquire) {
            ChannelState::Quarantined
        } else if self.reserved.load(Ordering::Acquire) {
            ChannelState::Reserved
        } else {
            ChannelState::Free
        }
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// DMA state for one device: four reserved channels and a reference on the
/// device.
///
/// Dropping the context tears it down the same way as [`Self::close`].
pub struct DeviceContext {
    id: u64,
    device: Arc<dyn DeviceBacking>,
    channels: [ChannelEntry; 4],
    config: DeviceContextConfig,
    closed: bool,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.id)
            .field("device", &self.device.id())
            .field("channels", &self.channel_states())
            .finish()
    }
}

impl DeviceContext {
    /// Takes a reference on `device` and reserves the context's four
    /// channels.
    ///
    /// Channel allocation is retried until the acquire deadline. On failure
    /// everything acquired so far is given back.
    pub fn open(
        device: Arc<dyn DeviceBacking>,
        config: DeviceContextConfig,
    ) -> Result<Self, DmaError> {
        device
            .get_reference()
            .map_err(|source| DmaError::Device {
                device: device.id().to_owned(),
                source,
            })?;

        let mut handles = Vec::with_capacity(ChannelSlot::ALL.len());
        for slot in ChannelSlot::ALL {
            match allocate_channel(&*device, config.timeouts.channel_acquire) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    tracing::error!(
                        device = device.id(),
                        %slot,
                        error = &err as &dyn std::error::Error,
                        "failed to reserve dma channel"
                    );
                    for handle in handles {
                        device.free_channel(handle);
                    }
                    device.put_reference();
                    return Err(DmaError::Busy { slot });
                }
            }
        }

        let channels = [
            ChannelEntry::new(handles[0]),
            ChannelEntry::new(handles[1]),
            ChannelEntry::new(handles[2]),
            ChannelEntry::new(handles[3]),
        ];
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(device = device.id(), context = id, "opened dma context");
        Ok(Self {
            id,
            device,
            channels,
            config,
            closed: false,
        })
    }

    /// The ID of the underlying device.
    pub fn device_id(&self) -> &str {
        self.device.id()
    }

    /// The configuration the context was opened with.
    pub fn config(&self) -> &DeviceContextConfig {
        &self.config
    }

    /// The hardware channel backing `slot`.
    pub fn channel_handle(&self, slot: ChannelSlot) -> ChannelHandle {
        self.entry(slot).handle
    }

    /// Arena accounting for every slot.
    pub fn channel_states(&self) -> [(ChannelSlot, ChannelState); 4] {
        ChannelSlot::ALL.map(|slot| (slot, self.entry(slot).state()))
    }

    /// Maps the window `offset..offset+len` of `region` into this device's
    /// aperture.
    pub fn map_range(
        &self,
        region: &Arc<PinnedRegion>,
        offset: u64,
        len: u64,
    ) -> Result<MappedRange, DmaError> {
        let range = MappedRange::map(&*self.device, self.id, region, offset, len)?;
        tracing::debug!(
            device = self.device.id(),
            offset,
            len,
            chunks = range.chunks().len(),
            "mapped range"
        );
        Ok(range)
    }

    /// Unmaps a range created by [`Self::map_range`] on this context.
    pub fn unmap_range(&self, range: MappedRange) {
        if range.context_id != self.id {
            tracing::warn!(
                device = self.device.id(),
                "unmapping range created by another context"
            );
        }
        tracing::debug!(
            device = self.device.id(),
            len = range.len(),
            chunks = range.chunks().len(),
            "unmapping range"
        );
        range.unmap(&*self.device);
    }

    /// Returns a quarantined channel to service once the hardware reports
    /// its abandoned request complete.
    pub fn recover_channel(&self, slot: ChannelSlot) -> Result<(), DmaError> {
        let entry = self.entry(slot);
        if !entry.quarantined.load(Ordering::Acquire) {
            return Ok(());
        }
        let abandoned = entry.abandoned.load(Ordering::Acquire);
        if abandoned & COOKIE_VALID != 0 {
            let cookie = DmaCookie(abandoned as u32);
            if !self.device.poll_completion(entry.handle, cookie) {
                return Err(DmaError::ChannelTainted { slot });
            }
        }
        entry.abandoned.store(NO_COOKIE, Ordering::Release);
        entry.quarantined.store(false, Ordering::Release);
        tracing::info!(device = self.device.id(), %slot, "recovered dma channel");
        Ok(())
    }

    /// Tears the context down, returning every healthy channel to the
    /// hardware and dropping the device reference.
    pub fn close(mut self) -> TeardownReport {
        self.teardown()
    }

    fn teardown(&mut self) -> TeardownReport {
        self.closed = true;
        let mut report = TeardownReport::default();
        for slot in ChannelSlot::ALL {
            let entry = self.entry(slot);
            if entry.quarantined.load(Ordering::Acquire) {
                report.leaked.push(slot);
            } else {
                self.device.free_channel(entry.handle);
                report.freed.push(slot);
            }
        }
        self.device.put_reference();
        if report.leaked.is_empty() {
            tracing::debug!(device = self.device.id(), context = self.id, "closed dma context");
        } else {
            tracing::error!(
                device = self.device.id(),
                leaked = ?report.leaked,
                "card released with requests in flight, reboot may be required"
            );
        }
        report
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn entry(&self, slot: ChannelSlot) -> &ChannelEntry {
        &self.channels[slot.index()]
    }

    /// Leases the channel in `slot`, retrying until the acquire deadline.
    pub(crate) fn acquire(&self, slot: ChannelSlot) -> Result<ChannelLease<'_>, DmaError> {
        let entry = self.entry(slot);
        let deadline = Instant::now() + self.config.timeouts.channel_acquire;
        loop {
            if entry.quarantined.load(Ordering::Acquire) {
                return Err(DmaError::ChannelTainted { slot });
            }
            if entry
                .reserved
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                match self.device.request_channel(entry.handle) {
                    Ok(()) => {
                        return Ok(ChannelLease {
                            ctx: self,
                            slot,
                            released: false,
                        });
                    }
                    Err(err) => {
                        entry.reserved.store(false, Ordering::Release);
                        tracing::trace!(%slot, code = err.code(), "channel request failed, retrying");
                    }
                }
            }
            if Instant::now() >= deadline {
                tracing::error!(device = self.device.id(), %slot, "timed out acquiring dma channel");
                return Err(DmaError::Busy { slot });
            }
            std::thread::yield_now();
        }
    }

    /// Polls for completion of `pending` until the completion deadline.
    ///
    /// On timeout the channel is quarantined: its request cannot be
    /// cancelled and may still complete later.
    pub(crate) fn wait(&self, pending: PendingCompletion) -> Result<(), DmaError> {
        let entry = self.entry(pending.slot);
        let deadline = Instant::now() + self.config.timeouts.completion;
        loop {
            if self.device.poll_completion(entry.handle, pending.cookie) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::error!(
                    device = self.device.id(),
                    slot = %pending.slot,
                    cookie = pending.cookie.0,
                    "dma completion timed out"
                );
                self.abandon(pending);
                return Err(DmaError::Timeout { slot: pending.slot });
            }
            std::thread::yield_now();
        }
    }

    /// Quarantines the channel of a request that will not be waited for.
    pub(crate) fn abandon(&self, pending: PendingCompletion) {
        let entry = self.entry(pending.slot);
        entry
            .abandoned
            .store(COOKIE_VALID | u64::from(pending.cookie.0), Ordering::Release);
        entry.quarantined.store(true, Ordering::Release);
        tracing::warn!(
            device = self.device.id(),
            slot = %pending.slot,
            "quarantined dma channel with unconfirmed request"
        );
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if !self.closed {
            self.teardown();
        }
    }
}

fn allocate_channel(
    device: &dyn DeviceBacking,
    timeout: Duration,
) -> Result<ChannelHandle, HardwareError> {
    let deadline = Instant::now() + timeout;
    loop {
        match device.allocate_channel() {
            Ok(handle) => return Ok(handle),
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(err);
                }
            }
        }
        std::thread::yield_now();
    }
}

/// A submitted request whose completion is still to be observed.
#[derive(Debug, Copy, Clone)]
pub(crate) struct PendingCompletion {
    pub slot: ChannelSlot,
    pub cookie: DmaCookie,
}

/// Exclusive use of one channel for the duration of a transfer's
/// submissions. Released on drop if not released explicitly.
pub(crate) struct ChannelLease<'a> {
    ctx: &'a DeviceContext,
    slot: ChannelSlot,
    released: bool,
}

impl ChannelLease<'_> {
    /// Queues `request` on the channel.
    pub fn submit(&self, request: &DmaRequest) -> Result<DmaCookie, DmaError> {
        let entry = self.ctx.entry(self.slot);
        tracing::trace!(
            slot = %self.slot,
            src = request.src,
            dst = request.dst,
            len = request.len,
            want_cookie = request.want_cookie,
            "dma submit"
        );
        self.ctx
            .device
            .submit(entry.handle, request)
            .map_err(|source| {
                tracing::error!(
                    device = self.ctx.device.id(),
                    slot = %self.slot,
                    code = source.code(),
                    "error programming the dma descriptor"
                );
                DmaError::Submission {
                    slot: self.slot,
                    source,
                }
            })
    }

    /// Queues the final request of this channel with a completion cookie and
    /// releases the channel, whether or not the submission succeeded.
    pub fn finish(self, request: &DmaRequest) -> Result<PendingCompletion, DmaError> {
        debug_assert!(request.want_cookie);
        let slot = self.slot;
        let result = self.submit(request);
        self.release();
        Ok(PendingCompletion {
            slot,
            cookie: result?,
        })
    }

    /// Ends the lease.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            let entry = self.ctx.entry(self.slot);
            self.ctx.device.release_channel(entry.handle);
            entry.reserved.store(false, Ordering::Release);
        }
    }
}

impl Drop for ChannelLease<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}
