// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A software DMA device, for testing the engine without hardware.
//!
//! The device models host physical memory, a page table translating host
//! virtual pages to deliberately fragmented physical pages, device physical
//! memory, an aperture window, and a channel pool. Requests are executed
//! synchronously at submission time and every accepted request is logged.
//! Failures can be injected through [`FaultPlan`].

use crate::PAGE_SHIFT;
use crate::PAGE_SIZE;
use crate::PAGE_SIZE64;
use crate::PhysChunk;
use crate::PinnedRegion;
use crate::errno;
use crate::hardware::ChannelHandle;
use crate::hardware::DeviceBacking;
use crate::hardware::DmaCookie;
use crate::hardware::DmaRequest;
use crate::hardware::HardwareError;
use crate::hardware::HostPinner;
use crate::is_page_aligned;
use parking_lot::MappedMutexGuard;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Host virtual address of the first page of emulated host memory.
pub const HOST_VIRT_BASE: u64 = 0x7f00_0000_0000;
/// Host physical address of the first page of emulated host memory.
pub const HOST_PHYS_BASE: u64 = 0x1_0000_0000;
/// First device-visible aperture address.
pub const APERTURE_BASE: u64 = 0x80_0000_0000;

/// Failures to inject into an [`EmulatedDevice`].
#[derive(Debug, Default)]
pub struct FaultPlan {
    /// Fail the submission with this index (counting every submit call).
    pub fail_submission_at: Option<usize>,
    /// Fail the aperture mapping with this index (counting every map call).
    pub fail_map_at: Option<usize>,
    /// Fail this many channel allocations before succeeding.
    pub channel_allocate_failures: usize,
    /// Fail this many channel requests before succeeding.
    pub channel_request_failures: usize,
    /// Leave submitted requests incomplete until
    /// [`EmulatedDevice::complete_stalled`].
    pub stall_completions: bool,
    /// Leave requests submitted to this channel incomplete until
    /// [`EmulatedDevice::complete_stalled`].
    pub stall_channel: Option<ChannelHandle>,
    /// Fail device reference acquisition.
    pub reference_fails: bool,
    /// Fail pinning.
    pub pin_fails: bool,
}

/// A request accepted by the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Submission {
    /// The channel it was submitted to.
    pub channel: ChannelHandle,
    /// The request.
    pub request: DmaRequest,
}

#[derive(Debug, Copy, Clone)]
struct Aperture {
    phys: u64,
    len: u64,
}

enum Location {
    Host(usize),
    Device(usize),
}

struct State {
    host: Vec<u8>,
    page_table: Vec<u64>,
    device: Vec<u8>,
    apertures: BTreeMap<u64, Aperture>,
    next_aperture: u64,
    map_calls: usize,
    channels: BTreeMap<u32, bool>,
    next_channel: u32,
    max_channels: usize,
    references: usize,
    pins: usize,
    submissions: Vec<Submission>,
    submit_calls: usize,
    next_cookie: u32,
    pending: BTreeSet<u32>,
    faults: FaultPlan,
}

impl State {
    fn resolve(&self, addr: u64, len: u64) -> Option<Location> {
        if addr >= APERTURE_BASE {
            let (&base, aperture) = self.apertures.range(..=addr).next_back()?;
            let offset = addr - base;
            if offset.checked_add(len)? > aperture.len {
                return None;
            }
            let host = aperture.phys - HOST_PHYS_BASE + offset;
            Some(Location::Host(host as usize))
        } else {
            if addr.checked_add(len)? > self.device.len() as u64 {
                return None;
            }
            Some(Location::Device(addr as usize))
        }
    }

    fn read(&self, location: &Location, len: usize) -> Vec<u8> {
        match *location {
            Location::Host(offset) => self.host[offset..][..len].to_vec(),
            Location::Device(offset) => self.device[offset..][..len].to_vec(),
        }
    }

    fn write(&mut self, location: &Location, data: &[u8]) {
        match *location {
            Location::Host(offset) => self.host[offset..][..data.len()].copy_from_slice(data),
            Location::Device(offset) => {
                self.device[offset..][..data.len()].copy_from_slice(data)
            }
        }
    }

    /// Translates a host virtual address range into host memory offsets, one
    /// per page.
    fn host_pages(&self, addr: u64, len: usize) -> anyhow::Result<Vec<usize>> {
        let Some(rel) = addr.checked_sub(HOST_VIRT_BASE) else {
            anyhow::bail!("address {addr:#x} below emulated host memory");
        };
        let first = rel / PAGE_SIZE64;
        let end = (rel + len as u64).div_ceil(PAGE_SIZE64);
        if end > self.page_table.len() as u64 {
            anyhow::bail!("range {addr:#x}+{len:#x} beyond emulated host memory");
        }
        Ok((first..end)
            .map(|vpn| (self.page_table[vpn as usize] << PAGE_SHIFT) as usize)
            .collect())
    }
}

/// An in-memory stand-in for an accelerator and its host platform.
pub struct EmulatedDevice {
    id: String,
    state: Mutex<State>,
}

impl std::fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedDevice")
            .field("id", &self.id)
            .finish()
    }
}

impl EmulatedDevice {
    /// Creates a device with `device_len` bytes of device memory, and host
    /// memory made of physically discontiguous runs of `runs[i]` pages.
    ///
    /// Host virtual memory starts at [`HOST_VIRT_BASE`] and is contiguous;
    /// no two runs are physically adjacent, so pinning a virtual range that
    /// spans runs yields one chunk per run.
    pub fn new(id: &str, runs: &[u64], device_len: usize) -> Self {
        let total: u64 = runs.iter().sum();
        let phys_pages = total + runs.len() as u64;

        // Place the runs from the top of physical memory down, each followed
        // by a guard page.
        let mut page_table = Vec::with_capacity(total as usize);
        let mut phys = phys_pages;
        for &run in runs {
            phys -= run + 1;
            page_table.extend(phys..phys + run);
        }

        Self {
            id: id.to_owned(),
            state: Mutex::new(State {
                host: vec![0; (phys_pages as usize) * PAGE_SIZE],
                page_table,
                device: vec![0; device_len],
                apertures: BTreeMap::new(),
                next_aperture: APERTURE_BASE,
                map_calls: 0,
                channels: BTreeMap::new(),
                next_channel: 0,
                max_channels: 8,
                references: 0,
                pins: 0,
                submissions: Vec::new(),
                submit_calls: 0,
                next_cookie: 0,
                pending: BTreeSet::new(),
                faults: FaultPlan::default(),
            }),
        }
    }

    /// The injected failures, for modification.
    pub fn faults(&self) -> MappedMutexGuard<'_, FaultPlan> {
        MutexGuard::map(self.state.lock(), |state| &mut state.faults)
    }

    /// Limits the number of channels the device hands out.
    pub fn set_max_channels(&self, max: usize) {
        self.state.lock().max_channels = max;
    }

    /// Size of emulated host virtual memory in bytes.
    pub fn host_len(&self) -> u64 {
        (self.state.lock().page_table.len() as u64) << PAGE_SHIFT
    }

    /// Writes host memory through its virtual address.
    pub fn write_host(&self, addr: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let pages = state.host_pages(addr, data.len())?;
        let mut page_offset = (addr % PAGE_SIZE64) as usize;
        let mut data = data;
        for page in pages {
            let n = (PAGE_SIZE - page_offset).min(data.len());
            state.host[page + page_offset..][..n].copy_from_slice(&data[..n]);
            data = &data[n..];
            page_offset = 0;
        }
        Ok(())
    }

    /// Reads host memory through its virtual address.
    pub fn read_host(&self, addr: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let state = self.state.lock();
        let pages = state.host_pages(addr, buf.len())?;
        let mut page_offset = (addr % PAGE_SIZE64) as usize;
        let mut buf = buf;
        for page in pages {
            let n = (PAGE_SIZE - page_offset).min(buf.len());
            let (head, tail) = std::mem::take(&mut buf).split_at_mut(n);
            head.copy_from_slice(&state.host[page + page_offset..][..n]);
            buf = tail;
            page_offset = 0;
        }
        Ok(())
    }

    /// Writes device physical memory.
    pub fn write_device(&self, addr: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let Some(Location::Device(offset)) = state.resolve(addr, data.len() as u64) else {
            anyhow::bail!("device range {addr:#x}+{:#x} out of bounds", data.len());
        };
        state.device[offset..][..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Reads device physical memory.
    pub fn read_device(&self, addr: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let state = self.state.lock();
        let Some(Location::Device(offset)) = state.resolve(addr, buf.len() as u64) else {
            anyhow::bail!("device range {addr:#x}+{:#x} out of bounds", buf.len());
        };
        buf.copy_from_slice(&state.device[offset..][..buf.len()]);
        Ok(())
    }

    /// Every request accepted so far, in submission order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Forgets logged submissions.
    pub fn clear_submissions(&self) {
        self.state.lock().submissions.clear();
    }

    /// Completes every stalled request.
    pub fn complete_stalled(&self) {
        self.state.lock().pending.clear();
    }

    /// Number of channels currently allocated.
    pub fn allocated_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Number of outstanding device references.
    pub fn references(&self) -> usize {
        self.state.lock().references
    }

    /// Number of live aperture mappings.
    pub fn aperture_mappings(&self) -> usize {
        self.state.lock().apertures.len()
    }

    /// Number of live pinned regions.
    pub fn pinned_regions(&self) -> usize {
        self.state.lock().pins
    }
}

impl DeviceBacking for EmulatedDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_reference(&self) -> Result<(), HardwareError> {
        let mut state = self.state.lock();
        if state.faults.reference_fails {
            return Err(HardwareError::new(errno::ENODEV));
        }
        state.references += 1;
        Ok(())
    }

    fn put_reference(&self) {
        let mut state = self.state.lock();
        match state.references.checked_sub(1) {
            Some(n) => state.references = n,
            None => tracing::warn!(device = %self.id, "device reference underflow"),
        }
    }

    fn allocate_channel(&self) -> Result<ChannelHandle, HardwareError> {
        let mut state = self.state.lock();
        if state.faults.channel_allocate_failures > 0 {
            state.faults.channel_allocate_failures -= 1;
            return Err(HardwareError::new(errno::EBUSY));
        }
        if state.channels.len() >= state.max_channels {
            return Err(HardwareError::new(errno::EBUSY));
        }
        let channel = state.next_channel;
        state.next_channel += 1;
        state.channels.insert(channel, false);
        Ok(ChannelHandle(channel))
    }

    fn free_channel(&self, channel: ChannelHandle) {
        let mut state = self.state.lock();
        if state.channels.remove(&channel.0).is_none() {
            tracing::warn!(%channel, "freeing unallocated channel");
        }
    }

    fn request_channel(&self, channel: ChannelHandle) -> Result<(), HardwareError> {
        let mut state = self.state.lock();
        if state.faults.channel_request_failures > 0 {
            if state.faults.channel_request_failures != usize::MAX {
                state.faults.channel_request_failures -= 1;
            }
            return Err(HardwareError::new(errno::EBUSY));
        }
        match state.channels.get_mut(&channel.0) {
            Some(requested) if !*requested => {
                *requested = true;
                Ok(())
            }
            Some(_) => Err(HardwareError::new(errno::EBUSY)),
            None => Err(HardwareError::new(errno::EINVAL)),
        }
    }

    fn release_channel(&self, channel: ChannelHandle) {
        let mut state = self.state.lock();
        if let Some(requested) = state.channels.get_mut(&channel.0) {
            *requested = false;
        }
    }

    fn submit(
        &self,
        channel: ChannelHandle,
        request: &DmaRequest,
    ) -> Result<DmaCookie, HardwareError> {
        let mut state = self.state.lock();
        let call = state.submit_calls;
        state.submit_calls += 1;
        if state.faults.fail_submission_at == Some(call) {
            return Err(HardwareError::new(errno::EIO));
        }
        if state.channels.get(&channel.0) != Some(&true) {
            return Err(HardwareError::new(errno::EINVAL));
        }
        let (Some(src), Some(dst)) = (
            state.resolve(request.src, request.len),
            state.resolve(request.dst, request.len),
        ) else {
            return Err(HardwareError::new(errno::EFAULT));
        };

        let data = state.read(&src, request.len as usize);
        state.write(&dst, &data);

        let cookie = state.next_cookie;
        state.next_cookie = state.next_cookie.wrapping_add(1);
        if state.faults.stall_completions || state.faults.stall_channel == Some(channel) {
            state.pending.insert(cookie);
        }
        state.submissions.push(Submission {
            channel,
            request: *request,
        });
        Ok(DmaCookie(cookie))
    }

    fn poll_completion(&self, _channel: ChannelHandle, cookie: DmaCookie) -> bool {
        !self.state.lock().pending.contains(&cookie.0)
    }

    fn map_to_aperture(&self, phys: u64, len: u64) -> Result<u64, HardwareError> {
        let mut state = self.state.lock();
        let call = state.map_calls;
        state.map_calls += 1;
        if state.faults.fail_map_at == Some(call) {
            return Err(HardwareError::new(errno::ENOMEM));
        }
        let in_bounds = phys
            .checked_sub(HOST_PHYS_BASE)
            .and_then(|offset| offset.checked_add(len))
            .is_some_and(|end| end <= state.host.len() as u64);
        if !in_bounds || !is_page_aligned(phys) || !is_page_aligned(len) {
            return Err(HardwareError::new(errno::EINVAL));
        }
        let aperture = state.next_aperture;
        // Leave a hole after each mapping so that adjacent chunks never look
        // contiguous to the device.
        state.next_aperture += len + PAGE_SIZE64;
        state.apertures.insert(aperture, Aperture { phys, len });
        Ok(aperture)
    }

    fn unmap_from_aperture(&self, aperture: u64, len: u64) {
        let mut state = self.state.lock();
        match state.apertures.remove(&aperture) {
            Some(entry) if entry.len == len => {}
            Some(entry) => {
                tracing::warn!(aperture, len, mapped = entry.len, "aperture unmap length mismatch")
            }
            None => tracing::warn!(aperture, "unmapping unknown aperture address"),
        }
    }
}

impl HostPinner for EmulatedDevice {
    fn pin(&self, addr: u64, len: u64) -> Result<PinnedRegion, HardwareError> {
        let mut state = self.state.lock();
        if state.faults.pin_fails {
            return Err(HardwareError::new(errno::ENOMEM));
        }
        if !is_page_aligned(addr) || !is_page_aligned(len) || len == 0 {
            return Err(HardwareError::new(errno::EINVAL));
        }
        let pages = state
            .host_pages(addr, len as usize)
            .map_err(|_| HardwareError::new(errno::EFAULT))?;

        let mut chunks: Vec<PhysChunk> = Vec::new();
        for offset in pages {
            let phys = HOST_PHYS_BASE + offset as u64;
            match chunks.last_mut() {
                Some(last) if last.phys + last.len() == phys => last.pages += 1,
                _ => chunks.push(PhysChunk { phys, pages: 1 }),
            }
        }
        state.pins += 1;
        Ok(PinnedRegion::new(addr, chunks))
    }

    fn unpin(&self, _region: PinnedRegion) {
        let mut state = self.state.lock();
        match state.pins.checked_sub(1) {
            Some(n) => state.pins = n,
            None => tracing::warn!(device = %self.id, "unpin without pin"),
        }
    }
}
