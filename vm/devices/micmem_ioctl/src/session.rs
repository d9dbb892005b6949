// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-open-file state of the control device.

use crate::protocol::Command;
use crate::protocol::DecodeError;
use crate::protocol::Dev2HostArgs;
use crate::protocol::Host2DevArgs;
use micmem::DeviceContext;
use micmem::DeviceContextConfig;
use micmem::DmaError;
use micmem::HardwareError;
use micmem::InvalidArgument;
use micmem::MappedRange;
use micmem::PinnedRegion;
use micmem::TransferMode;
use micmem::errno;
use micmem::hardware::DeviceBacking;
use micmem::hardware::HostPinner;
use micmem::is_page_aligned;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

/// Looks up boards by number.
pub trait BoardSource: Send + Sync {
    /// Returns the board numbered `bdnum`, if present.
    fn board(&self, bdnum: u32) -> Option<Arc<dyn DeviceBacking>>;
}

impl BoardSource for Vec<Arc<dyn DeviceBacking>> {
    fn board(&self, bdnum: u32) -> Option<Arc<dyn DeviceBacking>> {
        self.get(bdnum as usize).cloned()
    }
}

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Board numbers at or above this are rejected.
    pub max_boards: u32,
    /// Configuration for every device context a session opens.
    pub context: DeviceContextConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_boards: 8,
            context: DeviceContextConfig::default(),
        }
    }
}

#[expect(missing_docs)] // self-explanatory fields
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no board {bdnum}")]
    NoSuchBoard { bdnum: u32 },
    #[error("board {bdnum} already open")]
    AlreadyOpen { bdnum: u32 },
    #[error("board {bdnum} not open")]
    NotOpen { bdnum: u32 },
    #[error("no pinned region contains {addr:#x}+{size:#x}")]
    NotPinned { addr: u64, size: u64 },
    #[error("{addr:#x} already pinned")]
    AlreadyPinned { addr: u64 },
    #[error("pinned region {addr:#x} still has mapped ranges")]
    PinnedInUse { addr: u64 },
    #[error("no range mapped at {addr:#x} for board {bdnum}")]
    NotMapped { bdnum: u32, addr: u64 },
    #[error("range {addr:#x} already mapped for board {bdnum}")]
    AlreadyMapped { bdnum: u32, addr: u64 },
    #[error("transfers require administrative privilege")]
    PermissionDenied,
    #[error("failed to pin {addr:#x}+{size:#x}")]
    Pin {
        addr: u64,
        size: u64,
        #[source]
        source: HardwareError,
    },
    #[error("argument buffer too short for command {cmd:#x}")]
    Fault { cmd: u32 },
    #[error("unknown command {0:#x}")]
    UnknownCommand(u32),
    #[error("dma failure")]
    Dma(#[from] DmaError),
}

impl SessionError {
    /// The negative errno value returned to user space for this error.
    pub fn errno(&self) -> i32 {
        match self {
            SessionError::NoSuchBoard { .. } => errno::ENODEV,
            SessionError::AlreadyOpen { .. }
            | SessionError::AlreadyPinned { .. }
            | SessionError::PinnedInUse { .. }
            | SessionError::AlreadyMapped { .. } => errno::EBUSY,
            SessionError::NotOpen { .. }
            | SessionError::NotPinned { .. }
            | SessionError::NotMapped { .. }
            | SessionError::UnknownCommand(_) => errno::EINVAL,
            SessionError::PermissionDenied => errno::EPERM,
            SessionError::Pin { source, .. } => source.code(),
            SessionError::Fault { .. } => errno::EFAULT,
            SessionError::Dma(err) => err.errno(),
        }
    }
}

impl From<DecodeError> for SessionError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnknownCommand(cmd) => SessionError::UnknownCommand(cmd),
            DecodeError::ShortArgument { cmd, .. } => SessionError::Fault { cmd },
        }
    }
}

/// The shared half of the control device: the boards, the memory pinner, and
/// the lock that serializes every command from every session.
pub struct ControlPlane {
    boards: Arc<dyn BoardSource>,
    pinner: Arc<dyn HostPinner>,
    config: SessionConfig,
    ioctl_lock: Mutex<()>,
}

impl ControlPlane {
    /// Creates a control plane.
    pub fn new(
        boards: Arc<dyn BoardSource>,
        pinner: Arc<dyn HostPinner>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            boards,
            pinner,
            config,
            ioctl_lock: Mutex::new(()),
        })
    }

    /// Opens a session, as on open of the control file. `privileged` is
    /// whether the opener may issue transfers.
    pub fn open_session(self: &Arc<Self>, privileged: bool) -> Session {
        Session {
            plane: self.clone(),
            privileged,
            state: Mutex::new(SessionState::default()),
        }
    }
}

#[derive(Default)]
struct SessionState {
    devices: BTreeMap<u32, DeviceContext>,
    pinned: BTreeMap<u64, Arc<PinnedRegion>>,
    mapped: BTreeMap<(u32, u64), MappedRange>,
}

/// One open of the control file.
///
/// Dropping the session closes every board it opened, then unpins every
/// region it pinned.
pub struct Session {
    plane: Arc<ControlPlane>,
    privileged: bool,
    state: Mutex<SessionState>,
}

impl Session {
    /// Decodes and runs an ioctl.
    #[instrument(skip(self, arg), fields(privileged = self.privileged))]
    pub fn ioctl(&self, cmd: u32, arg: &[u8]) -> Result<(), SessionError> {
        let command = Command::decode(cmd, arg).inspect_err(|err| {
            tracing::debug!(?err, "undecodable ioctl");
        })?;
        self.execute(command)
    }

    /// Like [`Self::ioctl`], but returns the ioctl status: zero or a negative
    /// errno.
    pub fn ioctl_status(&self, cmd: u32, arg: &[u8]) -> i32 {
        match self.ioctl(cmd, arg) {
            Ok(()) => 0,
            Err(err) => err.errno(),
        }
    }

    /// Runs a decoded command.
    pub fn execute(&self, command: Command) -> Result<(), SessionError> {
        let result = match command {
            Command::HostToDevice(args) => self.host_to_device(&args),
            Command::DeviceToHost(args) => self.device_to_host(&args),
            Command::OpenDevice(bdnum) => self.open_device(bdnum),
            Command::CloseDevice(bdnum) => self.close_device(bdnum),
            Command::MapRange(args) => self.map_range(args.bdnum, args.addr, args.size),
            Command::UnmapRange(args) => self.unmap_range(args.bdnum, args.addr),
            Command::PinMemory(args) => self.pin(args.addr, args.size),
            Command::UnpinMemory(addr) => self.unpin(addr),
        };
        if let Err(err) = &result {
            tracing::debug!(
                command = command.name(),
                errno = err.errno(),
                error = err as &dyn std::error::Error,
                "ioctl failed"
            );
        }
        result
    }

    /// Opens board `bdnum` for DMA.
    pub fn open_device(&self, bdnum: u32) -> Result<(), SessionError> {
        let _guard = self.plane.ioctl_lock.lock();
        let mut state = self.state.lock();
        if bdnum >= self.plane.config.max_boards {
            return Err(SessionError::NoSuchBoard { bdnum });
        }
        let device = self
            .plane
            .boards
            .board(bdnum)
            .ok_or(SessionError::NoSuchBoard { bdnum })?;
        if state.devices.contains_key(&bdnum) {
            return Err(SessionError::AlreadyOpen { bdnum });
        }
        let ctx = DeviceContext::open(device, self.plane.config.context.clone())?;
        state.devices.insert(bdnum, ctx);
        Ok(())
    }

    /// Closes board `bdnum`, unmapping every range mapped for it.
    pub fn close_device(&self, bdnum: u32) -> Result<(), SessionError> {
        let _guard = self.plane.ioctl_lock.lock();
        let mut state = self.state.lock();
        close_device(&mut state, bdnum)
    }

    /// Pins `size` bytes of user memory at `addr`.
    pub fn pin(&self, addr: u64, size: u64) -> Result<(), SessionError> {
        let _guard = self.plane.ioctl_lock.lock();
        let mut state = self.state.lock();
        check_aligned("address", addr)?;
        check_aligned("size", size)?;
        if size == 0 {
            return Err(DmaError::from(InvalidArgument::Empty { what: "size" }).into());
        }
        if state.pinned.contains_key(&addr) {
            return Err(SessionError::AlreadyPinned { addr });
        }
        let region = self
            .plane
            .pinner
            .pin(addr, size)
            .map_err(|source| SessionError::Pin { addr, size, source })?;
        tracing::debug!(
            addr,
            size,
            chunks = region.chunks().len(),
            "pinned user memory"
        );
        state.pinned.insert(addr, Arc::new(region));
        Ok(())
    }

    /// Unpins the region pinned at exactly `addr`.
    pub fn unpin(&self, addr: u64) -> Result<(), SessionError> {
        let _guard = self.plane.ioctl_lock.lock();
        let mut state = self.state.lock();
        let region = state
            .pinned
            .remove(&addr)
            .ok_or(SessionError::NotPinned { addr, size: 0 })?;
        // Mapped ranges hold references to their region.
        match Arc::try_unwrap(region) {
            Ok(region) => {
                self.plane.pinner.unpin(region);
                Ok(())
            }
            Err(region) => {
                state.pinned.insert(addr, region);
                Err(SessionError::PinnedInUse { addr })
            }
        }
    }

    /// Maps the pinned memory at `addr` for DMA with board `bdnum`.
    pub fn map_range(&self, bdnum: u32, addr: u64, size: u64) -> Result<(), SessionError> {
        let _guard = self.plane.ioctl_lock.lock();
        let mut state = self.state.lock();
        let state = &mut *state;
        let ctx = state
            .devices
            .get(&bdnum)
            .ok_or(SessionError::NotOpen { bdnum })?;
        check_aligned("address", addr)?;
        check_aligned("size", size)?;
        if state.mapped.contains_key(&(bdnum, addr)) {
            return Err(SessionError::AlreadyMapped { bdnum, addr });
        }
        // Pins may nest, so the closest pin below `addr` need not be the one
        // that covers the window.
        let end = addr
            .checked_add(size)
            .ok_or(SessionError::NotPinned { addr, size })?;
        let region = state
            .pinned
            .range(..=addr)
            .rev()
            .map(|(_, region)| region)
            .find(|region| end <= region.addr() + region.len())
            .ok_or(SessionError::NotPinned { addr, size })?;
        let range = ctx.map_range(region, addr - region.addr(), size)?;
        state.mapped.insert((bdnum, addr), range);
        Ok(())
    }

    /// Unmaps the range mapped at `addr` for board `bdnum`.
    pub fn unmap_range(&self, bdnum: u32, addr: u64) -> Result<(), SessionError> {
        let _guard = self.plane.ioctl_lock.lock();
        let mut state = self.state.lock();
        let state = &mut *state;
        let ctx = state
            .devices
            .get(&bdnum)
            .ok_or(SessionError::NotOpen { bdnum })?;
        let range = state
            .mapped
            .remove(&(bdnum, addr))
            .ok_or(SessionError::NotMapped { bdnum, addr })?;
        ctx.unmap_range(range);
        Ok(())
    }

    /// Copies from a mapped range to device memory.
    pub fn host_to_device(&self, args: &Host2DevArgs) -> Result<(), SessionError> {
        self.check_privileged()?;
        let mode = TransferMode::try_from(args.flags).map_err(DmaError::from)?;
        let _guard = self.plane.ioctl_lock.lock();
        let state = self.state.lock();
        let (ctx, range) = lookup(&state, args.bdnum, args.src)?;
        ctx.host_to_device(args.dest_dev, range, args.src_offset, args.size, mode)?;
        Ok(())
    }

    /// Copies from device memory to a mapped range.
    pub fn device_to_host(&self, args: &Dev2HostArgs) -> Result<(), SessionError> {
        self.check_privileged()?;
        let mode = TransferMode::try_from(args.flags).map_err(DmaError::from)?;
        let _guard = self.plane.ioctl_lock.lock();
        let state = self.state.lock();
        let (ctx, range) = lookup(&state, args.bdnum, args.dest)?;
        ctx.device_to_host(range, args.dest_offset, args.source_dev, args.size, mode)?;
        Ok(())
    }

    fn check_privileged(&self) -> Result<(), SessionError> {
        if self.privileged {
            Ok(())
        } else {
            Err(SessionError::PermissionDenied)
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _guard = self.plane.ioctl_lock.lock();
        let state = self.state.get_mut();
        let boards: Vec<u32> = state.devices.keys().copied().collect();
        for bdnum in boards {
            if let Err(err) = close_device(state, bdnum) {
                tracing::warn!(
                    bdnum,
                    error = &err as &dyn std::error::Error,
                    "failed to close board"
                );
            }
        }
        for (addr, region) in std::mem::take(&mut state.pinned) {
            match Arc::try_unwrap(region) {
                Ok(region) => self.plane.pinner.unpin(region),
                Err(_) => tracing::error!(addr, "pinned region still referenced at close"),
            }
        }
    }
}

fn check_aligned(what: &'static str, value: u64) -> Result<(), SessionError> {
    if is_page_aligned(value) {
        Ok(())
    } else {
        Err(DmaError::from(InvalidArgument::Unaligned { what, value }).into())
    }
}

fn lookup(
    state: &SessionState,
    bdnum: u32,
    addr: u64,
) -> Result<(&DeviceContext, &MappedRange), SessionError> {
    let ctx = state
        .devices
        .get(&bdnum)
        .ok_or(SessionError::NotOpen { bdnum })?;
    let range = state
        .mapped
        .get(&(bdnum, addr))
        .ok_or(SessionError::NotMapped { bdnum, addr })?;
    Ok((ctx, range))
}

fn close_device(state: &mut SessionState, bdnum: u32) -> Result<(), SessionError> {
    let ctx = state
        .devices
        .remove(&bdnum)
        .ok_or(SessionError::NotOpen { bdnum })?;
    let keys: Vec<_> = state
        .mapped
        .range((bdnum, 0)..=(bdnum, u64::MAX))
        .map(|(&key, _)| key)
        .collect();
    for key in keys {
        if let Some(range) = state.mapped.remove(&key) {
            ctx.unmap_range(range);
        }
    }
    let report = ctx.close();
    if !report.leaked.is_empty() {
        tracing::warn!(bdnum, leaked = report.leaked.len(), "closed board with leaked channels");
    }
    Ok(())
}
