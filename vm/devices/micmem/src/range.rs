// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Construction, lookup and teardown of aperture-mapped chunk lists.

use crate::DmaError;
use crate::InvalidArgument;
use crate::PAGE_SHIFT;
use crate::hardware::DeviceBacking;
use crate::is_page_aligned;
use std::sync::Arc;

/// A physically contiguous run of host pages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhysChunk {
    /// Host physical address of the first page.
    pub phys: u64,
    /// Number of pages.
    pub pages: u64,
}

impl PhysChunk {
    /// Length in bytes.
    pub fn len(&self) -> u64 {
        self.pages << PAGE_SHIFT
    }
}

/// Pinned host memory, described as the ordered list of its physically
/// contiguous chunks.
///
/// The region is immutable once pinned. Pinning itself is done by the
/// platform; see [`HostPinner`](crate::hardware::HostPinner).
#[derive(Debug)]
pub struct PinnedRegion {
    addr: u64,
    chunks: Vec<PhysChunk>,
    page_count: u64,
}

impl PinnedRegion {
    /// Describes a pinned region whose user-visible address is `addr`.
    pub fn new(addr: u64, chunks: Vec<PhysChunk>) -> Self {
        let page_count = chunks.iter().map(|c| c.pages).sum();
        Self {
            addr,
            chunks,
            page_count,
        }
    }

    /// The user-visible address the region was pinned from.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// The physically contiguous chunks, in address order.
    pub fn chunks(&self) -> &[PhysChunk] {
        &self.chunks
    }

    /// Total number of pinned pages.
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Total size in bytes.
    pub fn len(&self) -> u64 {
        self.page_count << PAGE_SHIFT
    }
}

/// Computes the physical chunks backing the byte window `offset..offset+len`
/// of a pinned region with the given chunk list.
///
/// Chunks wholly before the window are skipped, the first overlapping chunk is
/// trimmed at its start and the last at its end. The result covers exactly
/// `len` bytes.
pub fn coalesce(chunks: &[PhysChunk], offset: u64, len: u64) -> Result<Vec<PhysChunk>, DmaError> {
    if !is_page_aligned(offset) {
        return Err(InvalidArgument::Unaligned {
            what: "range offset",
            value: offset,
        }
        .into());
    }
    if !is_page_aligned(len) {
        return Err(InvalidArgument::Unaligned {
            what: "range length",
            value: len,
        }
        .into());
    }
    if len == 0 {
        return Err(InvalidArgument::Empty {
            what: "range length",
        }
        .into());
    }
    let region_size = chunks.iter().map(|c| c.pages).sum::<u64>() << PAGE_SHIFT;
    if offset.checked_add(len).is_none_or(|end| end > region_size) {
        return Err(InvalidArgument::WindowOutOfRange {
            offset,
            len,
            region_size,
        }
        .into());
    }

    let first_page = offset >> PAGE_SHIFT;
    let last_page = first_page + (len >> PAGE_SHIFT);

    // Sized for the worst case, where every region chunk is involved.
    let mut out = Vec::new();
    out.try_reserve_exact(chunks.len())
        .map_err(|_| DmaError::OutOfMemory)?;

    let mut chunk_first = 0;
    for chunk in chunks {
        let chunk_end = chunk_first + chunk.pages;
        if first_page < chunk_end && chunk.pages != 0 {
            let start = first_page.max(chunk_first);
            let end = last_page.min(chunk_end);
            out.push(PhysChunk {
                phys: chunk.phys + ((start - chunk_first) << PAGE_SHIFT),
                pages: end - start,
            });
            if last_page <= chunk_end {
                break;
            }
        }
        chunk_first = chunk_end;
    }
    Ok(out)
}

/// A chunk of a [`MappedRange`], addressed through the device aperture.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MappedChunk {
    /// Device-visible address of the first page.
    pub aperture: u64,
    /// Host physical address of the first page.
    pub phys: u64,
    /// Number of pages.
    pub pages: u64,
}

impl MappedChunk {
    /// Length in bytes.
    pub fn len(&self) -> u64 {
        self.pages << PAGE_SHIFT
    }
}

/// Location of a byte offset inside a [`MappedRange`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChunkPosition {
    /// Index of the chunk containing the offset.
    pub index: usize,
    /// Offset of the byte inside that chunk.
    pub offset: u64,
    /// Length of that chunk in bytes.
    pub chunk_len: u64,
}

/// A window of a pinned region mapped into a device aperture.
///
/// Created by [`DeviceContext::map_range`](crate::DeviceContext::map_range)
/// and destroyed by
/// [`DeviceContext::unmap_range`](crate::DeviceContext::unmap_range) on the
/// same context.
#[derive(Debug)]
#[must_use]
pub struct MappedRange {
    chunks: Vec<MappedChunk>,
    size: u64,
    region: Arc<PinnedRegion>,
    pub(crate) context_id: u64,
}

impl MappedRange {
    /// Maps the window `offset..offset+len` of `region` into the aperture of
    /// `device`. Partially mapped state is unmapped again on failure.
    pub(crate) fn map(
        device: &dyn DeviceBacking,
        context_id: u64,
        region: &Arc<PinnedRegion>,
        offset: u64,
        len: u64,
    ) -> Result<Self, DmaError> {
        let phys_chunks = coalesce(region.chunks(), offset, len)?;
        let mut chunks = Vec::new();
        chunks
            .try_reserve_exact(phys_chunks.len())
            .map_err(|_| DmaError::OutOfMemory)?;

        for chunk in &phys_chunks {
            match device.map_to_aperture(chunk.phys, chunk.len()) {
                Ok(aperture) => chunks.push(MappedChunk {
                    aperture,
                    phys: chunk.phys,
                    pages: chunk.pages,
                }),
                Err(source) => {
                    tracing::error!(
                        device = device.id(),
                        phys = chunk.phys,
                        len = chunk.len(),
                        mapped = chunks.len(),
                        "aperture mapping failed, rolling back"
                    );
                    unmap_chunks(device, &mut chunks);
                    return Err(DmaError::ApertureMap {
                        phys: chunk.phys,
                        len: chunk.len(),
                        source,
                    });
                }
            }
        }

        Ok(Self {
            chunks,
            size: len,
            region: region.clone(),
            context_id,
        })
    }

    /// Unmaps every chunk from the aperture of `device`.
    pub(crate) fn unmap(mut self, device: &dyn DeviceBacking) {
        unmap_chunks(device, &mut self.chunks);
    }

    /// The mapped chunks, in window order.
    pub fn chunks(&self) -> &[MappedChunk] {
        &self.chunks
    }

    /// Size of the mapped window in bytes.
    pub fn len(&self) -> u64 {
        self.size
    }

    /// The pinned region this range is a window of.
    pub fn region(&self) -> &Arc<PinnedRegion> {
        &self.region
    }

    /// Finds the chunk containing byte `offset` of the range.
    pub fn find_chunk(&self, offset: u64) -> Result<ChunkPosition, InvalidArgument> {
        let mut chunk_offset = offset;
        for (index, chunk) in self.chunks.iter().enumerate() {
            let chunk_len = chunk.len();
            if chunk_len > chunk_offset {
                return Ok(ChunkPosition {
                    index,
                    offset: chunk_offset,
                    chunk_len,
                });
            }
            chunk_offset -= chunk_len;
        }
        Err(InvalidArgument::OffsetOutOfRange {
            offset,
            range_size: self.size,
        })
    }
}

impl Drop for MappedRange {
    fn drop(&mut self) {
        if !self.chunks.is_empty() {
            tracing::warn!(
                chunks = self.chunks.len(),
                size = self.size,
                "mapped range dropped without unmap, aperture entries leaked"
            );
        }
    }
}

fn unmap_chunks(device: &dyn DeviceBacking, chunks: &mut Vec<MappedChunk>) {
    for chunk in chunks.drain(..) {
        device.unmap_from_aperture(chunk.aperture, chunk.len());
    }
}
