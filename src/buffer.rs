// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared-buffer pinning and device-address translation.
//!
//! A client passes large buffers to the remote core by reference: it pins an
//! opaque handle from the OS buffer-sharing facility into its Connection's
//! [`BufferRegistry`], and outbound data frames carry the handle instead of
//! the bytes. Before transmission the handle is rewritten to the address the
//! remote core sees for that memory, obtained from the remote-processor
//! management layer through [`AddressTranslator`].
//!
//! The registry keys entries purely by the client-supplied handle value; no
//! equality with any other index space is assumed.

use std::collections::HashMap;

use log::{debug, error};

use crate::{Error, Result};

/// Opaque client-supplied identifier for a shared buffer.
pub type BufferHandle = u32;

/// One physically contiguous segment of a mapped buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SgSegment {
    /// Physical address of the segment.
    pub phys_addr: u64,
    /// Byte offset of the buffer data within the segment.
    pub offset: u32,
    /// Segment length in bytes.
    pub len: u32,
}

/// Scatter/gather mapping of a pinned buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SgTable {
    /// Mapped segments in buffer order.
    pub segments: Vec<SgSegment>,
}

impl SgTable {
    /// Physical base of the buffer: the first segment plus its offset.
    pub fn base_phys(&self) -> Option<u64> {
        self.segments.first().map(|seg| seg.phys_addr + u64::from(seg.offset))
    }
}

/// One shared buffer acquired from the OS buffer-sharing facility.
///
/// The pin pipeline is acquire → [`attach`](Self::attach) →
/// [`map`](Self::map); unpinning reverses it (unmap, detach) and dropping the
/// box releases the acquired reference.
pub trait SharedBuffer: Send {
    /// Attaches the buffer to the Service's hardware owner.
    fn attach(&mut self) -> Result<()>;
    /// Maps the attachment and returns its scatter/gather table.
    fn map(&mut self) -> Result<SgTable>;
    /// Releases the mapping.
    fn unmap(&mut self);
    /// Detaches from the hardware owner.
    fn detach(&mut self);
}

/// OS-level buffer-sharing facility handing out [`SharedBuffer`]s.
pub trait BufferSource: Send + Sync {
    /// Acquires a reference to the buffer identified by `handle`.
    fn acquire(&self, handle: BufferHandle) -> Result<Box<dyn SharedBuffer>>;
}

/// Remote-processor management view of locally mapped memory.
pub trait AddressTranslator: Send + Sync {
    /// Converts a local physical address into the remote core's address space.
    fn phys_to_device(&self, phys: u64) -> Result<u64>;
}

struct PinnedBuffer {
    buf: Box<dyn SharedBuffer>,
    sgt: SgTable,
    phys_base: u64,
}

/// Per-connection table of currently pinned buffers.
///
/// Exclusively owned by one Connection and accessed under that Connection's
/// lock; buffers are never shared across connections.
#[derive(Default)]
pub struct BufferRegistry {
    entries: HashMap<BufferHandle, PinnedBuffer>,
}

impl BufferRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `handle`: acquire, attach, map, and record the physical base.
    ///
    /// Any failure past acquisition unwinds the partial work in reverse order
    /// before returning, so a failed pin leaves no attachment behind. A
    /// handle already present is rejected without touching its entry.
    pub fn pin(&mut self, source: &dyn BufferSource, handle: BufferHandle) -> Result<()> {
        if self.entries.contains_key(&handle) {
            return Err(Error::AlreadyPinned(handle));
        }
        let mut buf = source.acquire(handle)?;
        if let Err(err) = buf.attach() {
            error!("error pinning buffer {handle}: {err}");
            return Err(err);
        }
        let sgt = match buf.map() {
            Ok(sgt) => sgt,
            Err(err) => {
                buf.detach();
                error!("error pinning buffer {handle}: {err}");
                return Err(err);
            }
        };
        let phys_base = match sgt.base_phys() {
            Some(phys) => phys,
            None => {
                buf.unmap();
                buf.detach();
                error!("error pinning buffer {handle}: empty scatter list");
                return Err(Error::Translate("empty scatter list"));
            }
        };
        debug!("pinned buffer {handle} at {phys_base:#x}");
        self.entries.insert(handle, PinnedBuffer { buf, sgt, phys_base });
        Ok(())
    }

    /// Unpins `handle`, reversing the pin pipeline, and removes the entry.
    pub fn unpin(&mut self, handle: BufferHandle) -> Result<()> {
        let mut pinned = self.entries.remove(&handle).ok_or(Error::NotFound(handle))?;
        pinned.buf.unmap();
        pinned.buf.detach();
        debug!("unpinned buffer {handle}");
        Ok(())
    }

    /// Physical base address cached when `handle` was pinned.
    pub fn phys_base(&self, handle: BufferHandle) -> Result<u64> {
        self.entries.get(&handle).map(|pinned| pinned.phys_base).ok_or(Error::NotFound(handle))
    }

    /// Scatter/gather table recorded when `handle` was pinned.
    pub fn sg_table(&self, handle: BufferHandle) -> Result<&SgTable> {
        self.entries.get(&handle).map(|pinned| &pinned.sgt).ok_or(Error::NotFound(handle))
    }

    /// Returns `true` while `handle` has a live entry.
    pub fn is_pinned(&self, handle: BufferHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no buffers are pinned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unpins every remaining entry exactly once.
    pub fn teardown(&mut self) {
        for (handle, mut pinned) in self.entries.drain() {
            debug!("teardown unpinning buffer {handle}");
            pinned.buf.unmap();
            pinned.buf.detach();
        }
    }
}

impl Drop for BufferRegistry {
    fn drop(&mut self) {
        self.teardown();
    }
}
