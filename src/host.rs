// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-process host backend for deterministic, device-free testing.
//!
//! Provides loopback stand-ins for the three external collaborators the
//! protocol engine depends on: the framed transport link, the OS
//! buffer-sharing facility, and the remote-processor address lookup. Tests
//! play the remote side by draining the loopback sender's receiver from a
//! spawned thread and answering through [`Service::deliver`].
//!
//! [`Service::deliver`]: crate::Service::deliver

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{
    AddressTranslator, BufferHandle, BufferSource, SgSegment, SgTable, SharedBuffer,
};
use crate::frame::Addr;
use crate::service::Link;
use crate::{Error, Result};

/// Size every host-backed buffer reports for its single mapped segment.
pub const HOST_BUFFER_LEN: u32 = 4096;

/// One outbound frame captured by the loopback link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentFrame {
    /// Sending local endpoint address.
    pub src: Addr,
    /// Remote destination address.
    pub dst: Addr,
    /// Complete frame bytes, header included.
    pub bytes: Vec<u8>,
}

/// Loopback [`Link`] that hands every sent frame to an in-memory channel.
pub struct LoopbackLink {
    remote: Addr,
    sent: Mutex<Sender<SentFrame>>,
    fail_sends: AtomicBool,
}

/// Creates a loopback link and the receiver tests drain to play the remote.
pub fn loopback(remote: Addr) -> (Arc<LoopbackLink>, Receiver<SentFrame>) {
    let (tx, rx) = mpsc::channel();
    (Arc::new(LoopbackLink { remote, sent: Mutex::new(tx), fail_sends: AtomicBool::new(false) }), rx)
}

impl LoopbackLink {
    /// Makes every subsequent `send` fail with a transport error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

impl Link for LoopbackLink {
    fn send(&self, src: Addr, dst: Addr, frame: &[u8]) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("loopback send rigged to fail"));
        }
        self.sent
            .lock()
            .send(SentFrame { src, dst, bytes: frame.to_vec() })
            .map_err(|_| Error::Transport("loopback receiver dropped"))
    }

    fn remote_addr(&self) -> Addr {
        self.remote
    }
}

/// One step in the life of a host-backed buffer, recorded for unwind checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferEvent {
    /// Reference acquired from the facility.
    Acquire(BufferHandle),
    /// Attached to the hardware owner.
    Attach(BufferHandle),
    /// Attachment mapped.
    Map(BufferHandle),
    /// Mapping released.
    Unmap(BufferHandle),
    /// Detached from the hardware owner.
    Detach(BufferHandle),
    /// Reference released.
    Release(BufferHandle),
}

struct HostBuffersInner {
    buffers: HashMap<BufferHandle, u64>,
    fail_attach: HashSet<BufferHandle>,
    fail_map: HashSet<BufferHandle>,
}

/// Heap-backed [`BufferSource`] with per-handle failure rigging and an event
/// journal so tests can assert exhaustive, non-double unwinds.
pub struct HostBuffers {
    inner: Mutex<HostBuffersInner>,
    events: Arc<Mutex<Vec<BufferEvent>>>,
}

impl Default for HostBuffers {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBuffers {
    /// Creates an empty facility.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HostBuffersInner {
                buffers: HashMap::new(),
                fail_attach: HashSet::new(),
                fail_map: HashSet::new(),
            }),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a shareable buffer under `handle` at physical base `phys`.
    pub fn add(&self, handle: BufferHandle, phys: u64) {
        self.inner.lock().buffers.insert(handle, phys);
    }

    /// Makes `attach` fail for `handle`.
    pub fn fail_attach(&self, handle: BufferHandle) {
        self.inner.lock().fail_attach.insert(handle);
    }

    /// Makes `map` fail for `handle`.
    pub fn fail_map(&self, handle: BufferHandle) {
        self.inner.lock().fail_map.insert(handle);
    }

    /// Snapshot of every recorded buffer event, in order.
    pub fn events(&self) -> Vec<BufferEvent> {
        self.events.lock().clone()
    }
}

impl BufferSource for HostBuffers {
    fn acquire(&self, handle: BufferHandle) -> Result<Box<dyn SharedBuffer>> {
        let inner = self.inner.lock();
        let phys = *inner.buffers.get(&handle).ok_or(Error::InvalidHandle(handle))?;
        let buffer = HostSharedBuffer {
            handle,
            phys,
            fail_attach: inner.fail_attach.contains(&handle),
            fail_map: inner.fail_map.contains(&handle),
            events: Arc::clone(&self.events),
        };
        buffer.record(BufferEvent::Acquire(handle));
        Ok(Box::new(buffer))
    }
}

struct HostSharedBuffer {
    handle: BufferHandle,
    phys: u64,
    fail_attach: bool,
    fail_map: bool,
    events: Arc<Mutex<Vec<BufferEvent>>>,
}

impl HostSharedBuffer {
    fn record(&self, event: BufferEvent) {
        self.events.lock().push(event);
    }
}

impl SharedBuffer for HostSharedBuffer {
    fn attach(&mut self) -> Result<()> {
        if self.fail_attach {
            return Err(Error::Resource("attach failed"));
        }
        self.record(BufferEvent::Attach(self.handle));
        Ok(())
    }

    fn map(&mut self) -> Result<SgTable> {
        if self.fail_map {
            return Err(Error::Resource("map failed"));
        }
        self.record(BufferEvent::Map(self.handle));
        Ok(SgTable {
            segments: vec![SgSegment { phys_addr: self.phys, offset: 0, len: HOST_BUFFER_LEN }],
        })
    }

    fn unmap(&mut self) {
        self.record(BufferEvent::Unmap(self.handle));
    }

    fn detach(&mut self) {
        self.record(BufferEvent::Detach(self.handle));
    }
}

impl Drop for HostSharedBuffer {
    fn drop(&mut self) {
        self.record(BufferEvent::Release(self.handle));
    }
}

/// Fixed-offset [`AddressTranslator`]: device address = physical + offset.
pub struct HostTranslator {
    offset: u64,
    fail: AtomicBool,
}

impl HostTranslator {
    /// Creates a translator adding `offset` to every physical address.
    pub fn new(offset: u64) -> Self {
        Self { offset, fail: AtomicBool::new(false) }
    }

    /// Makes every subsequent translation fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl AddressTranslator for HostTranslator {
    fn phys_to_device(&self, phys: u64) -> Result<u64> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Translate("translator rigged to fail"));
        }
        Ok(phys + self.offset)
    }
}
