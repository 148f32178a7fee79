// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-connection protocol state machine.
//!
//! A [`Connection`] is one client's addressed channel to a remote service
//! instance. It owns the connection state (`Unconnected` → `Connected`, with
//! a sticky terminal `Failed`), the FIFO inbound-frame queue, the single-shot
//! connect-reply signal, and the buffer registry.
//!
//! One mutex guards state, destination address, queue, and registry; the
//! dispatcher and the crash path take the same mutex before mutating state,
//! so a response frame racing a crash is serialized and "once `Failed`, never
//! leaves `Failed`" is the tie-break. No call suspends while holding the
//! mutex.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use crate::buffer::{BufferHandle, BufferRegistry};
use crate::frame::{self, Addr, MAX_PAYLOAD_LEN, SERVICE_NAME_LEN};
use crate::service::Service;
use crate::sync::{CancelToken, Completion, WaitOutcome, CANCEL_SLICE};
use crate::{Error, Result, Wait};

/// Hard deadline on a connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Numeric control-operation commands for ioctl-style callers.
pub mod ctl {
    /// Connect to a named remote service; argument is the fixed-size,
    /// NUL-terminated name buffer.
    pub const CONNECT: u32 = 1;
    /// Pin a shared-buffer handle; argument is a little-endian u32 handle.
    pub const REGISTER_BUFFER: u32 = 2;
    /// Unpin a shared-buffer handle; argument is a little-endian u32 handle.
    pub const UNREGISTER_BUFFER: u32 = 3;
}

/// Connection protocol state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Created but not yet connected to a remote service.
    Unconnected,
    /// Connect handshake completed; data frames may flow.
    Connected,
    /// Terminal: remote error, crash, or local close. Never left.
    Failed,
}

/// Readiness snapshot for poll-style callers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Inbound queue has at least one frame.
    pub readable: bool,
    /// Outbound side accepts writes (transport backpressure is not modeled).
    pub writable: bool,
    /// Connection is in the terminal failure state; overrides the others.
    pub error: bool,
}

struct ConnInner {
    state: ConnState,
    dst: Addr,
    queue: VecDeque<Vec<u8>>,
    buffers: BufferRegistry,
}

/// One client's addressed channel to a remote service instance.
pub struct Connection {
    service: Weak<Service>,
    local_addr: Addr,
    inner: Mutex<ConnInner>,
    readq: Condvar,
    reply: Completion,
}

impl Connection {
    pub(crate) fn new(service: Weak<Service>, local_addr: Addr) -> Self {
        Self {
            service,
            local_addr,
            inner: Mutex::new(ConnInner {
                state: ConnState::Unconnected,
                dst: 0,
                queue: VecDeque::new(),
                buffers: BufferRegistry::new(),
            }),
            readq: Condvar::new(),
            reply: Completion::new(),
        }
    }

    /// Local endpoint address; inbound frames are routed by this key.
    pub fn local_addr(&self) -> Addr {
        self.local_addr
    }

    /// Current protocol state.
    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    /// Remote destination address, valid once connected (kept after an error
    /// response for diagnostics).
    pub fn dst(&self) -> Addr {
        self.inner.lock().dst
    }

    /// Number of currently pinned buffers.
    pub fn pinned_buffers(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    fn service(&self) -> Result<Arc<Service>> {
        self.service.upgrade().ok_or(Error::Disconnected)
    }

    /// Connects to the named remote service with the default 5 s deadline.
    pub fn connect(&self, name: &str, cancel: &CancelToken) -> Result<()> {
        self.connect_deadline(name, CONNECT_TIMEOUT, cancel)
    }

    /// Connects to the named remote service, waiting at most `timeout` for
    /// the reply.
    ///
    /// A duplicate connect on a `Connected` endpoint fails with
    /// [`Error::AlreadyConnected`] before any frame is sent. On wake the
    /// state decides the outcome: a concurrent crash reports
    /// [`Error::Disconnected`] (never a timeout), an expired deadline
    /// [`Error::Timeout`], a cancelled wait [`Error::Interrupted`].
    pub fn connect_deadline(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<()> {
        let service = self.service()?;
        let binding = service.binding().ok_or(Error::Disconnected)?;
        let request = frame::encode_connect_request(name)?;

        {
            let inner = self.inner.lock();
            match inner.state {
                ConnState::Connected => {
                    debug!("endpoint {:#x} already connected", self.local_addr);
                    return Err(Error::AlreadyConnected);
                }
                ConnState::Failed => return Err(Error::Disconnected),
                ConnState::Unconnected => {}
            }
            self.reply.reset();
            binding
                .link
                .send(self.local_addr, binding.link.remote_addr(), &request)
                .map_err(|err| {
                    error!("connect request send failed: {err}");
                    err
                })?;
        }

        let outcome = self.reply.wait(Some(timeout), cancel);

        // Read state and destination atomically; crash wins over everything.
        let inner = self.inner.lock();
        match inner.state {
            ConnState::Failed => Err(Error::Disconnected),
            ConnState::Connected => Ok(()),
            ConnState::Unconnected => match outcome {
                WaitOutcome::Interrupted => Err(Error::Interrupted),
                WaitOutcome::TimedOut => Err(Error::Timeout),
                WaitOutcome::Completed => {
                    error!("premature wakeup on endpoint {:#x}", self.local_addr);
                    Err(Error::PrematureWake)
                }
            },
        }
    }

    /// Pulls the oldest inbound frame into `buf`, returning the copied size.
    ///
    /// Excess bytes of a frame larger than `buf` are silently dropped.
    /// Queued frames are drained before a failure is reported, so data that
    /// arrived before a crash is still delivered; once the queue is empty a
    /// failed connection reports [`Error::Disconnected`] regardless of the
    /// wait mode, including non-blocking reads.
    pub fn read(&self, buf: &mut [u8], wait: Wait, cancel: &CancelToken) -> Result<usize> {
        let deadline = wait.timeout().map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        if inner.state == ConnState::Unconnected {
            return Err(Error::NotConnected);
        }
        loop {
            if let Some(frame) = inner.queue.pop_front() {
                let use_len = buf.len().min(frame.len());
                buf[..use_len].copy_from_slice(&frame[..use_len]);
                return Ok(use_len);
            }
            if inner.state == ConnState::Failed {
                return Err(Error::Disconnected);
            }
            if wait.is_non_blocking() {
                return Err(Error::WouldBlock);
            }
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    (deadline - now).min(CANCEL_SLICE)
                }
                None => CANCEL_SLICE,
            };
            self.readq.wait_for(&mut inner, slice);
        }
    }

    /// Sends one data frame, returning the number of bytes accepted.
    ///
    /// Input longer than [`MAX_PAYLOAD_LEN`] is truncated to the cap, a
    /// documented behavior of the write path. Embedded buffer handles are
    /// rewritten to device addresses before transmission; a rewrite failure
    /// aborts the write with nothing sent.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let service = self.service()?;
        let binding = service.binding();

        let use_len = data.len().min(MAX_PAYLOAD_LEN);
        let mut payload = data[..use_len].to_vec();

        let inner = self.inner.lock();
        match inner.state {
            ConnState::Unconnected => return Err(Error::NotConnected),
            ConnState::Failed => return Err(Error::Disconnected),
            ConnState::Connected => {}
        }
        let binding = binding.ok_or(Error::NotAvailable)?;
        let buffers = &inner.buffers;
        frame::rewrite_embedded_handles(&mut payload, |handle| {
            let phys = buffers.phys_base(handle)?;
            let device = binding.translator.phys_to_device(phys)?;
            u32::try_from(device).map_err(|_| Error::Translate("device address exceeds 32 bits"))
        })?;
        let bytes = frame::encode_raw_data(&payload)?;
        binding
            .link
            .send(self.local_addr, inner.dst, &bytes)
            .map_err(|err| {
                error!("data frame send failed: {err}");
                err
            })?;
        Ok(use_len)
    }

    /// Poll-style readiness: readable while queued frames exist, always
    /// writable, and exclusively an error condition once failed.
    pub fn readiness(&self) -> Readiness {
        let inner = self.inner.lock();
        if inner.state == ConnState::Failed {
            return Readiness { readable: false, writable: false, error: true };
        }
        Readiness { readable: !inner.queue.is_empty(), writable: true, error: false }
    }

    /// Pins a shared-buffer handle into this connection's registry.
    ///
    /// Fails with [`Error::Unsupported`] when the Service's binding carries
    /// no buffer-sharing facility.
    pub fn register_buffer(&self, handle: BufferHandle) -> Result<()> {
        let service = self.service()?;
        let binding = service.binding().ok_or(Error::NotAvailable)?;
        let source = binding.buffers.ok_or(Error::Unsupported)?;
        let mut inner = self.inner.lock();
        inner.buffers.pin(source.as_ref(), handle)
    }

    /// Unpins a previously registered handle.
    pub fn unregister_buffer(&self, handle: BufferHandle) -> Result<()> {
        self.inner.lock().buffers.unpin(handle)
    }

    /// Translates a pinned handle to the remote core's device address.
    ///
    /// Fails with [`Error::NotAvailable`] once the connection has failed or
    /// the Service's remote binding is torn down.
    pub fn translate_buffer(&self, handle: BufferHandle) -> Result<u64> {
        let service = self.service()?;
        let binding = service.binding();
        let inner = self.inner.lock();
        if inner.state == ConnState::Failed {
            return Err(Error::NotAvailable);
        }
        let binding = binding.ok_or(Error::NotAvailable)?;
        let phys = inner.buffers.phys_base(handle)?;
        binding.translator.phys_to_device(phys)
    }

    /// Dispatches a numeric control command from an ioctl-style caller.
    ///
    /// Unknown commands are logged and fail with [`Error::Unsupported`].
    pub fn control(&self, cmd: u32, arg: &[u8], cancel: &CancelToken) -> Result<()> {
        match cmd {
            ctl::CONNECT => {
                let mut name_buf = [0u8; SERVICE_NAME_LEN];
                let copied = arg.len().min(SERVICE_NAME_LEN);
                name_buf[..copied].copy_from_slice(&arg[..copied]);
                // Make sure caller input is NUL terminated.
                name_buf[SERVICE_NAME_LEN - 1] = 0;
                let end = name_buf
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(SERVICE_NAME_LEN - 1);
                let name = core::str::from_utf8(&name_buf[..end])
                    .map_err(|_| Error::Protocol("service name not utf-8"))?;
                self.connect(name, cancel)
            }
            ctl::REGISTER_BUFFER => self.register_buffer(control_handle(arg)?),
            ctl::UNREGISTER_BUFFER => self.unregister_buffer(control_handle(arg)?),
            other => {
                warn!("unhandled control cmd: {other}");
                Err(Error::Unsupported)
            }
        }
    }

    /// Closes the connection.
    ///
    /// Sends a best-effort `Disconnect` frame if connected (skipped entirely
    /// once failed; a send failure is only logged), forces the failure path
    /// so concurrent readers and connect waiters unblock, unpins every
    /// registered buffer, and leaves the Service's live set.
    pub fn close(&self) {
        let service = self.service.upgrade();
        let binding = service.as_ref().and_then(|service| service.binding());

        {
            let inner = self.inner.lock();
            if inner.state == ConnState::Connected {
                if let Some(binding) = &binding {
                    debug!("disconnecting from remote service at {:#x}", inner.dst);
                    let notice = frame::encode_disconnect(inner.dst);
                    if let Err(err) =
                        binding.link.send(self.local_addr, binding.link.remote_addr(), &notice)
                    {
                        error!("disconnect send failed: {err}");
                    }
                }
            }
        }

        {
            let mut inner = self.inner.lock();
            inner.state = ConnState::Failed;
            inner.queue.clear();
            inner.buffers.teardown();
            self.readq.notify_all();
        }
        self.reply.complete();

        if let Some(service) = service {
            service.remove_conn(self.local_addr);
        }
    }

    /// Dispatcher entry for an inbound `ConnectResponse`.
    pub(crate) fn handle_connect_response(&self, status: i32, addr: Addr) {
        {
            let mut inner = self.inner.lock();
            debug!("conn rsp: status {status} addr {addr:#x}");
            // Offered address is recorded even on error, for diagnostics.
            inner.dst = addr;
            if status != 0 {
                inner.state = ConnState::Failed;
            } else if inner.state != ConnState::Failed {
                // A crash that already forced Failed wins; never downgrade.
                inner.state = ConnState::Connected;
            }
        }
        self.reply.complete();
    }

    /// Dispatcher entry for an inbound `RawData` frame.
    pub(crate) fn handle_raw_data(&self, payload: &[u8]) {
        let mut inner = self.inner.lock();
        inner.queue.push_back(payload.to_vec());
        self.readq.notify_all();
    }

    /// Crash path: force the terminal state and release every waiter.
    pub(crate) fn force_fail(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = ConnState::Failed;
            self.readq.notify_all();
        }
        self.reply.complete();
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Connection")
            .field("local_addr", &self.local_addr)
            .field("state", &inner.state)
            .field("dst", &inner.dst)
            .field("queued", &inner.queue.len())
            .finish()
    }
}

fn control_handle(arg: &[u8]) -> Result<BufferHandle> {
    let bytes: [u8; 4] =
        arg.try_into().map_err(|_| Error::Protocol("bad control argument"))?;
    Ok(u32::from_le_bytes(bytes))
}
