// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Service lifecycle, inbound-frame dispatch, and the process-wide registry.
//!
//! A [`Service`] is created when the underlying transport announces a
//! remote-accessible endpoint and is the attachment point for that link. It
//! owns every live [`Connection`] opened under it and survives transport
//! teardown across a remote-processor crash: the link binding is cleared,
//! every connection is forced into the terminal failure state, and the
//! link-ready signal is re-armed so `open` calls park until recovery
//! re-attaches.
//!
//! The [`ServiceRegistry`] maps service names to live Services so a
//! re-attachment after recovery reuses the existing Service instead of
//! creating a duplicate. It has its own lock, never nested inside a Service
//! or Connection lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::buffer::{AddressTranslator, BufferSource};
use crate::conn::Connection;
use crate::frame::{self, Addr, Message};
use crate::sync::{CancelToken, Completion, WaitOutcome};
use crate::{Error, Result, Wait};

/// First local endpoint address handed out by a Service.
const FIRST_LOCAL_ADDR: Addr = 0x400;

/// Transport seam: one point-to-point framed link to a remote processor.
pub trait Link: Send + Sync {
    /// Sends one frame from the local endpoint `src` to the remote `dst`.
    ///
    /// Failures are surfaced to the caller verbatim and never retried.
    fn send(&self, src: Addr, dst: Addr, frame: &[u8]) -> Result<()>;

    /// Default remote address of the service manager on the other side.
    fn remote_addr(&self) -> Addr;
}

/// Everything a Service borrows from one remote-processor attachment.
///
/// The whole binding is dropped on crash and replaced on recovery.
#[derive(Clone)]
pub struct LinkBinding {
    /// The framed transport link.
    pub link: Arc<dyn Link>,
    /// Physical-to-device address lookup owned by the remote-processor
    /// management layer.
    pub translator: Arc<dyn AddressTranslator>,
    /// Buffer-sharing facility, absent where the platform has none.
    pub buffers: Option<Arc<dyn BufferSource>>,
}

struct ServiceInner {
    binding: Option<LinkBinding>,
    conns: HashMap<Addr, Arc<Connection>>,
    next_addr: Addr,
}

/// One remote-accessible endpoint offered by a remote processor instance.
pub struct Service {
    name: String,
    minor: u32,
    inner: Mutex<ServiceInner>,
    link_ready: Completion,
}

impl Service {
    fn new(name: &str, minor: u32) -> Self {
        Self {
            name: name.to_string(),
            minor,
            inner: Mutex::new(ServiceInner {
                binding: None,
                conns: HashMap::new(),
                next_addr: FIRST_LOCAL_ADDR,
            }),
            link_ready: Completion::new(),
        }
    }

    /// Service name as announced by the transport.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Numeric minor identifier assigned at creation.
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Returns `true` while a transport link is bound.
    pub fn is_attached(&self) -> bool {
        self.inner.lock().binding.is_some()
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.inner.lock().conns.len()
    }

    /// Snapshot of the current binding, if any.
    pub(crate) fn binding(&self) -> Option<LinkBinding> {
        self.inner.lock().binding.clone()
    }

    /// Opens a new connection under this Service.
    ///
    /// With no transport bound, a non-blocking open fails with
    /// [`Error::WouldBlock`]; otherwise the call parks on the link-ready
    /// signal (interruptibly) until first attachment or recovery, re-checking
    /// the binding on every wake.
    pub fn open(self: &Arc<Self>, wait: Wait, cancel: &CancelToken) -> Result<Arc<Connection>> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.binding.is_some() {
                    let addr = inner.next_addr;
                    inner.next_addr += 1;
                    let conn = Arc::new(Connection::new(Arc::downgrade(self), addr));
                    inner.conns.insert(addr, Arc::clone(&conn));
                    debug!("{}: local addr assigned: {addr:#x}", self.name);
                    return Ok(conn);
                }
                if wait.is_non_blocking() {
                    return Err(Error::WouldBlock);
                }
            }
            match self.link_ready.wait(wait.timeout(), cancel) {
                WaitOutcome::Completed => {}
                WaitOutcome::TimedOut => return Err(Error::Timeout),
                WaitOutcome::Interrupted => return Err(Error::Interrupted),
            }
        }
    }

    /// Transport callback dispatcher: routes one inbound frame by its
    /// destination endpoint address.
    ///
    /// Malformed frames, unknown endpoints, and unexpected message types are
    /// logged and dropped; none of them is fatal to the Service.
    pub fn deliver(&self, dst: Addr, bytes: &[u8]) {
        let message = match frame::decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!("{}: dropping malformed frame for {dst:#x}: {err}", self.name);
                return;
            }
        };
        let conn = self.inner.lock().conns.get(&dst).cloned();
        let Some(conn) = conn else {
            warn!("{}: no endpoint {dst:#x} for inbound frame", self.name);
            return;
        };
        match message {
            Message::ConnectResponse { status, addr } => {
                conn.handle_connect_response(status, addr);
            }
            Message::RawData(payload) => conn.handle_raw_data(payload),
            other => warn!("{}: unexpected msg type for {dst:#x}: {other:?}", self.name),
        }
    }

    /// Binds (or re-binds after recovery) the transport link and releases
    /// every `open` call parked on link-ready.
    pub(crate) fn bind(&self, binding: LinkBinding) {
        self.inner.lock().binding = Some(binding);
        self.link_ready.complete();
    }

    /// Remote-processor crash: tear down the attachment but keep the Service.
    ///
    /// Every live connection goes to the terminal failure state and all of
    /// its waiters are released; connections stay in the live set until the
    /// client closes them. The link-ready signal is re-armed so subsequent
    /// opens park until recovery.
    pub fn crash(&self) {
        let conns: Vec<Arc<Connection>> = {
            let mut inner = self.inner.lock();
            inner.binding = None;
            inner.conns.values().cloned().collect()
        };
        self.link_ready.reset();
        for conn in &conns {
            conn.force_fail();
        }
        info!("{}: detached after remote crash, {} connections failed", self.name, conns.len());
    }

    /// Removes a closed connection from the live set.
    pub(crate) fn remove_conn(&self, addr: Addr) {
        self.inner.lock().conns.remove(&addr);
    }
}

struct RegistryInner {
    services: HashMap<String, Arc<Service>>,
    minors_in_use: BTreeSet<u32>,
}

/// Process-wide mapping from service identity to live [`Service`].
pub struct ServiceRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// Creates an empty registry (tests use fresh instances; production code
    /// goes through [`global_registry`]).
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                services: HashMap::new(),
                minors_in_use: BTreeSet::new(),
            }),
        }
    }

    /// Handles a transport attachment for the named service.
    ///
    /// A Service that already exists (re-attachment after recovery) is
    /// reused and re-bound rather than duplicated; otherwise a new Service
    /// takes the smallest free minor. Either path signals link-ready and
    /// unblocks pending opens.
    pub fn attach(&self, name: &str, binding: LinkBinding) -> Arc<Service> {
        let (service, created) = {
            let mut inner = self.inner.lock();
            match inner.services.get(name) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let mut minor = 0;
                    while inner.minors_in_use.contains(&minor) {
                        minor += 1;
                    }
                    inner.minors_in_use.insert(minor);
                    let service = Arc::new(Service::new(name, minor));
                    inner.services.insert(name.to_string(), Arc::clone(&service));
                    (service, true)
                }
            }
        };
        service.bind(binding);
        if created {
            info!("new connection service channel: {name} (minor {})", service.minor());
        } else {
            info!("service channel re-attached: {name} (minor {})", service.minor());
        }
        service
    }

    /// Handles removal of the named service's transport.
    ///
    /// A crash keeps the Service registered for recovery and only tears down
    /// its attachment; a clean removal unregisters it and releases its minor
    /// for reuse. Clean removal with live connections is an external close
    /// ordering violation and is logged.
    pub fn remove(&self, name: &str, crashed: bool) {
        if crashed {
            let service = self.inner.lock().services.get(name).cloned();
            match service {
                Some(service) => service.crash(),
                None => warn!("crash removal for unknown service {name}"),
            }
            return;
        }
        let mut inner = self.inner.lock();
        match inner.services.remove(name) {
            Some(service) => {
                if service.connections() != 0 {
                    error!("removing service {name} with live connections");
                }
                inner.minors_in_use.remove(&service.minor());
                info!("service removed: {name} (minor {} released)", service.minor());
            }
            None => warn!("removal for unknown service {name}"),
        }
    }

    /// Looks up a live Service by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<Service>> {
        self.inner.lock().services.get(name).cloned()
    }

    /// Snapshot of every registered Service.
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.inner.lock().services.values().cloned().collect()
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.inner.lock().services.len()
    }

    /// Returns `true` when no service is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().services.is_empty()
    }
}

static REGISTRY: Lazy<ServiceRegistry> = Lazy::new(ServiceRegistry::new);

/// Process-wide service registry used by transport attach callbacks.
pub fn global_registry() -> &'static ServiceRegistry {
    &REGISTRY
}
