// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Connection-oriented message bridge to services on remote compute cores.
//!
//! A [`Service`] represents one remote-accessible endpoint exposed by a remote
//! processor over a point-to-point framed link. Clients open [`Connection`]s
//! under a Service, connect them to a named remote service, and then exchange
//! small framed messages. Shared-memory buffers are passed by reference: a
//! client pins a buffer handle into its Connection's [`BufferRegistry`] and
//! embedded handles in outbound data frames are rewritten to the remote
//! core's view of that memory before transmission.
//!
//! The crate is host-first: the [`host`] module provides an in-process link,
//! buffer facility, and address translator so the whole protocol engine runs
//! deterministically in unit and integration tests without any device.
//!
//! Services survive remote-processor crashes. A crash forces every live
//! Connection into a terminal `Failed` state and unblocks all waiters; the
//! Service itself stays registered and resumes accepting `open` calls once
//! the remote side re-attaches. Failed Connections are never silently
//! revived — the client must close and reopen.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use core::time::Duration;

pub mod buffer;
pub mod conn;
pub mod frame;
pub mod host;
pub mod service;
pub mod sync;

pub use buffer::{
    AddressTranslator, BufferHandle, BufferRegistry, BufferSource, SgSegment, SgTable, SharedBuffer,
};
pub use conn::{ConnState, Connection, Readiness};
pub use frame::Addr;
pub use service::{global_registry, Link, LinkBinding, Service, ServiceRegistry};
pub use sync::{CancelToken, Completion};

/// Result alias for bridge operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by the connection protocol engine.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// Operation attempted before the endpoint ever connected.
    #[error("endpoint not connected")]
    NotConnected,
    /// A duplicate connect on an already connected endpoint.
    #[error("endpoint already connected")]
    AlreadyConnected,
    /// The remote processor or its transport is gone; the state is terminal.
    #[error("remote side disconnected")]
    Disconnected,
    /// A bounded wait exceeded its deadline.
    #[error("operation timed out")]
    Timeout,
    /// A non-blocking operation had nothing to do.
    #[error("operation would block")]
    WouldBlock,
    /// The wait was cancelled externally; the operation is safe to retry.
    #[error("operation interrupted")]
    Interrupted,
    /// The connect wait woke without a reply, a cancel, or a timeout.
    #[error("premature wakeup from connect wait")]
    PrematureWake,
    /// The buffer-sharing facility does not know the handle.
    #[error("buffer handle {0} is invalid")]
    InvalidHandle(BufferHandle),
    /// The handle is already pinned in this Connection's registry.
    #[error("buffer handle {0} already pinned")]
    AlreadyPinned(BufferHandle),
    /// The handle is not pinned in this Connection's registry.
    #[error("buffer handle {0} not pinned")]
    NotFound(BufferHandle),
    /// The Service's remote-processor binding is currently torn down.
    #[error("remote binding not available")]
    NotAvailable,
    /// Malformed frame or local protocol-convention violation.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    /// Allocation or facility resource exhaustion.
    #[error("out of resources: {0}")]
    Resource(&'static str),
    /// Unknown control operation, or a facility this Service lacks.
    #[error("unsupported operation")]
    Unsupported,
    /// The underlying link rejected a send; surfaced verbatim, never retried.
    #[error("transport send failed: {0}")]
    Transport(&'static str),
    /// The remote-processor management layer could not translate an address.
    #[error("address translation failed: {0}")]
    Translate(&'static str),
}

/// Behaviour of a blocking call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until the operation completes.
    Blocking,
    /// Return immediately if no progress can be made.
    NonBlocking,
    /// Block until either the operation completes or the timeout expires.
    Timeout(Duration),
}

impl Wait {
    /// Returns `true` when the caller requested a non-blocking attempt.
    pub const fn is_non_blocking(self) -> bool {
        matches!(self, Self::NonBlocking)
    }

    /// Converts a [`Wait::Timeout`] variant into its [`Duration`].
    pub const fn timeout(self) -> Option<Duration> {
        match self {
            Self::Timeout(duration) => Some(duration),
            Self::Blocking | Self::NonBlocking => None,
        }
    }
}
