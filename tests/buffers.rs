// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for buffer pinning through the connection API
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! TEST_SCOPE:
//!   - Register/translate/unregister lifecycle and its error surface
//!   - Platforms without a buffer-sharing facility
//!   - Close and crash interactions with pinned buffers
//!   - Control-command surface for buffer handles

mod common;

use std::sync::Arc;

use rplink::conn::ctl;
use rplink::host::{loopback, BufferEvent, HostTranslator};
use rplink::{CancelToken, Error, LinkBinding, ServiceRegistry, Wait};

use common::{attach, open_connected, DEVICE_OFFSET};

#[test]
fn register_translate_unregister_lifecycle() {
    let remote = attach("svc-a");
    let conn = open_connected(&remote, "svc-a");
    remote.buffers.add(5, 0x1000_0000);

    conn.register_buffer(5).unwrap();
    assert_eq!(conn.pinned_buffers(), 1);
    assert_eq!(conn.translate_buffer(5).unwrap(), 0x1000_0000 + DEVICE_OFFSET);
    conn.unregister_buffer(5).unwrap();
    assert_eq!(conn.pinned_buffers(), 0);
    assert_eq!(conn.translate_buffer(5).unwrap_err(), Error::NotFound(5));
}

#[test]
fn duplicate_register_rejected_with_entry_intact() {
    let remote = attach("svc-a");
    let conn = open_connected(&remote, "svc-a");
    remote.buffers.add(5, 0x1000);

    conn.register_buffer(5).unwrap();
    assert_eq!(conn.register_buffer(5).unwrap_err(), Error::AlreadyPinned(5));
    assert_eq!(conn.pinned_buffers(), 1);
    assert_eq!(conn.translate_buffer(5).unwrap(), 0x1000 + DEVICE_OFFSET);
}

#[test]
fn unregister_absent_handle_not_found() {
    let remote = attach("svc-a");
    let conn = open_connected(&remote, "svc-a");
    assert_eq!(conn.unregister_buffer(42).unwrap_err(), Error::NotFound(42));
}

#[test]
fn register_without_buffer_facility_unsupported() {
    let registry = ServiceRegistry::new();
    let (link, rx) = loopback(common::REMOTE_ADDR);
    let service = registry.attach(
        "svc-a",
        LinkBinding {
            link,
            translator: Arc::new(HostTranslator::new(DEVICE_OFFSET)),
            buffers: None,
        },
    );
    let conn = service.open(Wait::Blocking, &CancelToken::new()).unwrap();
    assert_eq!(conn.register_buffer(1).unwrap_err(), Error::Unsupported);
    drop(rx);
}

#[test]
fn translate_after_crash_not_available() {
    let remote = attach("svc-a");
    let conn = open_connected(&remote, "svc-a");
    remote.buffers.add(5, 0x1000);
    conn.register_buffer(5).unwrap();

    remote.service.crash();
    assert_eq!(conn.translate_buffer(5).unwrap_err(), Error::NotAvailable);
}

#[test]
fn close_unpins_every_registered_buffer() {
    let remote = attach("svc-a");
    let conn = open_connected(&remote, "svc-a");
    remote.buffers.add(5, 0x1000);
    remote.buffers.add(6, 0x2000);
    conn.register_buffer(5).unwrap();
    conn.register_buffer(6).unwrap();

    conn.close();

    let events = remote.buffers.events();
    for handle in [5, 6] {
        for event in [
            BufferEvent::Acquire(handle),
            BufferEvent::Attach(handle),
            BufferEvent::Map(handle),
            BufferEvent::Unmap(handle),
            BufferEvent::Detach(handle),
            BufferEvent::Release(handle),
        ] {
            assert_eq!(
                events.iter().filter(|&&e| e == event).count(),
                1,
                "expected exactly one {event:?}"
            );
        }
    }
}

#[test]
fn failed_attach_leaves_no_entry() {
    let remote = attach("svc-a");
    let conn = open_connected(&remote, "svc-a");
    remote.buffers.add(5, 0x1000);
    remote.buffers.fail_attach(5);

    assert_eq!(conn.register_buffer(5).unwrap_err(), Error::Resource("attach failed"));
    assert_eq!(conn.pinned_buffers(), 0);
    assert_eq!(
        remote.buffers.events(),
        vec![BufferEvent::Acquire(5), BufferEvent::Release(5)]
    );
}

#[test]
fn control_commands_carry_le_handles() {
    let remote = attach("svc-a");
    let conn = open_connected(&remote, "svc-a");
    remote.buffers.add(7, 0x3000);

    let arg = 7u32.to_le_bytes();
    conn.control(ctl::REGISTER_BUFFER, &arg, &CancelToken::new()).unwrap();
    assert_eq!(conn.pinned_buffers(), 1);
    conn.control(ctl::UNREGISTER_BUFFER, &arg, &CancelToken::new()).unwrap();
    assert_eq!(conn.pinned_buffers(), 0);
}

#[test]
fn malformed_control_argument_rejected() {
    let remote = attach("svc-a");
    let conn = open_connected(&remote, "svc-a");
    let err = conn.control(ctl::REGISTER_BUFFER, &[1, 2], &CancelToken::new()).unwrap_err();
    assert_eq!(err, Error::Protocol("bad control argument"));
}
