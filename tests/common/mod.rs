// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared host-backend harness for the integration tests: one attached
//! Service over a loopback link, plus helpers that play the remote side.

#![allow(dead_code)]

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rplink::frame::{self, Addr, Message};
use rplink::host::{loopback, HostBuffers, HostTranslator, LoopbackLink, SentFrame};
use rplink::{
    AddressTranslator, BufferSource, CancelToken, Connection, Link, LinkBinding, Service,
    ServiceRegistry, Wait,
};

/// Default remote service-manager address announced by the loopback link.
pub const REMOTE_ADDR: Addr = 0x35;
/// Destination address the fake remote offers on successful connects.
pub const DEFAULT_DST: Addr = 7;
/// Device-address offset applied by the host translator.
pub const DEVICE_OFFSET: u64 = 0x8000_0000;
/// Deadline generous enough for any in-process wait.
pub const DEADLINE: Duration = Duration::from_secs(2);

pub struct Remote {
    pub registry: ServiceRegistry,
    pub service: Arc<Service>,
    pub link: Arc<LoopbackLink>,
    pub rx: Receiver<SentFrame>,
    pub buffers: Arc<HostBuffers>,
    pub translator: Arc<HostTranslator>,
}

/// Attaches a fresh Service named `name` over a loopback link.
pub fn attach(name: &str) -> Remote {
    let registry = ServiceRegistry::new();
    let (link, rx) = loopback(REMOTE_ADDR);
    let buffers = Arc::new(HostBuffers::new());
    let translator = Arc::new(HostTranslator::new(DEVICE_OFFSET));
    let service = registry.attach(
        name,
        LinkBinding {
            link: Arc::clone(&link) as Arc<dyn Link>,
            translator: Arc::clone(&translator) as Arc<dyn AddressTranslator>,
            buffers: Some(Arc::clone(&buffers) as Arc<dyn BufferSource>),
        },
    );
    Remote { registry, service, link, rx, buffers, translator }
}

/// Opens a connection; the link is attached, so this never blocks.
pub fn open(remote: &Remote) -> Arc<Connection> {
    remote.service.open(Wait::Blocking, &CancelToken::new()).expect("open")
}

/// Drives a full connect handshake: issues the connect from a spawned
/// thread, answers the captured request with `status`/`dst`, and returns the
/// connect outcome.
pub fn connect_with_reply(
    remote: &Remote,
    conn: &Arc<Connection>,
    name: &str,
    status: i32,
    dst: Addr,
) -> rplink::Result<()> {
    let client = {
        let conn = Arc::clone(conn);
        let name = name.to_string();
        thread::spawn(move || conn.connect_deadline(&name, DEADLINE, &CancelToken::new()))
    };
    let sent = remote.rx.recv_timeout(DEADLINE).expect("connect request frame");
    assert_eq!(sent.dst, REMOTE_ADDR);
    match frame::decode(&sent.bytes).expect("decode connect request") {
        Message::ConnectRequest { name: requested } => assert_eq!(requested, name),
        other => panic!("expected connect request, got {other:?}"),
    }
    remote.service.deliver(sent.src, &frame::encode_connect_response(status, dst));
    client.join().expect("connect thread")
}

/// Opens and connects a client with a successful handshake.
pub fn open_connected(remote: &Remote, name: &str) -> Arc<Connection> {
    let conn = open(remote);
    connect_with_reply(remote, &conn, name, 0, DEFAULT_DST).expect("connect");
    conn
}

/// Builds a data-frame payload: map header with `handles`, then `body`.
pub fn data_payload(handles: &[u32], body: &[u8]) -> Vec<u8> {
    let offset = frame::MAP_HEADER_LEN as u32;
    let mut payload = Vec::new();
    payload.extend_from_slice(&(handles.len() as u32).to_le_bytes());
    payload.extend_from_slice(&offset.to_le_bytes());
    for handle in handles {
        payload.extend_from_slice(&handle.to_le_bytes());
    }
    payload.extend_from_slice(body);
    payload
}

/// Payload with no embedded handles, just an empty map header and `body`.
pub fn plain_payload(body: &[u8]) -> Vec<u8> {
    data_payload(&[], body)
}

/// Extracts the payload of a captured raw data frame.
pub fn raw_payload(sent: &SentFrame) -> Vec<u8> {
    match frame::decode(&sent.bytes).expect("decode data frame") {
        Message::RawData(payload) => payload.to_vec(),
        other => panic!("expected raw data frame, got {other:?}"),
    }
}
