// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire framing for the remote-core link.
//!
//! Every frame is a 12-byte little-endian header (`type`, reserved `flags`,
//! payload `len`) followed by a type-specific payload. The total frame size
//! is capped at [`MAX_FRAME_LEN`] bytes; this is a deliberate, documented
//! limitation of the bridge, not a negotiated parameter.
//!
//! Data-frame payloads begin, by convention, with an 8-byte map header: a
//! count (0–3) of embedded buffer handles and the byte offset of the handle
//! array. [`rewrite_embedded_handles`] replaces each handle in place with the
//! remote core's device address before transmission.

use crate::{BufferHandle, Error, Result};

/// Endpoint address used to route frames between connections.
pub type Addr = u32;

/// Maximum total frame size including the header.
pub const MAX_FRAME_LEN: usize = 512;
/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 12;
/// Maximum payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;
/// Fixed size of the NUL-terminated service-name field in connect requests.
pub const SERVICE_NAME_LEN: usize = 48;
/// Size of the connect-response payload (status + offered address).
pub const CONNECT_RSP_LEN: usize = 8;
/// Size of the disconnect payload (the remote address being left).
pub const DISCONNECT_LEN: usize = 4;
/// Size of the map header that starts every data-frame payload.
pub const MAP_HEADER_LEN: usize = 8;
/// Most embedded buffer handles a single data frame may carry.
pub const MAX_EMBEDDED_HANDLES: u32 = 3;

/// Frame type discriminant carried in the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    /// Client asks the remote service manager for a named service.
    ConnectRequest,
    /// Remote service manager answers a connect request.
    ConnectResponse,
    /// Opaque application data between connected endpoints.
    RawData,
    /// Best-effort notice that the client is leaving.
    Disconnect,
}

impl MsgType {
    fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::ConnectRequest),
            1 => Some(Self::ConnectResponse),
            2 => Some(Self::RawData),
            3 => Some(Self::Disconnect),
            _ => None,
        }
    }

    fn to_wire(self) -> u32 {
        match self {
            Self::ConnectRequest => 0,
            Self::ConnectResponse => 1,
            Self::RawData => 2,
            Self::Disconnect => 3,
        }
    }
}

/// Fixed frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Frame type.
    pub msg_type: MsgType,
    /// Reserved; always zero on the wire.
    pub flags: u32,
    /// Payload byte count following the header.
    pub len: u32,
}

impl Header {
    /// Builds a header for `msg_type` with `len` payload bytes.
    pub fn new(msg_type: MsgType, len: usize) -> Self {
        Self { msg_type, flags: 0, len: len as u32 }
    }

    /// Encodes the header into its 12-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.msg_type.to_wire().to_le_bytes());
        bytes[4..8].copy_from_slice(&self.flags.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.len.to_le_bytes());
        bytes
    }

    /// Decodes a header from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Protocol("truncated header"));
        }
        let msg_type = MsgType::from_wire(read_u32(bytes, 0))
            .ok_or(Error::Protocol("unknown message type"))?;
        Ok(Self { msg_type, flags: read_u32(bytes, 4), len: read_u32(bytes, 8) })
    }
}

/// A decoded inbound frame, borrowing from the receive buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message<'a> {
    /// Connect request carrying the requested service name.
    ConnectRequest {
        /// Requested remote service name.
        name: &'a str,
    },
    /// Connect response carrying a status and the offered address.
    ConnectResponse {
        /// Zero on success; any other value is a remote-side error.
        status: i32,
        /// Destination address offered by the remote service.
        addr: Addr,
    },
    /// Opaque data bytes for the owning connection's inbound queue.
    RawData(&'a [u8]),
    /// Disconnect notice naming the remote address being left.
    Disconnect {
        /// Remote destination address the sender is leaving.
        addr: Addr,
    },
}

/// Decodes one complete frame.
///
/// The header's declared payload length must match the buffer exactly; the
/// dispatcher treats any mismatch as a malformed frame to log and drop.
pub fn decode(bytes: &[u8]) -> Result<Message<'_>> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol("frame exceeds maximum size"));
    }
    let header = Header::decode(bytes)?;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != header.len as usize {
        return Err(Error::Protocol("payload length mismatch"));
    }
    match header.msg_type {
        MsgType::ConnectRequest => {
            if payload.len() != SERVICE_NAME_LEN {
                return Err(Error::Protocol("bad connect request size"));
            }
            let end = payload
                .iter()
                .position(|&b| b == 0)
                .ok_or(Error::Protocol("service name missing terminator"))?;
            let name = core::str::from_utf8(&payload[..end])
                .map_err(|_| Error::Protocol("service name not utf-8"))?;
            Ok(Message::ConnectRequest { name })
        }
        MsgType::ConnectResponse => {
            if payload.len() != CONNECT_RSP_LEN {
                return Err(Error::Protocol("bad connect response size"));
            }
            Ok(Message::ConnectResponse {
                status: read_u32(payload, 0) as i32,
                addr: read_u32(payload, 4),
            })
        }
        MsgType::RawData => Ok(Message::RawData(payload)),
        MsgType::Disconnect => {
            if payload.len() != DISCONNECT_LEN {
                return Err(Error::Protocol("bad disconnect size"));
            }
            Ok(Message::Disconnect { addr: read_u32(payload, 0) })
        }
    }
}

/// Encodes a connect request for `name`.
///
/// The name field is fixed-size and NUL-terminated; a name that cannot fit
/// together with its terminator is rejected rather than silently truncated.
pub fn encode_connect_request(name: &str) -> Result<Vec<u8>> {
    if name.len() >= SERVICE_NAME_LEN {
        return Err(Error::Protocol("service name too long"));
    }
    if name.as_bytes().contains(&0) {
        return Err(Error::Protocol("service name contains NUL"));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + SERVICE_NAME_LEN);
    frame.extend_from_slice(&Header::new(MsgType::ConnectRequest, SERVICE_NAME_LEN).encode());
    frame.extend_from_slice(name.as_bytes());
    frame.resize(HEADER_LEN + SERVICE_NAME_LEN, 0);
    Ok(frame)
}

/// Encodes a connect response with `status` and the offered `addr`.
pub fn encode_connect_response(status: i32, addr: Addr) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + CONNECT_RSP_LEN);
    frame.extend_from_slice(&Header::new(MsgType::ConnectResponse, CONNECT_RSP_LEN).encode());
    frame.extend_from_slice(&(status as u32).to_le_bytes());
    frame.extend_from_slice(&addr.to_le_bytes());
    frame
}

/// Encodes a data frame around an already-prepared payload.
pub fn encode_raw_data(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::Protocol("payload too long"));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&Header::new(MsgType::RawData, payload.len()).encode());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Encodes a disconnect notice for the remote destination `addr`.
pub fn encode_disconnect(addr: Addr) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + DISCONNECT_LEN);
    frame.extend_from_slice(&Header::new(MsgType::Disconnect, DISCONNECT_LEN).encode());
    frame.extend_from_slice(&addr.to_le_bytes());
    frame
}

/// Rewrites each embedded buffer handle in a data-frame payload in place.
///
/// The payload must start with the map header: `count` (0–3) followed by the
/// byte offset of the handle array. `translate` converts one pinned handle to
/// the remote core's 32-bit device address; its error aborts the rewrite and
/// nothing is sent.
pub fn rewrite_embedded_handles(
    payload: &mut [u8],
    mut translate: impl FnMut(BufferHandle) -> Result<u32>,
) -> Result<()> {
    if payload.len() < MAP_HEADER_LEN {
        return Err(Error::Protocol("payload too short for map header"));
    }
    let count = read_u32(payload, 0);
    if count > MAX_EMBEDDED_HANDLES {
        return Err(Error::Protocol("bad embedded handle count"));
    }
    let offset = read_u32(payload, 4) as usize;
    let end = offset
        .checked_add(count as usize * 4)
        .ok_or(Error::Protocol("handle array out of bounds"))?;
    if count > 0 && (offset < MAP_HEADER_LEN || end > payload.len()) {
        return Err(Error::Protocol("handle array out of bounds"));
    }
    for i in 0..count as usize {
        let at = offset + i * 4;
        let handle = read_u32(payload, at);
        let device_addr = translate(handle)?;
        payload[at..at + 4].copy_from_slice(&device_addr.to_le_bytes());
    }
    Ok(())
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut field = [0u8; 4];
    field.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Header::new(MsgType::RawData, 17);
        let decoded = Header::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn unknown_type_rejected() {
        let mut bytes = Header::new(MsgType::RawData, 0).encode().to_vec();
        bytes[0] = 9;
        assert_eq!(Header::decode(&bytes).unwrap_err(), Error::Protocol("unknown message type"));
    }

    #[test]
    fn connect_request_roundtrip() {
        let frame = encode_connect_request("svc-a").unwrap();
        assert_eq!(frame.len(), HEADER_LEN + SERVICE_NAME_LEN);
        match decode(&frame).unwrap() {
            Message::ConnectRequest { name } => assert_eq!(name, "svc-a"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn overlong_name_rejected_not_truncated() {
        let name = "x".repeat(SERVICE_NAME_LEN);
        assert_eq!(
            encode_connect_request(&name).unwrap_err(),
            Error::Protocol("service name too long")
        );
        // The longest representable name still fits with its terminator.
        let name = "x".repeat(SERVICE_NAME_LEN - 1);
        assert!(encode_connect_request(&name).is_ok());
    }

    #[test]
    fn connect_response_roundtrip() {
        let frame = encode_connect_response(-2, 77);
        match decode(&frame).unwrap() {
            Message::ConnectResponse { status, addr } => {
                assert_eq!(status, -2);
                assert_eq!(addr, 77);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut frame = encode_connect_response(0, 1);
        frame.push(0);
        assert_eq!(decode(&frame).unwrap_err(), Error::Protocol("payload length mismatch"));
    }

    #[test]
    fn rewrite_zero_handles_is_noop() {
        let mut payload = vec![0u8; 16];
        payload[12] = 0xAB;
        let before = payload.clone();
        rewrite_embedded_handles(&mut payload, |_| panic!("no handles to translate")).unwrap();
        assert_eq!(payload, before);
    }

    #[test]
    fn rewrite_replaces_handles_in_place() {
        let mut payload = vec![0u8; 24];
        payload[0..4].copy_from_slice(&2u32.to_le_bytes());
        payload[4..8].copy_from_slice(&16u32.to_le_bytes());
        payload[16..20].copy_from_slice(&7u32.to_le_bytes());
        payload[20..24].copy_from_slice(&9u32.to_le_bytes());
        rewrite_embedded_handles(&mut payload, |handle| Ok(handle + 0x1000)).unwrap();
        assert_eq!(read_u32(&payload, 16), 0x1007);
        assert_eq!(read_u32(&payload, 20), 0x1009);
    }

    #[test]
    fn rewrite_rejects_bad_count() {
        let mut payload = vec![0u8; 16];
        payload[0..4].copy_from_slice(&4u32.to_le_bytes());
        assert_eq!(
            rewrite_embedded_handles(&mut payload, Ok).unwrap_err(),
            Error::Protocol("bad embedded handle count")
        );
    }

    #[test]
    fn rewrite_rejects_out_of_bounds_array() {
        let mut payload = vec![0u8; 12];
        payload[0..4].copy_from_slice(&1u32.to_le_bytes());
        payload[4..8].copy_from_slice(&10u32.to_le_bytes());
        assert_eq!(
            rewrite_embedded_handles(&mut payload, Ok).unwrap_err(),
            Error::Protocol("handle array out of bounds")
        );
    }

    #[test]
    fn rewrite_rejects_short_payload() {
        let mut payload = vec![0u8; 4];
        assert_eq!(
            rewrite_embedded_handles(&mut payload, Ok).unwrap_err(),
            Error::Protocol("payload too short for map header")
        );
    }

    #[test]
    fn translate_failure_aborts_rewrite() {
        let mut payload = vec![0u8; 16];
        payload[0..4].copy_from_slice(&1u32.to_le_bytes());
        payload[4..8].copy_from_slice(&8u32.to_le_bytes());
        payload[8..12].copy_from_slice(&3u32.to_le_bytes());
        let err = rewrite_embedded_handles(&mut payload, |h| Err(Error::NotFound(h))).unwrap_err();
        assert_eq!(err, Error::NotFound(3));
    }
}
