//! IPA framing.
//!
//! Every message on the channel is prefixed with a 3 byte header: 16 bit
//! big-endian payload length and one protocol byte. `IPACCESS` payloads
//! start with an in-band control message type; `OSMO` payloads start with
//! one extension selector byte, `RSPRO` here.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{Error, message::RsproPdu};

pub const PROTO_IPACCESS: u8 = 0xFE;
pub const PROTO_OSMO: u8 = 0xEE;
pub const PROTO_EXT_RSPRO: u8 = 0x07;

const HEADER_LEN: usize = 3;

/// In-band control messages carried at the `IPACCESS` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum IpaMessage {
    Ping = 0x00,
    Pong = 0x01,
    IdResp = 0x04,
    IdAck = 0x06,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// An in-band control message. Any payload after the message type
    /// byte (identity TLVs on `IdResp`) is not interpreted by the core.
    Ipaccess(IpaMessage),
    /// An RSPRO payload, still BER-encoded so that a malformed PDU can
    /// be dropped without tearing the channel down.
    Rspro(Bytes),
}

impl Frame {
    /// Pops one complete frame off the reassembly buffer.
    ///
    /// Returns `None` when more bytes are needed. Control messages with
    /// an unknown type are skipped. An unknown envelope protocol or
    /// extension is a channel-fatal error.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Frame>, Error> {
        loop {
            if buf.len() < HEADER_LEN {
                return Ok(None);
            }

            let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if len == 0 {
                return Err(Error::InvalidLength);
            }

            if buf.len() < HEADER_LEN + len {
                return Ok(None);
            }

            let proto = buf[2];
            let mut payload = buf.split_to(HEADER_LEN + len).freeze();
            payload.advance(HEADER_LEN);

            match proto {
                PROTO_IPACCESS => match IpaMessage::try_from(payload[0]) {
                    Ok(msg) => return Ok(Some(Frame::Ipaccess(msg))),
                    // unknown control messages are tolerated.
                    Err(_) => continue,
                },
                PROTO_OSMO => {
                    let ext = payload[0];
                    if ext != PROTO_EXT_RSPRO {
                        return Err(Error::UnknownExtension(ext));
                    }

                    payload.advance(1);
                    return Ok(Some(Frame::Rspro(payload)));
                }
                other => return Err(Error::UnknownProtocol(other)),
            }
        }
    }
}

/// Frames an RSPRO PDU into the two-level IPA envelope.
pub fn encode_rspro(pdu: &RsproPdu) -> Bytes {
    let body = pdu.encode();

    let mut buf = BytesMut::with_capacity(HEADER_LEN + 1 + body.len());
    buf.put_u16((body.len() + 1) as u16);
    buf.put_u8(PROTO_OSMO);
    buf.put_u8(PROTO_EXT_RSPRO);
    buf.put(&body[..]);
    buf.freeze()
}

/// Frames an in-band control message (ping, pong, identity ack).
pub fn encode_ipaccess(msg: IpaMessage) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 1);
    buf.put_u16(1);
    buf.put_u8(PROTO_IPACCESS);
    buf.put_u8(u8::from(msg));
    buf.freeze()
}
