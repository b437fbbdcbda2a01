//! ## Remote SIM Protocol (RSPRO) wire codec
//!
//! RSPRO is the control protocol spoken between SIM clients, SIM banks
//! and the central server. On the wire every message travels inside the
//! IPA multiplex: a 3 byte header (16 bit big-endian payload length plus
//! one protocol byte), where `IPACCESS` carries in-band control messages
//! (ping/pong and identity handshake) and `OSMO` carries extension
//! protocols selected by one further byte. RSPRO itself is a BER-encoded
//! tagged union of request/response messages.
//!
//! This crate only knows about bytes: framing and PDU encode/decode.
//! Stream reassembly state is a plain [`bytes::BytesMut`] owned by the
//! caller, so the same codec serves blocking and async transports.

mod ber;

pub mod frame;
pub mod message;

use std::str::Utf8Error;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    ShortBuffer,
    InvalidLength,
    UnknownProtocol(u8),
    UnknownExtension(u8),
    UnknownPduType(u8),
    UnexpectedTag { expected: u8, found: u8 },
    IntegerOverflow,
    UnknownEnumValue(u8),
    Utf8Error(Utf8Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}
