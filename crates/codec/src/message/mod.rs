//! RSPRO message set.
//!
//! `RsproPdu` is the BER `CHOICE` exchanged on the control channel. The
//! outer PDU is a `SEQUENCE { version, tag, msg }`; the operation tag is
//! carried on the wire but responses are correlated positionally (one TCP
//! channel preserves request order), so nothing in this crate interprets
//! it.

use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{Error, ber};

/// Protocol version emitted in every PDU.
pub const RSPRO_VERSION: u8 = 2;

/// The role a component announces during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ComponentType {
    Client = 0,
    Bank = 1,
    Server = 2,
}

/// Identity exchanged on connect and kept for the connection lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentIdentity {
    pub kind: ComponentType,
    pub name: String,
    pub sw_version: String,
    pub hw_version: String,
}

/// Addresses one SIM socket on a client.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientSlot {
    pub client_id: u16,
    pub slot_nr: u16,
}

/// Addresses one physical SIM reader on a bank.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BankSlot {
    pub bank_id: u16,
    pub slot_nr: u16,
}

impl std::fmt::Display for ClientSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "C{}:{}", self.client_id, self.slot_nr)
    }
}

impl std::fmt::Display for BankSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "B{}:{}", self.bank_id, self.slot_nr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    IllegalClientId = 1,
    UnknownClientId = 2,
    UnknownSlotmap = 3,
    IdentityInUse = 4,
    CardNotPresent = 5,
    CardUnresponsive = 6,
    CardTransmissionError = 7,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RsproPdu {
    ConnectClientReq {
        identity: ComponentIdentity,
        client_slot: Option<ClientSlot>,
    },
    ConnectClientRes {
        identity: ComponentIdentity,
        result: ResultCode,
    },
    ConnectBankReq {
        identity: ComponentIdentity,
        bank_id: u16,
        num_slots: u16,
    },
    ConnectBankRes {
        identity: ComponentIdentity,
        result: ResultCode,
    },
    CreateMappingReq {
        client: ClientSlot,
        bank: BankSlot,
    },
    CreateMappingRes {
        result: ResultCode,
    },
    RemoveMappingReq {
        client: ClientSlot,
        bank: BankSlot,
    },
    RemoveMappingRes {
        result: ResultCode,
    },
    ConfigClientIdReq {
        client_slot: ClientSlot,
    },
    ConfigClientIdRes {
        result: ResultCode,
    },
    ConfigClientBankReq {
        bank: BankSlot,
        bankd_ip: u32,
        bankd_port: u16,
    },
    ConfigClientBankRes {
        result: ResultCode,
    },
}

// choice alternative numbers of the `msg` union.
const MSG_CONNECT_CLIENT_REQ: u8 = 0;
const MSG_CONNECT_CLIENT_RES: u8 = 1;
const MSG_CONNECT_BANK_REQ: u8 = 2;
const MSG_CONNECT_BANK_RES: u8 = 3;
const MSG_CREATE_MAPPING_REQ: u8 = 4;
const MSG_CREATE_MAPPING_RES: u8 = 5;
const MSG_REMOVE_MAPPING_REQ: u8 = 6;
const MSG_REMOVE_MAPPING_RES: u8 = 7;
const MSG_CONFIG_CLIENT_ID_REQ: u8 = 8;
const MSG_CONFIG_CLIENT_ID_RES: u8 = 9;
const MSG_CONFIG_CLIENT_BANK_REQ: u8 = 10;
const MSG_CONFIG_CLIENT_BANK_RES: u8 = 11;

fn put_identity(buf: &mut BytesMut, tag: u8, identity: &ComponentIdentity) {
    let mut body = BytesMut::new();
    ber::put_uint(&mut body, ber::context(0), u8::from(identity.kind) as u64);
    ber::put_str(&mut body, ber::context(1), &identity.name);
    ber::put_str(&mut body, ber::context(2), &identity.sw_version);
    ber::put_str(&mut body, ber::context(3), &identity.hw_version);
    ber::put_tlv(buf, ber::constructed(tag), &body);
}

fn get_identity(content: &[u8]) -> Result<ComponentIdentity, Error> {
    let mut reader = ber::Reader::new(content);
    let kind = ber::uint(reader.expect(ber::context(0))?)? as u8;

    Ok(ComponentIdentity {
        kind: ComponentType::try_from(kind).map_err(|_| Error::UnknownEnumValue(kind))?,
        name: ber::ia5(reader.expect(ber::context(1))?)?.to_string(),
        sw_version: ber::ia5(reader.expect(ber::context(2))?)?.to_string(),
        hw_version: ber::ia5(reader.expect(ber::context(3))?)?.to_string(),
    })
}

fn put_slot(buf: &mut BytesMut, tag: u8, id: u16, slot_nr: u16) {
    let mut body = BytesMut::new();
    ber::put_uint(&mut body, ber::context(0), id as u64);
    ber::put_uint(&mut body, ber::context(1), slot_nr as u64);
    ber::put_tlv(buf, ber::constructed(tag), &body);
}

fn get_slot(content: &[u8]) -> Result<(u16, u16), Error> {
    let mut reader = ber::Reader::new(content);
    let id = ber::uint16(reader.expect(ber::context(0))?)?;
    let slot_nr = ber::uint16(reader.expect(ber::context(1))?)?;
    Ok((id, slot_nr))
}

fn get_client_slot(content: &[u8]) -> Result<ClientSlot, Error> {
    get_slot(content).map(|(client_id, slot_nr)| ClientSlot { client_id, slot_nr })
}

fn get_bank_slot(content: &[u8]) -> Result<BankSlot, Error> {
    get_slot(content).map(|(bank_id, slot_nr)| BankSlot { bank_id, slot_nr })
}

fn get_result(content: &[u8]) -> Result<ResultCode, Error> {
    let value = ber::uint(content)? as u8;
    ResultCode::try_from(value).map_err(|_| Error::UnknownEnumValue(value))
}

impl RsproPdu {
    /// Message name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectClientReq { .. } => "connectClientReq",
            Self::ConnectClientRes { .. } => "connectClientRes",
            Self::ConnectBankReq { .. } => "connectBankReq",
            Self::ConnectBankRes { .. } => "connectBankRes",
            Self::CreateMappingReq { .. } => "createMappingReq",
            Self::CreateMappingRes { .. } => "createMappingRes",
            Self::RemoveMappingReq { .. } => "removeMappingReq",
            Self::RemoveMappingRes { .. } => "removeMappingRes",
            Self::ConfigClientIdReq { .. } => "configClientIdReq",
            Self::ConfigClientIdRes { .. } => "configClientIdRes",
            Self::ConfigClientBankReq { .. } => "configClientBankReq",
            Self::ConfigClientBankRes { .. } => "configClientBankRes",
        }
    }

    /// Encodes the PDU body (without IPA framing, see [`crate::frame`]).
    pub fn encode(&self) -> BytesMut {
        let mut msg = BytesMut::new();
        let alternative = self.put_msg(&mut msg);

        let mut choice = BytesMut::new();
        ber::put_tlv(&mut choice, ber::constructed(alternative), &msg);

        let mut body = BytesMut::new();
        ber::put_uint(&mut body, ber::context(0), RSPRO_VERSION as u64);
        ber::put_uint(&mut body, ber::context(1), 0);
        ber::put_tlv(&mut body, ber::constructed(2), &choice);

        let mut buf = BytesMut::new();
        ber::put_tlv(&mut buf, ber::SEQUENCE, &body);
        buf
    }

    fn put_msg(&self, buf: &mut BytesMut) -> u8 {
        match self {
            Self::ConnectClientReq {
                identity,
                client_slot,
            } => {
                put_identity(buf, 0, identity);
                if let Some(slot) = client_slot {
                    put_slot(buf, 1, slot.client_id, slot.slot_nr);
                }

                MSG_CONNECT_CLIENT_REQ
            }
            Self::ConnectClientRes { identity, result } => {
                put_identity(buf, 0, identity);
                ber::put_uint(buf, ber::context(1), u8::from(*result) as u64);
                MSG_CONNECT_CLIENT_RES
            }
            Self::ConnectBankReq {
                identity,
                bank_id,
                num_slots,
            } => {
                put_identity(buf, 0, identity);
                ber::put_uint(buf, ber::context(1), *bank_id as u64);
                ber::put_uint(buf, ber::context(2), *num_slots as u64);
                MSG_CONNECT_BANK_REQ
            }
            Self::ConnectBankRes { identity, result } => {
                put_identity(buf, 0, identity);
                ber::put_uint(buf, ber::context(1), u8::from(*result) as u64);
                MSG_CONNECT_BANK_RES
            }
            Self::CreateMappingReq { client, bank } => {
                put_slot(buf, 0, client.client_id, client.slot_nr);
                put_slot(buf, 1, bank.bank_id, bank.slot_nr);
                MSG_CREATE_MAPPING_REQ
            }
            Self::CreateMappingRes { result } => {
                ber::put_uint(buf, ber::context(0), u8::from(*result) as u64);
                MSG_CREATE_MAPPING_RES
            }
            Self::RemoveMappingReq { client, bank } => {
                put_slot(buf, 0, client.client_id, client.slot_nr);
                put_slot(buf, 1, bank.bank_id, bank.slot_nr);
                MSG_REMOVE_MAPPING_REQ
            }
            Self::RemoveMappingRes { result } => {
                ber::put_uint(buf, ber::context(0), u8::from(*result) as u64);
                MSG_REMOVE_MAPPING_RES
            }
            Self::ConfigClientIdReq { client_slot } => {
                put_slot(buf, 0, client_slot.client_id, client_slot.slot_nr);
                MSG_CONFIG_CLIENT_ID_REQ
            }
            Self::ConfigClientIdRes { result } => {
                ber::put_uint(buf, ber::context(0), u8::from(*result) as u64);
                MSG_CONFIG_CLIENT_ID_RES
            }
            Self::ConfigClientBankReq {
                bank,
                bankd_ip,
                bankd_port,
            } => {
                put_slot(buf, 0, bank.bank_id, bank.slot_nr);
                ber::put_uint(buf, ber::context(1), *bankd_ip as u64);
                ber::put_uint(buf, ber::context(2), *bankd_port as u64);
                MSG_CONFIG_CLIENT_BANK_REQ
            }
            Self::ConfigClientBankRes { result } => {
                ber::put_uint(buf, ber::context(0), u8::from(*result) as u64);
                MSG_CONFIG_CLIENT_BANK_RES
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut outer = ber::Reader::new(bytes);
        let body = outer.expect(ber::SEQUENCE)?;

        let mut reader = ber::Reader::new(body);
        let _version = ber::uint(reader.expect(ber::context(0))?)?;
        let _tag = ber::uint(reader.expect(ber::context(1))?)?;
        let choice = reader.expect(ber::constructed(2))?;

        let mut reader = ber::Reader::new(choice);
        let (tag, msg) = reader.next()?.ok_or(Error::ShortBuffer)?;
        if tag & 0xE0 != 0xA0 {
            return Err(Error::UnknownPduType(tag));
        }

        let mut fields = ber::Reader::new(msg);
        Ok(match tag & 0x1F {
            MSG_CONNECT_CLIENT_REQ => Self::ConnectClientReq {
                identity: get_identity(fields.expect(ber::constructed(0))?)?,
                client_slot: fields
                    .optional(ber::constructed(1))?
                    .map(get_client_slot)
                    .transpose()?,
            },
            MSG_CONNECT_CLIENT_RES => Self::ConnectClientRes {
                identity: get_identity(fields.expect(ber::constructed(0))?)?,
                result: get_result(fields.expect(ber::context(1))?)?,
            },
            MSG_CONNECT_BANK_REQ => Self::ConnectBankReq {
                identity: get_identity(fields.expect(ber::constructed(0))?)?,
                bank_id: ber::uint16(fields.expect(ber::context(1))?)?,
                num_slots: ber::uint16(fields.expect(ber::context(2))?)?,
            },
            MSG_CONNECT_BANK_RES => Self::ConnectBankRes {
                identity: get_identity(fields.expect(ber::constructed(0))?)?,
                result: get_result(fields.expect(ber::context(1))?)?,
            },
            MSG_CREATE_MAPPING_REQ => Self::CreateMappingReq {
                client: get_client_slot(fields.expect(ber::constructed(0))?)?,
                bank: get_bank_slot(fields.expect(ber::constructed(1))?)?,
            },
            MSG_CREATE_MAPPING_RES => Self::CreateMappingRes {
                result: get_result(fields.expect(ber::context(0))?)?,
            },
            MSG_REMOVE_MAPPING_REQ => Self::RemoveMappingReq {
                client: get_client_slot(fields.expect(ber::constructed(0))?)?,
                bank: get_bank_slot(fields.expect(ber::constructed(1))?)?,
            },
            MSG_REMOVE_MAPPING_RES => Self::RemoveMappingRes {
                result: get_result(fields.expect(ber::context(0))?)?,
            },
            MSG_CONFIG_CLIENT_ID_REQ => Self::ConfigClientIdReq {
                client_slot: get_client_slot(fields.expect(ber::constructed(0))?)?,
            },
            MSG_CONFIG_CLIENT_ID_RES => Self::ConfigClientIdRes {
                result: get_result(fields.expect(ber::context(0))?)?,
            },
            MSG_CONFIG_CLIENT_BANK_REQ => Self::ConfigClientBankReq {
                bank: get_bank_slot(fields.expect(ber::constructed(0))?)?,
                bankd_ip: ber::uint32(fields.expect(ber::context(1))?)?,
                bankd_port: ber::uint16(fields.expect(ber::context(2))?)?,
            },
            MSG_CONFIG_CLIENT_BANK_RES => Self::ConfigClientBankRes {
                result: get_result(fields.expect(ber::context(0))?)?,
            },
            other => return Err(Error::UnknownPduType(other)),
        })
    }
}
