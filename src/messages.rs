//! Channel Access message encoding and decoding.
//!
//! Each CA command is a 16-byte header followed by a payload padded out to a multiple
//! of eight bytes. Several command ids are shared between a request and its response
//! but with different meanings for the header fields, so the direction a message is
//! travelling must be known to decode it: see [`Message::parse_client_message`] and
//! [`Message::parse_server_message`].
//!
//! On top of single-message parsing this module provides the stream-level pieces a
//! circuit needs: [`CommandCodec`] for framing a TCP byte stream, and [`Handshake`]
//! for the version/identification exchange at the start of a circuit.

use std::{
    fmt::Display,
    io::{self, Cursor},
    net::Ipv4Addr,
};

use nom::{
    Err, IResult, Parser,
    bytes::complete::take,
    error::{Error, ErrorKind},
    number::complete::{be_u16, be_u32},
};
use thiserror::Error;
use tokio_util::{
    bytes::{Buf, BytesMut},
    codec::Decoder,
};

use crate::dbr::{Dbr, DbrBasicType, DbrError, DbrType};

pub const EPICS_VERSION: u16 = 13;
/// Oldest server protocol revision a circuit will accept
pub const MINIMUM_SERVER_VERSION: u16 = 11;

const HEADER_SIZE: usize = 16;
const EXTENDED_HEADER_SIZE: usize = 24;

/// Search flag asking the server to answer even when it does not host the name
const DO_REPLY: u16 = 10;
const DONT_REPLY: u16 = 5;

/// A basic trait to tie nom parseability to the struct without a
/// plethora of named functions.
pub trait CAMessage: Sized {
    const COMMAND: u16;

    fn from_raw(raw: RawMessage) -> Result<Self, MessageError>;
    fn to_raw(&self) -> RawMessage;

    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (rest, raw) = RawMessage::parse(input)?;
        if raw.command != Self::COMMAND {
            return Err(Err::Error(Error::new(input, ErrorKind::Tag)));
        }
        let message =
            Self::from_raw(raw).map_err(|_| Err::Error(Error::new(input, ErrorKind::Verify)))?;
        Ok((rest, message))
    }

    fn write<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        self.to_raw().write(writer)
    }
}

pub trait AsBytes {
    fn as_bytes(&self) -> Vec<u8>;
}

impl<T: CAMessage> AsBytes for T {
    fn as_bytes(&self) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        // Writing to a Vec is infallible
        let _ = self.write(&mut buffer);
        buffer.into_inner()
    }
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("IO Error Occured: {0}")]
    IO(#[from] io::Error),
    #[error("An error occured parsing a message: {0}")]
    ParsingError(String),
    #[error("Unknown command ID: {0}")]
    UnknownCommandId(u16),
    #[error("Invalid message field: {0} == {1}")]
    InvalidField(String, String),
    #[error("Invalid payload data: {0}")]
    InvalidData(#[from] DbrError),
    #[error("Stream desynchronized: header announced {0} byte payload")]
    Desynchronized(usize),
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for MessageError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        MessageError::ParsingError(format!("{:?}", err.map_input(|i| i.len())))
    }
}

/// The undifferentiated header and payload of any CA message
#[derive(Default, Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub command: u16,
    pub field_1_data_type: u16,
    pub field_2_data_count: u32,
    pub field_3_parameter_1: u32,
    pub field_4_parameter_2: u32,
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// Work out the header and payload size of the next message, if the header is complete
    fn peek_frame(input: &[u8]) -> Option<(usize, usize)> {
        if input.len() < HEADER_SIZE {
            return None;
        }
        let payload_size = u16::from_be_bytes([input[2], input[3]]);
        if payload_size == 0xFFFF {
            if input.len() < EXTENDED_HEADER_SIZE {
                return None;
            }
            let size = u32::from_be_bytes([input[16], input[17], input[18], input[19]]);
            Some((EXTENDED_HEADER_SIZE, size as usize))
        } else {
            Some((HEADER_SIZE, payload_size as usize))
        }
    }

    /// Parse only the header, returning the announced payload size alongside
    fn parse_header(input: &[u8]) -> IResult<&[u8], (RawMessage, usize)> {
        let (input, command) = be_u16(input)?;
        let (input, payload_size) = be_u16(input)?;
        // "Data Type" is always here, even in large packet headers
        let (input, data_type) = be_u16(input)?;
        let (input, short_count) = be_u16(input)?;
        let (input, parameter_1) = be_u32(input)?;
        let (input, parameter_2) = be_u32(input)?;
        let (input, payload_size, data_count) = if payload_size == 0xFFFF {
            let (input, size) = be_u32(input)?;
            let (input, count) = be_u32(input)?;
            (input, size as usize, count)
        } else {
            (input, payload_size as usize, short_count as u32)
        };
        Ok((
            input,
            (
                RawMessage {
                    command,
                    field_1_data_type: data_type,
                    field_2_data_count: data_count,
                    field_3_parameter_1: parameter_1,
                    field_4_parameter_2: parameter_2,
                    payload: Vec::new(),
                },
                payload_size,
            ),
        ))
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], RawMessage> {
        let (input, (mut message, payload_size)) = Self::parse_header(input)?;
        let (input, payload) = take(payload_size).parse(input)?;
        message.payload = payload.to_vec();
        Ok((input, message))
    }

    pub fn write<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        // The protocol requires payloads padded out to an 8 byte multiple
        let padded_size = self.payload.len().div_ceil(8) * 8;

        writer.write_all(&self.command.to_be_bytes())?;
        if padded_size < 0xFFFF && self.field_2_data_count <= 0xFFFF {
            writer.write_all(&(padded_size as u16).to_be_bytes())?;
            writer.write_all(&self.field_1_data_type.to_be_bytes())?;
            writer.write_all(&(self.field_2_data_count as u16).to_be_bytes())?;
            writer.write_all(&self.field_3_parameter_1.to_be_bytes())?;
            writer.write_all(&self.field_4_parameter_2.to_be_bytes())?;
        } else {
            writer.write_all(&0xFFFFu16.to_be_bytes())?;
            writer.write_all(&self.field_1_data_type.to_be_bytes())?;
            writer.write_all(&0u16.to_be_bytes())?;
            writer.write_all(&self.field_3_parameter_1.to_be_bytes())?;
            writer.write_all(&self.field_4_parameter_2.to_be_bytes())?;
            writer.write_all(&(padded_size as u32).to_be_bytes())?;
            writer.write_all(&self.field_2_data_count.to_be_bytes())?;
        }
        writer.write_all(&self.payload)?;
        writer.write_all(&vec![0; padded_size - self.payload.len()])?;
        Ok(())
    }

    fn payload_as_string(&self) -> String {
        let len = self
            .payload
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..len]).into_owned()
    }

    fn data_type(&self) -> Result<DbrType, MessageError> {
        DbrType::try_from(self.field_1_data_type).map_err(|_| {
            MessageError::InvalidField("data_type".into(), self.field_1_data_type.to_string())
        })
    }
}

/// A null-terminated string payload; padding happens on write
fn string_payload(string: &str) -> Vec<u8> {
    let mut bytes = string.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

/// Message CA_PROTO_VERSION.
///
/// Exchanges client and server protocol versions and desired circuit
/// priority. MUST be the first message sent, by both client and server,
/// when a new TCP (Virtual Circuit) connection is established. It is
/// also sent as the first message in UDP search messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    pub priority: u16,
    pub protocol_version: u16,
}

impl Default for Version {
    fn default() -> Self {
        Version {
            priority: 0,
            protocol_version: EPICS_VERSION,
        }
    }
}

impl Version {
    pub fn is_compatible(&self) -> bool {
        self.protocol_version >= MINIMUM_SERVER_VERSION
    }
}

impl CAMessage for Version {
    const COMMAND: u16 = 0;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(Version {
            priority: raw.field_1_data_type,
            protocol_version: raw.field_2_data_count as u16,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.priority,
            field_2_data_count: self.protocol_version as u32,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_SEARCH.
///
/// Searches for a given channel name. Sent over UDP or TCP.
#[derive(Debug, Clone, PartialEq)]
pub struct Search {
    pub search_id: u32,
    pub channel_name: String,
    /// Indicating whether failed search response should be returned.
    pub should_reply: bool,
    pub protocol_version: u16,
}

impl Default for Search {
    fn default() -> Self {
        Search {
            search_id: 0,
            channel_name: String::new(),
            should_reply: false,
            protocol_version: EPICS_VERSION,
        }
    }
}

impl Search {
    /// Construct a positive reply to this search
    pub fn respond(&self, server_ip: Option<Ipv4Addr>, port_number: u16) -> SearchResponse {
        SearchResponse {
            port_number,
            server_ip,
            search_id: self.search_id,
            protocol_version: Some(EPICS_VERSION),
        }
    }
}

impl CAMessage for Search {
    const COMMAND: u16 = 6;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(Search {
            should_reply: raw.field_1_data_type == DO_REPLY,
            protocol_version: raw.field_2_data_count as u16,
            search_id: raw.field_3_parameter_1,
            channel_name: raw.payload_as_string(),
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: if self.should_reply { DO_REPLY } else { DONT_REPLY },
            field_2_data_count: self.protocol_version as u32,
            field_3_parameter_1: self.search_id,
            field_4_parameter_2: self.search_id,
            payload: string_payload(&self.channel_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResponse {
    pub port_number: u16,
    pub search_id: u32,
    /// Server to connect to, if different from the message sender
    pub server_ip: Option<Ipv4Addr>,
    /// Protocol version only present if this is being sent as UDP
    pub protocol_version: Option<u16>,
}

impl CAMessage for SearchResponse {
    const COMMAND: u16 = 6;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(SearchResponse {
            port_number: raw.field_1_data_type,
            server_ip: match raw.field_3_parameter_1 {
                0xFFFFFFFF | 0 => None,
                i => Some(Ipv4Addr::from(i)),
            },
            search_id: raw.field_4_parameter_2,
            protocol_version: match raw.payload.as_slice() {
                [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
                _ => None,
            },
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.port_number,
            field_2_data_count: 0,
            field_3_parameter_1: self.server_ip.map(|ip| ip.to_bits()).unwrap_or(0xFFFFFFFF),
            field_4_parameter_2: self.search_id,
            payload: self
                .protocol_version
                .map(|v| v.to_be_bytes().to_vec())
                .unwrap_or_default(),
        }
    }
}

/// Message CA_PROTO_NOT_FOUND.
///
/// Sent by a server in answer to a search with the reply flag set, when it does not
/// host the requested name.
#[derive(Debug, Clone, PartialEq)]
pub struct NotFound {
    pub search_id: u32,
}

impl CAMessage for NotFound {
    const COMMAND: u16 = 14;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(NotFound {
            search_id: raw.field_4_parameter_2,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: DO_REPLY,
            field_2_data_count: EPICS_VERSION as u32,
            field_3_parameter_1: self.search_id,
            field_4_parameter_2: self.search_id,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_RSRV_IS_UP.
///
/// Beacon sent by a server when it becomes available. Beacons are also
/// sent out periodically to announce the server is still alive. Another
/// function of beacons is to allow detection of changes in network
/// topology. Sent over UDP.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RsrvIsUp {
    pub server_port: u16,
    pub beacon_id: u32,
    pub server_ip: Option<Ipv4Addr>,
    pub protocol_version: u16,
}

impl CAMessage for RsrvIsUp {
    const COMMAND: u16 = 13;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(RsrvIsUp {
            server_port: raw.field_2_data_count as u16,
            beacon_id: raw.field_3_parameter_1,
            server_ip: match raw.field_4_parameter_2 {
                0 => None,
                ip => Some(Ipv4Addr::from(ip)),
            },
            protocol_version: raw.field_1_data_type,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.protocol_version,
            field_2_data_count: self.server_port as u32,
            field_3_parameter_1: self.beacon_id,
            field_4_parameter_2: self.server_ip.map(|ip| ip.to_bits()).unwrap_or(0),
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_CREATE_CHAN.
///
/// Requests creation of channel. Server will allocate required
/// resources and return initialized SID. Sent over TCP.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateChannel {
    pub client_id: u32,
    pub protocol_version: u32,
    pub channel_name: String,
}

impl Default for CreateChannel {
    fn default() -> Self {
        CreateChannel {
            client_id: 0,
            protocol_version: EPICS_VERSION as u32,
            channel_name: String::new(),
        }
    }
}

impl CAMessage for CreateChannel {
    const COMMAND: u16 = 18;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(CreateChannel {
            client_id: raw.field_3_parameter_1,
            protocol_version: raw.field_4_parameter_2,
            channel_name: raw.payload_as_string(),
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.protocol_version,
            payload: string_payload(&self.channel_name),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateChannelResponse {
    pub data_type: DbrBasicType,
    pub data_count: u32,
    pub client_id: u32,
    pub server_id: u32,
}

impl CAMessage for CreateChannelResponse {
    const COMMAND: u16 = 18;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(CreateChannelResponse {
            data_type: raw.field_1_data_type.try_into().map_err(|_| {
                MessageError::InvalidField("native_type".into(), raw.field_1_data_type.to_string())
            })?,
            data_count: raw.field_2_data_count,
            client_id: raw.field_3_parameter_1,
            server_id: raw.field_4_parameter_2,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.data_type as u16,
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.server_id,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_CREATE_CH_FAIL
#[derive(Debug, Clone, PartialEq)]
pub struct CreateChannelFailure {
    pub client_id: u32,
}

impl CAMessage for CreateChannelFailure {
    const COMMAND: u16 = 26;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(CreateChannelFailure {
            client_id: raw.field_3_parameter_1,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_3_parameter_1: self.client_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Access {
    #[default]
    None = 0,
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl Access {
    pub fn can_read(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
    pub fn can_write(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

impl TryFrom<u32> for Access {
    type Error = MessageError;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Access::None),
            1 => Ok(Access::Read),
            2 => Ok(Access::Write),
            3 => Ok(Access::ReadWrite),
            _ => Err(MessageError::InvalidField(
                "AccessRight".to_owned(),
                value.to_string(),
            )),
        }
    }
}

impl Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Access::None => "NoAccess",
            Access::Read => "ReadOnly",
            Access::Write => "WriteOnly",
            Access::ReadWrite => "ReadWrite",
        };
        write!(f, "{text}")
    }
}

/// Message CA_PROTO_ACCESS_RIGHTS
///
/// Notifies of access rights for a channel. This value is determined
/// based on host and client name and may change during runtime. Client
/// cannot change access rights nor can it explicitly query its value,
/// so last received value must be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessRights {
    pub client_id: u32,
    pub access_rights: Access,
}

impl CAMessage for AccessRights {
    const COMMAND: u16 = 22;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(AccessRights {
            client_id: raw.field_3_parameter_1,
            access_rights: raw.field_4_parameter_2.try_into()?,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.access_rights as u32,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientName {
    pub name: String,
}

impl CAMessage for ClientName {
    const COMMAND: u16 = 20;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(ClientName {
            name: raw.payload_as_string(),
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            payload: string_payload(&self.name),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostName {
    pub name: String,
}

impl CAMessage for HostName {
    const COMMAND: u16 = 21;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(HostName {
            name: raw.payload_as_string(),
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            payload: string_payload(&self.name),
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_READ_NOTIFY.
///
/// Read value of a channel. Sent over TCP.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadNotify {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
}

impl CAMessage for ReadNotify {
    const COMMAND: u16 = 15;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(ReadNotify {
            data_type: raw.data_type()?,
            data_count: raw.field_2_data_count,
            server_id: raw.field_3_parameter_1,
            client_ioid: raw.field_4_parameter_2,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.client_ioid,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadNotifyResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    /// ECA status of the read
    pub status: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}

impl ReadNotifyResponse {
    pub fn new(client_ioid: u32, dbr: &Dbr) -> Self {
        let (count, data) = dbr.to_bytes();
        ReadNotifyResponse {
            data_type: dbr.data_type(),
            data_count: count as u32,
            status: ErrorCondition::Normal.to_status(),
            client_ioid,
            data,
        }
    }
}

impl CAMessage for ReadNotifyResponse {
    const COMMAND: u16 = 15;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(ReadNotifyResponse {
            data_type: raw.data_type()?,
            data_count: raw.field_2_data_count,
            status: raw.field_3_parameter_1,
            client_ioid: raw.field_4_parameter_2,
            data: raw.payload,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.status,
            field_4_parameter_2: self.client_ioid,
            payload: self.data.clone(),
        }
    }
}

/// Messages CA_PROTO_WRITE and CA_PROTO_WRITE_NOTIFY.
///
/// The same layout is used with and without the acknowledgement request; the
/// command id decides whether the server answers.
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
    pub notify: bool,
}

impl Write {
    pub fn new(server_id: u32, client_ioid: u32, dbr: &Dbr, notify: bool) -> Self {
        let (count, data) = dbr.to_bytes();
        Write {
            data_type: dbr.data_type(),
            data_count: count as u32,
            server_id,
            client_ioid,
            data,
            notify,
        }
    }

    fn from_raw_with(raw: RawMessage, notify: bool) -> Result<Self, MessageError> {
        Ok(Write {
            data_type: raw.data_type()?,
            data_count: raw.field_2_data_count,
            server_id: raw.field_3_parameter_1,
            client_ioid: raw.field_4_parameter_2,
            data: raw.payload,
            notify,
        })
    }

    pub fn value(&self) -> Result<Dbr, DbrError> {
        Dbr::from_bytes(self.data_type, self.data_count as usize, &self.data)
    }

    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: if self.notify { 19 } else { 4 },
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.client_ioid,
            payload: self.data.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteNotifyResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status: u32,
    pub client_ioid: u32,
}

impl CAMessage for WriteNotifyResponse {
    const COMMAND: u16 = 19;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(WriteNotifyResponse {
            data_type: raw.data_type()?,
            data_count: raw.field_2_data_count,
            status: raw.field_3_parameter_1,
            client_ioid: raw.field_4_parameter_2,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.status,
            field_4_parameter_2: self.client_ioid,
            ..Default::default()
        }
    }
}

/// Which kinds of change trigger a subscription update
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MonitorMask {
    pub value: bool,
    pub log: bool,
    pub alarm: bool,
    pub property: bool,
}

impl Default for MonitorMask {
    fn default() -> Self {
        MonitorMask {
            value: true,
            log: false,
            alarm: true,
            property: false,
        }
    }
}

impl From<MonitorMask> for u16 {
    fn from(mask: MonitorMask) -> Self {
        (mask.value as u16) | (mask.log as u16) << 1 | (mask.alarm as u16) << 2 | (mask.property as u16) << 3
    }
}

impl From<u16> for MonitorMask {
    fn from(bits: u16) -> Self {
        MonitorMask {
            value: bits & 1 != 0,
            log: bits & 2 != 0,
            alarm: bits & 4 != 0,
            property: bits & 8 != 0,
        }
    }
}

/// Message CA_PROTO_EVENT_ADD.
///
/// Creates a subscription on a channel, with the server sending further
/// EventAddResponse messages every time the mask conditions are met.
#[derive(Debug, Clone, PartialEq)]
pub struct EventAdd {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
    pub mask: MonitorMask,
}

impl CAMessage for EventAdd {
    const COMMAND: u16 = 1;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        // Three unused f32 (low, high, to) precede the mask
        let mask = match raw.payload.get(12..14) {
            Some([hi, lo]) => u16::from_be_bytes([*hi, *lo]),
            _ => return Err(MessageError::InvalidField("mask".into(), "missing".into())),
        };
        Ok(EventAdd {
            data_type: raw.data_type()?,
            data_count: raw.field_2_data_count,
            server_id: raw.field_3_parameter_1,
            subscription_id: raw.field_4_parameter_2,
            mask: mask.into(),
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut payload = vec![0u8; 16];
        payload[12..14].copy_from_slice(&u16::from(self.mask).to_be_bytes());
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.subscription_id,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventAddResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status_code: u32,
    pub subscription_id: u32,
    pub data: Vec<u8>,
}

impl EventAddResponse {
    pub fn new(subscription_id: u32, dbr: &Dbr) -> Self {
        let (count, data) = dbr.to_bytes();
        EventAddResponse {
            data_type: dbr.data_type(),
            data_count: count as u32,
            status_code: ErrorCondition::Normal.to_status(),
            subscription_id,
            data,
        }
    }

    /// The empty response a server sends to confirm a subscription is cancelled
    pub fn cancelled(data_type: DbrType, subscription_id: u32) -> Self {
        EventAddResponse {
            data_type,
            data_count: 0,
            status_code: ErrorCondition::Normal.to_status(),
            subscription_id,
            data: Vec::new(),
        }
    }

    pub fn cancel(&self, server_id: u32) -> EventCancel {
        EventCancel {
            data_type: self.data_type,
            data_count: self.data_count,
            server_id,
            subscription_id: self.subscription_id,
        }
    }
}

impl CAMessage for EventAddResponse {
    const COMMAND: u16 = 1;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(EventAddResponse {
            data_type: raw.data_type()?,
            data_count: raw.field_2_data_count,
            status_code: raw.field_3_parameter_1,
            subscription_id: raw.field_4_parameter_2,
            data: raw.payload,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.status_code,
            field_4_parameter_2: self.subscription_id,
            payload: self.data.clone(),
        }
    }
}

/// Message CA_PROTO_EVENT_CANCEL
#[derive(Debug, Clone, PartialEq)]
pub struct EventCancel {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
}

impl CAMessage for EventCancel {
    const COMMAND: u16 = 2;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(EventCancel {
            data_type: raw.data_type()?,
            data_count: raw.field_2_data_count,
            server_id: raw.field_3_parameter_1,
            subscription_id: raw.field_4_parameter_2,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.subscription_id,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_CLEAR_CHANNEL, identical in both directions
#[derive(Debug, Clone, PartialEq)]
pub struct ClearChannel {
    pub server_id: u32,
    pub client_id: u32,
}

impl CAMessage for ClearChannel {
    const COMMAND: u16 = 12;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(ClearChannel {
            server_id: raw.field_3_parameter_1,
            client_id: raw.field_4_parameter_2,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.client_id,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_SERVER_DISCONN
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDisconnect {
    pub client_id: u32,
}

impl CAMessage for ServerDisconnect {
    const COMMAND: u16 = 27;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        Ok(ServerDisconnect {
            client_id: raw.field_3_parameter_1,
        })
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_3_parameter_1: self.client_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Echo;

impl CAMessage for Echo {
    const COMMAND: u16 = 23;
    fn from_raw(_raw: RawMessage) -> Result<Self, MessageError> {
        Ok(Echo)
    }
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            ..Default::default()
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCondition {
    Normal = 0,
    AllocMem = 6,
    TooLarge = 9,
    Timeout = 10,
    BadType = 14,
    Internal = 17,
    GetFail = 19,
    PutFail = 20,
    BadCount = 22,
    BadStr = 23,
    Disconn = 24,
    BadMonId = 30,
    BadMask = 41,
    NoRdAccess = 46,
    NoWtAccess = 47,
    NoConvert = 50,
    BadChId = 51,
    UnavailInServ = 54,
    ChanDestroy = 55,
    BadPriority = 56,
}

impl ErrorCondition {
    const ALL: [ErrorCondition; 20] = [
        Self::Normal,
        Self::AllocMem,
        Self::TooLarge,
        Self::Timeout,
        Self::BadType,
        Self::Internal,
        Self::GetFail,
        Self::PutFail,
        Self::BadCount,
        Self::BadStr,
        Self::Disconn,
        Self::BadMonId,
        Self::BadMask,
        Self::NoRdAccess,
        Self::NoWtAccess,
        Self::NoConvert,
        Self::BadChId,
        Self::UnavailInServ,
        Self::ChanDestroy,
        Self::BadPriority,
    ];

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Normal => ErrorSeverity::Success,
            Self::Internal => ErrorSeverity::Severe,
            Self::BadType
            | Self::BadStr
            | Self::BadMonId
            | Self::BadMask
            | Self::BadChId
            | Self::BadPriority => ErrorSeverity::Error,
            _ => ErrorSeverity::Warning,
        }
    }

    /// The on-the-wire ECA value: message number shifted over the severity bits
    pub fn to_status(&self) -> u32 {
        ((*self as u32) << 3) | self.severity() as u32
    }

    pub fn from_status(status: u32) -> Option<Self> {
        let code = status >> 3;
        Self::ALL.into_iter().find(|c| *c as u32 == code)
    }
}

impl Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Normal => "Normal successful completion",
            Self::AllocMem => "Unable to allocate additional dynamic memory",
            Self::TooLarge => "The requested data transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES",
            Self::Timeout => "User specified timeout on IO operation expired",
            Self::BadType => "The data type specified is invalid",
            Self::Internal => "Channel Access Internal Failure",
            Self::GetFail => "Channel read request failed",
            Self::PutFail => "Channel write request failed",
            Self::BadCount => "Invalid element count requested",
            Self::BadStr => "Invalid string",
            Self::Disconn => "Virtual circuit disconnect",
            Self::BadMonId => "Bad event subscription (monitor) identifier",
            Self::BadMask => "Invalid event selection mask",
            Self::NoRdAccess => "Read access denied",
            Self::NoWtAccess => "Write access denied",
            Self::NoConvert => "No reasonable data conversion between client and server types",
            Self::BadChId => "Invalid channel identifier",
            Self::UnavailInServ => "Not supported by attached service",
            Self::ChanDestroy => "User destroyed channel",
            Self::BadPriority => "Invalid channel priority",
        };
        write!(f, "{text}")
    }
}

/// Message CA_PROTO_ERROR.
///
/// Sent by the server to report failure of a request; the payload echoes the header
/// of the request that failed, so the ioid/subscription id can be recovered.
#[derive(Debug, Clone, PartialEq)]
pub struct ECAError {
    pub client_id: u32,
    pub status: u32,
    pub original_request: RawMessage,
    pub error_message: String,
}

impl ECAError {
    pub fn condition(&self) -> Option<ErrorCondition> {
        ErrorCondition::from_status(self.status)
    }
}

impl CAMessage for ECAError {
    const COMMAND: u16 = 11;
    fn from_raw(raw: RawMessage) -> Result<Self, MessageError> {
        let (rest, (original_request, _)) = RawMessage::parse_header(&raw.payload)?;
        let len = rest.iter().position(|&c| c == 0).unwrap_or(rest.len());
        Ok(ECAError {
            client_id: raw.field_3_parameter_1,
            status: raw.field_4_parameter_2,
            error_message: String::from_utf8_lossy(&rest[..len]).into_owned(),
            original_request,
        })
    }
    fn to_raw(&self) -> RawMessage {
        let mut payload = Vec::new();
        // The echoed header carries no payload of its own
        let _ = RawMessage {
            payload: Vec::new(),
            ..self.original_request.clone()
        }
        .write(&mut payload);
        payload.extend(string_payload(&self.error_message));
        RawMessage {
            command: Self::COMMAND,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.status,
            payload,
            ..Default::default()
        }
    }
}

/// Every message this crate can send or receive
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(Version),
    RsrvIsUp(RsrvIsUp),
    Search(Search),
    SearchResponse(SearchResponse),
    NotFound(NotFound),
    CreateChannel(CreateChannel),
    CreateChannelResponse(CreateChannelResponse),
    CreateChannelFailure(CreateChannelFailure),
    AccessRights(AccessRights),
    ClientName(ClientName),
    HostName(HostName),
    ReadNotify(ReadNotify),
    ReadNotifyResponse(ReadNotifyResponse),
    Write(Write),
    WriteNotifyResponse(WriteNotifyResponse),
    EventAdd(EventAdd),
    EventAddResponse(EventAddResponse),
    EventCancel(EventCancel),
    ClearChannel(ClearChannel),
    ServerDisconnect(ServerDisconnect),
    ECAError(ECAError),
    Echo,
}

macro_rules! impl_message_from {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Message {
                fn from(value: $variant) -> Self {
                    Message::$variant(value)
                }
            }
        )*
    };
}
impl_message_from!(
    Version,
    RsrvIsUp,
    Search,
    SearchResponse,
    NotFound,
    CreateChannel,
    CreateChannelResponse,
    CreateChannelFailure,
    AccessRights,
    ClientName,
    HostName,
    ReadNotify,
    ReadNotifyResponse,
    Write,
    WriteNotifyResponse,
    EventAdd,
    EventAddResponse,
    EventCancel,
    ClearChannel,
    ServerDisconnect,
    ECAError
);

/// Which end of a connection a message is travelling towards
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Messages sent by a server, decoded by a client
    ToClient,
    /// Messages sent by a client, decoded by a server
    ToServer,
}

impl Message {
    fn from_raw(raw: RawMessage, direction: Direction) -> Result<Self, MessageError> {
        use Direction::*;
        Ok(match (raw.command, direction) {
            (0, _) => Version::from_raw(raw)?.into(),
            (1, ToClient) => EventAddResponse::from_raw(raw)?.into(),
            (1, ToServer) => EventAdd::from_raw(raw)?.into(),
            (2, ToServer) => EventCancel::from_raw(raw)?.into(),
            (4, ToServer) => Write::from_raw_with(raw, false)?.into(),
            (6, ToClient) => SearchResponse::from_raw(raw)?.into(),
            (6, ToServer) => Search::from_raw(raw)?.into(),
            (11, ToClient) => ECAError::from_raw(raw)?.into(),
            (12, _) => ClearChannel::from_raw(raw)?.into(),
            (13, ToClient) => RsrvIsUp::from_raw(raw)?.into(),
            (14, ToClient) => NotFound::from_raw(raw)?.into(),
            (15, ToClient) => ReadNotifyResponse::from_raw(raw)?.into(),
            (15, ToServer) => ReadNotify::from_raw(raw)?.into(),
            (18, ToClient) => CreateChannelResponse::from_raw(raw)?.into(),
            (18, ToServer) => CreateChannel::from_raw(raw)?.into(),
            (19, ToClient) => WriteNotifyResponse::from_raw(raw)?.into(),
            (19, ToServer) => Write::from_raw_with(raw, true)?.into(),
            (20, ToServer) => ClientName::from_raw(raw)?.into(),
            (21, ToServer) => HostName::from_raw(raw)?.into(),
            (22, ToClient) => AccessRights::from_raw(raw)?.into(),
            (23, _) => Message::Echo,
            (26, ToClient) => CreateChannelFailure::from_raw(raw)?.into(),
            (27, ToClient) => ServerDisconnect::from_raw(raw)?.into(),
            (unknown, _) => return Err(MessageError::UnknownCommandId(unknown)),
        })
    }

    /// Parse a single message as received by a client
    pub fn parse_client_message(input: &[u8]) -> Result<(&[u8], Self), MessageError> {
        let (rest, raw) = RawMessage::parse(input)?;
        Ok((rest, Self::from_raw(raw, Direction::ToClient)?))
    }

    /// Parse a single message as received by a server
    pub fn parse_server_message(input: &[u8]) -> Result<(&[u8], Self), MessageError> {
        let (rest, raw) = RawMessage::parse(input)?;
        Ok((rest, Self::from_raw(raw, Direction::ToServer)?))
    }

    /// Parse a whole datagram of messages sent by a server
    pub fn parse_many_client_messages(mut input: &[u8]) -> Result<Vec<Self>, MessageError> {
        let mut messages = Vec::new();
        while !input.is_empty() {
            let (rest, message) = Self::parse_client_message(input)?;
            messages.push(message);
            input = rest;
        }
        Ok(messages)
    }

    /// Parse a whole datagram of messages sent by a client
    pub fn parse_many_server_messages(mut input: &[u8]) -> Result<Vec<Self>, MessageError> {
        let mut messages = Vec::new();
        while !input.is_empty() {
            let (rest, message) = Self::parse_server_message(input)?;
            messages.push(message);
            input = rest;
        }
        Ok(messages)
    }

    fn to_raw(&self) -> RawMessage {
        match self {
            Self::Echo => Echo.to_raw(),
            Self::Version(msg) => msg.to_raw(),
            Self::RsrvIsUp(msg) => msg.to_raw(),
            Self::Search(msg) => msg.to_raw(),
            Self::SearchResponse(msg) => msg.to_raw(),
            Self::NotFound(msg) => msg.to_raw(),
            Self::CreateChannel(msg) => msg.to_raw(),
            Self::CreateChannelResponse(msg) => msg.to_raw(),
            Self::CreateChannelFailure(msg) => msg.to_raw(),
            Self::AccessRights(msg) => msg.to_raw(),
            Self::ClientName(msg) => msg.to_raw(),
            Self::HostName(msg) => msg.to_raw(),
            Self::ReadNotify(msg) => msg.to_raw(),
            Self::ReadNotifyResponse(msg) => msg.to_raw(),
            Self::Write(msg) => msg.to_raw(),
            Self::WriteNotifyResponse(msg) => msg.to_raw(),
            Self::EventAdd(msg) => msg.to_raw(),
            Self::EventAddResponse(msg) => msg.to_raw(),
            Self::EventCancel(msg) => msg.to_raw(),
            Self::ClearChannel(msg) => msg.to_raw(),
            Self::ServerDisconnect(msg) => msg.to_raw(),
            Self::ECAError(msg) => msg.to_raw(),
        }
    }

    pub fn write<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        self.to_raw().write(writer)
    }
}

/// Serialize a single command
pub fn encode(message: &Message) -> Vec<u8> {
    let mut buffer = Vec::new();
    let _ = message.write(&mut buffer);
    buffer
}

/// Serialize several commands into one buffer, e.g. for a single datagram
pub fn encode_all<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Vec<u8> {
    messages.into_iter().flat_map(encode).collect()
}

/// Outcome of trying to decode one command from the front of a byte buffer
#[derive(Debug)]
pub enum Decoded {
    Command(Message, usize),
    /// A complete frame that could not be understood; skip `consumed` bytes
    Malformed {
        command: u16,
        consumed: usize,
        error: MessageError,
    },
    NeedMoreData,
}

/// Decode the next command in `bytes`.
///
/// Only an implausible payload size is an error: at that point frame boundaries can
/// no longer be trusted.
pub fn decode(
    bytes: &[u8],
    direction: Direction,
    max_payload: usize,
) -> Result<Decoded, MessageError> {
    let Some((header_len, payload_len)) = RawMessage::peek_frame(bytes) else {
        return Ok(Decoded::NeedMoreData);
    };
    if payload_len > max_payload {
        return Err(MessageError::Desynchronized(payload_len));
    }
    let frame_len = header_len + payload_len;
    if bytes.len() < frame_len {
        return Ok(Decoded::NeedMoreData);
    }
    let command = u16::from_be_bytes([bytes[0], bytes[1]]);
    let parsed = RawMessage::parse(&bytes[..frame_len])
        .map_err(MessageError::from)
        .and_then(|(_, raw)| Message::from_raw(raw, direction));
    Ok(match parsed {
        Ok(message) => Decoded::Command(message, frame_len),
        Err(error) => Decoded::Malformed {
            command,
            consumed: frame_len,
            error,
        },
    })
}

/// An item pulled off a framed stream
#[derive(Debug)]
pub enum Incoming {
    Message(Message),
    Malformed { command: u16, error: MessageError },
}

/// Frames a CA byte stream into [`Message`] values for one direction
#[derive(Debug, Clone)]
pub struct CommandCodec {
    direction: Direction,
    max_payload: usize,
}

impl CommandCodec {
    pub fn client(max_payload: usize) -> Self {
        CommandCodec {
            direction: Direction::ToClient,
            max_payload,
        }
    }
    pub fn server(max_payload: usize) -> Self {
        CommandCodec {
            direction: Direction::ToServer,
            max_payload,
        }
    }
}

impl Decoder for CommandCodec {
    type Item = Incoming;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode(&src[..], self.direction, self.max_payload)? {
            Decoded::NeedMoreData => Ok(None),
            Decoded::Command(message, consumed) => {
                src.advance(consumed);
                Ok(Some(Incoming::Message(message)))
            }
            Decoded::Malformed {
                command,
                consumed,
                error,
            } => {
                src.advance(consumed);
                Ok(Some(Incoming::Malformed { command, error }))
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandshakeError {
    #[error("Server protocol version {0} is not supported")]
    IncompatibleVersion(u16),
    #[error("Expected a VERSION reply, got {0}")]
    UnexpectedMessage(String),
    #[error("Handshake reply could not be decoded: {0}")]
    Malformed(String),
    #[error("Server closed the connection during the handshake")]
    Closed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HandshakeComplete {
    pub server_version: u16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum HandshakeState {
    SendVersion,
    SendHostName,
    SendClientName,
    AwaitVersion,
    Complete(u16),
}

/// Drives the opening exchange of a circuit.
///
/// The client announces its version and priority and identifies itself; the
/// circuit is usable once the server's VERSION reply has been checked.
#[derive(Debug, Clone)]
pub struct Handshake {
    priority: u16,
    client_name: String,
    host_name: String,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(priority: u16, client_name: &str, host_name: &str) -> Self {
        Handshake {
            priority,
            client_name: client_name.to_string(),
            host_name: host_name.to_string(),
            state: HandshakeState::SendVersion,
        }
    }

    pub fn next_handshake_command(&mut self) -> Option<Message> {
        let (message, next) = match self.state {
            HandshakeState::SendVersion => (
                Version {
                    priority: self.priority,
                    protocol_version: EPICS_VERSION,
                }
                .into(),
                HandshakeState::SendHostName,
            ),
            HandshakeState::SendHostName => (
                HostName {
                    name: self.host_name.clone(),
                }
                .into(),
                HandshakeState::SendClientName,
            ),
            HandshakeState::SendClientName => (
                ClientName {
                    name: self.client_name.clone(),
                }
                .into(),
                HandshakeState::AwaitVersion,
            ),
            HandshakeState::AwaitVersion | HandshakeState::Complete(_) => return None,
        };
        self.state = next;
        Some(message)
    }

    pub fn on_handshake_response(
        &mut self,
        message: Message,
    ) -> Result<HandshakeComplete, HandshakeError> {
        match message {
            Message::Version(version) if version.is_compatible() => {
                self.state = HandshakeState::Complete(version.protocol_version);
                Ok(HandshakeComplete {
                    server_version: version.protocol_version,
                })
            }
            Message::Version(version) => {
                Err(HandshakeError::IncompatibleVersion(version.protocol_version))
            }
            other => Err(HandshakeError::UnexpectedMessage(format!("{other:?}"))),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, HandshakeState::Complete(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbr::{DbrCategory, DbrValue};

    #[test]
    fn parse_beacon() {
        let raw_beacon = b"\x00\x0d\x00\x00\x00\x0d\x92\x32\x00\x06\xde\xde\xac\x17\x7c\xcf";
        let (_, beacon) = RsrvIsUp::parse(raw_beacon).unwrap();
        assert_eq!(beacon.server_port, 37426);
        assert_eq!(beacon.beacon_id, 450270);
        assert_eq!(
            beacon.server_ip,
            Some("172.23.124.207".parse::<Ipv4Addr>().unwrap())
        );
        assert_eq!(beacon.as_bytes(), raw_beacon);
    }

    #[test]
    fn parse_version() {
        let raw = b"\x00\x00\x00\x00\x00\x01\x00\x0d\x00\x00\x00\x00\x00\x00\x00\x00";
        let (_, ver) = Version::parse(raw).unwrap();
        assert_eq!(ver.priority, 1);
        assert!(ver.is_compatible());
        assert_eq!(ver.as_bytes(), raw);
    }

    #[test]
    fn parse_search() {
        let raw = b"\x00\x06\x00\x20\x00\x05\x00\x0d\x00\x00\x00\x01\x00\x00\x00\x01ME02P-MO-ALIGN-01:Z:TEMPAAAAAAA\x00";
        let (_, search) = Search::parse(raw).unwrap();
        assert_eq!(search.channel_name, "ME02P-MO-ALIGN-01:Z:TEMPAAAAAAA");
        assert!(!search.should_reply);
        assert_eq!(search.search_id, 1);
        // Not a search
        let raw = b"\x00\x00\x00\x00\x00\x05\x00\x0d\x00\x00\x00\x01\x00\x00\x00\x00";
        assert!(Search::parse(raw).is_err());
    }

    #[test]
    fn search_datagram() {
        let raw = [
            0x0u8, 0x0, 0x0, 0x0, 0x0, 0x1, 0x0, 0xd, 0x0, 0x0, 0x0, 0x5, 0x0, 0x0, 0x0, 0x0,
            0x0u8, 0x6, 0x0, 0x8, 0x0, 0x5, 0x0, 0xd, 0x0, 0x0, 0x0, 0x1, 0x0, 0x0, 0x0, 0x1, 0x73,
            0x6f, 0x6d, 0x65, 0x0, 0x0, 0x0, 0x0,
        ];
        let messages = Message::parse_many_server_messages(&raw).unwrap();
        assert_eq!(messages.len(), 2);
        let Message::Search(search) = &messages[1] else {
            panic!("Expected a search");
        };
        assert_eq!(search.channel_name, "some");
    }

    #[test]
    fn strings_are_padded_to_eight_bytes() {
        let bytes = CreateChannel {
            client_id: 3,
            channel_name: "ABCDEFGH".into(),
            ..Default::default()
        }
        .as_bytes();
        // 8 characters plus the null terminator rounds up to 16
        assert_eq!(bytes.len(), 16 + 16);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 16);
    }

    #[test]
    fn large_payload_uses_extended_header() {
        let dbr = Dbr::Basic(DbrValue::Double(vec![1.0; 10_000]));
        let response = ReadNotifyResponse::new(7, &dbr);
        let bytes = response.as_bytes();
        assert_eq!(bytes.len(), EXTENDED_HEADER_SIZE + 80_000);
        let (rest, message) = Message::parse_client_message(&bytes).unwrap();
        assert!(rest.is_empty());
        let Message::ReadNotifyResponse(parsed) = message else {
            panic!("Wrong message type");
        };
        assert_eq!(parsed.data_count, 10_000);
        assert_eq!(parsed.client_ioid, 7);
    }

    #[test]
    fn direction_decides_meaning() {
        let request = ReadNotify {
            data_type: DbrType::new(DbrBasicType::Double, DbrCategory::Time),
            data_count: 1,
            server_id: 9,
            client_ioid: 4,
        }
        .as_bytes();
        let (_, as_server) = Message::parse_server_message(&request).unwrap();
        assert!(matches!(as_server, Message::ReadNotify(_)));
        let (_, as_client) = Message::parse_client_message(&request).unwrap();
        assert!(matches!(as_client, Message::ReadNotifyResponse(_)));
    }

    #[test]
    fn decode_reports_partial_and_malformed_frames() {
        let echo = encode(&Message::Echo);
        assert!(matches!(
            decode(&echo[..10], Direction::ToClient, 1024).unwrap(),
            Decoded::NeedMoreData
        ));
        // An unknown command is skipped, not fatal
        let mut unknown = echo.clone();
        unknown[1] = 99;
        match decode(&unknown, Direction::ToClient, 1024).unwrap() {
            Decoded::Malformed {
                command, consumed, ..
            } => {
                assert_eq!(command, 99);
                assert_eq!(consumed, 16);
            }
            other => panic!("Unexpected decode: {other:?}"),
        }
        // A payload bigger than we would ever accept means we've lost the framing
        let mut huge = encode(&ClientName { name: "x".into() }.into());
        huge[2] = 0x7F;
        assert!(matches!(
            decode(&huge, Direction::ToServer, 1024),
            Err(MessageError::Desynchronized(_))
        ));
    }

    #[test]
    fn codec_yields_messages_in_order() {
        let mut codec = CommandCodec::client(1 << 20);
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&encode_all(&[
            Message::Echo,
            AccessRights {
                client_id: 2,
                access_rights: Access::ReadWrite,
            }
            .into(),
        ]));
        assert!(matches!(
            codec.decode(&mut buffer).unwrap(),
            Some(Incoming::Message(Message::Echo))
        ));
        let Some(Incoming::Message(Message::AccessRights(rights))) =
            codec.decode(&mut buffer).unwrap()
        else {
            panic!("Expected access rights");
        };
        assert_eq!(rights.access_rights, Access::ReadWrite);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn error_message_echoes_request() {
        let request = ReadNotify {
            data_type: DbrType::new(DbrBasicType::Long, DbrCategory::Basic),
            data_count: 1,
            server_id: 1,
            client_ioid: 77,
        };
        let error = ECAError {
            client_id: 5,
            status: ErrorCondition::NoRdAccess.to_status(),
            original_request: request.to_raw(),
            error_message: "denied".into(),
        };
        let (_, parsed) = Message::parse_client_message(&error.as_bytes()).unwrap();
        let Message::ECAError(parsed) = parsed else {
            panic!("Expected an error message");
        };
        assert_eq!(parsed.condition(), Some(ErrorCondition::NoRdAccess));
        assert_eq!(parsed.original_request.command, 15);
        assert_eq!(parsed.original_request.field_4_parameter_2, 77);
        assert_eq!(parsed.error_message, "denied");
    }

    #[test]
    fn status_codes() {
        assert_eq!(ErrorCondition::Normal.to_status(), 1);
        assert_eq!(
            ErrorCondition::from_status(ErrorCondition::PutFail.to_status()),
            Some(ErrorCondition::PutFail)
        );
        assert_eq!(ErrorCondition::from_status(1), Some(ErrorCondition::Normal));
    }

    #[test]
    fn handshake_sequence() {
        let mut handshake = Handshake::new(0, "user", "host");
        let sent: Vec<_> = std::iter::from_fn(|| handshake.next_handshake_command()).collect();
        assert_eq!(sent.len(), 3);
        assert!(matches!(sent[0], Message::Version(_)));
        assert!(matches!(&sent[1], Message::HostName(h) if h.name == "host"));
        assert!(matches!(&sent[2], Message::ClientName(c) if c.name == "user"));
        assert!(!handshake.is_complete());

        assert_eq!(
            handshake.on_handshake_response(Message::Echo),
            Err(HandshakeError::UnexpectedMessage("Echo".into()))
        );
        assert_eq!(
            handshake.on_handshake_response(
                Version {
                    priority: 0,
                    protocol_version: 4
                }
                .into()
            ),
            Err(HandshakeError::IncompatibleVersion(4))
        );
        assert_eq!(
            handshake.on_handshake_response(Version::default().into()),
            Ok(HandshakeComplete { server_version: 13 })
        );
        assert!(handshake.is_complete());
    }
}
