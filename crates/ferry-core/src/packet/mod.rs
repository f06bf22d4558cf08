//! Local-channel wire protocol.
//!
//! Every message on a local channel is one frame with three independently
//! length-prefixed byte regions plus a 1-byte type tag:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Ferry Frame                          │
//! ├───────────┬───────────┬───────────┬──────┬───────────────────┤
//! │ headerLen │ middleLen │  endLen   │ type │  header / middle  │
//! │  4 bytes  │  4 bytes  │  4 bytes  │ 1 B  │   / end regions   │
//! └───────────┴───────────┴───────────┴──────┴───────────────────┘
//! ```
//!
//! All integers are big-endian. `headerLen` as transmitted includes the type
//! byte, so a decoder reads `headerLen - 1` bytes of true header payload
//! after consuming the type. The type tags are stable and shared with other
//! implementations of the protocol; changing one breaks interoperability.

pub mod codec;

pub use codec::{
    decode_frame, read_packet, read_packet_with_timeout, write_packet, write_packet_with_timeout,
};

use std::fmt;

use xxhash_rust::xxh64::xxh64;

use crate::error::{Error, Result};
use crate::record::TransferMode;

/// Size of the fixed frame prefix: three length fields plus the type byte.
pub const FRAME_PREFIX_SIZE: usize = 13;

/// Hard cap on each declared region, so a corrupt length field cannot make
/// the decoder allocate unbounded memory (16 MB).
pub const MAX_REGION_SIZE: usize = 16 * 1024 * 1024;

/// Separator between the textual fields of a Request packet middle region.
pub const FIELD_SEPARATOR: char = '|';

/// Test packets flip to an administrative Valid exchange after this many
/// ping-pong rounds.
pub const TEST_PING_PONG_LIMIT: i32 = 100;

/// Packet type tags. Stable wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Authentication handshake
    Authent = 1,
    /// Local channel startup
    Startup = 2,
    /// One file block
    Data = 3,
    /// Administrative validation envelope
    Valid = 4,
    /// Transfer-level error
    Error = 5,
    /// Connection-level error
    ConnectionError = 6,
    /// Transfer request
    Request = 7,
    /// Remote shutdown request
    Shutdown = 8,
    /// Stop a transfer (inside a Valid envelope)
    Stop = 9,
    /// Cancel a transfer (inside a Valid envelope)
    Cancel = 10,
    /// Configuration export (inside a Valid envelope)
    ConfExport = 11,
    /// Configuration import (inside a Valid envelope)
    ConfImport = 12,
    /// Ping-pong test
    Test = 13,
    /// End-of-transfer handshake
    EndTransfer = 14,
    /// Re-submission request (inside a Valid envelope)
    RequestUser = 15,
    /// Log export (inside a Valid envelope)
    Log = 16,
    /// Log purge (inside a Valid envelope)
    LogPurge = 17,
    /// Information query
    Information = 18,
    /// Bandwidth control (inside a Valid envelope)
    Bandwidth = 19,
    /// End-of-request handshake
    EndRequest = 20,
    /// Keep-alive probe
    KeepAlive = 21,
    /// Block/unblock new requests
    BlockRequest = 22,
    /// Business hook request
    BusinessRequest = 23,
    /// No-op filler
    NoOp = 24,
    /// JSON-encoded administrative command
    JsonCommand = 25,
}

impl PacketType {
    /// Parse a type tag from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Authent),
            2 => Some(Self::Startup),
            3 => Some(Self::Data),
            4 => Some(Self::Valid),
            5 => Some(Self::Error),
            6 => Some(Self::ConnectionError),
            7 => Some(Self::Request),
            8 => Some(Self::Shutdown),
            9 => Some(Self::Stop),
            10 => Some(Self::Cancel),
            11 => Some(Self::ConfExport),
            12 => Some(Self::ConfImport),
            13 => Some(Self::Test),
            14 => Some(Self::EndTransfer),
            15 => Some(Self::RequestUser),
            16 => Some(Self::Log),
            17 => Some(Self::LogPurge),
            18 => Some(Self::Information),
            19 => Some(Self::Bandwidth),
            20 => Some(Self::EndRequest),
            21 => Some(Self::KeepAlive),
            22 => Some(Self::BlockRequest),
            23 => Some(Self::BusinessRequest),
            24 => Some(Self::NoOp),
            25 => Some(Self::JsonCommand),
            _ => None,
        }
    }

    /// Tags that only travel inside a Valid or JsonCommand envelope; a raw
    /// frame with one of these is rejected.
    #[must_use]
    pub const fn is_envelope_only(self) -> bool {
        matches!(
            self,
            Self::Stop
                | Self::Cancel
                | Self::ConfExport
                | Self::ConfImport
                | Self::RequestUser
                | Self::Log
                | Self::LogPurge
                | Self::Bandwidth
        )
    }
}

/// Direction of a validate/answer handshake packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Way {
    /// Sent by the initiator
    Ask = 0,
    /// Sent by the responder
    Answer = 1,
}

impl Way {
    /// Parse a way byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Ask),
            1 => Some(Self::Answer),
            _ => None,
        }
    }
}

/// What the receiver of an Error packet should do with the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorAction {
    /// Log and continue
    Ignore = 0,
    /// Close the channel
    Close = 1,
    /// Forward to the session for handling
    Forward = 2,
    /// Forward, then close
    ForwardAndClose = 3,
}

impl ErrorAction {
    /// Parse a wire action code.
    #[must_use]
    pub const fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Ignore),
            1 => Some(Self::Close),
            2 => Some(Self::Forward),
            3 => Some(Self::ForwardAndClose),
            _ => None,
        }
    }
}

/// Authentication handshake packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthentPacket {
    /// Identity of the sending host
    pub host_id: String,
    /// Shared-secret proof
    pub key: Vec<u8>,
    /// Local channel id of the sender
    pub local_id: i32,
    /// Ask or answer
    pub way: Way,
    /// Software version string of the sender
    pub version: String,
}

/// Local channel startup packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPacket {
    /// Local channel id chosen by the opener
    pub local_id: i32,
}

/// One file block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// Block index
    pub rank: u32,
    /// Block payload
    pub data: Vec<u8>,
    /// Content key over the payload; empty means "no check requested"
    pub key: Vec<u8>,
}

impl DataPacket {
    /// Build a block with its content key computed over the payload.
    #[must_use]
    pub fn with_key(rank: u32, data: Vec<u8>) -> Self {
        let key = content_key(&data);
        Self { rank, data, key }
    }

    /// Build a block without a content key.
    #[must_use]
    pub const fn without_key(rank: u32, data: Vec<u8>) -> Self {
        Self {
            rank,
            data,
            key: Vec::new(),
        }
    }

    /// Recompute the content key over the payload and compare. An empty key
    /// means no check was requested and is always valid.
    #[must_use]
    pub fn is_key_valid(&self) -> bool {
        if self.key.is_empty() {
            return true;
        }
        self.key == content_key(&self.data)
    }
}

/// Content key over a block payload (xxh64, 8 bytes big-endian).
#[must_use]
pub fn content_key(data: &[u8]) -> Vec<u8> {
    xxh64(data, 0).to_be_bytes().to_vec()
}

/// Administrative validation envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidPacket {
    /// Primary payload
    pub info: String,
    /// Secondary payload
    pub extra: String,
    /// Tag of the packet type this envelope answers or carries
    pub of_type: u8,
}

/// Transfer-level error report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    /// Error message
    pub message: String,
    /// Error detail
    pub detail: String,
    /// What the receiver should do with the channel
    pub action: ErrorAction,
}

/// Connection-level error report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionErrorPacket {
    /// Error message
    pub message: String,
    /// Error detail
    pub detail: String,
}

/// Transfer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPacket {
    /// Rule id (must not contain spaces)
    pub rule: String,
    /// Transfer mode
    pub mode: TransferMode,
    /// File to transfer
    pub filename: String,
    /// Block size in bytes
    pub block_size: u32,
    /// Resume point: first block index to transfer
    pub rank: u32,
    /// Transfer instance id, or [`crate::record::ILLEGAL_SPECIAL_ID`]
    pub special_id: i64,
    /// Ask or answer
    pub way: Way,
    /// Step code char of the sender
    pub code: char,
    /// Original file size, -1 when unknown
    pub original_size: i64,
    /// Free-form file information
    pub file_information: String,
}

/// Remote shutdown request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownPacket {
    /// Administrative key
    pub key: Vec<u8>,
}

/// Ping-pong test packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPacket {
    /// Primary payload
    pub info: String,
    /// Secondary payload
    pub extra: String,
    /// Round counter, incremented at each bounce
    pub counter: i32,
}

impl TestPacket {
    /// Bounce: increment the round counter.
    pub fn update(&mut self) {
        self.counter += 1;
    }

    /// Whether the ping-pong exchange should stop.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.counter > TEST_PING_PONG_LIMIT
    }
}

/// End-of-transfer handshake packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndTransferPacket {
    /// Tag of the request packet type this end refers to
    pub request: u8,
    /// Ask or answer
    pub way: Way,
    /// Optional whole-file digest (hex)
    pub digest: Option<String>,
}

/// Information query about a rule or file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformationPacket {
    /// Kind of information requested
    pub request: u8,
    /// Rule id the query refers to
    pub rule: String,
    /// File the query refers to
    pub filename: String,
}

/// End-of-request handshake packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndRequestPacket {
    /// Final step code, as its wire character
    pub code: u32,
    /// Ask or answer
    pub way: Way,
    /// Optional detail
    pub optional: Option<String>,
}

/// Keep-alive probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAlivePacket {
    /// Ask or answer
    pub way: Way,
}

/// Block or unblock acceptance of new requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequestPacket {
    /// True to block new requests, false to unblock
    pub block: bool,
    /// Administrative key
    pub key: Vec<u8>,
}

/// Business hook request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessRequestPacket {
    /// Hook payload
    pub payload: String,
    /// Requested execution delay in milliseconds
    pub delay: i32,
    /// Ask or answer
    pub way: Way,
}

/// JSON-encoded administrative command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonCommandPacket {
    /// JSON request body
    pub request: String,
    /// JSON result body
    pub result: String,
    /// Tag of the command this packet carries
    pub of_type: u8,
}

/// The closed set of local-channel packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Authentication handshake
    Authent(AuthentPacket),
    /// Local channel startup
    Startup(StartupPacket),
    /// One file block
    Data(DataPacket),
    /// Administrative validation envelope
    Valid(ValidPacket),
    /// Transfer-level error
    Error(ErrorPacket),
    /// Connection-level error
    ConnectionError(ConnectionErrorPacket),
    /// Transfer request
    Request(RequestPacket),
    /// Remote shutdown request
    Shutdown(ShutdownPacket),
    /// Ping-pong test
    Test(TestPacket),
    /// End-of-transfer handshake
    EndTransfer(EndTransferPacket),
    /// Information query
    Information(InformationPacket),
    /// End-of-request handshake
    EndRequest(EndRequestPacket),
    /// Keep-alive probe
    KeepAlive(KeepAlivePacket),
    /// Block/unblock new requests
    BlockRequest(BlockRequestPacket),
    /// Business hook request
    BusinessRequest(BusinessRequestPacket),
    /// No-op filler
    NoOp,
    /// JSON administrative command
    JsonCommand(JsonCommandPacket),
}

impl Packet {
    /// The wire type tag of this packet.
    #[must_use]
    pub const fn tag(&self) -> PacketType {
        match self {
            Self::Authent(_) => PacketType::Authent,
            Self::Startup(_) => PacketType::Startup,
            Self::Data(_) => PacketType::Data,
            Self::Valid(_) => PacketType::Valid,
            Self::Error(_) => PacketType::Error,
            Self::ConnectionError(_) => PacketType::ConnectionError,
            Self::Request(_) => PacketType::Request,
            Self::Shutdown(_) => PacketType::Shutdown,
            Self::Test(_) => PacketType::Test,
            Self::EndTransfer(_) => PacketType::EndTransfer,
            Self::Information(_) => PacketType::Information,
            Self::EndRequest(_) => PacketType::EndRequest,
            Self::KeepAlive(_) => PacketType::KeepAlive,
            Self::BlockRequest(_) => PacketType::BlockRequest,
            Self::BusinessRequest(_) => PacketType::BusinessRequest,
            Self::NoOp => PacketType::NoOp,
            Self::JsonCommand(_) => PacketType::JsonCommand,
        }
    }

    /// Decompose into the three wire regions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PacketBuild`] when a required field is unset.
    pub fn to_regions(&self) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        match self {
            Self::Authent(p) => {
                if p.host_id.is_empty() {
                    return Err(Error::PacketBuild("authent packet without host id".into()));
                }
                if p.key.is_empty() {
                    return Err(Error::PacketBuild("authent packet without key".into()));
                }
                let mut end = Vec::with_capacity(5 + p.version.len());
                end.extend_from_slice(&p.local_id.to_be_bytes());
                end.push(p.way as u8);
                end.extend_from_slice(p.version.as_bytes());
                Ok((p.host_id.clone().into_bytes(), p.key.clone(), end))
            }
            Self::Startup(p) => Ok((p.local_id.to_be_bytes().to_vec(), Vec::new(), Vec::new())),
            Self::Data(p) => {
                if p.data.is_empty() {
                    return Err(Error::PacketBuild("data packet without payload".into()));
                }
                Ok((p.rank.to_be_bytes().to_vec(), p.data.clone(), p.key.clone()))
            }
            Self::Valid(p) => Ok((
                p.info.clone().into_bytes(),
                p.extra.clone().into_bytes(),
                vec![p.of_type],
            )),
            Self::Error(p) => Ok((
                p.message.clone().into_bytes(),
                p.detail.clone().into_bytes(),
                (p.action as i32).to_be_bytes().to_vec(),
            )),
            Self::ConnectionError(p) => Ok((
                p.message.clone().into_bytes(),
                p.detail.clone().into_bytes(),
                Vec::new(),
            )),
            Self::Request(p) => {
                if p.rule.is_empty() || p.rule.contains(' ') {
                    return Err(Error::PacketBuild(format!(
                        "request packet with unusable rule id '{}'",
                        p.rule
                    )));
                }
                if p.filename.is_empty() {
                    return Err(Error::PacketBuild("request packet without filename".into()));
                }
                if p.mode == TransferMode::Unknown {
                    return Err(Error::PacketBuild("request packet without mode".into()));
                }
                let header = format!("{} {}", p.rule, p.mode.as_wire()).into_bytes();
                let sep = FIELD_SEPARATOR;
                let mut middle = vec![p.way as u8];
                middle.extend_from_slice(
                    format!(
                        "{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}",
                        p.filename, p.block_size, p.rank, p.special_id, p.code, p.original_size
                    )
                    .as_bytes(),
                );
                Ok((header, middle, p.file_information.clone().into_bytes()))
            }
            Self::Shutdown(p) => {
                if p.key.is_empty() {
                    return Err(Error::PacketBuild("shutdown packet without key".into()));
                }
                Ok((p.key.clone(), Vec::new(), Vec::new()))
            }
            Self::Test(p) => Ok((
                p.info.clone().into_bytes(),
                p.extra.clone().into_bytes(),
                p.counter.to_be_bytes().to_vec(),
            )),
            Self::EndTransfer(p) => {
                let end = p
                    .digest
                    .as_ref()
                    .map_or_else(Vec::new, |d| d.clone().into_bytes());
                Ok((vec![p.request], vec![p.way as u8], end))
            }
            Self::Information(p) => {
                if p.rule.is_empty() {
                    return Err(Error::PacketBuild("information packet without rule".into()));
                }
                Ok((
                    p.rule.clone().into_bytes(),
                    vec![p.request],
                    p.filename.clone().into_bytes(),
                ))
            }
            Self::EndRequest(p) => {
                let end = p
                    .optional
                    .as_ref()
                    .map_or_else(Vec::new, |o| o.clone().into_bytes());
                Ok((p.code.to_be_bytes().to_vec(), vec![p.way as u8], end))
            }
            Self::KeepAlive(p) => Ok((Vec::new(), vec![p.way as u8], Vec::new())),
            Self::BlockRequest(p) => {
                if p.key.is_empty() {
                    return Err(Error::PacketBuild("block request without key".into()));
                }
                let mut header = Vec::with_capacity(1 + p.key.len());
                header.push(u8::from(p.block));
                header.extend_from_slice(&p.key);
                Ok((header, Vec::new(), Vec::new()))
            }
            Self::BusinessRequest(p) => Ok((
                p.payload.clone().into_bytes(),
                p.delay.to_be_bytes().to_vec(),
                vec![p.way as u8],
            )),
            Self::NoOp => Ok((Vec::new(), Vec::new(), Vec::new())),
            Self::JsonCommand(p) => Ok((
                p.request.clone().into_bytes(),
                p.result.clone().into_bytes(),
                vec![p.of_type],
            )),
        }
    }

    /// Reassemble a packet from its tag and wire regions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Framing`] on region layouts that do not match the
    /// variant, and for tags that only travel inside envelopes.
    #[allow(clippy::too_many_lines)]
    pub fn from_regions(
        tag: PacketType,
        header: &[u8],
        middle: &[u8],
        end: &[u8],
    ) -> Result<Self> {
        match tag {
            PacketType::Authent => {
                if header.is_empty() || middle.is_empty() || end.len() < 5 {
                    return Err(short_regions("authent"));
                }
                let local_id = i32::from_be_bytes(end[0..4].try_into().expect("4 bytes"));
                let way = parse_way(end[4])?;
                Ok(Self::Authent(AuthentPacket {
                    host_id: utf8(header)?,
                    key: middle.to_vec(),
                    local_id,
                    way,
                    version: utf8(&end[5..])?,
                }))
            }
            PacketType::Startup => {
                if header.len() != 4 {
                    return Err(short_regions("startup"));
                }
                Ok(Self::Startup(StartupPacket {
                    local_id: i32::from_be_bytes(header.try_into().expect("4 bytes")),
                }))
            }
            PacketType::Data => {
                if header.len() != 4 || middle.is_empty() {
                    return Err(short_regions("data"));
                }
                Ok(Self::Data(DataPacket {
                    rank: u32::from_be_bytes(header.try_into().expect("4 bytes")),
                    data: middle.to_vec(),
                    key: end.to_vec(),
                }))
            }
            PacketType::Valid => {
                let [of_type] = end else {
                    return Err(short_regions("valid"));
                };
                Ok(Self::Valid(ValidPacket {
                    info: utf8(header)?,
                    extra: utf8(middle)?,
                    of_type: *of_type,
                }))
            }
            PacketType::Error => {
                if end.len() != 4 {
                    return Err(short_regions("error"));
                }
                let code = i32::from_be_bytes(end.try_into().expect("4 bytes"));
                let action = ErrorAction::from_wire(code)
                    .ok_or_else(|| Error::Framing(format!("unknown error action {code}")))?;
                Ok(Self::Error(ErrorPacket {
                    message: utf8(header)?,
                    detail: utf8(middle)?,
                    action,
                }))
            }
            PacketType::ConnectionError => Ok(Self::ConnectionError(ConnectionErrorPacket {
                message: utf8(header)?,
                detail: utf8(middle)?,
            })),
            PacketType::Request => decode_request(header, middle, end),
            PacketType::Shutdown => {
                if header.is_empty() {
                    return Err(short_regions("shutdown"));
                }
                Ok(Self::Shutdown(ShutdownPacket {
                    key: header.to_vec(),
                }))
            }
            PacketType::Test => {
                if end.len() != 4 {
                    return Err(short_regions("test"));
                }
                Ok(Self::Test(TestPacket {
                    info: utf8(header)?,
                    extra: utf8(middle)?,
                    counter: i32::from_be_bytes(end.try_into().expect("4 bytes")),
                }))
            }
            PacketType::EndTransfer => {
                let ([request], [way]) = (header, middle) else {
                    return Err(short_regions("end transfer"));
                };
                Ok(Self::EndTransfer(EndTransferPacket {
                    request: *request,
                    way: parse_way(*way)?,
                    digest: if end.is_empty() {
                        None
                    } else {
                        Some(utf8(end)?)
                    },
                }))
            }
            PacketType::Information => {
                let [request] = middle else {
                    return Err(short_regions("information"));
                };
                if header.is_empty() {
                    return Err(short_regions("information"));
                }
                Ok(Self::Information(InformationPacket {
                    request: *request,
                    rule: utf8(header)?,
                    filename: utf8(end)?,
                }))
            }
            PacketType::EndRequest => {
                let [way] = middle else {
                    return Err(short_regions("end request"));
                };
                if header.len() != 4 {
                    return Err(short_regions("end request"));
                }
                Ok(Self::EndRequest(EndRequestPacket {
                    code: u32::from_be_bytes(header.try_into().expect("4 bytes")),
                    way: parse_way(*way)?,
                    optional: if end.is_empty() {
                        None
                    } else {
                        Some(utf8(end)?)
                    },
                }))
            }
            PacketType::KeepAlive => {
                let [way] = middle else {
                    return Err(short_regions("keep alive"));
                };
                Ok(Self::KeepAlive(KeepAlivePacket {
                    way: parse_way(*way)?,
                }))
            }
            PacketType::BlockRequest => {
                if header.len() < 2 {
                    return Err(short_regions("block request"));
                }
                Ok(Self::BlockRequest(BlockRequestPacket {
                    block: header[0] == 1,
                    key: header[1..].to_vec(),
                }))
            }
            PacketType::BusinessRequest => {
                let [way] = end else {
                    return Err(short_regions("business request"));
                };
                if middle.len() != 4 {
                    return Err(short_regions("business request"));
                }
                Ok(Self::BusinessRequest(BusinessRequestPacket {
                    payload: utf8(header)?,
                    delay: i32::from_be_bytes(middle.try_into().expect("4 bytes")),
                    way: parse_way(*way)?,
                }))
            }
            PacketType::NoOp => Ok(Self::NoOp),
            PacketType::JsonCommand => {
                let [of_type] = end else {
                    return Err(short_regions("json command"));
                };
                Ok(Self::JsonCommand(JsonCommandPacket {
                    request: utf8(header)?,
                    result: utf8(middle)?,
                    of_type: *of_type,
                }))
            }
            other if other.is_envelope_only() => Err(Error::Framing(format!(
                "unimplemented packet type received: {}",
                other as u8
            ))),
            other => Err(Error::Framing(format!(
                "invalid packet type received: {}",
                other as u8
            ))),
        }
    }
}

fn decode_request(header: &[u8], middle: &[u8], end: &[u8]) -> Result<Packet> {
    if header.is_empty() || middle.len() < 2 {
        return Err(short_regions("request"));
    }
    let sheader = utf8(header)?;
    let (rule, mode_text) = sheader
        .split_once(' ')
        .ok_or_else(|| short_regions("request"))?;
    let mode_value: i32 = mode_text
        .parse()
        .map_err(|_| Error::Framing(format!("unparsable request mode '{mode_text}'")))?;
    let mode = TransferMode::from_wire(mode_value)
        .ok_or_else(|| Error::Framing(format!("unknown request mode {mode_value}")))?;

    let way = parse_way(middle[0])?;
    let smiddle = utf8(&middle[1..])?;
    let fields: Vec<&str> = smiddle.split(FIELD_SEPARATOR).collect();
    if fields.len() < 6 {
        return Err(short_regions("request"));
    }
    let block_size = fields[1]
        .parse()
        .map_err(|_| Error::Framing(format!("unparsable block size '{}'", fields[1])))?;
    let rank = fields[2]
        .parse()
        .map_err(|_| Error::Framing(format!("unparsable rank '{}'", fields[2])))?;
    let special_id = fields[3]
        .parse()
        .map_err(|_| Error::Framing(format!("unparsable special id '{}'", fields[3])))?;
    let code = fields[4]
        .chars()
        .next()
        .ok_or_else(|| short_regions("request"))?;
    let original_size = fields[5]
        .parse()
        .map_err(|_| Error::Framing(format!("unparsable original size '{}'", fields[5])))?;

    Ok(Packet::Request(RequestPacket {
        rule: rule.to_string(),
        mode,
        filename: fields[0].to_string(),
        block_size,
        rank,
        special_id,
        way,
        code,
        original_size,
        file_information: utf8(end)?,
    }))
}

fn parse_way(byte: u8) -> Result<Way> {
    Way::from_byte(byte).ok_or_else(|| Error::Framing(format!("invalid way byte {byte}")))
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Framing("non-utf8 text region".to_string()))
}

fn short_regions(kind: &str) -> Error {
    Error::Framing(format!("not enough data for {kind} packet"))
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authent(p) => write!(
                f,
                "Authent: {} {} {:?} {}",
                p.host_id, p.local_id, p.way, p.version
            ),
            Self::Startup(p) => write!(f, "Startup: {}", p.local_id),
            Self::Data(p) => write!(f, "Data: {}:{}", p.rank, p.data.len()),
            Self::Valid(p) => write!(f, "Valid: {}:{}:{}", p.info, p.extra, p.of_type),
            Self::Error(p) => write!(f, "Error:({:?}:{}) {}", p.action, p.detail, p.message),
            Self::ConnectionError(p) => {
                write!(f, "ConnectionError: {}:{}", p.message, p.detail)
            }
            Self::Request(p) => write!(
                f,
                "Request: {} : {} : {} : {} : {} : {:?} : {} : {}",
                p.rule,
                p.mode.as_wire(),
                p.filename,
                p.block_size,
                p.rank,
                p.way,
                p.code,
                p.original_size
            ),
            Self::Shutdown(_) => write!(f, "Shutdown"),
            Self::Test(p) => write!(f, "Test: {}:{}:{}", p.info, p.extra, p.counter),
            Self::EndTransfer(p) => match &p.digest {
                Some(d) => write!(f, "EndTransfer: {} {:?} {d}", p.request, p.way),
                None => write!(f, "EndTransfer: {} {:?}", p.request, p.way),
            },
            Self::Information(p) => {
                write!(f, "Information: {} {} {}", p.request, p.rule, p.filename)
            }
            Self::EndRequest(p) => match &p.optional {
                Some(o) => write!(f, "EndRequest: {} {:?} {o}", p.code, p.way),
                None => write!(f, "EndRequest: {} {:?}", p.code, p.way),
            },
            Self::KeepAlive(p) => write!(f, "KeepAlive: {:?}", p.way),
            Self::BlockRequest(p) => write!(f, "BlockRequest: {}", p.block),
            Self::BusinessRequest(p) => {
                write!(f, "BusinessRequest: {}:{}:{:?}", p.payload, p.delay, p.way)
            }
            Self::NoOp => write!(f, "NoOp"),
            Self::JsonCommand(p) => {
                write!(f, "JsonCommand: {}:{}:{}", p.request, p.result, p.of_type)
            }
        }
    }
}
