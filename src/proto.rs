//! Wire format of the discovery protocol.
//!
//! Every packet starts with a fixed 22 byte header: a 4 byte magic value, a
//! 1 byte protocol version, a 1 byte packet type and the 16 byte request
//! token. A request is a bare header. A response appends the 16 byte response
//! token, the observed public port and the observed public address bytes
//! (4 for ipv4, 16 for ipv6). A confirmation appends only the response token.
//!
//! The port and address bytes of a response are stored bit-inverted, so
//! middleboxes that rewrite literal address patterns inside payloads do not
//! find anything to rewrite. This is not secrecy, inverting twice restores
//! the original bytes.

use std::net::IpAddr;
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"SPAD";
pub const VERSION: u8 = 1;
pub const TOKEN_SIZE: usize = 16;

/// magic(4) | version(1) | type(1) | request token(16)
pub const HEADER_SIZE: usize = 4 + 1 + 1 + TOKEN_SIZE;
/// Fixed portion of a response, the address bytes trail it.
pub const RESPONSE_SIZE: usize = HEADER_SIZE + TOKEN_SIZE + 2;
pub const CONFIRMATION_SIZE: usize = HEADER_SIZE + TOKEN_SIZE;

pub type Token = [u8; TOKEN_SIZE];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("{0} byte packet is too short to carry a header ({HEADER_SIZE} bytes)")]
    TooShort(usize),
    #[error("{0} byte packet is too short to be a response ({RESPONSE_SIZE} bytes)")]
    ResponseTooShort(usize),
    #[error("{0} byte packet is too short to be a confirmation ({CONFIRMATION_SIZE} bytes)")]
    ConfirmationTooShort(usize),
    #[error("magic value does not match")]
    BadMagic,
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("{0} byte address is neither ipv4 nor ipv6")]
    BadAddressLength(usize),
    #[error("request token does not match")]
    TokenMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 1,
    Confirmation = 2,
}

impl TryFrom<u8> for PacketType {
    type Error = FormatError;

    fn try_from(value: u8) -> Result<Self, FormatError> {
        match value {
            0 => Ok(PacketType::Request),
            1 => Ok(PacketType::Response),
            2 => Ok(PacketType::Confirmation),
            other => Err(FormatError::UnknownPacketType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub packet_type: PacketType,
    pub request_token: Token,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: Header,
    pub response_token: Token,
    pub public_port: u16,
    pub public_addr: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub header: Header,
    pub response_token: Token,
}

/// One's complement, in place. Its own inverse.
pub fn invert(data: &mut [u8]) {
    for b in data.iter_mut() {
        *b = !*b;
    }
}

pub fn encode_header(packet_type: PacketType, request_token: &Token) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
    buf.push(packet_type as u8);
    buf.extend_from_slice(request_token);
    buf
}

/// Length and magic check out but the version is not the one we speak.
/// Such packets are ignored without decoding further, whatever the rest of
/// the header holds.
pub fn is_unsupported_version(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE && data[..4] == MAGIC && data[4] != VERSION
}

/// Magic and packet type are validated here. The version is only carried
/// through, an unsupported version is the caller's no-op, not an error.
pub fn decode_header(data: &[u8]) -> Result<Header, FormatError> {
    if data.len() < HEADER_SIZE {
        return Err(FormatError::TooShort(data.len()));
    }
    if data[..4] != MAGIC {
        return Err(FormatError::BadMagic);
    }
    let packet_type = PacketType::try_from(data[5])?;

    let mut request_token = Token::default();
    request_token.copy_from_slice(&data[6..HEADER_SIZE]);

    Ok(Header {
        version: data[4],
        packet_type,
        request_token,
    })
}

pub fn encode_response(
    request_token: &Token,
    response_token: &Token,
    public_port: u16,
    public_addr: IpAddr,
) -> Vec<u8> {
    let mut addr = match public_addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    invert(&mut addr);

    let mut buf = encode_header(PacketType::Response, request_token);
    buf.reserve(TOKEN_SIZE + 2 + addr.len());
    buf.extend_from_slice(response_token);
    buf.extend_from_slice(&(!public_port).to_be_bytes());
    buf.extend_from_slice(&addr);
    buf
}

pub fn decode_response(data: &[u8]) -> Result<Response, FormatError> {
    if data.len() < RESPONSE_SIZE {
        return Err(FormatError::ResponseTooShort(data.len()));
    }
    let header = decode_header(data)?;

    let mut response_token = Token::default();
    response_token.copy_from_slice(&data[HEADER_SIZE..HEADER_SIZE + TOKEN_SIZE]);

    let public_port = !u16::from_be_bytes([data[RESPONSE_SIZE - 2], data[RESPONSE_SIZE - 1]]);

    let mut addr = data[RESPONSE_SIZE..].to_vec();
    invert(&mut addr);
    let public_addr = match addr.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&addr);
            IpAddr::from(octets)
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addr);
            IpAddr::from(octets)
        }
        n => return Err(FormatError::BadAddressLength(n)),
    };

    Ok(Response {
        header,
        response_token,
        public_port,
        public_addr,
    })
}

pub fn encode_confirmation(request_token: &Token, response_token: &Token) -> Vec<u8> {
    let mut buf = encode_header(PacketType::Confirmation, request_token);
    buf.extend_from_slice(response_token);
    buf
}

pub fn decode_confirmation(data: &[u8]) -> Result<Confirmation, FormatError> {
    if data.len() < CONFIRMATION_SIZE {
        return Err(FormatError::ConfirmationTooShort(data.len()));
    }
    let header = decode_header(data)?;

    let mut response_token = Token::default();
    response_token.copy_from_slice(&data[HEADER_SIZE..CONFIRMATION_SIZE]);

    Ok(Confirmation {
        header,
        response_token,
    })
}
