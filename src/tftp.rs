use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Fixed transfer block size mandated by RFC 1350.
pub const BLOCK_SIZE: usize = 512;

/// Largest datagram the protocol produces: opcode + block number + one block.
pub const MAX_PACKET_LEN: usize = 2 + 2 + BLOCK_SIZE;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// The ways a datagram can fail to decode into a packet.
#[derive(Debug, PartialEq)]
pub enum PacketError {
    /// Shorter than the 4-byte minimum mandated by RFC 1350.
    ShortBuffer,
    /// The opcode is known but the remainder of the packet is invalid.
    Malformed(&'static str),
    /// The opcode is not one of the five defined by the RFC.
    Unsupported(u16),
}

impl error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::ShortBuffer => write!(f, "packet shorter than the RFC minimum"),
            PacketError::Malformed(what) => write!(f, "malformed packet: {what}"),
            PacketError::Unsupported(op) => write!(f, "unsupported opcode: {op}"),
        }
    }
}

/// Represents an error returned from the TFTP socket handler.
#[derive(Debug)]
pub enum SocketError {
    Io(io::Error),
    Packet(PacketError),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::Io(e) => write!(f, "socket IO error: {e}"),
            SocketError::Packet(e) => write!(f, "{e}"),
            SocketError::Timeout(e) => write!(f, "socket IO timeout: {e}"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::Io(e)
    }
}

impl From<PacketError> for SocketError {
    fn from(e: PacketError) -> Self {
        SocketError::Packet(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// The five operation codes defined by the RFC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
}

impl OpCode {
    fn from_u16(raw: u16) -> Result<OpCode, PacketError> {
        match raw {
            1 => Ok(OpCode::Rrq),
            2 => Ok(OpCode::Wrq),
            3 => Ok(OpCode::Data),
            4 => Ok(OpCode::Ack),
            5 => Ok(OpCode::Error),
            _ => Err(PacketError::Unsupported(raw)),
        }
    }

    fn as_u16(self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

/// Represents a TFTP error code surfaced by a TFTP error packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOp,
    UnknownTid,
    FileExists,
    NoSuchUser,
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOp,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl ErrorCode {
    fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOp => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The transfer mode, carried verbatim; only `octet` is honored.
        mode: String,
    },

    /// A write request packet
    WriteReq { path: String, mode: String },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself, at most one block.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Extracts a NUL terminated string from the beginning of the buffer.
/// Returns the string and the position of the NUL byte, or None when the
/// terminator is missing. Wire strings are raw octets, so every byte maps to
/// one char and nothing is rejected.
fn string_from_buffer(buf: &[u8]) -> Option<(String, usize)> {
    let end = buf.iter().position(|&c| c == 0x00)?;
    let s = buf[..end].iter().map(|&c| char::from(c)).collect();
    Some((s, end))
}

/// Inverse of `string_from_buffer`: one byte per char plus the terminator.
fn string_to_buffer(s: &str, out: &mut Vec<u8>) {
    out.extend(s.chars().map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' }));
    out.push(0x00);
}

fn parse_path_and_mode(buf: &[u8]) -> Result<(String, String), PacketError> {
    let (path, path_end) = string_from_buffer(buf)
        .ok_or(PacketError::Malformed("request filename is not NUL terminated"))?;
    let (mode, _) = string_from_buffer(&buf[path_end + 1..])
        .ok_or(PacketError::Malformed("request mode is not NUL terminated"))?;
    Ok((path, mode))
}

fn parse_data(buf: &[u8]) -> Result<Packet, PacketError> {
    let data = &buf[4..];
    if data.len() > BLOCK_SIZE {
        return Err(PacketError::Malformed("data payload exceeds one block"));
    }
    Ok(Packet::Data { block: u16_from_buffer(&buf[2..4]), data: data.to_vec() })
}

fn parse_error(buf: &[u8]) -> Result<Packet, PacketError> {
    let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
    let (message, _) = string_from_buffer(&buf[4..])
        .ok_or(PacketError::Malformed("error message is not NUL terminated"))?;
    Ok(Packet::Error { code, message })
}

fn encode_request(opcode: OpCode, path: &str, mode: &str) -> Vec<u8> {
    let mut b = Vec::with_capacity(2 + path.len() + 1 + mode.len() + 1);
    b.extend_from_slice(&opcode.as_u16().to_be_bytes());
    string_to_buffer(path, &mut b);
    string_to_buffer(mode, &mut b);
    b
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < 4 {
            return Err(PacketError::ShortBuffer);
        }

        match OpCode::from_u16(u16_from_buffer(&buf[..2]))? {
            OpCode::Rrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode })
            }
            OpCode::Wrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode })
            }
            OpCode::Data => parse_data(buf),
            // trailing bytes after the block number are ignored
            OpCode::Ack => Ok(Packet::Ack { block: u16_from_buffer(&buf[2..4]) }),
            OpCode::Error => parse_error(buf),
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Encode the packet into its RFC 1350 wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::ReadReq { path, mode } => encode_request(OpCode::Rrq, path, mode),
            Packet::WriteReq { path, mode } => encode_request(OpCode::Wrq, path, mode),
            Packet::Data { block, data } => {
                let mut b = Vec::with_capacity(2 + 2 + data.len());
                b.extend_from_slice(&OpCode::Data.as_u16().to_be_bytes());
                b.extend_from_slice(&block.to_be_bytes());
                b.extend_from_slice(data);
                b
            }
            Packet::Ack { block } => {
                let mut b = Vec::with_capacity(2 + 2);
                b.extend_from_slice(&OpCode::Ack.as_u16().to_be_bytes());
                b.extend_from_slice(&block.to_be_bytes());
                b
            }
            Packet::Error { code, message } => {
                let mut b = Vec::with_capacity(2 + 2 + message.len() + 1);
                b.extend_from_slice(&OpCode::Error.as_u16().to_be_bytes());
                b.extend_from_slice(&code.as_u16().to_be_bytes());
                string_to_buffer(message, &mut b);
                b
            }
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that sends and receives TFTP
/// datagrams.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn recv_from(&self) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = [0; MAX_PACKET_LEN];
        let (n, src) = self.sock.recv_from(&mut buf).await?;
        Ok((buf[..n].to_vec(), src))
    }

    pub async fn recv_from_with_timeout(&self, ttl: Duration) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = [0; MAX_PACKET_LEN];
        let (n, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;
        Ok((buf[..n].to_vec(), src))
    }

    pub async fn send_raw(&self, buf: &[u8], dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(buf, dst).await?;
        Ok(())
    }

    pub async fn send(&self, pkt: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.send_raw(&pkt.to_bytes(), dst).await
    }
}
