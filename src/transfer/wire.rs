//! Transfer-protocol message types and bodies.
//!
//! These ride on ordinary bus channels; the numeric values are the wire
//! contract and never change meaning. All multi-byte integers are
//! big-endian. File sizes and offsets travel as (high u32, low u32) pairs.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Local protocol version. Version 2 added DUPLICATE_FILE / REJECT_FILE;
/// a version-1 peer is told about problems by disconnecting instead.
pub const PROTOCOL_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    SenderVersion = 0,
    ReceiverVersion = 1,
    Ident = 2,
    Ready = 3,
    DisconnectRetry = 4,
    Disconnect = 5,
    NewFile = 6,
    NewFileReady = 7,
    FileBlock = 8,
    FileComplete = 9,
    DuplicateFile = 10,
    RejectFile = 11,
}

impl MsgType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::SenderVersion),
            1 => Some(Self::ReceiverVersion),
            2 => Some(Self::Ident),
            3 => Some(Self::Ready),
            4 => Some(Self::DisconnectRetry),
            5 => Some(Self::Disconnect),
            6 => Some(Self::NewFile),
            7 => Some(Self::NewFileReady),
            8 => Some(Self::FileBlock),
            9 => Some(Self::FileComplete),
            10 => Some(Self::DuplicateFile),
            11 => Some(Self::RejectFile),
            _ => None,
        }
    }
}

fn split_u64(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

fn join_u64(high: u32, low: u32) -> u64 {
    (u64::from(high) << 32) | u64::from(low)
}

pub fn encode_version(version: u32) -> Bytes {
    Bytes::copy_from_slice(&version.to_be_bytes())
}

pub fn decode_version(mut payload: Bytes) -> Result<u32> {
    if payload.remaining() < 4 {
        return Err(Error::protocol("version body too short"));
    }
    Ok(payload.get_u32())
}

// =============================================================================
// NEW_FILE (6)
// =============================================================================

/// `{high_size:u32, low_size:u32, block_size:u32, mode:u32, name:cstr}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub size: u64,
    pub block_size: u32,
    pub mode: u32,
    pub name: String,
}

impl NewFile {
    pub fn encode(&self) -> Bytes {
        let name_bytes = self.name.as_bytes();
        let mut buf = BytesMut::with_capacity(16 + name_bytes.len() + 1);
        let (high, low) = split_u64(self.size);
        buf.put_u32(high);
        buf.put_u32(low);
        buf.put_u32(self.block_size);
        buf.put_u32(self.mode & 0o777);
        buf.put_slice(name_bytes);
        buf.put_u8(0);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 17 {
            return Err(Error::protocol("NEW_FILE body too short"));
        }
        let high = payload.get_u32();
        let low = payload.get_u32();
        let block_size = payload.get_u32();
        let mode = payload.get_u32();

        // The filename must be NUL-terminated within the declared length.
        let nul = payload
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::protocol("NEW_FILE name is not NUL-terminated"))?;
        let name = String::from_utf8(payload.split_to(nul).to_vec())
            .map_err(|_| Error::protocol("NEW_FILE name is not valid UTF-8"))?;
        if name.is_empty() {
            return Err(Error::protocol("NEW_FILE name is empty"));
        }

        Ok(Self {
            size: join_u64(high, low),
            block_size,
            mode,
            name,
        })
    }
}

// =============================================================================
// FILE_BLOCK (8)
// =============================================================================

/// The 8-byte `{high_offset, low_offset}` prefix of a FILE_BLOCK body; the
/// payload bytes follow as a second scatter segment.
pub fn encode_block_offset(offset: u64) -> Bytes {
    let (high, low) = split_u64(offset);
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32(high);
    buf.put_u32(low);
    buf.freeze()
}

pub fn decode_block(mut payload: Bytes) -> Result<(u64, Bytes)> {
    if payload.remaining() < 8 {
        return Err(Error::protocol("FILE_BLOCK body too short"));
    }
    let high = payload.get_u32();
    let low = payload.get_u32();
    Ok((join_u64(high, low), payload))
}

// =============================================================================
// IDENT (2)
// =============================================================================

pub fn encode_ident(ident: &str) -> Bytes {
    Bytes::copy_from_slice(ident.as_bytes())
}

pub fn decode_ident(payload: Bytes) -> Result<String> {
    let ident = String::from_utf8(payload.to_vec())
        .map_err(|_| Error::protocol("peer identity is not valid UTF-8"))?;
    if ident.is_empty() {
        return Err(Error::protocol("peer identity is empty"));
    }
    Ok(ident)
}
