//! Wire framing: message codes, the variable-width header, sync pattern
//!
//! Header layout, big-endian multi-byte fields:
//!
//! ```text
//! [1B code][1B flags][1-3B length][0-3B id][1B checksum]
//! ```
//!
//! Flags byte: bit0 = expecting-reply, bit1 = is-reply, bits2-3 reserved
//! (must be zero), bits4-5 = length-field byte count, bits6-7 = id-field
//! byte count. The length field carries the total message length, header
//! included. Checksum = low byte of `flags + length + code + version`.
//!
//! Field widths are canonical: a header that over- or under-encodes a value
//! relative to the minimum width it needs is invalid. That keeps every
//! message a single byte sequence, which the sync machinery depends on.

use alloc::vec::Vec;

use crate::core::InvalidValue;

/// Bumped when the header layout or checksum recipe changes. Participates in
/// the checksum, so peers on different versions fail header validation and
/// fall into sync recovery instead of exchanging garbage.
pub const PROTOCOL_VERSION: u8 = 0x01;

pub const MIN_HEADER_LEN: usize = 4;
pub const MAX_HEADER_LEN: usize = 9;

/// The fixed four bytes of a zero-payload `KeepAlive` header. Peers emit
/// these to restore byte alignment.
pub const SYNC_PATTERN: [u8; MIN_HEADER_LEN] = [
    MsgCode::KeepAlive.into_u8(),
    FLAG_LEN_WIDTH_1,
    MIN_HEADER_LEN as u8,
    (FLAG_LEN_WIDTH_1 as u32
        + MIN_HEADER_LEN as u32
        + MsgCode::KeepAlive.into_u8() as u32
        + PROTOCOL_VERSION as u32) as u8,
];

pub const FLAG_EXPECTS_REPLY: u8 = 0x01;
pub const FLAG_IS_REPLY: u8 = 0x02;
const FLAG_RESERVED_MASK: u8 = 0x0c;
const FLAG_LEN_WIDTH_1: u8 = 0x10;

/// Wire message code
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MsgCode {
    /// Liveness and sync. A zero-payload `KeepAlive` header is the sync
    /// pattern.
    KeepAlive = 0x01,
    /// Session establishment exchange.
    Connect = 0x02,
    /// Protocol-level negotiation.
    Protocol = 0x03,
    AuthChallenge = 0x04,
    /// Session teardown request.
    Hangup = 0x05,
    /// Peer self-description.
    Describe = 0x06,
    /// Peer log relay.
    Log = 0x07,
    /// Application payload.
    Application = 0x08,
}

impl MsgCode {
    pub const fn try_from_u8(code: u8) -> Option<MsgCode> {
        match code {
            0x01 => Some(MsgCode::KeepAlive),
            0x02 => Some(MsgCode::Connect),
            0x03 => Some(MsgCode::Protocol),
            0x04 => Some(MsgCode::AuthChallenge),
            0x05 => Some(MsgCode::Hangup),
            0x06 => Some(MsgCode::Describe),
            0x07 => Some(MsgCode::Log),
            0x08 => Some(MsgCode::Application),
            _ => None,
        }
    }

    pub const fn into_u8(self) -> u8 {
        self as u8
    }
}

impl From<MsgCode> for u8 {
    fn from(value: MsgCode) -> Self {
        value.into_u8()
    }
}

impl TryFrom<u8> for MsgCode {
    type Error = InvalidValue;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::try_from_u8(value).ok_or(InvalidValue)
    }
}

/// Bytes needed to carry `value`, zero for zero. Caps at 4, which no valid
/// header field reaches.
const fn width_for(value: u32) -> usize {
    match value {
        0 => 0,
        0x1..=0xff => 1,
        0x100..=0xffff => 2,
        0x1_0000..=0xff_ffff => 3,
        _ => 4,
    }
}

/// Graded result of an incremental header parse
///
/// The grades let the caller distinguish "wait for more bytes" from "this is
/// garbage, force resync".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseOutcome {
    /// Fewer than the minimum header bytes available.
    NeedBytes,
    /// Field widths are known; the full header has not arrived yet.
    NeedHeaderBytes,
    /// Structurally broken: unrecognized code, reserved bits set,
    /// non-canonical field widths, or an impossible length.
    Invalid,
    /// Checksum mismatch. The sync-loss signal.
    BadChecksum,
    /// Valid header, but the declared message exceeds the MTU.
    TooBig,
    Header(MsgHeader),
}

/// Parsed wire header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MsgHeader {
    pub code: MsgCode,
    pub expects_reply: bool,
    pub is_reply: bool,
    /// Total message length, header included.
    pub msg_len: u32,
    /// Correlation id; zero when no reply is in play.
    pub msg_id: u32,
}

impl MsgHeader {
    /// Builds a header for `payload_len` bytes of payload. Fails when the
    /// message cannot be encoded (payload too large for a 3-byte length
    /// field, or an id wider than 3 bytes).
    pub fn for_payload(
        code: MsgCode,
        payload_len: usize,
        msg_id: u32,
        expects_reply: bool,
        is_reply: bool,
    ) -> Result<Self, InvalidValue> {
        let id_width = width_for(msg_id);
        if id_width > 3 {
            return Err(InvalidValue);
        }

        for len_width in 1..=3usize {
            let header_len = 2 + len_width + id_width + 1;
            let msg_len = payload_len as u32 + header_len as u32;
            if width_for(msg_len) == len_width {
                return Ok(Self {
                    code,
                    expects_reply,
                    is_reply,
                    msg_len,
                    msg_id,
                });
            }
        }
        Err(InvalidValue)
    }

    pub fn header_len(&self) -> usize {
        2 + width_for(self.msg_len) + width_for(self.msg_id) + 1
    }

    pub fn payload_len(&self) -> usize {
        self.msg_len as usize - self.header_len()
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.expects_reply {
            flags |= FLAG_EXPECTS_REPLY;
        }
        if self.is_reply {
            flags |= FLAG_IS_REPLY;
        }
        flags |= (width_for(self.msg_len) as u8) << 4;
        flags |= (width_for(self.msg_id) as u8) << 6;
        flags
    }

    pub fn checksum(&self) -> u8 {
        (self.flags() as u32
            + self.msg_len
            + self.code.into_u8() as u32
            + PROTOCOL_VERSION as u32) as u8
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.code.into_u8());
        out.push(self.flags());
        let len_width = width_for(self.msg_len);
        out.extend_from_slice(&self.msg_len.to_be_bytes()[4 - len_width..]);
        let id_width = width_for(self.msg_id);
        out.extend_from_slice(&self.msg_id.to_be_bytes()[4 - id_width..]);
        out.push(self.checksum());
    }

    /// Incremental, defensive parse of the front of `buf`.
    pub fn parse(buf: &[u8], mtu: u32) -> ParseOutcome {
        if buf.len() < MIN_HEADER_LEN {
            return ParseOutcome::NeedBytes;
        }

        let code = match MsgCode::try_from_u8(buf[0]) {
            Some(code) => code,
            None => return ParseOutcome::Invalid,
        };
        let flags = buf[1];
        if flags & FLAG_RESERVED_MASK != 0 {
            return ParseOutcome::Invalid;
        }
        let len_width = usize::from((flags >> 4) & 0x3);
        let id_width = usize::from((flags >> 6) & 0x3);
        if len_width == 0 {
            return ParseOutcome::Invalid;
        }

        // Re-check availability against the now-known total header length
        // before touching the multi-byte fields.
        let header_len = 2 + len_width + id_width + 1;
        if buf.len() < header_len {
            return ParseOutcome::NeedHeaderBytes;
        }

        let msg_len = be_field(&buf[2..2 + len_width]);
        let msg_id = be_field(&buf[2 + len_width..2 + len_width + id_width]);

        // The checksum is computed over the wire's own flags byte, so it is
        // checked before any judgment about what the flags should have been.
        let expected =
            (flags as u32 + msg_len + code.into_u8() as u32 + PROTOCOL_VERSION as u32) as u8;
        if buf[header_len - 1] != expected {
            return ParseOutcome::BadChecksum;
        }

        // Canonical widths only: what the values require is what the flags
        // must declare.
        if width_for(msg_len) != len_width || width_for(msg_id) != id_width {
            return ParseOutcome::Invalid;
        }
        if (msg_len as usize) < header_len {
            return ParseOutcome::Invalid;
        }
        if msg_len > mtu {
            return ParseOutcome::TooBig;
        }

        ParseOutcome::Header(Self {
            code,
            expects_reply: flags & FLAG_EXPECTS_REPLY != 0,
            is_reply: flags & FLAG_IS_REPLY != 0,
            msg_len,
            msg_id,
        })
    }
}

fn be_field(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}

/// Offset of the first occurrence of the sync pattern, at any byte offset.
/// The found offset is the peer's frame alignment.
pub fn contains_sync_pattern(buf: &[u8]) -> Option<usize> {
    buf.windows(SYNC_PATTERN.len())
        .position(|window| window == SYNC_PATTERN)
}

/// Strips the maximal run of whole sync frames from the front of `buf`,
/// stepping one quartet at a time, and returns the byte count removed.
/// Stops at the first quartet that is not the pattern, leaving genuine
/// payload data untouched.
pub fn cull_sync_data(buf: &mut Vec<u8>) -> usize {
    let mut culled = 0;
    while buf[culled..].len() >= SYNC_PATTERN.len()
        && buf[culled..culled + SYNC_PATTERN.len()] == SYNC_PATTERN
    {
        culled += SYNC_PATTERN.len();
    }
    if culled > 0 {
        buf.drain(..culled);
    }
    culled
}

/// A framed message: a parsed or built header plus its accumulating payload
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    header: MsgHeader,
    payload: Vec<u8>,
}

impl Message {
    /// Builds an outbound message around a finished payload.
    pub fn outbound(
        code: MsgCode,
        payload: Vec<u8>,
        msg_id: u32,
        expects_reply: bool,
        is_reply: bool,
    ) -> Result<Self, InvalidValue> {
        let header = MsgHeader::for_payload(code, payload.len(), msg_id, expects_reply, is_reply)?;
        Ok(Self { header, payload })
    }

    /// Starts an inbound message from a freshly parsed header.
    pub fn inbound(header: MsgHeader) -> Self {
        let payload = Vec::with_capacity(header.payload_len());
        Self { header, payload }
    }

    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    pub fn code(&self) -> MsgCode {
        self.header.code
    }

    pub fn id(&self) -> u32 {
        self.header.msg_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the payload. One-shot: subsequent calls see an empty slice.
    pub fn take_payload(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.payload)
    }

    pub fn is_complete(&self) -> bool {
        self.payload.len() >= self.header.payload_len()
    }

    /// Feeds inbound bytes, taking only what the declared payload length
    /// still owes. The remainder belongs to the next message's header and
    /// stays with the caller.
    pub fn accumulate(&mut self, chunk: &[u8]) -> usize {
        let owed = self.header.payload_len() - self.payload.len();
        let take = owed.min(chunk.len());
        self.payload.extend_from_slice(&chunk[..take]);
        take
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        self.header.serialize(out);
        out.extend_from_slice(&self.payload);
    }
}
