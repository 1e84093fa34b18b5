//! # Datagram Wire Format
//!
//! Every datagram is one frame: a 2-byte connection epoch, the frame header,
//! then zero or more self-describing messages. All integers are little-endian.
//!
//! ## Frame prefix (12 bytes)
//!
//! ```text
//!  0       2       4       6       8   9      11  12
//! +-------+-------+-------+-------+---+-------+---+
//! | epoch |  seq  | dest  |  src  | F |ackStrt|ack|
//! |  u16  |  u16  |  u16  |  u16  |u8 |  u16  |cnt|
//! +-------+-------+-------+-------+---+-------+---+
//! F bit0 = HAS_MESSAGES
//! ```
//!
//! The epoch slot keeps the frame header aligned after a 14-byte Ethernet
//! header. Each connection picks its epoch when it is created; a peer seeing
//! a new epoch knows sequence numbers have restarted.
//!
//! ## Message header (24 bytes)
//!
//! ```text
//! type:u8 next:u8 tid:u16 num_msgs:u16 msg_seq:u16 data_addr:u32
//! data_len:u16 flag_addr:u32 flag_value:u32 reserved:u16
//! ```
//!
//! `data_len` payload bytes follow each message header, padded with zeros to
//! the next 8-byte boundary.

use bytes::{Buf, BufMut, Bytes, BytesMut};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Epoch bytes preceding the frame header.
pub const FRAME_EPOCH_LEN: usize = 2;

/// Encoded frame header size, excluding the epoch.
pub const FRAME_HEADER_LEN: usize = 10;

/// Bytes before the first message: epoch + frame header.
pub const FRAME_PREFIX_LEN: usize = FRAME_EPOCH_LEN + FRAME_HEADER_LEN;

/// Encoded message header size.
pub const MSG_HEADER_LEN: usize = 24;

/// Frame flag: one or more messages follow the header.
pub const FLAG_HAS_MESSAGES: u8 = 0x01;

/// Longest ACK run one frame header can carry.
pub const MAX_ACK_RUN: usize = u8::MAX as usize;

/// Round `len` up to the next multiple of 8.
#[inline]
pub fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Space one message with `data_len` payload bytes occupies in a frame.
#[inline]
pub fn encoded_message_len(data_len: usize) -> usize {
    MSG_HEADER_LEN + align8(data_len)
}

/// Largest message payload that still fits a frame of `max_payload_size`.
///
/// The extra 8 bytes leave room for payload padding.
pub fn max_message_payload(max_payload_size: usize) -> usize {
    max_payload_size
        .saturating_sub(MSG_HEADER_LEN + FRAME_PREFIX_LEN + 8)
        .min(u16::MAX as usize)
}

// ─── Message Type ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Payload copied into the destination range.
    Data = 0,
    /// Same handling as `Data`, tagged for metadata regions.
    Metadata = 1,
    /// Counts toward completion, carries nothing to copy.
    FlowControl = 2,
    /// Sender is tearing the connection down.
    Disconnect = 3,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MsgType::Data),
            1 => Some(MsgType::Metadata),
            2 => Some(MsgType::FlowControl),
            3 => Some(MsgType::Disconnect),
            _ => None,
        }
    }

    /// Whether the payload lands in destination memory.
    pub fn carries_payload(self) -> bool {
        matches!(self, MsgType::Data | MsgType::Metadata)
    }
}

// ─── Frame Header ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    /// Sender's connection incarnation.
    pub epoch: u16,
    pub frame_seq: u16,
    pub dest_id: u16,
    pub src_id: u16,
    pub flags: u8,
    pub ack_start: u16,
    pub ack_count: u8,
}

impl FrameHeader {
    pub fn has_messages(&self) -> bool {
        self.flags & FLAG_HAS_MESSAGES != 0
    }

    /// Encode the epoch and the header.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.epoch);
        buf.put_u16_le(self.frame_seq);
        buf.put_u16_le(self.dest_id);
        buf.put_u16_le(self.src_id);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.ack_start);
        buf.put_u8(self.ack_count);
    }

    /// Decode the epoch and the header.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < FRAME_PREFIX_LEN {
            return None;
        }
        Some(FrameHeader {
            epoch: buf.get_u16_le(),
            frame_seq: buf.get_u16_le(),
            dest_id: buf.get_u16_le(),
            src_id: buf.get_u16_le(),
            flags: buf.get_u8(),
            ack_start: buf.get_u16_le(),
            ack_count: buf.get_u8(),
        })
    }
}

// ─── Message Header ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub msg_type: MsgType,
    /// Another message follows this one in the same frame.
    pub next_msg: bool,
    pub transaction_id: u16,
    /// Messages in the transaction; 0 marks a lone untagged flag message.
    pub num_msgs: u16,
    pub msg_sequence: u16,
    pub data_addr: u32,
    pub data_len: u16,
    pub flag_addr: u32,
    pub flag_value: u32,
}

impl MsgHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.msg_type as u8);
        buf.put_u8(self.next_msg as u8);
        buf.put_u16_le(self.transaction_id);
        buf.put_u16_le(self.num_msgs);
        buf.put_u16_le(self.msg_sequence);
        buf.put_u32_le(self.data_addr);
        buf.put_u16_le(self.data_len);
        buf.put_u32_le(self.flag_addr);
        buf.put_u32_le(self.flag_value);
        buf.put_u16_le(0);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < MSG_HEADER_LEN {
            return None;
        }
        let msg_type = MsgType::from_u8(buf.get_u8())?;
        let next_msg = buf.get_u8() != 0;
        let header = MsgHeader {
            msg_type,
            next_msg,
            transaction_id: buf.get_u16_le(),
            num_msgs: buf.get_u16_le(),
            msg_sequence: buf.get_u16_le(),
            data_addr: buf.get_u32_le(),
            data_len: buf.get_u16_le(),
            flag_addr: buf.get_u32_le(),
            flag_value: buf.get_u32_le(),
        };
        buf.advance(2);
        Some(header)
    }
}

/// Append one message and its padded payload to a frame body.
pub fn encode_message(buf: &mut BytesMut, header: &MsgHeader, payload: &[u8]) {
    debug_assert_eq!(payload.len(), header.data_len as usize);
    header.encode(buf);
    buf.put_slice(payload);
    buf.put_bytes(0, align8(payload.len()) - payload.len());
}

/// Prefix an encoded message body with its frame header.
pub fn encode_frame(header: &FrameHeader, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_LEN + body.len());
    header.encode(&mut buf);
    buf.put_slice(body);
    buf.freeze()
}

// ─── Decoded Frame ───────────────────────────────────────────────────────────

/// One message as it arrived, payload sliced out of the datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub header: MsgHeader,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub messages: Vec<InboundMessage>,
}

impl Frame {
    /// Decode a whole datagram. Returns `None` on truncation or an unknown
    /// message type. Bytes after the last message are ignored.
    pub fn decode(mut buf: Bytes) -> Option<Self> {
        let header = FrameHeader::decode(&mut buf)?;
        let mut messages = Vec::new();
        if header.has_messages() {
            loop {
                let msg = MsgHeader::decode(&mut buf)?;
                let len = msg.data_len as usize;
                if buf.remaining() < len {
                    return None;
                }
                let payload = buf.split_to(len);
                let pad = (align8(len) - len).min(buf.remaining());
                buf.advance(pad);
                let more = msg.next_msg;
                messages.push(InboundMessage {
                    header: msg,
                    payload,
                });
                if !more {
                    break;
                }
            }
        }
        Some(Frame { header, messages })
    }
}
