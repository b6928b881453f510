//! Wire framing for the binary protocol.
//!
//! Two record types ride the stream, both with a 16-byte little-endian
//! header (the last four bytes are reserved padding, zero on send):
//!
//! Command:
//! ```text
//! offset size field
//! 0      2    client_id   correlation id, sender-chosen
//! 2      2    dev_idx     device index, or 0xffff
//! 4      1    op          opcode
//! 5      1    reserved    0
//! 6      2    arg_hi      opcode-specific
//! 8      4    code        signed, opcode-specific
//! 12     4    padding
//! ```
//!
//! Response:
//! ```text
//! offset size field
//! 0      2    client_id
//! 2      4    code        >= 0 payload byte count, < 0 negative errno
//! 6      4    payload_size
//! 10     2    nb_bufs     logical segment count (wire is contiguous)
//! 12     4    padding
//! ```
//!
//! The protocol is symmetric; records are told apart by the receiver's
//! table of in-flight outgoing commands (see `responder`).

/// Header size shared by both record types.
pub const HDR_SIZE: usize = 16;

/// Device index wildcard for context-level commands.
pub const DEV_ANY: u16 = 0xffff;

/// Protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Print = 1,
    Timeout = 2,

    ReadAttr = 3,
    WriteAttr = 4,
    ReadDbgAttr = 5,
    WriteDbgAttr = 6,
    ReadBufAttr = 7,
    WriteBufAttr = 8,
    ReadChnAttr = 9,
    WriteChnAttr = 10,
    GetTrig = 11,
    SetTrig = 12,

    CreateBuffer = 20,
    FreeBuffer = 21,
    EnableBuffer = 22,
    DisableBuffer = 23,

    CreateBlock = 30,
    FreeBlock = 31,
    TransferBlock = 32,
    EnqueueBlockCyclic = 33,

    CreateEvstream = 40,
    FreeEvstream = 41,
    ReadEvent = 42,
}

impl Opcode {
    /// Decode, returning `None` for unknown opcodes (the dispatcher
    /// answers those with `-EINVAL`).
    #[must_use]
    pub const fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            1 => Self::Print,
            2 => Self::Timeout,
            3 => Self::ReadAttr,
            4 => Self::WriteAttr,
            5 => Self::ReadDbgAttr,
            6 => Self::WriteDbgAttr,
            7 => Self::ReadBufAttr,
            8 => Self::WriteBufAttr,
            9 => Self::ReadChnAttr,
            10 => Self::WriteChnAttr,
            11 => Self::GetTrig,
            12 => Self::SetTrig,
            20 => Self::CreateBuffer,
            21 => Self::FreeBuffer,
            22 => Self::EnableBuffer,
            23 => Self::DisableBuffer,
            30 => Self::CreateBlock,
            31 => Self::FreeBlock,
            32 => Self::TransferBlock,
            33 => Self::EnqueueBlockCyclic,
            40 => Self::CreateEvstream,
            41 => Self::FreeEvstream,
            42 => Self::ReadEvent,
            _ => return None,
        })
    }
}

/// A decoded command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub client_id: u16,
    pub dev_idx: u16,
    pub op: u8,
    pub arg_hi: u16,
    pub code: i32,
}

impl Command {
    /// Build a command for an opcode.
    #[must_use]
    pub fn new(client_id: u16, dev_idx: u16, op: Opcode, code: i32) -> Self {
        Self {
            client_id,
            dev_idx,
            op: op as u8,
            arg_hi: 0,
            code,
        }
    }

    /// Encode to the 16-byte wire header.
    #[must_use]
    pub fn encode(&self) -> [u8; HDR_SIZE] {
        let mut out = [0u8; HDR_SIZE];
        out[0..2].copy_from_slice(&self.client_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.dev_idx.to_le_bytes());
        out[4] = self.op;
        // out[5] reserved
        out[6..8].copy_from_slice(&self.arg_hi.to_le_bytes());
        out[8..12].copy_from_slice(&self.code.to_le_bytes());
        out
    }

    /// Decode from the 16-byte wire header. Never fails structurally;
    /// unknown opcodes surface at dispatch.
    #[must_use]
    pub fn decode(raw: &[u8; HDR_SIZE]) -> Self {
        Self {
            client_id: u16::from_le_bytes([raw[0], raw[1]]),
            dev_idx: u16::from_le_bytes([raw[2], raw[3]]),
            op: raw[4],
            arg_hi: u16::from_le_bytes([raw[6], raw[7]]),
            code: i32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        }
    }

    /// The decoded opcode, if known.
    #[must_use]
    pub const fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.op)
    }

    /// Attribute index for the attr family (`code` high half).
    #[must_use]
    pub const fn attr_idx(&self) -> u16 {
        (self.code >> 16) as u16
    }

    /// Channel / buffer index for the attr family (`code` low half).
    #[must_use]
    pub const fn target_idx(&self) -> u16 {
        (self.code & 0xffff) as u16
    }

    /// Buffer index for the buffer/block family (`code` low half).
    #[must_use]
    pub const fn buf_idx(&self) -> u16 {
        (self.code & 0xffff) as u16
    }

    /// Cyclic flag of `CREATE_BUFFER` (`arg_hi` bit 0).
    #[must_use]
    pub const fn cyclic_flag(&self) -> bool {
        self.arg_hi & 1 != 0
    }
}

/// A decoded response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub client_id: u16,
    pub code: i32,
    pub payload_size: u32,
    pub nb_bufs: u16,
}

impl ResponseHeader {
    /// Encode to the 16-byte wire header.
    #[must_use]
    pub fn encode(&self) -> [u8; HDR_SIZE] {
        let mut out = [0u8; HDR_SIZE];
        out[0..2].copy_from_slice(&self.client_id.to_le_bytes());
        out[2..6].copy_from_slice(&self.code.to_le_bytes());
        out[6..10].copy_from_slice(&self.payload_size.to_le_bytes());
        out[10..12].copy_from_slice(&self.nb_bufs.to_le_bytes());
        out
    }

    /// Decode from the 16-byte wire header.
    #[must_use]
    pub fn decode(raw: &[u8; HDR_SIZE]) -> Self {
        Self {
            client_id: u16::from_le_bytes([raw[0], raw[1]]),
            code: i32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]),
            payload_size: u32::from_le_bytes([raw[6], raw[7], raw[8], raw[9]]),
            nb_bufs: u16::from_le_bytes([raw[10], raw[11]]),
        }
    }
}
