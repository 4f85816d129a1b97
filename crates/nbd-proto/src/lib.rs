#![no_std]

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use core::{convert::TryFrom, fmt};

/// ASCII magic that opens every server greeting.
pub const INIT_MAGIC: [u8; 8] = *b"NBDMAGIC";
/// Second greeting magic identifying the oldstyle negotiation.
pub const CLISERV_MAGIC: u64 = 0x0000_4202_8186_1253;
/// Number of bytes in an encoded [`Hello`] greeting.
pub const HELLO_LEN: usize = 152;
/// Magic prefixing every client → server request.
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
/// Magic prefixing every server → client simple reply.
pub const REPLY_MAGIC: u32 = 0x6744_6698;
/// Number of bytes in an encoded [`Request`] header.
pub const REQUEST_LEN: usize = 28;
/// Number of bytes in an encoded [`Reply`] header.
pub const REPLY_LEN: usize = 16;
/// Granularity the oldstyle protocol addresses the remote store in.
pub const TRANSFER_BLOCK_SIZE: u32 = 512;

/// Errors surfaced while decoding protocol messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer length did not match the protocol expectation.
    InvalidLength { expected: usize, actual: usize },
    /// Greeting did not start with `NBDMAGIC`.
    InvalidMagic,
    /// Request or reply header magic did not match.
    InvalidHeaderMagic { expected: u32, actual: u32 },
    /// Request carried a command code this side does not know.
    InvalidCommand(u32),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::InvalidLength { expected, actual } => {
                write!(f, "invalid message length {actual}, expected {expected}")
            }
            ProtoError::InvalidMagic => write!(f, "greeting does not start with NBDMAGIC"),
            ProtoError::InvalidHeaderMagic { expected, actual } => {
                write!(f, "bad header magic {actual:#010x}, expected {expected:#010x}")
            }
            ProtoError::InvalidCommand(code) => write!(f, "invalid command code {code}"),
        }
    }
}

/// Result alias for protocol parsing operations.
pub type Result<T> = core::result::Result<T, ProtoError>;

bitflags! {
    /// Export flags carried in the greeting.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HelloFlags: u32 {
        const HAS_FLAGS = 1 << 0;
        const READ_ONLY = 1 << 1;
    }
}

/// Oldstyle greeting sent by the server right after the connection is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hello {
    pub cliserv_magic: u64,
    pub size_bytes: u64,
    pub flags: HelloFlags,
}

impl Hello {
    pub const fn new(size_bytes: u64, flags: HelloFlags) -> Self {
        Self {
            cliserv_magic: CLISERV_MAGIC,
            size_bytes,
            flags,
        }
    }

    /// Greeting advertising a read-only export of `size_bytes`.
    pub fn read_only(size_bytes: u64) -> Self {
        Self::new(size_bytes, HelloFlags::HAS_FLAGS | HelloFlags::READ_ONLY)
    }

    /// True when the second magic identifies an oldstyle greeting, in which case the
    /// size and flags fields are meaningful.
    pub fn is_oldstyle(&self) -> bool {
        self.cliserv_magic == CLISERV_MAGIC
    }

    /// True unless the server advertised flags with the read-only bit set.
    pub fn writable(&self) -> bool {
        !(self.flags.contains(HelloFlags::HAS_FLAGS) && self.flags.contains(HelloFlags::READ_ONLY))
    }

    pub fn encode(self) -> [u8; HELLO_LEN] {
        let mut buf = [0u8; HELLO_LEN];
        buf[0..8].copy_from_slice(&INIT_MAGIC);
        BigEndian::write_u64(&mut buf[8..16], self.cliserv_magic);
        BigEndian::write_u64(&mut buf[16..24], self.size_bytes);
        BigEndian::write_u32(&mut buf[24..28], self.flags.bits());
        buf[28..].fill(0);
        buf
    }

    /// Decode a greeting. Only the leading `NBDMAGIC` decides validity; the reserved
    /// tail is consumed but not interpreted.
    pub fn decode(bytes: &[u8; HELLO_LEN]) -> Result<Self> {
        if bytes[0..8] != INIT_MAGIC {
            return Err(ProtoError::InvalidMagic);
        }
        Ok(Self {
            cliserv_magic: BigEndian::read_u64(&bytes[8..16]),
            size_bytes: BigEndian::read_u64(&bytes[16..24]),
            flags: HelloFlags::from_bits_retain(BigEndian::read_u32(&bytes[24..28])),
        })
    }
}

impl TryFrom<&[u8]> for Hello {
    type Error = ProtoError;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() != HELLO_LEN {
            return Err(ProtoError::InvalidLength {
                expected: HELLO_LEN,
                actual: value.len(),
            });
        }
        let mut buf = [0u8; HELLO_LEN];
        buf.copy_from_slice(value);
        Self::decode(&buf)
    }
}

/// Commands a client may issue once the greeting has been read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Read = 0,
    Write = 1,
    Disconnect = 2,
}

impl TryFrom<u32> for Command {
    type Error = ProtoError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::Disconnect),
            other => Err(ProtoError::InvalidCommand(other)),
        }
    }
}

impl From<Command> for u32 {
    fn from(command: Command) -> Self {
        command as u32
    }
}

/// Client → server request header. Write payloads follow the header on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl Request {
    pub const fn new(command: Command, handle: u64, offset: u64, length: u32) -> Self {
        Self {
            command,
            handle,
            offset,
            length,
        }
    }

    pub const fn read(handle: u64, offset: u64, length: u32) -> Self {
        Self::new(Command::Read, handle, offset, length)
    }

    pub const fn disconnect(handle: u64) -> Self {
        Self::new(Command::Disconnect, handle, 0, 0)
    }

    pub fn encode(self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        BigEndian::write_u32(&mut buf[0..4], REQUEST_MAGIC);
        BigEndian::write_u32(&mut buf[4..8], u32::from(self.command));
        BigEndian::write_u64(&mut buf[8..16], self.handle);
        BigEndian::write_u64(&mut buf[16..24], self.offset);
        BigEndian::write_u32(&mut buf[24..28], self.length);
        buf
    }

    /// Handle field of a raw request, readable even when the command code is unknown.
    pub fn peek_handle(bytes: &[u8; REQUEST_LEN]) -> u64 {
        BigEndian::read_u64(&bytes[8..16])
    }

    pub fn decode(bytes: &[u8; REQUEST_LEN]) -> Result<Self> {
        let magic = BigEndian::read_u32(&bytes[0..4]);
        if magic != REQUEST_MAGIC {
            return Err(ProtoError::InvalidHeaderMagic {
                expected: REQUEST_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            command: Command::try_from(BigEndian::read_u32(&bytes[4..8]))?,
            handle: BigEndian::read_u64(&bytes[8..16]),
            offset: BigEndian::read_u64(&bytes[16..24]),
            length: BigEndian::read_u32(&bytes[24..28]),
        })
    }
}

/// Server → client simple reply header. Read payloads follow a zero-error reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reply {
    pub error: u32,
    pub handle: u64,
}

impl Reply {
    pub const fn new(error: u32, handle: u64) -> Self {
        Self { error, handle }
    }

    pub const fn ok(handle: u64) -> Self {
        Self::new(0, handle)
    }

    pub fn is_ok(&self) -> bool {
        self.error == 0
    }

    pub fn encode(self) -> [u8; REPLY_LEN] {
        let mut buf = [0u8; REPLY_LEN];
        BigEndian::write_u32(&mut buf[0..4], REPLY_MAGIC);
        BigEndian::write_u32(&mut buf[4..8], self.error);
        BigEndian::write_u64(&mut buf[8..16], self.handle);
        buf
    }

    pub fn decode(bytes: &[u8; REPLY_LEN]) -> Result<Self> {
        let magic = BigEndian::read_u32(&bytes[0..4]);
        if magic != REPLY_MAGIC {
            return Err(ProtoError::InvalidHeaderMagic {
                expected: REPLY_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            error: BigEndian::read_u32(&bytes[4..8]),
            handle: BigEndian::read_u64(&bytes[8..16]),
        })
    }
}

/// Fill `buf` with the deterministic reference pattern for a read at `offset`:
/// byte `i` is `(offset + i) mod 256`.
pub fn fill_pattern(offset: u64, buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = offset.wrapping_add(i as u64) as u8;
    }
}
