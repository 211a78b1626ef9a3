use crc32fast::Hasher as Crc32Hasher;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Magic byte marking a payload as a command frame.
pub const FRAME_MAGIC: u8 = 0x42;

/// Payload discriminator: a plain object command or a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Object,
    Transaction,
}

impl FrameKind {
    fn as_byte(self) -> u8 {
        match self {
            FrameKind::Object => 0,
            FrameKind::Transaction => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FrameKind::Object),
            1 => Some(FrameKind::Transaction),
            _ => None,
        }
    }
}

/// The canonical payload form every log entry carries: a tagged body with a
/// CRC and a SHA-256 digest validated on replay, so a corrupted payload is
/// detected before a replica diverges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub kind: FrameKind,
    pub body: Vec<u8>,
}

impl CommandFrame {
    pub fn object(body: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Object,
            body,
        }
    }

    pub fn transaction(body: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Transaction,
            body,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + 4 + self.body.len() + 4 + 32);
        bytes.push(FRAME_MAGIC);
        bytes.push(self.kind.as_byte());
        bytes.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.body);
        let mut crc = Crc32Hasher::new();
        crc.update(&self.body);
        bytes.extend_from_slice(&crc.finalize().to_le_bytes());
        let digest: [u8; 32] = Sha256::digest(&self.body).into();
        bytes.extend_from_slice(&digest);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommandFrameError> {
        if bytes.len() < 2 + 4 + 4 + 32 {
            return Err(CommandFrameError::TooShort);
        }
        if bytes[0] != FRAME_MAGIC {
            return Err(CommandFrameError::BadMagic(bytes[0]));
        }
        let kind = FrameKind::from_byte(bytes[1]).ok_or(CommandFrameError::UnknownKind(bytes[1]))?;
        let body_len = u32::from_le_bytes(
            bytes[2..6]
                .try_into()
                .map_err(|_| CommandFrameError::TooShort)?,
        ) as usize;
        let body_end = 6 + body_len;
        if body_end + 4 + 32 != bytes.len() {
            return Err(CommandFrameError::LengthMismatch);
        }
        let body = bytes[6..body_end].to_vec();
        let stored_crc = u32::from_le_bytes(
            bytes[body_end..body_end + 4]
                .try_into()
                .map_err(|_| CommandFrameError::TooShort)?,
        );
        let mut crc = Crc32Hasher::new();
        crc.update(&body);
        if crc.finalize() != stored_crc {
            return Err(CommandFrameError::CrcMismatch);
        }
        let digest: [u8; 32] = Sha256::digest(&body).into();
        if digest[..] != bytes[body_end + 4..] {
            return Err(CommandFrameError::DigestMismatch);
        }
        Ok(Self { kind, body })
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CommandFrameError {
    #[error("frame too short")]
    TooShort,
    #[error("bad frame magic {0:#x}")]
    BadMagic(u8),
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("frame length mismatch")]
    LengthMismatch,
    #[error("frame CRC mismatch")]
    CrcMismatch,
    #[error("frame digest mismatch")]
    DigestMismatch,
}
