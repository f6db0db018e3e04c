//! Control messages and their wire codec.
//!
//! Layout: a 1-byte variant tag, then the fields in declaration order.
//! Strings are u16-LE length-prefixed UTF-8; `size` is u64-LE. Encoded
//! messages must fit the receiver's single-read buffer, so `encode`
//! enforces the 2048-byte cap.

use crate::MAX_MESSAGE_SIZE;

pub const STORE_FILE_TAG: u8 = 0x10;
pub const GET_FILE_TAG: u8 = 0x11;
pub const DELETE_FILE_TAG: u8 = 0x12;

/// An instruction exchanged between file-server nodes. `server_id` is
/// always the origin node's id: replicas keep blobs under the
/// originator's namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// "I will stream `size` ciphertext bytes next; store them under
    /// `(server_id, key_hash)`."
    StoreFile {
        server_id: String,
        key_hash: String,
        size: u64,
    },
    /// "If you have `(server_id, key_hash)`, stream it back."
    GetFile { server_id: String, key_hash: String },
    /// "Delete `(server_id, key_hash)` from your local disk."
    DeleteFile { server_id: String, key_hash: String },
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encoded control message exceeds {MAX_MESSAGE_SIZE} bytes")]
    TooLarge,
    #[error("string field longer than u16::MAX bytes")]
    FieldTooLong,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty control frame")]
    Empty,
    #[error("unknown control message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("control frame truncated")]
    Truncated,
    #[error("string field is not valid utf-8")]
    BadUtf8(#[from] std::string::FromUtf8Error),
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::with_capacity(128);
        match self {
            ControlMessage::StoreFile {
                server_id,
                key_hash,
                size,
            } => {
                out.push(STORE_FILE_TAG);
                put_str(&mut out, server_id)?;
                put_str(&mut out, key_hash)?;
                out.extend_from_slice(&size.to_le_bytes());
            }
            ControlMessage::GetFile {
                server_id,
                key_hash,
            } => {
                out.push(GET_FILE_TAG);
                put_str(&mut out, server_id)?;
                put_str(&mut out, key_hash)?;
            }
            ControlMessage::DeleteFile {
                server_id,
                key_hash,
            } => {
                out.push(DELETE_FILE_TAG);
                put_str(&mut out, server_id)?;
                put_str(&mut out, key_hash)?;
            }
        }
        if out.len() > MAX_MESSAGE_SIZE {
            return Err(EncodeError::TooLarge);
        }
        Ok(out)
    }

    /// Decodes one message from the front of `bytes`. Trailing bytes are
    /// ignored: a coalesced read may carry more than one frame.
    pub fn decode(bytes: &[u8]) -> Result<ControlMessage, DecodeError> {
        let (&tag, mut rest) = bytes.split_first().ok_or(DecodeError::Empty)?;
        let msg = match tag {
            STORE_FILE_TAG => {
                let server_id = take_str(&mut rest)?;
                let key_hash = take_str(&mut rest)?;
                let size = take_u64(&mut rest)?;
                ControlMessage::StoreFile {
                    server_id,
                    key_hash,
                    size,
                }
            }
            GET_FILE_TAG => ControlMessage::GetFile {
                server_id: take_str(&mut rest)?,
                key_hash: take_str(&mut rest)?,
            },
            DELETE_FILE_TAG => ControlMessage::DeleteFile {
                server_id: take_str(&mut rest)?,
                key_hash: take_str(&mut rest)?,
            },
            other => return Err(DecodeError::UnknownTag(other)),
        };
        Ok(msg)
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), EncodeError> {
    let len = u16::try_from(s.len()).map_err(|_| EncodeError::FieldTooLong)?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn take_str(rest: &mut &[u8]) -> Result<String, DecodeError> {
    if rest.len() < 2 {
        return Err(DecodeError::Truncated);
    }
    let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
    *rest = &rest[2..];
    if rest.len() < len {
        return Err(DecodeError::Truncated);
    }
    let s = String::from_utf8(rest[..len].to_vec())?;
    *rest = &rest[len..];
    Ok(s)
}

fn take_u64(rest: &mut &[u8]) -> Result<u64, DecodeError> {
    if rest.len() < 8 {
        return Err(DecodeError::Truncated);
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&rest[..8]);
    *rest = &rest[8..];
    Ok(u64::from_le_bytes(buf))
}
