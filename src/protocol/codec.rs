//! Protocol codec for encoding/decoding packets
//!
//! Handles framing of packets on a byte stream.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;

use super::Packet;
use crate::buffer::{varint, BufferError, DataBuf, DataRead};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// channel(4) + correlation flag(1)
const FIXED_HEADER_SIZE: usize = 5;

/// Size of an encoded correlation id
const UNIQUE_ID_SIZE: usize = 16;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Frame has {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("Malformed frame: {0}")]
    Buffer(#[from] BufferError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Encodes packets into the wire format
pub struct Encoder {
    max_frame_size: usize,
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Encode a packet into a buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = packet.content_ref().chunk();
        let payload_len = payload.len();

        let mut body_len = FIXED_HEADER_SIZE + varint::var_int_len(payload_len as u32) + payload_len;
        if packet.unique_id().is_some() {
            body_len += UNIQUE_ID_SIZE;
        }

        if body_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(body_len, self.max_frame_size));
        }

        buf.reserve(varint::var_int_len(body_len as u32) + body_len);

        // Write header
        varint::put_var_int(buf, body_len as u32);
        buf.put_i32(packet.channel());
        match packet.unique_id() {
            Some(id) => {
                let (most, least) = id.as_u64_pair();
                buf.put_u8(1);
                buf.put_u64(most);
                buf.put_u64(least);
            }
            None => buf.put_u8(0),
        }

        // Write payload
        varint::put_var_int(buf, payload_len as u32);
        buf.put_slice(payload);

        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes packets from the wire format
pub struct Decoder {
    state: DecodeState,
    max_frame_size: usize,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Length,
    Body {
        length: usize,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            state: DecodeState::Length,
            max_frame_size,
        }
    }

    /// Attempt to decode a packet from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        loop {
            match self.state {
                DecodeState::Length => {
                    let Some((length, prefix_len)) = varint::peek_var_int(&buf[..])? else {
                        return Ok(None);
                    };
                    let length = length as usize;

                    if length > self.max_frame_size {
                        return Err(CodecError::FrameTooLarge(length, self.max_frame_size));
                    }

                    buf.advance(prefix_len);
                    self.state = DecodeState::Body { length };
                }
                DecodeState::Body { length } => {
                    if buf.len() < length {
                        buf.reserve(length - buf.len());
                        return Ok(None);
                    }

                    let body = buf.split_to(length).freeze();
                    self.state = DecodeState::Length;

                    return decode_body(DataBuf::from(body)).map(Some);
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_body(mut body: DataBuf) -> Result<Packet, CodecError> {
    let channel = body.read_i32()?;
    let unique_id = if body.read_bool()? {
        Some(body.read_unique_id()?)
    } else {
        None
    };
    let content = body.read_data_buf()?;

    if body.readable_bytes() > 0 {
        return Err(CodecError::TrailingBytes(body.readable_bytes()));
    }

    Ok(Packet::with_unique_id(channel, unique_id, content))
}
