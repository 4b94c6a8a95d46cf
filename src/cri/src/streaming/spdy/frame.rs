//! SPDY/3 frame codec.
//!
//! Frames are decoded and encoded through `tokio_util::codec` so the
//! connection can drive them with `FramedRead`/`FramedWrite`. Header blocks
//! are zlib-compressed with the SPDY dictionary; each direction keeps one
//! compression context for the life of the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::dictionary::header_dictionary;

pub const SPDY_VERSION: u16 = 3;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_UNIDIRECTIONAL: u8 = 0x02;

/// Largest payload a single frame may carry (24-bit length field).
pub const MAX_FRAME_LENGTH: usize = 0x00ff_ffff;

/// Outbound data is split into frames of at most this size.
pub const MAX_DATA_PAYLOAD: usize = 32 * 1024;

/// Bound on a decompressed header block.
const MAX_HEADER_BLOCK: usize = 1024 * 1024;

const FRAME_HEADER_LEN: usize = 8;

const TYPE_SYN_STREAM: u16 = 1;
const TYPE_SYN_REPLY: u16 = 2;
const TYPE_RST_STREAM: u16 = 3;
const TYPE_SETTINGS: u16 = 4;
const TYPE_PING: u16 = 6;
const TYPE_GOAWAY: u16 = 7;
const TYPE_HEADERS: u16 = 8;
const TYPE_WINDOW_UPDATE: u16 = 9;

/// RST_STREAM status codes.
pub mod rst {
    pub const PROTOCOL_ERROR: u32 = 1;
    pub const INVALID_STREAM: u32 = 2;
    pub const REFUSED_STREAM: u32 = 3;
    pub const CANCEL: u32 = 5;
    pub const INTERNAL_ERROR: u32 = 6;
    pub const STREAM_IN_USE: u32 = 8;
}

/// One SPDY/3 frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    SynStream {
        stream_id: u32,
        associated_id: u32,
        priority: u8,
        flags: u8,
        headers: HeaderMap,
    },
    SynReply {
        stream_id: u32,
        flags: u8,
        headers: HeaderMap,
    },
    RstStream {
        stream_id: u32,
        status: u32,
    },
    Settings {
        flags: u8,
        entries: Vec<(u8, u32, u32)>,
    },
    Ping {
        id: u32,
    },
    GoAway {
        last_good_stream_id: u32,
        status: u32,
    },
    Headers {
        stream_id: u32,
        flags: u8,
        headers: HeaderMap,
    },
    WindowUpdate {
        stream_id: u32,
        delta: u32,
    },
    Data {
        stream_id: u32,
        flags: u8,
        data: Bytes,
    },
}

impl Frame {
    /// Stream the frame belongs to; 0 for connection-level frames.
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::SynStream { stream_id, .. }
            | Frame::SynReply { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Data { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    pub fn is_fin(&self) -> bool {
        match self {
            Frame::SynStream { flags, .. }
            | Frame::SynReply { flags, .. }
            | Frame::Headers { flags, .. }
            | Frame::Data { flags, .. } => flags & FLAG_FIN != 0,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported SPDY version {0}")]
    UnsupportedVersion(u16),

    #[error("malformed {kind} frame: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("header compression error: {0}")]
    Compression(String),
}

fn malformed(kind: &'static str, reason: impl Into<String>) -> FrameError {
    FrameError::Malformed {
        kind,
        reason: reason.into(),
    }
}

/// Serialize headers into an uncompressed SPDY/3 name/value block.
///
/// Repeated values of one name are joined with NUL bytes.
fn encode_header_block(headers: &HeaderMap) -> Vec<u8> {
    let mut block = Vec::new();
    block.put_u32(headers.keys_len() as u32);
    for name in headers.keys() {
        let mut value = Vec::new();
        for (i, v) in headers.get_all(name).iter().enumerate() {
            if i > 0 {
                value.push(0);
            }
            value.extend_from_slice(v.as_bytes());
        }
        block.put_u32(name.as_str().len() as u32);
        block.extend_from_slice(name.as_str().as_bytes());
        block.put_u32(value.len() as u32);
        block.extend_from_slice(&value);
    }
    block
}

fn take_prefixed<'a>(block: &mut &'a [u8]) -> Result<&'a [u8], FrameError> {
    if block.remaining() < 4 {
        return Err(malformed("header block", "truncated length"));
    }
    let len = block.get_u32() as usize;
    if block.remaining() < len {
        return Err(malformed("header block", "truncated entry"));
    }
    let data: &'a [u8] = *block;
    let (head, tail) = data.split_at(len);
    *block = tail;
    Ok(head)
}

fn decode_header_block(mut block: &[u8]) -> Result<HeaderMap, FrameError> {
    if block.remaining() < 4 {
        return Err(malformed("header block", "missing entry count"));
    }
    let count = block.get_u32();
    let mut headers = HeaderMap::new();
    for _ in 0..count {
        let name = take_prefixed(&mut block)?;
        let value = take_prefixed(&mut block)?;
        // Pseudo headers such as ":status" are not valid HTTP names.
        let Ok(name) = HeaderName::from_bytes(name) else {
            tracing::debug!(name = %String::from_utf8_lossy(name), "skipping SPDY header");
            continue;
        };
        for part in value.split(|b| *b == 0) {
            let value = HeaderValue::from_bytes(part)
                .map_err(|e| malformed("header block", e.to_string()))?;
            headers.append(name.clone(), value);
        }
    }
    Ok(headers)
}

/// Encoder half: owns the outbound compression context.
pub struct SpdyEncoder {
    compressor: Compress,
}

impl SpdyEncoder {
    pub fn new() -> Result<Self, FrameError> {
        let mut compressor = Compress::new(Compression::default(), true);
        compressor
            .set_dictionary(header_dictionary())
            .map_err(|e| FrameError::Compression(e.to_string()))?;
        Ok(Self { compressor })
    }

    fn compress_headers(&mut self, headers: &HeaderMap) -> Result<Vec<u8>, FrameError> {
        let raw = encode_header_block(headers);
        let start = self.compressor.total_in();
        let mut out = Vec::with_capacity(raw.len() + 64);
        loop {
            let consumed = (self.compressor.total_in() - start) as usize;
            if out.capacity() - out.len() < 64 {
                out.reserve(256);
            }
            self.compressor
                .compress_vec(&raw[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| FrameError::Compression(e.to_string()))?;
            let consumed = (self.compressor.total_in() - start) as usize;
            if consumed == raw.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }
}

fn put_control_header(dst: &mut BytesMut, kind: u16, flags: u8, len: usize) {
    dst.put_u32(0x8000_0000 | (u32::from(SPDY_VERSION) << 16) | u32::from(kind));
    dst.put_u32((u32::from(flags) << 24) | (len as u32 & 0x00ff_ffff));
}

impl Encoder<Frame> for SpdyEncoder {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        match frame {
            Frame::Data {
                stream_id,
                flags,
                data,
            } => {
                if data.len() > MAX_FRAME_LENGTH {
                    return Err(FrameError::TooLarge(data.len()));
                }
                dst.reserve(FRAME_HEADER_LEN + data.len());
                dst.put_u32(stream_id & 0x7fff_ffff);
                dst.put_u32((u32::from(flags) << 24) | data.len() as u32);
                dst.extend_from_slice(&data);
            }
            Frame::SynStream {
                stream_id,
                associated_id,
                priority,
                flags,
                headers,
            } => {
                let block = self.compress_headers(&headers)?;
                put_control_header(dst, TYPE_SYN_STREAM, flags, 10 + block.len());
                dst.put_u32(stream_id & 0x7fff_ffff);
                dst.put_u32(associated_id & 0x7fff_ffff);
                dst.put_u8((priority & 0x07) << 5);
                dst.put_u8(0);
                dst.extend_from_slice(&block);
            }
            Frame::SynReply {
                stream_id,
                flags,
                headers,
            } => {
                let block = self.compress_headers(&headers)?;
                put_control_header(dst, TYPE_SYN_REPLY, flags, 4 + block.len());
                dst.put_u32(stream_id & 0x7fff_ffff);
                dst.extend_from_slice(&block);
            }
            Frame::Headers {
                stream_id,
                flags,
                headers,
            } => {
                let block = self.compress_headers(&headers)?;
                put_control_header(dst, TYPE_HEADERS, flags, 4 + block.len());
                dst.put_u32(stream_id & 0x7fff_ffff);
                dst.extend_from_slice(&block);
            }
            Frame::RstStream { stream_id, status } => {
                put_control_header(dst, TYPE_RST_STREAM, 0, 8);
                dst.put_u32(stream_id & 0x7fff_ffff);
                dst.put_u32(status);
            }
            Frame::Settings { flags, entries } => {
                put_control_header(dst, TYPE_SETTINGS, flags, 4 + 8 * entries.len());
                dst.put_u32(entries.len() as u32);
                for (entry_flags, id, value) in entries {
                    dst.put_u32((u32::from(entry_flags) << 24) | (id & 0x00ff_ffff));
                    dst.put_u32(value);
                }
            }
            Frame::Ping { id } => {
                put_control_header(dst, TYPE_PING, 0, 4);
                dst.put_u32(id);
            }
            Frame::GoAway {
                last_good_stream_id,
                status,
            } => {
                put_control_header(dst, TYPE_GOAWAY, 0, 8);
                dst.put_u32(last_good_stream_id & 0x7fff_ffff);
                dst.put_u32(status);
            }
            Frame::WindowUpdate { stream_id, delta } => {
                put_control_header(dst, TYPE_WINDOW_UPDATE, 0, 8);
                dst.put_u32(stream_id & 0x7fff_ffff);
                dst.put_u32(delta & 0x7fff_ffff);
            }
        }
        Ok(())
    }
}

/// Decoder half: owns the inbound decompression context.
pub struct SpdyDecoder {
    decompressor: Decompress,
    max_frame_length: usize,
}

impl SpdyDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_length(16 * 1024 * 1024)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            decompressor: Decompress::new(true),
            max_frame_length,
        }
    }

    fn decompress_headers(&mut self, block: &[u8]) -> Result<HeaderMap, FrameError> {
        if block.is_empty() {
            return Ok(HeaderMap::new());
        }
        let start_in = self.decompressor.total_in();
        let mut out = Vec::with_capacity(block.len() * 4 + 64);
        loop {
            let consumed = (self.decompressor.total_in() - start_in) as usize;
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(256));
            }
            let before_out = out.len();
            match self
                .decompressor
                .decompress_vec(&block[consumed..], &mut out, FlushDecompress::Sync)
            {
                Ok(_) => {}
                Err(e) if e.needs_dictionary().is_some() => {
                    self.decompressor
                        .set_dictionary(header_dictionary())
                        .map_err(|e| FrameError::Compression(e.to_string()))?;
                    continue;
                }
                Err(e) => return Err(FrameError::Compression(e.to_string())),
            }
            let now_consumed = (self.decompressor.total_in() - start_in) as usize;
            if now_consumed == block.len() && out.len() < out.capacity() {
                break;
            }
            if now_consumed == consumed && out.len() == before_out {
                return Err(FrameError::Compression("header block made no progress".into()));
            }
            if out.len() > MAX_HEADER_BLOCK {
                return Err(FrameError::TooLarge(out.len()));
            }
        }
        decode_header_block(&out)
    }

    fn decode_control(
        &mut self,
        kind: u16,
        flags: u8,
        mut payload: Bytes,
    ) -> Result<Option<Frame>, FrameError> {
        let need = |payload: &Bytes, n: usize, name: &'static str| {
            if payload.len() < n {
                Err(malformed(name, format!("payload of {} bytes", payload.len())))
            } else {
                Ok(())
            }
        };
        let frame = match kind {
            TYPE_SYN_STREAM => {
                need(&payload, 10, "SYN_STREAM")?;
                let stream_id = payload.get_u32() & 0x7fff_ffff;
                let associated_id = payload.get_u32() & 0x7fff_ffff;
                let priority = payload.get_u8() >> 5;
                let _slot = payload.get_u8();
                let headers = self.decompress_headers(&payload)?;
                Frame::SynStream {
                    stream_id,
                    associated_id,
                    priority,
                    flags,
                    headers,
                }
            }
            TYPE_SYN_REPLY => {
                need(&payload, 4, "SYN_REPLY")?;
                let stream_id = payload.get_u32() & 0x7fff_ffff;
                let headers = self.decompress_headers(&payload)?;
                Frame::SynReply {
                    stream_id,
                    flags,
                    headers,
                }
            }
            TYPE_HEADERS => {
                need(&payload, 4, "HEADERS")?;
                let stream_id = payload.get_u32() & 0x7fff_ffff;
                let headers = self.decompress_headers(&payload)?;
                Frame::Headers {
                    stream_id,
                    flags,
                    headers,
                }
            }
            TYPE_RST_STREAM => {
                need(&payload, 8, "RST_STREAM")?;
                Frame::RstStream {
                    stream_id: payload.get_u32() & 0x7fff_ffff,
                    status: payload.get_u32(),
                }
            }
            TYPE_SETTINGS => {
                need(&payload, 4, "SETTINGS")?;
                let count = payload.get_u32() as usize;
                need(&payload, count.saturating_mul(8), "SETTINGS")?;
                let entries = (0..count)
                    .map(|_| {
                        let head = payload.get_u32();
                        ((head >> 24) as u8, head & 0x00ff_ffff, payload.get_u32())
                    })
                    .collect();
                Frame::Settings { flags, entries }
            }
            TYPE_PING => {
                need(&payload, 4, "PING")?;
                Frame::Ping {
                    id: payload.get_u32(),
                }
            }
            TYPE_GOAWAY => {
                need(&payload, 4, "GOAWAY")?;
                let last_good_stream_id = payload.get_u32() & 0x7fff_ffff;
                let status = if payload.remaining() >= 4 {
                    payload.get_u32()
                } else {
                    0
                };
                Frame::GoAway {
                    last_good_stream_id,
                    status,
                }
            }
            TYPE_WINDOW_UPDATE => {
                need(&payload, 8, "WINDOW_UPDATE")?;
                Frame::WindowUpdate {
                    stream_id: payload.get_u32() & 0x7fff_ffff,
                    delta: payload.get_u32() & 0x7fff_ffff,
                }
            }
            other => {
                tracing::debug!(kind = other, "ignoring unknown SPDY control frame");
                return Ok(None);
            }
        };
        Ok(Some(frame))
    }
}

impl Default for SpdyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SpdyDecoder {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            if src.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let first = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            let flags = src[4];
            let length = u32::from_be_bytes([0, src[5], src[6], src[7]]) as usize;
            if length > self.max_frame_length {
                return Err(FrameError::TooLarge(length));
            }
            if src.len() < FRAME_HEADER_LEN + length {
                src.reserve(FRAME_HEADER_LEN + length - src.len());
                return Ok(None);
            }
            src.advance(FRAME_HEADER_LEN);
            let payload = src.split_to(length).freeze();

            if first & 0x8000_0000 == 0 {
                return Ok(Some(Frame::Data {
                    stream_id: first & 0x7fff_ffff,
                    flags,
                    data: payload,
                }));
            }

            let version = ((first >> 16) & 0x7fff) as u16;
            if version != SPDY_VERSION {
                return Err(FrameError::UnsupportedVersion(version));
            }
            if let Some(frame) = self.decode_control((first & 0xffff) as u16, flags, payload)? {
                return Ok(Some(frame));
            }
        }
    }
}
