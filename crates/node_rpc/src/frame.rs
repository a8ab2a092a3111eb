use thiserror::Error;
use tracing::debug;

use crate::rpc::{RpcRequest, RpcResponse};

// ── Header ──────────────────────────────────────────────────────────────
//
// magic(3) "Bin" | kind(1) | payload length(4, big endian) | payload
//
// Payloads are MessagePack positional arrays:
//   request  -> [method, [slot, args...]], slot = [scope, packetId, wait] | nil
//   response -> [scope, packetId, {"Ok": value} | {"Err": [code, message]}]

pub const FRAME_MAGIC: &[u8; 3] = b"Bin";
pub const HEADER_LEN: usize = 8;
pub const DEFAULT_MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0x00,
    Response = 0x01,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameKind::Request),
            0x01 => Ok(FrameKind::Response),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("bad frame header: magic {0:?}")]
    BadMagic([u8; 3]),
    #[error("unknown frame type marker 0x{0:02x}")]
    UnknownKind(u8),
    #[error("frame length {len} exceeds maximum {max}")]
    LengthOverflow { len: usize, max: usize },
    #[error("undecodable frame payload: {0}")]
    Payload(String),
    #[error("payload could not be encoded: {0}")]
    Encode(String),
    #[error("no complete frame buffered")]
    Incomplete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(RpcRequest),
    Response(RpcResponse),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Request(_) => FrameKind::Request,
            Frame::Response(_) => FrameKind::Response,
        }
    }

    /// Serialize into header + payload, ready to be written to the socket.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self {
            Frame::Request(req) => rmp_serde::to_vec(req),
            Frame::Response(resp) => rmp_serde::to_vec(resp),
        }
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;

        let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::LengthOverflow {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(FRAME_MAGIC);
        out.push(self.kind() as u8);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }
}

// ── Incremental decoder ─────────────────────────────────────────────────

/// Assembles one frame at a time from arbitrarily split reads.
///
/// Feed bytes until [`FrameDecoder::is_complete`] reports true, then take the
/// frame. A bad header is reported once as a [`ProtocolError`]; the decoder
/// then skips ahead to the next `Bin` marker on its own, so the caller simply
/// keeps feeding and the connection stays up.
#[derive(Debug)]
pub struct FrameDecoder {
    max_len: usize,
    header: [u8; HEADER_LEN],
    header_filled: usize,
    kind: Option<FrameKind>,
    expected: usize,
    payload: Vec<u8>,
    complete: bool,
    resyncing: bool,
    skipped: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len,
            header: [0; HEADER_LEN],
            header_filled: 0,
            kind: None,
            expected: 0,
            payload: Vec::new(),
            complete: false,
            resyncing: false,
            skipped: 0,
        }
    }

    /// Consume bytes from the front of `input` until the current frame is
    /// complete or `input` is exhausted. `input` is advanced past everything
    /// consumed, including on error.
    pub fn feed(&mut self, input: &mut &[u8]) -> Result<(), ProtocolError> {
        while !self.complete && !input.is_empty() {
            if self.header_filled < HEADER_LEN {
                if self.resyncing && self.header_filled == 0 {
                    let skip = input.iter().position(|&b| b == FRAME_MAGIC[0]).unwrap_or(input.len());
                    self.skipped += skip;
                    *input = &input[skip..];
                    continue;
                }
                let take = (HEADER_LEN - self.header_filled).min(input.len());
                self.header[self.header_filled..self.header_filled + take].copy_from_slice(&input[..take]);
                self.header_filled += take;
                *input = &input[take..];
                if self.header_filled < HEADER_LEN {
                    break;
                }
                if let Err(e) = self.parse_header() {
                    self.shift_to_next_marker();
                    if !std::mem::replace(&mut self.resyncing, true) {
                        return Err(e);
                    }
                    continue;
                }
                if std::mem::take(&mut self.resyncing) {
                    debug!(skipped = std::mem::take(&mut self.skipped), "frame boundary recovered");
                }
            }

            let take = (self.expected - self.payload.len()).min(input.len());
            self.payload.extend_from_slice(&input[..take]);
            *input = &input[take..];
            if self.payload.len() == self.expected {
                self.complete = true;
            }
        }
        Ok(())
    }

    fn parse_header(&mut self) -> Result<(), ProtocolError> {
        let magic = [self.header[0], self.header[1], self.header[2]];
        if &magic != FRAME_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let kind = FrameKind::try_from(self.header[3])?;
        let len = u32::from_be_bytes([self.header[4], self.header[5], self.header[6], self.header[7]]) as usize;
        if len > self.max_len {
            return Err(ProtocolError::LengthOverflow { len, max: self.max_len });
        }
        self.kind = Some(kind);
        self.expected = len;
        self.payload.reserve(len);
        Ok(())
    }

    // Drop the rejected header's first byte and keep the rest from the next
    // position that could start a marker.
    fn shift_to_next_marker(&mut self) {
        let filled = self.header_filled;
        let start = (1..filled)
            .find(|&i| {
                let rest = &self.header[i..filled];
                let n = rest.len().min(FRAME_MAGIC.len());
                rest[..n] == FRAME_MAGIC[..n]
            })
            .unwrap_or(filled);
        self.header.copy_within(start..filled, 0);
        self.header_filled = filled - start;
        self.skipped += start;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Known once the header has been read.
    pub fn frame_kind(&self) -> Option<FrameKind> {
        self.kind
    }

    /// Decode the assembled frame and reset for the next one.
    pub fn take_frame(&mut self) -> Result<Frame, ProtocolError> {
        if !self.complete {
            return Err(ProtocolError::Incomplete);
        }
        let decoded = match self.kind {
            Some(FrameKind::Request) => rmp_serde::from_slice::<RpcRequest>(&self.payload)
                .map(Frame::Request)
                .map_err(|e| ProtocolError::Payload(e.to_string())),
            Some(FrameKind::Response) => rmp_serde::from_slice::<RpcResponse>(&self.payload)
                .map(Frame::Response)
                .map_err(|e| ProtocolError::Payload(e.to_string())),
            None => Err(ProtocolError::Incomplete),
        };
        self.reset();
        decoded
    }

    pub fn reset(&mut self) {
        self.header_filled = 0;
        self.kind = None;
        self.expected = 0;
        self.payload = Vec::new();
        self.complete = false;
        self.resyncing = false;
        self.skipped = 0;
    }
}
