//! Line protocol decoder.
//!
//! Frames are ASCII lines terminated by `\n` (an optional `\r` is stripped):
//!
//! ```text
//! TAG,E2801105200074F0B1D90933,2,-61.5
//! TAG,E2801105200074F0B1D90933
//! HB
//! ```
//!
//! `TAG` frames carry a hex tag id and optional antenna and RSSI fields.
//! Any other frame type is ignored.

use super::{DecodeResult, DecodedFrame, FrameDecoder};
use crate::error::DecodeError;
use crate::types::TagId;

const TAG_FRAME: &str = "TAG";

/// Decoder for newline-delimited text frames
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_line_length: usize,
    /// Set after an over-long line until its terminator is seen
    discarding: bool,
}

impl LineDecoder {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_line_length.min(4096)),
            max_line_length,
            discarding: false,
        }
    }

    fn decode_line(line: &[u8]) -> Option<DecodeResult> {
        let text = match std::str::from_utf8(line) {
            Ok(text) => text.trim(),
            Err(_) => return Some(Err(DecodeError::Malformed("non-UTF-8 frame".into()))),
        };
        if text.is_empty() {
            return None;
        }

        let mut fields = text.split(',').map(str::trim);
        let frame_type = fields.next().unwrap_or_default();
        if !frame_type.eq_ignore_ascii_case(TAG_FRAME) {
            tracing::trace!("Skipping frame type {:?}", frame_type);
            return None;
        }
        Some(Self::decode_tag(fields.collect()))
    }

    fn decode_tag(fields: Vec<&str>) -> DecodeResult {
        let (id, rest) = fields
            .split_first()
            .ok_or_else(|| DecodeError::Malformed("TAG frame without id".into()))?;
        if id.is_empty() {
            return Err(DecodeError::Malformed("TAG frame with empty id".into()));
        }
        if rest.len() > 2 {
            return Err(DecodeError::Malformed(format!(
                "TAG frame has {} fields, expected at most 3",
                rest.len() + 1
            )));
        }

        let tag_id = TagId::from_hex(id).map_err(|_| DecodeError::InvalidHex(id.to_string()))?;

        let antenna = match rest.first() {
            Some(value) if !value.is_empty() => {
                value.parse::<u16>().map_err(|_| DecodeError::InvalidNumber {
                    field: "antenna",
                    value: value.to_string(),
                })?
            }
            _ => 0,
        };

        let rssi = match rest.get(1) {
            Some(value) if !value.is_empty() => {
                let parsed = value.parse::<f32>().ok().filter(|v| v.is_finite());
                Some(parsed.ok_or_else(|| DecodeError::InvalidNumber {
                    field: "rssi",
                    value: value.to_string(),
                })?)
            }
            _ => None,
        };

        Ok(DecodedFrame {
            tag_id,
            antenna,
            rssi,
        })
    }
}

impl FrameDecoder for LineDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<DecodeResult> {
        let mut frames = Vec::new();

        for &byte in chunk {
            if byte == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else if let Some(frame) = Self::decode_line(&self.buffer) {
                    frames.push(frame);
                }
                self.buffer.clear();
                continue;
            }

            if self.discarding {
                continue;
            }

            if self.buffer.len() >= self.max_line_length {
                frames.push(Err(DecodeError::FrameTooLong {
                    limit: self.max_line_length,
                }));
                self.buffer.clear();
                self.discarding = true;
                continue;
            }

            self.buffer.push(byte);
        }

        frames
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
