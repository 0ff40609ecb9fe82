//! Frame decoding
//!
//! Decoders are streaming: raw bytes arrive in arbitrary chunks and each
//! call to [`FrameDecoder::feed`] returns every frame completed by that
//! chunk. Incomplete trailing bytes stay buffered until the next chunk.
//!
//! - [`LineDecoder`] - ASCII `TAG,<hex>,<antenna>,<rssi>` line protocol
//! - [`KeyboardWedgeDecoder`] - Linux input events from HID keyboard-wedge readers
//!
//! A malformed frame yields an `Err` entry and decoding continues with the
//! next frame. Unknown frame types yield nothing.

pub mod keyboard;
pub mod line;

pub use keyboard::{KeyboardWedgeDecoder, INPUT_EVENT_SIZE};
pub use line::LineDecoder;

use crate::config::{DecoderKind, ReaderConfig};
use crate::error::DecodeError;
use crate::types::TagId;

/// A decoded tag observation, before reader id and timestamp are attached
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub tag_id: TagId,
    pub antenna: u16,
    pub rssi: Option<f32>,
}

/// Result of decoding one frame
pub type DecodeResult = std::result::Result<DecodedFrame, DecodeError>;

/// Streaming decoder for a reader's byte stream
pub trait FrameDecoder: Send {
    /// Consume a chunk and return the frames it completed
    fn feed(&mut self, chunk: &[u8]) -> Vec<DecodeResult>;

    /// Discard buffered partial data (called when a new link is opened)
    fn reset(&mut self);

    /// Bytes currently buffered waiting for the rest of a frame
    fn buffered(&self) -> usize;
}

/// Build the decoder configured for a reader
pub fn decoder_for(reader: &ReaderConfig) -> Box<dyn FrameDecoder> {
    match reader.decoder {
        DecoderKind::Line => Box::new(LineDecoder::new(reader.max_line_length)),
        DecoderKind::Keyboard => Box::new(KeyboardWedgeDecoder::new(reader.keyboard.id_length)),
    }
}
