//! Keyboard-wedge decoder.
//!
//! HID readers that emulate a keyboard "type" the tag id followed by Enter.
//! On Linux the device node (`/dev/input/eventN`) yields fixed-size
//! `input_event` records:
//!
//! ```text
//! offset  size  field
//!      0    16  struct timeval
//!     16     2  type   (EV_KEY = 1)
//!     18     2  code   (scancode)
//!     20     4  value  (1 = key down, 0 = key up, 2 = autorepeat)
//! ```
//!
//! Only key-down events are used. The scancode table is limited to the
//! characters such readers can produce, which doubles as validation.

use super::{DecodeResult, DecodedFrame, FrameDecoder};
use crate::error::DecodeError;
use crate::types::TagId;

/// Size of a Linux `input_event` on 64-bit targets
pub const INPUT_EVENT_SIZE: usize = 24;

const EV_KEY: u16 = 0x01;
const KEY_DOWN: i32 = 1;
const KEY_ENTER: u16 = 28;

/// Map a scancode to the character it types, if the reader can produce it
fn scancode_char(code: u16) -> Option<char> {
    let c = match code {
        2 => '1',
        3 => '2',
        4 => '3',
        5 => '4',
        6 => '5',
        7 => '6',
        8 => '7',
        9 => '8',
        10 => '9',
        11 => '0',
        16 => 'Q',
        17 => 'W',
        18 => 'E',
        19 => 'R',
        20 => 'T',
        21 => 'Y',
        22 => 'U',
        23 => 'I',
        24 => 'O',
        25 => 'P',
        30 => 'A',
        31 => 'S',
        32 => 'D',
        33 => 'F',
        34 => 'G',
        35 => 'H',
        36 => 'J',
        37 => 'K',
        38 => 'L',
        44 => 'Z',
        45 => 'X',
        46 => 'C',
        47 => 'V',
        48 => 'B',
        49 => 'N',
        50 => 'M',
        _ => return None,
    };
    Some(c)
}

/// Decoder for keyboard-wedge input events
#[derive(Debug)]
pub struct KeyboardWedgeDecoder {
    id_length: usize,
    /// Partial `input_event` record
    pending: Vec<u8>,
    /// Characters typed since the last Enter
    id_buffer: String,
}

impl KeyboardWedgeDecoder {
    pub fn new(id_length: usize) -> Self {
        Self {
            id_length,
            pending: Vec::with_capacity(INPUT_EVENT_SIZE),
            id_buffer: String::with_capacity(id_length),
        }
    }

    fn handle_event(&mut self, record: &[u8]) -> Option<DecodeResult> {
        let event_type = u16::from_le_bytes([record[16], record[17]]);
        let code = u16::from_le_bytes([record[18], record[19]]);
        let value = i32::from_le_bytes([record[20], record[21], record[22], record[23]]);

        if event_type != EV_KEY || value != KEY_DOWN {
            return None;
        }

        if code == KEY_ENTER {
            return Some(self.finish_id());
        }

        if let Some(c) = scancode_char(code) {
            // Cap growth when Enter never arrives; the terminator still
            // reports the id as malformed.
            if self.id_buffer.len() <= self.id_length {
                self.id_buffer.push(c);
            }
        }
        None
    }

    fn finish_id(&mut self) -> DecodeResult {
        let id = std::mem::take(&mut self.id_buffer);
        if id.len() != self.id_length {
            return Err(DecodeError::InvalidIdLength {
                expected: self.id_length,
                actual: id.len(),
                id,
            });
        }
        Ok(DecodedFrame {
            tag_id: TagId::from(id.as_str()),
            antenna: 0,
            rssi: None,
        })
    }
}

impl FrameDecoder for KeyboardWedgeDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<DecodeResult> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        if !self.pending.is_empty() {
            let needed = INPUT_EVENT_SIZE - self.pending.len();
            let take = needed.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() < INPUT_EVENT_SIZE {
                return frames;
            }
            let record = std::mem::take(&mut self.pending);
            frames.extend(self.handle_event(&record));
        }

        let mut records = rest.chunks_exact(INPUT_EVENT_SIZE);
        for record in records.by_ref() {
            frames.extend(self.handle_event(record));
        }
        self.pending.extend_from_slice(records.remainder());

        frames
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.id_buffer.clear();
    }

    fn buffered(&self) -> usize {
        self.pending.len()
    }
}
