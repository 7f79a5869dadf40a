//! Reassembly of inbound bytes into discrete messages.
//!
//! Text protocols split on a configured terminator. Binary protocols have no
//! start-of-frame marker, so frame boundaries are found by scanning every offset
//! for a window whose trailing byte is a valid additive checksum. That is a
//! heuristic: random line noise can produce a spurious checksum match and be
//! taken for a frame. The accept path discards the whole buffer, which both
//! recovers from earlier desynchronization and bounds memory in practice, at the
//! price of dropping anything that arrived after the accepted frame in the
//! same read.

use crate::error::LinkError;
use crate::frame::{data_len_at, frame_len, window_is_valid, Frame, HEADER_LEN};
use crate::matcher::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingMode {
    Text { terminator: Vec<u8> },
    Binary,
}

impl FramingMode {
    pub fn text(terminator: impl Into<Vec<u8>>) -> Result<Self, LinkError> {
        let terminator = terminator.into();
        if terminator.is_empty() {
            return Err(LinkError::Config("message terminator must not be empty".into()));
        }
        Ok(Self::Text { terminator })
    }
}

/// Output of one [`StreamAssembler::push`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Assembled {
    pub messages: Vec<Message>,
    /// A text terminator was seen: the device finished talking, so the link
    /// may be offered to the next request without waiting for the timer.
    pub saw_terminator: bool,
}

#[derive(Debug)]
pub struct StreamAssembler {
    mode: FramingMode,
    buffer: Vec<u8>,
}

impl StreamAssembler {
    #[must_use]
    pub const fn new(mode: FramingMode) -> Self {
        Self {
            mode,
            buffer: Vec::new(),
        }
    }

    #[must_use]
    pub const fn mode(&self) -> &FramingMode {
        &self.mode
    }

    /// Bytes received but not yet part of a complete message.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn push(&mut self, chunk: &[u8]) -> Assembled {
        match &self.mode {
            FramingMode::Text { terminator } => Self::push_text(&mut self.buffer, chunk, terminator),
            FramingMode::Binary => self.push_binary(chunk),
        }
    }

    fn push_text(buffer: &mut Vec<u8>, chunk: &[u8], terminator: &[u8]) -> Assembled {
        buffer.extend_from_slice(chunk);
        let mut out = Assembled::default();
        while let Some(pos) = find_subslice(buffer, terminator) {
            out.saw_terminator = true;
            let line: Vec<u8> = buffer.drain(..pos + terminator.len()).take(pos).collect();
            // blank lines carry nothing to match
            if !line.is_empty() {
                out.messages
                    .push(Message::Line(String::from_utf8_lossy(&line).into_owned()));
            }
        }
        out
    }

    fn push_binary(&mut self, chunk: &[u8]) -> Assembled {
        let mut out = Assembled::default();
        for &byte in chunk {
            self.buffer.push(byte);
            if let Some(frame) = self.scan_for_frame() {
                out.messages.push(Message::Frame(frame));
                self.buffer.clear();
                // the rest of this read is dropped along with the buffer
                break;
            }
        }
        out
    }

    fn scan_for_frame(&self) -> Option<Frame> {
        let buf = &self.buffer;
        let mut i = 0;
        while i + HEADER_LEN <= buf.len() {
            if let Some(data_len) = data_len_at(buf, i) {
                let end = i + frame_len(data_len);
                if buf.len() >= end {
                    let window = &buf[i..end];
                    if window_is_valid(window) {
                        match Frame::decode(window) {
                            Ok(frame) => return Some(frame),
                            Err(e) => log::trace!("candidate window at {i} rejected: {e}"),
                        }
                    }
                }
            }
            i += 1;
        }
        None
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
