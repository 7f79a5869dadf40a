//! Binary frame codec for header + payload + additive-checksum protocols.
//!
//! Wire layout (all single bytes unless noted):
//!
//! | offset | field                                   |
//! |--------|-----------------------------------------|
//! | 0      | id1 (command / ack class)               |
//! | 1      | id2 (command subtype, dispatch key)     |
//! | 2      | device id                               |
//! | 3      | model code (high nibble), length bits 11..8 (low nibble) |
//! | 4      | length bits 7..0                        |
//! | 5..    | payload (`length` bytes)                |
//! | last   | checksum = sum of all preceding bytes mod 256 |

use crate::error::LinkError;

pub const HEADER_LEN: usize = 5;
/// Largest payload the 12-bit length field can describe.
pub const MAX_DATA_LEN: usize = 0x0FFF;

/// Additive checksum of `bytes`, mod 256.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// A candidate window is a frame iff its trailing byte is non-zero and equals
/// the checksum of everything before it.
#[must_use]
pub fn window_is_valid(window: &[u8]) -> bool {
    match window.split_last() {
        Some((&last, body)) => last != 0 && last == checksum(body),
        None => false,
    }
}

/// Payload length announced by a header starting at `offset`, or `None` when the
/// header is not yet complete.
#[must_use]
pub fn data_len_at(buf: &[u8], offset: usize) -> Option<usize> {
    if buf.len() < offset + HEADER_LEN {
        return None;
    }
    Some((usize::from(buf[offset + 3] & 0x0F) << 8) | usize::from(buf[offset + 4]))
}

/// Total on-wire length of a frame carrying `data_len` payload bytes.
#[must_use]
pub const fn frame_len(data_len: usize) -> usize {
    HEADER_LEN + data_len + 1
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id1: u8,
    pub id2: u8,
    pub device_id: u8,
    /// 4-bit model selector.
    pub model_code: u8,
    /// Set through [`Frame::try_with_data`] so it always fits the length field.
    data: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub const fn new(id1: u8, id2: u8) -> Self {
        Self {
            id1,
            id2,
            device_id: 0,
            model_code: 0,
            data: Vec::new(),
        }
    }
    #[must_use]
    pub const fn with_device_id(mut self, device_id: u8) -> Self {
        self.device_id = device_id;
        self
    }
    #[must_use]
    pub const fn with_model_code(mut self, model_code: u8) -> Self {
        self.model_code = model_code & 0x0F;
        self
    }

    /// Attach the payload, failing when it does not fit the 12-bit length field.
    pub fn try_with_data<R: AsRef<[u8]>>(mut self, data: R) -> Result<Self, LinkError> {
        let slice = data.as_ref();
        if slice.len() > MAX_DATA_LEN {
            return Err(LinkError::Protocol(format!(
                "frame payload too large: {} bytes (max {MAX_DATA_LEN})",
                slice.len()
            )));
        }
        self.data = slice.to_vec();
        Ok(self)
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Response classification: the high nibble of id1 is 0x2 for an ack.
    #[must_use]
    pub const fn is_ack(&self) -> bool {
        self.id1 >> 4 == 0x2
    }

    /// Serialize header, payload and trailing checksum.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let len = self.data.len();
        let mut out = Vec::with_capacity(frame_len(len));
        out.push(self.id1);
        out.push(self.id2);
        out.push(self.device_id);
        out.push(((self.model_code & 0x0F) << 4) | ((len >> 8) as u8 & 0x0F));
        out.push((len & 0xFF) as u8);
        out.extend_from_slice(&self.data);
        out.push(checksum(&out));
        out
    }

    /// Decode a complete window (header + payload + checksum).
    pub fn decode(window: &[u8]) -> Result<Self, LinkError> {
        let data_len = data_len_at(window, 0)
            .ok_or_else(|| LinkError::Protocol(format!("frame too short: {} bytes", window.len())))?;
        let expected = frame_len(data_len);
        if window.len() != expected {
            return Err(LinkError::Protocol(format!(
                "frame length mismatch: have {} bytes, header announces {expected}",
                window.len()
            )));
        }
        if !window_is_valid(window) {
            return Err(LinkError::Protocol("frame checksum mismatch".into()));
        }
        Ok(Self {
            id1: window[0],
            id2: window[1],
            device_id: window[2],
            model_code: window[3] >> 4,
            data: window[HEADER_LEN..HEADER_LEN + data_len].to_vec(),
        })
    }
}

/// Human readable reason for a nack frame. The first payload byte is the
/// reason code, the second a device-specific detail code.
#[must_use]
pub fn nack_message(frame: &Frame) -> String {
    let reason = match frame.data.first() {
        Some(0) => "Not supported",
        Some(1) => "Parameter error",
        Some(2) => "Operation mode error",
        Some(3) => "Gain-related error",
        Some(4) => "Logo transfer error",
        Some(_) => "Unknown error",
        None => return "The response was not acknowledged".to_string(),
    };
    match frame.data.get(1) {
        Some(detail) => format!("The response was not acknowledged: {reason}: {detail}"),
        None => format!("The response was not acknowledged: {reason}"),
    }
}
