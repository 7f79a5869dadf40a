//! NEC projectors on the binary control protocol.
//!
//! Every request is a [`Frame`]; the projector answers with the same id2 and
//! id1 tagged `0x2_` (ack) or `0xA_` (nack). Replies are correlated by id2
//! alone, so no two registered requests may share an id2 unless their
//! replies are interchangeable.

use crate::error::LinkError;
use crate::frame::Frame;
use crate::matcher::{Matcher, Message};
use crate::protocol::{Framing, Protocol, ProtocolBuilder};
use crate::value::{Value, VarType};

pub const DRIVER: &str = "nec_projector";

/// Full-scale value of the projector's volume register.
pub const MAX_VOLUME: f64 = 63.0;

const INPUTS: [(&str, u8); 4] = [("RGB1", 1), ("RGB2", 2), ("VIDEO", 6), ("SVIDEO", 11)];

/// `(series byte, model byte 69, model byte 70)` of the common data reply.
const MODEL_MAP: &[((u8, u8, u8), &str)] = &[
    ((1, 0, 1), "MT1060/MT1065"),
    ((1, 0, 6), "NP1000/NP2000"),
    ((1, 1, 3), "MT860"),
    ((1, 2, 3), "MT1075"),
    ((2, 0, 3), "LT240/LT260"),
    ((2, 0, 5), "LT245/LT265"),
    ((2, 0, 6), "LT380"),
    ((2, 1, 3), "LT220"),
    ((2, 1, 6), "LT280"),
    ((2, 2, 3), "LT240K/LT260K"),
    ((3, 0, 4), "VT770"),
    ((3, 0, 6), "VT80"),
    ((3, 0, 7), "VT90"),
    ((4, 0, 1), "GT1150"),
    ((4, 0, 3), "GT5000"),
    ((4, 1, 1), "GT2150"),
    ((4, 1, 3), "GT6000"),
    ((5, 0, 3), "HT1000"),
    ((5, 0, 4), "HT1100"),
    ((6, 0, 3), "WT600"),
    ((6, 0, 5), "WT610/WT615"),
    ((8, 0, 7), "NP4000/NP4001"),
    ((10, 0, 8), "VT700"),
    ((10, 0, 9), "NP600"),
    ((10, 1, 9), "NP500"),
    ((10, 2, 9), "NP500"),
    ((10, 3, 9), "NP400"),
    ((10, 4, 9), "NP300"),
    ((11, 0, 0), "NP41/61"),
    ((11, 1, 0), "NP62"),
    ((12, 0, 8), "NP1150/NP2150/NP3150"),
    ((12, 0, 9), "NP905"),
    ((12, 1, 8), "NP3151W"),
    ((12, 1, 9), "NP901W"),
    ((12, 2, 9), "VT800"),
];

/// Error status bits, by data byte then bit. Empty entries are reserved.
const ERROR_STATUS: [&[&str]; 4] = [
    &[
        "Lamp cover error",
        "Temperature error",
        "",
        "",
        "Fan error",
        "Power error",
        "Lamp error",
        "Lamp has reached its end of life",
    ],
    &["Lamp has been used beyond its limit", "Formatter error", "Lamp2 error"],
    &[
        "",
        "FPGA error",
        "Temperature error",
        "Lamp housing error",
        "Lamp data error",
        "Mirror cover error",
        "Lamp2 has reached its end of life",
        "Lamp2 has been used beyond its limit",
    ],
    &[
        "Lamp2 housing error",
        "Lamp2 data error",
        "High temperature due to dust pile-up",
        "A foreign object sensor error",
        "Pump error",
    ],
];

/// Id2 values of the set commands, each answered by a bare ack.
const COMMAND_ACKS: [u8; 7] = [0x00, 0x01, 0x03, 0x10, 0x11, 0x12, 0x13];

fn request(id1: u8, id2: u8, data: &[u8]) -> Result<Vec<u8>, LinkError> {
    Ok(Frame::new(id1, id2).try_with_data(data)?.encode())
}

fn data_of(message: &Message) -> Result<&[u8], LinkError> {
    match message {
        Message::Frame(frame) => Ok(frame.data()),
        Message::Line(_) => Err(LinkError::Protocol("projector reply must be a frame".into())),
    }
}

fn byte(data: &[u8], i: usize) -> Result<u8, LinkError> {
    data.get(i)
        .copied()
        .ok_or_else(|| LinkError::Protocol(format!("reply too short: no data byte {i}")))
}

/// Little-endian seconds counter at `at`, in whole hours.
fn hours_at(data: &[u8], at: usize) -> Result<i64, LinkError> {
    let bytes: [u8; 4] = data
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| LinkError::Protocol(format!("reply too short: no counter at {at}")))?;
    Ok((f64::from(u32::from_le_bytes(bytes)) / 3600.0).round() as i64)
}

fn input_name(pair: (u8, u8)) -> Option<&'static str> {
    match pair {
        (1, 1) => Some("RGB1"),
        (2, 1) => Some("RGB2"),
        (1, 2) => Some("VIDEO"),
        (1, 3) => Some("SVIDEO"),
        _ => None,
    }
}

fn input_code(name: &str) -> Option<u8> {
    INPUTS.iter().find(|(n, _)| *n == name).map(|(_, c)| *c)
}

/// Names of the error bits set in an error status reply.
#[must_use]
pub fn decode_errors(data: &[u8]) -> Vec<&'static str> {
    let mut out = Vec::new();
    for (row, bits) in data.iter().zip(ERROR_STATUS.iter()) {
        for (bit, name) in bits.iter().enumerate() {
            if row & (1u8 << bit) != 0 && !name.is_empty() {
                out.push(*name);
            }
        }
    }
    out
}

fn flag(v: &Value) -> bool {
    v.as_bool() == Some(true)
}

pub fn protocol() -> Result<Protocol, LinkError> {
    let mut builder = ProtocolBuilder::new(DRIVER, Framing::Binary);
    for id2 in COMMAND_ACKS {
        builder = builder.ack(Matcher::FrameId(id2));
    }

    builder
        .managed_var("power", VarType::Boolean, "ack", |on| {
            request(2, if flag(on) { 0x00 } else { 0x01 }, &[])
        })?
        .managed_var("video_mute", VarType::Boolean, "ack", |on| {
            request(2, if flag(on) { 0x10 } else { 0x11 }, &[])
        })?
        .managed_var("mute", VarType::Boolean, "ack", |on| {
            request(2, if flag(on) { 0x12 } else { 0x13 }, &[])
        })?
        .managed_var(
            "input",
            VarType::Option(INPUTS.iter().map(|(n, _)| (*n).to_string()).collect()),
            "ack",
            |source| {
                let code = source
                    .as_str()
                    .and_then(input_code)
                    .ok_or_else(|| LinkError::Protocol(format!("unknown input {source}")))?;
                request(2, 0x03, &[1, code])
            },
        )?
        .managed_var("volume", VarType::Percentage, "ack", |volume| {
            let level = volume.as_f64().map_or(0, |v| (v * MAX_VOLUME).round() as u8);
            request(3, 0x10, &[5, 0, 0, level, 0])
        })?
        .command("set_brightness", |args| {
            let level = args
                .first()
                .and_then(|v| v.as_f64())
                .filter(|b| (0.0..=100.0).contains(b))
                .ok_or_else(|| LinkError::TypeMismatch {
                    name: "brightness".into(),
                    expected: "number 0..=100".into(),
                })?;
            request(3, 0x10, &[0, 0xFF, 0, level.round() as u8, 0])
        })?
        .read_only_var("cooling", VarType::Boolean)
        .read_only_var("warming", VarType::Boolean)
        .read_only_var("model", VarType::String)
        .read_only_var("projector_name", VarType::String)
        .read_only_var("lamp_hours", VarType::Number)
        .read_only_var("filter_hours", VarType::Number)
        .read_only_var("projector_usage", VarType::Number)
        .read_only_var("percent_lamp_used", VarType::Number)
        .read_only_var("has_signal", VarType::Boolean)
        .read_only_var("picture_displaying", VarType::Boolean)
        .read_only_var("errors", VarType::String)
        .on_response("running_sense", Matcher::FrameId(0x81), |m, state| {
            let status = byte(data_of(m)?, 0)?;
            let cooling = status & 0x20 != 0;
            state.update("power", status & 0x02 != 0)?;
            state.update("cooling", cooling)?;
            // bit 7 is power processing in either direction
            state.update("warming", status & 0x80 != 0 && !cooling)?;
            Ok(Value::Null)
        })
        .on_response("mute_information", Matcher::FrameId(0x85), |m, state| {
            let data = data_of(m)?;
            state.update("video_mute", byte(data, 0)? == 1)?;
            state.update("mute", byte(data, 1)? == 1)?;
            Ok(Value::Null)
        })
        .on_response("common_data", Matcher::FrameId(0xC0), |m, state| {
            let data = data_of(m)?;
            let signal = byte(data, 84)?;
            if let Some(input) = input_name((byte(data, 6)?, byte(data, 7)?)) {
                state.update("input", input)?;
            }
            state.update("video_mute", byte(data, 28)? == 1)?;
            state.update("mute", byte(data, 29)? == 1)?;
            let key = (byte(data, 0)?, byte(data, 69)?, byte(data, 70)?);
            let model = MODEL_MAP
                .iter()
                .find(|(k, _)| *k == key)
                .map_or(Value::Null, |(_, name)| Value::from(*name));
            state.update("model", model)?;
            state.update("has_signal", signal != 1)?;
            state.update("picture_displaying", signal == 0)?;
            Ok(Value::Null)
        })
        .on_response("volume", Matcher::FrameId(0x04), |m, state| {
            let data = data_of(m)?;
            let raw = u16::from(byte(data, 7)?) | (u16::from(byte(data, 8)?) << 8);
            let volume = (f64::from(raw) / MAX_VOLUME).min(1.0);
            state.update("volume", volume)?;
            Ok(Value::Number(volume))
        })
        .on_response("lamp_information", Matcher::FrameId(0x8A), |m, state| {
            let data = data_of(m)?;
            let name_field = &data[..data.len().min(49)];
            let end = name_field.iter().position(|&b| b == 0).unwrap_or(name_field.len());
            state.update(
                "projector_name",
                String::from_utf8_lossy(&name_field[..end]).into_owned(),
            )?;
            state.update("lamp_hours", hours_at(data, 82)?)?;
            state.update("filter_hours", hours_at(data, 86)?)?;
            state.update("projector_usage", hours_at(data, 94)?)?;
            Ok(Value::Null)
        })
        .on_response("lamp_remaining", Matcher::FrameId(0x94), |m, state| {
            let remaining = byte(data_of(m)?, 4)?;
            let used = 100 - i64::from(remaining);
            state.update("percent_lamp_used", used)?;
            Ok(Value::Integer(used))
        })
        .on_response("error_status", Matcher::FrameId(0x88), |m, state| {
            let errors = decode_errors(data_of(m)?);
            let text = errors.join("; ");
            if state.update("errors", text.clone())? {
                for e in &errors {
                    tracing::error!(error = e, "projector error");
                }
            }
            Ok(Value::Text(text))
        })
        .poll_expecting("running_sense", request(0, 0x81, &[])?, 3.0, "running_sense")?
        .poll_expecting("volume_request", request(3, 0x04, &[5, 0])?, 2.0, "volume")?
        .poll_expecting("error_status_request", request(0, 0x88, &[])?, 2.0, "error_status")?
        .poll_expecting("mute_information", request(0, 0x85, &[3])?, 1.0, "mute_information")?
        .poll_expecting("common_data_request", request(0, 0xC0, &[])?, 1.0, "common_data")?
        .poll_expecting("lamp_information", request(3, 0x8A, &[])?, 0.1, "lamp_information")?
        .poll_expecting("lamp_remaining_info", request(3, 0x94, &[])?, 0.1, "lamp_remaining")?
        .build()
}
