//! Extron video switchers speaking SIS over RS-232.
//!
//! Replies are short ASCII tokens such as `Chn3`, `Vol45`, `Amt1` or the
//! combined status line `Vid3 Aud3 Clp0`, terminated by `\r\n`.

use crate::error::LinkError;
use crate::matcher::{ErrorText, Matcher, Message};
use crate::protocol::{Framing, Protocol, ProtocolBuilder};
use crate::value::{Value, VarType};

pub const DRIVER: &str = "extron_video_switcher";
pub const INPUT_COUNT: u8 = 6;
const POLL_FREQUENCY: f64 = 0.5;

fn inputs() -> Vec<String> {
    (1..=INPUT_COUNT).map(|i| i.to_string()).collect()
}

/// The decimal number directly following `tag` in `line`, e.g. `Vol` in `Vol45`.
fn number_after(line: &str, tag: &str) -> Option<i64> {
    let start = line.find(tag)? + tag.len();
    let digits: String = line[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

fn line_of(message: &Message) -> Result<&str, LinkError> {
    match message {
        Message::Line(line) => Ok(line.trim()),
        Message::Frame(_) => Err(LinkError::Protocol("SIS reply must be text".into())),
    }
}

fn field(line: &str, tag: &str) -> Result<i64, LinkError> {
    number_after(line, tag)
        .ok_or_else(|| LinkError::Protocol(format!("no {tag} value in {line:?}")))
}

/// Text for an SIS `Enn` error reply.
fn error_text(code: &str) -> String {
    let reason = match code {
        "E01" => "Invalid input channel number",
        "E10" => "Invalid command",
        "E11" => "Invalid preset number",
        "E12" => "Invalid output number",
        "E13" => "Invalid value",
        "E14" => "Invalid for this configuration",
        "E22" => "Busy",
        _ => "Unknown error",
    };
    format!("switcher reported {code}: {reason}")
}

pub fn protocol() -> Result<Protocol, LinkError> {
    ProtocolBuilder::new(DRIVER, Framing::Text)
        .managed_var("input", VarType::Option(inputs()), "channel", |input| {
            Ok(format!("{input}!\r\n").into_bytes())
        })?
        .managed_var("volume", VarType::Percentage, "volume", |volume| {
            // device levels are whole percent; truncate like the front panel does
            let level = volume.as_f64().map_or(0, |v| (v * 100.0) as i64);
            Ok(format!("{level}V\r\n").into_bytes())
        })?
        .managed_var("mute", VarType::Boolean, "mute", |on| {
            let cmd: &[u8] = if on.as_bool() == Some(true) {
                b"1Z\r\n"
            } else {
                b"0Z\r\n"
            };
            Ok(cmd.to_vec())
        })?
        .read_only_var("model", VarType::String)
        .read_only_var("firmware_version", VarType::String)
        .read_only_var("part_number", VarType::String)
        .read_only_var("clipping", VarType::Boolean)
        .error(
            "error",
            Matcher::regex(r"^E\d\d$")?,
            ErrorText::computed(|m| match m {
                Message::Line(code) => error_text(code.trim()),
                Message::Frame(_) => error_text(""),
            }),
        )
        .on_response("channel", Matcher::regex(r"Chn\d")?, |m, state| {
            let channel = field(line_of(m)?, "Chn")?;
            state.update("input", channel.to_string())?;
            Ok(Value::Integer(channel))
        })
        .on_response("volume", Matcher::regex(r"Vol\d+")?, |m, state| {
            let level = field(line_of(m)?, "Vol")?;
            let volume = (level as f64 / 100.0).clamp(0.0, 1.0);
            state.update("volume", volume)?;
            Ok(Value::Number(volume))
        })
        .on_response("mute", Matcher::regex(r"Amt\d+")?, |m, state| {
            let on = field(line_of(m)?, "Amt")? == 1;
            state.update("mute", on)?;
            Ok(Value::Bool(on))
        })
        .on_response(
            "status",
            Matcher::regex(r"Vid\d+ Aud\d+ Clp\d")?,
            |m, state| {
                let line = line_of(m)?;
                let input = field(line, "Vid")?;
                // Vid0 means no input is tied; keep the last known one
                if input > 0 {
                    state.update("input", input.to_string())?;
                }
                state.update("clipping", field(line, "Clp")? == 1)?;
                Ok(Value::Null)
            },
        )
        .poll("input", b"I\r\n".to_vec(), POLL_FREQUENCY)?
        .poll("volume", b"V\r\n".to_vec(), POLL_FREQUENCY)?
        .poll("mute", b"Z\r\n".to_vec(), POLL_FREQUENCY)?
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Resolution;

    fn run(p: &Protocol, line: &str, state: &mut crate::state::DeviceStateModel) -> Resolution {
        let msg = Message::Line(line.to_string());
        p.matcher().find(&msg).expect("a rule matches").evaluate(&msg, state)
    }

    #[test]
    fn number_after_reads_digits() {
        assert_eq!(number_after("Vol45", "Vol"), Some(45));
        assert_eq!(number_after("Vid3 Aud3 Clp1", "Clp"), Some(1));
        assert_eq!(number_after("Vol", "Vol"), None);
        assert_eq!(number_after("Amt1", "Vol"), None);
    }

    #[test]
    fn setters_render_sis_commands() {
        let p = protocol().expect("protocol");
        let payload = |key: &str, v: Value| p.command(key).expect("cmd").build_payload(&[v]);
        assert_eq!(payload("set_input", "4".into()).expect("input"), b"4!\r\n");
        assert_eq!(payload("set_volume", 0.35.into()).expect("volume"), b"35V\r\n");
        assert_eq!(payload("set_mute", true.into()).expect("mute"), b"1Z\r\n");
        assert_eq!(payload("set_mute", false.into()).expect("mute"), b"0Z\r\n");
        assert!(payload("set_input", "9".into()).is_err());
        assert!(payload("set_volume", 1.5.into()).is_err());
    }

    #[test]
    fn replies_update_state() {
        let p = protocol().expect("protocol");
        let mut state = p.new_state().expect("state");

        assert!(matches!(run(&p, "Chn5", &mut state), Resolution::Resolve(Value::Integer(5))));
        assert_eq!(state.get("input"), Some(&Value::from("5")));

        run(&p, "Vol30", &mut state);
        assert_eq!(state.get("volume"), Some(&Value::Number(0.3)));

        run(&p, "Amt1", &mut state);
        assert_eq!(state.get("mute"), Some(&Value::Bool(true)));

        run(&p, "Vid2 Aud2 Clp1", &mut state);
        assert_eq!(state.get("input"), Some(&Value::from("2")));
        assert_eq!(state.get("clipping"), Some(&Value::Bool(true)));

        run(&p, "Vid0 Aud0 Clp0", &mut state);
        assert_eq!(state.get("input"), Some(&Value::from("2")), "Vid0 keeps input");
    }

    #[test]
    fn error_reply_rejects() {
        let p = protocol().expect("protocol");
        let mut state = p.new_state().expect("state");
        match run(&p, "E13", &mut state) {
            Resolution::Reject(LinkError::Nack(text)) => assert!(text.contains("Invalid value")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn polls_share_one_rate() {
        let s = protocol().expect("protocol").scheduler().expect("scheduler");
        assert_eq!(s.cycle_keys(), vec!["input", "volume", "mute"]);
    }

    #[test]
    fn clipping_is_read_only() {
        let p = protocol().expect("protocol");
        let state = p.new_state().expect("state");
        assert!(!state.variable("clipping").expect("declared").editable);
        assert!(p.command("set_clipping").is_err());
    }
}
